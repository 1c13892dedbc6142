use pyo3::prelude::*;

pub mod command;
pub mod device;
pub mod error;
pub mod experiment;
pub mod shots;
pub mod transport;
pub mod utils;
pub mod worker_cmd_chan;

pub use crate::device::{DeviceDriver, DriverConfig};
pub use crate::error::DeviceError;
pub use crate::experiment::Experiment;

#[pymodule]
fn pulsectrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<Experiment>()?;
    Ok(())
}
