use pyo3::prelude::*;

pub mod channel;
pub mod commit;
pub mod config;
pub mod constraints;
pub mod derived;
pub mod error;
pub mod experiment;
pub mod function;
pub mod phase;
pub mod pulse;
pub mod registry;
pub mod resolver;
pub mod sequencer;
pub mod timebase;
pub mod utils;

pub use config::PulserConfig;
pub use error::SequencerError;
pub use experiment::*;

#[pymodule]
fn pulsecompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<Experiment>()?;
    Ok(())
}
