//! # Live runs on the pulser with the `experiment` module
//!
//! This module extends [`pulsecompiler_backend::Experiment`] with a connection to the pulser.
//! The extended [`Experiment`] exposes the same [`BaseExperiment`] interface; in addition, its
//! updates during a live run are written to the device through a [`DeviceDriver`].
//!
//! ## How to use
//!
//! 1. **Declaration:** create an [`Experiment`], declare functions, channels and pulses as with
//!    the compiler's `Experiment`.
//! 2. **Test run:** `start_test_run`, step through the shots with `update`, `end_test_run`. No
//!    device is needed for this part.
//! 3. **Connection:** [`Experiment::connect`] opens the TCP link and starts the device worker.
//! 4. **Live run:** `start_experiment` writes the first shot and starts the pulser,
//!    [`Experiment::run_shots`] steps through the following shots, `end_experiment` stops the
//!    pulser and restores the state after the test run.
//!
//! Failed live updates are rolled back, so after a recoverable error the device still holds the
//! last committed shot and the loop can continue.

use std::time::Duration;

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use pulsecompiler_backend::*;

use crate::device::{DeviceDriver, DriverConfig};
use crate::shots::ShotPlan;
use crate::transport::TcpTransport;

/// An extended version of [`pulsecompiler_backend::Experiment`] that commits live runs to a
/// pulser.
///
/// The `device` is `None` until [`Experiment::connect`] succeeds. Without a device, live
/// updates run the full commit cycle but write nothing.
#[pyclass]
pub struct Experiment {
    state: SequencerState,
    snapshot: Option<SequencerState>,
    device: Option<DeviceDriver>,
}

impl_exp_boilerplate!(Experiment, device);

impl Experiment {
    pub fn with_config(config: PulserConfig) -> Result<Self> {
        Ok(Self {
            state: SequencerState::new(config)?,
            snapshot: None,
            device: None,
        })
    }

    /// Replaces the device. Not allowed during a live run.
    pub fn attach(&mut self, device: DeviceDriver) -> Result<()> {
        self.state
            .require_mode("connect", &[RunMode::Preparation, RunMode::Test])?;
        if let Some(mut old) = self.device.replace(device) {
            old.close();
        }
        Ok(())
    }

    pub fn device(&self) -> Option<&DeviceDriver> {
        self.device.as_ref()
    }
}

#[pymethods]
impl Experiment {
    /// Connects to the pulser at `address` (`host:port`).
    ///
    /// `timeout` is the reply timeout in seconds. While the pulser runs, its shot counter is
    /// polled every `poll_interval` seconds; `None` disables polling.
    #[pyo3(signature = (address, timeout = 1.0, poll_interval = 1.0))]
    pub fn connect(&mut self, address: &str, timeout: f64, poll_interval: Option<f64>) -> PyResult<()> {
        if !(timeout > 0.0) {
            return Err(PyRuntimeError::new_err(format!(
                "Invalid timeout of {timeout} s"
            )));
        }
        let timeout = Duration::from_secs_f64(timeout);
        let config = DriverConfig {
            reply_timeout: timeout,
            poll_interval: poll_interval
                .filter(|interval| *interval > 0.0)
                .map(Duration::from_secs_f64),
        };
        let transport = TcpTransport::connect(address, timeout).map_err(SequencerError::from)?;
        let device = DeviceDriver::spawn(transport, config).map_err(SequencerError::from)?;
        Ok(self.attach(device)?)
    }

    /// Closes the connection. Not allowed during a live run.
    pub fn disconnect(&mut self) -> PyResult<()> {
        self.state
            .require_mode("disconnect", &[RunMode::Preparation, RunMode::Test])?;
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.device.as_ref().is_some_and(DeviceDriver::is_open)
    }

    /// Shots completed by the pulser, as of its last status reply.
    pub fn shots_completed(&self) -> u64 {
        self.device.as_ref().map_or(0, DeviceDriver::shots_completed)
    }

    /// Cancels the update in progress before its next channel write.
    pub fn request_abort(&self) {
        self.state.abort.request();
    }

    /// Steps through `shots` shots, applying the increments and the phase step before each.
    ///
    /// Returns the number of shots completed; fewer than requested if the run was aborted.
    /// Python signals (e.g. `KeyboardInterrupt`) are checked between shots.
    #[pyo3(signature = (shots, shift_positions = true, increment_lengths = false, advance_phase = false))]
    pub fn run_shots(
        &mut self,
        py: Python,
        shots: usize,
        shift_positions: bool,
        increment_lengths: bool,
        advance_phase: bool,
    ) -> PyResult<usize> {
        let plan = ShotPlan {
            shots,
            shift_positions,
            increment_lengths,
            advance_phase,
        };
        let mut interrupted = None;
        let result = crate::shots::run_shots(self, &plan, |_| match py.check_signals() {
            Ok(()) => Ok(()),
            Err(err) => {
                interrupted = Some(err);
                Err(ErrorKind::Aborted.into())
            }
        });
        if let Some(err) = interrupted {
            return Err(err);
        }
        Ok(result?.completed)
    }
}

#[pymethods]
impl Experiment {
    /// Creates an unconnected experiment from an optional JSON hardware configuration.
    #[new]
    pub fn new(config: Option<&str>) -> PyResult<Self> {
        let config = match config {
            Some(json) => PulserConfig::from_json_str(json)?,
            None => PulserConfig::default(),
        };
        Ok(Self::with_config(config)?)
    }
}
