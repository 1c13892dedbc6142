//! The experiment module drives a pulse sequence through its run modes, and is the single place
//! by which methods are exposed to python.
//!
//! ## Overview
//!
//! At the heart of this module lies the [`Experiment`] struct, which owns one [`SequencerState`]
//! and the snapshot taken at the end of the test run. Its behavior is defined by the
//! [`BaseExperiment`] trait, which prescribes the declarations, the pulse changes of a running
//! sequence and the run lifecycle:
//!
//! 1. **Preparation**: the script declares timebase, trigger, functions, phase cycling and
//!    pulses. Every attribute can only be set once.
//! 2. **Test run**: [`start_test_run`] validates the declarations, creates the automatic shape and
//!    TWT pulses and performs a first update. The script then runs through all of its shots
//!    with every check applied but without touching the hardware. [`end_test_run`] deletes the
//!    pulses that were never used and takes the snapshot.
//! 3. **Experiment**: [`start_experiment`] restores the snapshot and writes the first shot to the
//!    device. Every later [`update`] only writes the channels that changed. [`end_experiment`]
//!    stops the device and returns to the snapshot.
//!
//! ## Navigating the Module
//!
//! - **Understand core behaviors**: dive into the [`BaseExperiment`] trait.
//! - **Integrate with python**: refer to the [`impl_exp_boilerplate`] macro and its source. The
//!   macro provides python-exposed wrappers for the methods implemented in the trait, parsing
//!   function, phase and trigger names on the way.
//! - **Talk to hardware**: implement [`ChannelWriter`] and hand it out through
//!   [`BaseExperiment::parts_`].
//!
//! [`start_test_run`]: BaseExperiment::start_test_run
//! [`end_test_run`]: BaseExperiment::end_test_run
//! [`start_experiment`]: BaseExperiment::start_experiment
//! [`update`]: BaseExperiment::update
//! [`end_experiment`]: BaseExperiment::end_experiment

use ndarray::Array2;
use numpy;
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

pub use crate::commit::{AbortFlag, ChannelWriter, CommitReport};
use crate::config::PulserConfig;
use crate::derived::generate_companions;
pub use crate::error::{ErrorKind, Result};
pub use crate::function::{CompanionKind, FunctionKind};
pub use crate::phase::{PhaseMatrix, PhaseType};
pub use crate::pulse::PulseId;
pub use crate::sequencer::{RunMode, SequencerState, TriggerMode};
pub use crate::timebase::{Ticks, TimebaseSource};
use crate::utils::WarningKey;

/// This trait defines the behavior of the [`Experiment`] struct through default trait implementations.
///
/// Trait methods are classified into the following categories:
/// 1. Global settings: [`set_timebase`], [`set_trigger_mode`], [`set_repeat_time`],
///    the minimum distances and [`keep_all_pulses`]
/// 2. Function declarations: [`assign_channel`], [`set_function_delay`],
///    [`automatic_shape_pulses`], [`automatic_twt_pulses`], [`phase_setup`]
/// 3. Pulse declarations and changes: [`declare_pulse`], [`set_position`], [`set_length`],
///    [`shift_by_increment`], [`increment_length`], [`reset_to_initial`], [`delete_pulse`]
/// 4. Run lifecycle: [`start_test_run`], [`update`], [`end_test_run`], [`start_experiment`],
///    [`end_experiment`], [`set_running`], [`send_raw_command`]
/// 5. Queries: [`channel_pattern`], [`sequence_length`], [`minimum_padding`], [`phase_matrix`]
/// 6. Internal field accessors which are not exposed to python: [`sequencer`], [`sequencer_`],
///    [`snapshot_`], [`parts_`]
///
/// Times are given in seconds and must be integer multiples of the timebase.
///
/// [`set_timebase`]: BaseExperiment::set_timebase
/// [`set_trigger_mode`]: BaseExperiment::set_trigger_mode
/// [`set_repeat_time`]: BaseExperiment::set_repeat_time
/// [`keep_all_pulses`]: BaseExperiment::keep_all_pulses
/// [`assign_channel`]: BaseExperiment::assign_channel
/// [`set_function_delay`]: BaseExperiment::set_function_delay
/// [`automatic_shape_pulses`]: BaseExperiment::automatic_shape_pulses
/// [`automatic_twt_pulses`]: BaseExperiment::automatic_twt_pulses
/// [`phase_setup`]: BaseExperiment::phase_setup
/// [`declare_pulse`]: BaseExperiment::declare_pulse
/// [`set_position`]: BaseExperiment::set_position
/// [`set_length`]: BaseExperiment::set_length
/// [`shift_by_increment`]: BaseExperiment::shift_by_increment
/// [`increment_length`]: BaseExperiment::increment_length
/// [`reset_to_initial`]: BaseExperiment::reset_to_initial
/// [`delete_pulse`]: BaseExperiment::delete_pulse
/// [`start_test_run`]: BaseExperiment::start_test_run
/// [`update`]: BaseExperiment::update
/// [`end_test_run`]: BaseExperiment::end_test_run
/// [`start_experiment`]: BaseExperiment::start_experiment
/// [`end_experiment`]: BaseExperiment::end_experiment
/// [`set_running`]: BaseExperiment::set_running
/// [`send_raw_command`]: BaseExperiment::send_raw_command
/// [`channel_pattern`]: BaseExperiment::channel_pattern
/// [`sequence_length`]: BaseExperiment::sequence_length
/// [`minimum_padding`]: BaseExperiment::minimum_padding
/// [`phase_matrix`]: BaseExperiment::phase_matrix
/// [`sequencer`]: BaseExperiment::sequencer
/// [`sequencer_`]: BaseExperiment::sequencer_
/// [`snapshot_`]: BaseExperiment::snapshot_
/// [`parts_`]: BaseExperiment::parts_
pub trait BaseExperiment {
    // FIELD methods
    fn sequencer(&self) -> &SequencerState;
    fn sequencer_(&mut self) -> &mut SequencerState;
    fn snapshot_(&mut self) -> &mut Option<SequencerState>;
    /// The sequencer together with the device it is committed to, if any.
    fn parts_(&mut self) -> (&mut SequencerState, Option<&mut dyn ChannelWriter>);

    fn run_mode(&self) -> RunMode {
        self.sequencer().mode
    }

    fn is_running(&self) -> bool {
        self.sequencer().is_running
    }

    fn needs_update(&self) -> bool {
        self.sequencer().needs_update
    }

    /// Handle to cancel the update in progress from another thread.
    fn abort_handle(&self) -> AbortFlag {
        self.sequencer().abort.clone()
    }

    // GLOBAL SETTINGS

    fn set_timebase(&mut self, seconds: f64, source: TimebaseSource) -> Result<()> {
        self.sequencer_().set_timebase(seconds, source)
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.sequencer_().set_trigger_mode(mode)
    }

    fn set_repeat_time(&mut self, seconds: f64) -> Result<()> {
        self.sequencer_().set_repeat_time(seconds)
    }

    fn set_repeat_frequency(&mut self, hz: f64) -> Result<()> {
        self.sequencer_().set_repeat_frequency(hz)
    }

    fn set_shape_to_defense_distance(&mut self, seconds: f64) -> Result<()> {
        self.sequencer_().set_shape_to_defense_distance(seconds)
    }

    fn set_defense_to_shape_distance(&mut self, seconds: f64) -> Result<()> {
        self.sequencer_().set_defense_to_shape_distance(seconds)
    }

    fn set_minimum_twt_pulse_distance(&mut self, seconds: f64) -> Result<()> {
        self.sequencer_().set_minimum_twt_pulse_distance(seconds)
    }

    /// Keeps pulses that never became active during the test run.
    fn keep_all_pulses(&mut self) {
        self.sequencer_().keep_all_pulses();
    }

    // FUNCTIONS

    fn assign_channel(&mut self, function: FunctionKind, channel: usize) -> Result<()> {
        self.sequencer_().assign_channel(function, channel)
    }

    fn set_function_delay(&mut self, function: FunctionKind, seconds: f64) -> Result<()> {
        self.sequencer_().set_function_delay(function, seconds)
    }

    /// Requests a PULSE_SHAPE pulse around every pulse of `function`.
    ///
    /// `left` and `right` are the paddings in seconds, `None` takes the configured default.
    fn automatic_shape_pulses(
        &mut self,
        function: FunctionKind,
        left: Option<f64>,
        right: Option<f64>,
    ) -> Result<()> {
        self.sequencer_().automatic_shape_pulses(function, left, right)
    }

    /// Requests a TWT pulse around every pulse of `function`, see
    /// [`BaseExperiment::automatic_shape_pulses`].
    fn automatic_twt_pulses(
        &mut self,
        function: FunctionKind,
        left: Option<f64>,
        right: Option<f64>,
    ) -> Result<()> {
        self.sequencer_().automatic_twt_pulses(function, left, right)
    }

    // PHASE CYCLING

    fn define_phase_sequence(&mut self, id: usize, phases: Vec<PhaseType>) -> Result<()> {
        self.sequencer_().define_phase_sequence(id, phases)
    }

    fn phase_setup(&mut self, function: FunctionKind, phase: PhaseType, channel: usize) -> Result<()> {
        self.sequencer_().phase_setup(function, phase, channel)
    }

    fn advance_phase(&mut self) -> Result<()> {
        self.sequencer_().advance_phase()
    }

    fn reset_phase(&mut self) -> Result<()> {
        self.sequencer_().reset_phase()
    }

    // PULSES

    fn declare_pulse(&mut self, id: PulseId) -> Result<()> {
        self.sequencer_().declare_pulse(id)
    }

    fn set_pulse_function(&mut self, id: PulseId, function: FunctionKind) -> Result<()> {
        self.sequencer_().set_pulse_function(id, function)
    }

    /// Declares the position of a pulse, or changes it once a run has started.
    fn set_position(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        self.sequencer_().set_position(id, seconds)
    }

    /// Declares the length of a pulse, or changes it once a run has started.
    fn set_length(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        self.sequencer_().set_length(id, seconds)
    }

    fn set_position_increment(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        self.sequencer_().set_position_increment(id, seconds)
    }

    fn set_length_increment(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        self.sequencer_().set_length_increment(id, seconds)
    }

    fn set_phase_cycle(&mut self, id: PulseId, sequence: usize) -> Result<()> {
        self.sequencer_().set_phase_cycle(id, sequence)
    }

    /// Shifts pulse `id`, or all pulses with a position increment if `None`.
    fn shift_by_increment(&mut self, id: Option<PulseId>) -> Result<()> {
        self.sequencer_().shift_by_increment(id)
    }

    fn increment_length(&mut self, id: Option<PulseId>) -> Result<()> {
        self.sequencer_().increment_length(id)
    }

    fn reset_to_initial(&mut self, id: Option<PulseId>) -> Result<()> {
        self.sequencer_().reset_to_initial(id)
    }

    /// Deletes a pulse and its automatic companions. Not possible during a live run.
    fn delete_pulse(&mut self, id: PulseId) -> Result<()> {
        let seq = self.sequencer_();
        seq.require_mode("delete_pulse", &[RunMode::Preparation, RunMode::Test])?;
        seq.registry.delete_pulse(id, &mut seq.warnings)
    }

    // RUN LIFECYCLE

    /// Validates the declarations and starts the dry run.
    ///
    /// Delays are normalized, default paddings and distances applied and the automatic shape and
    /// TWT pulses created before the first update.
    fn start_test_run(&mut self) -> Result<CommitReport> {
        let seq = self.sequencer_();
        seq.require_mode("start_test_run", &[RunMode::Preparation])?;
        seq.validate_declarations()?;
        seq.normalize_delays();
        seq.apply_defaults()?;
        let companions = generate_companions(&mut seq.registry)?;
        seq.mode = RunMode::Test;
        seq.warnings.clear();
        seq.shape_defense_violations = 0;
        seq.duty_cycle_warned = false;
        log::info!(
            "Starting test run with {} pulses ({} automatic)",
            seq.registry.pulses.len(),
            companions.len()
        );
        self.update()
    }

    /// Compiles the current shot and commits the channels that changed.
    ///
    /// During a live run the changed channels are written to the device; a failed update is
    /// rolled back and returned as a recoverable error where possible.
    fn update(&mut self) -> Result<CommitReport> {
        let (seq, device) = self.parts_();
        seq.commit(device)
    }

    /// Ends the dry run and takes the snapshot the experiment starts from.
    ///
    /// Fails if any shape/defense distance was violated during the test run. Unless
    /// [`BaseExperiment::keep_all_pulses`] was requested, pulses that never became active are
    /// deleted.
    fn end_test_run(&mut self) -> Result<()> {
        let seq = self.sequencer_();
        seq.require_mode("end_test_run", &[RunMode::Test])?;
        seq.warnings.summary();
        if seq.shape_defense_violations > 0 {
            return Err(ErrorKind::ShapeDefenseViolations(seq.shape_defense_violations).into());
        }

        if !seq.keep_all_pulses {
            let unused: Vec<PulseId> = seq
                .registry
                .pulses
                .values()
                .filter(|p| p.is_user() && !p.has_been_active)
                .map(|p| p.id)
                .collect();
            for id in unused {
                seq.warnings.warn(WarningKey::new("unused-pulse", id), || {
                    format!("Pulse #{id} was never active and gets deleted")
                });
                seq.registry.delete_pulse(id, &mut seq.warnings)?;
            }
        }

        seq.registry.reset_all_to_initial();
        seq.registry.mark_committed();
        for channel in seq.registry.channels.iter_mut() {
            channel.slot.reset();
        }
        seq.current_phase = 0;
        seq.committed_phase = 0;
        seq.needs_update = false;
        seq.warnings.clear();
        seq.shape_defense_violations = 0;
        seq.duty_cycle_warned = false;
        log::info!(
            "Test run finished, sequence length is {} ticks",
            seq.sequence_length()
        );

        let snapshot = seq.clone();
        *self.snapshot_() = Some(snapshot);
        Ok(())
    }

    /// Starts the live run from the snapshot of the test run and writes the first shot.
    fn start_experiment(&mut self) -> Result<CommitReport> {
        self.sequencer()
            .require_mode("start_experiment", &[RunMode::Preparation, RunMode::Test])?;
        let snapshot = self.snapshot_().clone().ok_or(ErrorKind::NoSnapshot)?;
        let seq = self.sequencer_();
        *seq = snapshot;
        seq.mode = RunMode::Experiment;
        seq.abort.clear();
        log::info!("Starting experiment");
        let report = self.update()?;
        self.set_running(true)?;
        Ok(report)
    }

    /// Stops the device and returns to the snapshot of the test run.
    fn end_experiment(&mut self) -> Result<()> {
        self.sequencer()
            .require_mode("end_experiment", &[RunMode::Experiment])?;
        let stopped = self.set_running(false);
        self.sequencer().warnings.summary();
        if let Some(snapshot) = self.snapshot_().clone() {
            *self.sequencer_() = snapshot;
        }
        log::info!("Experiment finished");
        stopped
    }

    fn set_running(&mut self, running: bool) -> Result<()> {
        let (seq, device) = self.parts_();
        if let Some(device) = device {
            device
                .set_running(running)
                .map_err(|e| ErrorKind::Device(e.to_string()))?;
        }
        seq.is_running = running;
        Ok(())
    }

    /// Sends a command to the device unchanged, bypassing every check.
    fn send_raw_command(&mut self, command: &str) -> Result<()> {
        let (_, device) = self.parts_();
        let device = device.ok_or_else(|| ErrorKind::Device("no device connected".to_string()))?;
        log::debug!("Sending raw command '{command}'");
        device
            .send_raw(command)
            .map_err(|e| ErrorKind::Device(e.to_string()).into())
    }

    // QUERIES

    /// Committed (start, length) pairs of `channel`, in ticks.
    fn channel_pattern(&self, channel: usize) -> Result<Vec<(Ticks, Ticks)>> {
        Ok(self
            .sequencer()
            .registry
            .channel(channel)?
            .slot
            .committed()
            .pairs())
    }

    /// Length of one shot in seconds.
    fn sequence_length(&self) -> f64 {
        let seq = self.sequencer();
        seq.ticks.ticks_to_time(seq.sequence_length())
    }

    /// Smallest (left, right) padding in seconds the companions of `function` had so far.
    fn minimum_padding(&self, function: FunctionKind, kind: CompanionKind) -> (f64, f64) {
        let seq = self.sequencer();
        let padding = seq.registry.function(function).min_padding(kind);
        (
            seq.ticks.ticks_to_time(padding.left),
            seq.ticks.ticks_to_time(padding.right),
        )
    }

    fn phase_matrix(&self, function: FunctionKind) -> Result<PhaseMatrix> {
        let seq = self.sequencer();
        PhaseMatrix::build(
            seq.registry.function(function),
            &seq.registry.pulses,
            &seq.phase_sequences,
            seq.cycle_len(),
        )
    }
}

/// Converts a channel pattern to an `n x 2` numpy array of (start, length) rows.
pub fn pattern_array(py: Python, pairs: &[(Ticks, Ticks)]) -> PyResult<PyObject> {
    let flat: Vec<Ticks> = pairs.iter().flat_map(|&(pos, len)| [pos, len]).collect();
    let arr = Array2::from_shape_vec((pairs.len(), 2), flat)
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
    Ok(numpy::PyArray::from_array(py, &arr).to_object(py))
}

/// A concrete struct holding one pulse sequence, without any device attached.
///
/// **Refer to the [`BaseExperiment`] trait for method behavior.**
#[pyclass]
pub struct Experiment {
    state: SequencerState,
    snapshot: Option<SequencerState>,
}

/// A macro to generate boilerplate implementations for structs representing experiments.
///
/// This macro assists in the conversion between Rust's trait system and Python's class system.
/// Given that PyO3 doesn't support exposing trait methods directly to Python, this macro wraps
/// each [`BaseExperiment`] trait method with a direct implementation, facilitating its export to Python.
///
/// The struct needs a `state: SequencerState` and a `snapshot: Option<SequencerState>` field. An
/// optional second argument names a field of type `Option<W>`, `W: ChannelWriter`, holding the
/// device that live runs write to. The items of [`crate::experiment`] must be in scope.
///
/// Function, phase, trigger and clock source names are parsed from strings; errors are raised as
/// python `RuntimeError`s.
///
/// Usage:
/// ```rust
/// use pulsecompiler_backend::experiment::*;
/// use pulsecompiler_backend::*;
/// use pyo3::prelude::*;
///
/// #[pyclass]
/// struct CustomExperiment {
///     state: SequencerState,
///     snapshot: Option<SequencerState>,
///     label: String,
/// }
/// impl_exp_boilerplate!(CustomExperiment);
///
/// // Implement additional methods which can be exposed to python
/// #[pymethods]
/// impl CustomExperiment {
///     #[new]
///     pub fn new(label: String) -> PyResult<Self> {
///         Ok(Self {
///             state: SequencerState::new(Default::default())?,
///             snapshot: None,
///             label,
///         })
///     }
/// }
/// ```
#[macro_export]
macro_rules! impl_exp_boilerplate {
    (@pymethods $exp_type: ty) => {
        #[pymethods]
        impl $exp_type {
            // GLOBAL SETTINGS
            pub fn set_timebase(&mut self, seconds: f64, source: Option<&str>) -> PyResult<()> {
                let source = match source {
                    Some(source) => source.parse()?,
                    None => TimebaseSource::Internal,
                };
                Ok(BaseExperiment::set_timebase(self, seconds, source)?)
            }

            pub fn set_trigger_mode(&mut self, mode: &str, slope: Option<&str>) -> PyResult<()> {
                let mode = TriggerMode::parse(mode, slope)?;
                Ok(BaseExperiment::set_trigger_mode(self, mode)?)
            }

            pub fn set_repeat_time(&mut self, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_repeat_time(self, seconds)?)
            }

            pub fn set_repeat_frequency(&mut self, hz: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_repeat_frequency(self, hz)?)
            }

            pub fn set_shape_to_defense_distance(&mut self, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_shape_to_defense_distance(self, seconds)?)
            }

            pub fn set_defense_to_shape_distance(&mut self, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_defense_to_shape_distance(self, seconds)?)
            }

            pub fn set_minimum_twt_pulse_distance(&mut self, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_minimum_twt_pulse_distance(self, seconds)?)
            }

            pub fn keep_all_pulses(&mut self) {
                BaseExperiment::keep_all_pulses(self)
            }

            // FUNCTIONS
            pub fn assign_channel(&mut self, function: &str, channel: usize) -> PyResult<()> {
                Ok(BaseExperiment::assign_channel(self, function.parse()?, channel)?)
            }

            pub fn set_function_delay(&mut self, function: &str, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_function_delay(self, function.parse()?, seconds)?)
            }

            pub fn automatic_shape_pulses(
                &mut self,
                function: &str,
                left: Option<f64>,
                right: Option<f64>,
            ) -> PyResult<()> {
                Ok(BaseExperiment::automatic_shape_pulses(
                    self,
                    function.parse()?,
                    left,
                    right,
                )?)
            }

            pub fn automatic_twt_pulses(
                &mut self,
                function: &str,
                left: Option<f64>,
                right: Option<f64>,
            ) -> PyResult<()> {
                Ok(BaseExperiment::automatic_twt_pulses(
                    self,
                    function.parse()?,
                    left,
                    right,
                )?)
            }

            // PHASE CYCLING
            pub fn define_phase_sequence(&mut self, id: usize, phases: Vec<&str>) -> PyResult<()> {
                let phases = phases
                    .iter()
                    .map(|p| p.parse::<PhaseType>())
                    .collect::<Result<Vec<_>>>()?;
                Ok(BaseExperiment::define_phase_sequence(self, id, phases)?)
            }

            pub fn phase_setup(&mut self, function: &str, phase: &str, channel: usize) -> PyResult<()> {
                Ok(BaseExperiment::phase_setup(
                    self,
                    function.parse()?,
                    phase.parse()?,
                    channel,
                )?)
            }

            pub fn advance_phase(&mut self) -> PyResult<()> {
                Ok(BaseExperiment::advance_phase(self)?)
            }

            pub fn reset_phase(&mut self) -> PyResult<()> {
                Ok(BaseExperiment::reset_phase(self)?)
            }

            // PULSES
            pub fn declare_pulse(&mut self, id: PulseId) -> PyResult<()> {
                Ok(BaseExperiment::declare_pulse(self, id)?)
            }

            pub fn set_pulse_function(&mut self, id: PulseId, function: &str) -> PyResult<()> {
                Ok(BaseExperiment::set_pulse_function(self, id, function.parse()?)?)
            }

            pub fn set_position(&mut self, id: PulseId, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_position(self, id, seconds)?)
            }

            pub fn set_length(&mut self, id: PulseId, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_length(self, id, seconds)?)
            }

            pub fn set_position_increment(&mut self, id: PulseId, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_position_increment(self, id, seconds)?)
            }

            pub fn set_length_increment(&mut self, id: PulseId, seconds: f64) -> PyResult<()> {
                Ok(BaseExperiment::set_length_increment(self, id, seconds)?)
            }

            pub fn set_phase_cycle(&mut self, id: PulseId, sequence: usize) -> PyResult<()> {
                Ok(BaseExperiment::set_phase_cycle(self, id, sequence)?)
            }

            pub fn shift_by_increment(&mut self, id: Option<PulseId>) -> PyResult<()> {
                Ok(BaseExperiment::shift_by_increment(self, id)?)
            }

            pub fn increment_length(&mut self, id: Option<PulseId>) -> PyResult<()> {
                Ok(BaseExperiment::increment_length(self, id)?)
            }

            pub fn reset_to_initial(&mut self, id: Option<PulseId>) -> PyResult<()> {
                Ok(BaseExperiment::reset_to_initial(self, id)?)
            }

            pub fn delete_pulse(&mut self, id: PulseId) -> PyResult<()> {
                Ok(BaseExperiment::delete_pulse(self, id)?)
            }

            // RUN LIFECYCLE
            /// Returns the channels written by the first update.
            pub fn start_test_run(&mut self) -> PyResult<Vec<usize>> {
                Ok(BaseExperiment::start_test_run(self)?.updated_channels)
            }

            /// Returns the channels that changed.
            pub fn update(&mut self) -> PyResult<Vec<usize>> {
                Ok(BaseExperiment::update(self)?.updated_channels)
            }

            pub fn end_test_run(&mut self) -> PyResult<()> {
                Ok(BaseExperiment::end_test_run(self)?)
            }

            pub fn start_experiment(&mut self) -> PyResult<Vec<usize>> {
                Ok(BaseExperiment::start_experiment(self)?.updated_channels)
            }

            pub fn end_experiment(&mut self) -> PyResult<()> {
                Ok(BaseExperiment::end_experiment(self)?)
            }

            pub fn set_running(&mut self, running: bool) -> PyResult<()> {
                Ok(BaseExperiment::set_running(self, running)?)
            }

            pub fn send_raw_command(&mut self, command: &str) -> PyResult<()> {
                Ok(BaseExperiment::send_raw_command(self, command)?)
            }

            // QUERIES
            pub fn run_mode(&self) -> String {
                format!("{:?}", BaseExperiment::run_mode(self))
            }

            pub fn is_running(&self) -> bool {
                BaseExperiment::is_running(self)
            }

            pub fn needs_update(&self) -> bool {
                BaseExperiment::needs_update(self)
            }

            pub fn channel_pattern(&self, channel: usize, py: Python) -> PyResult<PyObject> {
                let pairs = BaseExperiment::channel_pattern(self, channel)?;
                pattern_array(py, &pairs)
            }

            pub fn sequence_length(&self) -> f64 {
                BaseExperiment::sequence_length(self)
            }

            pub fn minimum_shape_padding(&self, function: &str) -> PyResult<(f64, f64)> {
                Ok(BaseExperiment::minimum_padding(
                    self,
                    function.parse()?,
                    CompanionKind::Shape,
                ))
            }

            pub fn minimum_twt_padding(&self, function: &str) -> PyResult<(f64, f64)> {
                Ok(BaseExperiment::minimum_padding(
                    self,
                    function.parse()?,
                    CompanionKind::Twt,
                ))
            }

            /// Pulse ids per phase step and channel of `function`.
            pub fn phase_matrix(&self, function: &str) -> PyResult<Vec<Vec<Vec<PulseId>>>> {
                Ok(BaseExperiment::phase_matrix(self, function.parse()?)?.to_nested())
            }
        }
    };
    ($exp_type: ty) => {
        impl BaseExperiment for $exp_type {
            fn sequencer(&self) -> &SequencerState {
                &self.state
            }
            fn sequencer_(&mut self) -> &mut SequencerState {
                &mut self.state
            }
            fn snapshot_(&mut self) -> &mut Option<SequencerState> {
                &mut self.snapshot
            }
            fn parts_(&mut self) -> (&mut SequencerState, Option<&mut dyn ChannelWriter>) {
                (&mut self.state, None)
            }
        }

        $crate::impl_exp_boilerplate!(@pymethods $exp_type);
    };
    ($exp_type: ty, $device: ident) => {
        impl BaseExperiment for $exp_type {
            fn sequencer(&self) -> &SequencerState {
                &self.state
            }
            fn sequencer_(&mut self) -> &mut SequencerState {
                &mut self.state
            }
            fn snapshot_(&mut self) -> &mut Option<SequencerState> {
                &mut self.snapshot
            }
            fn parts_(&mut self) -> (&mut SequencerState, Option<&mut dyn ChannelWriter>) {
                let device = self
                    .$device
                    .as_mut()
                    .map(|device| device as &mut dyn ChannelWriter);
                (&mut self.state, device)
            }
        }

        $crate::impl_exp_boilerplate!(@pymethods $exp_type);
    };
}

impl_exp_boilerplate!(Experiment);

impl Experiment {
    pub fn with_config(config: PulserConfig) -> Result<Self> {
        Ok(Self {
            state: SequencerState::new(config)?,
            snapshot: None,
        })
    }
}

#[pymethods]
impl Experiment {
    /// Creates an experiment from an optional JSON hardware configuration.
    #[new]
    pub fn new(config: Option<&str>) -> PyResult<Self> {
        let config = match config {
            Some(json) => PulserConfig::from_json_str(json)?,
            None => PulserConfig::default(),
        };
        Ok(Self::with_config(config)?)
    }
}
