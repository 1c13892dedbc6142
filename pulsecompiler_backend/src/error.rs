//! Error types shared by every stage of the pulse compiler.
//!
//! Every failure is described by an [`ErrorKind`]. Whether it aborts the run or only the
//! current update is decided by the [`SequencerError`] wrapper:
//!
//! - [`SequencerError::Fatal`] aborts the run. Declaration and quantization errors are always
//!   fatal, and so is every error raised during a test (dry) run.
//! - [`SequencerError::Recoverable`] is only produced by the commit engine during a live run,
//!   after the channels and pulses touched by the failed update have been rolled back to their
//!   last committed state.

use pyo3::exceptions::PyRuntimeError;
use pyo3::PyErr;

use crate::function::{CompanionKind, FunctionKind};
use crate::phase::PhaseType;
use crate::pulse::PulseId;
use crate::sequencer::RunMode;
use crate::timebase::Ticks;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    // Declaration errors
    #[error("Pulse #{0} already exists")]
    DuplicatePulse(PulseId),
    #[error("Invalid pulse number {0}, pulse numbers must be positive")]
    InvalidPulseId(PulseId),
    #[error("Pulse #{0} does not exist")]
    UnknownPulse(PulseId),
    #[error("The {attribute} of pulse #{pulse} has already been set")]
    PulseAttributeAlreadySet {
        pulse: PulseId,
        attribute: &'static str,
    },
    #[error("The {attribute} of function '{function}' has already been set")]
    FunctionAttributeAlreadySet {
        function: FunctionKind,
        attribute: &'static str,
    },
    #[error("The {0} has already been set")]
    SettingAlreadySet(&'static str),
    #[error("Negative position of {ticks} ticks for pulse #{pulse}")]
    NegativePosition { pulse: PulseId, ticks: Ticks },
    #[error("Negative length of {ticks} ticks for pulse #{pulse}")]
    NegativeLength { pulse: PulseId, ticks: Ticks },
    #[error("Pulse #{pulse} has no {attribute} set")]
    MissingAttribute {
        pulse: PulseId,
        attribute: &'static str,
    },
    #[error("Pulse #{pulse} has no {attribute} increment")]
    NoIncrement {
        pulse: PulseId,
        attribute: &'static str,
    },
    #[error("Unknown pulse function '{0}'")]
    UnknownFunction(String),
    #[error("Channel {0} does not exist")]
    UnknownChannel(usize),
    #[error("Unknown phase type '{0}'")]
    UnknownPhaseType(String),
    #[error("Phase sequence {sequence} referenced by pulse #{pulse} has not been defined")]
    UnknownPhaseSequence { pulse: PulseId, sequence: usize },
    #[error("Channel {channel} is already assigned to function '{owner}'")]
    ChannelInUse { channel: usize, owner: FunctionKind },
    #[error("Channel {channel} does not belong to function '{function}'")]
    ChannelNotOwned {
        channel: usize,
        function: FunctionKind,
    },
    #[error("Function '{function}' accepts at most {max} channel(s)")]
    TooManyChannels { function: FunctionKind, max: usize },
    #[error("No function has been set for pulse #{0}")]
    MissingFunction(PulseId),
    #[error("Function '{0}' is used but has no channels assigned")]
    MissingChannel(FunctionKind),
    #[error("Function '{0}' has more than one channel but no phase setup")]
    AmbiguousChannel(FunctionKind),
    #[error("Invalid {what} for function '{function}': {value} ticks")]
    InvalidPadding {
        function: FunctionKind,
        what: &'static str,
        value: Ticks,
    },
    #[error("Function '{function}' cannot have automatic {companion} pulses")]
    CompanionNotAllowed {
        function: FunctionKind,
        companion: CompanionKind,
    },
    #[error("Invalid negative {0}")]
    InvalidDistance(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Quantization errors
    #[error("Invalid timebase: {0}")]
    InvalidTimebase(String),
    #[error("Time of {seconds} s is not an integer multiple of the pulser timebase of {timebase} s")]
    NotATickMultiple { seconds: f64, timebase: f64 },

    // Topology errors
    #[error("Pulses #{first} and #{second} overlap")]
    PulseOverlap { first: PulseId, second: PulseId },
    #[error("Shape pulses for pulses #{first} and #{second} overlap")]
    ShapePulseOverlap { first: PulseId, second: PulseId },
    #[error("Phase type {phase} required by pulse #{pulse} has no channel in the phase setup of function '{function}'")]
    UnmappedPhaseType {
        pulse: PulseId,
        function: FunctionKind,
        phase: PhaseType,
    },
    #[error("Pulse #{pulse} is phase-cycled but function '{function}' has no phase setup")]
    MissingPhaseSetup {
        pulse: PulseId,
        function: FunctionKind,
    },
    #[error("Phase sequence {sequence} has length {found}, all phase sequences must have length {expected}")]
    PhaseCycleMismatch {
        sequence: usize,
        expected: usize,
        found: usize,
    },
    #[error("Too many pulses ({count}) on channel {channel} of function '{function}', the maximum is {max}")]
    TooManyPulses {
        function: FunctionKind,
        channel: usize,
        count: usize,
        max: usize,
    },
    #[error("Pulse sequence for function '{function}' ends at {end} ticks, past the maximum pattern length of {max} ticks")]
    SequenceTooLong {
        function: FunctionKind,
        end: Ticks,
        max: Ticks,
    },
    #[error("Pulse #{pulse} of function '{function}' would start before the start of the pulse sequence")]
    NegativeStart {
        pulse: PulseId,
        function: FunctionKind,
    },
    #[error("Distance of {distance} ticks between shape pulse for #{shape} and defense pulse #{defense} is below the minimum of {minimum} ticks")]
    ShapeDefenseDistance {
        shape: PulseId,
        defense: PulseId,
        distance: Ticks,
        minimum: Ticks,
    },
    #[error("{0} shape/defense minimum distance violation(s) were detected during the test run")]
    ShapeDefenseViolations(usize),
    #[error("Channel pattern for channel {0} could not be resolved")]
    ResolutionDiverged(usize),

    // Run control
    #[error("Invalid repeat time of {0} s")]
    InvalidRepeatTime(f64),
    #[error("Unknown trigger slope '{0}'")]
    UnknownSlope(String),
    #[error("Unknown trigger mode '{0}', expected 'internal' or 'external'")]
    UnknownTriggerMode(String),
    #[error("Trigger mode conflict: {0}")]
    TriggerModeConflict(&'static str),
    #[error("Operation '{operation}' is not allowed in {mode:?} mode")]
    WrongRunMode {
        operation: &'static str,
        mode: RunMode,
    },
    #[error("No test run has been completed, there is nothing to run")]
    NoSnapshot,
    #[error("Update aborted by user request")]
    Aborted,
    #[error("Device communication failed: {0}")]
    Device(String),
}

impl ErrorKind {
    /// Errors a live run can survive once the failed update has been rolled back.
    pub fn is_recoverable_in_live_run(&self) -> bool {
        matches!(
            self,
            ErrorKind::PulseOverlap { .. }
                | ErrorKind::ShapePulseOverlap { .. }
                | ErrorKind::TooManyPulses { .. }
                | ErrorKind::SequenceTooLong { .. }
                | ErrorKind::NegativeStart { .. }
                | ErrorKind::ResolutionDiverged(_)
                | ErrorKind::Aborted
                | ErrorKind::Device(_)
        )
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SequencerError {
    #[error("{0}")]
    Fatal(ErrorKind),
    #[error("{0} (update was rolled back)")]
    Recoverable(ErrorKind),
}

impl SequencerError {
    pub fn kind(&self) -> &ErrorKind {
        match self {
            SequencerError::Fatal(kind) | SequencerError::Recoverable(kind) => kind,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SequencerError::Fatal(_))
    }

    /// Reclassifies an error raised while updating in `mode`.
    ///
    /// During a test run every failure is fatal. During a live run the topology and device
    /// errors listed by [`ErrorKind::is_recoverable_in_live_run`] become recoverable.
    pub fn for_mode(self, mode: RunMode) -> Self {
        let kind = match self {
            SequencerError::Fatal(kind) | SequencerError::Recoverable(kind) => kind,
        };
        if mode == RunMode::Experiment && kind.is_recoverable_in_live_run() {
            SequencerError::Recoverable(kind)
        } else {
            SequencerError::Fatal(kind)
        }
    }
}

impl From<ErrorKind> for SequencerError {
    fn from(kind: ErrorKind) -> Self {
        SequencerError::Fatal(kind)
    }
}

impl From<SequencerError> for PyErr {
    fn from(error: SequencerError) -> Self {
        PyRuntimeError::new_err(error.to_string())
    }
}

pub type Result<T, E = SequencerError> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn live_run_classification() {
        let overlap = ErrorKind::PulseOverlap {
            first: 1,
            second: 2,
        };
        assert!(SequencerError::from(overlap.clone())
            .for_mode(RunMode::Test)
            .is_fatal());
        assert_eq!(
            SequencerError::from(overlap.clone()).for_mode(RunMode::Experiment),
            SequencerError::Recoverable(overlap)
        );

        let distance = ErrorKind::ShapeDefenseDistance {
            shape: 1,
            defense: 2,
            distance: 3,
            minimum: 10,
        };
        assert!(SequencerError::from(distance)
            .for_mode(RunMode::Experiment)
            .is_fatal());
    }

    #[test]
    fn messages_name_the_offending_pulse() {
        let err = SequencerError::from(ErrorKind::PulseOverlap {
            first: 3,
            second: 7,
        });
        let msg = err.to_string();
        assert!(msg.contains("#3") && msg.contains("#7"), "{msg}");
    }
}
