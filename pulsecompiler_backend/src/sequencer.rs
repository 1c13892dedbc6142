//! The state of one pulse sequence and its declarations.
//!
//! A [`SequencerState`] owns everything that describes the sequence: timebase, trigger settings,
//! minimum distances, the [`PulseRegistry`] and the phase sequences. It is passed explicitly to
//! every operation; there is no global instance. Declarations are only accepted in
//! [`RunMode::Preparation`], pulse changes only once a run has started.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::commit::{AbortFlag, CommitPhase};
use crate::config::PulserConfig;
use crate::error::{ErrorKind, Result, SequencerError};
use crate::function::{AutoPadding, CompanionKind, FunctionKind, Padding};
use crate::phase::{PhaseSequence, PhaseType};
use crate::pulse::PulseId;
use crate::registry::PulseRegistry;
use crate::timebase::{TickConverter, Ticks, TimebaseSource};
use crate::utils::WarningLog;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Declarations are parsed, no hardware exists yet.
    Preparation,
    /// Dry run: every check is applied, nothing is written to the device.
    Test,
    /// Live run with device writes.
    Experiment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slope {
    Positive,
    Negative,
}

impl FromStr for Slope {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "+" | "POS" | "POSITIVE" | "RISING" => Ok(Slope::Positive),
            "-" | "NEG" | "NEGATIVE" | "FALLING" => Ok(Slope::Negative),
            _ => Err(ErrorKind::UnknownSlope(s.to_string()).into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    Internal,
    External(Slope),
}

impl TriggerMode {
    /// Parses a trigger mode name; an external trigger needs a slope.
    pub fn parse(mode: &str, slope: Option<&str>) -> Result<Self> {
        match (mode.trim().to_ascii_lowercase().as_str(), slope) {
            ("internal", None) => Ok(TriggerMode::Internal),
            ("external", Some(slope)) => Ok(TriggerMode::External(slope.parse()?)),
            ("external", None) => Ok(TriggerMode::External(Slope::Positive)),
            ("internal", Some(_)) => Err(ErrorKind::TriggerModeConflict(
                "the internal trigger has no slope",
            )
            .into()),
            _ => Err(ErrorKind::UnknownTriggerMode(mode.to_string()).into()),
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TriggerMode::Internal => write!(f, "internal"),
            TriggerMode::External(Slope::Positive) => write!(f, "external (positive slope)"),
            TriggerMode::External(Slope::Negative) => write!(f, "external (negative slope)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SequencerState {
    pub config: PulserConfig,
    pub mode: RunMode,
    pub ticks: TickConverter,
    pub trigger_mode: Option<TriggerMode>,
    /// Repeat time as a number of repeat units beyond the pattern memory.
    pub repeat_units: Option<Ticks>,
    pub shape_to_defense: Option<Ticks>,
    pub defense_to_shape: Option<Ticks>,
    pub min_twt_distance: Option<Ticks>,
    pub registry: PulseRegistry,
    pub phase_sequences: IndexMap<usize, PhaseSequence>,
    pub current_phase: usize,
    pub committed_phase: usize,
    pub keep_all_pulses: bool,
    /// Whether the last update cycle found channels to change.
    pub needs_update: bool,
    pub is_running: bool,
    pub warnings: WarningLog,
    pub shape_defense_violations: usize,
    pub duty_cycle_warned: bool,
    pub commit_phase: CommitPhase,
    pub abort: AbortFlag,
}

impl SequencerState {
    pub fn new(config: PulserConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ticks: TickConverter::new(&config),
            registry: PulseRegistry::new(config.num_channels),
            config,
            mode: RunMode::Preparation,
            trigger_mode: None,
            repeat_units: None,
            shape_to_defense: None,
            defense_to_shape: None,
            min_twt_distance: None,
            phase_sequences: IndexMap::new(),
            current_phase: 0,
            committed_phase: 0,
            keep_all_pulses: false,
            needs_update: false,
            is_running: false,
            warnings: WarningLog::new(),
            shape_defense_violations: 0,
            duty_cycle_warned: false,
            commit_phase: CommitPhase::Idle,
            abort: AbortFlag::new(),
        })
    }

    pub fn require_mode(&self, operation: &'static str, allowed: &[RunMode]) -> Result<()> {
        if allowed.contains(&self.mode) {
            Ok(())
        } else {
            Err(ErrorKind::WrongRunMode {
                operation,
                mode: self.mode,
            }
            .into())
        }
    }

    fn require_preparation(&self, operation: &'static str) -> Result<()> {
        self.require_mode(operation, &[RunMode::Preparation])
    }

    fn require_run(&self, operation: &'static str) -> Result<()> {
        self.require_mode(operation, &[RunMode::Test, RunMode::Experiment])
    }

    // GLOBAL SETTINGS

    pub fn set_timebase(&mut self, seconds: f64, source: TimebaseSource) -> Result<()> {
        self.require_preparation("set_timebase")?;
        self.ticks.set_timebase(seconds, source)
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.require_preparation("set_trigger_mode")?;
        match self.trigger_mode {
            Some(current) if current == mode => return Ok(()),
            Some(_) => return Err(ErrorKind::SettingAlreadySet("trigger mode").into()),
            None => {}
        }
        if matches!(mode, TriggerMode::External(_)) && self.repeat_units.is_some() {
            return Err(ErrorKind::TriggerModeConflict(
                "an external trigger cannot be combined with a repeat time",
            )
            .into());
        }
        self.trigger_mode = Some(mode);
        Ok(())
    }

    /// Sets the time between the starts of consecutive shots (internal trigger only).
    pub fn set_repeat_time(&mut self, seconds: f64) -> Result<()> {
        self.require_preparation("set_repeat_time")?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ErrorKind::InvalidRepeatTime(seconds).into());
        }
        if matches!(self.trigger_mode, Some(TriggerMode::External(_))) {
            return Err(ErrorKind::TriggerModeConflict(
                "a repeat time requires the internal trigger",
            )
            .into());
        }
        let total = self.ticks.ceil_ticks(seconds)?;
        let beyond_memory = (total - self.config.memory_capacity).max(0);
        let factor = self.config.repeat_tick_factor;
        let units = (beyond_memory + factor - 1) / factor;
        match self.repeat_units {
            Some(current) if current != units => {
                Err(ErrorKind::SettingAlreadySet("repeat time").into())
            }
            _ => {
                self.repeat_units = Some(units);
                self.trigger_mode.get_or_insert(TriggerMode::Internal);
                Ok(())
            }
        }
    }

    pub fn set_repeat_frequency(&mut self, hz: f64) -> Result<()> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(ErrorKind::InvalidRepeatTime(1.0 / hz).into());
        }
        self.set_repeat_time(1.0 / hz)
    }

    fn set_distance(
        &mut self,
        seconds: f64,
        what: &'static str,
        field: fn(&mut Self) -> &mut Option<Ticks>,
    ) -> Result<()> {
        self.require_preparation(what)?;
        if !(seconds >= 0.0) {
            return Err(ErrorKind::InvalidDistance(what).into());
        }
        let ticks = self.ticks.ceil_ticks(seconds)?;
        let slot = field(self);
        match *slot {
            Some(current) if current != ticks => Err(ErrorKind::SettingAlreadySet(what).into()),
            _ => {
                *slot = Some(ticks);
                Ok(())
            }
        }
    }

    pub fn set_shape_to_defense_distance(&mut self, seconds: f64) -> Result<()> {
        self.set_distance(seconds, "shape to defense distance", |s| {
            &mut s.shape_to_defense
        })
    }

    pub fn set_defense_to_shape_distance(&mut self, seconds: f64) -> Result<()> {
        self.set_distance(seconds, "defense to shape distance", |s| {
            &mut s.defense_to_shape
        })
    }

    pub fn set_minimum_twt_pulse_distance(&mut self, seconds: f64) -> Result<()> {
        self.set_distance(seconds, "minimum TWT pulse distance", |s| {
            &mut s.min_twt_distance
        })
    }

    pub fn keep_all_pulses(&mut self) {
        self.keep_all_pulses = true;
    }

    // FUNCTIONS

    pub fn assign_channel(&mut self, function: FunctionKind, channel: usize) -> Result<()> {
        self.require_preparation("assign_channel")?;
        self.registry.assign_channel(function, channel)
    }

    pub fn set_function_delay(&mut self, function: FunctionKind, seconds: f64) -> Result<()> {
        self.require_preparation("set_function_delay")?;
        let ticks = self.ticks.time_to_ticks(seconds)?;
        let f = self.registry.function_mut(function);
        if f.declared_delay.is_some() {
            return Err(ErrorKind::FunctionAttributeAlreadySet {
                function,
                attribute: "delay",
            }
            .into());
        }
        f.declared_delay = Some(ticks);
        f.is_declared = true;
        Ok(())
    }

    fn padding_ticks(
        &mut self,
        function: FunctionKind,
        seconds: Option<f64>,
        what: &'static str,
    ) -> Result<Option<Ticks>> {
        let Some(seconds) = seconds else {
            return Ok(None);
        };
        let ticks = self.ticks.time_to_ticks(seconds)?;
        if ticks < 0 {
            return Err(ErrorKind::InvalidPadding {
                function,
                what,
                value: ticks,
            }
            .into());
        }
        Ok(Some(ticks))
    }

    /// Requests automatic companions of `kind` for every pulse of `function`.
    ///
    /// Missing paddings take the configured defaults at the start of the test run.
    pub fn automatic_companions(
        &mut self,
        function: FunctionKind,
        kind: CompanionKind,
        left: Option<f64>,
        right: Option<f64>,
    ) -> Result<()> {
        self.require_preparation("automatic companion pulses")?;
        let accepted = match kind {
            CompanionKind::Shape => function.accepts_shape_companion(),
            CompanionKind::Twt => function.accepts_twt_companion(),
        };
        if !accepted {
            return Err(ErrorKind::CompanionNotAllowed {
                function,
                companion: kind,
            }
            .into());
        }
        let request = AutoPadding {
            left: self.padding_ticks(function, left, "left padding")?,
            right: self.padding_ticks(function, right, "right padding")?,
        };
        let f = self.registry.function_mut(function);
        let slot = match kind {
            CompanionKind::Shape => &mut f.shape_request,
            CompanionKind::Twt => &mut f.twt_request,
        };
        if slot.is_some() {
            return Err(ErrorKind::FunctionAttributeAlreadySet {
                function,
                attribute: match kind {
                    CompanionKind::Shape => "automatic shape pulses",
                    CompanionKind::Twt => "automatic TWT pulses",
                },
            }
            .into());
        }
        *slot = Some(request);
        f.is_declared = true;
        Ok(())
    }

    pub fn automatic_shape_pulses(
        &mut self,
        function: FunctionKind,
        left: Option<f64>,
        right: Option<f64>,
    ) -> Result<()> {
        self.automatic_companions(function, CompanionKind::Shape, left, right)
    }

    pub fn automatic_twt_pulses(
        &mut self,
        function: FunctionKind,
        left: Option<f64>,
        right: Option<f64>,
    ) -> Result<()> {
        self.automatic_companions(function, CompanionKind::Twt, left, right)
    }

    // PHASE CYCLING

    pub fn cycle_len(&self) -> usize {
        self.phase_sequences
            .values()
            .next()
            .map_or(1, |s| s.phases.len())
    }

    pub fn define_phase_sequence(&mut self, id: usize, phases: Vec<PhaseType>) -> Result<()> {
        self.require_preparation("define_phase_sequence")?;
        if self.phase_sequences.contains_key(&id) {
            return Err(ErrorKind::SettingAlreadySet("phase sequence").into());
        }
        let expected = if self.phase_sequences.is_empty() && !phases.is_empty() {
            phases.len()
        } else {
            self.cycle_len()
        };
        if phases.len() != expected {
            return Err(ErrorKind::PhaseCycleMismatch {
                sequence: id,
                expected,
                found: phases.len(),
            }
            .into());
        }
        self.phase_sequences.insert(id, PhaseSequence { id, phases });
        Ok(())
    }

    pub fn phase_setup(
        &mut self,
        function: FunctionKind,
        phase: PhaseType,
        channel: usize,
    ) -> Result<()> {
        self.require_preparation("phase_setup")?;
        let f = self.registry.function_mut(function);
        if f.channel_column(channel).is_none() {
            return Err(ErrorKind::ChannelNotOwned { channel, function }.into());
        }
        f.phase_setup.get_or_insert_with(Default::default).assign(phase, channel)?;
        f.is_declared = true;
        Ok(())
    }

    pub fn advance_phase(&mut self) -> Result<()> {
        self.require_run("advance_phase")?;
        self.current_phase = (self.current_phase + 1) % self.cycle_len();
        Ok(())
    }

    pub fn reset_phase(&mut self) -> Result<()> {
        self.require_run("reset_phase")?;
        self.current_phase = 0;
        Ok(())
    }

    // PULSES

    pub fn declare_pulse(&mut self, id: PulseId) -> Result<()> {
        self.require_preparation("declare_pulse")?;
        self.registry.create_pulse(id)
    }

    pub fn set_pulse_function(&mut self, id: PulseId, function: FunctionKind) -> Result<()> {
        self.require_preparation("set_pulse_function")?;
        self.registry.set_function(id, function)
    }

    pub fn set_position(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        let ticks = self.ticks.time_to_ticks(seconds)?;
        self.registry.set_position(id, ticks, self.mode)
    }

    pub fn set_length(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        let ticks = self.ticks.time_to_ticks(seconds)?;
        self.registry.set_length(id, ticks, self.mode)
    }

    pub fn set_position_increment(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        self.require_preparation("set_position_increment")?;
        let ticks = self.ticks.time_to_ticks(seconds)?;
        self.registry.set_position_increment(id, ticks)
    }

    pub fn set_length_increment(&mut self, id: PulseId, seconds: f64) -> Result<()> {
        self.require_preparation("set_length_increment")?;
        let ticks = self.ticks.time_to_ticks(seconds)?;
        self.registry.set_length_increment(id, ticks)
    }

    pub fn set_phase_cycle(&mut self, id: PulseId, sequence: usize) -> Result<()> {
        self.require_preparation("set_phase_cycle")?;
        self.registry.set_phase_cycle(id, sequence)
    }

    /// Shifts one pulse, or every pulse with a position increment, by its increment.
    pub fn shift_by_increment(&mut self, id: Option<PulseId>) -> Result<()> {
        self.require_run("shift_by_increment")?;
        match id {
            Some(id) => self.registry.shift_by_increment(id),
            None => {
                for id in self.registry.user_pulse_ids() {
                    if self.registry.pulse(id)?.timing.dpos.is_some() {
                        self.registry.shift_by_increment(id)?;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn increment_length(&mut self, id: Option<PulseId>) -> Result<()> {
        self.require_run("increment_length")?;
        match id {
            Some(id) => self.registry.increment_length(id),
            None => {
                for id in self.registry.user_pulse_ids() {
                    if self.registry.pulse(id)?.timing.dlen.is_some() {
                        self.registry.increment_length(id)?;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn reset_to_initial(&mut self, id: Option<PulseId>) -> Result<()> {
        self.require_run("reset_to_initial")?;
        match id {
            Some(id) => self.registry.reset_to_initial(id),
            None => {
                self.registry.reset_all_to_initial();
                Ok(())
            }
        }
    }

    // TEST RUN PREPARATION

    /// Checks that the declarations form a usable sequence.
    pub fn validate_declarations(&self) -> Result<()> {
        for pulse in self.registry.pulses.values() {
            let function = pulse.function.ok_or(ErrorKind::MissingFunction(pulse.id))?;
            if self.registry.function(function).channels.is_empty() {
                return Err(ErrorKind::MissingChannel(function).into());
            }
            if let Some(sequence) = pulse.phase_cycle {
                if !self.phase_sequences.contains_key(&sequence) {
                    return Err(ErrorKind::UnknownPhaseSequence {
                        pulse: pulse.id,
                        sequence,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Shifts all delays so that the most negative one becomes zero.
    pub fn normalize_delays(&mut self) {
        let min_delay = self
            .registry
            .functions
            .values()
            .filter_map(|f| f.declared_delay)
            .min()
            .unwrap_or(0)
            .min(0);
        for function in self.registry.functions.values_mut() {
            function.delay = function.declared_delay.unwrap_or(0) - min_delay;
        }
        if min_delay < 0 {
            log::info!(
                "Shifted all function delays by {} ticks to remove negative delays",
                -min_delay
            );
        }
    }

    /// Replaces missing paddings and distances by the configured defaults.
    pub fn apply_defaults(&mut self) -> Result<()> {
        let cfg = self.config.clone();
        let shape_default = Padding::new(
            self.ticks.ceil_ticks(cfg.default_shape_padding_left)?,
            self.ticks.ceil_ticks(cfg.default_shape_padding_right)?,
        );
        let twt_default = Padding::new(
            self.ticks.ceil_ticks(cfg.default_twt_padding_left)?,
            self.ticks.ceil_ticks(cfg.default_twt_padding_right)?,
        );
        for function in self.registry.functions.values_mut() {
            for (kind, default) in [
                (CompanionKind::Shape, shape_default),
                (CompanionKind::Twt, twt_default),
            ] {
                if let Some(request) = function.companion_request(kind) {
                    function.set_padding(
                        kind,
                        Padding::new(
                            request.left.unwrap_or(default.left),
                            request.right.unwrap_or(default.right),
                        ),
                    );
                }
            }
        }
        if self.shape_to_defense.is_none() {
            self.shape_to_defense = Some(self.ticks.ceil_ticks(cfg.default_shape_to_defense)?);
        }
        if self.defense_to_shape.is_none() {
            self.defense_to_shape = Some(self.ticks.ceil_ticks(cfg.default_defense_to_shape)?);
        }
        if self.min_twt_distance.is_none() {
            self.min_twt_distance = Some(self.ticks.ceil_ticks(cfg.default_min_twt_distance)?);
        }
        Ok(())
    }

    // QUERIES

    /// Length of one shot: the longest pattern end seen over all functions.
    pub fn sequence_length(&self) -> Ticks {
        self.registry
            .functions
            .values()
            .map(|f| f.max_seq_len)
            .max()
            .unwrap_or(0)
    }

    pub fn repeat_ticks(&self) -> Ticks {
        self.config.memory_capacity
            + self.config.repeat_tick_factor * self.repeat_units.unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state() -> SequencerState {
        SequencerState::new(PulserConfig::default()).unwrap()
    }

    #[test]
    fn declarations_need_preparation_mode() {
        let mut seq = state();
        seq.declare_pulse(1).unwrap();
        seq.mode = RunMode::Test;
        assert_eq!(
            seq.declare_pulse(2).unwrap_err().kind(),
            &ErrorKind::WrongRunMode {
                operation: "declare_pulse",
                mode: RunMode::Test
            }
        );
        seq.mode = RunMode::Preparation;
        assert!(seq.advance_phase().is_err());
    }

    #[test]
    fn trigger_and_repeat_time() {
        let mut seq = state();
        // 32768 ticks of memory plus two repeat units of 1024 ticks
        seq.set_repeat_time((32_768.0 + 1500.0) * 8e-9).unwrap();
        assert_eq!(seq.repeat_units, Some(2));
        assert_eq!(seq.trigger_mode, Some(TriggerMode::Internal));
        assert!(matches!(
            seq.set_trigger_mode(TriggerMode::External(Slope::Positive))
                .unwrap_err()
                .kind(),
            ErrorKind::SettingAlreadySet(_)
        ));

        let mut seq = state();
        seq.set_trigger_mode(TriggerMode::parse("External", Some("neg")).unwrap())
            .unwrap();
        assert_eq!(seq.trigger_mode, Some(TriggerMode::External(Slope::Negative)));
        assert!(matches!(
            seq.set_repeat_frequency(1000.0).unwrap_err().kind(),
            ErrorKind::TriggerModeConflict(_)
        ));
    }

    #[test]
    fn phase_sequences_share_one_length() {
        let mut seq = state();
        seq.define_phase_sequence(0, vec![PhaseType::PlusX, PhaseType::MinusX])
            .unwrap();
        let err = seq
            .define_phase_sequence(1, vec![PhaseType::PlusY])
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::PhaseCycleMismatch {
                sequence: 1,
                expected: 2,
                found: 1
            }
        );
        assert_eq!(seq.cycle_len(), 2);
    }

    #[test]
    fn phase_setup_needs_owned_channel() {
        let mut seq = state();
        seq.assign_channel(FunctionKind::Microwave, 2).unwrap();
        seq.phase_setup(FunctionKind::Microwave, PhaseType::PlusX, 2)
            .unwrap();
        assert_eq!(
            seq.phase_setup(FunctionKind::Microwave, PhaseType::MinusX, 3)
                .unwrap_err()
                .kind(),
            &ErrorKind::ChannelNotOwned {
                channel: 3,
                function: FunctionKind::Microwave
            }
        );
    }

    #[test]
    fn delays_are_normalized() {
        let mut seq = state();
        seq.set_function_delay(FunctionKind::Microwave, -16e-9).unwrap();
        seq.set_function_delay(FunctionKind::Defense, 8e-9).unwrap();
        seq.normalize_delays();
        assert_eq!(seq.registry.function(FunctionKind::Microwave).delay, 0);
        assert_eq!(seq.registry.function(FunctionKind::Defense).delay, 3);
        assert_eq!(seq.registry.function(FunctionKind::Detection).delay, 2);
    }

    #[test]
    fn defaults_fill_missing_paddings() {
        let mut seq = state();
        seq.automatic_shape_pulses(FunctionKind::Microwave, Some(24e-9), None)
            .unwrap();
        assert!(matches!(
            seq.automatic_shape_pulses(FunctionKind::PulseShape, None, None)
                .unwrap_err()
                .kind(),
            ErrorKind::CompanionNotAllowed { .. }
        ));
        seq.apply_defaults().unwrap();
        let mw = seq.registry.function(FunctionKind::Microwave);
        assert_eq!(mw.shape_padding, Padding::new(3, 2));
        assert_eq!(mw.min_shape_padding, Padding::new(3, 2));
        assert_eq!(seq.shape_to_defense, Some(12));
    }
}
