use pulsecompiler_backend::commit::WriteResult;
use pulsecompiler_backend::*;

use proptest::prelude::*;

const TB: f64 = 8e-9;

#[derive(Default)]
struct Recorder {
    writes: Vec<(usize, Vec<(Ticks, Ticks)>)>,
}

impl ChannelWriter for Recorder {
    fn write_channel(&mut self, channel: usize, pulses: &[(Ticks, Ticks)]) -> WriteResult {
        self.writes.push((channel, pulses.to_vec()));
        Ok(())
    }

    fn set_running(&mut self, _running: bool) -> WriteResult {
        Ok(())
    }

    fn send_raw(&mut self, _command: &str) -> WriteResult {
        Ok(())
    }
}

// An experiment with a recording device, standing in for the control backend
struct LiveExperiment {
    state: SequencerState,
    snapshot: Option<SequencerState>,
    device: Recorder,
}

impl BaseExperiment for LiveExperiment {
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
        (&mut self.state, Some(&mut self.device))
    }
}

fn live(config: PulserConfig) -> LiveExperiment {
    LiveExperiment {
        state: SequencerState::new(config).unwrap(),
        snapshot: None,
        device: Recorder::default(),
    }
}

fn experiment() -> Experiment {
    Experiment::with_config(PulserConfig::default()).unwrap()
}

fn pulse(exp: &mut impl BaseExperiment, id: PulseId, function: FunctionKind, pos: Ticks, len: Ticks) {
    exp.declare_pulse(id).unwrap();
    exp.set_pulse_function(id, function).unwrap();
    exp.set_position(id, pos as f64 * TB).unwrap();
    exp.set_length(id, len as f64 * TB).unwrap();
}

#[test]
fn shape_pulse_around_microwave_pulse() {
    let mut exp = experiment();
    BaseExperiment::set_timebase(&mut exp, TB, TimebaseSource::Internal).unwrap();
    BaseExperiment::assign_channel(&mut exp, FunctionKind::Microwave, 0).unwrap();
    BaseExperiment::assign_channel(&mut exp, FunctionKind::PulseShape, 1).unwrap();
    BaseExperiment::automatic_shape_pulses(&mut exp, FunctionKind::Microwave, Some(3.0 * TB), Some(3.0 * TB))
        .unwrap();
    pulse(&mut exp, 1, FunctionKind::Microwave, 10, 20);

    BaseExperiment::start_test_run(&mut exp).unwrap();
    assert_eq!(BaseExperiment::channel_pattern(&exp, 0).unwrap(), vec![(10, 20)]);
    assert_eq!(BaseExperiment::channel_pattern(&exp, 1).unwrap(), vec![(7, 26)]);
    assert!(BaseExperiment::sequencer(&exp).warnings.is_empty());
}

#[test]
fn overlapping_defense_pulses_are_fatal() {
    let mut exp = experiment();
    BaseExperiment::assign_channel(&mut exp, FunctionKind::Defense, 0).unwrap();
    pulse(&mut exp, 1, FunctionKind::Defense, 0, 10);
    pulse(&mut exp, 2, FunctionKind::Defense, 5, 10);

    let err = BaseExperiment::start_test_run(&mut exp).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.kind(), &ErrorKind::PulseOverlap { first: 1, second: 2 });
}

#[test]
/// **Successful test**: one pulse too many is fatal in the test run and rolled back during the
/// live run, without any channel being written either time.
fn too_many_pulses_writes_nothing() {
    let config = PulserConfig::from_json_str(r#"{ "max_pulses_per_channel": 2 }"#).unwrap();
    let declare = |exp: &mut LiveExperiment| {
        exp.keep_all_pulses();
        exp.assign_channel(FunctionKind::Detection, 4).unwrap();
        pulse(exp, 1, FunctionKind::Detection, 0, 10);
        pulse(exp, 2, FunctionKind::Detection, 20, 10);
        pulse(exp, 3, FunctionKind::Detection, 40, 0);
        exp.set_length_increment(3, 10.0 * TB).unwrap();
    };

    let mut exp = live(config.clone());
    declare(&mut exp);
    exp.start_test_run().unwrap();
    exp.increment_length(Some(3)).unwrap();
    let err = exp.update().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err.kind(), ErrorKind::TooManyPulses { count: 3, max: 2, .. }));
    assert!(exp.device.writes.is_empty());

    let mut exp = live(config);
    declare(&mut exp);
    exp.start_test_run().unwrap();
    exp.end_test_run().unwrap();
    exp.start_experiment().unwrap();
    assert_eq!(exp.device.writes, vec![(4, vec![(0, 10), (20, 10)])]);

    exp.increment_length(Some(3)).unwrap();
    let err = exp.update().unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(exp.device.writes.len(), 1);
    assert_eq!(exp.sequencer().registry.pulse(3).unwrap().timing.len, Some(0));
}

#[test]
fn unmapped_phase_type_fails_validation() {
    let mut exp = live(PulserConfig::default());
    exp.assign_channel(FunctionKind::Microwave, 0).unwrap();
    exp.assign_channel(FunctionKind::Microwave, 1).unwrap();
    exp.phase_setup(FunctionKind::Microwave, "+x".parse().unwrap(), 0).unwrap();
    exp.phase_setup(FunctionKind::Microwave, "-x".parse().unwrap(), 1).unwrap();
    exp.define_phase_sequence(0, vec![PhaseType::PlusX, PhaseType::PlusY])
        .unwrap();
    pulse(&mut exp, 1, FunctionKind::Microwave, 10, 20);
    exp.set_phase_cycle(1, 0).unwrap();

    let err = exp.start_test_run().unwrap_err();
    assert_eq!(
        err.kind(),
        &ErrorKind::UnmappedPhaseType {
            pulse: 1,
            function: FunctionKind::Microwave,
            phase: PhaseType::PlusY
        }
    );
    assert!(exp.device.writes.is_empty());
}

#[test]
fn phase_cycled_pulse_moves_between_channels() {
    let mut exp = live(PulserConfig::default());
    exp.assign_channel(FunctionKind::Microwave, 0).unwrap();
    exp.assign_channel(FunctionKind::Microwave, 1).unwrap();
    exp.phase_setup(FunctionKind::Microwave, PhaseType::PlusX, 0).unwrap();
    exp.phase_setup(FunctionKind::Microwave, PhaseType::MinusX, 1).unwrap();
    exp.define_phase_sequence(0, vec![PhaseType::PlusX, PhaseType::MinusX])
        .unwrap();
    pulse(&mut exp, 1, FunctionKind::Microwave, 10, 20);
    exp.set_phase_cycle(1, 0).unwrap();

    exp.start_test_run().unwrap();
    exp.end_test_run().unwrap();
    exp.start_experiment().unwrap();
    assert_eq!(exp.channel_pattern(0).unwrap(), vec![(10, 20)]);

    exp.advance_phase().unwrap();
    let report = exp.update().unwrap();
    assert_eq!(report.updated_channels, vec![0, 1]);
    assert!(exp.channel_pattern(0).unwrap().is_empty());
    assert_eq!(exp.channel_pattern(1).unwrap(), vec![(10, 20)]);

    let matrix = exp.phase_matrix(FunctionKind::Microwave).unwrap();
    assert_eq!(matrix.to_nested(), vec![vec![vec![1], vec![]], vec![vec![], vec![1]]]);
}

#[test]
fn recommit_without_changes_is_free() {
    let mut exp = live(PulserConfig::default());
    exp.assign_channel(FunctionKind::Microwave, 0).unwrap();
    pulse(&mut exp, 1, FunctionKind::Microwave, 10, 20);
    exp.start_test_run().unwrap();
    exp.end_test_run().unwrap();
    exp.start_experiment().unwrap();
    let writes = exp.device.writes.len();

    assert!(exp.update().unwrap().updated_channels.is_empty());
    assert!(exp.update().unwrap().updated_channels.is_empty());
    assert_eq!(exp.device.writes.len(), writes);
}

#[test]
/// A shape pulse padded past the start of the shot is clamped, and the achieved padding recorded.
fn padding_is_clamped_at_zero() {
    let mut exp = experiment();
    BaseExperiment::assign_channel(&mut exp, FunctionKind::Microwave, 0).unwrap();
    BaseExperiment::assign_channel(&mut exp, FunctionKind::PulseShape, 1).unwrap();
    BaseExperiment::automatic_shape_pulses(&mut exp, FunctionKind::Microwave, Some(3.0 * TB), Some(3.0 * TB))
        .unwrap();
    pulse(&mut exp, 1, FunctionKind::Microwave, 1, 20);

    BaseExperiment::start_test_run(&mut exp).unwrap();
    assert_eq!(BaseExperiment::channel_pattern(&exp, 1).unwrap(), vec![(0, 24)]);
    let (left, right) =
        BaseExperiment::minimum_padding(&exp, FunctionKind::Microwave, CompanionKind::Shape);
    assert_eq!((left, right), (TB, 3.0 * TB));
    assert_eq!(BaseExperiment::sequencer(&exp).warnings.len(), 1);
}

#[test]
fn times_must_be_tick_multiples() {
    let mut exp = experiment();
    BaseExperiment::declare_pulse(&mut exp, 1).unwrap();
    let err = BaseExperiment::set_position(&mut exp, 1, 81e-9).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NotATickMultiple { .. }));
    BaseExperiment::set_position(&mut exp, 1, 80e-9).unwrap();
    assert_eq!(
        BaseExperiment::sequencer(&exp).registry.pulse(1).unwrap().timing.pos,
        Some(10)
    );
}

#[test]
fn companions_follow_their_owner() {
    let mut exp = live(PulserConfig::default());
    exp.assign_channel(FunctionKind::Microwave, 0).unwrap();
    exp.assign_channel(FunctionKind::PulseShape, 1).unwrap();
    exp.automatic_shape_pulses(FunctionKind::Microwave, None, None).unwrap();
    exp.declare_pulse(1).unwrap();
    exp.set_pulse_function(1, FunctionKind::Microwave).unwrap();
    exp.set_position(1, 80e-9).unwrap();
    exp.set_length(1, 0.0).unwrap();
    exp.set_length_increment(1, 16e-9).unwrap();
    exp.start_test_run().unwrap();

    let companion = exp.sequencer().registry.pulse(1).unwrap().shape_companion.unwrap();
    assert!(!exp.sequencer().registry.pulse(companion).unwrap().is_active);

    exp.increment_length(None).unwrap();
    exp.update().unwrap();
    let registry = &exp.sequencer().registry;
    let (owner, shape) = (registry.pulse(1).unwrap(), registry.pulse(companion).unwrap());
    assert!(owner.is_active && shape.is_active);
    assert_eq!(owner.timing.pos, shape.timing.pos);
    assert_eq!(owner.timing.len, shape.timing.len);
    // 2 ticks of default padding on each side
    assert_eq!(exp.channel_pattern(1).unwrap(), vec![(8, 6)]);
}

fn user_overlap(pulses: &[(Ticks, Ticks)]) -> bool {
    let mut intervals: Vec<(Ticks, Ticks)> = pulses.iter().map(|&(p, l)| (p, p + l)).collect();
    intervals.sort();
    intervals.windows(2).any(|w| w[0].1 > w[1].0)
}

proptest! {
    #[test]
    /// Resolution either rejects overlapping user pulses or leaves no overlap on any channel.
    fn no_overlap_after_resolution(
        pulses in prop::collection::vec((0i64..200, 1i64..30), 1..6),
        twt_pulses in prop::collection::vec((0i64..200, 1i64..30), 0..3),
        shape_left in 0i64..6,
        shape_right in 0i64..6,
    ) {
        let mut exp = experiment();
        BaseExperiment::assign_channel(&mut exp, FunctionKind::Microwave, 0).unwrap();
        BaseExperiment::assign_channel(&mut exp, FunctionKind::PulseShape, 1).unwrap();
        BaseExperiment::assign_channel(&mut exp, FunctionKind::Twt, 2).unwrap();
        BaseExperiment::automatic_shape_pulses(
            &mut exp,
            FunctionKind::Microwave,
            Some(shape_left as f64 * TB),
            Some(shape_right as f64 * TB),
        )
        .unwrap();
        BaseExperiment::automatic_twt_pulses(&mut exp, FunctionKind::Microwave, None, None).unwrap();
        for (i, &(pos, len)) in pulses.iter().enumerate() {
            pulse(&mut exp, i as PulseId + 1, FunctionKind::Microwave, pos, len);
        }
        for (i, &(pos, len)) in twt_pulses.iter().enumerate() {
            pulse(&mut exp, i as PulseId + 100, FunctionKind::Twt, pos, len);
        }

        match BaseExperiment::start_test_run(&mut exp) {
            Ok(_) => {
                prop_assert!(!user_overlap(&pulses) && !user_overlap(&twt_pulses));
                for channel in 0..3 {
                    let pattern = BaseExperiment::channel_pattern(&exp, channel).unwrap();
                    for w in pattern.windows(2) {
                        prop_assert!(w[0].0 + w[0].1 <= w[1].0, "channel {}: {:?}", channel, pattern);
                    }
                    prop_assert!(pattern.iter().all(|&(pos, len)| pos >= 0 && len > 0));
                }
            }
            Err(err) => {
                prop_assert!(user_overlap(&pulses) || user_overlap(&twt_pulses), "{}", err);
                let is_overlap = matches!(err.kind(), ErrorKind::PulseOverlap { .. });
                prop_assert!(is_overlap);
            }
        }
    }
}
