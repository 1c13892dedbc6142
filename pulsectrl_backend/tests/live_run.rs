use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use pulsecompiler_backend::*;
use pulsectrl_backend::shots::{run_shots, ShotPlan, ShotSummary};
use pulsectrl_backend::transport::RecordingTransport;
use pulsectrl_backend::{DeviceDriver, DriverConfig, Experiment};

type SentLog = Arc<Mutex<Vec<String>>>;

fn quiet() -> DriverConfig {
    DriverConfig {
        reply_timeout: Duration::from_millis(500),
        poll_interval: None,
    }
}

// MW pulse at tick 10 of length 20 with a shape pulse padded by 3 ticks on both sides
fn prepared() -> Experiment {
    let mut exp = Experiment::with_config(PulserConfig::default()).unwrap();
    BaseExperiment::assign_channel(&mut exp, FunctionKind::Microwave, 0).unwrap();
    BaseExperiment::assign_channel(&mut exp, FunctionKind::PulseShape, 1).unwrap();
    BaseExperiment::automatic_shape_pulses(&mut exp, FunctionKind::Microwave, Some(24e-9), Some(24e-9))
        .unwrap();
    BaseExperiment::declare_pulse(&mut exp, 1).unwrap();
    BaseExperiment::set_pulse_function(&mut exp, 1, FunctionKind::Microwave).unwrap();
    BaseExperiment::set_position(&mut exp, 1, 80e-9).unwrap();
    BaseExperiment::set_length(&mut exp, 1, 160e-9).unwrap();
    BaseExperiment::set_length_increment(&mut exp, 1, 8e-9).unwrap();

    BaseExperiment::start_test_run(&mut exp).unwrap();
    BaseExperiment::end_test_run(&mut exp).unwrap();
    exp
}

fn connected(transport: RecordingTransport, config: DriverConfig) -> (Experiment, SentLog) {
    let sent = transport.log();
    let mut exp = prepared();
    exp.attach(DeviceDriver::spawn(transport, config).unwrap()).unwrap();
    (exp, sent)
}

fn lengthening(shots: usize) -> ShotPlan {
    ShotPlan {
        shots,
        increment_lengths: true,
        ..Default::default()
    }
}

fn pulse_length(exp: &Experiment) -> Option<Ticks> {
    BaseExperiment::sequencer(exp)
        .registry
        .pulse(1)
        .unwrap()
        .timing
        .len
}

#[test]
fn live_run_writes_changed_channels_in_order() {
    let (mut exp, sent) = connected(RecordingTransport::new(), quiet());

    BaseExperiment::start_experiment(&mut exp).unwrap();
    let summary = run_shots(&mut exp, &lengthening(2), |_| Ok(())).unwrap();
    assert_eq!(
        summary,
        ShotSummary {
            completed: 2,
            channel_writes: 4,
            aborted: false
        }
    );
    BaseExperiment::end_experiment(&mut exp).unwrap();

    assert_eq!(
        *sent.lock(),
        vec![
            "PAT 0 1 10,20",
            "PAT 1 1 7,26",
            "RUN 1",
            "PAT 0 1 10,21",
            "PAT 1 1 7,27",
            "PAT 0 1 10,22",
            "PAT 1 1 7,28",
            "RUN 0",
        ]
    );
    // Back at the state after the test run
    assert_eq!(BaseExperiment::run_mode(&exp), RunMode::Test);
    assert_eq!(pulse_length(&exp), Some(20));
}

#[test]
fn unchanged_shots_write_nothing() {
    let (mut exp, sent) = connected(RecordingTransport::new(), quiet());
    BaseExperiment::start_experiment(&mut exp).unwrap();
    let summary = run_shots(&mut exp, &ShotPlan { shots: 3, ..Default::default() }, |_| Ok(())).unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.channel_writes, 0);
    assert_eq!(sent.lock().len(), 3);
}

#[test]
fn rejected_write_is_rolled_back_and_rewritten() {
    let transport = RecordingTransport::new().rejecting("PAT 1 1 7,27");
    let (mut exp, sent) = connected(transport, quiet());
    BaseExperiment::start_experiment(&mut exp).unwrap();

    let err = run_shots(&mut exp, &lengthening(1), |_| Ok(())).unwrap_err();
    assert!(!err.is_fatal());
    match err.kind() {
        ErrorKind::Device(msg) => assert!(msg.contains("rejected"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(pulse_length(&exp), Some(20));
    assert_eq!(BaseExperiment::channel_pattern(&exp, 0).unwrap(), vec![(10, 20)]);

    // Channel 0 already holds the rejected shot on the device, so both channels are rewritten
    let report = BaseExperiment::update(&mut exp).unwrap();
    assert_eq!(report.updated_channels, vec![0, 1]);
    let sent = sent.lock();
    assert_eq!(&sent[sent.len() - 2..], ["PAT 0 1 10,20", "PAT 1 1 7,26"]);
}

#[test]
fn abort_ends_the_shot_loop() {
    let (mut exp, sent) = connected(RecordingTransport::new(), quiet());
    BaseExperiment::start_experiment(&mut exp).unwrap();

    let abort = BaseExperiment::abort_handle(&exp);
    let summary = run_shots(&mut exp, &lengthening(5), |shot| {
        if shot == 1 {
            abort.request();
        }
        Ok(())
    })
    .unwrap();
    assert!(summary.aborted);
    assert_eq!(summary.completed, 2);
    // The aborted third shot was rolled back before anything was written
    assert_eq!(pulse_length(&exp), Some(22));
    assert_eq!(sent.lock().len(), 3 + 4);
    assert!(!abort.is_requested());
}

#[test]
fn slow_device_times_out() {
    let transport = RecordingTransport::new().with_delay(Duration::from_millis(100));
    let config = DriverConfig {
        reply_timeout: Duration::from_millis(20),
        poll_interval: None,
    };
    let (mut exp, _sent) = connected(transport, config);

    let err = BaseExperiment::start_experiment(&mut exp).unwrap_err();
    assert!(!err.is_fatal());
    assert!(err.to_string().contains("No reply"), "{err}");
    assert!(BaseExperiment::channel_pattern(&exp, 0).unwrap().is_empty());
    assert!(!BaseExperiment::is_running(&exp));
}

#[test]
fn device_cannot_be_replaced_live() {
    let (mut exp, _sent) = connected(RecordingTransport::new(), quiet());
    BaseExperiment::start_experiment(&mut exp).unwrap();
    let other = DeviceDriver::spawn(RecordingTransport::new(), quiet()).unwrap();
    assert!(matches!(
        exp.attach(other).unwrap_err().kind(),
        ErrorKind::WrongRunMode { .. }
    ));
}

#[test]
fn raw_commands_reach_the_device() {
    let transport = RecordingTransport::new().rejecting("BOGUS");
    let (mut exp, sent) = connected(transport, quiet());
    BaseExperiment::send_raw_command(&mut exp, "CLK EXT").unwrap();
    assert!(matches!(
        BaseExperiment::send_raw_command(&mut exp, "BOGUS").unwrap_err().kind(),
        ErrorKind::Device(_)
    ));
    assert_eq!(*sent.lock(), vec!["CLK EXT", "BOGUS"]);
}
