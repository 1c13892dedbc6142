use pulsecompiler_backend::*;
use pulsectrl_backend::shots::{run_shots, ShotPlan};
use pulsectrl_backend::transport::RecordingTransport;
use pulsectrl_backend::{DeviceDriver, DriverConfig, Experiment};

fn main() -> Result<()> {
    let mut exp = Experiment::with_config(PulserConfig::default())?;
    BaseExperiment::assign_channel(&mut exp, FunctionKind::Microwave, 0)?;
    BaseExperiment::assign_channel(&mut exp, FunctionKind::PulseShape, 1)?;
    BaseExperiment::assign_channel(&mut exp, FunctionKind::Detection, 2)?;
    BaseExperiment::automatic_shape_pulses(&mut exp, FunctionKind::Microwave, None, None)?;

    BaseExperiment::declare_pulse(&mut exp, 1)?;
    BaseExperiment::set_pulse_function(&mut exp, 1, FunctionKind::Microwave)?;
    BaseExperiment::set_position(&mut exp, 1, 80e-9)?;
    BaseExperiment::set_length(&mut exp, 1, 32e-9)?;
    BaseExperiment::set_length_increment(&mut exp, 1, 8e-9)?;

    BaseExperiment::declare_pulse(&mut exp, 2)?;
    BaseExperiment::set_pulse_function(&mut exp, 2, FunctionKind::Detection)?;
    BaseExperiment::set_position(&mut exp, 2, 400e-9)?;
    BaseExperiment::set_length(&mut exp, 2, 800e-9)?;

    let plan = ShotPlan {
        shots: 4,
        increment_lengths: true,
        ..Default::default()
    };

    BaseExperiment::start_test_run(&mut exp)?;
    let dry = run_shots(&mut exp, &plan, |_| Ok(()))?;
    BaseExperiment::end_test_run(&mut exp)?;
    println!("test run: {dry:?}");

    let transport = RecordingTransport::new();
    let sent = transport.log();
    exp.attach(DeviceDriver::spawn(transport, DriverConfig::default())?)?;

    BaseExperiment::start_experiment(&mut exp)?;
    let live = run_shots(&mut exp, &plan, |shot| {
        println!("shot {shot} committed");
        Ok(())
    })?;
    BaseExperiment::end_experiment(&mut exp)?;
    println!("live run: {live:?}");

    for line in sent.lock().iter() {
        println!("> {line}");
    }
    Ok(())
}
