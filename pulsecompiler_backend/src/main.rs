use pulsecompiler_backend::*;

fn main() -> Result<()> {
    let mut exp = Experiment::with_config(PulserConfig::default())?;
    BaseExperiment::assign_channel(&mut exp, FunctionKind::Microwave, 0)?;
    BaseExperiment::assign_channel(&mut exp, FunctionKind::PulseShape, 1)?;
    BaseExperiment::automatic_shape_pulses(&mut exp, FunctionKind::Microwave, Some(24e-9), Some(24e-9))?;

    BaseExperiment::declare_pulse(&mut exp, 1)?;
    BaseExperiment::set_pulse_function(&mut exp, 1, FunctionKind::Microwave)?;
    BaseExperiment::set_position(&mut exp, 1, 80e-9)?;
    BaseExperiment::set_length(&mut exp, 1, 160e-9)?;
    BaseExperiment::set_position_increment(&mut exp, 1, 8e-9)?;

    BaseExperiment::start_test_run(&mut exp)?;
    for shot in 0..3 {
        BaseExperiment::shift_by_increment(&mut exp, None)?;
        let report = BaseExperiment::update(&mut exp)?;
        println!(
            "shot {shot}: updated {:?}, MW {:?}, SHAPE {:?}",
            report.updated_channels,
            BaseExperiment::channel_pattern(&exp, 0)?,
            BaseExperiment::channel_pattern(&exp, 1)?
        );
    }
    BaseExperiment::end_test_run(&mut exp)?;
    println!("sequence length: {} s", BaseExperiment::sequence_length(&exp));
    Ok(())
}
