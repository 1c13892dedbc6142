//! Checks applied to a resolved shot: shape/defense distances, TWT pulse separation, TWT duty
//! cycle and the shape/defense distance across the end of the shot.

use crate::error::{ErrorKind, Result};
use crate::function::FunctionKind;
use crate::resolver::{ResolvedChannel, Slot};
use crate::sequencer::{RunMode, SequencerState};
use crate::timebase::Ticks;
use crate::utils::WarningKey;

fn slots_of<'a>(
    channels: &'a [ResolvedChannel],
    pred: impl Fn(FunctionKind) -> bool + 'a,
) -> impl Iterator<Item = &'a Slot> + 'a {
    channels
        .iter()
        .filter(move |c| pred(c.function))
        .flat_map(|c| c.slots.iter())
}

/// Closes gaps below the minimum TWT pulse distance if a companion is involved, warns otherwise.
pub fn enforce_twt_distance(state: &mut SequencerState, channels: &mut [ResolvedChannel]) {
    let Some(min) = state.min_twt_distance else {
        return;
    };
    for channel in channels.iter_mut().filter(|c| c.function.is_twt()) {
        for i in 1..channel.slots.len() {
            let (a, b) = (channel.slots[i - 1], channel.slots[i]);
            let gap = b.pos - a.end;
            if gap <= 0 || gap >= min {
                continue;
            }
            if a.is_user() && b.is_user() {
                let key = WarningKey::new("twt-distance", format!("{}/{}", a.pulse, b.pulse));
                state.warnings.warn(key, || {
                    format!(
                        "Distance of {gap} ticks between TWT pulses #{} and #{} is below the minimum of {min} ticks",
                        a.pulse, b.pulse
                    )
                });
            } else if !a.is_user() {
                channel.slots[i - 1].end = b.pos;
            } else {
                channel.slots[i].pos = a.end;
            }
        }
    }
}

/// Checks the minimum distances between shape pulses and defense pulses within the shot.
///
/// A violation is an error during a live run. During a test run it is logged as a severe
/// warning and counted; the count is checked when the test run ends.
pub fn check_shape_defense(state: &mut SequencerState, channels: &[ResolvedChannel]) -> Result<()> {
    let shape_to_defense = state.shape_to_defense.unwrap_or(0);
    let defense_to_shape = state.defense_to_shape.unwrap_or(0);
    let shapes: Vec<&Slot> = slots_of(channels, |f| f == FunctionKind::PulseShape).collect();
    let defenses: Vec<&Slot> = slots_of(channels, |f| f == FunctionKind::Defense).collect();

    for shape in &shapes {
        for defense in &defenses {
            let (distance, minimum) = if shape.pos <= defense.pos {
                (defense.pos - shape.end, shape_to_defense)
            } else {
                (shape.pos - defense.end, defense_to_shape)
            };
            if distance >= minimum {
                continue;
            }
            let error = ErrorKind::ShapeDefenseDistance {
                shape: shape.owner,
                defense: defense.pulse,
                distance,
                minimum,
            };
            if state.mode == RunMode::Experiment {
                return Err(error.into());
            }
            state.shape_defense_violations += 1;
            let key = WarningKey::new("shape-defense", format!("{}/{}", shape.owner, defense.pulse));
            state.warnings.severe(key, || error.to_string());
        }
    }
    Ok(())
}

/// Warns once per run if the TWT pulses exceed the duty-cycle budget of a shot.
pub fn check_duty_cycle(state: &mut SequencerState, channels: &[ResolvedChannel]) {
    if state.duty_cycle_warned {
        return;
    }
    let on_time: Ticks = slots_of(channels, |f| f.is_twt()).map(Slot::len).sum();
    let budget = state.config.max_twt_duty_cycle * state.repeat_ticks() as f64;
    if on_time as f64 > budget {
        state.duty_cycle_warned = true;
        let max_duty = state.config.max_twt_duty_cycle;
        state.warnings.severe(WarningKey::new("duty-cycle", "twt"), || {
            format!(
                "TWT pulses are on for {on_time} ticks per shot, exceeding the maximum duty cycle of {max_duty}"
            )
        });
    }
}

/// Checks the shape/defense distances from the end of one shot to the start of the next.
///
/// If the wrap-around distance is too short, the sequence length of both functions is extended
/// as far as the pattern memory allows.
pub fn check_wrap_around(state: &mut SequencerState, channels: &[ResolvedChannel]) -> Result<()> {
    let shapes: Vec<&Slot> = slots_of(channels, |f| f == FunctionKind::PulseShape).collect();
    let defenses: Vec<&Slot> = slots_of(channels, |f| f == FunctionKind::Defense).collect();
    if shapes.is_empty() || defenses.is_empty() {
        return Ok(());
    }
    let first_pos = |slots: &[&Slot]| slots.iter().map(|s| s.pos).min().unwrap_or(0);
    let last_end = |slots: &[&Slot]| slots.iter().map(|s| s.end).max().unwrap_or(0);

    let pairs = [
        (
            last_end(&shapes),
            first_pos(&defenses),
            state.shape_to_defense.unwrap_or(0),
        ),
        (
            last_end(&defenses),
            first_pos(&shapes),
            state.defense_to_shape.unwrap_or(0),
        ),
    ];
    for (last, first, minimum) in pairs {
        let seq_len = state.sequence_length();
        let distance = seq_len - last + first;
        if distance >= minimum {
            continue;
        }
        let needed = seq_len + (minimum - distance);
        let max = state.config.max_pattern_length;
        if needed > max {
            return Err(ErrorKind::SequenceTooLong {
                function: FunctionKind::Defense,
                end: needed,
                max,
            }
            .into());
        }
        log::debug!("Extending the sequence to {needed} ticks for the shape/defense distance");
        for kind in [FunctionKind::PulseShape, FunctionKind::Defense] {
            state.registry.function_mut(kind).max_seq_len = needed;
        }
    }
    Ok(())
}

/// Runs all checks on a resolved shot.
pub fn check_shot(state: &mut SequencerState, channels: &mut [ResolvedChannel]) -> Result<()> {
    enforce_twt_distance(state, channels);
    check_shape_defense(state, channels)?;
    check_duty_cycle(state, channels);
    check_wrap_around(state, channels)
}
