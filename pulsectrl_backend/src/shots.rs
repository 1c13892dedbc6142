//! Repeated shots with per-shot pulse changes.

use pulsecompiler_backend::error::{ErrorKind, Result};
use pulsecompiler_backend::BaseExperiment;

/// The changes applied before every shot.
#[derive(Clone, Debug, Default)]
pub struct ShotPlan {
    pub shots: usize,
    pub shift_positions: bool,
    pub increment_lengths: bool,
    pub advance_phase: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShotSummary {
    /// Shots whose update went through.
    pub completed: usize,
    /// Channel writes over all shots.
    pub channel_writes: usize,
    pub aborted: bool,
}

/// Applies the planned changes and updates, once per shot.
///
/// `between_shots` runs after every successful update; returning an error stops the loop. An
/// abort ends the loop early with [`ShotSummary::aborted`] set, after the aborted shot was rolled
/// back. Every other error is returned.
pub fn run_shots<E, F>(exp: &mut E, plan: &ShotPlan, mut between_shots: F) -> Result<ShotSummary>
where
    E: BaseExperiment + ?Sized,
    F: FnMut(usize) -> Result<()>,
{
    let mut summary = ShotSummary::default();
    for shot in 0..plan.shots {
        if plan.shift_positions {
            exp.shift_by_increment(None)?;
        }
        if plan.increment_lengths {
            exp.increment_length(None)?;
        }
        if plan.advance_phase {
            exp.advance_phase()?;
        }
        match exp.update() {
            Ok(report) => {
                summary.completed += 1;
                summary.channel_writes += report.updated_channels.len();
            }
            Err(err) if err.kind() == &ErrorKind::Aborted => {
                log::info!("Aborted before shot {shot}");
                summary.aborted = true;
                break;
            }
            Err(err) => return Err(err),
        }
        between_shots(shot)?;
    }
    log::debug!("Shot loop finished: {summary:?}");
    Ok(summary)
}
