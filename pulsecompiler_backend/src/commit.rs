//! The commit engine: compiles the current shot and pushes the channels that changed.
//!
//! Every update runs `Idle -> Validating -> Committing -> Idle`. Validation resolves and checks
//! the whole shot before anything is written, so a rejected shot never reaches the device. During
//! a live run a failed update is rolled back: channels swapped in this cycle get their previous
//! pattern back (and are marked for rewriting, the device may already hold the new one), pulses
//! return to their committed positions and lengths, the sequence length is reset to its value
//! before the cycle, and the error is returned as
//! [`SequencerError::Recoverable`] where the error kind allows it.
//!
//! [`SequencerError::Recoverable`]: crate::error::SequencerError::Recoverable

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::{Committed, Pattern};
use crate::constraints::check_shot;
use crate::error::{ErrorKind, Result};
use crate::resolver::{resolve, ResolvedChannel};
use crate::sequencer::{RunMode, SequencerState};
use crate::timebase::Ticks;

pub type WriteResult = std::result::Result<(), Box<dyn Error + Send + Sync>>;

/// The device side of a commit.
///
/// Implementations may block on I/O; timeouts and retries are theirs to handle.
pub trait ChannelWriter {
    /// Replaces the pattern of `channel` by `pulses`, given as (start, length) pairs in ticks.
    fn write_channel(&mut self, channel: usize, pulses: &[(Ticks, Ticks)]) -> WriteResult;
    fn set_running(&mut self, running: bool) -> WriteResult;
    /// Sends a vendor command unchanged.
    fn send_raw(&mut self, command: &str) -> WriteResult;
}

/// Cancellation request shared with the caller, checked before every channel write.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    Validating,
    Committing,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Channels whose pattern changed, in ascending order.
    pub updated_channels: Vec<usize>,
}

struct Swapped {
    channel: usize,
    previous: Committed<Pattern>,
    was_stale: bool,
}

impl SequencerState {
    /// Resolves and checks the current shot without staging anything.
    pub fn compile_shot(&mut self) -> Result<Vec<ResolvedChannel>> {
        let mut channels = resolve(self)?;
        check_shot(self, &mut channels)?;
        Ok(channels)
    }

    /// Runs one update cycle.
    ///
    /// In test mode the changed channels are only recorded; in experiment mode they are written
    /// through `writer`, if one is given.
    pub fn commit(&mut self, writer: Option<&mut dyn ChannelWriter>) -> Result<CommitReport> {
        self.require_mode("update", &[RunMode::Test, RunMode::Experiment])?;
        let seq_lens: Vec<Ticks> = self
            .registry
            .functions
            .values()
            .map(|f| f.max_seq_len)
            .collect();
        let mut swapped = Vec::new();
        let result = self.run_cycle(writer, &mut swapped);
        self.commit_phase = CommitPhase::Idle;
        for channel in self.registry.channels.iter_mut() {
            channel.slot.discard_pending();
        }

        match result {
            Ok(report) => {
                self.registry.mark_committed();
                self.committed_phase = self.current_phase;
                if !report.updated_channels.is_empty() {
                    log::debug!("Updated channels {:?}", report.updated_channels);
                }
                Ok(report)
            }
            Err(err) => {
                let live = self.mode == RunMode::Experiment;
                for Swapped {
                    channel,
                    previous,
                    was_stale,
                } in swapped.into_iter().rev()
                {
                    self.registry.channels[channel]
                        .slot
                        .restore(previous, was_stale || live);
                }
                for (function, len) in self.registry.functions.values_mut().zip(seq_lens) {
                    function.max_seq_len = len;
                }
                if live {
                    self.registry.revert_uncommitted();
                    self.current_phase = self.committed_phase;
                }
                let err = err.for_mode(self.mode);
                if err.is_fatal() {
                    log::error!("Update failed: {err}");
                } else {
                    log::warn!("Update failed: {err}");
                }
                Err(err)
            }
        }
    }

    fn run_cycle(
        &mut self,
        mut writer: Option<&mut dyn ChannelWriter>,
        swapped: &mut Vec<Swapped>,
    ) -> Result<CommitReport> {
        self.commit_phase = CommitPhase::Validating;
        let resolved = self.compile_shot()?;
        for channel in &resolved {
            self.registry.channels[channel.index]
                .slot
                .stage(channel.pattern());
        }
        let changed: Vec<usize> = self
            .registry
            .channels
            .iter()
            .filter(|c| c.slot.needs_update())
            .map(|c| c.index)
            .collect();
        self.needs_update = !changed.is_empty();

        self.commit_phase = CommitPhase::Committing;
        let live = self.mode == RunMode::Experiment;
        for &index in &changed {
            if live && self.abort.is_requested() {
                self.abort.clear();
                return Err(ErrorKind::Aborted.into());
            }
            let slot = &mut self.registry.channels[index].slot;
            let was_stale = slot.is_stale();
            let Some(previous) = slot.diff_and_swap() else {
                continue;
            };
            let pairs = slot.committed().pairs();
            swapped.push(Swapped {
                channel: index,
                previous,
                was_stale,
            });
            if let (true, Some(writer)) = (live, writer.as_mut()) {
                writer
                    .write_channel(index, &pairs)
                    .map_err(|e| ErrorKind::Device(format!("channel {index}: {e}")))?;
            }
        }
        Ok(CommitReport {
            updated_channels: changed,
        })
    }
}
