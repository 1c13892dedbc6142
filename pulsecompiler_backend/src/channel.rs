use crate::function::FunctionKind;
use crate::pulse::PulseId;
use crate::timebase::Ticks;

/// One resolved pulse on a channel: start and length in ticks plus the pulse it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseParams {
    pub pos: Ticks,
    pub len: Ticks,
    pub pulse: PulseId,
}

impl PulseParams {
    pub fn end(&self) -> Ticks {
        self.pos + self.len
    }
}

// Resolved pulses of one channel, sorted by start
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pattern(pub Vec<PulseParams>);

impl Pattern {
    // Two patterns produce the same output if counts and all (start, length) pairs agree;
    // which pulse a pair came from does not matter to the device
    pub fn same_timing(&self, other: &Pattern) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.pos == b.pos && a.len == b.len)
    }

    pub fn pairs(&self) -> Vec<(Ticks, Ticks)> {
        self.0.iter().map(|p| (p.pos, p.len)).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn end(&self) -> Ticks {
        self.0.iter().map(PulseParams::end).max().unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Committed<T>(pub T);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pending<T>(pub T);

/// Last committed pattern of a channel and the pattern staged for the next commit.
#[derive(Clone, Debug, Default)]
pub struct CommitSlot {
    committed: Committed<Pattern>,
    pending: Option<Pending<Pattern>>,
    // Set until the first commit after a reset, so the device gets rewritten even if empty
    stale: bool,
}

impl CommitSlot {
    pub fn committed(&self) -> &Pattern {
        &self.committed.0
    }

    pub fn pending(&self) -> Option<&Pattern> {
        self.pending.as_ref().map(|p| &p.0)
    }

    pub fn stage(&mut self, pattern: Pattern) {
        self.pending = Some(Pending(pattern));
    }

    pub fn needs_update(&self) -> bool {
        match &self.pending {
            Some(Pending(pattern)) => self.stale || !pattern.same_timing(&self.committed.0),
            None => false,
        }
    }

    /// Makes the staged pattern the committed one if it differs.
    ///
    /// Returns the previously committed pattern when a swap took place, so the caller can
    /// [`restore`] it if writing the new one fails.
    ///
    /// [`restore`]: CommitSlot::restore
    pub fn diff_and_swap(&mut self) -> Option<Committed<Pattern>> {
        let needs_update = self.needs_update();
        let Pending(pattern) = self.pending.take()?;
        if !needs_update {
            return None;
        }
        self.stale = false;
        Some(std::mem::replace(&mut self.committed, Committed(pattern)))
    }

    pub fn restore(&mut self, previous: Committed<Pattern>, was_stale: bool) {
        self.committed = previous;
        self.stale = was_stale;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Forgets the committed pattern; the next commit rewrites the channel.
    pub fn reset(&mut self) {
        self.committed = Committed::default();
        self.pending = None;
        self.stale = true;
    }
}

/// A physical output line.
#[derive(Clone, Debug)]
pub struct Channel {
    pub index: usize,
    pub function: Option<FunctionKind>,
    pub slot: CommitSlot,
}

impl Channel {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            function: None,
            slot: CommitSlot::default(),
        }
    }

    pub fn active_pulses(&self) -> usize {
        self.slot.committed().len()
    }
}
