//! Logical pulses.
//!
//! User pulses carry positive numbers chosen by the user, companion pulses generated by the
//! compiler carry negative numbers. A companion always shares its owner's timing and activity;
//! the registry keeps both in sync through [`Pulse::mirror_from`].

use std::fmt;

use crate::error::{ErrorKind, Result};
use crate::function::{CompanionKind, FunctionKind};
use crate::timebase::Ticks;

pub type PulseId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PulseOrigin {
    User,
    Companion { kind: CompanionKind, owner: PulseId },
}

/// Position, length and their per-shot increments, all in ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timing {
    pub pos: Option<Ticks>,
    pub len: Option<Ticks>,
    pub dpos: Option<Ticks>,
    pub dlen: Option<Ticks>,
}

impl Timing {
    pub fn is_active(&self) -> bool {
        self.pos.is_some() && self.len.map_or(false, |len| len > 0)
    }
}

#[derive(Clone, Debug)]
pub struct Pulse {
    pub id: PulseId,
    pub origin: PulseOrigin,
    pub function: Option<FunctionKind>,
    pub timing: Timing,
    /// Values from the declaration pass, restored by [`Pulse::reset_to_initial`].
    pub initial: Timing,
    /// Position and length at the last commit, present while they have been changed since.
    old: Option<(Option<Ticks>, Option<Ticks>)>,
    /// Phase sequence the pulse cycles through.
    pub phase_cycle: Option<usize>,
    pub is_active: bool,
    pub has_been_active: bool,
    pub shape_companion: Option<PulseId>,
    pub twt_companion: Option<PulseId>,
}

impl Pulse {
    pub fn new(id: PulseId) -> Self {
        Self {
            id,
            origin: PulseOrigin::User,
            function: None,
            timing: Timing::default(),
            initial: Timing::default(),
            old: None,
            phase_cycle: None,
            is_active: false,
            has_been_active: false,
            shape_companion: None,
            twt_companion: None,
        }
    }

    /// Creates the companion of `owner`, placed on the function companions of `kind` live on.
    pub fn new_companion(id: PulseId, kind: CompanionKind, owner: &Pulse) -> Self {
        let mut pulse = Pulse::new(id);
        pulse.origin = PulseOrigin::Companion {
            kind,
            owner: owner.id,
        };
        pulse.function = Some(kind.target());
        pulse.initial = owner.initial;
        pulse.mirror_from(owner);
        pulse
    }

    pub fn is_user(&self) -> bool {
        self.origin == PulseOrigin::User
    }

    pub fn owner(&self) -> Option<PulseId> {
        match self.origin {
            PulseOrigin::User => None,
            PulseOrigin::Companion { owner, .. } => Some(owner),
        }
    }

    pub fn companion(&self, kind: CompanionKind) -> Option<PulseId> {
        match kind {
            CompanionKind::Shape => self.shape_companion,
            CompanionKind::Twt => self.twt_companion,
        }
    }

    pub fn companion_mut(&mut self, kind: CompanionKind) -> &mut Option<PulseId> {
        match kind {
            CompanionKind::Shape => &mut self.shape_companion,
            CompanionKind::Twt => &mut self.twt_companion,
        }
    }

    pub fn companions(&self) -> impl Iterator<Item = PulseId> {
        self.shape_companion.into_iter().chain(self.twt_companion)
    }

    pub fn refresh_activity(&mut self) {
        self.is_active = self.timing.is_active();
        self.has_been_active |= self.is_active;
    }

    /// Copies the owner's timing and activity.
    pub fn mirror_from(&mut self, owner: &Pulse) {
        self.timing = owner.timing;
        self.old = owner.old;
        self.is_active = owner.is_active;
        self.has_been_active = owner.has_been_active;
    }

    pub fn end(&self) -> Option<Ticks> {
        Some(self.timing.pos? + self.timing.len?)
    }

    // Declaration pass: every attribute can be set once and becomes the initial value

    pub fn declare_position(&mut self, ticks: Ticks) -> Result<()> {
        if self.timing.pos.is_some() {
            return Err(self.already_set("position"));
        }
        if ticks < 0 {
            return Err(ErrorKind::NegativePosition {
                pulse: self.id,
                ticks,
            }
            .into());
        }
        self.timing.pos = Some(ticks);
        self.initial.pos = Some(ticks);
        self.refresh_activity();
        Ok(())
    }

    pub fn declare_length(&mut self, ticks: Ticks) -> Result<()> {
        if self.timing.len.is_some() {
            return Err(self.already_set("length"));
        }
        if ticks < 0 {
            return Err(ErrorKind::NegativeLength {
                pulse: self.id,
                ticks,
            }
            .into());
        }
        self.timing.len = Some(ticks);
        self.initial.len = Some(ticks);
        self.refresh_activity();
        Ok(())
    }

    pub fn declare_position_increment(&mut self, ticks: Ticks) -> Result<()> {
        if self.timing.dpos.is_some() {
            return Err(self.already_set("position increment"));
        }
        self.timing.dpos = Some(ticks);
        self.initial.dpos = Some(ticks);
        Ok(())
    }

    pub fn declare_length_increment(&mut self, ticks: Ticks) -> Result<()> {
        if self.timing.dlen.is_some() {
            return Err(self.already_set("length increment"));
        }
        self.timing.dlen = Some(ticks);
        self.initial.dlen = Some(ticks);
        Ok(())
    }

    fn already_set(&self, attribute: &'static str) -> crate::error::SequencerError {
        ErrorKind::PulseAttributeAlreadySet {
            pulse: self.id,
            attribute,
        }
        .into()
    }

    // Run passes: values change freely, the committed ones are remembered until the next commit

    fn remember_committed(&mut self) {
        if self.old.is_none() {
            self.old = Some((self.timing.pos, self.timing.len));
        }
    }

    pub fn change_position(&mut self, ticks: Ticks) -> Result<()> {
        if ticks < 0 {
            return Err(ErrorKind::NegativePosition {
                pulse: self.id,
                ticks,
            }
            .into());
        }
        self.remember_committed();
        self.timing.pos = Some(ticks);
        self.refresh_activity();
        Ok(())
    }

    pub fn change_length(&mut self, ticks: Ticks) -> Result<()> {
        if ticks < 0 {
            return Err(ErrorKind::NegativeLength {
                pulse: self.id,
                ticks,
            }
            .into());
        }
        self.remember_committed();
        self.timing.len = Some(ticks);
        self.refresh_activity();
        Ok(())
    }

    pub fn shift_by_increment(&mut self) -> Result<()> {
        let dpos = self.timing.dpos.ok_or(ErrorKind::NoIncrement {
            pulse: self.id,
            attribute: "position",
        })?;
        let pos = self.timing.pos.ok_or(ErrorKind::MissingAttribute {
            pulse: self.id,
            attribute: "position",
        })?;
        self.change_position(pos + dpos)
    }

    pub fn increment_length(&mut self) -> Result<()> {
        let dlen = self.timing.dlen.ok_or(ErrorKind::NoIncrement {
            pulse: self.id,
            attribute: "length",
        })?;
        let len = self.timing.len.ok_or(ErrorKind::MissingAttribute {
            pulse: self.id,
            attribute: "length",
        })?;
        self.change_length(len + dlen)
    }

    pub fn reset_to_initial(&mut self) {
        if self.timing.pos != self.initial.pos || self.timing.len != self.initial.len {
            self.remember_committed();
        }
        self.timing = self.initial;
        self.refresh_activity();
    }

    pub fn is_changed(&self) -> bool {
        self.old.is_some()
    }

    /// Restores position and length to their values at the last commit.
    pub fn revert_to_committed(&mut self) {
        if let Some((pos, len)) = self.old.take() {
            self.timing.pos = pos;
            self.timing.len = len;
            self.is_active = self.timing.is_active();
        }
    }

    pub fn mark_committed(&mut self) {
        self.old = None;
    }
}

impl fmt::Display for Pulse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.origin {
            PulseOrigin::User => write!(f, "#{}", self.id),
            PulseOrigin::Companion { kind, owner } => {
                write!(f, "{kind} pulse #{} of #{owner}", self.id)
            }
        }
    }
}
