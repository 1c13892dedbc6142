//! Arena of pulses, functions and channels.
//!
//! Cross references (pulse to function, pulse to companion, channel to function) are stored as
//! ids into the maps of the [`PulseRegistry`], never as references. Every mutation that touches
//! one side of a link goes through the registry so both sides stay consistent.

use indexmap::IndexMap;

use crate::channel::Channel;
use crate::error::{ErrorKind, Result};
use crate::function::{CompanionKind, Function, FunctionKind};
use crate::pulse::{Pulse, PulseId};
use crate::sequencer::RunMode;
use crate::timebase::Ticks;
use crate::utils::{WarningKey, WarningLog};

#[derive(Clone, Debug)]
pub struct PulseRegistry {
    pub pulses: IndexMap<PulseId, Pulse>,
    pub functions: IndexMap<FunctionKind, Function>,
    pub channels: Vec<Channel>,
    next_companion_id: PulseId,
}

impl PulseRegistry {
    pub fn new(num_channels: usize) -> Self {
        Self {
            pulses: IndexMap::new(),
            functions: FunctionKind::ALL
                .into_iter()
                .map(|kind| (kind, Function::new(kind)))
                .collect(),
            channels: (0..num_channels).map(Channel::new).collect(),
            next_companion_id: -1,
        }
    }

    pub fn pulse(&self, id: PulseId) -> Result<&Pulse> {
        Ok(self.pulses.get(&id).ok_or(ErrorKind::UnknownPulse(id))?)
    }

    // Companions are not addressable by the user
    fn user_pulse_mut(&mut self, id: PulseId) -> Result<&mut Pulse> {
        match self.pulses.get_mut(&id) {
            Some(pulse) if pulse.is_user() => Ok(pulse),
            _ => Err(ErrorKind::UnknownPulse(id).into()),
        }
    }

    pub fn function(&self, kind: FunctionKind) -> &Function {
        &self.functions[&kind]
    }

    pub fn function_mut(&mut self, kind: FunctionKind) -> &mut Function {
        &mut self.functions[&kind]
    }

    pub fn channel(&self, index: usize) -> Result<&Channel> {
        Ok(self
            .channels
            .get(index)
            .ok_or(ErrorKind::UnknownChannel(index))?)
    }

    pub fn user_pulse_ids(&self) -> Vec<PulseId> {
        self.pulses
            .values()
            .filter(|p| p.is_user())
            .map(|p| p.id)
            .collect()
    }

    pub fn create_pulse(&mut self, id: PulseId) -> Result<()> {
        if id <= 0 {
            return Err(ErrorKind::InvalidPulseId(id).into());
        }
        if self.pulses.contains_key(&id) {
            return Err(ErrorKind::DuplicatePulse(id).into());
        }
        self.pulses.insert(id, Pulse::new(id));
        Ok(())
    }

    pub fn set_function(&mut self, id: PulseId, kind: FunctionKind) -> Result<()> {
        let pulse = self.user_pulse_mut(id)?;
        if pulse.function.is_some() {
            return Err(ErrorKind::PulseAttributeAlreadySet {
                pulse: id,
                attribute: "function",
            }
            .into());
        }
        pulse.function = Some(kind);
        self.function_mut(kind).pulses.push(id);
        Ok(())
    }

    /// Sets the position: once during the declaration pass, freely afterwards.
    pub fn set_position(&mut self, id: PulseId, ticks: Ticks, mode: RunMode) -> Result<()> {
        let pulse = self.user_pulse_mut(id)?;
        match mode {
            RunMode::Preparation => pulse.declare_position(ticks)?,
            _ => pulse.change_position(ticks)?,
        }
        self.sync_companions(id);
        Ok(())
    }

    pub fn set_length(&mut self, id: PulseId, ticks: Ticks, mode: RunMode) -> Result<()> {
        let pulse = self.user_pulse_mut(id)?;
        match mode {
            RunMode::Preparation => pulse.declare_length(ticks)?,
            _ => pulse.change_length(ticks)?,
        }
        self.sync_companions(id);
        Ok(())
    }

    pub fn set_position_increment(&mut self, id: PulseId, ticks: Ticks) -> Result<()> {
        self.user_pulse_mut(id)?.declare_position_increment(ticks)?;
        self.sync_companions(id);
        Ok(())
    }

    pub fn set_length_increment(&mut self, id: PulseId, ticks: Ticks) -> Result<()> {
        self.user_pulse_mut(id)?.declare_length_increment(ticks)?;
        self.sync_companions(id);
        Ok(())
    }

    pub fn set_phase_cycle(&mut self, id: PulseId, sequence: usize) -> Result<()> {
        let pulse = self.user_pulse_mut(id)?;
        if pulse.phase_cycle.is_some() {
            return Err(ErrorKind::PulseAttributeAlreadySet {
                pulse: id,
                attribute: "phase cycle",
            }
            .into());
        }
        pulse.phase_cycle = Some(sequence);
        Ok(())
    }

    pub fn shift_by_increment(&mut self, id: PulseId) -> Result<()> {
        self.user_pulse_mut(id)?.shift_by_increment()?;
        self.sync_companions(id);
        Ok(())
    }

    pub fn increment_length(&mut self, id: PulseId) -> Result<()> {
        self.user_pulse_mut(id)?.increment_length()?;
        self.sync_companions(id);
        Ok(())
    }

    pub fn reset_to_initial(&mut self, id: PulseId) -> Result<()> {
        self.user_pulse_mut(id)?.reset_to_initial();
        self.sync_companions(id);
        Ok(())
    }

    pub fn reset_all_to_initial(&mut self) {
        for id in self.user_pulse_ids() {
            if let Some(pulse) = self.pulses.get_mut(&id) {
                pulse.reset_to_initial();
            }
            self.sync_companions(id);
        }
    }

    /// Copies the owner's timing and activity onto its auto-generated companions.
    pub fn sync_companions(&mut self, id: PulseId) {
        let Some(owner) = self.pulses.get(&id).cloned() else {
            return;
        };
        for companion in owner.companions() {
            if let Some(pulse) = self.pulses.get_mut(&companion) {
                if pulse.owner() == Some(id) {
                    pulse.mirror_from(&owner);
                }
            }
        }
    }

    /// Creates the `kind` companion of `owner` and links both ways.
    pub fn create_companion(&mut self, owner: PulseId, kind: CompanionKind) -> Result<PulseId> {
        let owner_pulse = self.pulse(owner)?;
        if let Some(existing) = owner_pulse.companion(kind) {
            return Ok(existing);
        }
        let id = self.next_companion_id;
        let companion = Pulse::new_companion(id, kind, owner_pulse);
        self.next_companion_id -= 1;

        self.pulses.insert(id, companion);
        self.function_mut(kind.target()).pulses.push(id);
        if let Some(owner_pulse) = self.pulses.get_mut(&owner) {
            *owner_pulse.companion_mut(kind) = Some(id);
        }
        Ok(id)
    }

    /// Deletes a pulse together with its auto-generated companions.
    ///
    /// References held by other pulses are detached. Warns if the deletion leaves its function
    /// without pulses.
    pub fn delete_pulse(&mut self, id: PulseId, warnings: &mut WarningLog) -> Result<()> {
        let pulse = self
            .pulses
            .shift_remove(&id)
            .ok_or(ErrorKind::UnknownPulse(id))?;

        if let Some(kind) = pulse.function {
            let function = self.function_mut(kind);
            function.pulses.retain(|&p| p != id);
            if !function.has_pulses() {
                warnings.warn(WarningKey::new("unused-function", kind), || {
                    format!("Function '{kind}' is not used anymore")
                });
            }
        }

        for companion in pulse.companions() {
            let is_owned = self
                .pulses
                .get(&companion)
                .map_or(false, |c| c.owner() == Some(id));
            if is_owned {
                self.delete_pulse(companion, warnings)?;
            } else if let Some(other) = self.pulses.get_mut(&companion) {
                if other.shape_companion == Some(id) {
                    other.shape_companion = None;
                }
                if other.twt_companion == Some(id) {
                    other.twt_companion = None;
                }
            }
        }

        if let Some(owner) = pulse.owner() {
            if let Some(owner) = self.pulses.get_mut(&owner) {
                if owner.shape_companion == Some(id) {
                    owner.shape_companion = None;
                }
                if owner.twt_companion == Some(id) {
                    owner.twt_companion = None;
                }
            }
        }
        Ok(())
    }

    pub fn assign_channel(&mut self, kind: FunctionKind, channel: usize) -> Result<()> {
        let current = self.channel(channel)?.function;
        match current {
            Some(owner) if owner == kind => return Ok(()),
            Some(owner) => return Err(ErrorKind::ChannelInUse { channel, owner }.into()),
            None => {}
        }
        let function = self.function_mut(kind);
        if let Some(max) = kind.max_channels() {
            if function.channels.len() >= max {
                return Err(ErrorKind::TooManyChannels {
                    function: kind,
                    max,
                }
                .into());
            }
        }
        function.channels.push(channel);
        function.is_declared = true;
        self.channels[channel].function = Some(kind);
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        self.pulses.values().any(Pulse::is_changed)
    }

    /// Restores every pulse to its last committed position and length.
    pub fn revert_uncommitted(&mut self) {
        self.pulses
            .values_mut()
            .for_each(Pulse::revert_to_committed);
    }

    pub fn mark_committed(&mut self) {
        self.pulses.values_mut().for_each(Pulse::mark_committed);
    }
}
