//! Generation of automatic shape and TWT companion pulses.

use crate::error::{ErrorKind, Result};
use crate::function::CompanionKind;
use crate::pulse::PulseId;
use crate::registry::PulseRegistry;

/// Creates the missing companions of every user pulse whose function requests them.
///
/// Companions are placed on the PULSE_SHAPE or TWT function, which must have a channel by then.
/// Returns the ids of the newly created companions.
pub fn generate_companions(registry: &mut PulseRegistry) -> Result<Vec<PulseId>> {
    let mut created = Vec::new();
    for kind in [CompanionKind::Shape, CompanionKind::Twt] {
        let owners: Vec<PulseId> = registry
            .pulses
            .values()
            .filter(|p| p.is_user() && p.companion(kind).is_none())
            .filter(|p| {
                p.function
                    .map_or(false, |f| registry.function(f).companion_request(kind).is_some())
            })
            .map(|p| p.id)
            .collect();
        if owners.is_empty() {
            continue;
        }
        if registry.function(kind.target()).channels.is_empty() {
            return Err(ErrorKind::MissingChannel(kind.target()).into());
        }
        for owner in owners {
            let id = registry.create_companion(owner, kind)?;
            log::debug!("Created {kind} pulse #{id} for pulse #{owner}");
            created.push(id);
        }
    }
    Ok(created)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::function::{AutoPadding, FunctionKind};
    use crate::sequencer::RunMode;

    #[test]
    fn companions_for_requesting_functions_only() {
        let mut reg = PulseRegistry::new(4);
        reg.assign_channel(FunctionKind::PulseShape, 0).unwrap();
        reg.function_mut(FunctionKind::Microwave).shape_request = Some(AutoPadding::default());
        for (id, kind) in [(1, FunctionKind::Microwave), (2, FunctionKind::Detection)] {
            reg.create_pulse(id).unwrap();
            reg.set_function(id, kind).unwrap();
            reg.set_position(id, 10, RunMode::Preparation).unwrap();
        }

        let created = generate_companions(&mut reg).unwrap();
        assert_eq!(created, vec![-1]);
        assert_eq!(reg.pulse(1).unwrap().shape_companion, Some(-1));
        assert_eq!(reg.pulse(-1).unwrap().timing.pos, Some(10));
        assert!(reg.pulse(2).unwrap().shape_companion.is_none());

        // A second pass creates nothing new
        assert!(generate_companions(&mut reg).unwrap().is_empty());
    }

    #[test]
    fn twt_companions_need_a_twt_channel() {
        let mut reg = PulseRegistry::new(4);
        reg.function_mut(FunctionKind::Microwave).twt_request = Some(AutoPadding::default());
        reg.create_pulse(1).unwrap();
        reg.set_function(1, FunctionKind::Microwave).unwrap();
        assert_eq!(
            generate_companions(&mut reg).unwrap_err().kind(),
            &ErrorKind::MissingChannel(FunctionKind::Twt)
        );
    }
}
