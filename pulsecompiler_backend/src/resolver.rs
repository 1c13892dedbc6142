//! Per-channel resolution of the current phase step.
//!
//! For every channel the active pulses of its phase-matrix cell are turned into [`Slot`]s (the
//! function delay added, companions widened by their owner function's padding), sorted by start
//! and then made non-overlapping:
//!
//! - user pulses are never modified; any conflict involving only user pulses is an error,
//! - companions are clamped at both ends of the pattern and shrunk or dropped on overlap,
//!   and every shrink lowers the owner function's minimum achievable padding.
//!
//! Afterwards no two slots on a channel overlap and every slot lies within
//! `0..max_pattern_length`.

use crate::channel::{Pattern, PulseParams};
use crate::error::{ErrorKind, Result};
use crate::function::{CompanionKind, Function, FunctionKind, Padding};
use crate::phase::PhaseMatrix;
use crate::pulse::{PulseId, PulseOrigin};
use crate::registry::PulseRegistry;
use crate::sequencer::SequencerState;
use crate::timebase::Ticks;
use crate::utils::WarningKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    User,
    Companion(CompanionKind),
}

/// A pulse placed on a channel. `body` is the owner's interval, `pos..end` includes padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub pulse: PulseId,
    pub kind: SlotKind,
    /// The pulse itself for user pulses.
    pub owner: PulseId,
    pub owner_function: FunctionKind,
    pub body_pos: Ticks,
    pub body_end: Ticks,
    pub pos: Ticks,
    pub end: Ticks,
}

impl Slot {
    pub fn is_user(&self) -> bool {
        self.kind == SlotKind::User
    }

    pub fn is_companion(&self, kind: CompanionKind) -> bool {
        self.kind == SlotKind::Companion(kind)
    }

    pub fn len(&self) -> Ticks {
        self.end - self.pos
    }

    fn padding(&self) -> Padding {
        Padding::new(self.body_pos - self.pos, self.end - self.body_end)
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedChannel {
    pub index: usize,
    pub function: FunctionKind,
    pub slots: Vec<Slot>,
}

impl ResolvedChannel {
    pub fn pattern(&self) -> Pattern {
        Pattern(
            self.slots
                .iter()
                .map(|s| PulseParams {
                    pos: s.pos,
                    len: s.len(),
                    pulse: s.pulse,
                })
                .collect(),
        )
    }

    pub fn end(&self) -> Ticks {
        self.slots.iter().map(|s| s.end).max().unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// A companion whose padding had to be reduced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaddingEvent {
    pub owner: PulseId,
    pub owner_function: FunctionKind,
    pub kind: CompanionKind,
    pub side: Side,
    pub achieved: Padding,
}

impl PaddingEvent {
    fn of(slot: &Slot, side: Side) -> Option<Self> {
        match slot.kind {
            SlotKind::Companion(kind) => Some(Self {
                owner: slot.owner,
                owner_function: slot.owner_function,
                kind,
                side,
                achieved: slot.padding(),
            }),
            SlotKind::User => None,
        }
    }
}

fn collect_slots(
    registry: &PulseRegistry,
    function: &Function,
    ids: &[PulseId],
) -> Result<Vec<Slot>> {
    let mut slots = Vec::with_capacity(ids.len());
    for &id in ids {
        let pulse = registry.pulse(id)?;
        if !pulse.is_active {
            continue;
        }
        let (Some(pos), Some(len)) = (pulse.timing.pos, pulse.timing.len) else {
            continue;
        };
        let body_pos = pos + function.delay;
        let body_end = body_pos + len;
        let slot = match pulse.origin {
            PulseOrigin::User => Slot {
                pulse: id,
                kind: SlotKind::User,
                owner: id,
                owner_function: function.kind,
                body_pos,
                body_end,
                pos: body_pos,
                end: body_end,
            },
            PulseOrigin::Companion { kind, owner } => {
                let owner_function = registry
                    .pulse(owner)?
                    .function
                    .ok_or(ErrorKind::MissingFunction(owner))?;
                let padding = registry.function(owner_function).padding(kind);
                Slot {
                    pulse: id,
                    kind: SlotKind::Companion(kind),
                    owner,
                    owner_function,
                    body_pos,
                    body_end,
                    pos: body_pos - padding.left,
                    end: body_end + padding.right,
                }
            }
        };
        slots.push(slot);
    }
    Ok(slots)
}

enum Fix {
    DropFirst,
    DropSecond,
    /// New bounds of both slots.
    Trim { first: (Ticks, Ticks), second: (Ticks, Ticks) },
}

/// Decides how two overlapping slots (`a` starting first) are separated.
fn separate(a: &Slot, b: &Slot) -> Result<Fix> {
    let shape = a.is_companion(CompanionKind::Shape) || b.is_companion(CompanionKind::Shape);
    let twt = a.is_companion(CompanionKind::Twt) || b.is_companion(CompanionKind::Twt);

    if a.is_user() && b.is_user() {
        return Err(ErrorKind::PulseOverlap {
            first: a.pulse,
            second: b.pulse,
        }
        .into());
    }

    if shape {
        if a.is_user() || b.is_user() || a.owner_function != b.owner_function {
            return Err(ErrorKind::ShapePulseOverlap {
                first: a.owner,
                second: b.owner,
            }
            .into());
        }
        // Same owner function: only the paddings may be given up
        let swapped = a.body_pos > b.body_pos;
        let (first, second) = if swapped { (b, a) } else { (a, b) };
        if first.body_end > second.body_pos {
            return Err(ErrorKind::PulseOverlap {
                first: first.owner,
                second: second.owner,
            }
            .into());
        }
        let boundary = first.body_end.max(second.pos).min(second.body_pos);
        let first_bounds = (first.pos, first.end.min(boundary));
        let second_bounds = (second.pos.max(boundary), second.end);
        return Ok(if swapped {
            Fix::Trim {
                first: second_bounds,
                second: first_bounds,
            }
        } else {
            Fix::Trim {
                first: first_bounds,
                second: second_bounds,
            }
        });
    }

    if twt {
        // A contained pulse drops the companion, user pulses are kept
        if b.end <= a.end {
            return Ok(if b.is_user() {
                Fix::DropFirst
            } else {
                Fix::DropSecond
            });
        }
        // Truncate the earlier companion, or start the later one where the user pulse ends
        return Ok(if !a.is_user() {
            Fix::Trim {
                first: (a.pos, b.pos),
                second: (b.pos, b.end),
            }
        } else {
            Fix::Trim {
                first: (a.pos, a.end),
                second: (a.end, b.end),
            }
        });
    }

    Err(ErrorKind::PulseOverlap {
        first: a.owner,
        second: b.owner,
    }
    .into())
}

fn apply_bounds(slot: &mut Slot, (pos, end): (Ticks, Ticks), events: &mut Vec<PaddingEvent>) {
    if pos != slot.pos {
        slot.pos = pos;
        events.extend(PaddingEvent::of(slot, Side::Left));
    }
    if end != slot.end {
        slot.end = end;
        events.extend(PaddingEvent::of(slot, Side::Right));
    }
}

/// Makes the slots of one channel non-overlapping and clamps them to the pattern.
pub fn resolve_channel(
    channel: usize,
    function: FunctionKind,
    mut slots: Vec<Slot>,
    max_len: Ticks,
    events: &mut Vec<PaddingEvent>,
) -> Result<Vec<Slot>> {
    let order = |s: &Slot| (s.pos, s.pulse);
    slots.sort_by_key(order);

    for slot in slots.iter_mut().filter(|s| s.pos < 0) {
        if slot.is_user() {
            return Err(ErrorKind::NegativeStart {
                pulse: slot.pulse,
                function,
            }
            .into());
        }
        slot.pos = 0;
        events.extend(PaddingEvent::of(slot, Side::Left));
    }
    slots.retain(|s| s.end > s.pos);

    let max_passes = 2 * slots.len() + 2;
    let mut passes = 0;
    loop {
        slots.sort_by_key(order);
        let mut changed = false;
        let mut i = 0;
        while i + 1 < slots.len() {
            let (a, b) = (slots[i], slots[i + 1]);
            if a.end <= b.pos {
                i += 1;
                continue;
            }
            changed = true;
            match separate(&a, &b)? {
                Fix::DropFirst => {
                    slots.remove(i);
                }
                Fix::DropSecond => {
                    slots.remove(i + 1);
                }
                Fix::Trim { first, second } => {
                    apply_bounds(&mut slots[i], first, events);
                    apply_bounds(&mut slots[i + 1], second, events);
                    slots.retain(|s| s.end > s.pos);
                    i += 1;
                }
            }
        }
        if !changed {
            break;
        }
        passes += 1;
        if passes > max_passes {
            return Err(ErrorKind::ResolutionDiverged(channel).into());
        }
    }

    for slot in slots.iter_mut().filter(|s| s.end > max_len) {
        if slot.is_user() {
            return Err(ErrorKind::SequenceTooLong {
                function,
                end: slot.end,
                max: max_len,
            }
            .into());
        }
        slot.end = max_len;
        events.extend(PaddingEvent::of(slot, Side::Right));
    }
    slots.retain(|s| s.end > s.pos);
    Ok(slots)
}

/// Active user pulses of one function must not overlap, whichever channels they end up on.
fn check_user_overlaps(registry: &PulseRegistry) -> Result<()> {
    for function in registry.functions.values() {
        let mut intervals: Vec<(Ticks, Ticks, PulseId)> = function
            .pulses
            .iter()
            .filter_map(|id| registry.pulses.get(id))
            .filter(|p| p.is_user() && p.is_active)
            .filter_map(|p| Some((p.timing.pos?, p.end()?, p.id)))
            .collect();
        intervals.sort();
        for pair in intervals.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(ErrorKind::PulseOverlap {
                    first: pair[0].2,
                    second: pair[1].2,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Shape pulses of different owner functions must not overlap on any PULSE_SHAPE channel.
fn check_shape_overlaps(channels: &[ResolvedChannel]) -> Result<()> {
    let mut shapes: Vec<&Slot> = channels
        .iter()
        .filter(|c| c.function == FunctionKind::PulseShape)
        .flat_map(|c| c.slots.iter())
        .collect();
    shapes.sort_by_key(|s| (s.pos, s.pulse));
    for (i, a) in shapes.iter().enumerate() {
        for b in shapes[i + 1..].iter().take_while(|b| b.pos < a.end) {
            if a.is_user() || b.is_user() || a.owner_function != b.owner_function {
                return Err(ErrorKind::ShapePulseOverlap {
                    first: a.owner,
                    second: b.owner,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Resolves every assigned channel for the current phase step.
///
/// Lowers the functions' minimum paddings, logs a rate-limited warning for each reduced padding
/// and extends the functions' maximum sequence lengths.
pub fn resolve(state: &mut SequencerState) -> Result<Vec<ResolvedChannel>> {
    let registry = &state.registry;
    check_user_overlaps(registry)?;

    let cycle_len = state.cycle_len();
    let step = state.current_phase;
    let max_len = state.config.max_pattern_length;
    let max_pulses = state.config.max_pulses_per_channel;
    let mut resolved = Vec::new();
    let mut events = Vec::new();

    for function in registry.functions.values().filter(|f| !f.channels.is_empty()) {
        let matrix = PhaseMatrix::build(function, &registry.pulses, &state.phase_sequences, cycle_len)?;
        for &channel in &function.channels {
            let slots = collect_slots(registry, function, matrix.cell(step, channel))?;
            let slots = resolve_channel(channel, function.kind, slots, max_len, &mut events)?;
            if slots.len() > max_pulses {
                return Err(ErrorKind::TooManyPulses {
                    function: function.kind,
                    channel,
                    count: slots.len(),
                    max: max_pulses,
                }
                .into());
            }
            resolved.push(ResolvedChannel {
                index: channel,
                function: function.kind,
                slots,
            });
        }
    }
    check_shape_overlaps(&resolved)?;

    for event in events {
        state
            .registry
            .function_mut(event.owner_function)
            .record_padding(event.kind, event.achieved);
        let side = match event.side {
            Side::Left => "Left",
            Side::Right => "Right",
        };
        let key = WarningKey::new(&format!("padding-{side}-{}", event.kind), event.owner);
        state.warnings.warn(key, || {
            let ticks = match event.side {
                Side::Left => event.achieved.left,
                Side::Right => event.achieved.right,
            };
            format!(
                "{side} padding of {} pulse for pulse #{} had to be reduced to {} ticks",
                event.kind,
                event.owner,
                ticks.max(0)
            )
        });
    }
    for channel in &resolved {
        let function = state.registry.function_mut(channel.function);
        function.max_seq_len = function.max_seq_len.max(channel.end());
    }
    Ok(resolved)
}

#[cfg(test)]
mod test {
    use super::*;

    fn user(pulse: PulseId, pos: Ticks, end: Ticks) -> Slot {
        Slot {
            pulse,
            kind: SlotKind::User,
            owner: pulse,
            owner_function: FunctionKind::Defense,
            body_pos: pos,
            body_end: end,
            pos,
            end,
        }
    }

    fn companion(
        pulse: PulseId,
        kind: CompanionKind,
        owner: PulseId,
        owner_function: FunctionKind,
        body: (Ticks, Ticks),
        padding: Ticks,
    ) -> Slot {
        Slot {
            pulse,
            kind: SlotKind::Companion(kind),
            owner,
            owner_function,
            body_pos: body.0,
            body_end: body.1,
            pos: body.0 - padding,
            end: body.1 + padding,
        }
    }

    fn no_overlaps(slots: &[Slot]) -> bool {
        slots.windows(2).all(|w| w[0].end <= w[1].pos)
    }

    #[test]
    fn user_overlap_is_fatal() {
        let mut events = Vec::new();
        let err = resolve_channel(
            2,
            FunctionKind::Defense,
            vec![user(2, 5, 15), user(1, 0, 10)],
            1000,
            &mut events,
        )
        .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::PulseOverlap {
                first: 1,
                second: 2
            }
        );
    }

    #[test]
    fn left_padding_is_clamped_at_zero() {
        let mut events = Vec::new();
        let shape = companion(-1, CompanionKind::Shape, 1, FunctionKind::Microwave, (2, 10), 3);
        let slots = resolve_channel(0, FunctionKind::PulseShape, vec![shape], 1000, &mut events)
            .unwrap();
        assert_eq!((slots[0].pos, slots[0].end), (0, 13));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].achieved, Padding::new(2, 3));

        let err = resolve_channel(0, FunctionKind::Defense, vec![user(1, -1, 4)], 1000, &mut events)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NegativeStart { pulse: 1, .. }));
    }

    #[test]
    fn shape_paddings_of_one_function_are_shared() {
        let mw = FunctionKind::Microwave;
        let a = companion(-1, CompanionKind::Shape, 1, mw, (10, 20), 4);
        let b = companion(-2, CompanionKind::Shape, 2, mw, (22, 30), 4);
        let mut events = Vec::new();
        let slots =
            resolve_channel(0, FunctionKind::PulseShape, vec![a, b], 1000, &mut events).unwrap();
        assert!(no_overlaps(&slots));
        assert_eq!((slots[0].pos, slots[0].end), (6, 20));
        assert_eq!((slots[1].pos, slots[1].end), (20, 34));

        // Overlapping owners are reported as such
        let c = companion(-3, CompanionKind::Shape, 3, mw, (15, 25), 4);
        let err = resolve_channel(0, FunctionKind::PulseShape, vec![a, c], 1000, &mut events)
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::PulseOverlap {
                first: 1,
                second: 3
            }
        );

        // Shapes of different functions must never touch
        let d = companion(-4, CompanionKind::Shape, 4, FunctionKind::Rf, (22, 30), 4);
        let err = resolve_channel(0, FunctionKind::PulseShape, vec![a, d], 1000, &mut events)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ShapePulseOverlap { .. }));
    }

    #[test]
    fn twt_companions_are_merged() {
        let mw = FunctionKind::Microwave;
        let a = companion(-1, CompanionKind::Twt, 1, mw, (100, 120), 50);
        let b = companion(-2, CompanionKind::Twt, 2, mw, (130, 140), 50);
        let inner = companion(-3, CompanionKind::Twt, 3, mw, (105, 110), 5);
        let mut events = Vec::new();
        let slots =
            resolve_channel(0, FunctionKind::Twt, vec![a, b, inner], 1000, &mut events).unwrap();
        assert!(no_overlaps(&slots));
        assert_eq!(slots.len(), 2);
        assert_eq!((slots[0].pos, slots[0].end), (50, 80));
        assert_eq!((slots[1].pos, slots[1].end), (80, 190));
    }

    #[test]
    fn companion_around_user_twt_pulse_is_dropped() {
        let around = companion(-1, CompanionKind::Twt, 1, FunctionKind::Microwave, (40, 60), 40);
        let mut events = Vec::new();
        let slots =
            resolve_channel(0, FunctionKind::Twt, vec![around, user(2, 10, 50)], 1000, &mut events)
                .unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!((slots[0].pulse, slots[0].pos, slots[0].end), (2, 10, 50));
        assert!(events.is_empty());
    }

    #[test]
    fn companion_inside_user_twt_pulse_is_dropped() {
        let mw = FunctionKind::Microwave;
        let inside = companion(-1, CompanionKind::Twt, 1, mw, (40, 60), 10);
        // Same start as the user pulse, sorted first because of its negative id
        let flush = companion(-3, CompanionKind::Twt, 3, mw, (10, 20), 10);
        let mut events = Vec::new();
        let slots = resolve_channel(
            0,
            FunctionKind::Twt,
            vec![user(2, 0, 100), inside, flush],
            1000,
            &mut events,
        )
        .unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!((slots[0].pulse, slots[0].pos, slots[0].end), (2, 0, 100));
    }

    #[test]
    fn companion_after_user_twt_pulse_starts_at_its_end() {
        let after = companion(-1, CompanionKind::Twt, 1, FunctionKind::Microwave, (60, 80), 20);
        let mut events = Vec::new();
        let slots =
            resolve_channel(0, FunctionKind::Twt, vec![user(2, 0, 50), after], 1000, &mut events)
                .unwrap();
        assert!(no_overlaps(&slots));
        assert_eq!((slots[0].pos, slots[0].end), (0, 50));
        assert_eq!((slots[1].pulse, slots[1].pos, slots[1].end), (-1, 50, 100));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].side, Side::Left);
        assert_eq!(events[0].achieved, Padding::new(10, 20));
    }

    #[test]
    fn end_of_pattern() {
        let mut events = Vec::new();
        let twt = companion(-1, CompanionKind::Twt, 1, FunctionKind::Microwave, (90, 98), 5);
        let slots = resolve_channel(0, FunctionKind::Twt, vec![twt], 100, &mut events).unwrap();
        assert_eq!(slots[0].end, 100);
        let err = resolve_channel(0, FunctionKind::Defense, vec![user(1, 90, 101)], 100, &mut events)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SequenceTooLong { end: 101, .. }));
    }
}
