//! Phase cycling.
//!
//! A phase-cycled pulse names a [`PhaseSequence`]; at phase step `i` it is emitted on the channel
//! its function's [`PhaseSetup`] maps to the `i`-th phase type of the sequence. The
//! [`PhaseMatrix`] of a function lists, for every step and every channel of the function, the
//! pulses emitted there.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use indexmap::IndexMap;
use ndarray::Array2;
use regex::Regex;

use crate::error::{ErrorKind, Result, SequencerError};
use crate::function::Function;
use crate::pulse::{Pulse, PulseId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseType {
    PlusX,
    MinusX,
    PlusY,
    MinusY,
}

impl PhaseType {
    pub const ALL: [PhaseType; 4] = [
        PhaseType::PlusX,
        PhaseType::MinusX,
        PhaseType::PlusY,
        PhaseType::MinusY,
    ];

    fn index(&self) -> usize {
        match self {
            PhaseType::PlusX => 0,
            PhaseType::MinusX => 1,
            PhaseType::PlusY => 2,
            PhaseType::MinusY => 3,
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PhaseType::PlusX => "+X",
            PhaseType::MinusX => "-X",
            PhaseType::PlusY => "+Y",
            PhaseType::MinusY => "-Y",
        };
        write!(f, "{name}")
    }
}

fn phase_regex() -> &'static Regex {
    static PHASE: OnceLock<Regex> = OnceLock::new();
    PHASE.get_or_init(|| Regex::new(r"^\s*(?P<sign>[+-]?)\s*(?P<axis>[xXyY])\s*$").unwrap())
}

impl FromStr for PhaseType {
    type Err = SequencerError;

    /// Accepts `+X`, `-X`, `+Y`, `-Y` in either case, a missing sign meaning `+`.
    fn from_str(s: &str) -> Result<Self> {
        let caps = phase_regex()
            .captures(s)
            .ok_or_else(|| ErrorKind::UnknownPhaseType(s.to_string()))?;
        let minus = &caps["sign"] == "-";
        let phase = match (&caps["axis"], minus) {
            ("x" | "X", false) => PhaseType::PlusX,
            ("x" | "X", true) => PhaseType::MinusX,
            (_, false) => PhaseType::PlusY,
            (_, true) => PhaseType::MinusY,
        };
        Ok(phase)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhaseSequence {
    pub id: usize,
    pub phases: Vec<PhaseType>,
}

impl PhaseSequence {
    pub fn phase_at(&self, step: usize) -> PhaseType {
        self.phases[step % self.phases.len()]
    }
}

/// Channel of a function carrying each phase type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseSetup {
    channels: [Option<usize>; 4],
}

impl PhaseSetup {
    pub fn assign(&mut self, phase: PhaseType, channel: usize) -> Result<()> {
        let slot = &mut self.channels[phase.index()];
        match *slot {
            Some(current) if current != channel => {
                Err(ErrorKind::SettingAlreadySet("phase setup channel").into())
            }
            _ => {
                *slot = Some(channel);
                Ok(())
            }
        }
    }

    pub fn channel_for(&self, phase: PhaseType) -> Option<usize> {
        self.channels[phase.index()]
    }

    pub fn mapped(&self) -> impl Iterator<Item = (PhaseType, usize)> + '_ {
        PhaseType::ALL
            .into_iter()
            .filter_map(|phase| self.channel_for(phase).map(|c| (phase, c)))
    }
}

/// Pulses per (phase step, channel) of one function. Columns follow the function's channel order.
#[derive(Clone, Debug)]
pub struct PhaseMatrix {
    pub channels: Vec<usize>,
    pub cells: Array2<Vec<PulseId>>,
}

impl PhaseMatrix {
    /// Builds the matrix for `function` over `cycle_len` phase steps.
    pub fn build(
        function: &Function,
        pulses: &IndexMap<PulseId, Pulse>,
        sequences: &IndexMap<usize, PhaseSequence>,
        cycle_len: usize,
    ) -> Result<Self> {
        let rows = cycle_len.max(1);
        let mut cells = Array2::from_elem((rows, function.channels.len()), Vec::new());

        let column_of = |pulse: PulseId, channel: Option<usize>, phase: PhaseType| {
            channel
                .and_then(|c| function.channel_column(c))
                .ok_or(ErrorKind::UnmappedPhaseType {
                    pulse,
                    function: function.kind,
                    phase,
                })
        };

        for &id in &function.pulses {
            let pulse = pulses.get(&id).ok_or(ErrorKind::UnknownPulse(id))?;
            match (pulse.phase_cycle, &function.phase_setup) {
                (None, Some(setup)) => {
                    let col = column_of(id, setup.channel_for(PhaseType::PlusX), PhaseType::PlusX)?;
                    cells.column_mut(col).iter_mut().for_each(|cell| cell.push(id));
                }
                (None, None) => {
                    let col = match function.channels.len() {
                        0 => return Err(ErrorKind::MissingChannel(function.kind).into()),
                        1 => 0,
                        _ => return Err(ErrorKind::AmbiguousChannel(function.kind).into()),
                    };
                    cells.column_mut(col).iter_mut().for_each(|cell| cell.push(id));
                }
                (Some(_), None) => {
                    return Err(ErrorKind::MissingPhaseSetup {
                        pulse: id,
                        function: function.kind,
                    }
                    .into())
                }
                (Some(seq_id), Some(setup)) => {
                    let sequence =
                        sequences
                            .get(&seq_id)
                            .ok_or(ErrorKind::UnknownPhaseSequence {
                                pulse: id,
                                sequence: seq_id,
                            })?;
                    for row in 0..rows {
                        let phase = sequence.phase_at(row);
                        let col = column_of(id, setup.channel_for(phase), phase)?;
                        cells[[row, col]].push(id);
                    }
                }
            }
        }

        Ok(Self {
            channels: function.channels.clone(),
            cells,
        })
    }

    pub fn rows(&self) -> usize {
        self.cells.nrows()
    }

    /// Cells as nested lists, indexed `[step][column]`.
    pub fn to_nested(&self) -> Vec<Vec<Vec<PulseId>>> {
        self.cells
            .rows()
            .into_iter()
            .map(|row| row.iter().cloned().collect())
            .collect()
    }

    /// Pulses on `channel` at phase step `step`.
    pub fn cell(&self, step: usize, channel: usize) -> &[PulseId] {
        match self.channels.iter().position(|&c| c == channel) {
            Some(col) => &self.cells[[step % self.rows(), col]],
            None => &[],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::function::FunctionKind;

    fn mw_with_setup() -> Function {
        let mut mw = Function::new(FunctionKind::Microwave);
        mw.channels = vec![0, 1];
        let mut setup = PhaseSetup::default();
        setup.assign(PhaseType::PlusX, 0).unwrap();
        setup.assign(PhaseType::MinusX, 1).unwrap();
        mw.phase_setup = Some(setup);
        mw
    }

    #[test]
    fn parses_phase_names() {
        assert_eq!("+x".parse::<PhaseType>().unwrap(), PhaseType::PlusX);
        assert_eq!(" -Y ".parse::<PhaseType>().unwrap(), PhaseType::MinusY);
        assert_eq!("Y".parse::<PhaseType>().unwrap(), PhaseType::PlusY);
        assert!("+Z".parse::<PhaseType>().is_err());
    }

    #[test]
    fn cycled_pulses_follow_their_sequence() {
        let mut mw = mw_with_setup();
        let mut pulses = IndexMap::new();
        let mut cycled = Pulse::new(1);
        cycled.phase_cycle = Some(0);
        pulses.insert(1, cycled);
        pulses.insert(2, Pulse::new(2));
        mw.pulses = vec![1, 2];
        let mut sequences = IndexMap::new();
        sequences.insert(
            0,
            PhaseSequence {
                id: 0,
                phases: vec![PhaseType::PlusX, PhaseType::MinusX],
            },
        );

        let matrix = PhaseMatrix::build(&mw, &pulses, &sequences, 2).unwrap();
        assert_eq!(matrix.cell(0, 0), &[1, 2]);
        assert_eq!(matrix.cell(1, 0), &[2]);
        assert_eq!(matrix.cell(1, 1), &[1]);
        assert!(matrix.cell(0, 7).is_empty());
    }

    #[test]
    fn unmapped_phase_type_is_rejected() {
        let mut mw = mw_with_setup();
        let mut pulse = Pulse::new(5);
        pulse.phase_cycle = Some(0);
        let pulses: IndexMap<_, _> = [(5, pulse)].into_iter().collect();
        mw.pulses = vec![5];
        let sequences: IndexMap<_, _> = [(
            0,
            PhaseSequence {
                id: 0,
                phases: vec![PhaseType::PlusX, PhaseType::PlusY],
            },
        )]
        .into_iter()
        .collect();

        let err = PhaseMatrix::build(&mw, &pulses, &sequences, 2).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::UnmappedPhaseType {
                pulse: 5,
                function: FunctionKind::Microwave,
                phase: PhaseType::PlusY
            }
        );
    }

    #[test]
    fn uncycled_pulse_needs_a_unique_channel() {
        let mut det = Function::new(FunctionKind::Detection);
        det.channels = vec![3, 4];
        det.pulses = vec![1];
        let pulses: IndexMap<_, _> = [(1, Pulse::new(1))].into_iter().collect();
        let err = PhaseMatrix::build(&det, &pulses, &IndexMap::new(), 1).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AmbiguousChannel(FunctionKind::Detection));
    }
}
