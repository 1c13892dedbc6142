//! Pulse functions, the semantic roles pulses are declared with.
//!
//! A [`Function`] groups the pulses of one role and maps them onto the physical channels assigned
//! to it. Functions also carry the per-role settings: the delay applied to all of their channels,
//! the phase setup, and the paddings of the shape and TWT companion pulses generated for their
//! pulses.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use maplit::hashmap;

use crate::error::{ErrorKind, Result, SequencerError};
use crate::phase::PhaseSetup;
use crate::pulse::PulseId;
use crate::timebase::Ticks;
use crate::utils::normalize_name;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunctionKind {
    Microwave,
    Twt,
    TwtGate,
    Detection,
    DetectionGate,
    Defense,
    Rf,
    RfGate,
    PulseShape,
    Other1,
    Other2,
    Other3,
    Other4,
}

impl FunctionKind {
    pub const ALL: [FunctionKind; 13] = [
        FunctionKind::Microwave,
        FunctionKind::Twt,
        FunctionKind::TwtGate,
        FunctionKind::Detection,
        FunctionKind::DetectionGate,
        FunctionKind::Defense,
        FunctionKind::Rf,
        FunctionKind::RfGate,
        FunctionKind::PulseShape,
        FunctionKind::Other1,
        FunctionKind::Other2,
        FunctionKind::Other3,
        FunctionKind::Other4,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FunctionKind::Microwave => "MICROWAVE",
            FunctionKind::Twt => "TWT",
            FunctionKind::TwtGate => "TWT_GATE",
            FunctionKind::Detection => "DETECTION",
            FunctionKind::DetectionGate => "DETECTION_GATE",
            FunctionKind::Defense => "DEFENSE",
            FunctionKind::Rf => "RF",
            FunctionKind::RfGate => "RF_GATE",
            FunctionKind::PulseShape => "PULSE_SHAPE",
            FunctionKind::Other1 => "OTHER_1",
            FunctionKind::Other2 => "OTHER_2",
            FunctionKind::Other3 => "OTHER_3",
            FunctionKind::Other4 => "OTHER_4",
        }
    }

    /// Maximum number of physical channels, `None` if only bounded by the device.
    pub fn max_channels(&self) -> Option<usize> {
        match self {
            FunctionKind::PulseShape | FunctionKind::Twt => Some(1),
            _ => None,
        }
    }

    pub fn is_twt(&self) -> bool {
        matches!(self, FunctionKind::Twt | FunctionKind::TwtGate)
    }

    pub fn accepts_shape_companion(&self) -> bool {
        *self != FunctionKind::PulseShape
    }

    pub fn accepts_twt_companion(&self) -> bool {
        !self.is_twt()
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn aliases() -> &'static HashMap<&'static str, FunctionKind> {
    static ALIASES: OnceLock<HashMap<&'static str, FunctionKind>> = OnceLock::new();
    ALIASES.get_or_init(|| {
        let mut table = hashmap! {
            "MW" => FunctionKind::Microwave,
            "TWTGATE" => FunctionKind::TwtGate,
            "DET" => FunctionKind::Detection,
            "DETECTIONGATE" => FunctionKind::DetectionGate,
            "DET_GATE" => FunctionKind::DetectionGate,
            "RADIO_FREQUENCY" => FunctionKind::Rf,
            "RADIO_FREQUENCY_GATE" => FunctionKind::RfGate,
            "RFGATE" => FunctionKind::RfGate,
            "SHAPE" => FunctionKind::PulseShape,
            "PULSESHAPE" => FunctionKind::PulseShape,
            "OTHER" => FunctionKind::Other1,
            "OTHER1" => FunctionKind::Other1,
            "OTHER2" => FunctionKind::Other2,
            "OTHER3" => FunctionKind::Other3,
            "OTHER4" => FunctionKind::Other4,
        };
        for kind in FunctionKind::ALL {
            table.insert(kind.name(), kind);
        }
        table
    })
}

impl FromStr for FunctionKind {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self> {
        aliases()
            .get(normalize_name(s).as_str())
            .copied()
            .ok_or_else(|| ErrorKind::UnknownFunction(s.to_string()).into())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Padding {
    pub left: Ticks,
    pub right: Ticks,
}

impl Padding {
    pub fn new(left: Ticks, right: Ticks) -> Self {
        Self { left, right }
    }

    /// Side-wise minimum.
    pub fn min(self, other: Padding) -> Padding {
        Padding::new(self.left.min(other.left), self.right.min(other.right))
    }
}

/// Requested companion padding; `None` sides take the configured default when the test run starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoPadding {
    pub left: Option<Ticks>,
    pub right: Option<Ticks>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompanionKind {
    Shape,
    Twt,
}

impl CompanionKind {
    /// The function companions of this kind are placed on.
    pub fn target(&self) -> FunctionKind {
        match self {
            CompanionKind::Shape => FunctionKind::PulseShape,
            CompanionKind::Twt => FunctionKind::Twt,
        }
    }
}

impl fmt::Display for CompanionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompanionKind::Shape => write!(f, "shape"),
            CompanionKind::Twt => write!(f, "TWT"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub kind: FunctionKind,
    pub is_declared: bool,
    /// Physical channels in assignment order.
    pub channels: Vec<usize>,
    pub pulses: Vec<PulseId>,
    /// Delay as declared, may be negative.
    pub declared_delay: Option<Ticks>,
    /// Delay after normalization, never negative.
    pub delay: Ticks,
    pub phase_setup: Option<PhaseSetup>,
    pub shape_request: Option<AutoPadding>,
    pub shape_padding: Padding,
    pub min_shape_padding: Padding,
    pub twt_request: Option<AutoPadding>,
    pub twt_padding: Padding,
    pub min_twt_padding: Padding,
    /// Longest end of any of its channel patterns seen so far.
    pub max_seq_len: Ticks,
}

impl Function {
    pub fn new(kind: FunctionKind) -> Self {
        Self {
            kind,
            is_declared: false,
            channels: Vec::new(),
            pulses: Vec::new(),
            declared_delay: None,
            delay: 0,
            phase_setup: None,
            shape_request: None,
            shape_padding: Padding::default(),
            min_shape_padding: Padding::default(),
            twt_request: None,
            twt_padding: Padding::default(),
            min_twt_padding: Padding::default(),
            max_seq_len: 0,
        }
    }

    pub fn has_pulses(&self) -> bool {
        !self.pulses.is_empty()
    }

    pub fn is_phase_cycled(&self) -> bool {
        self.phase_setup.is_some()
    }

    pub fn companion_request(&self, kind: CompanionKind) -> Option<AutoPadding> {
        match kind {
            CompanionKind::Shape if self.kind.accepts_shape_companion() => self.shape_request,
            CompanionKind::Twt if self.kind.accepts_twt_companion() => self.twt_request,
            _ => None,
        }
    }

    pub fn padding(&self, kind: CompanionKind) -> Padding {
        match kind {
            CompanionKind::Shape => self.shape_padding,
            CompanionKind::Twt => self.twt_padding,
        }
    }

    pub fn min_padding(&self, kind: CompanionKind) -> Padding {
        match kind {
            CompanionKind::Shape => self.min_shape_padding,
            CompanionKind::Twt => self.min_twt_padding,
        }
    }

    /// Sets the configured padding and resets the achievable minimum to it.
    pub fn set_padding(&mut self, kind: CompanionKind, padding: Padding) {
        match kind {
            CompanionKind::Shape => {
                self.shape_padding = padding;
                self.min_shape_padding = padding;
            }
            CompanionKind::Twt => {
                self.twt_padding = padding;
                self.min_twt_padding = padding;
            }
        }
    }

    /// Lowers the achievable minimum padding, never raising it above the configured one.
    pub fn record_padding(&mut self, kind: CompanionKind, achieved: Padding) {
        let min = match kind {
            CompanionKind::Shape => &mut self.min_shape_padding,
            CompanionKind::Twt => &mut self.min_twt_padding,
        };
        *min = min.min(Padding::new(achieved.left.max(0), achieved.right.max(0)));
    }

    pub fn channel_column(&self, channel: usize) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }
}
