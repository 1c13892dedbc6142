//! Conversion between physical times and integer clock ticks.
//!
//! All positions and lengths inside the compiler are [`Ticks`], integer multiples of the pulser
//! timebase. A time is only accepted if it lies within 1% of a tick of an exact multiple of the
//! timebase, so rounding never silently moves a pulse edge.
//!
//! Until a timebase is declared, the first conversion adopts the device's fixed internal one.

use std::str::FromStr;

use crate::config::PulserConfig;
use crate::error::{ErrorKind, Result, SequencerError};

pub type Ticks = i64;

/// Largest tick count the pattern registers can represent.
pub const MAX_TICKS: Ticks = i32::MAX as Ticks;

/// Allowed deviation from an exact multiple, in units of the timebase.
const TICK_TOLERANCE: f64 = 1.0e-2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimebaseSource {
    Internal,
    External,
}

impl FromStr for TimebaseSource {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" | "int" => Ok(TimebaseSource::Internal),
            "external" | "ext" => Ok(TimebaseSource::External),
            _ => Err(ErrorKind::InvalidTimebase(format!("unknown clock source '{s}'")).into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TickConverter {
    fixed_timebase: f64,
    min_timebase: f64,
    max_timebase: f64,
    timebase: Option<(f64, TimebaseSource)>,
}

impl TickConverter {
    pub fn new(config: &PulserConfig) -> Self {
        Self {
            fixed_timebase: config.fixed_timebase,
            min_timebase: config.min_timebase,
            max_timebase: config.max_timebase,
            timebase: None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.timebase.is_some()
    }

    pub fn source(&self) -> Option<TimebaseSource> {
        self.timebase.map(|(_, source)| source)
    }

    /// Timebase in seconds: the declared one or, if none was declared yet, the internal one.
    pub fn timebase(&self) -> f64 {
        self.timebase.map_or(self.fixed_timebase, |(tb, _)| tb)
    }

    /// Declares the timebase.
    ///
    /// The internal clock only runs at the fixed timebase; an external clock must lie within the
    /// configured range. Re-declaring the same timebase is accepted, a different one is not.
    pub fn set_timebase(&mut self, seconds: f64, source: TimebaseSource) -> Result<()> {
        if let Some((current, current_source)) = self.timebase {
            if current_source == source && (current - seconds).abs() <= current * TICK_TOLERANCE {
                return Ok(());
            }
            return Err(ErrorKind::SettingAlreadySet("timebase").into());
        }
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ErrorKind::InvalidTimebase(format!("{seconds} s is not a valid period")).into());
        }
        match source {
            TimebaseSource::Internal => {
                if (seconds - self.fixed_timebase).abs() > self.fixed_timebase * TICK_TOLERANCE {
                    return Err(ErrorKind::InvalidTimebase(format!(
                        "the internal clock only supports a timebase of {} s",
                        self.fixed_timebase
                    ))
                    .into());
                }
                self.timebase = Some((self.fixed_timebase, source));
            }
            TimebaseSource::External => {
                if seconds < self.min_timebase || seconds > self.max_timebase {
                    return Err(ErrorKind::InvalidTimebase(format!(
                        "{seconds} s is outside of the range {} s to {} s",
                        self.min_timebase, self.max_timebase
                    ))
                    .into());
                }
                self.timebase = Some((seconds, source));
            }
        }
        Ok(())
    }

    fn adopt_default(&mut self) -> f64 {
        if self.timebase.is_none() {
            log::info!(
                "No timebase declared, using the internal timebase of {} s",
                self.fixed_timebase
            );
            self.timebase = Some((self.fixed_timebase, TimebaseSource::Internal));
        }
        self.timebase()
    }

    fn ratio(&mut self, seconds: f64) -> Result<(f64, f64)> {
        let timebase = self.adopt_default();
        let ratio = seconds / timebase;
        if !ratio.is_finite() || ratio.abs() > MAX_TICKS as f64 {
            return Err(ErrorKind::InvalidTimebase(format!(
                "{seconds} s is out of the representable range for a timebase of {timebase} s"
            ))
            .into());
        }
        Ok((ratio, timebase))
    }

    /// Converts a time to ticks, requiring it to be an integer multiple of the timebase.
    ///
    /// ```
    /// use pulsecompiler_backend::config::PulserConfig;
    /// use pulsecompiler_backend::timebase::TickConverter;
    ///
    /// let mut ticks = TickConverter::new(&PulserConfig::default()); // 8 ns internal timebase
    /// assert_eq!(ticks.time_to_ticks(80e-9).unwrap(), 10);
    /// assert!(ticks.time_to_ticks(81e-9).is_err());
    /// ```
    pub fn time_to_ticks(&mut self, seconds: f64) -> Result<Ticks> {
        let (ratio, timebase) = self.ratio(seconds)?;
        let ticks = ratio.round();
        if (ticks - ratio).abs() > TICK_TOLERANCE || (seconds > 0.0 && ticks == 0.0) {
            return Err(ErrorKind::NotATickMultiple { seconds, timebase }.into());
        }
        Ok(ticks as Ticks)
    }

    /// Converts a time to the smallest tick count covering it.
    ///
    /// Used for configured minimum distances and default paddings, which need not be multiples
    /// of an external timebase.
    pub fn ceil_ticks(&mut self, seconds: f64) -> Result<Ticks> {
        let (ratio, _) = self.ratio(seconds)?;
        let rounded = ratio.round();
        if (rounded - ratio).abs() <= TICK_TOLERANCE {
            Ok(rounded as Ticks)
        } else {
            Ok(ratio.ceil() as Ticks)
        }
    }

    pub fn ticks_to_time(&self, ticks: Ticks) -> f64 {
        ticks as f64 * self.timebase()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn converter() -> TickConverter {
        TickConverter::new(&PulserConfig::default())
    }

    #[test]
    fn adopts_internal_timebase() {
        let mut ticks = converter();
        assert!(!ticks.is_set());
        assert_eq!(ticks.time_to_ticks(80e-9).unwrap(), 10);
        assert_eq!(ticks.source(), Some(TimebaseSource::Internal));
        // A different timebase can no longer be declared after it was adopted
        assert!(ticks.set_timebase(4e-9, TimebaseSource::External).is_err());
        ticks.set_timebase(8e-9, TimebaseSource::Internal).unwrap();
    }

    #[test]
    fn rejects_non_multiples() {
        let mut ticks = converter();
        let err = ticks.time_to_ticks(81e-9).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotATickMultiple { .. }));
        // Positive times must not vanish
        let err = ticks.time_to_ticks(0.05e-9).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotATickMultiple { .. }));
        assert_eq!(ticks.time_to_ticks(0.0).unwrap(), 0);
        assert_eq!(ticks.time_to_ticks(-16e-9).unwrap(), -2);
    }

    #[test]
    fn rejects_out_of_range() {
        let mut ticks = converter();
        let err = ticks.time_to_ticks(1.0e6).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidTimebase(_)));
        let err = ticks.time_to_ticks(f64::NAN).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidTimebase(_)));
    }

    #[test]
    fn external_timebase_range() {
        let mut ticks = converter();
        assert!(ticks.set_timebase(1e-10, TimebaseSource::External).is_err());
        assert!(ticks.set_timebase(5e-9, TimebaseSource::Internal).is_err());
        ticks.set_timebase(5e-9, TimebaseSource::External).unwrap();
        assert_eq!(ticks.time_to_ticks(50e-9).unwrap(), 10);
        assert_eq!(ticks.ceil_ticks(96e-9).unwrap(), 20);
    }

    proptest! {
        #[test]
        fn tick_round_trip(n in -(MAX_TICKS / 2)..(MAX_TICKS / 2)) {
            let mut ticks = converter();
            let t = ticks.ticks_to_time(n);
            let back = ticks.time_to_ticks(t).unwrap();
            prop_assert_eq!(back, n);
            prop_assert_eq!(ticks.ticks_to_time(back), t);
        }
    }
}
