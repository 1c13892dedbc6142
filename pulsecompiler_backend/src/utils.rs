// The "utils" module holds the rate-limited warning log and name normalization shared by the
// declaration parsers.
use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

// Key identifying one offending condition; repeated occurrences of the same key are only counted
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WarningKey(String);

impl WarningKey {
    pub fn new(kind: &str, subject: impl fmt::Display) -> Self {
        WarningKey(format!("{kind}:{subject}"))
    }
}

impl fmt::Display for WarningKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
struct WarningEntry {
    message: String,
    count: usize,
    severe: bool,
}

/// Deduplicating warning log.
///
/// The first occurrence of a condition is logged immediately (`log::warn!`, or `log::error!` for
/// severe ones), later occurrences only increase its count. [`summary`] reports the conditions
/// that repeated, typically at the end of a run.
///
/// [`summary`]: WarningLog::summary
#[derive(Clone, Debug, Default)]
pub struct WarningLog {
    entries: IndexMap<WarningKey, WarningEntry>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record<F>(&mut self, key: WarningKey, severe: bool, message: F) -> bool
    where
        F: FnOnce() -> String,
    {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.count += 1;
            return false;
        }
        let message = message();
        if severe {
            log::error!("{message}");
        } else {
            log::warn!("{message}");
        }
        self.entries.insert(
            key,
            WarningEntry {
                message,
                count: 1,
                severe,
            },
        );
        true
    }

    /// Records a warning; returns `true` if this was its first occurrence.
    pub fn warn<F>(&mut self, key: WarningKey, message: F) -> bool
    where
        F: FnOnce() -> String,
    {
        self.record(key, false, message)
    }

    pub fn severe<F>(&mut self, key: WarningKey, message: F) -> bool
    where
        F: FnOnce() -> String,
    {
        self.record(key, true, message)
    }

    pub fn count(&self, key: &WarningKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logs every repeated condition with its count and returns the number of distinct warnings.
    pub fn summary(&self) -> usize {
        for entry in self.entries.values().filter(|e| e.count > 1) {
            if entry.severe {
                log::error!("{} (repeated {} times)", entry.message, entry.count);
            } else {
                log::warn!("{} (repeated {} times)", entry.message, entry.count);
            }
        }
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn separator_regex() -> &'static Regex {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    SEPARATORS.get_or_init(|| Regex::new(r"[\s\-]+").unwrap())
}

// Upper-cases a user-supplied identifier and folds runs of blanks and dashes into '_',
// e.g. " twt gate" -> "TWT_GATE"
pub fn normalize_name(name: &str) -> String {
    separator_regex()
        .replace_all(name.trim(), "_")
        .to_ascii_uppercase()
}
