//! Log entries and aggregate statistics
//!
//! A [`LogEntry`] is one completed unit of typed input (a word typed key by key,
//! or a chord emitted by the device). An [`AggregateStat`] is the running usage
//! record for one `(text, method)` pair.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn from_micros(us: u64) -> Self {
        Self(us)
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1000))
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert from a UTC datetime; times before the epoch clamp to zero
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros().max(0) as u64)
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let micros = i64::try_from(self.0).ok()?;
        Utc.timestamp_micros(micros).single()
    }

    /// Microseconds elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn micros_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn saturating_add_micros(&self, us: u64) -> Self {
        Self(self.0.saturating_add(us))
    }

    pub fn saturating_sub_micros(&self, us: u64) -> Self {
        Self(self.0.saturating_sub(us))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.3f")),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// How an entry was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMethod {
    /// Emitted by the device as one atomic chord output
    Chord,
    /// Typed as ordinary discrete keystrokes
    Sequential,
}

impl InputMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chord => "chord",
            Self::Sequential => "sequential",
        }
    }

    pub fn all() -> &'static [InputMethod] {
        &[Self::Chord, Self::Sequential]
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "chord" => Some(Self::Chord),
            "sequential" | "word" => Some(Self::Sequential),
            _ => None,
        }
    }
}

impl fmt::Display for InputMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors constructing a [`LogEntry`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("entry text is empty")]
    EmptyText,
}

/// One completed, classified unit of typed input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in classification order; 0 until the pipeline sequences it
    pub seq: u64,
    /// Normalized text
    pub text: String,
    pub method: InputMethod,
    /// Timestamp of the first key that contributed to the entry
    pub start: Timestamp,
    /// Microseconds from the first to the last contributing key
    pub duration_us: u64,
    /// Tag of the capture source
    pub source: String,
}

impl LogEntry {
    pub fn new(
        text: impl Into<String>,
        method: InputMethod,
        start: Timestamp,
        duration_us: u64,
        source: impl Into<String>,
    ) -> Result<Self, EntryError> {
        let text = normalize_text(&text.into());
        if text.is_empty() {
            return Err(EntryError::EmptyText);
        }
        Ok(Self {
            seq: 0,
            text,
            method,
            start,
            duration_us,
            source: source.into(),
        })
    }

    /// Return the entry with its sequence number assigned
    pub fn sequenced(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn key(&self) -> StatKey {
        StatKey::new(self.text.clone(), self.method)
    }

    pub fn end(&self) -> Timestamp {
        self.start.saturating_add_micros(self.duration_us)
    }
}

/// Trim surrounding whitespace and drop control characters
pub fn normalize_text(raw: &str) -> String {
    raw.trim().chars().filter(|c| !c.is_control()).collect()
}

/// Key of an aggregate statistic
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatKey {
    pub text: String,
    pub method: InputMethod,
}

impl StatKey {
    pub fn new(text: impl Into<String>, method: InputMethod) -> Self {
        Self {
            text: text.into(),
            method,
        }
    }
}

/// Running usage statistics for one `(text, method)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStat {
    pub text: String,
    pub method: InputMethod,
    pub count: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Sum of entry durations in microseconds
    pub total_duration_us: u64,
    /// Highest entry sequence number folded into this stat
    #[serde(default)]
    pub last_seq: u64,
}

impl AggregateStat {
    /// Create a stat from its first entry
    pub fn from_entry(entry: &LogEntry) -> Self {
        Self {
            text: entry.text.clone(),
            method: entry.method,
            count: 1,
            first_seen: entry.start,
            last_seen: entry.start,
            total_duration_us: entry.duration_us,
            last_seq: entry.seq,
        }
    }

    /// Fold one more entry into the stat
    pub fn absorb(&mut self, entry: &LogEntry) {
        self.count += 1;
        self.first_seen = self.first_seen.min(entry.start);
        self.last_seen = self.last_seen.max(entry.start);
        self.total_duration_us = self.total_duration_us.saturating_add(entry.duration_us);
        self.last_seq = self.last_seq.max(entry.seq);
    }

    /// Combine two stats covering disjoint sets of entries
    pub fn merge(&mut self, other: &AggregateStat) {
        self.count += other.count;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.total_duration_us = self.total_duration_us.saturating_add(other.total_duration_us);
        self.last_seq = self.last_seq.max(other.last_seq);
    }

    pub fn key(&self) -> StatKey {
        StatKey::new(self.text.clone(), self.method)
    }

    /// Average entry duration in milliseconds
    pub fn avg_duration_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_duration_us as f64 / self.count as f64 / 1000.0
    }
}

impl fmt::Display for AggregateStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): count {}, last seen {}, avg {:.1} ms",
            self.text,
            self.method,
            self.count,
            self.last_seen,
            self.avg_duration_ms()
        )
    }
}

/// Point-in-time copy of aggregate state
///
/// Every entry with `seq <= watermark` is included. Entries above the
/// watermark may be included too; [`AggregateSnapshot::apply`] skips those
/// through the per-stat `last_seq`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    pub watermark: u64,
    pub stats: HashMap<StatKey, AggregateStat>,
}

impl AggregateSnapshot {
    pub fn new(watermark: u64, stats: impl IntoIterator<Item = AggregateStat>) -> Self {
        Self {
            watermark,
            stats: stats.into_iter().map(|s| (s.key(), s)).collect(),
        }
    }

    /// Replay one logged entry; returns false if the stat already holds it
    pub fn apply(&mut self, entry: &LogEntry) -> bool {
        self.watermark = self.watermark.max(entry.seq);
        match self.stats.get_mut(&entry.key()) {
            Some(stat) if entry.seq != 0 && entry.seq <= stat.last_seq => false,
            Some(stat) => {
                stat.absorb(entry);
                true
            }
            None => {
                self.stats.insert(entry.key(), AggregateStat::from_entry(entry));
                true
            }
        }
    }

    pub fn get(&self, text: &str, method: InputMethod) -> Option<&AggregateStat> {
        self.stats.get(&StatKey::new(text, method))
    }

    pub fn total_count(&self) -> u64 {
        self.stats.values().map(|s| s.count).sum()
    }

    /// Drop stats matching the predicate, returning how many were removed
    pub fn retain_unmatched(&mut self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> usize {
        let before = self.stats.len();
        self.stats.retain(|key, _| !predicate(&key.text, key.method));
        before - self.stats.len()
    }
}

/// A word excluded from logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedWord {
    /// Lower-cased word
    pub text: String,
    pub added: Timestamp,
}

impl BannedWord {
    pub fn new(text: &str, added: Timestamp) -> Self {
        Self {
            text: text.trim().to_lowercase(),
            added,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, method: InputMethod, start: u64, seq: u64) -> LogEntry {
        LogEntry::new(text, method, Timestamp(start), 100, "test")
            .unwrap()
            .sequenced(seq)
    }

    #[test]
    fn entry_rejects_empty_text() {
        let err = LogEntry::new("  ", InputMethod::Sequential, Timestamp(1), 0, "t").unwrap_err();
        assert_eq!(err, EntryError::EmptyText);
    }

    #[test]
    fn entry_text_is_trimmed() {
        let e = LogEntry::new(" cat\n", InputMethod::Sequential, Timestamp(1), 0, "t").unwrap();
        assert_eq!(e.text, "cat");
    }

    #[test]
    fn stat_absorb_updates_all_fields() {
        let mut stat = AggregateStat::from_entry(&entry("cat", InputMethod::Sequential, 500, 1));
        stat.absorb(&entry("cat", InputMethod::Sequential, 200, 2));
        assert_eq!(stat.count, 2);
        assert_eq!(stat.first_seen, Timestamp(200));
        assert_eq!(stat.last_seen, Timestamp(500));
        assert_eq!(stat.total_duration_us, 200);
        assert_eq!(stat.last_seq, 2);
        assert!((stat.avg_duration_ms() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_apply_skips_already_absorbed_entries() {
        let mut snap = AggregateSnapshot::default();
        assert!(snap.apply(&entry("cat", InputMethod::Sequential, 1, 1)));
        assert!(snap.apply(&entry("cat", InputMethod::Sequential, 2, 2)));
        assert!(!snap.apply(&entry("cat", InputMethod::Sequential, 2, 2)));
        assert_eq!(snap.get("cat", InputMethod::Sequential).unwrap().count, 2);
        assert_eq!(snap.watermark, 2);
    }

    #[test]
    fn snapshot_keys_methods_separately() {
        let mut snap = AggregateSnapshot::default();
        snap.apply(&entry("the", InputMethod::Chord, 1, 1));
        snap.apply(&entry("the", InputMethod::Sequential, 2, 2));
        assert_eq!(snap.stats.len(), 2);
    }

    #[test]
    fn timestamp_datetime_roundtrip() {
        let ts = Timestamp(1_700_000_000_123_456);
        let dt = ts.to_datetime().unwrap();
        assert_eq!(Timestamp::from_datetime(dt), ts);
    }

    #[test]
    fn input_method_parse() {
        assert_eq!(InputMethod::parse("Chord"), Some(InputMethod::Chord));
        assert_eq!(InputMethod::parse("word"), Some(InputMethod::Sequential));
        assert_eq!(InputMethod::parse("x"), None);
    }

    #[test]
    fn banned_word_is_lowercased() {
        assert_eq!(BannedWord::new(" Hello ", Timestamp(0)).text, "hello");
    }
}
