//! Live aggregate statistics

use crate::entry::{AggregateSnapshot, AggregateStat, InputMethod, LogEntry, StatKey, Timestamp};
use crate::query::QueryError;
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Ranking used by every top-N listing
///
/// Higher count first; ties go to the later last-seen, then text ascending,
/// then method.
pub fn rank(a: &AggregateStat, b: &AggregateStat) -> CmpOrdering {
    b.count
        .cmp(&a.count)
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.text.cmp(&b.text))
        .then_with(|| a.method.cmp(&b.method))
}

/// Entry counts of the running session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionMetrics {
    pub chords: u64,
    pub words: u64,
    /// Start of the first entry recorded this session
    pub first: Option<Timestamp>,
    /// End of the last entry recorded this session
    pub last: Option<Timestamp>,
    pub chords_per_minute: f64,
    pub words_per_minute: f64,
}

#[derive(Debug)]
struct SessionCounters {
    chords: AtomicU64,
    words: AtomicU64,
    first_us: AtomicU64,
    last_us: AtomicU64,
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self {
            chords: AtomicU64::new(0),
            words: AtomicU64::new(0),
            first_us: AtomicU64::new(u64::MAX),
            last_us: AtomicU64::new(0),
        }
    }
}

/// In-memory running statistics keyed by `(text, method)`
///
/// Each key lives in a dashmap shard, so concurrent records and queries
/// never contend on one global lock.
#[derive(Debug, Default)]
pub struct Aggregator {
    stats: DashMap<StatKey, AggregateStat>,
    /// Highest sequence number recorded or seeded
    high_water: AtomicU64,
    seeded: AtomicBool,
    session: SessionCounters,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one entry into its stat
    ///
    /// Returns false if the stat already absorbed this sequence number.
    pub fn record(&self, entry: &LogEntry) -> bool {
        let mut applied = true;
        self.stats
            .entry(entry.key())
            .and_modify(|stat| {
                if entry.seq != 0 && entry.seq <= stat.last_seq {
                    applied = false;
                } else {
                    stat.absorb(entry);
                }
            })
            .or_insert_with(|| AggregateStat::from_entry(entry));

        if !applied {
            log::debug!("skipping duplicate entry seq {}", entry.seq);
            return false;
        }

        let counter = match entry.method {
            InputMethod::Chord => &self.session.chords,
            InputMethod::Sequential => &self.session.words,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.session.first_us.fetch_min(entry.start.as_micros(), Ordering::Relaxed);
        self.session.last_us.fetch_max(entry.end().as_micros(), Ordering::Relaxed);
        self.high_water.fetch_max(entry.seq, Ordering::Release);
        true
    }

    /// The `n` highest-ranked stats, optionally restricted to one method and
    /// to stats seen at or after `since`
    pub fn query_top(
        &self,
        n: usize,
        method: Option<InputMethod>,
        since: Option<Timestamp>,
    ) -> Vec<AggregateStat> {
        let mut stats: Vec<AggregateStat> = self
            .stats
            .iter()
            .filter(|s| method.map_or(true, |m| s.method == m))
            .filter(|s| since.map_or(true, |t| s.last_seen >= t))
            .map(|s| s.value().clone())
            .collect();
        stats.sort_by(rank);
        stats.truncate(n);
        stats
    }

    pub fn lookup(&self, text: &str, method: InputMethod) -> Result<AggregateStat, QueryError> {
        self.stats
            .get(&StatKey::new(text, method))
            .map(|s| s.value().clone())
            .ok_or_else(|| QueryError::NotFound {
                text: text.to_string(),
                method,
            })
    }

    /// Every stat, unordered
    pub fn stats(&self) -> Vec<AggregateStat> {
        self.stats.iter().map(|s| s.value().clone()).collect()
    }

    /// Point-in-time copy for checkpointing
    ///
    /// The watermark is read before iterating, so every entry at or below it
    /// is in the copy.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let watermark = self.high_water.load(Ordering::Acquire);
        AggregateSnapshot::new(watermark, self.stats())
    }

    /// Absorb a baseline loaded from the backend
    pub fn seed(&self, baseline: &AggregateSnapshot) {
        for stat in baseline.stats.values() {
            self.stats
                .entry(stat.key())
                .and_modify(|s| s.merge(stat))
                .or_insert_with(|| stat.clone());
        }
        self.high_water.fetch_max(baseline.watermark, Ordering::Release);
        self.seeded.store(true, Ordering::Release);
        log::info!(
            "aggregator seeded with {} stats up to seq {}",
            baseline.stats.len(),
            baseline.watermark
        );
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    /// Remove every stat matching the predicate
    pub fn purge(&self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> usize {
        let before = self.stats.len();
        self.stats.retain(|key, _| !predicate(&key.text, key.method));
        before - self.stats.len()
    }

    pub fn high_water(&self) -> u64 {
        self.high_water.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn total_count(&self) -> u64 {
        self.stats.iter().map(|s| s.count).sum()
    }

    /// Counts and per-minute rates for entries recorded since startup
    ///
    /// Rates use the span from the first entry to the last, never less than
    /// one minute.
    pub fn session_metrics(&self) -> SessionMetrics {
        let chords = self.session.chords.load(Ordering::Relaxed);
        let words = self.session.words.load(Ordering::Relaxed);
        let first_us = self.session.first_us.load(Ordering::Relaxed);
        let last_us = self.session.last_us.load(Ordering::Relaxed);
        let (first, last) = if chords + words == 0 {
            (None, None)
        } else {
            (Some(Timestamp(first_us)), Some(Timestamp(last_us)))
        };
        let minutes = (last_us.saturating_sub(first_us) as f64 / 60_000_000.0).max(1.0);
        SessionMetrics {
            chords,
            words,
            first,
            last,
            chords_per_minute: chords as f64 / minutes,
            words_per_minute: words as f64 / minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(text: &str, method: InputMethod, start: u64, seq: u64) -> LogEntry {
        LogEntry::new(text, method, Timestamp(start), 1_000, "test")
            .unwrap()
            .sequenced(seq)
    }

    #[test]
    fn cat_cat_dog() {
        let agg = Aggregator::new();
        agg.record(&entry("cat", InputMethod::Sequential, 1, 1));
        agg.record(&entry("cat", InputMethod::Sequential, 2, 2));
        agg.record(&entry("dog", InputMethod::Sequential, 3, 3));

        assert_eq!(agg.lookup("cat", InputMethod::Sequential).unwrap().count, 2);
        assert_eq!(agg.lookup("dog", InputMethod::Sequential).unwrap().count, 1);
        let top = agg.query_top(1, None, None);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].text, "cat");
    }

    #[test]
    fn lookup_missing_is_not_found() {
        let agg = Aggregator::new();
        assert!(matches!(
            agg.lookup("nope", InputMethod::Chord),
            Err(QueryError::NotFound { .. })
        ));
    }

    #[test]
    fn ties_break_by_last_seen_then_text() {
        let agg = Aggregator::new();
        agg.record(&entry("b", InputMethod::Sequential, 10, 1));
        agg.record(&entry("a", InputMethod::Sequential, 10, 2));
        agg.record(&entry("z", InputMethod::Sequential, 20, 3));
        agg.record(&entry("a", InputMethod::Chord, 10, 4));

        let order: Vec<(String, InputMethod)> = agg
            .query_top(10, None, None)
            .into_iter()
            .map(|s| (s.text, s.method))
            .collect();
        assert_eq!(
            order,
            vec![
                ("z".to_string(), InputMethod::Sequential),
                ("a".to_string(), InputMethod::Chord),
                ("a".to_string(), InputMethod::Sequential),
                ("b".to_string(), InputMethod::Sequential),
            ]
        );
    }

    #[test]
    fn top_filters_by_method_and_since() {
        let agg = Aggregator::new();
        agg.record(&entry("the", InputMethod::Chord, 100, 1));
        agg.record(&entry("the", InputMethod::Sequential, 200, 2));
        agg.record(&entry("old", InputMethod::Sequential, 5, 3));

        let chords = agg.query_top(10, Some(InputMethod::Chord), None);
        assert_eq!(chords.len(), 1);
        assert_eq!(chords[0].method, InputMethod::Chord);

        let recent = agg.query_top(10, None, Some(Timestamp(100)));
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|s| s.text == "the"));
    }

    #[test]
    fn duplicate_sequence_is_ignored() {
        let agg = Aggregator::new();
        let e = entry("cat", InputMethod::Sequential, 1, 7);
        assert!(agg.record(&e));
        assert!(!agg.record(&e));
        assert_eq!(agg.lookup("cat", InputMethod::Sequential).unwrap().count, 1);
        assert_eq!(agg.session_metrics().words, 1);
    }

    #[test]
    fn seed_then_record_continues_counts() {
        let mut base = AggregateSnapshot::default();
        base.apply(&entry("cat", InputMethod::Sequential, 1, 1));
        base.apply(&entry("cat", InputMethod::Sequential, 2, 2));

        let agg = Aggregator::new();
        assert!(!agg.is_seeded());
        agg.seed(&base);
        assert!(agg.is_seeded());
        assert_eq!(agg.high_water(), 2);

        agg.record(&entry("cat", InputMethod::Sequential, 3, 3));
        let stat = agg.lookup("cat", InputMethod::Sequential).unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.last_seq, 3);
        // Seeded counts are not part of the session
        assert_eq!(agg.session_metrics().words, 1);
    }

    #[test]
    fn snapshot_carries_watermark() {
        let agg = Aggregator::new();
        agg.record(&entry("a", InputMethod::Sequential, 1, 1));
        agg.record(&entry("b", InputMethod::Chord, 2, 2));
        let snap = agg.snapshot();
        assert_eq!(snap.watermark, 2);
        assert_eq!(snap.total_count(), 2);
    }

    #[test]
    fn purge_removes_matching_keys() {
        let agg = Aggregator::new();
        agg.record(&entry("secret", InputMethod::Sequential, 1, 1));
        agg.record(&entry("secret", InputMethod::Chord, 2, 2));
        agg.record(&entry("public", InputMethod::Sequential, 3, 3));
        assert_eq!(agg.purge(&|text, _| text == "secret"), 2);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn session_rates_use_a_minute_floor() {
        let agg = Aggregator::new();
        agg.record(&entry("a", InputMethod::Chord, 0, 1));
        agg.record(&entry("b", InputMethod::Sequential, 1_000_000, 2));
        let metrics = agg.session_metrics();
        assert_eq!(metrics.chords, 1);
        assert_eq!(metrics.words, 1);
        assert!((metrics.chords_per_minute - 1.0).abs() < f64::EPSILON);

        agg.record(&entry("c", InputMethod::Sequential, 120_000_000 - 1_000, 3));
        let metrics = agg.session_metrics();
        assert!((metrics.words_per_minute - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrent_records_are_all_counted() {
        let agg = Arc::new(Aggregator::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let agg = Arc::clone(&agg);
                thread::spawn(move || {
                    for i in 1..=250u64 {
                        let text = format!("w{}", t);
                        agg.record(&entry(&text, InputMethod::Sequential, i, t * 1000 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(agg.len(), 4);
        assert_eq!(agg.total_count(), 1000);
        assert_eq!(agg.high_water(), 3250);
    }
}
