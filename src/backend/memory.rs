//! In-memory backend

use super::{replay, Backend, BackendError, BackendKind, Baseline, Cursor, TimeRange};
use crate::entry::{AggregateSnapshot, BannedWord, InputMethod, LogEntry};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

#[derive(Debug, Default)]
struct MemoryState {
    /// Entries ordered by `(start, seq)`
    entries: BTreeMap<Cursor, LogEntry>,
    last_seq: u64,
    snapshot: Option<AggregateSnapshot>,
    banlist: HashMap<String, BannedWord>,
}

/// Backend that keeps everything in process memory
///
/// Nothing survives the process; sharing one instance between engine
/// restarts in the same process behaves like a durable store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn append(&self, entry: &LogEntry) -> Result<(), BackendError> {
        let mut state = self.state.write();
        state.last_seq = state.last_seq.max(entry.seq);
        state.entries.insert(Cursor::of(entry), entry.clone());
        Ok(())
    }

    fn flush_aggregates(&self, snapshot: &AggregateSnapshot) -> Result<(), BackendError> {
        self.state.write().snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_aggregates(&self) -> Result<Baseline, BackendError> {
        let state = self.state.read();
        let mut snapshot = state.snapshot.clone().unwrap_or_default();
        let mut by_seq: Vec<LogEntry> = state
            .entries
            .values()
            .filter(|e| e.seq > snapshot.watermark)
            .cloned()
            .collect();
        by_seq.sort_by_key(|e| e.seq);
        let replayed = replay(&mut snapshot, by_seq);
        Ok(Baseline {
            snapshot,
            replayed,
            warnings: Vec::new(),
        })
    }

    fn read_page(
        &self,
        range: &TimeRange,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, BackendError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let lower = match after {
            Some(cursor) if cursor >= Cursor::new(range.since, 0) => Bound::Excluded(cursor),
            _ => Bound::Included(Cursor::new(range.since, 0)),
        };
        let upper = Bound::Excluded(Cursor::new(range.until, 0));
        let state = self.state.read();
        Ok(state
            .entries
            .range((lower, upper))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn purge(&self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> Result<usize, BackendError> {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|_, e| !predicate(&e.text, e.method));
        let removed = before - state.entries.len();
        if let Some(snapshot) = state.snapshot.as_mut() {
            snapshot.retain_unmatched(predicate);
        }
        Ok(removed)
    }

    fn last_sequence(&self) -> Result<u64, BackendError> {
        let state = self.state.read();
        let snap = state.snapshot.as_ref().map_or(0, |s| s.watermark);
        Ok(state.last_seq.max(snap))
    }

    fn ban(&self, word: &BannedWord) -> Result<bool, BackendError> {
        let mut state = self.state.write();
        if state.banlist.contains_key(&word.text) {
            return Ok(false);
        }
        state.banlist.insert(word.text.clone(), word.clone());
        Ok(true)
    }

    fn unban(&self, text: &str) -> Result<bool, BackendError> {
        Ok(self.state.write().banlist.remove(&text.to_lowercase()).is_some())
    }

    fn banlist(&self) -> Result<Vec<BannedWord>, BackendError> {
        let mut words: Vec<BannedWord> = self.state.read().banlist.values().cloned().collect();
        words.sort_by(|a, b| a.text.cmp(&b.text));
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Timestamp;

    fn entry(text: &str, method: InputMethod, start: u64, seq: u64) -> LogEntry {
        LogEntry::new(text, method, Timestamp(start), 10, "test")
            .unwrap()
            .sequenced(seq)
    }

    #[test]
    fn load_replays_everything_without_snapshot() {
        let backend = MemoryBackend::new();
        backend.append(&entry("cat", InputMethod::Sequential, 1, 1)).unwrap();
        backend.append(&entry("cat", InputMethod::Sequential, 2, 2)).unwrap();
        backend.append(&entry("dog", InputMethod::Sequential, 3, 3)).unwrap();

        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.replayed, 3);
        assert_eq!(baseline.snapshot.get("cat", InputMethod::Sequential).unwrap().count, 2);
        assert_eq!(backend.last_sequence().unwrap(), 3);
    }

    #[test]
    fn load_replays_only_after_watermark() {
        let backend = MemoryBackend::new();
        let mut snap = AggregateSnapshot::default();
        for (i, text) in ["a", "b"].iter().enumerate() {
            let e = entry(text, InputMethod::Chord, i as u64, i as u64 + 1);
            backend.append(&e).unwrap();
            snap.apply(&e);
        }
        backend.flush_aggregates(&snap).unwrap();
        backend.append(&entry("a", InputMethod::Chord, 5, 3)).unwrap();

        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.replayed, 1);
        assert_eq!(baseline.snapshot.get("a", InputMethod::Chord).unwrap().count, 2);
    }

    #[test]
    fn page_reads_are_ordered_by_start_then_seq() {
        let backend = MemoryBackend::new();
        backend.append(&entry("late", InputMethod::Sequential, 50, 1)).unwrap();
        backend.append(&entry("early", InputMethod::Sequential, 10, 2)).unwrap();
        backend.append(&entry("same", InputMethod::Sequential, 10, 3)).unwrap();

        let page = backend.read_page(&TimeRange::all(), None, 10).unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 1]);

        let next = backend
            .read_page(&TimeRange::all(), Some(Cursor::new(Timestamp(10), 2)), 1)
            .unwrap();
        assert_eq!(next[0].seq, 3);
    }

    #[test]
    fn purge_removes_entries_and_snapshot_stats() {
        let backend = MemoryBackend::new();
        let e = entry("secret", InputMethod::Sequential, 1, 1);
        backend.append(&e).unwrap();
        backend.append(&entry("fine", InputMethod::Sequential, 2, 2)).unwrap();
        let mut snap = AggregateSnapshot::default();
        snap.apply(&e);
        backend.flush_aggregates(&snap).unwrap();

        assert_eq!(backend.purge(&|text, _| text == "secret").unwrap(), 1);
        let baseline = backend.load_aggregates().unwrap();
        assert!(baseline.snapshot.get("secret", InputMethod::Sequential).is_none());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn banlist_is_case_insensitive() {
        let backend = MemoryBackend::new();
        assert!(backend.ban(&BannedWord::new("Secret", Timestamp(1))).unwrap());
        assert!(!backend.ban(&BannedWord::new("secret", Timestamp(2))).unwrap());
        assert_eq!(backend.banlist().unwrap().len(), 1);
        assert!(backend.unban("SECRET").unwrap());
        assert!(!backend.unban("secret").unwrap());
    }
}
