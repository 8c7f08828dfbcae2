//! Storage backends
//!
//! A [`Backend`] persists the entry log, an aggregate snapshot used for
//! startup recovery, and the banlist. Three variants exist:
//!
//! - [`MemoryBackend`]: no durability, for tests and throwaway sessions
//! - [`FileBackend`]: JSON-lines append log plus a snapshot file
//! - [`SqliteBackend`]: embedded SQLite database
//!
//! [`AnyBackend`] selects one from configuration.

mod file;
mod memory;
mod record;
mod sqlite;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use record::RECORD_VERSION;
pub use sqlite::SqliteBackend;

use crate::config::BackendConfig;
use crate::entry::{AggregateSnapshot, BannedWord, InputMethod, LogEntry, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Entries fetched per page by [`RangeIter`]
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaMismatch { found: u32, supported: u32 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cursor token: {0}")]
    InvalidCursor(String),
}

/// Which storage variant to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
    #[default]
    Sqlite,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Sqlite => "sqlite",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "file" | "jsonl" => Some(Self::File),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregate state recovered at startup
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    pub snapshot: AggregateSnapshot,
    /// Log records folded in on top of the stored snapshot
    pub replayed: usize,
    /// Recovery problems that did not prevent loading
    pub warnings: Vec<String>,
}

/// Half-open time window `[since, until)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Timestamp,
    pub until: Timestamp,
}

impl TimeRange {
    pub fn new(since: Timestamp, until: Timestamp) -> Self {
        Self { since, until }
    }

    pub fn all() -> Self {
        Self::new(Timestamp::ZERO, Timestamp::MAX)
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.since && ts < self.until
    }

    pub fn is_empty(&self) -> bool {
        self.since >= self.until
    }
}

/// Position in `(start, seq)` order
///
/// Serializes to a `start:seq` token so a range scan can be resumed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub start: Timestamp,
    pub seq: u64,
}

impl Cursor {
    pub fn new(start: Timestamp, seq: u64) -> Self {
        Self { start, seq }
    }

    pub fn of(entry: &LogEntry) -> Self {
        Self::new(entry.start, entry.seq)
    }

    pub fn token(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start.as_micros(), self.seq)
    }
}

impl FromStr for Cursor {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BackendError::InvalidCursor(s.to_string());
        let (start, seq) = s.split_once(':').ok_or_else(invalid)?;
        let start = start.parse::<u64>().map_err(|_| invalid())?;
        let seq = seq.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(Timestamp(start), seq))
    }
}

/// Persistence interface shared by every storage variant
///
/// Appends from one writer serialize internally. Reads may run concurrently
/// with appends and only ever observe complete records.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Persist one entry; durable before returning for on-disk variants
    fn append(&self, entry: &LogEntry) -> Result<(), BackendError>;

    /// Store an aggregate checkpoint
    fn flush_aggregates(&self, snapshot: &AggregateSnapshot) -> Result<(), BackendError>;

    /// Stored snapshot plus replay of every logged entry above its watermark
    fn load_aggregates(&self) -> Result<Baseline, BackendError>;

    /// Up to `limit` entries in `range`, ordered by `(start, seq)`, strictly
    /// after `after` when given
    fn read_page(
        &self,
        range: &TimeRange,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, BackendError>;

    /// Remove entries and snapshot stats whose key matches the predicate
    fn purge(&self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> Result<usize, BackendError>;

    /// Highest sequence number stored in the log or the snapshot
    fn last_sequence(&self) -> Result<u64, BackendError>;

    /// Add a word to the banlist; false if it was already banned
    fn ban(&self, word: &BannedWord) -> Result<bool, BackendError>;

    /// Remove a word from the banlist; false if it was not banned
    fn unban(&self, text: &str) -> Result<bool, BackendError>;

    fn banlist(&self) -> Result<Vec<BannedWord>, BackendError>;
}

impl dyn Backend + '_ {
    /// Lazily iterate entries with `since <= start < until`
    pub fn query_range(&self, since: Timestamp, until: Timestamp) -> RangeIter<'_> {
        RangeIter::new(self, TimeRange::new(since, until))
    }
}

/// Lazy, finite iterator over a time range, fetched page by page
///
/// Stops after the first error. [`RangeIter::cursor`] marks the last entry
/// yielded, and [`RangeIter::resume`] continues from such a cursor.
pub struct RangeIter<'a> {
    backend: &'a dyn Backend,
    range: TimeRange,
    after: Option<Cursor>,
    page: VecDeque<LogEntry>,
    page_size: usize,
    done: bool,
}

impl<'a> RangeIter<'a> {
    pub fn new(backend: &'a dyn Backend, range: TimeRange) -> Self {
        Self {
            backend,
            range,
            after: None,
            page: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
            done: range.is_empty(),
        }
    }

    /// Continue a scan strictly after `cursor`
    pub fn resume(backend: &'a dyn Backend, range: TimeRange, cursor: Cursor) -> Self {
        let mut iter = Self::new(backend, range);
        iter.after = Some(cursor);
        iter
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Position of the last entry yielded
    pub fn cursor(&self) -> Option<Cursor> {
        self.after
    }

    fn fill(&mut self) -> Result<(), BackendError> {
        let page = self.backend.read_page(&self.range, self.after, self.page_size)?;
        if page.len() < self.page_size {
            self.done = true;
        }
        self.page.extend(page);
        Ok(())
    }
}

impl Iterator for RangeIter<'_> {
    type Item = Result<LogEntry, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        let entry = self.page.pop_front()?;
        self.after = Some(Cursor::of(&entry));
        Some(Ok(entry))
    }
}

/// Fold logged entries above the snapshot's watermark into it
///
/// Returns how many entries changed the snapshot.
pub(crate) fn replay<I>(snapshot: &mut AggregateSnapshot, entries: I) -> usize
where
    I: IntoIterator<Item = LogEntry>,
{
    let watermark = snapshot.watermark;
    entries
        .into_iter()
        .filter(|e| e.seq > watermark)
        .filter(|e| snapshot.apply(e))
        .count()
}

/// The configured backend variant
pub enum AnyBackend {
    Memory(MemoryBackend),
    File(FileBackend),
    Sqlite(SqliteBackend),
}

impl AnyBackend {
    /// Open the backend selected by configuration
    pub fn open(config: &BackendConfig) -> Result<Self, BackendError> {
        let backend = match config.kind {
            BackendKind::Memory => Self::Memory(MemoryBackend::new()),
            BackendKind::File => Self::File(FileBackend::open(&config.resolved_path())?),
            BackendKind::Sqlite => Self::Sqlite(SqliteBackend::open(&config.resolved_path())?),
        };
        log::info!("opened {} backend", backend.kind());
        Ok(backend)
    }

    /// Store location, if the variant has one
    pub fn path(&self) -> Option<PathBuf> {
        match self {
            Self::Memory(_) => None,
            Self::File(b) => Some(b.dir().to_path_buf()),
            Self::Sqlite(b) => b.path().map(PathBuf::from),
        }
    }

    fn inner(&self) -> &dyn Backend {
        match self {
            Self::Memory(b) => b,
            Self::File(b) => b,
            Self::Sqlite(b) => b,
        }
    }
}

impl Backend for AnyBackend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn append(&self, entry: &LogEntry) -> Result<(), BackendError> {
        self.inner().append(entry)
    }

    fn flush_aggregates(&self, snapshot: &AggregateSnapshot) -> Result<(), BackendError> {
        self.inner().flush_aggregates(snapshot)
    }

    fn load_aggregates(&self) -> Result<Baseline, BackendError> {
        self.inner().load_aggregates()
    }

    fn read_page(
        &self,
        range: &TimeRange,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, BackendError> {
        self.inner().read_page(range, after, limit)
    }

    fn purge(&self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> Result<usize, BackendError> {
        self.inner().purge(predicate)
    }

    fn last_sequence(&self) -> Result<u64, BackendError> {
        self.inner().last_sequence()
    }

    fn ban(&self, word: &BannedWord) -> Result<bool, BackendError> {
        self.inner().ban(word)
    }

    fn unban(&self, text: &str) -> Result<bool, BackendError> {
        self.inner().unban(text)
    }

    fn banlist(&self) -> Result<Vec<BannedWord>, BackendError> {
        self.inner().banlist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, start: u64, seq: u64) -> LogEntry {
        LogEntry::new(text, InputMethod::Sequential, Timestamp(start), 10, "test")
            .unwrap()
            .sequenced(seq)
    }

    #[test]
    fn cursor_token_roundtrip() {
        let cursor = Cursor::new(Timestamp(1_700_000_000_000_000), 42);
        assert_eq!(cursor.token(), "1700000000000000:42");
        assert_eq!(cursor.token().parse::<Cursor>().unwrap(), cursor);
        assert!(matches!(
            "garbage".parse::<Cursor>(),
            Err(BackendError::InvalidCursor(_))
        ));
    }

    #[test]
    fn time_range_is_half_open() {
        let range = TimeRange::new(Timestamp(10), Timestamp(20));
        assert!(range.contains(Timestamp(10)));
        assert!(!range.contains(Timestamp(20)));
        assert!(TimeRange::new(Timestamp(5), Timestamp(5)).is_empty());
    }

    #[test]
    fn range_iter_pages_and_resumes() {
        let backend = MemoryBackend::new();
        for i in 1..=7u64 {
            backend.append(&entry("w", i * 10, i)).unwrap();
        }
        let range = TimeRange::new(Timestamp(20), Timestamp(70));
        let mut iter = RangeIter::new(&backend, range).with_page_size(2);
        let first: Vec<u64> = iter.by_ref().take(3).map(|e| e.unwrap().seq).collect();
        assert_eq!(first, vec![2, 3, 4]);

        let cursor = iter.cursor().unwrap();
        let token = cursor.token();
        let rest: Vec<u64> = RangeIter::resume(&backend, TimeRange::new(Timestamp(20), Timestamp(70)), token.parse().unwrap())
            .map(|e| e.unwrap().seq)
            .collect();
        assert_eq!(rest, vec![5, 6]);
    }

    #[test]
    fn replay_skips_entries_at_or_below_watermark() {
        let mut snapshot = AggregateSnapshot::default();
        snapshot.apply(&entry("cat", 1, 1));
        let applied = replay(&mut snapshot, vec![entry("cat", 1, 1), entry("cat", 2, 2), entry("dog", 3, 3)]);
        assert_eq!(applied, 2);
        assert_eq!(snapshot.get("cat", InputMethod::Sequential).unwrap().count, 2);
        assert_eq!(snapshot.watermark, 3);
    }

    #[test]
    fn backend_kind_parse() {
        assert_eq!(BackendKind::parse("SQLite"), Some(BackendKind::Sqlite));
        assert_eq!(BackendKind::parse("file"), Some(BackendKind::File));
        assert_eq!(BackendKind::parse("nope"), None);
        assert_eq!(BackendKind::default(), BackendKind::Sqlite);
    }
}
