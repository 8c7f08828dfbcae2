//! SQLite backend
//!
//! # Schema
//!
//! - `entries`: the log, keyed by sequence number, indexed by `(start, seq)`
//! - `aggregates`: one row per `(text, method)`, upserted in the same
//!   transaction as each entry
//! - `banlist`: lower-cased banned words
//! - `meta`: schema version and checkpoint watermark
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch.

use super::{Backend, BackendError, BackendKind, Baseline, Cursor, TimeRange};
use crate::entry::{AggregateSnapshot, AggregateStat, BannedWord, InputMethod, LogEntry, Timestamp};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Current database schema version
pub const SCHEMA_VERSION: i64 = 1;

fn to_sql(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql(v: i64) -> u64 {
    v.max(0) as u64
}

fn parse_method(name: &str) -> Result<InputMethod, BackendError> {
    InputMethod::parse(name).ok_or_else(|| BackendError::Corrupt(format!("unknown input method '{}'", name)))
}

/// Backend storing everything in one SQLite database
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Open a database at the given path, creating it if necessary
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        let backend = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        backend.init()?;
        Ok(backend)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let backend = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        backend.init()?;
        Ok(backend)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create tables and check the schema version
    fn init(&self) -> Result<(), BackendError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                seq INTEGER PRIMARY KEY,
                text TEXT NOT NULL,
                method TEXT NOT NULL,
                start INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                source TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_start ON entries(start, seq);
            CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(text, method);

            CREATE TABLE IF NOT EXISTS aggregates (
                text TEXT NOT NULL,
                method TEXT NOT NULL,
                count INTEGER NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                total_duration INTEGER NOT NULL,
                last_seq INTEGER NOT NULL,
                PRIMARY KEY (text, method)
            );

            CREATE TABLE IF NOT EXISTS banlist (
                text TEXT PRIMARY KEY,
                added INTEGER NOT NULL
            );
            ",
        )?;

        let version: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(found) if found > SCHEMA_VERSION => {
                return Err(BackendError::SchemaMismatch {
                    found: found as u32,
                    supported: SCHEMA_VERSION as u32,
                })
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn watermark(conn: &Connection) -> Result<u64, BackendError> {
        let value: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'watermark'", [], |row| row.get(0))
            .optional()?;
        Ok(value.map_or(0, from_sql))
    }

    fn max_seq(conn: &Connection) -> Result<u64, BackendError> {
        let value: Option<i64> = conn.query_row("SELECT MAX(seq) FROM entries", [], |row| row.get(0))?;
        Ok(value.map_or(0, from_sql))
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn append(&self, entry: &LogEntry) -> Result<(), BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO entries (seq, text, method, start, duration, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                to_sql(entry.seq),
                entry.text,
                entry.method.name(),
                to_sql(entry.start.as_micros()),
                to_sql(entry.duration_us),
                entry.source,
            ],
        )?;
        tx.execute(
            "INSERT INTO aggregates (text, method, count, first_seen, last_seen, total_duration, last_seq)
             VALUES (?1, ?2, 1, ?3, ?3, ?4, ?5)
             ON CONFLICT(text, method) DO UPDATE SET
                count = count + 1,
                first_seen = MIN(first_seen, excluded.first_seen),
                last_seen = MAX(last_seen, excluded.last_seen),
                total_duration = total_duration + excluded.total_duration,
                last_seq = excluded.last_seq
             WHERE excluded.last_seq > aggregates.last_seq",
            params![
                entry.text,
                entry.method.name(),
                to_sql(entry.start.as_micros()),
                to_sql(entry.duration_us),
                to_sql(entry.seq),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn flush_aggregates(&self, snapshot: &AggregateSnapshot) -> Result<(), BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            // Rows already at or past the snapshot's stat are left alone
            let mut stmt = tx.prepare(
                "INSERT INTO aggregates (text, method, count, first_seen, last_seen, total_duration, last_seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(text, method) DO UPDATE SET
                    count = excluded.count,
                    first_seen = excluded.first_seen,
                    last_seen = excluded.last_seen,
                    total_duration = excluded.total_duration,
                    last_seq = excluded.last_seq
                 WHERE excluded.last_seq > aggregates.last_seq",
            )?;
            for stat in snapshot.stats.values() {
                stmt.execute(params![
                    stat.text,
                    stat.method.name(),
                    to_sql(stat.count),
                    to_sql(stat.first_seen.as_micros()),
                    to_sql(stat.last_seen.as_micros()),
                    to_sql(stat.total_duration_us),
                    to_sql(stat.last_seq),
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('watermark', ?1)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![to_sql(snapshot.watermark)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_aggregates(&self) -> Result<Baseline, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT text, method, count, first_seen, last_seen, total_duration, last_seq
             FROM aggregates",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut stats = Vec::new();
        for row in rows {
            let (text, method, count, first_seen, last_seen, total_duration, last_seq) = row?;
            stats.push(AggregateStat {
                text,
                method: parse_method(&method)?,
                count: from_sql(count),
                first_seen: Timestamp(from_sql(first_seen)),
                last_seen: Timestamp(from_sql(last_seen)),
                total_duration_us: from_sql(total_duration),
                last_seq: from_sql(last_seq),
            });
        }

        // Aggregate rows are written with their entries, so nothing needs replay
        let watermark = Self::watermark(&conn)?.max(Self::max_seq(&conn)?);
        let snapshot = AggregateSnapshot::new(watermark, stats);
        log::info!("loaded {} stats from database up to seq {}", snapshot.stats.len(), watermark);
        Ok(Baseline {
            snapshot,
            replayed: 0,
            warnings: Vec::new(),
        })
    }

    fn read_page(
        &self,
        range: &TimeRange,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, BackendError> {
        if range.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let (after_start, after_seq) = match after {
            Some(c) => (to_sql(c.start.as_micros()), to_sql(c.seq)),
            None => (-1, -1),
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, text, method, start, duration, source FROM entries
             WHERE start >= ?1 AND start < ?2
               AND (start > ?3 OR (start = ?3 AND seq > ?4))
             ORDER BY start ASC, seq ASC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                to_sql(range.since.as_micros()),
                to_sql(range.until.as_micros()),
                after_start,
                after_seq,
                to_sql(limit as u64),
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut page = Vec::new();
        for row in rows {
            let (seq, text, method, start, duration, source) = row?;
            let entry = LogEntry::new(
                text,
                parse_method(&method)?,
                Timestamp(from_sql(start)),
                from_sql(duration),
                source,
            )
            .map_err(|e| BackendError::Corrupt(format!("entry {}: {}", seq, e)))?;
            page.push(entry.sequenced(from_sql(seq)));
        }
        Ok(page)
    }

    fn purge(&self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> Result<usize, BackendError> {
        let mut conn = self.conn.lock();
        let keys: Vec<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT text, method FROM entries
                 UNION
                 SELECT text, method FROM aggregates",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        let tx = conn.transaction()?;
        let mut removed = 0;
        for (text, method) in keys {
            if !predicate(&text, parse_method(&method)?) {
                continue;
            }
            removed += tx.execute(
                "DELETE FROM entries WHERE text = ?1 AND method = ?2",
                params![text, method],
            )?;
            tx.execute(
                "DELETE FROM aggregates WHERE text = ?1 AND method = ?2",
                params![text, method],
            )?;
        }
        tx.commit()?;
        log::info!("purged {} entries from database", removed);
        Ok(removed)
    }

    fn last_sequence(&self) -> Result<u64, BackendError> {
        let conn = self.conn.lock();
        Ok(Self::max_seq(&conn)?.max(Self::watermark(&conn)?))
    }

    fn ban(&self, word: &BannedWord) -> Result<bool, BackendError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO banlist (text, added) VALUES (?1, ?2)",
            params![word.text, to_sql(word.added.as_micros())],
        )?;
        Ok(inserted == 1)
    }

    fn unban(&self, text: &str) -> Result<bool, BackendError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM banlist WHERE text = ?1", params![text.to_lowercase()])?;
        Ok(deleted > 0)
    }

    fn banlist(&self) -> Result<Vec<BannedWord>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT text, added FROM banlist ORDER BY text ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(BannedWord {
                text: row.get(0)?,
                added: Timestamp(from_sql(row.get(1)?)),
            })
        })?;
        let mut words = Vec::new();
        for row in rows {
            words.push(row?);
        }
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(text: &str, method: InputMethod, start: u64, seq: u64) -> LogEntry {
        LogEntry::new(text, method, Timestamp(start), 10, "test")
            .unwrap()
            .sequenced(seq)
    }

    #[test]
    fn append_maintains_aggregates() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.append(&entry("cat", InputMethod::Sequential, 10, 1)).unwrap();
        backend.append(&entry("cat", InputMethod::Sequential, 20, 2)).unwrap();
        backend.append(&entry("dog", InputMethod::Sequential, 30, 3)).unwrap();

        let baseline = backend.load_aggregates().unwrap();
        let cat = baseline.snapshot.get("cat", InputMethod::Sequential).unwrap();
        assert_eq!(cat.count, 2);
        assert_eq!(cat.first_seen, Timestamp(10));
        assert_eq!(cat.last_seen, Timestamp(20));
        assert_eq!(cat.total_duration_us, 20);
        assert_eq!(cat.last_seq, 2);
        assert_eq!(baseline.snapshot.watermark, 3);
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let e = entry("cat", InputMethod::Sequential, 10, 1);
        backend.append(&e).unwrap();
        assert!(matches!(backend.append(&e), Err(BackendError::Database(_))));
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.snapshot.total_count(), 1);
    }

    #[test]
    fn reopen_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("freqlog.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.append(&entry("the", InputMethod::Chord, 10, 1)).unwrap();
            backend.append(&entry("the", InputMethod::Sequential, 20, 2)).unwrap();
            backend.ban(&BannedWord::new("Secret", Timestamp(5))).unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.path(), Some(path.as_path()));
        assert_eq!(backend.last_sequence().unwrap(), 2);
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.snapshot.stats.len(), 2);
        assert_eq!(backend.banlist().unwrap()[0].text, "secret");
    }

    #[test]
    fn checkpoint_only_moves_rows_forward() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.append(&entry("cat", InputMethod::Sequential, 10, 1)).unwrap();
        backend.append(&entry("cat", InputMethod::Sequential, 20, 2)).unwrap();

        // Stale checkpoint: must not roll the row back
        let mut stale = AggregateSnapshot::default();
        stale.apply(&entry("cat", InputMethod::Sequential, 10, 1));
        backend.flush_aggregates(&stale).unwrap();
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.snapshot.get("cat", InputMethod::Sequential).unwrap().count, 2);

        // Checkpoint ahead of the log: its counts win
        let mut ahead = AggregateSnapshot::default();
        for seq in 1..=3 {
            ahead.apply(&entry("cat", InputMethod::Sequential, seq * 10, seq));
        }
        backend.flush_aggregates(&ahead).unwrap();
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.snapshot.get("cat", InputMethod::Sequential).unwrap().count, 3);
        assert_eq!(backend.last_sequence().unwrap(), 3);
    }

    #[test]
    fn pages_follow_start_then_seq() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.append(&entry("c", InputMethod::Sequential, 30, 1)).unwrap();
        backend.append(&entry("a", InputMethod::Sequential, 10, 2)).unwrap();
        backend.append(&entry("b", InputMethod::Sequential, 10, 3)).unwrap();
        backend.append(&entry("d", InputMethod::Sequential, 99, 4)).unwrap();

        let range = TimeRange::new(Timestamp(0), Timestamp(50));
        let first = backend.read_page(&range, None, 2).unwrap();
        assert_eq!(first.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        let rest = backend.read_page(&range, Some(Cursor::of(&first[1])), 2).unwrap();
        assert_eq!(rest.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn purge_deletes_entries_and_rows() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.append(&entry("secret", InputMethod::Sequential, 10, 1)).unwrap();
        backend.append(&entry("secret", InputMethod::Chord, 20, 2)).unwrap();
        backend.append(&entry("open", InputMethod::Sequential, 30, 3)).unwrap();

        assert_eq!(backend.purge(&|text, _| text == "secret").unwrap(), 2);
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.snapshot.stats.len(), 1);
        assert_eq!(backend.read_page(&TimeRange::all(), None, 10).unwrap().len(), 1);
    }

    #[test]
    fn future_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE meta (key TEXT PRIMARY KEY, value INTEGER NOT NULL);
                 INSERT INTO meta VALUES ('schema_version', 99);",
            )
            .unwrap();
        }
        assert!(matches!(
            SqliteBackend::open(&path),
            Err(BackendError::SchemaMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn ban_and_unban() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(backend.ban(&BannedWord::new("word", Timestamp(1))).unwrap());
        assert!(!backend.ban(&BannedWord::new("WORD", Timestamp(2))).unwrap());
        assert!(backend.unban("Word").unwrap());
        assert!(!backend.unban("word").unwrap());
        assert!(backend.banlist().unwrap().is_empty());
    }
}
