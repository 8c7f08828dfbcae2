//! Append-log file backend
//!
//! Layout of the store directory:
//!
//! - `entries.log`: one JSON record per line, appended and synced per entry
//! - `aggregates.json`: latest aggregate checkpoint, replaced atomically
//! - `banlist.json`: banned words, replaced atomically
//!
//! Opening the store scans the log, truncates a torn final record and builds
//! an in-memory index by sequence number and by `(start, seq)`.

use super::record::{self, SnapshotFile};
use super::{replay, Backend, BackendError, BackendKind, Baseline, Cursor, TimeRange};
use crate::entry::{AggregateSnapshot, BannedWord, InputMethod, LogEntry};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "entries.log";
const SNAPSHOT_FILE: &str = "aggregates.json";
const BANLIST_FILE: &str = "banlist.json";

/// Byte span of one record in the log, newline excluded
#[derive(Debug, Clone, Copy)]
struct Location {
    offset: u64,
    len: usize,
}

#[derive(Debug, Default)]
struct LogIndex {
    by_seq: BTreeMap<u64, Location>,
    by_time: BTreeMap<Cursor, Location>,
    last_seq: u64,
}

impl LogIndex {
    fn insert(&mut self, entry: &LogEntry, location: Location) {
        self.by_seq.insert(entry.seq, location);
        self.by_time.insert(Cursor::of(entry), location);
        self.last_seq = self.last_seq.max(entry.seq);
    }
}

struct ScanResult {
    valid_len: u64,
    index: LogIndex,
    warnings: Vec<String>,
}

struct FileState {
    writer: File,
    reader: File,
    log_len: u64,
    index: LogIndex,
    snapshot_watermark: u64,
    banlist: BTreeMap<String, BannedWord>,
    /// Problems found while opening, reported by the next load
    open_warnings: Vec<String>,
}

impl FileState {
    fn read_at(&mut self, location: Location) -> Result<LogEntry, BackendError> {
        let mut buf = vec![0u8; location.len];
        self.reader.seek(SeekFrom::Start(location.offset))?;
        self.reader.read_exact(&mut buf)?;
        // v1 records carry no seq; callers take it from the index
        record::decode_entry(&buf, 0)
    }
}

/// File-based backend storing a JSON-lines log plus a snapshot
pub struct FileBackend {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl FileBackend {
    /// Open or create a store in `dir`
    pub fn open(dir: &Path) -> Result<Self, BackendError> {
        fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE);
        let mut writer = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        let scan = scan_log(&mut writer)?;
        let reader = File::open(&log_path)?;

        let snapshot_watermark = match read_snapshot(dir) {
            Ok(Some(file)) => file.watermark,
            _ => 0,
        };
        let banlist = load_banlist(dir)?;

        log::debug!(
            "opened {} with {} records, last seq {}",
            log_path.display(),
            scan.index.by_seq.len(),
            scan.index.last_seq
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(FileState {
                writer,
                reader,
                log_len: scan.valid_len,
                index: scan.index,
                snapshot_watermark,
                banlist,
                open_warnings: scan.warnings,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn write_banlist(&self, banlist: &BTreeMap<String, BannedWord>) -> Result<(), BackendError> {
        let words: Vec<&BannedWord> = banlist.values().collect();
        let bytes = serde_json::to_vec_pretty(&words)?;
        write_atomic(&self.dir.join(BANLIST_FILE), &bytes)
    }
}

impl Backend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn append(&self, entry: &LogEntry) -> Result<(), BackendError> {
        let line = record::encode_entry(entry)?;
        let mut state = self.state.lock();
        let offset = state.log_len;

        let written = state
            .writer
            .write_all(line.as_bytes())
            .and_then(|_| state.writer.sync_data());
        if let Err(e) = written {
            // Drop any partial line so the log stays a sequence of whole records
            if let Err(trunc) = state.writer.set_len(offset) {
                log::error!("failed to roll back partial append: {}", trunc);
            }
            return Err(e.into());
        }

        state.log_len += line.len() as u64;
        state.index.insert(
            entry,
            Location {
                offset,
                len: line.len() - 1,
            },
        );
        Ok(())
    }

    fn flush_aggregates(&self, snapshot: &AggregateSnapshot) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let file = SnapshotFile::new(snapshot, state.log_len);
        let bytes = serde_json::to_vec(&file)?;
        write_atomic(&self.snapshot_path(), &bytes)?;
        state.snapshot_watermark = snapshot.watermark;
        log::debug!("checkpoint at seq {} ({} stats)", snapshot.watermark, file.stats.len());
        Ok(())
    }

    fn load_aggregates(&self) -> Result<Baseline, BackendError> {
        let mut state = self.state.lock();
        let mut warnings = std::mem::take(&mut state.open_warnings);

        let mut snapshot = match read_snapshot(&self.dir) {
            Ok(Some(file)) => {
                if file.log_len > state.log_len {
                    warnings.push(format!(
                        "log is shorter than at the last checkpoint ({} < {} bytes); \
                         keeping checkpoint counts, history is incomplete",
                        state.log_len, file.log_len
                    ));
                }
                file.into_snapshot()
            }
            Ok(None) => AggregateSnapshot::default(),
            Err(e @ BackendError::SchemaMismatch { .. }) => return Err(e),
            Err(e) => {
                warnings.push(format!("checkpoint unreadable ({}), replaying full log", e));
                AggregateSnapshot::default()
            }
        };

        let pending: Vec<(u64, Location)> = state
            .index
            .by_seq
            .range(snapshot.watermark + 1..)
            .map(|(seq, loc)| (*seq, *loc))
            .collect();
        let mut entries = Vec::with_capacity(pending.len());
        for (seq, location) in pending {
            entries.push(state.read_at(location)?.sequenced(seq));
        }
        let replayed = replay(&mut snapshot, entries);

        for warning in &warnings {
            log::warn!("{}", warning);
        }
        log::info!(
            "loaded {} stats from {}, replayed {} records",
            snapshot.stats.len(),
            self.dir.display(),
            replayed
        );
        Ok(Baseline {
            snapshot,
            replayed,
            warnings,
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

        let mut state = self.state.lock();
        let hits: Vec<(Cursor, Location)> = state
            .index
            .by_time
            .range((lower, upper))
            .take(limit)
            .map(|(c, l)| (*c, *l))
            .collect();
        let mut page = Vec::with_capacity(hits.len());
        for (cursor, location) in hits {
            page.push(state.read_at(location)?.sequenced(cursor.seq));
        }
        Ok(page)
    }

    fn purge(&self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> Result<usize, BackendError> {
        let mut state = self.state.lock();

        let mut snapshot = match read_snapshot(&self.dir) {
            Ok(Some(file)) => Some(file.into_snapshot()),
            _ => None,
        };
        let dropped = snapshot.as_mut().map_or(0, |s| s.retain_unmatched(predicate));

        let locations: Vec<(u64, Location)> =
            state.index.by_seq.iter().map(|(s, l)| (*s, *l)).collect();
        let mut kept = String::new();
        let mut removed = 0;
        for (seq, location) in locations {
            let entry = state.read_at(location)?.sequenced(seq);
            if predicate(&entry.text, entry.method) {
                removed += 1;
                continue;
            }
            if let Some(snapshot) = snapshot.as_mut() {
                if seq > snapshot.watermark {
                    snapshot.apply(&entry);
                }
            }
            kept.push_str(&record::encode_entry(&entry)?);
        }

        // Checkpoint covers the whole log and lands before the log rewrite
        if let Some(mut snapshot) = snapshot {
            if dropped > 0 || removed > 0 {
                snapshot.watermark = snapshot.watermark.max(state.index.last_seq);
                let log_len = if removed > 0 { kept.len() as u64 } else { state.log_len };
                let file = SnapshotFile::new(&snapshot, log_len);
                write_atomic(&self.snapshot_path(), &serde_json::to_vec(&file)?)?;
                state.snapshot_watermark = snapshot.watermark;
            }
        }

        if removed > 0 {
            let log_path = self.log_path();
            write_atomic(&log_path, kept.as_bytes())?;
            let mut writer = OpenOptions::new().read(true).append(true).open(&log_path)?;
            let scan = scan_log(&mut writer)?;
            state.reader = File::open(&log_path)?;
            state.writer = writer;
            state.log_len = scan.valid_len;
            state.index = scan.index;
        }

        log::info!("purged {} records from {}", removed, self.dir.display());
        Ok(removed)
    }

    fn last_sequence(&self) -> Result<u64, BackendError> {
        let state = self.state.lock();
        Ok(state.index.last_seq.max(state.snapshot_watermark))
    }

    fn ban(&self, word: &BannedWord) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        if state.banlist.contains_key(&word.text) {
            return Ok(false);
        }
        state.banlist.insert(word.text.clone(), word.clone());
        self.write_banlist(&state.banlist)?;
        Ok(true)
    }

    fn unban(&self, text: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        if state.banlist.remove(&text.to_lowercase()).is_none() {
            return Ok(false);
        }
        self.write_banlist(&state.banlist)?;
        Ok(true)
    }

    fn banlist(&self) -> Result<Vec<BannedWord>, BackendError> {
        Ok(self.state.lock().banlist.values().cloned().collect())
    }
}

/// Index every complete record and cut off a torn tail
fn scan_log(file: &mut File) -> Result<ScanResult, BackendError> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut index = LogIndex::default();
    let mut warnings = Vec::new();
    let mut offset = 0usize;
    let mut ordinal = 0u64;

    while offset < bytes.len() {
        let Some(newline) = bytes[offset..].iter().position(|&b| b == b'\n') else {
            break;
        };
        let line = &bytes[offset..offset + newline];
        let next = offset + newline + 1;
        ordinal += 1;

        if !line.is_empty() {
            match record::decode_entry(line, ordinal) {
                Ok(entry) => index.insert(
                    &entry,
                    Location {
                        offset: offset as u64,
                        len: newline,
                    },
                ),
                Err(e @ BackendError::SchemaMismatch { .. }) => return Err(e),
                Err(_) if next == bytes.len() => break,
                Err(e) => warnings.push(format!("skipping unreadable record {}: {}", ordinal, e)),
            }
        }
        offset = next;
    }

    if offset < bytes.len() {
        warnings.push(format!(
            "truncated torn tail of {} bytes",
            bytes.len() - offset
        ));
        file.set_len(offset as u64)?;
        file.sync_data()?;
    }
    file.seek(SeekFrom::End(0))?;

    Ok(ScanResult {
        valid_len: offset as u64,
        index,
        warnings,
    })
}

fn read_snapshot(dir: &Path) -> Result<Option<SnapshotFile>, BackendError> {
    match fs::read(dir.join(SNAPSHOT_FILE)) {
        Ok(bytes) => SnapshotFile::decode(&bytes).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_banlist(dir: &Path) -> Result<BTreeMap<String, BannedWord>, BackendError> {
    let bytes = match fs::read(dir.join(BANLIST_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let words: Vec<BannedWord> = serde_json::from_slice(&bytes)?;
    Ok(words.into_iter().map(|w| (w.text.clone(), w)).collect())
}

/// Write to a temporary sibling, sync, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_parent(path)
}

/// Make a rename in `path`'s directory durable
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<(), BackendError> {
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<(), BackendError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Timestamp;
    use tempfile::tempdir;

    fn entry(text: &str, method: InputMethod, start: u64, seq: u64) -> LogEntry {
        LogEntry::new(text, method, Timestamp(start), 10, "test")
            .unwrap()
            .sequenced(seq)
    }

    fn cat_cat_dog(backend: &FileBackend) {
        backend.append(&entry("cat", InputMethod::Sequential, 10, 1)).unwrap();
        backend.append(&entry("cat", InputMethod::Sequential, 20, 2)).unwrap();
        backend.append(&entry("dog", InputMethod::Sequential, 30, 3)).unwrap();
    }

    #[test]
    fn reopen_recovers_counts_and_sequence() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            cat_cat_dog(&backend);
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.last_sequence().unwrap(), 3);
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.replayed, 3);
        assert!(baseline.warnings.is_empty());
        assert_eq!(baseline.snapshot.get("cat", InputMethod::Sequential).unwrap().count, 2);
        assert_eq!(baseline.snapshot.get("dog", InputMethod::Sequential).unwrap().count, 1);
    }

    #[test]
    fn checkpoint_limits_replay() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        cat_cat_dog(&backend);
        let mut snap = AggregateSnapshot::default();
        snap.apply(&entry("cat", InputMethod::Sequential, 10, 1));
        snap.apply(&entry("cat", InputMethod::Sequential, 20, 2));
        backend.flush_aggregates(&snap).unwrap();
        drop(backend);

        let backend = FileBackend::open(dir.path()).unwrap();
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.replayed, 1);
        assert_eq!(baseline.snapshot.total_count(), 3);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            cat_cat_dog(&backend);
        }
        let log_path = dir.path().join(LOG_FILE);
        let valid_len = fs::metadata(&log_path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&log_path).unwrap();
            f.write_all(br#"{"v":2,"seq":4,"text":"ha"#).unwrap();
        }

        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(fs::metadata(&log_path).unwrap().len(), valid_len);
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.warnings.len(), 1);
        assert_eq!(baseline.snapshot.total_count(), 3);

        backend.append(&entry("emu", InputMethod::Chord, 40, 4)).unwrap();
        drop(backend);
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.last_sequence().unwrap(), 4);
    }

    #[test]
    fn v1_log_is_migrated_on_read() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(LOG_FILE),
            concat!(
                r#"{"v":1,"text":"old","method":"sequential","start":100,"duration":5}"#,
                "\n",
                r#"{"v":1,"text":"old","method":"sequential","start":50,"duration":5}"#,
                "\n",
            ),
        )
        .unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.last_sequence().unwrap(), 2);

        let page = backend.read_page(&TimeRange::all(), None, 10).unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 1]);

        let baseline = backend.load_aggregates().unwrap();
        let stat = baseline.snapshot.get("old", InputMethod::Sequential).unwrap();
        assert_eq!(stat.count, 2);
        assert_eq!(stat.last_seq, 2);

        backend.append(&entry("new", InputMethod::Sequential, 200, 3)).unwrap();
        assert_eq!(backend.read_page(&TimeRange::all(), None, 10).unwrap().len(), 3);
    }

    #[test]
    fn future_log_version_refuses_to_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), "{\"v\":7,\"seq\":1}\n").unwrap();
        assert!(matches!(
            FileBackend::open(dir.path()),
            Err(BackendError::SchemaMismatch { found: 7, .. })
        ));
    }

    #[test]
    fn corrupt_checkpoint_falls_back_to_full_replay() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        cat_cat_dog(&backend);
        fs::write(backend.snapshot_path(), b"{ not json").unwrap();

        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.replayed, 3);
        assert_eq!(baseline.warnings.len(), 1);
        assert!(baseline.warnings[0].contains("replaying full log"));
        assert_eq!(baseline.snapshot.total_count(), 3);
    }

    #[test]
    fn checkpoint_ahead_of_log_keeps_checkpoint_counts() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.append(&entry("cat", InputMethod::Sequential, 10, 1)).unwrap();
        let mut snap = AggregateSnapshot::default();
        snap.apply(&entry("cat", InputMethod::Sequential, 10, 1));
        snap.apply(&entry("cat", InputMethod::Sequential, 20, 2));
        backend.flush_aggregates(&snap).unwrap();
        // Lose the last log bytes as an unclean shutdown might
        let len = fs::metadata(backend.log_path()).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(backend.log_path())
            .unwrap()
            .set_len(len - 1)
            .unwrap();
        drop(backend);

        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.last_sequence().unwrap(), 2);
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.snapshot.get("cat", InputMethod::Sequential).unwrap().count, 2);
        assert!(baseline.warnings.iter().any(|w| w.contains("shorter")));
    }

    #[test]
    fn purge_rewrites_log_and_checkpoint() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        cat_cat_dog(&backend);
        let mut snap = AggregateSnapshot::default();
        snap.apply(&entry("cat", InputMethod::Sequential, 10, 1));
        backend.flush_aggregates(&snap).unwrap();

        assert_eq!(backend.purge(&|text, _| text == "cat").unwrap(), 2);
        assert_eq!(backend.read_page(&TimeRange::all(), None, 10).unwrap().len(), 1);
        drop(backend);

        let backend = FileBackend::open(dir.path()).unwrap();
        let baseline = backend.load_aggregates().unwrap();
        assert!(baseline.snapshot.get("cat", InputMethod::Sequential).is_none());
        assert_eq!(baseline.snapshot.total_count(), 1);
        assert_eq!(backend.last_sequence().unwrap(), 3);
    }

    #[test]
    fn purge_survives_crash_before_log_rewrite() {
        let dir = tempdir().unwrap();
        let log_copy = dir.path().join("old.log");
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            cat_cat_dog(&backend);
            let mut snap = AggregateSnapshot::default();
            snap.apply(&entry("cat", InputMethod::Sequential, 10, 1));
            backend.flush_aggregates(&snap).unwrap();
            fs::copy(dir.path().join(LOG_FILE), &log_copy).unwrap();

            assert_eq!(backend.purge(&|text, _| text == "cat").unwrap(), 2);
        }
        // Put back the log as it was before the rewrite
        fs::rename(&log_copy, dir.path().join(LOG_FILE)).unwrap();

        let backend = FileBackend::open(dir.path()).unwrap();
        let baseline = backend.load_aggregates().unwrap();
        assert_eq!(baseline.replayed, 0);
        assert!(baseline.warnings.is_empty());
        assert!(baseline.snapshot.get("cat", InputMethod::Sequential).is_none());
        assert_eq!(baseline.snapshot.get("dog", InputMethod::Sequential).unwrap().count, 1);
        assert_eq!(baseline.snapshot.watermark, 3);
    }

    #[test]
    fn banlist_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            assert!(backend.ban(&BannedWord::new("Secret", Timestamp(1))).unwrap());
            assert!(backend.ban(&BannedWord::new("other", Timestamp(2))).unwrap());
            assert!(backend.unban("other").unwrap());
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        let words = backend.banlist().unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].text, "secret");
    }
}
