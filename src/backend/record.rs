//! Versioned on-disk record formats for the file backend

use super::BackendError;
use crate::entry::{AggregateSnapshot, AggregateStat, InputMethod, LogEntry, Timestamp};
use serde::{Deserialize, Serialize};

/// Current entry record version
///
/// - v1: no `seq`; the line ordinal stands in for it
/// - v2: explicit `seq`
pub const RECORD_VERSION: u32 = 2;

/// Current snapshot file version
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    v: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    text: String,
    method: InputMethod,
    start: Timestamp,
    duration: u64,
    #[serde(default = "unknown_source")]
    source: String,
}

#[derive(Debug, Deserialize)]
struct VersionProbe {
    v: u32,
}

fn unknown_source() -> String {
    "unknown".to_string()
}

/// Encode an entry as one JSON line, newline included
pub fn encode_entry(entry: &LogEntry) -> Result<String, BackendError> {
    let record = EntryRecord {
        v: RECORD_VERSION,
        seq: Some(entry.seq),
        text: entry.text.clone(),
        method: entry.method,
        start: entry.start,
        duration: entry.duration_us,
        source: entry.source.clone(),
    };
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line; `ordinal` is the 1-based line number
pub fn decode_entry(line: &[u8], ordinal: u64) -> Result<LogEntry, BackendError> {
    let probe: VersionProbe = serde_json::from_slice(line)?;
    if probe.v > RECORD_VERSION {
        return Err(BackendError::SchemaMismatch {
            found: probe.v,
            supported: RECORD_VERSION,
        });
    }
    let record: EntryRecord = serde_json::from_slice(line)?;
    let seq = match record.v {
        1 => ordinal,
        RECORD_VERSION => record
            .seq
            .ok_or_else(|| BackendError::Corrupt(format!("record {} has no seq", ordinal)))?,
        other => {
            return Err(BackendError::Corrupt(format!(
                "record {} has unknown version {}",
                ordinal, other
            )))
        }
    };
    let entry = LogEntry::new(record.text, record.method, record.start, record.duration, record.source)
        .map_err(|e| BackendError::Corrupt(format!("record {}: {}", ordinal, e)))?;
    Ok(entry.sequenced(seq))
}

/// On-disk aggregate snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u32,
    pub watermark: u64,
    /// Log length in bytes when the snapshot was written
    pub log_len: u64,
    pub stats: Vec<AggregateStat>,
}

impl SnapshotFile {
    pub fn new(snapshot: &AggregateSnapshot, log_len: u64) -> Self {
        let mut stats: Vec<AggregateStat> = snapshot.stats.values().cloned().collect();
        stats.sort_by(|a, b| a.text.cmp(&b.text).then(a.method.cmp(&b.method)));
        Self {
            version: SNAPSHOT_VERSION,
            watermark: snapshot.watermark,
            log_len,
            stats,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BackendError> {
        let file: SnapshotFile = serde_json::from_slice(bytes)?;
        if file.version > SNAPSHOT_VERSION {
            return Err(BackendError::SchemaMismatch {
                found: file.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(file)
    }

    pub fn into_snapshot(self) -> AggregateSnapshot {
        AggregateSnapshot::new(self.watermark, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_entry_is_one_line() {
        let entry = LogEntry::new("cat", InputMethod::Sequential, Timestamp(5), 7, "kbd")
            .unwrap()
            .sequenced(3);
        let line = encode_entry(&entry).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(decode_entry(line.trim_end().as_bytes(), 99).unwrap(), entry);
    }

    #[test]
    fn v1_records_take_the_line_ordinal() {
        let line = br#"{"v":1,"text":"old","method":"chord","start":10,"duration":0}"#;
        let entry = decode_entry(line, 4).unwrap();
        assert_eq!(entry.seq, 4);
        assert_eq!(entry.method, InputMethod::Chord);
        assert_eq!(entry.source, "unknown");
    }

    #[test]
    fn future_records_are_a_schema_mismatch() {
        let line = br#"{"v":9,"seq":1,"payload":{"text":"x"}}"#;
        assert!(matches!(
            decode_entry(line, 1),
            Err(BackendError::SchemaMismatch { found: 9, .. })
        ));
    }

    #[test]
    fn v2_without_seq_is_corrupt() {
        let line = br#"{"v":2,"text":"x","method":"chord","start":1,"duration":0,"source":"s"}"#;
        assert!(matches!(decode_entry(line, 1), Err(BackendError::Corrupt(_))));
    }

    #[test]
    fn future_snapshot_is_rejected() {
        let bytes = br#"{"version":5,"watermark":0,"log_len":0,"stats":[]}"#;
        assert!(matches!(
            SnapshotFile::decode(bytes),
            Err(BackendError::SchemaMismatch { found: 5, .. })
        ));
    }
}
