//! Statistics report and export functionality

use crate::aggregator::SessionMetrics;
use crate::entry::{AggregateStat, InputMethod, Timestamp};
use crate::query::{CaseSensitivity, QueryError, QueryService, SortBy, TopFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Complete statistics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Summary statistics
    pub summary: ReportSummary,
    /// Sequentially typed words, most frequent first
    pub words: Vec<StatEntry>,
    /// Chorded entries, most frequent first
    pub chords: Vec<StatEntry>,
    /// Banned words, alphabetical
    pub banlist: Vec<BanEntry>,
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Report generation timestamp
    pub generated_at: String,
    /// Application version
    pub version: String,
    /// Storage variant the report was read from
    pub backend: String,
    /// Case mode used to group texts
    pub case: String,
}

/// Report summary statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub distinct_words: usize,
    pub distinct_chords: usize,
    pub total_words: u64,
    pub total_chords: u64,
    pub session: SessionSummary,
}

/// Counts for the running session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub chords: u64,
    pub words: u64,
    pub chords_per_minute: f64,
    pub words_per_minute: f64,
}

impl From<SessionMetrics> for SessionSummary {
    fn from(metrics: SessionMetrics) -> Self {
        Self {
            chords: metrics.chords,
            words: metrics.words,
            chords_per_minute: metrics.chords_per_minute,
            words_per_minute: metrics.words_per_minute,
        }
    }
}

/// One stat as exported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatEntry {
    pub text: String,
    pub count: u64,
    pub first_seen: String,
    pub last_seen: String,
    pub avg_duration_ms: f64,
}

fn rfc3339(ts: Timestamp) -> String {
    ts.to_datetime()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.as_micros().to_string())
}

impl From<&AggregateStat> for StatEntry {
    fn from(stat: &AggregateStat) -> Self {
        Self {
            text: stat.text.clone(),
            count: stat.count,
            first_seen: rfc3339(stat.first_seen),
            last_seen: rfc3339(stat.last_seen),
            avg_duration_ms: stat.avg_duration_ms(),
        }
    }
}

/// Write stats as CSV rows, headed by the field names when not empty
pub fn write_csv<W: Write>(stats: &[AggregateStat], out: W) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    for stat in stats {
        writer.serialize(StatEntry::from(stat))?;
    }
    writer.flush()?;
    Ok(())
}

/// Export stats to a CSV file
pub fn export_csv(stats: &[AggregateStat], path: &Path) -> Result<(), csv::Error> {
    write_csv(stats, File::create(path)?)
}

/// One banned word as exported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub text: String,
    pub added: String,
}

impl StatsReport {
    /// Build a report from everything the query service can see
    pub fn build(service: &QueryService, case: CaseSensitivity) -> Result<Self, QueryError> {
        let now: DateTime<Utc> = Utc::now();
        let listing = |method| {
            service.list(
                &TopFilter::method(method).with_case(case),
                SortBy::Count,
                true,
                None,
            )
        };
        let words = listing(InputMethod::Sequential);
        let chords = listing(InputMethod::Chord);
        let banlist = service
            .backend()
            .banlist()?
            .into_iter()
            .map(|w| BanEntry {
                added: rfc3339(w.added),
                text: w.text,
            })
            .collect();

        Ok(Self {
            metadata: ReportMetadata {
                generated_at: now.to_rfc3339(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                backend: service.backend().kind().to_string(),
                case: case.to_string(),
            },
            summary: ReportSummary {
                distinct_words: words.len(),
                distinct_chords: chords.len(),
                total_words: words.iter().map(|s| s.count).sum(),
                total_chords: chords.iter().map(|s| s.count).sum(),
                session: service.session_metrics().into(),
            },
            words: words.iter().map(StatEntry::from).collect(),
            chords: chords.iter().map(StatEntry::from).collect(),
            banlist,
        })
    }

    /// Export report to JSON file
    pub fn export_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Export report to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
