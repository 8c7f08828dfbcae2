//! Read-only query facade over the aggregator and the backend

use crate::aggregator::{rank, Aggregator, SessionMetrics};
use crate::backend::{Backend, BackendError, RangeIter};
use crate::entry::{AggregateSnapshot, AggregateStat, InputMethod, StatKey, Timestamp};
use crate::report::StatsReport;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no {method} entry for '{text}'")]
    NotFound { text: String, method: InputMethod },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// How text is compared when grouping and matching stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseSensitivity {
    Sensitive,
    #[default]
    Insensitive,
    /// Only the case of the first character is ignored
    FirstChar,
}

impl CaseSensitivity {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sensitive => "sensitive",
            Self::Insensitive => "insensitive",
            Self::FirstChar => "first-char",
        }
    }

    /// Canonical form of `text` under this mode
    pub fn fold(&self, text: &str) -> String {
        match self {
            Self::Sensitive => text.to_string(),
            Self::Insensitive => text.to_lowercase(),
            Self::FirstChar => {
                let mut chars = text.chars();
                match chars.next() {
                    Some(first) => first.to_lowercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        }
    }

    pub fn matches(&self, a: &str, b: &str) -> bool {
        self.fold(a) == self.fold(b)
    }
}

impl FromStr for CaseSensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "sensitive" => Ok(Self::Sensitive),
            "insensitive" => Ok(Self::Insensitive),
            "first-char" | "firstchar" => Ok(Self::FirstChar),
            other => Err(format!(
                "unknown case mode '{}' (expected sensitive, insensitive or first-char)",
                other
            )),
        }
    }
}

impl fmt::Display for CaseSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sort key for listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    Count,
    LastSeen,
    AvgDuration,
    Text,
}

impl SortBy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::LastSeen => "last-seen",
            Self::AvgDuration => "avg-duration",
            Self::Text => "text",
        }
    }

    /// Ascending order by this key
    pub fn compare(&self, a: &AggregateStat, b: &AggregateStat) -> Ordering {
        match self {
            Self::Count => a.count.cmp(&b.count),
            Self::LastSeen => a.last_seen.cmp(&b.last_seen),
            Self::AvgDuration => a.avg_duration_ms().total_cmp(&b.avg_duration_ms()),
            Self::Text => a.text.cmp(&b.text),
        }
    }
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "count" | "frequency" => Ok(Self::Count),
            "last-seen" | "lastseen" => Ok(Self::LastSeen),
            "avg-duration" | "duration" => Ok(Self::AvgDuration),
            "text" | "word" => Ok(Self::Text),
            other => Err(format!(
                "unknown sort key '{}' (expected count, last-seen, avg-duration or text)",
                other
            )),
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Restrictions applied by [`QueryService::top`] and [`QueryService::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopFilter {
    pub method: Option<InputMethod>,
    /// Keep stats last seen at or after this time
    pub since: Option<Timestamp>,
    pub case: CaseSensitivity,
    /// Substring the text must contain
    pub search: Option<String>,
}

impl TopFilter {
    pub fn method(method: InputMethod) -> Self {
        Self {
            method: Some(method),
            ..Self::default()
        }
    }

    pub fn with_case(mut self, case: CaseSensitivity) -> Self {
        self.case = case;
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    fn keeps(&self, stat: &AggregateStat) -> bool {
        if self.method.is_some_and(|m| m != stat.method) {
            return false;
        }
        if self.since.is_some_and(|t| stat.last_seen < t) {
            return false;
        }
        match &self.search {
            Some(needle) => self.case.fold(&stat.text).contains(&self.case.fold(needle)),
            None => true,
        }
    }
}

/// Merge stats whose texts are equal under `case`
fn fold_case(stats: Vec<AggregateStat>, case: CaseSensitivity) -> Vec<AggregateStat> {
    if case == CaseSensitivity::Sensitive {
        return stats;
    }
    let mut folded: HashMap<StatKey, AggregateStat> = HashMap::new();
    for mut stat in stats {
        stat.text = case.fold(&stat.text);
        match folded.get_mut(&stat.key()) {
            Some(existing) => existing.merge(&stat),
            None => {
                folded.insert(stat.key(), stat);
            }
        }
    }
    folded.into_values().collect()
}

/// Read-only view over live and persisted statistics
#[derive(Clone)]
pub struct QueryService {
    aggregator: Arc<Aggregator>,
    backend: Arc<dyn Backend>,
    /// Stored statistics, consulted until the aggregator is seeded
    baseline: Option<Arc<AggregateSnapshot>>,
}

impl QueryService {
    pub fn new(aggregator: Arc<Aggregator>, backend: Arc<dyn Backend>) -> Self {
        Self {
            aggregator,
            backend,
            baseline: None,
        }
    }

    /// Query a store without seeding an aggregator from it
    ///
    /// Stored statistics are read once and merged with whatever the empty
    /// aggregator records until something seeds it.
    pub fn cold(backend: Arc<dyn Backend>) -> Result<Self, BackendError> {
        let loaded = backend.load_aggregates()?;
        for warning in &loaded.warnings {
            log::warn!("{}", warning);
        }
        Ok(Self::new(Arc::new(Aggregator::new()), backend).with_baseline(loaded.snapshot))
    }

    pub fn with_baseline(mut self, baseline: AggregateSnapshot) -> Self {
        self.baseline = Some(Arc::new(baseline));
        self
    }

    /// Stored statistics in use, if the aggregator is not seeded yet
    fn cold_baseline(&self) -> Option<&AggregateSnapshot> {
        match &self.baseline {
            Some(b) if !self.aggregator.is_seeded() => Some(b),
            _ => None,
        }
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Every known stat, keyed exactly
    fn all_stats(&self) -> Vec<AggregateStat> {
        let live = self.aggregator.stats();
        let Some(baseline) = self.cold_baseline() else {
            return live;
        };
        let mut merged: HashMap<StatKey, AggregateStat> = baseline
            .stats
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        for stat in live {
            match merged.get_mut(&stat.key()) {
                Some(existing) => existing.merge(&stat),
                None => {
                    merged.insert(stat.key(), stat);
                }
            }
        }
        merged.into_values().collect()
    }

    fn filtered(&self, filter: &TopFilter) -> Vec<AggregateStat> {
        let stats = self
            .all_stats()
            .into_iter()
            .filter(|s| filter.method.map_or(true, |m| m == s.method))
            .collect();
        fold_case(stats, filter.case)
            .into_iter()
            .filter(|s| filter.keeps(s))
            .collect()
    }

    /// The `n` most frequent stats matching the filter
    pub fn top(&self, n: usize, filter: &TopFilter) -> Vec<AggregateStat> {
        let mut stats = self.filtered(filter);
        stats.sort_by(rank);
        stats.truncate(n);
        stats
    }

    /// Exact lookup
    pub fn lookup(&self, text: &str, method: InputMethod) -> Result<AggregateStat, QueryError> {
        self.lookup_with(text, method, CaseSensitivity::Sensitive)
    }

    /// Lookup merging every text equal to `text` under `case`
    pub fn lookup_with(
        &self,
        text: &str,
        method: InputMethod,
        case: CaseSensitivity,
    ) -> Result<AggregateStat, QueryError> {
        if case == CaseSensitivity::Sensitive && self.cold_baseline().is_none() {
            return self.aggregator.lookup(text, method);
        }
        let wanted = case.fold(text);
        let filter = TopFilter::method(method).with_case(case);
        self.filtered(&filter)
            .into_iter()
            .find(|s| s.text == wanted)
            .ok_or_else(|| QueryError::NotFound {
                text: text.to_string(),
                method,
            })
    }

    /// Stats matching the filter, sorted by `sort_by`
    ///
    /// Equal sort keys fall back to the top-N ranking.
    pub fn list(
        &self,
        filter: &TopFilter,
        sort_by: SortBy,
        descending: bool,
        limit: Option<usize>,
    ) -> Vec<AggregateStat> {
        let mut stats = self.filtered(filter);
        stats.sort_by(|a, b| {
            let ord = sort_by.compare(a, b);
            let ord = if descending { ord.reverse() } else { ord };
            ord.then_with(|| rank(a, b))
        });
        if let Some(limit) = limit {
            stats.truncate(limit);
        }
        stats
    }

    /// Number of distinct texts for a method (all methods when `None`)
    pub fn distinct(&self, method: Option<InputMethod>, case: CaseSensitivity) -> usize {
        let filter = TopFilter {
            method,
            case,
            ..TopFilter::default()
        };
        let mut texts: Vec<String> = self.filtered(&filter).into_iter().map(|s| s.text).collect();
        texts.sort();
        texts.dedup();
        texts.len()
    }

    /// Average duration in milliseconds of entries for `text`
    pub fn average_duration_ms(
        &self,
        text: &str,
        method: InputMethod,
        case: CaseSensitivity,
    ) -> Result<f64, QueryError> {
        Ok(self.lookup_with(text, method, case)?.avg_duration_ms())
    }

    /// Persisted entries with `since <= start < until`, in `(start, seq)` order
    pub fn query_range(&self, since: Timestamp, until: Timestamp) -> RangeIter<'_> {
        self.backend.query_range(since, until)
    }

    /// Persisted entries per minute over `[since, until)`
    ///
    /// The window never counts as less than one minute.
    pub fn rate_per_minute(
        &self,
        method: Option<InputMethod>,
        since: Timestamp,
        until: Timestamp,
    ) -> Result<f64, QueryError> {
        let mut count = 0u64;
        for entry in self.query_range(since, until) {
            let entry = entry?;
            if method.map_or(true, |m| m == entry.method) {
                count += 1;
            }
        }
        let minutes = (until.micros_since(since) as f64 / 60_000_000.0).max(1.0);
        Ok(count as f64 / minutes)
    }

    pub fn session_metrics(&self) -> SessionMetrics {
        self.aggregator.session_metrics()
    }

    /// Full statistics report
    pub fn report(&self, case: CaseSensitivity) -> Result<StatsReport, QueryError> {
        StatsReport::build(self, case)
    }
}
