//! Command line definitions and handlers

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use freqlog::backend::{AnyBackend, BackendKind, Cursor, RangeIter, TimeRange, DEFAULT_PAGE_SIZE};
use freqlog::config::BackendConfig;
use freqlog::entry::{AggregateStat, InputMethod, Timestamp};
use freqlog::keyboard::{RawSignal, ReplaySource};
use freqlog::query::{CaseSensitivity, QueryService, SortBy, TopFilter};
use freqlog::report::export_csv;
use freqlog::{BanDate, Config, Freqlog};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Number of rows listed when `--num` is not given
const DEFAULT_NUM: usize = 10;

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    /// `checkword` found a banned word
    Banned = 1,
    InvalidArgument = 3,
    StoreAccess = 4,
    NotFound = 5,
    /// Word already banned, or not banned when unbanning
    Unchanged = 6,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Word and chord frequency logger for chorded keyboards
#[derive(Parser)]
#[command(name = "freqlog", version, about, propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// One of error, warn, info, debug, trace, off
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Storage backend, overriding the config file
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendArg>,

    /// Store location, overriding the config file
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start logging keyboard input until interrupted
    Startlog(StartArgs),
    /// Show logged words
    Words(ListArgs),
    /// Show logged chords
    Chords(ListArgs),
    /// Count distinct logged words
    Numwords {
        #[arg(short, long, value_enum, default_value = "insensitive")]
        case: CaseArg,
    },
    /// Show banned words
    Banlist {
        #[arg(short, long, value_enum, default_value = "date")]
        sort_by: BanSortArg,
        #[arg(short, long, value_enum, default_value = "descending")]
        order: OrderArg,
        /// Number of words to show (0 for all)
        #[arg(short, long)]
        num: Option<usize>,
    },
    /// Check whether words are banned
    Checkword {
        #[arg(required = true)]
        word: Vec<String>,
    },
    /// Ban words and delete their logged entries
    Banword {
        #[arg(required = true)]
        word: Vec<String>,
    },
    /// Remove words from the banlist
    Unbanword {
        #[arg(required = true)]
        word: Vec<String>,
    },
    /// Delete logged words
    Delword {
        #[arg(required = true)]
        word: Vec<String>,
        #[arg(short, long, value_enum, default_value = "insensitive")]
        case: CaseArg,
    },
    /// Delete logged chord entries
    Delchord {
        #[arg(required = true)]
        chord: Vec<String>,
    },
    /// Show logged entries in a time range
    Range(RangeArgs),
    /// Show entry rates over a time range
    Stats {
        /// Start of the window (RFC 3339 or microseconds since the epoch)
        #[arg(long, value_parser = parse_time)]
        since: Option<Timestamp>,
        /// End of the window, exclusive (defaults to now)
        #[arg(long, value_parser = parse_time)]
        until: Option<Timestamp>,
    },
    /// Export every statistic as JSON
    Export {
        /// Output file
        output: PathBuf,
        #[arg(short, long, value_enum, default_value = "insensitive")]
        case: CaseArg,
    },
    /// Merge another store's entries and banlist into this one
    Merge(MergeArgs),
    /// Log recorded key signals from a JSON-lines file
    Ingest {
        /// One raw signal per line: {"code", "value", "timestamp_us", "chord_marker"}
        input: PathBuf,
    },
}

#[derive(Args)]
pub struct StartArgs {
    /// Inactivity that ends a word (milliseconds)
    #[arg(long)]
    pub new_word_threshold: Option<u64>,
    /// Maximum gap between characters of a chord (milliseconds)
    #[arg(long)]
    pub chord_char_threshold: Option<u64>,
    /// Characters allowed in words
    #[arg(long)]
    pub allowed_chars: Option<String>,
    /// Characters allowed to start a word
    #[arg(long)]
    pub allowed_first_chars: Option<String>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Specific entries to show
    pub text: Vec<String>,
    /// Number of entries to show (0 for all)
    #[arg(short, long)]
    pub num: Option<usize>,
    #[arg(short, long, value_enum, default_value = "insensitive")]
    pub case: CaseArg,
    /// Only show entries containing this text
    #[arg(short = 'f', long = "find")]
    pub search: Option<String>,
    #[arg(short, long, value_enum, default_value = "count")]
    pub sort_by: SortArg,
    #[arg(short, long, value_enum, default_value = "descending")]
    pub order: OrderArg,
    /// Write every matching entry to this CSV file (ignores entry arguments)
    #[arg(short, long)]
    pub export: Option<PathBuf>,
}

#[derive(Args)]
pub struct MergeArgs {
    /// Store to merge into the selected one
    pub source: PathBuf,
    /// Backend of the source store (defaults to the destination's)
    #[arg(long, value_enum)]
    pub source_backend: Option<BackendArg>,
    /// Date kept for words banned in both stores
    #[arg(long, value_enum, default_value = "older")]
    pub keep_ban_date: BanDateArg,
}

#[derive(Args)]
pub struct RangeArgs {
    /// Start of the range (RFC 3339 or microseconds since the epoch)
    #[arg(long, value_parser = parse_time)]
    pub since: Option<Timestamp>,
    /// End of the range, exclusive
    #[arg(long, value_parser = parse_time)]
    pub until: Option<Timestamp>,
    /// Resume after a cursor printed by an earlier call
    #[arg(long)]
    pub cursor: Option<String>,
    /// Maximum entries to print
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
    #[arg(short, long, value_enum)]
    pub method: Option<MethodArg>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum BackendArg {
    Memory,
    File,
    Sqlite,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => BackendKind::Memory,
            BackendArg::File => BackendKind::File,
            BackendArg::Sqlite => BackendKind::Sqlite,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum CaseArg {
    Sensitive,
    Insensitive,
    FirstChar,
}

impl From<CaseArg> for CaseSensitivity {
    fn from(arg: CaseArg) -> Self {
        match arg {
            CaseArg::Sensitive => CaseSensitivity::Sensitive,
            CaseArg::Insensitive => CaseSensitivity::Insensitive,
            CaseArg::FirstChar => CaseSensitivity::FirstChar,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum SortArg {
    Count,
    LastSeen,
    AvgDuration,
    Text,
}

impl From<SortArg> for SortBy {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Count => SortBy::Count,
            SortArg::LastSeen => SortBy::LastSeen,
            SortArg::AvgDuration => SortBy::AvgDuration,
            SortArg::Text => SortBy::Text,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OrderArg {
    Ascending,
    Descending,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum BanSortArg {
    Date,
    Word,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum BanDateArg {
    Older,
    Newer,
}

impl From<BanDateArg> for BanDate {
    fn from(arg: BanDateArg) -> Self {
        match arg {
            BanDateArg::Older => BanDate::Older,
            BanDateArg::Newer => BanDate::Newer,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum MethodArg {
    Chord,
    Sequential,
}

impl From<MethodArg> for InputMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Chord => InputMethod::Chord,
            MethodArg::Sequential => InputMethod::Sequential,
        }
    }
}

/// Accepts RFC 3339 or integer microseconds since the epoch
fn parse_time(s: &str) -> Result<Timestamp, String> {
    if let Ok(us) = s.parse::<u64>() {
        return Ok(Timestamp::from_micros(us));
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| Timestamp::from_datetime(dt.with_timezone(&chrono::Utc)))
        .map_err(|e| format!("invalid time '{}': {}", s, e))
}

/// Errors that map to a specific exit status
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StatusError {
    pub status: Status,
    pub message: String,
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    StatusError {
        status: Status::InvalidArgument,
        message: message.into(),
    }
    .into()
}

fn store_access(err: impl std::fmt::Display) -> anyhow::Error {
    StatusError {
        status: Status::StoreAccess,
        message: format!("could not access store: {}", err),
    }
    .into()
}

/// Exit status for an error returned by [`run`]
pub fn status_of(err: &anyhow::Error) -> Status {
    err.chain()
        .find_map(|e| e.downcast_ref::<StatusError>().map(|s| s.status))
        .unwrap_or(Status::StoreAccess)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .map_err(|e| invalid(format!("config {}: {}", path.display(), e)))?,
        None => Config::load().map_err(|e| invalid(format!("config: {}", e)))?,
    };
    if let Some(kind) = cli.backend {
        config.backend.kind = kind.into();
    }
    if let Some(path) = &cli.path {
        config.backend.path = Some(path.clone());
    }
    Ok(config)
}

fn open(config: Config) -> Result<Freqlog> {
    Freqlog::open(config).map_err(store_access)
}

fn reader(config: &Config) -> Result<QueryService> {
    Freqlog::reader(config).map_err(store_access)
}

fn limit(num: Option<usize>) -> Option<usize> {
    match num.unwrap_or(DEFAULT_NUM) {
        0 => None,
        n => Some(n),
    }
}

fn print_stats(stats: &[AggregateStat]) {
    for stat in stats {
        println!(
            "{:<24} {:>8}  last {}  avg {:.1} ms",
            stat.text,
            stat.count,
            stat.last_seen,
            stat.avg_duration_ms()
        );
    }
}

/// Execute a parsed command line
pub fn run(cli: Cli) -> Result<Status> {
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Startlog(args) => {
            if let Some(ms) = args.new_word_threshold {
                config.classifier.new_word_threshold_ms = ms;
            }
            if let Some(ms) = args.chord_char_threshold {
                config.classifier.chord_char_threshold_ms = ms;
            }
            if let Some(chars) = args.allowed_chars {
                config.classifier.allowed_chars = chars;
            }
            if let Some(chars) = args.allowed_first_chars {
                config.classifier.allowed_first_chars = chars;
            }
            config.validate().map_err(|e| invalid(e.to_string()))?;
            startlog(open(config)?)
        }
        Command::Words(args) => list(&reader(&config)?, InputMethod::Sequential, args),
        Command::Chords(args) => list(&reader(&config)?, InputMethod::Chord, args),
        Command::Numwords { case } => {
            let n = reader(&config)?.distinct(Some(InputMethod::Sequential), case.into());
            println!("{} words in freqlog", n);
            Ok(Status::Ok)
        }
        Command::Banlist { sort_by, order, num } => {
            let engine = open(config)?;
            let mut words = engine.banlist().map_err(store_access)?;
            match sort_by {
                BanSortArg::Date => words.sort_by(|a, b| a.added.cmp(&b.added).then(a.text.cmp(&b.text))),
                BanSortArg::Word => words.sort_by(|a, b| a.text.cmp(&b.text)),
            }
            if order == OrderArg::Descending {
                words.reverse();
            }
            if let Some(n) = limit(num) {
                words.truncate(n);
            }
            if words.is_empty() {
                println!("No banned words");
            } else {
                println!("Banned words:");
                for word in words {
                    println!("{} (added {})", word.text, word.added);
                }
            }
            Ok(Status::Ok)
        }
        Command::Checkword { word } => {
            let engine = open(config)?;
            let mut status = Status::Ok;
            for w in word {
                if engine.is_banned(&w) {
                    println!("'{}' is banned", w);
                    status = Status::Banned;
                } else {
                    println!("'{}' is not banned", w);
                }
            }
            Ok(status)
        }
        Command::Banword { word } => {
            let engine = open(config)?;
            let mut status = Status::Ok;
            for w in word {
                if !engine.ban(&w).map_err(store_access)? {
                    log::warn!("'{}' is already banned", w);
                    status = Status::Unchanged;
                }
            }
            Ok(status)
        }
        Command::Unbanword { word } => {
            let engine = open(config)?;
            let mut status = Status::Ok;
            for w in word {
                if !engine.unban(&w).map_err(store_access)? {
                    log::warn!("'{}' is not banned", w);
                    status = Status::Unchanged;
                }
            }
            Ok(status)
        }
        Command::Delword { word, case } => {
            let engine = open(config)?;
            let mut status = Status::Ok;
            for w in word {
                if !engine.delete_word(&w, case.into()).map_err(store_access)? {
                    println!("Word '{}' not found", w);
                    status = Status::NotFound;
                }
            }
            Ok(status)
        }
        Command::Delchord { chord } => {
            let engine = open(config)?;
            let mut status = Status::Ok;
            for c in chord {
                if !engine.delete_chord(&c).map_err(store_access)? {
                    println!("Chord '{}' not found", c);
                    status = Status::NotFound;
                }
            }
            Ok(status)
        }
        Command::Range(args) => range(&open(config)?, args),
        Command::Stats { since, until } => {
            let query = reader(&config)?;
            let until = until.unwrap_or_else(Timestamp::now);
            let since = since.unwrap_or_else(|| until.saturating_sub_micros(3_600_000_000));
            if since >= until {
                return Err(invalid("--since must be before --until"));
            }
            let chords = query
                .rate_per_minute(Some(InputMethod::Chord), since, until)
                .map_err(store_access)?;
            let words = query
                .rate_per_minute(Some(InputMethod::Sequential), since, until)
                .map_err(store_access)?;
            println!("Window: {} to {}", since, until);
            println!("Chords per minute: {:.2}", chords);
            println!("Words per minute:  {:.2}", words);
            println!(
                "Distinct words: {}, distinct chords: {}",
                query.distinct(Some(InputMethod::Sequential), CaseSensitivity::Insensitive),
                query.distinct(Some(InputMethod::Chord), CaseSensitivity::Sensitive)
            );
            Ok(Status::Ok)
        }
        Command::Export { output, case } => {
            let report = reader(&config)?.report(case.into()).map_err(store_access)?;
            report
                .export_json(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Exported report to {}", output.display());
            Ok(Status::Ok)
        }
        Command::Merge(args) => merge(open(config)?, args),
        Command::Ingest { input } => ingest(&open(config)?, input),
    }
}

fn list(query: &QueryService, method: InputMethod, args: ListArgs) -> Result<Status> {
    let case: CaseSensitivity = match method {
        InputMethod::Chord => CaseSensitivity::Sensitive,
        InputMethod::Sequential => args.case.into(),
    };
    let sort_by: SortBy = args.sort_by.into();
    let descending = args.order == OrderArg::Descending;

    if let Some(path) = &args.export {
        let mut filter = TopFilter::method(method).with_case(case);
        filter.search = args.search;
        let stats = query.list(&filter, sort_by, descending, limit(args.num));
        export_csv(&stats, path).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Exported {} entries to {}", stats.len(), path.display());
        return Ok(Status::Ok);
    }

    if args.text.is_empty() {
        let mut filter = TopFilter::method(method).with_case(case);
        filter.search = args.search;
        let stats = query.list(&filter, sort_by, descending, limit(args.num));
        if stats.is_empty() {
            match method {
                InputMethod::Sequential => println!("No words in freqlog. Start typing!"),
                InputMethod::Chord => println!("No chords in freqlog. Start chording!"),
            }
        }
        print_stats(&stats);
        return Ok(Status::Ok);
    }

    if args.num.is_some() {
        log::warn!("--num is ignored when specific entries are given");
    }
    let mut status = Status::Ok;
    let mut found = Vec::new();
    for text in &args.text {
        match query.lookup_with(text, method, case) {
            Ok(stat) => found.push(stat),
            Err(e) => {
                println!("{}", e);
                status = Status::NotFound;
            }
        }
    }
    found.sort_by(|a, b| {
        let ord = sort_by.compare(a, b);
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
    print_stats(&found);
    Ok(status)
}

fn range(engine: &Freqlog, args: RangeArgs) -> Result<Status> {
    let range = TimeRange::new(
        args.since.unwrap_or(Timestamp::ZERO),
        args.until.unwrap_or(Timestamp::MAX),
    );
    if range.is_empty() {
        return Err(invalid("--since must be before --until"));
    }
    let backend = engine.backend().as_ref();
    let iter = match &args.cursor {
        Some(token) => {
            let cursor: Cursor = token.parse().map_err(|e| invalid(format!("{}", e)))?;
            RangeIter::resume(backend, range, cursor)
        }
        None => RangeIter::new(backend, range),
    };
    let method: Option<InputMethod> = args.method.map(Into::into);

    let mut iter = iter.with_page_size(args.limit.clamp(1, DEFAULT_PAGE_SIZE));
    let mut printed = 0;
    while printed < args.limit {
        let Some(entry) = iter.next() else {
            break;
        };
        let entry = entry.map_err(store_access)?;
        if method.map_or(true, |m| m == entry.method) {
            println!(
                "{:>8}  {}  {:<10}  {:<24}  {} us",
                entry.seq, entry.start, entry.method.name(), entry.text, entry.duration_us
            );
            printed += 1;
        }
    }
    if printed == args.limit {
        if let Some(cursor) = iter.cursor() {
            println!("next cursor: {}", cursor.token());
        }
    }
    Ok(Status::Ok)
}

fn merge(engine: Freqlog, args: MergeArgs) -> Result<Status> {
    let kind = args
        .source_backend
        .map(Into::into)
        .unwrap_or(engine.config().backend.kind);
    if kind == BackendKind::Memory {
        return Err(invalid("a memory store cannot be a merge source"));
    }
    if engine.config().backend.resolved_path() == args.source {
        return Err(invalid("cannot merge a store into itself"));
    }
    if !args.source.exists() {
        return Err(invalid(format!("{} does not exist", args.source.display())));
    }
    let source = AnyBackend::open(&BackendConfig::new(kind, args.source.clone())).map_err(store_access)?;
    let report = engine
        .merge_from(&source, args.keep_ban_date.into())
        .map_err(store_access)?;
    println!(
        "Merged {} entries from {} ({} skipped as banned, {} newly banned words)",
        report.entries,
        args.source.display(),
        report.skipped,
        report.banned
    );
    Ok(Status::Ok)
}

fn startlog(engine: Freqlog) -> Result<Status> {
    let stop = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let stop = Arc::clone(&stop);
        move || stop.store(true, Ordering::SeqCst)
    })
    .context("failed to install Ctrl-C handler")?;

    let pipeline = engine.start_keyboard().map_err(store_access)?;
    println!("Logging started, press Ctrl-C to stop");
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    let report = pipeline.shutdown();
    let metrics = engine.query().session_metrics();
    println!(
        "Logged {} words and {} chords ({:.1} wpm, {:.1} cpm)",
        metrics.words, metrics.chords, metrics.words_per_minute, metrics.chords_per_minute
    );
    if let Some(loss) = report.data_loss {
        log::warn!("{} entries were not persisted: {}", loss.unflushed, loss.reason);
        return Ok(Status::StoreAccess);
    }
    if report.stats.degraded {
        log::warn!("{} entries failed to persist", report.stats.append_failures);
        return Ok(Status::StoreAccess);
    }
    Ok(Status::Ok)
}

fn ingest(engine: &Freqlog, input: PathBuf) -> Result<Status> {
    let file = fs::File::open(&input).with_context(|| format!("failed to open {}", input.display()))?;
    let mut signals = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let signal: RawSignal = serde_json::from_str(&line)
            .map_err(|e| invalid(format!("{}:{}: {}", input.display(), n + 1, e)))?;
        signals.push(signal);
    }

    let tag = input.display().to_string();
    let source = ReplaySource::from_signals(tag, signals);
    let report = engine.start(move || source).map_err(store_access)?.join();
    println!(
        "Ingested {} events: {} entries, {} banned, {} malformed signals",
        report.events, report.stats.classified, report.stats.banned, report.malformed
    );
    if report.stats.degraded {
        return Ok(Status::StoreAccess);
    }
    Ok(Status::Ok)
}
