//! Engine facade
//!
//! [`Freqlog`] opens the configured backend, seeds the aggregator from the
//! stored baseline, starts capture pipelines and owns the operations that
//! change stored data (ban, unban, delete).

use crate::aggregator::Aggregator;
use crate::backend::{AnyBackend, Backend, BackendError, Baseline};
use crate::config::{Config, ConfigError};
use crate::entry::{BannedWord, InputMethod, Timestamp};
use crate::keyboard::{Keymap, KeyboardListener, SignalSource};
use crate::pipeline::{BanFilter, Pipeline, PipelineError, Sequencer};
use crate::query::{CaseSensitivity, QueryService};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors opening or driving the engine
#[derive(Debug, Error)]
pub enum FreqlogError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// The frequency-logging engine
pub struct Freqlog {
    config: Config,
    backend: Arc<dyn Backend>,
    aggregator: Arc<Aggregator>,
    banlist: BanFilter,
    sequencer: Arc<Sequencer>,
    replayed: usize,
    warnings: Vec<String>,
}

impl Freqlog {
    /// Open the backend selected by `config` and load its statistics
    pub fn open(config: Config) -> Result<Self, FreqlogError> {
        config.validate()?;
        let backend = AnyBackend::open(&config.backend)?;
        if let Some(path) = backend.path() {
            log::info!("store at {}", path.display());
        }
        Self::with_backend(config, Arc::new(backend))
    }

    /// Open the configured store for queries only
    ///
    /// Stored statistics are read without seeding an aggregator, so nothing
    /// can be logged through the result.
    pub fn reader(config: &Config) -> Result<QueryService, FreqlogError> {
        config.validate()?;
        let backend = AnyBackend::open(&config.backend)?;
        Ok(QueryService::cold(Arc::new(backend))?)
    }

    /// Use an already opened backend
    pub fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Result<Self, FreqlogError> {
        let Baseline {
            snapshot,
            replayed,
            warnings,
        } = backend.load_aggregates()?;
        for warning in &warnings {
            log::warn!("{}", warning);
        }

        let aggregator = Arc::new(Aggregator::new());
        aggregator.seed(&snapshot);

        let banned = backend.banlist()?;
        let banlist = BanFilter::from_words(banned.iter().map(|w| &w.text));
        let last = backend.last_sequence()?.max(aggregator.high_water());
        log::info!(
            "loaded {} stats ({} replayed), {} banned words, last seq {}",
            aggregator.len(),
            replayed,
            banlist.len(),
            last
        );

        Ok(Self {
            config,
            backend,
            aggregator,
            banlist,
            sequencer: Arc::new(Sequencer::starting_after(last)),
            replayed,
            warnings,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Log records replayed on top of the stored snapshot at open
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Recovery warnings raised while loading the store
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn query(&self) -> QueryService {
        QueryService::new(Arc::clone(&self.aggregator), Arc::clone(&self.backend))
    }

    /// Start a pipeline over the source built by `factory`
    pub fn start<S, F>(&self, factory: F) -> Result<Pipeline, FreqlogError>
    where
        S: SignalSource,
        F: FnOnce() -> S + Send + 'static,
    {
        let pipeline = Pipeline::builder(Arc::clone(&self.aggregator), Arc::clone(&self.backend))
            .classifier(self.config.classifier.clone())
            .keymap(Keymap::with_remaps(&self.config.keymap.remaps))
            .settings(self.config.pipeline.clone())
            .banlist(self.banlist.clone())
            .sequencer(Arc::clone(&self.sequencer))
            .start(factory)?;
        Ok(pipeline)
    }

    /// Start a pipeline capturing from the OS keyboard
    pub fn start_keyboard(&self) -> Result<Pipeline, FreqlogError> {
        let tag = self.config.capture.source_tag.clone();
        let interval = self.config.poll_interval();
        self.start(move || KeyboardListener::new(tag, interval))
    }

    pub fn is_banned(&self, word: &str) -> bool {
        self.banlist.is_banned(word.trim())
    }

    /// Ban a word and purge every logged occurrence of it
    ///
    /// Returns false if the word was already banned.
    pub fn ban(&self, word: &str) -> Result<bool, BackendError> {
        self.ban_entry(BannedWord::new(word, Timestamp::now()))
    }

    fn ban_entry(&self, banned: BannedWord) -> Result<bool, BackendError> {
        if !self.backend.ban(&banned)? {
            return Ok(false);
        }
        self.banlist.insert(&banned.text);
        let matches = |text: &str, _: InputMethod| text.to_lowercase() == banned.text;
        let stats = self.aggregator.purge(&matches);
        let entries = self.backend.purge(&matches)?;
        log::info!("banned a word, purged {} stats and {} entries", stats, entries);
        Ok(true)
    }

    /// Returns false if the word was not banned
    pub fn unban(&self, word: &str) -> Result<bool, BackendError> {
        let text = word.trim().to_lowercase();
        let removed = self.backend.unban(&text)?;
        self.banlist.remove(&text);
        Ok(removed)
    }

    pub fn banlist(&self) -> Result<Vec<BannedWord>, BackendError> {
        self.backend.banlist()
    }

    /// Delete every sequential entry for `word` under `case`
    ///
    /// Returns false if nothing matched.
    pub fn delete_word(&self, word: &str, case: CaseSensitivity) -> Result<bool, BackendError> {
        let wanted = case.fold(word);
        self.delete(&|text, method| method == InputMethod::Sequential && case.fold(text) == wanted)
    }

    /// Delete every chord entry with exactly this text
    pub fn delete_chord(&self, chord: &str) -> Result<bool, BackendError> {
        self.delete(&|text, method| method == InputMethod::Chord && text == chord)
    }

    fn delete(&self, predicate: &dyn Fn(&str, InputMethod) -> bool) -> Result<bool, BackendError> {
        let stats = self.aggregator.purge(predicate);
        let entries = self.backend.purge(predicate)?;
        Ok(stats > 0 || entries > 0)
    }

    /// Write an aggregate checkpoint now
    pub fn checkpoint(&self) -> Result<(), BackendError> {
        self.backend.flush_aggregates(&self.aggregator.snapshot())
    }

    /// Fold another store's entries and banlist into this one
    ///
    /// Source entries are appended under fresh sequence numbers. Entries
    /// whose text is banned in either store are skipped. A word banned in
    /// both stores keeps the date chosen by `keep`.
    pub fn merge_from(&self, source: &dyn Backend, keep: BanDate) -> Result<MergeReport, BackendError> {
        let mut report = MergeReport::default();

        let ours: HashMap<String, Timestamp> = self
            .backend
            .banlist()?
            .into_iter()
            .map(|w| (w.text, w.added))
            .collect();
        for theirs in source.banlist()? {
            match ours.get(&theirs.text) {
                Some(&added) => {
                    let wanted = keep.pick(added, theirs.added);
                    if wanted != added {
                        self.backend.unban(&theirs.text)?;
                        self.backend.ban(&BannedWord { added: wanted, ..theirs })?;
                    }
                }
                None => {
                    self.ban_entry(theirs)?;
                    report.banned += 1;
                }
            }
        }

        for entry in source.query_range(Timestamp::ZERO, Timestamp::MAX) {
            let entry = entry?;
            if self.banlist.is_banned(&entry.text) {
                report.skipped += 1;
                continue;
            }
            let entry = entry.sequenced(self.sequencer.next());
            self.backend.append(&entry)?;
            self.aggregator.record(&entry);
            report.entries += 1;
        }

        self.checkpoint()?;
        log::info!(
            "merged {} entries ({} skipped), {} new banned words",
            report.entries,
            report.skipped,
            report.banned
        );
        Ok(report)
    }
}

/// Which date a word banned in both merged stores keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanDate {
    Older,
    Newer,
}

impl BanDate {
    fn pick(self, a: Timestamp, b: Timestamp) -> Timestamp {
        match self {
            BanDate::Older => a.min(b),
            BanDate::Newer => a.max(b),
        }
    }
}

/// Outcome of [`Freqlog::merge_from`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries appended to this store
    pub entries: usize,
    /// Source entries dropped because their text is banned
    pub skipped: usize,
    /// Words newly banned from the source banlist
    pub banned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, MemoryBackend};
    use crate::config::BackendConfig;
    use crate::testing::Script;
    use tempfile::tempdir;

    fn memory_engine() -> Freqlog {
        Freqlog::with_backend(Config::default(), Arc::new(MemoryBackend::new())).unwrap()
    }

    #[test]
    fn ban_purges_and_blocks() {
        let engine = memory_engine();
        let source = Script::new().text("secret public Secret ").into_source("test");
        engine.start(move || source).unwrap().join();
        assert_eq!(engine.query().distinct(None, CaseSensitivity::Insensitive), 2);

        assert!(engine.ban("SECRET").unwrap());
        assert!(!engine.ban("secret").unwrap());
        assert!(engine.is_banned("Secret"));
        assert_eq!(engine.query().distinct(None, CaseSensitivity::Insensitive), 1);

        let source = Script::new().text("secret ").into_source("test");
        let report = engine.start(move || source).unwrap().join();
        assert_eq!(report.stats.banned, 1);

        assert!(engine.unban("Secret").unwrap());
        assert!(!engine.unban("secret").unwrap());
        assert!(!engine.is_banned("secret"));
    }

    #[test]
    fn delete_word_respects_case_and_method() {
        let engine = memory_engine();
        let source = Script::new()
            .text("Hello hello ")
            .chord("hello")
            .into_source("test");
        engine.start(move || source).unwrap().join();

        assert!(!engine.delete_word("HELLO", CaseSensitivity::FirstChar).unwrap());
        assert!(engine.delete_word("hello", CaseSensitivity::FirstChar).unwrap());
        let query = engine.query();
        assert!(query.lookup("hello", InputMethod::Sequential).is_err());
        assert_eq!(query.lookup("hello", InputMethod::Chord).unwrap().count, 1);

        assert!(engine.delete_chord("hello").unwrap());
        assert!(!engine.delete_chord("hello").unwrap());
    }

    #[test]
    fn sequence_is_shared_across_pipelines() {
        let engine = memory_engine();
        let a = Script::new().text("one ").into_source("a");
        let b = Script::new().text("two ").into_source("b");
        engine.start(move || a).unwrap().join();
        engine.start(move || b).unwrap().join();
        assert_eq!(engine.backend().last_sequence().unwrap(), 2);
    }

    #[test]
    fn reopen_file_store() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.backend = BackendConfig::new(BackendKind::File, dir.path().join("store"));

        {
            let engine = Freqlog::open(config.clone()).unwrap();
            let source = Script::new().text("cat cat dog ").into_source("test");
            engine.start(move || source).unwrap().join();
            engine.ban("dog").unwrap();
        }

        let engine = Freqlog::open(config).unwrap();
        assert!(engine.warnings().is_empty());
        let query = engine.query();
        assert_eq!(query.lookup("cat", InputMethod::Sequential).unwrap().count, 2);
        assert!(query.lookup("dog", InputMethod::Sequential).is_err());
        assert!(engine.is_banned("dog"));
    }

    #[test]
    fn merge_folds_entries_and_banlist() {
        let ours = memory_engine();
        let source = Script::new().text("cat dog ").into_source("ours");
        ours.start(move || source).unwrap().join();
        ours.backend()
            .ban(&BannedWord::new("both", Timestamp::from_millis(500)))
            .unwrap();

        let theirs = memory_engine();
        let source = Script::new().text("cat cat secret ").chord("the").into_source("theirs");
        theirs.start(move || source).unwrap().join();
        theirs.ban("dog").unwrap();
        theirs.backend()
            .ban(&BannedWord::new("both", Timestamp::from_millis(100)))
            .unwrap();
        ours.ban("secret").unwrap();

        let report = ours.merge_from(theirs.backend().as_ref(), BanDate::Older).unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.banned, 1);

        let query = ours.query();
        assert_eq!(query.lookup("cat", InputMethod::Sequential).unwrap().count, 3);
        assert_eq!(query.lookup("the", InputMethod::Chord).unwrap().count, 1);
        assert!(query.lookup("dog", InputMethod::Sequential).is_err());
        assert!(query.lookup("secret", InputMethod::Sequential).is_err());
        assert!(ours.is_banned("dog"));

        let both = ours.banlist().unwrap().into_iter().find(|w| w.text == "both").unwrap();
        assert_eq!(both.added, Timestamp::from_millis(100));
        assert_eq!(ours.backend().last_sequence().unwrap(), 5);

        let restored = Aggregator::new();
        restored.seed(&ours.backend().load_aggregates().unwrap().snapshot);
        assert_eq!(restored.total_count(), 4);
    }

    #[test]
    fn merge_keeps_newer_ban_date() {
        let ours = memory_engine();
        ours.backend()
            .ban(&BannedWord::new("word", Timestamp::from_millis(100)))
            .unwrap();
        let theirs = memory_engine();
        theirs.backend()
            .ban(&BannedWord::new("word", Timestamp::from_millis(900)))
            .unwrap();

        let report = ours.merge_from(theirs.backend().as_ref(), BanDate::Newer).unwrap();
        assert_eq!(report, MergeReport::default());
        let banned = ours.banlist().unwrap();
        assert_eq!(banned.len(), 1);
        assert_eq!(banned[0].added, Timestamp::from_millis(900));
    }

    #[test]
    fn reader_sees_stored_stats() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.backend = BackendConfig::new(BackendKind::Sqlite, dir.path().join("freqlog.db"));
        {
            let engine = Freqlog::open(config.clone()).unwrap();
            let source = Script::new().text("cat cat dog ").into_source("test");
            engine.start(move || source).unwrap().join();
        }

        let query = Freqlog::reader(&config).unwrap();
        assert!(!query.aggregator().is_seeded());
        assert_eq!(query.lookup("cat", InputMethod::Sequential).unwrap().count, 2);
        assert_eq!(query.distinct(Some(InputMethod::Sequential), CaseSensitivity::Sensitive), 2);
    }

    #[test]
    fn open_rejects_invalid_config() {
        let mut config = Config::default();
        config.backend = BackendConfig::memory();
        config.pipeline.channel_capacity = 0;
        assert!(matches!(Freqlog::open(config), Err(FreqlogError::Config(_))));
    }
}
