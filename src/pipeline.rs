//! Capture and aggregation pipeline
//!
//! ```text
//! SignalSource -> Normalizer -> Classifier -> banlist -> sequencer
//!                                                 |
//!                          +----------------------+---------------------+
//!                          v                                            v
//!                 aggregator channel                             backend channel
//!                          v                                            v
//!                  aggregator worker                            backend worker
//! ```
//!
//! The capture thread owns the normalizer and the classifier. Each consumer
//! has a bounded channel plus an ordered overflow queue on the capture side:
//! when a channel is full, entries are parked and capture keeps going. Only a
//! full overflow queue suspends capture.

use crate::aggregator::Aggregator;
use crate::backend::{Backend, BackendError};
use crate::classifier::{Classifier, ClassifierConfig, ClassifierStats};
use crate::config::PipelineConfig;
use crate::entry::LogEntry;
use crate::keyboard::{CaptureCounters, Keymap, Normalizer, SignalSource};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long a blocked send waits before rechecking the abort flag
const BLOCKED_SEND_SLICE: Duration = Duration::from_millis(50);

/// Errors starting a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// One of the two entry consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consumer {
    Aggregator,
    Backend,
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggregator => f.write_str("aggregator"),
            Self::Backend => f.write_str("backend"),
        }
    }
}

/// Entries classified but never persisted because shutdown was forced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLossReport {
    pub unflushed: u64,
    pub reason: String,
}

/// Events delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A classified, sequenced entry
    Entry(LogEntry),
    /// Persisting an entry or a checkpoint failed; `seq` is 0 for checkpoints
    BackendFailure { seq: u64, error: String },
    /// A consumer channel filled up and entries are being parked
    Backpressure { consumer: Consumer, parked: usize },
    DataLoss(DataLossReport),
}

/// Lower-cased words that are never logged
///
/// Cloning shares the set, so bans made while a pipeline runs take effect
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct BanFilter(Arc<RwLock<HashSet<String>>>);

impl BanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_words<I, T>(words: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let set = words.into_iter().map(|w| w.as_ref().to_lowercase()).collect();
        Self(Arc::new(RwLock::new(set)))
    }

    /// Returns false if the word was already present
    pub fn insert(&self, word: &str) -> bool {
        self.0.write().insert(word.to_lowercase())
    }

    /// Returns false if the word was not present
    pub fn remove(&self, word: &str) -> bool {
        self.0.write().remove(&word.to_lowercase())
    }

    pub fn is_banned(&self, text: &str) -> bool {
        let set = self.0.read();
        !set.is_empty() && set.contains(&text.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// Hands out strictly increasing sequence numbers
#[derive(Debug, Default)]
pub struct Sequencer {
    last: AtomicU64,
}

impl Sequencer {
    /// The first number handed out will be `last + 1`
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Make sure later numbers are above `seq`
    pub fn advance_past(&self, seq: u64) {
        self.last.fetch_max(seq, Ordering::AcqRel);
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct Counters {
    classified: AtomicU64,
    banned: AtomicU64,
    /// Entries handed to the backend outlet
    dispatched: AtomicU64,
    persisted: AtomicU64,
    append_failures: AtomicU64,
    checkpoints: AtomicU64,
    backpressure_events: AtomicU64,
    notifications_dropped: AtomicU64,
    lost: AtomicU64,
}

/// State shared by the pipeline threads and its handle
struct Shared {
    counters: Counters,
    stop: AtomicBool,
    abort: AtomicBool,
    degraded: AtomicBool,
    subscribers: Mutex<Vec<Sender<Notification>>>,
    subscriber_capacity: usize,
}

impl Shared {
    fn notify(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.notifications_dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn aborting(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Counters of a running or finished pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub classified: u64,
    /// Entries dropped because their text is banned
    pub banned: u64,
    pub persisted: u64,
    pub append_failures: u64,
    pub checkpoints: u64,
    pub backpressure_events: u64,
    pub notifications_dropped: u64,
    /// Entries that could not be handed to a consumer
    pub lost: u64,
    /// Some entry or checkpoint failed to persist
    pub degraded: bool,
}

/// Outcome of stopping a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    pub stats: PipelineStats,
    /// Classifier counters; `None` if capture did not finish in time
    pub classifier: Option<ClassifierStats>,
    pub events: u64,
    pub malformed: u64,
    pub clock_anomalies: u64,
    /// Workers did not drain within the timeout
    pub forced: bool,
    pub data_loss: Option<DataLossReport>,
}

/// Capture-side end of one consumer channel
struct Outlet {
    consumer: Consumer,
    tx: Sender<LogEntry>,
    parked: VecDeque<LogEntry>,
    limit: usize,
}

impl Outlet {
    fn new(consumer: Consumer, tx: Sender<LogEntry>, limit: usize) -> Self {
        Self {
            consumer,
            tx,
            parked: VecDeque::new(),
            limit,
        }
    }

    /// Move parked entries into the channel until it is full
    fn pump(&mut self, shared: &Shared) {
        while let Some(entry) = self.parked.pop_front() {
            match self.tx.try_send(entry) {
                Ok(()) => {}
                Err(TrySendError::Full(entry)) => {
                    self.parked.push_front(entry);
                    return;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.disconnected(shared, 1 + self.parked.len());
                    return;
                }
            }
        }
    }

    fn offer(&mut self, entry: LogEntry, shared: &Shared) {
        self.pump(shared);
        if self.parked.is_empty() {
            match self.tx.try_send(entry) {
                Ok(()) => return,
                Err(TrySendError::Full(entry)) => self.park(entry, shared),
                Err(TrySendError::Disconnected(_)) => self.disconnected(shared, 1),
            }
        } else {
            self.park(entry, shared);
        }

        if self.parked.len() >= self.limit {
            log::warn!(
                "{} overflow queue reached {} entries, suspending capture",
                self.consumer,
                self.limit
            );
            while self.parked.len() >= self.limit {
                if !self.send_blocking(shared) {
                    return;
                }
            }
        }
    }

    fn park(&mut self, entry: LogEntry, shared: &Shared) {
        if self.parked.is_empty() {
            shared.counters.backpressure_events.fetch_add(1, Ordering::Relaxed);
            log::warn!("{} channel full, parking entries", self.consumer);
            shared.notify(Notification::Backpressure {
                consumer: self.consumer,
                parked: 1,
            });
        }
        self.parked.push_back(entry);
    }

    /// Send the oldest parked entry, waiting for room
    ///
    /// Returns false once the pipeline is aborting or the consumer is gone.
    fn send_blocking(&mut self, shared: &Shared) -> bool {
        let Some(mut entry) = self.parked.pop_front() else {
            return true;
        };
        loop {
            if shared.aborting() {
                self.parked.push_front(entry);
                return false;
            }
            match self.tx.send_timeout(entry, BLOCKED_SEND_SLICE) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => entry = back,
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.disconnected(shared, 1 + self.parked.len());
                    return false;
                }
            }
        }
    }

    /// Deliver everything still parked; returns how many could not be sent
    fn finish(mut self, shared: &Shared) -> usize {
        while !self.parked.is_empty() {
            if !self.send_blocking(shared) {
                break;
            }
        }
        self.parked.len()
    }

    fn disconnected(&mut self, shared: &Shared, count: usize) {
        log::error!("{} worker is gone, {} entries lost", self.consumer, count);
        shared.counters.lost.fetch_add(count as u64, Ordering::Relaxed);
        self.parked.clear();
    }
}

/// Builds and starts a [`Pipeline`]
pub struct PipelineBuilder {
    aggregator: Arc<Aggregator>,
    backend: Arc<dyn Backend>,
    classifier: ClassifierConfig,
    keymap: Keymap,
    settings: PipelineConfig,
    banlist: BanFilter,
    sequencer: Option<Arc<Sequencer>>,
    counters: Option<Arc<CaptureCounters>>,
}

impl PipelineBuilder {
    pub fn classifier(mut self, config: ClassifierConfig) -> Self {
        self.classifier = config;
        self
    }

    pub fn keymap(mut self, keymap: Keymap) -> Self {
        self.keymap = keymap;
        self
    }

    pub fn settings(mut self, settings: PipelineConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn banlist(mut self, banlist: BanFilter) -> Self {
        self.banlist = banlist;
        self
    }

    /// Share a sequencer between pipelines writing to the same store
    pub fn sequencer(mut self, sequencer: Arc<Sequencer>) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    pub fn capture_counters(mut self, counters: Arc<CaptureCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Spawn the capture thread and both workers
    ///
    /// The source is built on the capture thread by `factory`, so it does not
    /// need to be `Send`.
    pub fn start<S, F>(self, factory: F) -> Result<Pipeline, PipelineError>
    where
        S: SignalSource,
        F: FnOnce() -> S + Send + 'static,
    {
        let sequencer = match self.sequencer {
            Some(seq) => seq,
            None => {
                let last = self.backend.last_sequence()?.max(self.aggregator.high_water());
                Arc::new(Sequencer::starting_after(last))
            }
        };
        let counters = self.counters.unwrap_or_default();
        let shared = Arc::new(Shared {
            counters: Counters::default(),
            stop: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            subscriber_capacity: self.settings.subscriber_capacity.max(1),
        });

        let capacity = self.settings.channel_capacity.max(1);
        let (agg_tx, agg_rx) = bounded::<LogEntry>(capacity);
        let (db_tx, db_rx) = bounded::<LogEntry>(capacity);
        // Each thread holds a clone; the channel disconnects when all have exited
        let (done_tx, done_rx) = bounded::<()>(0);
        // Disconnects once capture has read everything from the source
        let (closed_tx, closed_rx) = bounded::<()>(0);

        let aggregator_handle = spawn("freqlog-aggregator", {
            let aggregator = Arc::clone(&self.aggregator);
            let done = done_tx.clone();
            move || {
                run_aggregator(agg_rx, &aggregator);
                drop(done);
            }
        })?;

        let backend_handle = spawn("freqlog-backend", {
            let backend = Arc::clone(&self.backend);
            let aggregator = Arc::clone(&self.aggregator);
            let shared = Arc::clone(&shared);
            let every = self.settings.checkpoint_every.max(1);
            let done = done_tx.clone();
            move || {
                run_backend(db_rx, backend.as_ref(), &aggregator, &shared, every);
                drop(done);
            }
        })?;

        let capture_handle = spawn("freqlog-capture", {
            let shared = Arc::clone(&shared);
            let counters = Arc::clone(&counters);
            let sequencer = Arc::clone(&sequencer);
            let mut classifier = Classifier::new(self.classifier, self.keymap);
            let banlist = self.banlist;
            let limit = self.settings.overflow_limit.max(1);
            let done = done_tx;
            move || {
                let normalizer = Normalizer::with_counters(factory(), counters);
                let capture = CaptureLoop {
                    shared: &shared,
                    banlist: &banlist,
                    sequencer: &sequencer,
                    outlets: [
                        Outlet::new(Consumer::Aggregator, agg_tx, limit),
                        Outlet::new(Consumer::Backend, db_tx, limit),
                    ],
                };
                capture.run(normalizer, &mut classifier, closed_tx);
                drop(done);
                classifier.stats()
            }
        })?;

        log::info!("pipeline started, next seq {}", sequencer.last() + 1);
        Ok(Pipeline {
            shared,
            counters,
            sequencer,
            done: done_rx,
            source_closed: closed_rx,
            capture: Some(capture_handle),
            workers: vec![aggregator_handle, backend_handle],
            drain_timeout: self.settings.drain_timeout(),
        })
    }
}

fn spawn<T, F>(name: &'static str, f: F) -> Result<JoinHandle<T>, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| PipelineError::Spawn { name, source })
}

/// Capture thread state
struct CaptureLoop<'a> {
    shared: &'a Shared,
    banlist: &'a BanFilter,
    sequencer: &'a Sequencer,
    outlets: [Outlet; 2],
}

impl CaptureLoop<'_> {
    fn run<S: SignalSource>(
        mut self,
        normalizer: Normalizer<S>,
        classifier: &mut Classifier,
        closed: Sender<()>,
    ) {
        let mut out = Vec::new();
        for capture in normalizer {
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }
            classifier.feed(&capture, &mut out);
            for entry in out.drain(..) {
                self.dispatch(entry);
            }
            for outlet in &mut self.outlets {
                outlet.pump(self.shared);
            }
        }
        if let Some(entry) = classifier.flush() {
            self.dispatch(entry);
        }
        drop(closed);

        let [agg, db] = self.outlets;
        let undelivered = agg.finish(self.shared) + db.finish(self.shared);
        if undelivered > 0 {
            self.shared.counters.lost.fetch_add(undelivered as u64, Ordering::Relaxed);
        }
        log::debug!("capture finished");
    }

    fn dispatch(&mut self, entry: LogEntry) {
        if self.banlist.is_banned(&entry.text) {
            self.shared.counters.banned.fetch_add(1, Ordering::Relaxed);
            log::debug!("dropping banned entry");
            return;
        }
        let entry = entry.sequenced(self.sequencer.next());
        log::trace!("classified {} entry seq {}", entry.method, entry.seq);
        self.shared.counters.classified.fetch_add(1, Ordering::Relaxed);
        self.shared.notify(Notification::Entry(entry.clone()));

        let [agg, db] = &mut self.outlets;
        agg.offer(entry.clone(), self.shared);
        self.shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        db.offer(entry, self.shared);
    }
}

fn run_aggregator(rx: Receiver<LogEntry>, aggregator: &Aggregator) {
    for entry in rx {
        aggregator.record(&entry);
    }
    log::debug!("aggregator worker drained");
}

fn run_backend(
    rx: Receiver<LogEntry>,
    backend: &dyn Backend,
    aggregator: &Aggregator,
    shared: &Shared,
    checkpoint_every: u64,
) {
    let counters = &shared.counters;
    let mut since_checkpoint = 0u64;
    for entry in rx.iter() {
        if shared.aborting() {
            log::warn!("backend worker aborting");
            return;
        }
        match backend.append(&entry) {
            Ok(()) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
                since_checkpoint += 1;
                if since_checkpoint >= checkpoint_every {
                    checkpoint(backend, aggregator, shared);
                    since_checkpoint = 0;
                }
            }
            Err(e) => {
                counters.append_failures.fetch_add(1, Ordering::Relaxed);
                if !shared.degraded.swap(true, Ordering::AcqRel) {
                    log::error!("backend append failed, continuing memory-only: {}", e);
                } else {
                    log::debug!("backend append failed for seq {}: {}", entry.seq, e);
                }
                shared.notify(Notification::BackendFailure {
                    seq: entry.seq,
                    error: e.to_string(),
                });
            }
        }
    }
    if !shared.aborting() {
        checkpoint(backend, aggregator, shared);
    }
    log::debug!("backend worker drained");
}

fn checkpoint(backend: &dyn Backend, aggregator: &Aggregator, shared: &Shared) {
    let snapshot = aggregator.snapshot();
    match backend.flush_aggregates(&snapshot) {
        Ok(()) => {
            shared.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
            log::debug!("checkpoint written at seq {}", snapshot.watermark);
        }
        Err(e) => {
            shared.degraded.store(true, Ordering::Release);
            log::warn!("checkpoint failed: {}", e);
            shared.notify(Notification::BackendFailure {
                seq: 0,
                error: e.to_string(),
            });
        }
    }
}

/// Handle to a running pipeline
///
/// Dropping the handle stops capture without waiting for the workers.
pub struct Pipeline {
    shared: Arc<Shared>,
    counters: Arc<CaptureCounters>,
    sequencer: Arc<Sequencer>,
    done: Receiver<()>,
    source_closed: Receiver<()>,
    capture: Option<JoinHandle<ClassifierStats>>,
    workers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl Pipeline {
    pub fn builder(aggregator: Arc<Aggregator>, backend: Arc<dyn Backend>) -> PipelineBuilder {
        PipelineBuilder {
            aggregator,
            backend,
            classifier: ClassifierConfig::default(),
            keymap: Keymap::new(),
            settings: PipelineConfig::default(),
            banlist: BanFilter::new(),
            sequencer: None,
            counters: None,
        }
    }

    /// Receive notifications from now on
    ///
    /// Notifications that do not fit in the subscriber's channel are dropped
    /// and counted.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = bounded(self.shared.subscriber_capacity);
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            classified: c.classified.load(Ordering::Relaxed),
            banned: c.banned.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            append_failures: c.append_failures.load(Ordering::Relaxed),
            checkpoints: c.checkpoints.load(Ordering::Relaxed),
            backpressure_events: c.backpressure_events.load(Ordering::Relaxed),
            notifications_dropped: c.notifications_dropped.load(Ordering::Relaxed),
            lost: c.lost.load(Ordering::Relaxed),
            degraded: self.shared.degraded.load(Ordering::Acquire),
        }
    }

    pub fn capture_counters(&self) -> &Arc<CaptureCounters> {
        &self.counters
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Acquire)
    }

    /// Capture has ended and both workers have drained
    pub fn is_finished(&self) -> bool {
        self.capture.as_ref().map_or(true, |h| h.is_finished())
            && self.workers.iter().all(|h| h.is_finished())
    }

    /// Ask capture to stop pulling from the source
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Stop capture and drain the workers
    pub fn shutdown(self) -> ShutdownReport {
        self.stop();
        self.finish()
    }

    /// Wait for the source to close on its own, then drain the workers
    ///
    /// The drain timeout starts once the source is exhausted and covers
    /// entries capture still holds as well as the workers.
    pub fn join(self) -> ShutdownReport {
        let _ = self.source_closed.recv();
        self.finish()
    }

    fn finish(mut self) -> ShutdownReport {
        let deadline = Instant::now() + self.drain_timeout;
        let forced = loop {
            match self.done.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => break false,
                Err(RecvTimeoutError::Timeout) => break true,
            }
        };

        let mut data_loss = None;
        let mut classifier = None;
        if forced {
            self.shared.abort.store(true, Ordering::Release);
            let c = &self.shared.counters;
            let unflushed = c
                .dispatched
                .load(Ordering::Relaxed)
                .saturating_sub(c.persisted.load(Ordering::Relaxed))
                .saturating_sub(c.append_failures.load(Ordering::Relaxed));
            let report = DataLossReport {
                unflushed,
                reason: format!("workers did not drain within {:?}", self.drain_timeout),
            };
            log::warn!("forced shutdown: {} entries not persisted", unflushed);
            self.shared.notify(Notification::DataLoss(report.clone()));
            data_loss = Some(report);
        } else {
            if let Some(handle) = self.capture.take() {
                classifier = handle.join().ok();
            }
            for handle in self.workers.drain(..) {
                if handle.join().is_err() {
                    log::error!("pipeline worker panicked");
                }
            }
            log::info!("pipeline drained");
        }

        ShutdownReport {
            stats: self.stats(),
            classifier,
            events: self.counters.events(),
            malformed: self.counters.malformed(),
            clock_anomalies: self.counters.clock_anomalies(),
            forced,
            data_loss,
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
