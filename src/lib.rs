//! freqlog - word and chord frequency logging for chorded keyboards
//!
//! Keyboard signals are normalized, classified into words and chords, and
//! fanned out to an in-memory [`aggregator::Aggregator`] and a persistent
//! [`backend::Backend`]. [`Freqlog`] ties the pieces together.

pub mod aggregator;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod entry;
pub mod freqlog;
pub mod keyboard;
pub mod pipeline;
pub mod query;
pub mod report;
pub mod testing;

pub use crate::freqlog::{BanDate, Freqlog, FreqlogError, MergeReport};
pub use backend::{AnyBackend, Backend, BackendError, RangeIter};
pub use config::Config;
pub use entry::{AggregateStat, InputMethod, LogEntry, Timestamp};
pub use pipeline::{Notification, Pipeline, ShutdownReport};
pub use query::QueryService;
