//! Raw signals, input events and signal sources

use super::KeyCode;
use crate::entry::Timestamp;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Raw key value for a release
pub const VALUE_RELEASE: i32 = 0;
/// Raw key value for a press
pub const VALUE_PRESS: i32 = 1;
/// Raw key value for an autorepeat
pub const VALUE_REPEAT: i32 = 2;

/// A decoded but unvalidated key signal from a device or OS hook
///
/// Values follow the evdev convention: 0 release, 1 press, 2 autorepeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSignal {
    pub code: u16,
    pub value: i32,
    /// Microseconds since the Unix epoch, as reported by the source clock
    pub timestamp_us: i64,
    /// Set by chording devices on every edge of a chord's output
    #[serde(default)]
    pub chord_marker: bool,
}

impl RawSignal {
    pub fn press(code: u16, timestamp_us: i64) -> Self {
        Self {
            code,
            value: VALUE_PRESS,
            timestamp_us,
            chord_marker: false,
        }
    }

    pub fn release(code: u16, timestamp_us: i64) -> Self {
        Self {
            code,
            value: VALUE_RELEASE,
            timestamp_us,
            chord_marker: false,
        }
    }

    pub fn with_chord_marker(mut self) -> Self {
        self.chord_marker = true;
        self
    }
}

/// One item pulled from a [`SignalSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceItem {
    Signal(RawSignal),
    /// No signal arrived; carries the source clock in microseconds
    Tick(i64),
}

/// Capability that yields raw key signals
///
/// This is the seam where the OS keyboard hook plugs in. Sources should yield
/// a [`SourceItem::Tick`] periodically while idle so inactivity timeouts and
/// shutdown requests are noticed. `None` means the source is closed.
///
/// Sources are built on the capture thread, so they need not be `Send`.
pub trait SignalSource {
    /// Tag recorded on every entry produced from this source
    fn tag(&self) -> &str;

    fn next_item(&mut self) -> Option<SourceItem>;
}

/// Edge of a key event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Key was pressed down (or autorepeated)
    Press,
    /// Key was released
    Release,
}

/// A validated keyboard event with a monotonic timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub key: KeyCode,
    pub edge: Edge,
    pub timestamp: Timestamp,
    pub source: Arc<str>,
    /// Part of a device chord output
    pub chord_marker: bool,
}

impl InputEvent {
    pub fn new(key: KeyCode, edge: Edge, timestamp: Timestamp, source: Arc<str>) -> Self {
        Self {
            key,
            edge,
            timestamp,
            source,
            chord_marker: false,
        }
    }

    pub fn is_press(&self) -> bool {
        self.edge == Edge::Press
    }
}

/// Source replaying a fixed list of items, then closing
///
/// Used for recorded input and for synthetic input in tests.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    tag: String,
    items: VecDeque<SourceItem>,
}

impl ReplaySource {
    pub fn new(tag: impl Into<String>, items: impl IntoIterator<Item = SourceItem>) -> Self {
        Self {
            tag: tag.into(),
            items: items.into_iter().collect(),
        }
    }

    pub fn from_signals(tag: impl Into<String>, signals: impl IntoIterator<Item = RawSignal>) -> Self {
        Self::new(tag, signals.into_iter().map(SourceItem::Signal))
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl SignalSource for ReplaySource {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn next_item(&mut self) -> Option<SourceItem> {
        self.items.pop_front()
    }
}

/// Source fed by an external decoder through a channel
///
/// Yields a tick stamped with the wall clock whenever nothing arrives within
/// `tick_interval`; closes when every sender is dropped.
pub struct ChannelSource {
    tag: String,
    rx: Receiver<RawSignal>,
    tick_interval: Duration,
}

impl ChannelSource {
    pub fn new(tag: impl Into<String>, rx: Receiver<RawSignal>, tick_interval: Duration) -> Self {
        Self {
            tag: tag.into(),
            rx,
            tick_interval,
        }
    }
}

impl SignalSource for ChannelSource {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn next_item(&mut self) -> Option<SourceItem> {
        match self.rx.recv_timeout(self.tick_interval) {
            Ok(signal) => Some(SourceItem::Signal(signal)),
            Err(RecvTimeoutError::Timeout) => {
                Some(SourceItem::Tick(Timestamp::now().as_micros() as i64))
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}
