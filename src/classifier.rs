//! Classification of key events into log entries
//!
//! The classifier is an explicit state machine:
//!
//! - `Idle`: nothing buffered
//! - `BuildingSequential`: ordinary typing in progress
//! - `BuildingChord`: output of a device chord in progress
//!
//! It only ever looks at event and tick timestamps, never the wall clock, so it
//! can be driven deterministically with synthetic input.

use crate::entry::{InputMethod, LogEntry, Timestamp};
use crate::keyboard::{Capture, InputEvent, KeyKind, Keymap, ModifierState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Classifier thresholds and character filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Inactivity after which the current word is closed (milliseconds)
    pub new_word_threshold_ms: u64,
    /// Maximum gap between characters of an unmarked chord (milliseconds)
    pub chord_char_threshold_ms: u64,
    /// Time after the last marked edge before a device chord closes (milliseconds)
    pub chord_window_ms: u64,
    /// Entries are force-closed when they reach this many characters
    pub max_entry_len: usize,
    /// Characters that can be part of a word
    pub allowed_chars: String,
    /// Characters that can start a word
    pub allowed_first_chars: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let letters: String = ('a'..='z').chain('A'..='Z').collect();
        let digits: String = ('0'..='9').collect();
        Self {
            new_word_threshold_ms: 1000,
            chord_char_threshold_ms: 5,
            chord_window_ms: 50,
            max_entry_len: 64,
            allowed_chars: format!("{}{}'-_", letters, digits),
            allowed_first_chars: letters,
        }
    }
}

impl ClassifierConfig {
    fn new_word_threshold_us(&self) -> u64 {
        self.new_word_threshold_ms.saturating_mul(1000)
    }

    fn chord_char_threshold_us(&self) -> u64 {
        self.chord_char_threshold_ms.saturating_mul(1000)
    }

    fn chord_window_us(&self) -> u64 {
        self.chord_window_ms.saturating_mul(1000)
    }
}

/// Classifier counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierStats {
    pub chords: u64,
    pub sequential: u64,
    /// Entries force-closed at `max_entry_len`
    pub overflows: u64,
    /// Buffers thrown away (navigation keys, disallowed first character)
    pub discarded: u64,
    /// Printable keys pressed with ctrl, alt or meta held
    pub shortcuts: u64,
}

impl ClassifierStats {
    pub fn entries(&self) -> u64 {
        self.chords + self.sequential
    }
}

/// Observable state of the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    Idle,
    BuildingSequential,
    BuildingChord,
}

#[derive(Debug, Clone)]
struct Buffer {
    text: String,
    /// Press time of each buffered character
    key_times: Vec<Timestamp>,
    /// Last edge that kept the buffer alive
    last_activity: Timestamp,
    source: Arc<str>,
}

impl Buffer {
    fn new(at: Timestamp, source: Arc<str>) -> Self {
        Self {
            text: String::new(),
            key_times: Vec::new(),
            last_activity: at,
            source,
        }
    }

    fn push(&mut self, c: char, at: Timestamp) {
        self.text.push(c);
        self.key_times.push(at);
        self.last_activity = at;
    }

    fn pop(&mut self, at: Timestamp) {
        self.text.pop();
        self.key_times.pop();
        self.last_activity = at;
    }

    fn len(&self) -> usize {
        self.key_times.len()
    }

    fn is_empty(&self) -> bool {
        self.key_times.is_empty()
    }

    /// Every gap between consecutive characters is within `threshold_us`
    fn is_timing_chord(&self, threshold_us: u64) -> bool {
        self.len() >= 2
            && self
                .key_times
                .windows(2)
                .all(|w| w[1].micros_since(w[0]) <= threshold_us)
    }
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    BuildingSequential(Buffer),
    BuildingChord(Buffer),
}

/// Groups input events into [`LogEntry`] values
///
/// Emitted entries carry sequence number 0; the pipeline sequences them.
pub struct Classifier {
    config: ClassifierConfig,
    keymap: Keymap,
    mods: ModifierState,
    state: State,
    stats: ClassifierStats,
}

impl Classifier {
    pub fn new(config: ClassifierConfig, keymap: Keymap) -> Self {
        Self {
            config,
            keymap,
            mods: ModifierState::new(),
            state: State::Idle,
            stats: ClassifierStats::default(),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn stats(&self) -> ClassifierStats {
        self.stats
    }

    pub fn state(&self) -> ClassifierState {
        match self.state {
            State::Idle => ClassifierState::Idle,
            State::BuildingSequential(_) => ClassifierState::BuildingSequential,
            State::BuildingChord(_) => ClassifierState::BuildingChord,
        }
    }

    /// Feed one normalized capture, appending completed entries to `out`
    pub fn feed(&mut self, capture: &Capture, out: &mut Vec<LogEntry>) {
        match capture {
            Capture::Event(event) => self.on_event(event, out),
            Capture::Tick(now) => self.on_tick(*now, out),
        }
    }

    /// Close any buffer whose timeout has passed at `now`
    pub fn on_tick(&mut self, now: Timestamp, out: &mut Vec<LogEntry>) {
        let expired = match &self.state {
            State::Idle => false,
            State::BuildingSequential(buf) => {
                now.micros_since(buf.last_activity) > self.config.new_word_threshold_us()
            }
            State::BuildingChord(buf) => {
                now.micros_since(buf.last_activity) > self.config.chord_window_us()
            }
        };
        if expired {
            log::trace!("buffer timed out at {}", now);
            self.close(out);
        }
    }

    pub fn on_event(&mut self, event: &InputEvent, out: &mut Vec<LogEntry>) {
        self.on_tick(event.timestamp, out);

        let kind = self.keymap.kind(event.key);

        if !event.is_press() {
            if let KeyKind::Modifier(m) = kind {
                self.mods.release(event.key, m);
            }
            if event.chord_marker {
                if let State::BuildingChord(buf) = &mut self.state {
                    buf.last_activity = event.timestamp;
                }
            }
            return;
        }

        if event.chord_marker {
            if !matches!(self.state, State::BuildingChord(_)) {
                // Marker interrupts typing: the sequential entry closes first
                self.close(out);
                self.state = State::BuildingChord(Buffer::new(event.timestamp, Arc::clone(&event.source)));
            }
            if let State::BuildingChord(buf) = &mut self.state {
                buf.last_activity = event.timestamp;
            }
        } else if matches!(self.state, State::BuildingChord(_)) {
            self.close(out);
        }

        match kind {
            KeyKind::Modifier(m) => {
                self.mods.press(event.key, m);
            }
            KeyKind::Char { .. } => self.on_char(event, out),
            KeyKind::Space | KeyKind::Enter | KeyKind::Tab => self.close(out),
            KeyKind::Backspace | KeyKind::Delete => self.on_erase(event),
            KeyKind::Navigation | KeyKind::Other => self.discard(),
        }
    }

    fn on_char(&mut self, event: &InputEvent, out: &mut Vec<LogEntry>) {
        if self.mods.shortcut_held() {
            self.stats.shortcuts += 1;
            self.close(out);
            return;
        }
        let Some(c) = self.keymap.text_for(event.key, &self.mods) else {
            return;
        };
        if !self.config.allowed_chars.contains(c) {
            self.close(out);
            return;
        }

        if matches!(self.state, State::Idle) {
            self.state =
                State::BuildingSequential(Buffer::new(event.timestamp, Arc::clone(&event.source)));
        }
        let full = match &mut self.state {
            State::BuildingSequential(buf) | State::BuildingChord(buf) => {
                buf.push(c, event.timestamp);
                buf.len() >= self.config.max_entry_len
            }
            State::Idle => false,
        };
        if full {
            self.stats.overflows += 1;
            log::debug!("entry reached {} characters, closing", self.config.max_entry_len);
            self.close_as(Some(InputMethod::Sequential), out);
        }
    }

    fn on_erase(&mut self, event: &InputEvent) {
        let clear = self.mods.ctrl();
        let now_empty = match &mut self.state {
            State::Idle => return,
            State::BuildingSequential(buf) | State::BuildingChord(buf) => {
                if clear {
                    true
                } else {
                    buf.pop(event.timestamp);
                    buf.is_empty()
                }
            }
        };
        if now_empty {
            self.state = State::Idle;
        }
    }

    fn discard(&mut self) {
        if !matches!(self.state, State::Idle) {
            self.stats.discarded += 1;
            self.state = State::Idle;
        }
    }

    /// Close the in-progress buffer on shutdown
    pub fn flush(&mut self) -> Option<LogEntry> {
        let mut out = Vec::with_capacity(1);
        self.close(&mut out);
        self.mods.reset();
        out.pop()
    }

    fn close(&mut self, out: &mut Vec<LogEntry>) {
        self.close_as(None, out);
    }

    fn close_as(&mut self, forced: Option<InputMethod>, out: &mut Vec<LogEntry>) {
        let (buf, method) = match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => return,
            State::BuildingChord(buf) => (buf, InputMethod::Chord),
            State::BuildingSequential(buf) => {
                let method = if buf.is_timing_chord(self.config.chord_char_threshold_us()) {
                    InputMethod::Chord
                } else {
                    InputMethod::Sequential
                };
                (buf, method)
            }
        };
        let method = forced.unwrap_or(method);

        let (Some(&start), Some(&end)) = (buf.key_times.first(), buf.key_times.last()) else {
            return;
        };
        let first_allowed = buf
            .text
            .chars()
            .next()
            .is_some_and(|c| self.config.allowed_first_chars.contains(c));
        if !first_allowed {
            self.stats.discarded += 1;
            log::trace!("discarding entry with disallowed first character");
            return;
        }

        match LogEntry::new(buf.text, method, start, end.micros_since(start), buf.source.as_ref()) {
            Ok(entry) => {
                match method {
                    InputMethod::Chord => self.stats.chords += 1,
                    InputMethod::Sequential => self.stats.sequential += 1,
                }
                out.push(entry);
            }
            Err(e) => log::debug!("dropping entry: {}", e),
        }
    }
}
