//! Synthetic input helpers
//!
//! Builds scripted key streams with explicit timestamps so classification can
//! be exercised without real hardware or wall-clock sleeps.

use crate::keyboard::{KeyCode, KeyKind, RawSignal, ReplaySource, SourceItem, KEYMAP};

/// Default script start: 2023-11-14 22:13:20 UTC
pub const SCRIPT_EPOCH_US: i64 = 1_700_000_000_000_000;

/// Find the scancode producing `c` on the US layout, and whether shift is needed
pub fn code_for(c: char) -> Option<(KeyCode, bool)> {
    KEYMAP
        .iter()
        .filter_map(|(code, info)| match info.kind {
            KeyKind::Char { plain, .. } if plain == c => Some((*code, false)),
            KeyKind::Char { shifted, .. } if shifted == c => Some((*code, true)),
            _ => None,
        })
        .min_by_key(|(code, shifted)| (*shifted, *code))
}

/// A scripted key stream
///
/// Each typed key is a press followed by a release 10 ms later; the clock then
/// advances by the configured gap (100 ms by default).
#[derive(Debug, Clone)]
pub struct Script {
    items: Vec<SourceItem>,
    now_us: i64,
    gap_us: i64,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl Script {
    pub fn new() -> Self {
        Self::starting_at(SCRIPT_EPOCH_US)
    }

    pub fn starting_at(now_us: i64) -> Self {
        Self {
            items: Vec::new(),
            now_us,
            gap_us: 100_000,
        }
    }

    /// Set the delay between consecutive keys
    pub fn gap_ms(mut self, ms: i64) -> Self {
        self.gap_us = ms * 1000;
        self
    }

    pub fn now_us(&self) -> i64 {
        self.now_us
    }

    pub fn press(mut self, code: KeyCode) -> Self {
        self.items.push(SourceItem::Signal(RawSignal::press(code.as_u16(), self.now_us)));
        self
    }

    pub fn release(mut self, code: KeyCode) -> Self {
        self.items.push(SourceItem::Signal(RawSignal::release(code.as_u16(), self.now_us)));
        self
    }

    /// Push an arbitrary signal as-is
    pub fn raw(mut self, signal: RawSignal) -> Self {
        self.items.push(SourceItem::Signal(signal));
        self
    }

    /// Press and release one key, then advance by the gap
    pub fn key(mut self, code: KeyCode) -> Self {
        self = self.press(code);
        self.now_us += 10_000;
        self = self.release(code);
        self.now_us += self.gap_us - 10_000;
        self
    }

    /// Type a string key by key; uppercase and symbols use shift
    ///
    /// Panics on characters the US layout cannot produce.
    pub fn text(mut self, text: &str) -> Self {
        for c in text.chars() {
            self = match c {
                ' ' => self.key(KeyCode::SPACE),
                '\n' => self.key(KeyCode::ENTER),
                '\t' => self.key(KeyCode::TAB),
                _ => {
                    let (code, shifted) =
                        code_for(c).unwrap_or_else(|| panic!("no key produces {:?}", c));
                    if shifted {
                        self.press(KeyCode::LEFT_SHIFT)
                            .key(code)
                            .release(KeyCode::LEFT_SHIFT)
                    } else {
                        self.key(code)
                    }
                }
            };
        }
        self
    }

    pub fn space(self) -> Self {
        self.key(KeyCode::SPACE)
    }

    pub fn enter(self) -> Self {
        self.key(KeyCode::ENTER)
    }

    pub fn backspace(self) -> Self {
        self.key(KeyCode::BACKSPACE)
    }

    /// Emit `text` as a device chord: marked presses 1 ms apart, then releases
    pub fn chord(mut self, text: &str) -> Self {
        let codes: Vec<KeyCode> = text
            .chars()
            .map(|c| code_for(c).map(|(code, _)| code).unwrap_or_else(|| panic!("no key produces {:?}", c)))
            .collect();
        for code in &codes {
            self.items.push(SourceItem::Signal(
                RawSignal::press(code.as_u16(), self.now_us).with_chord_marker(),
            ));
            self.now_us += 1_000;
        }
        for code in &codes {
            self.items.push(SourceItem::Signal(
                RawSignal::release(code.as_u16(), self.now_us).with_chord_marker(),
            ));
        }
        self.now_us += self.gap_us;
        self
    }

    /// Type `text` with 1 ms between presses and no chord marker
    pub fn burst(mut self, text: &str) -> Self {
        let saved = self.gap_us;
        self.gap_us = 1_000;
        for c in text.chars() {
            let (code, _) = code_for(c).unwrap_or_else(|| panic!("no key produces {:?}", c));
            self = self.press(code);
            self.now_us += self.gap_us;
        }
        for c in text.chars() {
            if let Some((code, _)) = code_for(c) {
                self = self.release(code);
            }
        }
        self.gap_us = saved;
        self.now_us += self.gap_us;
        self
    }

    /// Advance the clock without input
    pub fn wait_ms(mut self, ms: i64) -> Self {
        self.now_us += ms * 1000;
        self
    }

    /// Emit an idle tick at the current clock
    pub fn tick(mut self) -> Self {
        self.items.push(SourceItem::Tick(self.now_us));
        self
    }

    pub fn items(&self) -> &[SourceItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<SourceItem> {
        self.items
    }

    pub fn into_source(self, tag: &str) -> ReplaySource {
        ReplaySource::new(tag, self.items)
    }
}
