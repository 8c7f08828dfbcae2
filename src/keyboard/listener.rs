//! OS keyboard listener based on `device_query` polling

use super::event::{RawSignal, SignalSource, SourceItem, VALUE_PRESS, VALUE_RELEASE};
use super::KeyCode;
use crate::entry::Timestamp;
use device_query::{DeviceQuery, DeviceState, Keycode};
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

/// Keyboard listener that polls for key state changes
///
/// `device_query` reports which keys are down; the listener diffs successive
/// polls into press and release signals. It never closes on its own.
pub struct KeyboardListener {
    tag: String,
    device_state: DeviceState,
    last_keys: Vec<Keycode>,
    poll_interval: Duration,
    pending: VecDeque<RawSignal>,
}

impl KeyboardListener {
    /// Create a new keyboard listener
    pub fn new(tag: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            tag: tag.into(),
            device_state: DeviceState::new(),
            last_keys: Vec::new(),
            poll_interval,
            pending: VecDeque::new(),
        }
    }

    /// Poll for keyboard state changes
    /// Returns the number of signals generated
    pub fn poll(&mut self) -> usize {
        let now = Timestamp::now().as_micros() as i64;
        let current_keys = self.device_state.get_keys();
        let signals = diff_keys(&self.last_keys, &current_keys, now);
        let count = signals.len();
        self.pending.extend(signals);
        self.last_keys = current_keys;
        count
    }
}

/// Press and release signals turning `previous` into `current`
///
/// Releases come first so a fast re-press of the same key stays ordered.
/// Keys without a scancode are skipped.
fn diff_keys(previous: &[Keycode], current: &[Keycode], timestamp_us: i64) -> Vec<RawSignal> {
    let released = previous
        .iter()
        .filter(|key| !current.contains(*key))
        .map(|key| (*key, VALUE_RELEASE));
    let pressed = current
        .iter()
        .filter(|key| !previous.contains(*key))
        .map(|key| (*key, VALUE_PRESS));

    released
        .chain(pressed)
        .filter_map(|(key, value)| {
            let code = KeyCode::from(key).as_u16();
            if code == 0 {
                log::trace!("ignoring unmapped key {:?}", key);
                return None;
            }
            Some(RawSignal {
                code,
                value,
                timestamp_us,
                chord_marker: false,
            })
        })
        .collect()
}

impl SignalSource for KeyboardListener {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn next_item(&mut self) -> Option<SourceItem> {
        if let Some(signal) = self.pending.pop_front() {
            return Some(SourceItem::Signal(signal));
        }
        thread::sleep(self.poll_interval);
        self.poll();
        match self.pending.pop_front() {
            Some(signal) => Some(SourceItem::Signal(signal)),
            None => Some(SourceItem::Tick(Timestamp::now().as_micros() as i64)),
        }
    }
}
