//! Modifier state tracking

use super::keymap::{KeyCode, Modifier};
use std::collections::HashSet;

/// Modifier state as seen by the classifier
///
/// Shift, ctrl, alt and meta are held counts (left and right variants both
/// count); caps lock toggles on each press. A key that is already down is
/// not pressed again, so autorepeat never inflates a count.
#[derive(Debug, Clone, Default)]
pub struct ModifierState {
    held: HashSet<KeyCode>,
    shift: u8,
    ctrl: u8,
    alt: u8,
    meta: u8,
    caps_lock: bool,
}

impl ModifierState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `key` was already held
    pub fn press(&mut self, key: KeyCode, modifier: Modifier) -> bool {
        if !self.held.insert(key) {
            return false;
        }
        match modifier {
            Modifier::Shift => self.shift = self.shift.saturating_add(1),
            Modifier::Ctrl => self.ctrl = self.ctrl.saturating_add(1),
            Modifier::Alt => self.alt = self.alt.saturating_add(1),
            Modifier::Meta => self.meta = self.meta.saturating_add(1),
            Modifier::CapsLock => self.caps_lock = !self.caps_lock,
        }
        true
    }

    pub fn release(&mut self, key: KeyCode, modifier: Modifier) {
        if !self.held.remove(&key) {
            return;
        }
        match modifier {
            Modifier::Shift => self.shift = self.shift.saturating_sub(1),
            Modifier::Ctrl => self.ctrl = self.ctrl.saturating_sub(1),
            Modifier::Alt => self.alt = self.alt.saturating_sub(1),
            Modifier::Meta => self.meta = self.meta.saturating_sub(1),
            Modifier::CapsLock => {}
        }
    }

    pub fn shift(&self) -> bool {
        self.shift > 0
    }

    pub fn ctrl(&self) -> bool {
        self.ctrl > 0
    }

    pub fn caps_lock(&self) -> bool {
        self.caps_lock
    }

    /// Whether a shortcut modifier (ctrl, alt, meta) is held
    pub fn shortcut_held(&self) -> bool {
        self.ctrl > 0 || self.alt > 0 || self.meta > 0
    }

    /// Reset all state
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
