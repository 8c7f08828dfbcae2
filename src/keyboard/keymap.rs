//! Key code definitions and the active keymap
//!
//! Key codes are Linux evdev scancodes. The static [`KEYMAP`] describes the
//! standard US layout; a [`Keymap`] layers configured scancode remaps on top of
//! it and turns a key plus modifier state into typed text.

use super::state::ModifierState;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Represents a physical key code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyCode(pub u16);

impl KeyCode {
    pub const BACKSPACE: KeyCode = KeyCode(14);
    pub const TAB: KeyCode = KeyCode(15);
    pub const ENTER: KeyCode = KeyCode(28);
    pub const SPACE: KeyCode = KeyCode(57);
    pub const LEFT_SHIFT: KeyCode = KeyCode(42);
    pub const LEFT_CTRL: KeyCode = KeyCode(29);
    pub const RIGHT_SHIFT: KeyCode = KeyCode(54);
    pub const CAPS_LOCK: KeyCode = KeyCode(58);

    pub fn new(code: u16) -> Self {
        Self(code)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl From<u16> for KeyCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<device_query::Keycode> for KeyCode {
    fn from(keycode: device_query::Keycode) -> Self {
        use device_query::Keycode as DK;
        // Map device_query keycodes to Linux evdev scancodes
        let code = match keycode {
            DK::Escape => 1,
            DK::Key1 => 2,
            DK::Key2 => 3,
            DK::Key3 => 4,
            DK::Key4 => 5,
            DK::Key5 => 6,
            DK::Key6 => 7,
            DK::Key7 => 8,
            DK::Key8 => 9,
            DK::Key9 => 10,
            DK::Key0 => 11,
            DK::Minus => 12,
            DK::Equal => 13,
            DK::Backspace => 14,
            DK::Tab => 15,
            DK::Q => 16,
            DK::W => 17,
            DK::E => 18,
            DK::R => 19,
            DK::T => 20,
            DK::Y => 21,
            DK::U => 22,
            DK::I => 23,
            DK::O => 24,
            DK::P => 25,
            DK::LeftBracket => 26,
            DK::RightBracket => 27,
            DK::Enter => 28,
            DK::LControl => 29,
            DK::A => 30,
            DK::S => 31,
            DK::D => 32,
            DK::F => 33,
            DK::G => 34,
            DK::H => 35,
            DK::J => 36,
            DK::K => 37,
            DK::L => 38,
            DK::Semicolon => 39,
            DK::Apostrophe => 40,
            DK::Grave => 41,
            DK::LShift => 42,
            DK::BackSlash => 43,
            DK::Z => 44,
            DK::X => 45,
            DK::C => 46,
            DK::V => 47,
            DK::B => 48,
            DK::N => 49,
            DK::M => 50,
            DK::Comma => 51,
            DK::Dot => 52,
            DK::Slash => 53,
            DK::RShift => 54,
            DK::LAlt => 56,
            DK::Space => 57,
            DK::CapsLock => 58,
            DK::F1 => 59,
            DK::F2 => 60,
            DK::F3 => 61,
            DK::F4 => 62,
            DK::F5 => 63,
            DK::F6 => 64,
            DK::F7 => 65,
            DK::F8 => 66,
            DK::F9 => 67,
            DK::F10 => 68,
            DK::F11 => 87,
            DK::F12 => 88,
            DK::RControl => 97,
            DK::RAlt => 100,
            DK::Home => 102,
            DK::Up => 103,
            DK::PageUp => 104,
            DK::Left => 105,
            DK::Right => 106,
            DK::End => 107,
            DK::Down => 108,
            DK::PageDown => 109,
            DK::Insert => 110,
            DK::Delete => 111,
            DK::LMeta => 125,
            DK::RMeta => 126,
            // Numpad keys
            DK::Numpad0 => 82,
            DK::Numpad1 => 79,
            DK::Numpad2 => 80,
            DK::Numpad3 => 81,
            DK::Numpad4 => 75,
            DK::Numpad5 => 76,
            DK::Numpad6 => 77,
            DK::Numpad7 => 71,
            DK::Numpad8 => 72,
            DK::Numpad9 => 73,
            DK::NumpadSubtract => 74,
            DK::NumpadAdd => 78,
            DK::NumpadDivide => 98,
            DK::NumpadMultiply => 55,
            // Fallback for any unmapped keys
            _ => 0,
        };
        Self(code)
    }
}

/// Modifier keys tracked by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    Shift,
    Ctrl,
    Alt,
    Meta,
    CapsLock,
}

/// What a key does when pressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Printable key: unshifted and shifted character
    Char { plain: char, shifted: char },
    Space,
    Enter,
    Tab,
    Backspace,
    Delete,
    Modifier(Modifier),
    /// Cursor movement and paging keys
    Navigation,
    /// Escape, F-keys and anything else without text
    Other,
}

/// Information about a key
#[derive(Debug, Clone)]
pub struct KeyInfo {
    /// Display name for the key
    pub name: &'static str,
    pub kind: KeyKind,
}

impl KeyInfo {
    const fn new(name: &'static str, kind: KeyKind) -> Self {
        Self { name, kind }
    }

    const fn char(name: &'static str, plain: char, shifted: char) -> Self {
        Self::new(name, KeyKind::Char { plain, shifted })
    }
}

/// Static keymap for standard US keyboard layout
pub static KEYMAP: LazyLock<HashMap<KeyCode, KeyInfo>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    // Escape and function row
    map.insert(KeyCode(1), KeyInfo::new("Escape", KeyKind::Other));
    for (i, code) in [59u16, 60, 61, 62, 63, 64, 65, 66, 67, 68, 87, 88].into_iter().enumerate() {
        const NAMES: [&str; 12] = [
            "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9", "F10", "F11", "F12",
        ];
        map.insert(KeyCode(code), KeyInfo::new(NAMES[i], KeyKind::Other));
    }

    // Number row
    map.insert(KeyCode(41), KeyInfo::char("Grave", '`', '~'));
    map.insert(KeyCode(2), KeyInfo::char("1", '1', '!'));
    map.insert(KeyCode(3), KeyInfo::char("2", '2', '@'));
    map.insert(KeyCode(4), KeyInfo::char("3", '3', '#'));
    map.insert(KeyCode(5), KeyInfo::char("4", '4', '$'));
    map.insert(KeyCode(6), KeyInfo::char("5", '5', '%'));
    map.insert(KeyCode(7), KeyInfo::char("6", '6', '^'));
    map.insert(KeyCode(8), KeyInfo::char("7", '7', '&'));
    map.insert(KeyCode(9), KeyInfo::char("8", '8', '*'));
    map.insert(KeyCode(10), KeyInfo::char("9", '9', '('));
    map.insert(KeyCode(11), KeyInfo::char("0", '0', ')'));
    map.insert(KeyCode(12), KeyInfo::char("Minus", '-', '_'));
    map.insert(KeyCode(13), KeyInfo::char("Equals", '=', '+'));
    map.insert(KeyCode(14), KeyInfo::new("Backspace", KeyKind::Backspace));

    // Top letter row
    map.insert(KeyCode(15), KeyInfo::new("Tab", KeyKind::Tab));
    map.insert(KeyCode(16), KeyInfo::char("Q", 'q', 'Q'));
    map.insert(KeyCode(17), KeyInfo::char("W", 'w', 'W'));
    map.insert(KeyCode(18), KeyInfo::char("E", 'e', 'E'));
    map.insert(KeyCode(19), KeyInfo::char("R", 'r', 'R'));
    map.insert(KeyCode(20), KeyInfo::char("T", 't', 'T'));
    map.insert(KeyCode(21), KeyInfo::char("Y", 'y', 'Y'));
    map.insert(KeyCode(22), KeyInfo::char("U", 'u', 'U'));
    map.insert(KeyCode(23), KeyInfo::char("I", 'i', 'I'));
    map.insert(KeyCode(24), KeyInfo::char("O", 'o', 'O'));
    map.insert(KeyCode(25), KeyInfo::char("P", 'p', 'P'));
    map.insert(KeyCode(26), KeyInfo::char("LeftBracket", '[', '{'));
    map.insert(KeyCode(27), KeyInfo::char("RightBracket", ']', '}'));
    map.insert(KeyCode(43), KeyInfo::char("Backslash", '\\', '|'));

    // Home row
    map.insert(KeyCode(58), KeyInfo::new("CapsLock", KeyKind::Modifier(Modifier::CapsLock)));
    map.insert(KeyCode(30), KeyInfo::char("A", 'a', 'A'));
    map.insert(KeyCode(31), KeyInfo::char("S", 's', 'S'));
    map.insert(KeyCode(32), KeyInfo::char("D", 'd', 'D'));
    map.insert(KeyCode(33), KeyInfo::char("F", 'f', 'F'));
    map.insert(KeyCode(34), KeyInfo::char("G", 'g', 'G'));
    map.insert(KeyCode(35), KeyInfo::char("H", 'h', 'H'));
    map.insert(KeyCode(36), KeyInfo::char("J", 'j', 'J'));
    map.insert(KeyCode(37), KeyInfo::char("K", 'k', 'K'));
    map.insert(KeyCode(38), KeyInfo::char("L", 'l', 'L'));
    map.insert(KeyCode(39), KeyInfo::char("Semicolon", ';', ':'));
    map.insert(KeyCode(40), KeyInfo::char("Apostrophe", '\'', '"'));
    map.insert(KeyCode(28), KeyInfo::new("Enter", KeyKind::Enter));

    // Bottom letter row
    map.insert(KeyCode(42), KeyInfo::new("LeftShift", KeyKind::Modifier(Modifier::Shift)));
    map.insert(KeyCode(44), KeyInfo::char("Z", 'z', 'Z'));
    map.insert(KeyCode(45), KeyInfo::char("X", 'x', 'X'));
    map.insert(KeyCode(46), KeyInfo::char("C", 'c', 'C'));
    map.insert(KeyCode(47), KeyInfo::char("V", 'v', 'V'));
    map.insert(KeyCode(48), KeyInfo::char("B", 'b', 'B'));
    map.insert(KeyCode(49), KeyInfo::char("N", 'n', 'N'));
    map.insert(KeyCode(50), KeyInfo::char("M", 'm', 'M'));
    map.insert(KeyCode(51), KeyInfo::char("Comma", ',', '<'));
    map.insert(KeyCode(52), KeyInfo::char("Period", '.', '>'));
    map.insert(KeyCode(53), KeyInfo::char("Slash", '/', '?'));
    map.insert(KeyCode(54), KeyInfo::new("RightShift", KeyKind::Modifier(Modifier::Shift)));

    // Bottom row (modifiers + space)
    map.insert(KeyCode(29), KeyInfo::new("LeftCtrl", KeyKind::Modifier(Modifier::Ctrl)));
    map.insert(KeyCode(125), KeyInfo::new("LeftMeta", KeyKind::Modifier(Modifier::Meta)));
    map.insert(KeyCode(56), KeyInfo::new("LeftAlt", KeyKind::Modifier(Modifier::Alt)));
    map.insert(KeyCode(57), KeyInfo::new("Space", KeyKind::Space));
    map.insert(KeyCode(100), KeyInfo::new("RightAlt", KeyKind::Modifier(Modifier::Alt)));
    map.insert(KeyCode(126), KeyInfo::new("RightMeta", KeyKind::Modifier(Modifier::Meta)));
    map.insert(KeyCode(127), KeyInfo::new("Menu", KeyKind::Other));
    map.insert(KeyCode(97), KeyInfo::new("RightCtrl", KeyKind::Modifier(Modifier::Ctrl)));

    // Arrow keys
    map.insert(KeyCode(103), KeyInfo::new("Up", KeyKind::Navigation));
    map.insert(KeyCode(105), KeyInfo::new("Left", KeyKind::Navigation));
    map.insert(KeyCode(108), KeyInfo::new("Down", KeyKind::Navigation));
    map.insert(KeyCode(106), KeyInfo::new("Right", KeyKind::Navigation));

    // Navigation cluster
    map.insert(KeyCode(110), KeyInfo::new("Insert", KeyKind::Other));
    map.insert(KeyCode(102), KeyInfo::new("Home", KeyKind::Navigation));
    map.insert(KeyCode(104), KeyInfo::new("PageUp", KeyKind::Navigation));
    map.insert(KeyCode(111), KeyInfo::new("Delete", KeyKind::Delete));
    map.insert(KeyCode(107), KeyInfo::new("End", KeyKind::Navigation));
    map.insert(KeyCode(109), KeyInfo::new("PageDown", KeyKind::Navigation));

    // Numpad
    map.insert(KeyCode(82), KeyInfo::char("Numpad0", '0', '0'));
    map.insert(KeyCode(79), KeyInfo::char("Numpad1", '1', '1'));
    map.insert(KeyCode(80), KeyInfo::char("Numpad2", '2', '2'));
    map.insert(KeyCode(81), KeyInfo::char("Numpad3", '3', '3'));
    map.insert(KeyCode(75), KeyInfo::char("Numpad4", '4', '4'));
    map.insert(KeyCode(76), KeyInfo::char("Numpad5", '5', '5'));
    map.insert(KeyCode(77), KeyInfo::char("Numpad6", '6', '6'));
    map.insert(KeyCode(71), KeyInfo::char("Numpad7", '7', '7'));
    map.insert(KeyCode(72), KeyInfo::char("Numpad8", '8', '8'));
    map.insert(KeyCode(73), KeyInfo::char("Numpad9", '9', '9'));
    map.insert(KeyCode(74), KeyInfo::char("NumpadMinus", '-', '-'));
    map.insert(KeyCode(78), KeyInfo::char("NumpadPlus", '+', '+'));
    map.insert(KeyCode(98), KeyInfo::char("NumpadSlash", '/', '/'));
    map.insert(KeyCode(55), KeyInfo::char("NumpadStar", '*', '*'));

    map
});

/// Get key info by code, returns a default if not found
pub fn get_key_info(code: KeyCode) -> KeyInfo {
    KEYMAP
        .get(&code)
        .cloned()
        .unwrap_or(KeyInfo::new("Unknown", KeyKind::Other))
}

/// The active keymap: the US table plus configured scancode remaps
#[derive(Debug, Clone, Default)]
pub struct Keymap {
    /// source scancode -> target scancode
    remaps: HashMap<KeyCode, KeyCode>,
}

impl Keymap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a keymap from `(source, target)` scancode pairs
    pub fn with_remaps(pairs: &[(u16, u16)]) -> Self {
        let mut keymap = Self::new();
        for &(from, to) in pairs {
            keymap.add_remap(from, to);
        }
        keymap
    }

    /// Add a key mapping, replacing any existing mapping for the same source
    pub fn add_remap(&mut self, from: u16, to: u16) {
        self.remaps.insert(KeyCode(from), KeyCode(to));
    }

    /// Resolve a physical key to the key it acts as
    pub fn resolve(&self, code: KeyCode) -> KeyCode {
        self.remaps.get(&code).copied().unwrap_or(code)
    }

    /// What the key does under this keymap
    pub fn kind(&self, code: KeyCode) -> KeyKind {
        get_key_info(self.resolve(code)).kind
    }

    /// Character produced by a printable key given the modifier state
    ///
    /// Caps lock only affects letters; shift inverts it.
    pub fn text_for(&self, code: KeyCode, mods: &ModifierState) -> Option<char> {
        match self.kind(code) {
            KeyKind::Char { plain, shifted } => {
                let upper = if plain.is_ascii_alphabetic() {
                    mods.shift() != mods.caps_lock()
                } else {
                    mods.shift()
                };
                Some(if upper { shifted } else { plain })
            }
            _ => None,
        }
    }
}
