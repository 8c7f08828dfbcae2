//! Keyboard capture: signal sources, normalization, keymap and modifier state

mod event;
mod listener;
mod normalizer;
mod state;
pub mod keymap;

pub use event::{
    ChannelSource, Edge, InputEvent, RawSignal, ReplaySource, SignalSource, SourceItem,
    VALUE_PRESS, VALUE_RELEASE, VALUE_REPEAT,
};
pub use keymap::{get_key_info, KeyCode, KeyInfo, KeyKind, Keymap, Modifier, KEYMAP};
pub use listener::KeyboardListener;
pub use normalizer::{Capture, CaptureAnomaly, CaptureCounters, Normalizer};
pub use state::ModifierState;
