//! HID report types and the BLE report decoding layer.

pub mod decoder;
pub mod descriptor;

use std::collections::BTreeSet;
use std::fmt;

use tokio::time::Instant;

use crate::keycodes::KeyCode;

pub use decoder::{decode_report, Decoded, ReportDecoder};
pub use descriptor::{Field, ReportDescriptor, ReportLayout, ReportTable};

/// Semantic kind of an input report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportKind {
    Keyboard,
    Consumer,
    Mouse,
    /// Generic Desktop system control (power, sleep, wake).
    System,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportKind::Keyboard => "keyboard",
            ReportKind::Consumer => "consumer",
            ReportKind::Mouse => "mouse",
            ReportKind::System => "system",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyValue {
    Down,
    Up,
}

impl KeyValue {
    /// Value written to `EV_KEY`.
    pub fn as_raw(self) -> i32 {
        match self {
            KeyValue::Down => 1,
            KeyValue::Up => 0,
        }
    }
}

/// A key transition detected between two consecutive reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: KeyCode,
    pub value: KeyValue,
    /// Keys held at the moment of the transition, not counting `code`.
    pub modifiers: BTreeSet<KeyCode>,
    pub timestamp: Instant,
}

/// One mouse report. Deltas are relative and never accumulated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PointerEvent {
    pub dx: i32,
    pub dy: i32,
    pub wheel: i32,
    /// Bit 0 left, bit 1 right, bit 2 middle.
    pub buttons: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputEvent {
    Key(KeyEvent),
    Pointer(PointerEvent),
}
