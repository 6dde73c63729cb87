//! Bridge a Bluetooth LE HID device (keyboard, remote, mouse) to Linux
//! virtual input devices, with optional key remapping or command triggers.

pub mod bluetoothctl;
pub mod bridge;
pub mod bt_core;
pub mod cli;
pub mod config;
pub mod error;
pub mod hid;
pub mod keycodes;
pub mod platform;
pub mod remap;
pub mod triggers;

pub use bridge::{Bridge, Control, Pipeline};
pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError};
