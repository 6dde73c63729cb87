//! Error types for the bridge

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::hid::ReportKind;

/// Problems detected while building the configuration. All of them abort
/// startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--triggers and --remapkeys cannot be used together")]
    ConflictingModes,

    #[error("exactly one of --device-mac or --device-name is required")]
    MissingDevice,

    #[error("--device-name must not be empty")]
    EmptyDeviceName,

    #[error("invalid MAC address '{0}'")]
    InvalidAddress(String),

    #[error("scan timeout must be a positive number of seconds, got {0}")]
    InvalidScanTimeout(f64),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// A single bad line in a remap or trigger file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct LineError {
    pub line: usize,
    pub message: String,
}

impl LineError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }

    pub fn in_file(self, path: impl Into<PathBuf>) -> ConfigError {
        ConfigError::Parse {
            path: path.into(),
            line: self.line,
            message: self.message,
        }
    }
}

/// Startup and session errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    #[error("no Bluetooth adapters found")]
    NoAdapter,

    #[error("no device matching '{selector}' found within {timeout:?}")]
    DeviceNotFound { selector: String, timeout: Duration },

    #[error("device {0} does not expose a HID service")]
    HidServiceMissing(String),

    #[error("device {0} has no HID report characteristic that notifies")]
    NoReportCharacteristics(String),

    #[error("failed to subscribe to any HID report of {0}")]
    SubscribeFailed(String),

    #[error("device {0} is paired but not bonded; remove and re-pair it")]
    NotBonded(String),

    #[error("device {0} is still connected to the host after disconnecting it")]
    StillConnected(String),

    #[error("pairing with {address} failed: {reason}")]
    PairingFailed { address: String, reason: String },

    #[error("bluetoothctl {command} failed: {message}")]
    Bluetoothctl { command: String, message: String },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("failed to create virtual device '{name}': {message}")]
    VirtualDevice { name: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-report decode failures. These are logged and the report dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{kind} report {id} is {len} bytes, layout needs {need}")]
    Truncated {
        kind: ReportKind,
        id: u8,
        len: usize,
        need: usize,
    },

    #[error("keyboard reported rollover, keeping previous state")]
    Rollover,
}

/// Failure to write an event to a virtual device.
#[derive(Debug, Error)]
#[error("{device}: {message}")]
pub struct EmitError {
    pub device: &'static str,
    pub message: String,
}
