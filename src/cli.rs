//! Command line interface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser};

use crate::config::{BridgeConfig, DeviceSelector, InputMode};
use crate::error::ConfigError;
use crate::remap::RemapTable;
use crate::triggers::{load_triggers, ReleaseRules};

/// Bridge a Bluetooth LE keyboard, remote or mouse to Linux virtual input
/// devices
#[derive(Parser, Debug)]
#[command(name = "ble-hid-bridge", version, about)]
#[command(group(
    ArgGroup::new("device")
        .required(true)
        .args(["device_mac", "device_name"])
))]
pub struct Cli {
    /// MAC address of the device (AA:BB:CC:DD:EE:FF)
    #[arg(long, value_name = "MAC")]
    pub device_mac: Option<String>,

    /// Connect to the first device whose name starts with this prefix
    #[arg(long, value_name = "NAME")]
    pub device_name: Option<String>,

    /// Seconds to scan when looking a device up by name
    #[arg(long, value_name = "SECONDS", default_value_t = 10.0)]
    pub scan_timeout: f64,

    /// Run commands on key presses (triggerhappy format)
    #[arg(long, value_name = "FILE", conflicts_with = "remapkeys")]
    pub triggers: Option<PathBuf>,

    /// Remap keys, one SOURCE_KEY:DEST_KEY per line
    #[arg(long, value_name = "FILE")]
    pub remapkeys: Option<PathBuf>,

    /// Debug logging
    #[arg(long)]
    pub debug: bool,

    /// Mark the device trusted after pairing
    #[arg(long)]
    pub trust: bool,

    /// A matching release trigger (value 0) suppresses short/long triggers
    #[arg(long)]
    pub exclusive_release: bool,
}

impl Cli {
    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    /// Validates the arguments and loads the remap or trigger file.
    pub fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let device = match (self.device_mac.as_deref(), self.device_name.as_deref()) {
            (Some(mac), None) => DeviceSelector::address(mac)?,
            (None, Some(name)) if name.is_empty() => return Err(ConfigError::EmptyDeviceName),
            (None, Some(name)) => DeviceSelector::name_prefix(name),
            _ => return Err(ConfigError::MissingDevice),
        };

        if !(self.scan_timeout.is_finite() && self.scan_timeout > 0.0) {
            return Err(ConfigError::InvalidScanTimeout(self.scan_timeout));
        }

        let mode = match (&self.triggers, &self.remapkeys) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingModes),
            (Some(path), None) => InputMode::Triggers(load_triggers(path)?),
            (None, Some(path)) => InputMode::Remap(RemapTable::load(path)?),
            (None, None) => InputMode::Passthrough,
        };

        let mut config = BridgeConfig::new(device);
        config.scan_timeout = Duration::from_secs_f64(self.scan_timeout);
        config.mode = mode;
        config.trust_after_pair = self.trust;
        config.release_rules = if self.exclusive_release {
            ReleaseRules::Exclusive
        } else {
            ReleaseRules::Additive
        };
        Ok(config)
    }
}
