//src/config.rs
use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;
use crate::remap::RemapTable;
use crate::triggers::{ReleaseRules, TriggerRule, LONG_PRESS};

//Bluetooth Service/Characteristic UUIDs
pub const HID_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001812_0000_1000_8000_00805f9b34fb);
pub const REPORT_UUID: Uuid = Uuid::from_u128(0x00002a4d_0000_1000_8000_00805f9b34fb);
pub const REPORT_MAP_UUID: Uuid = Uuid::from_u128(0x00002a4b_0000_1000_8000_00805f9b34fb);

//Timings
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);
pub const POWER_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// How the target device is found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Upper case `AA:BB:CC:DD:EE:FF`.
    Address(String),
    /// Case-insensitive prefix of the advertised name.
    NamePrefix(String),
}

impl DeviceSelector {
    pub fn address(mac: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = mac.split(':').collect();
        let valid = parts.len() == 6
            && parts
                .iter()
                .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(ConfigError::InvalidAddress(mac.to_string()));
        }
        Ok(DeviceSelector::Address(mac.to_ascii_uppercase()))
    }

    pub fn name_prefix(prefix: &str) -> Self {
        DeviceSelector::NamePrefix(prefix.to_string())
    }

    pub fn matches_name(&self, name: &str) -> bool {
        match self {
            DeviceSelector::NamePrefix(prefix) => name
                .to_lowercase()
                .starts_with(&prefix.to_lowercase()),
            DeviceSelector::Address(_) => false,
        }
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Address(address) => f.write_str(address),
            DeviceSelector::NamePrefix(prefix) => write!(f, "name '{prefix}*'"),
        }
    }
}

/// What happens to decoded key events.
#[derive(Clone, Debug, Default)]
pub enum InputMode {
    /// Emit as decoded.
    #[default]
    Passthrough,
    /// Emit through a remap table.
    Remap(RemapTable),
    /// Emit as decoded and run matching trigger commands.
    Triggers(Vec<TriggerRule>),
}

/// Capped exponential backoff.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now. Doubles the following one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Immutable runtime configuration, built once from the command line.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub device: DeviceSelector,
    pub scan_timeout: Duration,
    pub mode: InputMode,
    /// Mark the device trusted after pairing it.
    pub trust_after_pair: bool,
    pub release_rules: ReleaseRules,
    pub long_press: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl BridgeConfig {
    pub fn new(device: DeviceSelector) -> Self {
        Self {
            device,
            scan_timeout: Duration::from_secs(10),
            mode: InputMode::Passthrough,
            trust_after_pair: false,
            release_rules: ReleaseRules::default(),
            long_press: LONG_PRESS,
            reconnect_initial: RECONNECT_INITIAL,
            reconnect_max: RECONNECT_MAX,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_initial, self.reconnect_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        assert_eq!(
            DeviceSelector::address("aa:bb:cc:dd:ee:0f").unwrap(),
            DeviceSelector::Address("AA:BB:CC:DD:EE:0F".into())
        );
        for bad in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FG", "AABBCCDDEEFF", "A:BB:CC:DD:EE:FF0"] {
            assert!(
                matches!(DeviceSelector::address(bad), Err(ConfigError::InvalidAddress(_))),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn test_name_prefix_is_case_insensitive() {
        let selector = DeviceSelector::name_prefix("ab shutter");
        assert!(selector.matches_name("AB Shutter3"));
        assert!(!selector.matches_name("Shutter AB"));
        assert!(!DeviceSelector::address("AA:BB:CC:DD:EE:FF")
            .unwrap()
            .matches_name("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(RECONNECT_INITIAL, RECONNECT_MAX);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), RECONNECT_INITIAL);
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            REPORT_UUID.to_string(),
            "00002a4d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HID_SERVICE_UUID.to_string(),
            "00001812-0000-1000-8000-00805f9b34fb"
        );
    }
}
