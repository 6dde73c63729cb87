//! [`DeviceManager`] backed by the `bluetoothctl` command line tool.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::bt_core::{DeviceManager, KnownDevice, PairingOutcome, PairingState};
use crate::error::BridgeError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const PAIR_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct BluetoothCtl {
    program: PathBuf,
    command_timeout: Duration,
    pair_timeout: Duration,
}

impl Default for BluetoothCtl {
    fn default() -> Self {
        Self::with_program("bluetoothctl")
    }
}

impl BluetoothCtl {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            command_timeout: COMMAND_TIMEOUT,
            pair_timeout: PAIR_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, command: Duration, pair: Duration) -> Self {
        self.command_timeout = command;
        self.pair_timeout = pair;
        self
    }

    /// Runs one command. `Ok(None)` means it did not finish within `limit`.
    async fn run(&self, args: &[&str], limit: Duration) -> Result<Option<Output>, BridgeError> {
        debug!("bluetoothctl {}", args.join(" "));
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        match timeout(limit, child).await {
            Ok(output) => output.map(Some).map_err(|e| BridgeError::Bluetoothctl {
                command: args.join(" "),
                message: e.to_string(),
            }),
            Err(_) => Ok(None),
        }
    }

    /// Runs a command that must finish in time.
    async fn query(&self, args: &[&str]) -> Result<Output, BridgeError> {
        self.run(args, self.command_timeout)
            .await?
            .ok_or(BridgeError::Timeout("bluetoothctl"))
    }

    /// Runs a command that must also succeed.
    async fn execute(&self, args: &[&str]) -> Result<String, BridgeError> {
        let output = self.query(args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(BridgeError::Bluetoothctl {
                command: args.join(" "),
                message: failure_message(&output),
            });
        }
        Ok(stdout)
    }
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| output.status.to_string())
}

#[async_trait]
impl DeviceManager for BluetoothCtl {
    async fn controller_powered(&self) -> Result<bool, BridgeError> {
        let output = self.query(&["show"]).await?;
        if !output.status.success() {
            warn!("bluetoothctl show failed: {}", failure_message(&output));
            return Ok(false);
        }
        Ok(parse_powered(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn paired_devices(&self) -> Result<Vec<KnownDevice>, BridgeError> {
        let stdout = self.execute(&["devices", "Paired"]).await?;
        Ok(parse_devices(&stdout))
    }

    async fn device_info(&self, address: &str) -> Result<PairingState, BridgeError> {
        let output = self.query(&["info", address]).await?;
        // Unknown devices make `info` fail
        if !output.status.success() {
            debug!("{} is unknown to the host", address);
            return Ok(PairingState::default());
        }
        Ok(parse_info(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn disconnect(&self, address: &str) -> Result<(), BridgeError> {
        self.execute(&["disconnect", address]).await.map(|_| ())
    }

    async fn request_pairing_confirmation(
        &self,
        address: &str,
    ) -> Result<PairingOutcome, BridgeError> {
        let Some(output) = self.run(&["pair", address], self.pair_timeout).await? else {
            return Ok(PairingOutcome::TimedOut);
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("Pairing successful") || stdout.contains("AlreadyExists") {
            Ok(PairingOutcome::Paired)
        } else {
            Ok(PairingOutcome::Rejected(failure_message(&output)))
        }
    }

    async fn trust(&self, address: &str) -> Result<(), BridgeError> {
        self.execute(&["trust", address]).await.map(|_| ())
    }
}

fn yes(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("yes")
}

/// `Powered:` line of `bluetoothctl show`.
pub fn parse_powered(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .any(|(key, value)| key.trim().eq_ignore_ascii_case("powered") && yes(value))
}

/// Output of `bluetoothctl info <address>`. Versions that print no
/// `Bonded:` line treat every paired device as bonded.
pub fn parse_info(output: &str) -> PairingState {
    let mut state = PairingState::default();
    let mut bonded = None;
    for (key, value) in output.lines().filter_map(|line| line.trim().split_once(':')) {
        match key.trim().to_ascii_lowercase().as_str() {
            "paired" => state.paired = yes(value),
            "bonded" => bonded = Some(yes(value)),
            "trusted" => state.trusted = yes(value),
            "connected" => state.connected = yes(value),
            _ => {}
        }
    }
    state.bonded = bonded.unwrap_or(state.paired);
    state
}

/// `Device <address> <name>` lines of `bluetoothctl devices Paired`.
pub fn parse_devices(output: &str) -> Vec<KnownDevice> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, ' ');
            if parts.next()? != "Device" {
                return None;
            }
            let address = parts.next()?.to_string();
            let name = parts.next().unwrap_or_default().to_string();
            Some(KnownDevice { address, name })
        })
        .collect()
}
