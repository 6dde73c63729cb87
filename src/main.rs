use ble_hid_bridge::bluetoothctl::BluetoothCtl;
use ble_hid_bridge::bt_core::{BtleplugSession, ConnectionManager};
use ble_hid_bridge::cli::Cli;
use ble_hid_bridge::platform::VirtualDevices;
use ble_hid_bridge::triggers::ShellDispatcher;
use ble_hid_bridge::{Bridge, BridgeConfig, BridgeError, Control, Pipeline};
use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_level());

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = run(config).await {
        error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: BridgeConfig) -> Result<(), BridgeError> {
    info!("Starting BLE HID bridge for {}", config.device);

    let (control_tx, mut control_rx) = mpsc::channel(8);
    let signals = Signals::register()?;
    let forwarder = tokio::spawn(signals.forward(control_tx));

    // Dropping the bridge destroys the virtual devices
    let devices = VirtualDevices::create().await?;
    let session = BtleplugSession::new().await?;
    let connection = ConnectionManager::new(session, BluetoothCtl::default(), &config);
    let pipeline = Pipeline::new(&config, devices, ShellDispatcher::default());
    let mut bridge = Bridge::new(connection, pipeline);

    let result = bridge.run(&mut control_rx).await;
    forwarder.abort();
    drop(bridge);
    info!("Stopped");
    result
}

/// SIGINT, SIGTERM and SIGQUIT stop the bridge, SIGHUP reconnects.
struct Signals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    hangup: Signal,
}

impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn forward(mut self, control: mpsc::Sender<Control>) {
        loop {
            let (name, message) = tokio::select! {
                _ = self.interrupt.recv() => ("SIGINT", Control::Shutdown),
                _ = self.terminate.recv() => ("SIGTERM", Control::Shutdown),
                _ = self.quit.recv() => ("SIGQUIT", Control::Shutdown),
                _ = self.hangup.recv() => ("SIGHUP", Control::Reconnect),
            };
            info!("Received {}", name);
            if control.send(message).await.is_err() {
                return;
            }
        }
    }
}
