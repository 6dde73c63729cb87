//! Wires the connection, the decoder and the output together.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bt_core::{BleSession, ConnectionManager, DeviceManager, LinkEvent};
use crate::config::{BridgeConfig, InputMode};
use crate::error::{BridgeError, DecodeError};
use crate::hid::{InputEvent, KeyEvent, PointerEvent, ReportDecoder, ReportTable};
use crate::platform::InputSink;
use crate::remap::RemapTable;
use crate::triggers::{CommandDispatcher, TriggerEngine};

/// Requests from outside the pipeline, usually signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Shutdown,
    /// Drop the link and connect again.
    Reconnect,
}

#[derive(Debug)]
enum Stage {
    Passthrough,
    Remap(RemapTable),
    Triggers(TriggerEngine),
}

/// Decoder, remap or trigger stage and output for one device.
///
/// Survives reconnects; only the report table is replaced.
pub struct Pipeline<O, D> {
    decoder: ReportDecoder,
    stage: Stage,
    sink: O,
    dispatcher: D,
}

impl<O: InputSink, D: CommandDispatcher> Pipeline<O, D> {
    pub fn new(config: &BridgeConfig, sink: O, dispatcher: D) -> Self {
        let stage = match &config.mode {
            InputMode::Passthrough => Stage::Passthrough,
            InputMode::Remap(table) => Stage::Remap(table.clone()),
            InputMode::Triggers(rules) => Stage::Triggers(TriggerEngine::new(
                rules.clone(),
                config.long_press,
                config.release_rules,
            )),
        };
        Self {
            decoder: ReportDecoder::default(),
            stage,
            sink,
            dispatcher,
        }
    }

    pub fn sink(&self) -> &O {
        &self.sink
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn decoder(&self) -> &ReportDecoder {
        &self.decoder
    }

    /// Builds the report table for a fresh link.
    pub fn on_subscribed(&mut self, report_map: Option<&[u8]>) {
        let table = match report_map {
            Some(map) => {
                let table = ReportTable::parse(map);
                if table.is_empty() {
                    warn!("Report map has no usable input reports, guessing layouts from report length");
                } else {
                    info!("Report map describes {} input reports", table.len());
                }
                table
            }
            None => {
                info!("No report map, guessing layouts from report length");
                ReportTable::fallback()
            }
        };
        self.decoder.set_table(table);
    }

    pub fn on_report(&mut self, data: &[u8], now: Instant) {
        let events = match self.decoder.decode(data, now) {
            Ok(events) => events,
            Err(DecodeError::Rollover) => {
                debug!("Keyboard rollover, keeping previous state");
                return;
            }
            Err(e) => {
                warn!("Dropping report {:02x?}: {}", data, e);
                return;
            }
        };

        for event in events {
            match event {
                InputEvent::Key(key) => self.handle_key(key),
                InputEvent::Pointer(pointer) => self.emit_pointer(&pointer),
            }
        }
    }

    fn handle_key(&mut self, event: KeyEvent) {
        let event = match &mut self.stage {
            Stage::Passthrough => event,
            Stage::Remap(table) => table.apply(event),
            Stage::Triggers(engine) => {
                for command in engine.handle(&event) {
                    self.dispatcher.dispatch(&command);
                }
                event
            }
        };
        if let Err(e) = self.sink.emit_key(&event) {
            warn!("Failed to emit {:?}: {}", event.code, e);
        }
    }

    fn emit_pointer(&mut self, pointer: &PointerEvent) {
        if let Err(e) = self.sink.emit_pointer(pointer) {
            warn!("Failed to emit pointer event: {}", e);
        }
    }

    /// Releases everything the device was holding. Pending presses are
    /// dropped without firing.
    pub fn on_link_lost(&mut self, now: Instant) {
        let released = self.decoder.release_all(now);
        if let Stage::Triggers(engine) = &mut self.stage {
            engine.clear();
        }
        for event in released {
            let event = match &self.stage {
                Stage::Remap(table) => table.apply(event),
                _ => event,
            };
            if let Err(e) = self.sink.emit_key(&event) {
                warn!("Failed to release {:?}: {}", event.code, e);
            }
        }
        self.emit_pointer(&PointerEvent::default());
    }
}

pub struct Bridge<S, M, O, D> {
    connection: ConnectionManager<S, M>,
    pipeline: Pipeline<O, D>,
}

impl<S, M, O, D> Bridge<S, M, O, D>
where
    S: BleSession,
    M: DeviceManager,
    O: InputSink,
    D: CommandDispatcher,
{
    pub fn new(connection: ConnectionManager<S, M>, pipeline: Pipeline<O, D>) -> Self {
        Self {
            connection,
            pipeline,
        }
    }

    pub fn connection(&self) -> &ConnectionManager<S, M> {
        &self.connection
    }

    pub fn pipeline(&self) -> &Pipeline<O, D> {
        &self.pipeline
    }

    /// Runs until shutdown is requested, the control channel closes or
    /// startup fails. The BLE session is closed and held keys are released
    /// in every case.
    pub async fn run(&mut self, control: &mut mpsc::Receiver<Control>) -> Result<(), BridgeError> {
        let result = self.drive(control).await;
        if let Err(e) = &result {
            warn!("Stopping: {}", e);
        }
        self.pipeline.on_link_lost(Instant::now());
        self.connection.shutdown().await;
        result
    }

    async fn drive(&mut self, control: &mut mpsc::Receiver<Control>) -> Result<(), BridgeError> {
        {
            let establish = self.connection.establish();
            tokio::pin!(establish);
            loop {
                tokio::select! {
                    biased;
                    message = control.recv() => match message {
                        Some(Control::Reconnect) => debug!("Not connected yet, ignoring reconnect request"),
                        Some(Control::Shutdown) | None => {
                            info!("Shutdown requested during startup");
                            return Ok(());
                        }
                    },
                    result = &mut establish => {
                        result?;
                        break;
                    }
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                message = control.recv() => match message {
                    Some(Control::Reconnect) => {
                        if self.connection.force_reconnect() {
                            self.pipeline.on_link_lost(Instant::now());
                        }
                    }
                    Some(Control::Shutdown) | None => {
                        info!("Shutting down");
                        return Ok(());
                    }
                },
                event = self.connection.next_event() => match event {
                    LinkEvent::Subscribed { report_map } => {
                        self.pipeline.on_subscribed(report_map.as_deref());
                    }
                    LinkEvent::Report(data) => self.pipeline.on_report(&data, Instant::now()),
                    LinkEvent::Disconnected => self.pipeline.on_link_lost(Instant::now()),
                    LinkEvent::Closed => return Ok(()),
                },
            }
        }
    }
}
