//! Virtual keyboard and mouse backed by uinput.
//!
//! Both devices are destroyed when [`VirtualDevices`] is dropped.

use std::convert::Infallible;
use std::fmt::Display;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};
use evdev::{EventType, RelativeAxisType, Synchronization};
use uinput::device::{Builder, Device};
use uinput::event::controller::Mouse;
use uinput::event::relative::{Position, Wheel};
use uinput::event::{self, Controller, Relative};
use uinput::Event;

use crate::error::{BridgeError, EmitError};
use crate::hid::{KeyEvent, PointerEvent};
use crate::keycodes::MOUSE_BUTTONS;

pub const KEYBOARD_NAME: &str = "BLE HID Bridge Keyboard";
pub const MOUSE_NAME: &str = "BLE HID Bridge Mouse";

const UINPUT_PATH: &str = "/dev/uinput";

// Raw codes as uinput writes them
pub const EV_SYN: i32 = EventType::SYNCHRONIZATION.0 as i32;
pub const EV_KEY: i32 = EventType::KEY.0 as i32;
pub const EV_REL: i32 = EventType::RELATIVE.0 as i32;
pub const SYN_REPORT: i32 = Synchronization::SYN_REPORT.0 as i32;
pub const REL_X: i32 = RelativeAxisType::REL_X.0 as i32;
pub const REL_Y: i32 = RelativeAxisType::REL_Y.0 as i32;
pub const REL_WHEEL: i32 = RelativeAxisType::REL_WHEEL.0 as i32;

const CREATE_ATTEMPTS: u32 = 5;
const CREATE_BACKOFF: Duration = Duration::from_millis(500);
const CREATE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Destination of decoded input.
pub trait InputSink {
    fn emit_key(&mut self, event: &KeyEvent) -> Result<(), EmitError>;
    fn emit_pointer(&mut self, event: &PointerEvent) -> Result<(), EmitError>;
}

/// Raw event writer, one per device node.
pub trait EventWriter {
    type Error: Display;

    fn write_event(&mut self, kind: i32, code: i32, value: i32) -> Result<(), Self::Error>;
}

impl EventWriter for Device {
    type Error = uinput::Error;

    fn write_event(&mut self, kind: i32, code: i32, value: i32) -> Result<(), Self::Error> {
        self.write(kind, code, value)
    }
}

/// Writer that keeps every event, for tests and dry runs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordingWriter {
    pub events: Vec<(i32, i32, i32)>,
}

impl EventWriter for RecordingWriter {
    type Error = Infallible;

    fn write_event(&mut self, kind: i32, code: i32, value: i32) -> Result<(), Self::Error> {
        self.events.push((kind, code, value));
        Ok(())
    }
}

/// The keyboard and mouse pair the bridge writes to.
#[derive(Debug)]
pub struct VirtualDevices<W = Device> {
    keyboard: W,
    mouse: W,
    /// Last button bitmap written to the mouse.
    buttons: u8,
}

impl VirtualDevices<Device> {
    /// Creates both uinput devices, retrying while `/dev/uinput` is not
    /// usable yet.
    pub async fn create() -> Result<Self, BridgeError> {
        let keyboard = create_with_retry(KEYBOARD_NAME, build_keyboard).await?;
        let mouse = create_with_retry(MOUSE_NAME, build_mouse).await?;
        info!("Created virtual devices '{}' and '{}'", KEYBOARD_NAME, MOUSE_NAME);
        Ok(Self::from_writers(keyboard, mouse))
    }
}

impl<W: EventWriter> VirtualDevices<W> {
    pub fn from_writers(keyboard: W, mouse: W) -> Self {
        Self {
            keyboard,
            mouse,
            buttons: 0,
        }
    }

    pub fn keyboard(&self) -> &W {
        &self.keyboard
    }

    pub fn mouse(&self) -> &W {
        &self.mouse
    }
}

fn write<W: EventWriter>(
    writer: &mut W,
    device: &'static str,
    kind: i32,
    code: i32,
    value: i32,
) -> Result<(), EmitError> {
    writer
        .write_event(kind, code, value)
        .map_err(|e| EmitError {
            device,
            message: e.to_string(),
        })
}

impl<W: EventWriter> InputSink for VirtualDevices<W> {
    fn emit_key(&mut self, event: &KeyEvent) -> Result<(), EmitError> {
        debug!("{:?} {:?}", event.code, event.value);
        let code = i32::from(event.code.code());
        write(&mut self.keyboard, KEYBOARD_NAME, EV_KEY, code, event.value.as_raw())?;
        write(&mut self.keyboard, KEYBOARD_NAME, EV_SYN, SYN_REPORT, 0)
    }

    fn emit_pointer(&mut self, event: &PointerEvent) -> Result<(), EmitError> {
        for (bit, button) in MOUSE_BUTTONS.iter().enumerate() {
            let mask = 1u8 << bit;
            if (event.buttons ^ self.buttons) & mask != 0 {
                let pressed = i32::from(event.buttons & mask != 0);
                write(&mut self.mouse, MOUSE_NAME, EV_KEY, i32::from(button.code()), pressed)?;
                self.buttons ^= mask;
            }
        }
        for (code, value) in [(REL_X, event.dx), (REL_Y, event.dy), (REL_WHEEL, event.wheel)] {
            if value != 0 {
                write(&mut self.mouse, MOUSE_NAME, EV_REL, code, value)?;
            }
        }
        write(&mut self.mouse, MOUSE_NAME, EV_SYN, SYN_REPORT, 0)
    }
}

fn build_keyboard() -> Result<Device, uinput::Error> {
    Builder::open(UINPUT_PATH)?
        .name(KEYBOARD_NAME)?
        .event(Event::Keyboard(event::Keyboard::All))?
        .create()
}

fn build_mouse() -> Result<Device, uinput::Error> {
    Builder::open(UINPUT_PATH)?
        .name(MOUSE_NAME)?
        .event(Event::Controller(Controller::Mouse(Mouse::Left)))?
        .event(Event::Controller(Controller::Mouse(Mouse::Right)))?
        .event(Event::Controller(Controller::Mouse(Mouse::Middle)))?
        .event(Event::Relative(Relative::Position(Position::X)))?
        .event(Event::Relative(Relative::Position(Position::Y)))?
        .event(Event::Relative(Relative::Wheel(Wheel::Vertical)))?
        .create()
}

async fn create_with_retry<T, E: Display>(
    name: &'static str,
    mut build: impl FnMut() -> Result<T, E>,
) -> Result<T, BridgeError> {
    let mut delay = CREATE_BACKOFF;
    let mut attempt = 1;
    loop {
        match build() {
            Ok(device) => return Ok(device),
            Err(e) if attempt < CREATE_ATTEMPTS => {
                warn!(
                    "Failed to create '{}' (attempt {}/{}): {}. Retrying in {:?}",
                    name, attempt, CREATE_ATTEMPTS, e, delay
                );
                sleep(delay).await;
                delay = (delay * 2).min(CREATE_BACKOFF_MAX);
                attempt += 1;
            }
            Err(e) => {
                return Err(BridgeError::VirtualDevice {
                    name,
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tokio::time::Instant;

    use super::*;
    use crate::hid::KeyValue;
    use crate::keycodes::KeyCode;

    const BTN_LEFT: i32 = KeyCode::BTN_LEFT.0 as i32;
    const BTN_RIGHT: i32 = KeyCode::BTN_RIGHT.0 as i32;

    fn devices() -> VirtualDevices<RecordingWriter> {
        VirtualDevices::from_writers(RecordingWriter::default(), RecordingWriter::default())
    }

    #[test]
    fn test_key_event_is_synced() {
        let mut devices = devices();
        let event = KeyEvent {
            code: KeyCode::KEY_VOLUMEUP,
            value: KeyValue::Down,
            modifiers: BTreeSet::new(),
            timestamp: Instant::now(),
        };
        devices.emit_key(&event).unwrap();
        assert_eq!(
            devices.keyboard().events,
            vec![(EV_KEY, 115, 1), (EV_SYN, SYN_REPORT, 0)]
        );
        assert!(devices.mouse().events.is_empty());
    }

    #[test]
    fn test_pointer_writes_changes_only() {
        let mut devices = devices();
        devices
            .emit_pointer(&PointerEvent {
                dx: 5,
                dy: 0,
                wheel: -1,
                buttons: 0b001,
            })
            .unwrap();
        devices
            .emit_pointer(&PointerEvent {
                dx: 0,
                dy: -3,
                wheel: 0,
                buttons: 0b011,
            })
            .unwrap();
        devices.emit_pointer(&PointerEvent::default()).unwrap();

        assert_eq!(
            devices.mouse().events,
            vec![
                (EV_KEY, BTN_LEFT, 1),
                (EV_REL, REL_X, 5),
                (EV_REL, REL_WHEEL, -1),
                (EV_SYN, SYN_REPORT, 0),
                (EV_KEY, BTN_RIGHT, 1),
                (EV_REL, REL_Y, -3),
                (EV_SYN, SYN_REPORT, 0),
                (EV_KEY, BTN_LEFT, 0),
                (EV_KEY, BTN_RIGHT, 0),
                (EV_SYN, SYN_REPORT, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_with_backoff() {
        let started = Instant::now();
        let mut calls = 0;
        let result = create_with_retry("test", || {
            calls += 1;
            if calls < 4 {
                Err("busy")
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 4);
        // 0.5 + 1 + 2 seconds of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_gives_up() {
        let started = Instant::now();
        let result: Result<(), _> = create_with_retry("test", || Err("no /dev/uinput")).await;
        assert!(matches!(
            result,
            Err(BridgeError::VirtualDevice { name: "test", .. })
        ));
        // 0.5 + 1 + 2 + 4
        assert_eq!(started.elapsed(), Duration::from_millis(7500));
    }
}
