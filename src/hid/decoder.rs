//! Turns resolved reports into key transitions and pointer events.

use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;
use tracing::{debug, trace};

use super::descriptor::{ReportDescriptor, ReportLayout, ReportTable};
use super::{InputEvent, KeyEvent, KeyValue, PointerEvent, ReportKind};
use crate::error::DecodeError;
use crate::keycodes::{consumer_usage, keyboard_usage, system_usage, KeyCode, MODIFIER_BITS};

/// Keyboard array value meaning "too many keys held".
const ERROR_ROLLOVER: u32 = 0x01;

/// Output of [`decode_report`], before timestamps and modifiers are attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    Key { code: KeyCode, value: KeyValue },
    Pointer(PointerEvent),
}

/// Key state carried by one report.
#[derive(Debug, Default)]
struct KeySnapshot {
    /// Bitmap keys in bit order, with their state.
    flags: Vec<(KeyCode, bool)>,
    /// Array keys in slot order, unknown usages and duplicates removed.
    slots: Vec<KeyCode>,
}

impl KeySnapshot {
    fn read(layout: &ReportLayout, data: &[u8]) -> Result<Self, DecodeError> {
        let mut snapshot = Self::default();
        match *layout {
            ReportLayout::Keyboard { modifiers, keys } => {
                if let Some(modifiers) = modifiers {
                    snapshot.flags = MODIFIER_BITS
                        .iter()
                        .take(modifiers.count)
                        .enumerate()
                        .map(|(bit, &code)| (code, modifiers.get(data, bit) != 0))
                        .collect();
                }
                let raw: Vec<u32> = keys.elements(data).collect();
                if !raw.is_empty() && raw.iter().all(|&usage| usage == ERROR_ROLLOVER) {
                    return Err(DecodeError::Rollover);
                }
                snapshot.push_slots(raw, keyboard_usage);
            }
            ReportLayout::Consumer { usages } => {
                snapshot.push_slots(usages.elements(data), consumer_usage);
            }
            ReportLayout::System { bits, first_usage } => {
                for bit in 0..bits.count {
                    let usage = u16::try_from(bit)
                        .ok()
                        .and_then(|bit| first_usage.checked_add(bit));
                    if let Some(code) = usage.and_then(system_usage) {
                        snapshot.flags.push((code, bits.get(data, bit) != 0));
                    }
                }
            }
            ReportLayout::Mouse { .. } => {}
        }
        Ok(snapshot)
    }

    fn push_slots(&mut self, raw: impl IntoIterator<Item = u32>, map: fn(u16) -> Option<KeyCode>) {
        for usage in raw.into_iter().filter(|&usage| usage != 0) {
            match u16::try_from(usage).ok().and_then(map) {
                Some(code) if !self.slots.contains(&code) => self.slots.push(code),
                Some(_) => {}
                None => trace!("Ignoring unmapped usage {:#06x}", usage),
            }
        }
    }

    fn active(&self) -> BTreeSet<KeyCode> {
        self.flags
            .iter()
            .filter(|(_, down)| *down)
            .map(|(code, _)| *code)
            .chain(self.slots.iter().copied())
            .collect()
    }

    /// Bitmap changes in bit order, then releases in the previous slot
    /// order, then presses in the new slot order.
    fn transitions(&self, now: &KeySnapshot) -> Vec<Decoded> {
        let was = self.active();
        let is = now.active();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();

        for &(code, _) in &now.flags {
            if !seen.insert(code) {
                continue;
            }
            match (was.contains(&code), is.contains(&code)) {
                (false, true) => out.push(Decoded::Key {
                    code,
                    value: KeyValue::Down,
                }),
                (true, false) => out.push(Decoded::Key {
                    code,
                    value: KeyValue::Up,
                }),
                _ => {}
            }
        }
        for &code in &self.slots {
            if !is.contains(&code) && seen.insert(code) {
                out.push(Decoded::Key {
                    code,
                    value: KeyValue::Up,
                });
            }
        }
        for &code in &now.slots {
            if !was.contains(&code) && seen.insert(code) {
                out.push(Decoded::Key {
                    code,
                    value: KeyValue::Down,
                });
            }
        }
        out
    }
}

/// Decodes one payload against the previous payload of the same report.
///
/// Key reports produce the transitions between the two. Mouse reports
/// produce exactly one pointer event and ignore `previous`.
pub fn decode_report(
    desc: &ReportDescriptor,
    previous: Option<&[u8]>,
    current: &[u8],
) -> Result<Vec<Decoded>, DecodeError> {
    let need = desc.required_len();
    if current.len() < need {
        return Err(DecodeError::Truncated {
            kind: desc.kind(),
            id: desc.id,
            len: current.len(),
            need,
        });
    }

    if let ReportLayout::Mouse {
        buttons,
        x,
        y,
        wheel,
    } = desc.layout
    {
        let buttons = buttons.map_or(0, |field| {
            (0..field.count.min(8))
                .filter(|&bit| field.get(current, bit) != 0)
                .fold(0u8, |acc, bit| acc | (1 << bit))
        });
        return Ok(vec![Decoded::Pointer(PointerEvent {
            dx: x.get_signed(current, 0),
            dy: y.get_signed(current, 0),
            wheel: wheel.map_or(0, |field| field.get_signed(current, 0)),
            buttons,
        })]);
    }

    let now = KeySnapshot::read(&desc.layout, current)?;
    let before = match previous {
        Some(previous) if previous.len() >= need => {
            KeySnapshot::read(&desc.layout, previous).unwrap_or_default()
        }
        _ => KeySnapshot::default(),
    };
    Ok(before.transitions(&now))
}

/// Stateful decoder for one connected device.
///
/// Keeps the last payload of every report so transitions can be computed,
/// and the set of keys currently held so each key event carries the
/// modifiers active at that instant.
#[derive(Debug, Default)]
pub struct ReportDecoder {
    table: ReportTable,
    previous: HashMap<(u8, ReportKind), Vec<u8>>,
    held: BTreeSet<KeyCode>,
}

impl ReportDecoder {
    pub fn new(table: ReportTable) -> Self {
        Self {
            table,
            previous: HashMap::new(),
            held: BTreeSet::new(),
        }
    }

    pub fn table(&self) -> &ReportTable {
        &self.table
    }

    /// Installs the table for a new connection. Stored payloads are dropped,
    /// held keys are not; call [`release_all`](Self::release_all) first.
    pub fn set_table(&mut self, table: ReportTable) {
        self.table = table;
        self.previous.clear();
    }

    pub fn held(&self) -> &BTreeSet<KeyCode> {
        &self.held
    }

    pub fn decode(&mut self, data: &[u8], now: Instant) -> Result<Vec<InputEvent>, DecodeError> {
        let Some((desc, payload)) = self.table.resolve(data)? else {
            debug!("Ignoring unrecognised {} byte report", data.len());
            return Ok(Vec::new());
        };

        let key = (desc.id, desc.kind());
        let decoded = decode_report(&desc, self.previous.get(&key).map(Vec::as_slice), payload)?;
        if desc.kind() != ReportKind::Mouse {
            self.previous.insert(key, payload.to_vec());
        }

        Ok(decoded
            .into_iter()
            .map(|decoded| self.stamp(decoded, now))
            .collect())
    }

    fn stamp(&mut self, decoded: Decoded, now: Instant) -> InputEvent {
        match decoded {
            Decoded::Pointer(pointer) => InputEvent::Pointer(pointer),
            Decoded::Key { code, value } => {
                match value {
                    KeyValue::Down => {
                        self.held.insert(code);
                    }
                    KeyValue::Up => {
                        self.held.remove(&code);
                    }
                }
                let modifiers = self.held.iter().copied().filter(|&held| held != code).collect();
                InputEvent::Key(KeyEvent {
                    code,
                    value,
                    modifiers,
                    timestamp: now,
                })
            }
        }
    }

    /// Releases every held key, as on link loss. Stored payloads are
    /// forgotten so the next report is compared against an idle device.
    pub fn release_all(&mut self, now: Instant) -> Vec<KeyEvent> {
        self.previous.clear();
        std::mem::take(&mut self.held)
            .into_iter()
            .map(|code| KeyEvent {
                code,
                value: KeyValue::Up,
                modifiers: BTreeSet::new(),
                timestamp: now,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::Field;

    fn boot_keyboard() -> ReportDescriptor {
        ReportDescriptor::from_length(8).unwrap()
    }

    fn keys(events: &[Decoded]) -> Vec<(KeyCode, KeyValue)> {
        events
            .iter()
            .filter_map(|event| match *event {
                Decoded::Key { code, value } => Some((code, value)),
                Decoded::Pointer(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_keyboard_symmetric_difference() {
        let desc = boot_keyboard();
        let r1 = [0x00, 0x00, 0x04, 0x05, 0x00, 0x00, 0x00, 0x00]; // a, b
        let r2 = [0x00, 0x00, 0x05, 0x06, 0x00, 0x00, 0x00, 0x00]; // b, c

        let events = decode_report(&desc, Some(&r1), &r2).unwrap();
        assert_eq!(
            keys(&events),
            vec![
                (KeyCode::KEY_A, KeyValue::Up),
                (KeyCode::KEY_C, KeyValue::Down)
            ]
        );
        assert!(decode_report(&desc, Some(&r2), &r2).unwrap().is_empty());
    }

    #[test]
    fn test_modifiers_come_first() {
        let desc = boot_keyboard();
        let idle = [0u8; 8];
        let shifted = [0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00];

        let events = decode_report(&desc, Some(&idle), &shifted).unwrap();
        assert_eq!(
            keys(&events),
            vec![
                (KeyCode::KEY_LEFTSHIFT, KeyValue::Down),
                (KeyCode::KEY_A, KeyValue::Down)
            ]
        );

        let events = decode_report(&desc, Some(&shifted), &idle).unwrap();
        assert_eq!(
            keys(&events),
            vec![
                (KeyCode::KEY_LEFTSHIFT, KeyValue::Up),
                (KeyCode::KEY_A, KeyValue::Up)
            ]
        );
    }

    #[test]
    fn test_unknown_and_duplicate_usages_are_skipped() {
        let desc = boot_keyboard();
        let report = [0x00, 0x00, 0x04, 0x04, 0xFF, 0x00, 0x00, 0x00];
        let events = decode_report(&desc, None, &report).unwrap();
        assert_eq!(keys(&events), vec![(KeyCode::KEY_A, KeyValue::Down)]);
    }

    #[test]
    fn test_rollover_is_an_error() {
        let desc = boot_keyboard();
        let report = [0x00, 0x00, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01];
        assert_eq!(decode_report(&desc, None, &report), Err(DecodeError::Rollover));
    }

    #[test]
    fn test_consumer_press_and_release() {
        let desc = ReportDescriptor::from_length(2).unwrap();
        let events = decode_report(&desc, Some(&[0x00, 0x00]), &[0xCD, 0x00]).unwrap();
        assert_eq!(keys(&events), vec![(KeyCode::KEY_PLAYPAUSE, KeyValue::Down)]);
        let events = decode_report(&desc, Some(&[0xCD, 0x00]), &[0x00, 0x00]).unwrap();
        assert_eq!(keys(&events), vec![(KeyCode::KEY_PLAYPAUSE, KeyValue::Up)]);
    }

    #[test]
    fn test_system_control_bits() {
        let desc = ReportDescriptor::from_length(1).unwrap();
        let events = decode_report(&desc, None, &[0x02]).unwrap();
        assert_eq!(keys(&events), vec![(KeyCode::KEY_SLEEP, KeyValue::Down)]);
    }

    #[test]
    fn test_mouse_report() {
        let desc = ReportDescriptor::from_length(4).unwrap();
        let events = decode_report(&desc, None, &[0x05, 0x10, 0xF0, 0xFF]).unwrap();
        assert_eq!(
            events,
            vec![Decoded::Pointer(PointerEvent {
                dx: 16,
                dy: -16,
                wheel: -1,
                buttons: 0b101,
            })]
        );
    }

    #[test]
    fn test_mouse_with_wide_axes() {
        let desc = ReportDescriptor {
            id: 1,
            size: 5,
            layout: ReportLayout::Mouse {
                buttons: Some(Field::new(0, 1, 3)),
                x: Field::new(8, 12, 1),
                y: Field::new(20, 12, 1),
                wheel: None,
            },
        };
        // x = -2 (0xFFE), y = 3
        let events = decode_report(&desc, None, &[0x00, 0xFE, 0x3F, 0x00, 0x00]).unwrap();
        assert_eq!(
            events,
            vec![Decoded::Pointer(PointerEvent {
                dx: -2,
                dy: 3,
                wheel: 0,
                buttons: 0,
            })]
        );
    }

    #[test]
    fn test_truncated_report() {
        let desc = boot_keyboard();
        assert!(matches!(
            decode_report(&desc, None, &[0x00, 0x00]),
            Err(DecodeError::Truncated { need: 8, len: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_decoder_tracks_modifiers_and_releases_all() {
        let mut decoder = ReportDecoder::new(ReportTable::fallback());
        let now = Instant::now();

        decoder
            .decode(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], now)
            .unwrap();
        let events = decoder
            .decode(&[0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00], now)
            .unwrap();
        let InputEvent::Key(event) = &events[0] else {
            panic!("expected a key event, got {events:?}");
        };
        assert_eq!(event.code, KeyCode::KEY_A);
        assert_eq!(event.modifiers, BTreeSet::from([KeyCode::KEY_LEFTSHIFT]));

        // Rollover keeps the previous state
        let rollover = [0x02, 0x00, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01];
        assert_eq!(decoder.decode(&rollover, now), Err(DecodeError::Rollover));
        assert_eq!(decoder.held().len(), 2);

        let released = decoder.release_all(now);
        let codes: Vec<_> = released.iter().map(|event| event.code).collect();
        assert_eq!(codes, vec![KeyCode::KEY_A, KeyCode::KEY_LEFTSHIFT]);
        assert!(released.iter().all(|event| event.value == KeyValue::Up));
        assert!(decoder.held().is_empty());
    }
}
