//! HID Report Map parsing.
//!
//! A BLE HID device publishes its report descriptor through the Report Map
//! characteristic. [`ReportTable::parse`] walks the descriptor items and keeps
//! one [`ReportDescriptor`] per input report whose top-level application
//! collection is a keyboard, mouse, consumer control or system control.
//! [`ReportTable::resolve`] then matches raw notifications against it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use super::ReportKind;
use crate::error::DecodeError;

const PAGE_GENERIC_DESKTOP: u16 = 0x01;
const PAGE_KEYBOARD: u16 = 0x07;
const PAGE_BUTTON: u16 = 0x09;
const PAGE_CONSUMER: u16 = 0x0C;

const USAGE_MOUSE: u32 = 0x0001_0002;
const USAGE_KEYBOARD: u32 = 0x0001_0006;
const USAGE_SYSTEM_CONTROL: u32 = 0x0001_0080;
const USAGE_CONSUMER_CONTROL: u32 = 0x000C_0001;
const USAGE_LEFT_CONTROL: u32 = 0x0007_00E0;

/// Reports longer than this are treated as a broken Report Map.
const MAX_REPORT_BITS: usize = 64 * 1024;

/// `count` equally sized elements packed into a report payload. Offsets are
/// in bits, least significant bit first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub width: u8,
    pub count: usize,
}

impl Field {
    pub const fn new(offset: usize, width: u8, count: usize) -> Self {
        Self {
            offset,
            width,
            count,
        }
    }

    pub fn end_bit(&self) -> usize {
        self.offset
            .saturating_add(usize::from(self.width).saturating_mul(self.count))
    }

    /// Element `index` as an unsigned value. Bits past the end of `data`
    /// read as zero.
    pub fn get(&self, data: &[u8], index: usize) -> u32 {
        let start = self
            .offset
            .saturating_add(index.saturating_mul(usize::from(self.width)));
        (0..usize::from(self.width.min(32))).fold(0u32, |acc, i| {
            let bit = start.saturating_add(i);
            let set = data
                .get(bit / 8)
                .copied()
                .is_some_and(|byte| (byte >> (bit % 8)) & 1 == 1);
            if set {
                acc | (1u32 << i)
            } else {
                acc
            }
        })
    }

    /// Element `index` sign-extended from the field width.
    pub fn get_signed(&self, data: &[u8], index: usize) -> i32 {
        let shift = 32 - u32::from(self.width.clamp(1, 32));
        ((self.get(data, index) << shift) as i32) >> shift
    }

    pub fn elements<'a>(&'a self, data: &'a [u8]) -> impl Iterator<Item = u32> + 'a {
        (0..self.count).map(move |index| self.get(data, index))
    }
}

/// Where the interesting fields of one report live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportLayout {
    Keyboard {
        modifiers: Option<Field>,
        keys: Field,
    },
    Consumer {
        usages: Field,
    },
    Mouse {
        buttons: Option<Field>,
        x: Field,
        y: Field,
        wheel: Option<Field>,
    },
    /// One bit per usage, starting at `first_usage` on the Generic Desktop page.
    System {
        bits: Field,
        first_usage: u16,
    },
}

impl ReportLayout {
    pub fn kind(&self) -> ReportKind {
        match self {
            ReportLayout::Keyboard { .. } => ReportKind::Keyboard,
            ReportLayout::Consumer { .. } => ReportKind::Consumer,
            ReportLayout::Mouse { .. } => ReportKind::Mouse,
            ReportLayout::System { .. } => ReportKind::System,
        }
    }

    fn fields(&self) -> impl Iterator<Item = Field> {
        let fields = match *self {
            ReportLayout::Keyboard { modifiers, keys } => [modifiers, Some(keys), None, None],
            ReportLayout::Consumer { usages } => [Some(usages), None, None, None],
            ReportLayout::Mouse {
                buttons,
                x,
                y,
                wheel,
            } => [buttons, Some(x), Some(y), wheel],
            ReportLayout::System { bits, .. } => [Some(bits), None, None, None],
        };
        fields.into_iter().flatten()
    }

    /// Smallest payload, in bytes, that covers every field of the layout.
    pub fn required_len(&self) -> usize {
        self.fields()
            .map(|field| field.end_bit())
            .max()
            .unwrap_or(0)
            .div_ceil(8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportDescriptor {
    /// Report ID, 0 when the device does not use IDs.
    pub id: u8,
    /// Declared payload size in bytes, without the ID byte.
    pub size: usize,
    pub layout: ReportLayout,
}

impl ReportDescriptor {
    pub fn kind(&self) -> ReportKind {
        self.layout.kind()
    }

    pub fn required_len(&self) -> usize {
        self.layout.required_len()
    }

    /// Layout guessed from the payload length alone, used when the device's
    /// Report Map could not be read.
    pub fn from_length(len: usize) -> Option<Self> {
        let layout = match len {
            1 => ReportLayout::System {
                bits: Field::new(0, 1, 3),
                first_usage: 0x81,
            },
            2 | 3 => ReportLayout::Consumer {
                usages: Field::new(0, 16, 1),
            },
            4 | 5 => ReportLayout::Mouse {
                buttons: Some(Field::new(0, 1, 3)),
                x: Field::new(8, 8, 1),
                y: Field::new(16, 8, 1),
                wheel: Some(Field::new(24, 8, 1)),
            },
            8 => ReportLayout::Keyboard {
                modifiers: Some(Field::new(0, 1, 8)),
                keys: Field::new(16, 8, 6),
            },
            _ => return None,
        };
        Some(Self {
            id: 0,
            size: len,
            layout,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Globals {
    usage_page: u16,
    report_size: u32,
    report_count: u32,
    report_id: u8,
}

#[derive(Debug, Default)]
struct Locals {
    usages: Vec<u32>,
    usage_min: Option<u32>,
    usage_max: Option<u32>,
}

impl Locals {
    /// Usage of element `index`. An explicit usage list wins over a range,
    /// and its last entry repeats for the remaining elements.
    fn usage(&self, index: usize) -> Option<u32> {
        if let Some(&usage) = self.usages.get(index).or(self.usages.last()) {
            return Some(usage);
        }
        let min = self.usage_min?;
        let max = self.usage_max.unwrap_or(min);
        let index = u32::try_from(index).unwrap_or(u32::MAX);
        Some(min.saturating_add(index).min(max))
    }
}

#[derive(Debug)]
struct InputItem {
    locals: Locals,
    offset: usize,
    size: u32,
    count: u32,
    variable: bool,
    constant: bool,
}

impl InputItem {
    fn usage(&self, index: usize) -> Option<u32> {
        self.locals.usage(index)
    }

    fn page(&self) -> Option<u16> {
        self.usage(0).map(|usage| (usage >> 16) as u16)
    }

    fn field(&self) -> Option<Field> {
        let width = u8::try_from(self.size)
            .ok()
            .filter(|width| (1..=32).contains(width))?;
        Some(Field::new(self.offset, width, self.count as usize))
    }
}

/// Input reports of one device, keyed by report ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportTable {
    reports: BTreeMap<u8, ReportDescriptor>,
}

impl ReportTable {
    /// Table that resolves every report through [`ReportDescriptor::from_length`].
    pub fn fallback() -> Self {
        Self::default()
    }

    pub fn parse(report_map: &[u8]) -> Self {
        let mut globals = Globals::default();
        let mut global_stack = Vec::new();
        let mut locals = Locals::default();
        let mut collections: Vec<u32> = Vec::new();
        let mut applications: BTreeMap<u8, u32> = BTreeMap::new();
        let mut inputs: BTreeMap<u8, Vec<InputItem>> = BTreeMap::new();
        let mut bits: BTreeMap<u8, usize> = BTreeMap::new();
        let mut oversized: BTreeSet<u8> = BTreeSet::new();

        let mut pos = 0;
        while pos < report_map.len() {
            let prefix = report_map[pos];
            if prefix == 0xFE {
                // Long item: size byte, tag byte, data
                let Some(&len) = report_map.get(pos + 1) else {
                    break;
                };
                pos += 3 + usize::from(len);
                continue;
            }

            let len = match prefix & 0x03 {
                3 => 4,
                n => usize::from(n),
            };
            let Some(data) = report_map.get(pos + 1..pos + 1 + len) else {
                trace!("Report map truncated at byte {}", pos);
                break;
            };
            pos += 1 + len;

            let value = data
                .iter()
                .rev()
                .fold(0u32, |acc, &byte| (acc << 8) | u32::from(byte));
            let tag = prefix >> 4;

            match (prefix >> 2) & 0x03 {
                // Main
                0 => {
                    match tag {
                        0x8 => {
                            let id = globals.report_id;
                            let offset = bits.entry(id).or_insert(0);
                            if let Some(&application) = collections.first() {
                                applications.entry(id).or_insert(application);
                            }
                            let end = (globals.report_size as usize)
                                .checked_mul(globals.report_count as usize)
                                .and_then(|len| offset.checked_add(len))
                                .filter(|&end| end <= MAX_REPORT_BITS);
                            let Some(end) = end else {
                                if oversized.insert(id) {
                                    debug!(
                                        "Report {}: {} x {} bit input overflows the report, skipping it",
                                        id, globals.report_count, globals.report_size
                                    );
                                }
                                locals = Locals::default();
                                continue;
                            };
                            inputs.entry(id).or_default().push(InputItem {
                                locals: std::mem::take(&mut locals),
                                offset: *offset,
                                size: globals.report_size,
                                count: globals.report_count,
                                variable: value & 0x02 != 0,
                                constant: value & 0x01 != 0,
                            });
                            *offset = end;
                        }
                        0xA => collections.push(locals.usage(0).unwrap_or(0)),
                        0xC => {
                            collections.pop();
                        }
                        _ => {}
                    }
                    locals = Locals::default();
                }
                // Global
                1 => match tag {
                    0x0 => globals.usage_page = value as u16,
                    0x7 => globals.report_size = value,
                    0x8 => globals.report_id = value as u8,
                    0x9 => globals.report_count = value,
                    0xA => global_stack.push(globals),
                    0xB => {
                        if let Some(saved) = global_stack.pop() {
                            globals = saved;
                        }
                    }
                    _ => {}
                },
                // Local. Four byte usages carry their own page.
                2 => {
                    let usage = if len == 4 {
                        value
                    } else {
                        (u32::from(globals.usage_page) << 16) | value
                    };
                    match tag {
                        0x0 => locals.usages.push(usage),
                        0x1 => locals.usage_min = Some(usage),
                        0x2 => locals.usage_max = Some(usage),
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let mut reports = BTreeMap::new();
        for (&id, items) in &inputs {
            if oversized.contains(&id) {
                continue;
            }
            let Some(&application) = applications.get(&id) else {
                continue;
            };
            let size = bits.get(&id).copied().unwrap_or(0).div_ceil(8);
            let layout = match application {
                USAGE_KEYBOARD => keyboard_layout(items),
                USAGE_MOUSE => mouse_layout(items),
                USAGE_CONSUMER_CONTROL => consumer_layout(items),
                USAGE_SYSTEM_CONTROL => system_layout(items),
                _ => None,
            };
            match layout {
                Some(layout) => {
                    debug!("Report {}: {} layout, {} bytes", id, layout.kind(), size);
                    reports.insert(id, ReportDescriptor { id, size, layout });
                }
                None => debug!(
                    "Report {}: skipping application usage {:#010x}",
                    id, application
                ),
            }
        }

        Self { reports }
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn get(&self, id: u8) -> Option<&ReportDescriptor> {
        self.reports.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReportDescriptor> {
        self.reports.values()
    }

    fn uses_report_ids(&self) -> bool {
        self.reports.keys().any(|&id| id != 0)
    }

    /// Matches a notification to a report. Returns the descriptor and the
    /// payload without ID byte or zero padding, `Ok(None)` for data that
    /// matches nothing.
    pub fn resolve<'a>(
        &self,
        data: &'a [u8],
    ) -> Result<Option<(ReportDescriptor, &'a [u8])>, DecodeError> {
        if self.reports.is_empty() {
            return Ok(ReportDescriptor::from_length(data.len()).map(|desc| (desc, data)));
        }

        let mut short = None;
        if self.uses_report_ids() {
            if let Some((&id, payload)) = data.split_first() {
                if let Some(desc) = self.reports.get(&id) {
                    match accept(desc, payload) {
                        Ok(Some(payload)) => return Ok(Some((*desc, payload))),
                        Ok(None) => {}
                        Err(err) => short = Some(err),
                    }
                }
            }
        }

        // Devices that drop the ID byte from notifications
        if let Some(desc) = unique(self.iter().filter(|desc| desc.size == data.len())) {
            return Ok(Some((*desc, data)));
        }
        if let Some(desc) = unique(
            self.iter()
                .filter(|desc| desc.size < data.len() && is_zero(&data[desc.size..])),
        ) {
            return Ok(Some((*desc, &data[..desc.size])));
        }
        if !self.uses_report_ids() && self.reports.len() == 1 {
            if let Some(desc) = self.reports.values().next() {
                if let Some(payload) = accept(desc, data)? {
                    return Ok(Some((*desc, payload)));
                }
            }
        }

        match short {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

/// Payload check for a known report: long enough for the layout, anything
/// past the declared size zero.
fn accept<'a>(desc: &ReportDescriptor, payload: &'a [u8]) -> Result<Option<&'a [u8]>, DecodeError> {
    let need = desc.required_len();
    if payload.len() < need {
        return Err(DecodeError::Truncated {
            kind: desc.kind(),
            id: desc.id,
            len: payload.len(),
            need,
        });
    }
    if payload.len() <= desc.size {
        Ok(Some(payload))
    } else if is_zero(&payload[desc.size..]) {
        Ok(Some(&payload[..desc.size]))
    } else {
        Ok(None)
    }
}

fn unique<'a>(mut matches: impl Iterator<Item = &'a ReportDescriptor>) -> Option<&'a ReportDescriptor> {
    let first = matches.next()?;
    match matches.next() {
        Some(_) => None,
        None => Some(first),
    }
}

fn is_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&byte| byte == 0)
}

fn data_items(items: &[InputItem]) -> impl Iterator<Item = &InputItem> {
    items.iter().filter(|item| !item.constant)
}

fn keyboard_layout(items: &[InputItem]) -> Option<ReportLayout> {
    let modifiers = data_items(items)
        .find(|item| item.variable && item.size == 1 && item.usage(0) == Some(USAGE_LEFT_CONTROL))
        .and_then(InputItem::field)
        .map(|field| Field {
            count: field.count.min(8),
            ..field
        });
    let keys = data_items(items)
        .find(|item| !item.variable && item.size == 8 && item.page() == Some(PAGE_KEYBOARD))
        .and_then(InputItem::field)?;
    Some(ReportLayout::Keyboard { modifiers, keys })
}

fn mouse_layout(items: &[InputItem]) -> Option<ReportLayout> {
    let buttons = data_items(items)
        .find(|item| item.variable && item.size == 1 && item.page() == Some(PAGE_BUTTON))
        .and_then(InputItem::field)
        .map(|field| Field {
            count: field.count.min(8),
            ..field
        });

    let (mut x, mut y, mut wheel) = (None, None, None);
    for item in data_items(items).filter(|item| item.variable) {
        let Some(field) = item.field() else {
            continue;
        };
        for index in 0..field.count {
            let Some(usage) = item.usage(index) else {
                continue;
            };
            if (usage >> 16) as u16 != PAGE_GENERIC_DESKTOP {
                continue;
            }
            let element = Some(Field::new(
                field.offset + index * usize::from(field.width),
                field.width,
                1,
            ));
            match usage & 0xFFFF {
                0x30 => x = element,
                0x31 => y = element,
                0x38 => wheel = element,
                _ => {}
            }
        }
    }

    Some(ReportLayout::Mouse {
        buttons,
        x: x?,
        y: y?,
        wheel,
    })
}

fn consumer_layout(items: &[InputItem]) -> Option<ReportLayout> {
    data_items(items)
        .find(|item| {
            !item.variable && item.page() == Some(PAGE_CONSUMER) && matches!(item.size, 8 | 16)
        })
        .and_then(InputItem::field)
        .map(|usages| ReportLayout::Consumer { usages })
}

fn system_layout(items: &[InputItem]) -> Option<ReportLayout> {
    let item = data_items(items).find(|item| {
        item.variable && item.size == 1 && item.page() == Some(PAGE_GENERIC_DESKTOP)
    })?;
    Some(ReportLayout::System {
        bits: item.field()?,
        first_usage: (item.usage(0)? & 0xFFFF) as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Consumer (ID 1), keyboard without modifiers (ID 2), mouse with X/Y
    // ahead of the buttons (ID 3) and a vendor report (ID 4).
    const MEDIA_REMOTE: &str = "050c0901a101850119002a9c021500269c0295017510810009\
                                02a10205091901290a1501250a950175088140c0c005010906\
                                a1018502050775089506150026a400050719002aa4008100c0\
                                05010902a1010901a10085030501093009311580257f750895\
                                02810605091901290515002501950575018102950175038103\
                                c0c00601ff0901a10285040914750895501580257f81228504\
                                0904750895019102c0";

    // Mouse (ID 1), boot style keyboard (ID 2), consumer (ID 3), system
    // control (ID 4).
    const COMBO_KEYBOARD: &str = "05010902a10185010901a10005091901290815002501750195\
                                  08810205010930093109381581257f750895038106c0c00501\
                                  0906a1018502050719e029e715002501750195088102950175\
                                  08810195057501050819012905910295017503910195067508\
                                  1500257f0507190029658100c0050c0901a101850375109501\
                                  1501268c0219012a8c028160c005010980a101850405011981\
                                  298315002501950375018106950175058101c0";

    fn hex(text: &str) -> Vec<u8> {
        (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_field_reads_bits_lsb_first() {
        let field = Field::new(4, 4, 2);
        assert_eq!(field.get(&[0xA0, 0x0B], 0), 0xA);
        assert_eq!(field.get(&[0xA0, 0x0B], 1), 0xB);
        assert_eq!(field.elements(&[0xA0, 0x0B]).collect::<Vec<_>>(), vec![0xA, 0xB]);
        // Past the end reads as zero
        assert_eq!(field.get(&[0xA0], 1), 0);
    }

    #[test]
    fn test_field_sign_extension() {
        assert_eq!(Field::new(0, 8, 1).get_signed(&[0xFF], 0), -1);
        assert_eq!(Field::new(0, 8, 1).get_signed(&[0x7F], 0), 127);
        assert_eq!(Field::new(0, 12, 1).get_signed(&[0x00, 0x08], 0), -2048);
        assert_eq!(Field::new(0, 16, 1).get_signed(&[0xFE, 0xFF], 0), -2);
    }

    #[test]
    fn test_parse_media_remote() {
        let table = ReportTable::parse(&hex(MEDIA_REMOTE));
        assert_eq!(table.len(), 3);

        let consumer = table.get(1).unwrap();
        assert_eq!(consumer.size, 3);
        assert_eq!(
            consumer.layout,
            ReportLayout::Consumer {
                usages: Field::new(0, 16, 1)
            }
        );

        let keyboard = table.get(2).unwrap();
        assert_eq!(keyboard.size, 6);
        assert_eq!(
            keyboard.layout,
            ReportLayout::Keyboard {
                modifiers: None,
                keys: Field::new(0, 8, 6)
            }
        );

        let mouse = table.get(3).unwrap();
        assert_eq!(mouse.size, 3);
        assert_eq!(
            mouse.layout,
            ReportLayout::Mouse {
                buttons: Some(Field::new(16, 1, 5)),
                x: Field::new(0, 8, 1),
                y: Field::new(8, 8, 1),
                wheel: None,
            }
        );

        // Vendor page report is not an input we understand
        assert!(table.get(4).is_none());
    }

    #[test]
    fn test_parse_combo_keyboard() {
        let table = ReportTable::parse(&hex(COMBO_KEYBOARD));
        assert_eq!(table.len(), 4);

        assert_eq!(
            *table.get(1).unwrap(),
            ReportDescriptor {
                id: 1,
                size: 4,
                layout: ReportLayout::Mouse {
                    buttons: Some(Field::new(0, 1, 8)),
                    x: Field::new(8, 8, 1),
                    y: Field::new(16, 8, 1),
                    wheel: Some(Field::new(24, 8, 1)),
                },
            }
        );
        assert_eq!(
            *table.get(2).unwrap(),
            ReportDescriptor {
                id: 2,
                size: 8,
                layout: ReportLayout::Keyboard {
                    modifiers: Some(Field::new(0, 1, 8)),
                    keys: Field::new(16, 8, 6),
                },
            }
        );
        assert_eq!(table.get(3).unwrap().kind(), ReportKind::Consumer);
        assert_eq!(table.get(3).unwrap().size, 2);
        assert_eq!(
            table.get(4).unwrap().layout,
            ReportLayout::System {
                bits: Field::new(0, 1, 3),
                first_usage: 0x81
            }
        );
    }

    #[test]
    fn test_resolve_real_device_reports() {
        let table = ReportTable::parse(&hex(MEDIA_REMOTE));

        // Consumer payload shorter than declared but covering the usage
        let (desc, payload) = table.resolve(&[0x01, 0xE9, 0x00]).unwrap().unwrap();
        assert_eq!(desc.id, 1);
        assert_eq!(payload, &[0xE9, 0x00]);

        // Keyboard with trailing zero padding
        let mut report = vec![0x02];
        report.extend([0u8; 9]);
        let (desc, payload) = table.resolve(&report).unwrap().unwrap();
        assert_eq!(desc.kind(), ReportKind::Keyboard);
        assert_eq!(payload.len(), 6);

        // Mouse needs three payload bytes
        assert_eq!(
            table.resolve(&[0x03, 0x00, 0x00]),
            Err(DecodeError::Truncated {
                kind: ReportKind::Mouse,
                id: 3,
                len: 2,
                need: 3
            })
        );

        let table = ReportTable::parse(&hex(COMBO_KEYBOARD));
        let mut report = vec![0x01];
        report.extend([0u8; 6]);
        let (desc, payload) = table.resolve(&report).unwrap().unwrap();
        assert_eq!(desc.kind(), ReportKind::Mouse);
        assert_eq!(payload.len(), 4);
    }

    fn consumer_only() -> ReportTable {
        // ID 1: one 16 bit consumer usage
        ReportTable::parse(&[
            0x05, 0x0C, 0x09, 0x01, 0xA1, 0x01, 0x85, 0x01, 0x75, 0x10, 0x95, 0x01, 0x19, 0x00,
            0x2A, 0x9C, 0x02, 0x81, 0x00, 0xC0,
        ])
    }

    #[test]
    fn test_resolve_padding() {
        let table = consumer_only();
        assert_eq!(table.get(1).unwrap().size, 2);

        let (_, payload) = table.resolve(&[0x01, 0xE9, 0x00]).unwrap().unwrap();
        assert_eq!(payload, &[0xE9, 0x00]);

        let (_, payload) = table.resolve(&[0x01, 0xE9, 0x00, 0x00]).unwrap().unwrap();
        assert_eq!(payload, &[0xE9, 0x00]);

        // Non-zero padding is not padding
        assert_eq!(table.resolve(&[0x01, 0xE9, 0x00, 0xFF]), Ok(None));
    }

    #[test]
    fn test_resolve_without_report_id() {
        let table = consumer_only();

        let (desc, payload) = table.resolve(&[0xE9, 0x00]).unwrap().unwrap();
        assert_eq!(desc.id, 1);
        assert_eq!(payload, &[0xE9, 0x00]);

        let (_, payload) = table.resolve(&[0xE9, 0x00, 0x00]).unwrap().unwrap();
        assert_eq!(payload, &[0xE9, 0x00]);
    }

    #[test]
    fn test_fallback_by_length() {
        let table = ReportTable::fallback();
        let kinds: Vec<_> = [1usize, 2, 3, 4, 5, 8]
            .into_iter()
            .map(|len| table.resolve(&vec![0; len]).unwrap().unwrap().0.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ReportKind::System,
                ReportKind::Consumer,
                ReportKind::Consumer,
                ReportKind::Mouse,
                ReportKind::Mouse,
                ReportKind::Keyboard
            ]
        );
        assert_eq!(table.resolve(&[0; 7]), Ok(None));
    }

    #[test]
    fn test_long_items_and_truncation_are_tolerated() {
        let mut map = vec![0xFE, 0x02, 0x10, 0xAA, 0xBB];
        map.extend(hex(COMBO_KEYBOARD));
        map.extend([0x26, 0xFF]);
        assert_eq!(ReportTable::parse(&map).len(), 4);
        assert!(ReportTable::parse(&[0x05]).is_empty());
    }

    // Keyboard report 1 with Report Size and Report Count of 0xFFFFFFFF
    const HUGE_KEYBOARD: [u8; 25] = [
        0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x85, 0x01, 0x77, 0xFF, 0xFF, 0xFF, 0xFF, 0x97, 0xFF,
        0xFF, 0xFF, 0xFF, 0x81, 0x00, 0x81, 0x00, 0x81, 0x00, 0xC0,
    ];

    #[test]
    fn test_oversized_reports_are_skipped() {
        assert!(ReportTable::parse(&HUGE_KEYBOARD).is_empty());

        // The same report under ID 9 does not spoil the others
        let mut map = HUGE_KEYBOARD.to_vec();
        map[7] = 0x09;
        map.extend(hex(COMBO_KEYBOARD));
        let table = ReportTable::parse(&map);
        assert_eq!(table.len(), 4);
        assert!(table.get(9).is_none());
        assert_eq!(table.get(2).unwrap().size, 8);
    }

    #[test]
    fn test_field_arithmetic_saturates() {
        let field = Field::new(usize::MAX - 4, 8, usize::MAX);
        assert_eq!(field.end_bit(), usize::MAX);
        assert_eq!(field.get(&[0xFF; 4], 3), 0);
    }
}
