//! HID usage tables mapped onto Linux input key codes.
//!
//! Key codes and their `KEY_*` names come from evdev, so remap and trigger
//! files use the same spelling as evtest and triggerhappy.

/// A Linux `EV_KEY` code. Parses from its `KEY_*`/`BTN_*` name and prints
/// that name through `Debug`.
pub use evdev::Key as KeyCode;

/// Modifier byte of a keyboard report, bit 0 first.
pub const MODIFIER_BITS: [KeyCode; 8] = [
    KeyCode::KEY_LEFTCTRL,
    KeyCode::KEY_LEFTSHIFT,
    KeyCode::KEY_LEFTALT,
    KeyCode::KEY_LEFTMETA,
    KeyCode::KEY_RIGHTCTRL,
    KeyCode::KEY_RIGHTSHIFT,
    KeyCode::KEY_RIGHTALT,
    KeyCode::KEY_RIGHTMETA,
];

/// Mouse button bitmap, bit 0 first.
pub const MOUSE_BUTTONS: [KeyCode; 3] = [KeyCode::BTN_LEFT, KeyCode::BTN_RIGHT, KeyCode::BTN_MIDDLE];

/// Keyboard/Keypad page (0x07) usage to key code.
pub fn keyboard_usage(usage: u16) -> Option<KeyCode> {
    let key = match usage {
        0x04 => KeyCode::KEY_A,
        0x05 => KeyCode::KEY_B,
        0x06 => KeyCode::KEY_C,
        0x07 => KeyCode::KEY_D,
        0x08 => KeyCode::KEY_E,
        0x09 => KeyCode::KEY_F,
        0x0A => KeyCode::KEY_G,
        0x0B => KeyCode::KEY_H,
        0x0C => KeyCode::KEY_I,
        0x0D => KeyCode::KEY_J,
        0x0E => KeyCode::KEY_K,
        0x0F => KeyCode::KEY_L,
        0x10 => KeyCode::KEY_M,
        0x11 => KeyCode::KEY_N,
        0x12 => KeyCode::KEY_O,
        0x13 => KeyCode::KEY_P,
        0x14 => KeyCode::KEY_Q,
        0x15 => KeyCode::KEY_R,
        0x16 => KeyCode::KEY_S,
        0x17 => KeyCode::KEY_T,
        0x18 => KeyCode::KEY_U,
        0x19 => KeyCode::KEY_V,
        0x1A => KeyCode::KEY_W,
        0x1B => KeyCode::KEY_X,
        0x1C => KeyCode::KEY_Y,
        0x1D => KeyCode::KEY_Z,

        // Numbers 1-9,0
        0x1E..=0x26 => KeyCode::new(KeyCode::KEY_1.code() + (usage - 0x1E)),
        0x27 => KeyCode::KEY_0,

        0x28 => KeyCode::KEY_ENTER,
        0x29 => KeyCode::KEY_ESC,
        0x2A => KeyCode::KEY_BACKSPACE,
        0x2B => KeyCode::KEY_TAB,
        0x2C => KeyCode::KEY_SPACE,
        0x2D => KeyCode::KEY_MINUS,
        0x2E => KeyCode::KEY_EQUAL,
        0x2F => KeyCode::KEY_LEFTBRACE,
        0x30 => KeyCode::KEY_RIGHTBRACE,
        0x31 | 0x32 => KeyCode::KEY_BACKSLASH,
        0x33 => KeyCode::KEY_SEMICOLON,
        0x34 => KeyCode::KEY_APOSTROPHE,
        0x35 => KeyCode::KEY_GRAVE,
        0x36 => KeyCode::KEY_COMMA,
        0x37 => KeyCode::KEY_DOT,
        0x38 => KeyCode::KEY_SLASH,
        0x39 => KeyCode::KEY_CAPSLOCK,

        // F1-F10 are contiguous, F11/F12 are not
        0x3A..=0x43 => KeyCode::new(KeyCode::KEY_F1.code() + (usage - 0x3A)),
        0x44 => KeyCode::KEY_F11,
        0x45 => KeyCode::KEY_F12,

        0x46 => KeyCode::KEY_SYSRQ,
        0x47 => KeyCode::KEY_SCROLLLOCK,
        0x48 => KeyCode::KEY_PAUSE,
        0x49 => KeyCode::KEY_INSERT,
        0x4A => KeyCode::KEY_HOME,
        0x4B => KeyCode::KEY_PAGEUP,
        0x4C => KeyCode::KEY_DELETE,
        0x4D => KeyCode::KEY_END,
        0x4E => KeyCode::KEY_PAGEDOWN,
        0x4F => KeyCode::KEY_RIGHT,
        0x50 => KeyCode::KEY_LEFT,
        0x51 => KeyCode::KEY_DOWN,
        0x52 => KeyCode::KEY_UP,

        // Keypad
        0x53 => KeyCode::KEY_NUMLOCK,
        0x54 => KeyCode::KEY_KPSLASH,
        0x55 => KeyCode::KEY_KPASTERISK,
        0x56 => KeyCode::KEY_KPMINUS,
        0x57 => KeyCode::KEY_KPPLUS,
        0x58 => KeyCode::KEY_KPENTER,
        0x59 => KeyCode::KEY_KP1,
        0x5A => KeyCode::KEY_KP2,
        0x5B => KeyCode::KEY_KP3,
        0x5C => KeyCode::KEY_KP4,
        0x5D => KeyCode::KEY_KP5,
        0x5E => KeyCode::KEY_KP6,
        0x5F => KeyCode::KEY_KP7,
        0x60 => KeyCode::KEY_KP8,
        0x61 => KeyCode::KEY_KP9,
        0x62 => KeyCode::KEY_KP0,
        0x63 => KeyCode::KEY_KPDOT,

        0x64 => KeyCode::KEY_102ND,
        0x65 => KeyCode::KEY_COMPOSE,
        0x66 => KeyCode::KEY_POWER,
        0x67 => KeyCode::KEY_KPEQUAL,
        0x68..=0x73 => KeyCode::new(KeyCode::KEY_F13.code() + (usage - 0x68)),
        0x74 => KeyCode::KEY_OPEN,
        0x75 => KeyCode::KEY_HELP,
        0x76 => KeyCode::KEY_PROPS,
        0x77 => KeyCode::KEY_FRONT,
        0x78 => KeyCode::KEY_STOP,
        0x79 => KeyCode::KEY_AGAIN,
        0x7A => KeyCode::KEY_UNDO,
        0x7B => KeyCode::KEY_CUT,
        0x7C => KeyCode::KEY_COPY,
        0x7D => KeyCode::KEY_PASTE,
        0x7E => KeyCode::KEY_FIND,
        0x7F => KeyCode::KEY_MUTE,
        0x80 => KeyCode::KEY_VOLUMEUP,
        0x81 => KeyCode::KEY_VOLUMEDOWN,

        // Modifiers can also show up in the key array
        0xE0..=0xE7 => MODIFIER_BITS[usize::from(usage - 0xE0)],
        _ => return None,
    };
    Some(key)
}

/// Consumer page (0x0C) usage to key code.
pub fn consumer_usage(usage: u16) -> Option<KeyCode> {
    let key = match usage {
        0x0030 => KeyCode::KEY_POWER,
        0x0040 => KeyCode::KEY_MENU,
        0x006F => KeyCode::KEY_BRIGHTNESSUP,
        0x0070 => KeyCode::KEY_BRIGHTNESSDOWN,
        0x009C => KeyCode::KEY_CHANNELUP,
        0x009D => KeyCode::KEY_CHANNELDOWN,
        0x00B0 => KeyCode::KEY_PLAY,
        0x00B1 => KeyCode::KEY_PAUSE,
        0x00B2 => KeyCode::KEY_RECORD,
        0x00B3 => KeyCode::KEY_FASTFORWARD,
        0x00B4 => KeyCode::KEY_REWIND,
        0x00B5 => KeyCode::KEY_NEXTSONG,
        0x00B6 => KeyCode::KEY_PREVIOUSSONG,
        0x00B7 => KeyCode::KEY_STOP,
        0x00B8 => KeyCode::KEY_EJECTCD,
        0x00CD => KeyCode::KEY_PLAYPAUSE,
        0x00E2 => KeyCode::KEY_MUTE,
        0x00E9 => KeyCode::KEY_VOLUMEUP,
        0x00EA => KeyCode::KEY_VOLUMEDOWN,
        0x0183 => KeyCode::KEY_CONFIG,
        0x018A => KeyCode::KEY_MAIL,
        0x0192 => KeyCode::KEY_CALC,
        0x0194 => KeyCode::KEY_FILE,
        0x0221 => KeyCode::KEY_SEARCH,
        0x0223 => KeyCode::KEY_HOMEPAGE,
        0x0224 => KeyCode::KEY_BACK,
        0x0225 => KeyCode::KEY_FORWARD,
        0x0226 => KeyCode::KEY_STOP,
        0x0227 => KeyCode::KEY_REFRESH,
        0x022A => KeyCode::KEY_BOOKMARKS,
        _ => return None,
    };
    Some(key)
}

/// Generic Desktop system control usages (0x81 power down, 0x82 sleep,
/// 0x83 wake up).
pub fn system_usage(usage: u16) -> Option<KeyCode> {
    match usage {
        0x81 => Some(KeyCode::KEY_POWER),
        0x82 => Some(KeyCode::KEY_SLEEP),
        0x83 => Some(KeyCode::KEY_WAKEUP),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse() {
        assert_eq!("KEY_PLAYPAUSE".parse::<KeyCode>(), Ok(KeyCode::new(164)));
        assert_eq!("BTN_LEFT".parse::<KeyCode>(), Ok(KeyCode::BTN_LEFT));
        assert_eq!(format!("{:?}", KeyCode::KEY_NEXTSONG), "KEY_NEXTSONG");
        // Matching is exact, triggerhappy files are upper case
        assert!("key_a".parse::<KeyCode>().is_err());
        assert!("KEY_DOES_NOT_EXIST".parse::<KeyCode>().is_err());
    }

    #[test]
    fn test_keyboard_usage_ranges() {
        assert_eq!(keyboard_usage(0x04), Some(KeyCode::KEY_A));
        assert_eq!(keyboard_usage(0x1E), Some(KeyCode::KEY_1));
        assert_eq!(keyboard_usage(0x26), Some(KeyCode::KEY_9));
        assert_eq!(keyboard_usage(0x27), Some(KeyCode::KEY_0));
        assert_eq!(keyboard_usage(0x3A), Some(KeyCode::KEY_F1));
        assert_eq!(keyboard_usage(0x43), Some(KeyCode::KEY_F10));
        assert_eq!(keyboard_usage(0x44), Some(KeyCode::KEY_F11));
        assert_eq!(keyboard_usage(0x68), Some(KeyCode::KEY_F13));
        assert_eq!(keyboard_usage(0x73), Some(KeyCode::KEY_F24));
        assert_eq!(keyboard_usage(0xE1), Some(KeyCode::KEY_LEFTSHIFT));
        assert_eq!(keyboard_usage(0x00), None);
        assert_eq!(keyboard_usage(0x01), None);
    }

    #[test]
    fn test_consumer_and_system_usages() {
        assert_eq!(consumer_usage(0x00CD), Some(KeyCode::KEY_PLAYPAUSE));
        assert_eq!(consumer_usage(0x00E9), Some(KeyCode::KEY_VOLUMEUP));
        assert_eq!(consumer_usage(0x00B7), Some(KeyCode::KEY_STOP));
        assert_eq!(consumer_usage(0x0000), None);
        assert_eq!(system_usage(0x82), Some(KeyCode::KEY_SLEEP));
        assert_eq!(system_usage(0x84), None);
    }
}
