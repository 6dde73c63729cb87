//! Key remapping loaded from a `SOURCE:DEST` file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConfigError, LineError};
use crate::hid::KeyEvent;
use crate::keycodes::KeyCode;

/// Total mapping of key codes. Codes without an entry map to themselves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemapTable {
    map: HashMap<KeyCode, KeyCode>,
}

impl RemapTable {
    pub fn parse(text: &str) -> Result<Self, LineError> {
        let mut map = HashMap::new();
        for (index, line) in text.lines().enumerate() {
            let number = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (source, dest) = line
                .split_once(':')
                .ok_or_else(|| LineError::new(number, format!("expected SOURCE:DEST, got '{line}'")))?;
            let source = parse_key(number, source)?;
            let dest = parse_key(number, dest)?;
            if map.insert(source, dest).is_some() {
                return Err(LineError::new(number, format!("{source:?} is remapped twice")));
            }
            debug!("Remap {:?} -> {:?}", source, dest);
        }
        Ok(Self { map })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse(&text).map_err(|err| err.in_file(path))?;
        info!("Loaded {} key remaps from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn lookup(&self, code: KeyCode) -> KeyCode {
        self.map.get(&code).copied().unwrap_or(code)
    }

    /// Remaps the event's key and its modifier set.
    pub fn apply(&self, event: KeyEvent) -> KeyEvent {
        KeyEvent {
            code: self.lookup(event.code),
            modifiers: event.modifiers.into_iter().map(|code| self.lookup(code)).collect(),
            ..event
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn parse_key(line: usize, name: &str) -> Result<KeyCode, LineError> {
    let name = name.trim();
    name.parse()
        .map_err(|_| LineError::new(line, format!("unknown key name '{name}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Write;

    use tokio::time::Instant;

    use super::*;
    use crate::hid::KeyValue;

    #[test]
    fn test_parse_and_lookup() {
        let table = RemapTable::parse(
            "# media remote\n\
             KEY_NEXTSONG:KEY_RIGHT\n\
             \n\
             KEY_PREVIOUSSONG : KEY_LEFT\n",
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(KeyCode::KEY_NEXTSONG), KeyCode::KEY_RIGHT);
        assert_eq!(table.lookup(KeyCode::KEY_PREVIOUSSONG), KeyCode::KEY_LEFT);
        // Total: anything else maps to itself
        assert_eq!(table.lookup(KeyCode::KEY_A), KeyCode::KEY_A);
        assert_eq!(table.lookup(KeyCode::new(0x2ff)), KeyCode::new(0x2ff));
    }

    #[test]
    fn test_parse_errors_carry_the_line() {
        assert_eq!(
            RemapTable::parse("KEY_A:KEY_B\nKEY_C KEY_D\n").unwrap_err().line,
            2
        );
        assert_eq!(
            RemapTable::parse("\n\nKEY_A:KEY_NOPE\n").unwrap_err(),
            LineError::new(3, "unknown key name 'KEY_NOPE'")
        );
        assert_eq!(
            RemapTable::parse("KEY_A:KEY_B\nKEY_A:KEY_C\n").unwrap_err().line,
            2
        );
    }

    #[test]
    fn test_apply_remaps_modifiers() {
        let table = RemapTable::parse("KEY_CAPSLOCK:KEY_LEFTCTRL\nKEY_H:KEY_LEFT\n").unwrap();
        let event = KeyEvent {
            code: KeyCode::KEY_H,
            value: KeyValue::Down,
            modifiers: BTreeSet::from([KeyCode::KEY_CAPSLOCK]),
            timestamp: Instant::now(),
        };
        let mapped = table.apply(event.clone());
        assert_eq!(mapped.code, KeyCode::KEY_LEFT);
        assert_eq!(mapped.modifiers, BTreeSet::from([KeyCode::KEY_LEFTCTRL]));
        assert_eq!(mapped.timestamp, event.timestamp);
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "KEY_NEXTSONG:KEY_RIGHT").unwrap();
        writeln!(file, "KEY_BOGUS:KEY_LEFT").unwrap();

        match RemapTable::load(file.path()) {
            Err(ConfigError::Parse { path, line, .. }) => {
                assert_eq!(path, file.path());
                assert_eq!(line, 2);
            }
            other => panic!("expected a parse error, got {other:?}"),
        }

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            RemapTable::load(&missing),
            Err(ConfigError::Io { .. })
        ));
    }
}
