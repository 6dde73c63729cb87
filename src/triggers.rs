//! Triggerhappy style command bindings.
//!
//! A trigger file binds a key, optionally with modifiers, and a press class
//! to a shell command:
//!
//! ```text
//! KEY_PLAYPAUSE            1  mpc toggle
//! KEY_PLAYPAUSE            2  mpc stop
//! KEY_VOLUMEUP+KEY_LEFTSHIFT 0  amixer set Master 10%+
//! ```
//!
//! Class `0` fires on every release, `1` on a short press and `2` on a long
//! press.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, LineError};
use crate::hid::{KeyEvent, KeyValue};
use crate::keycodes::KeyCode;

/// Presses held at least this long are long presses.
pub const LONG_PRESS: Duration = Duration::from_millis(500);

/// Longest command prefix written to the log.
const LOGGED_COMMAND_LEN: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PressClass {
    Release,
    Short,
    Long,
}

impl PressClass {
    fn from_value(value: &str) -> Option<Self> {
        match value {
            "0" => Some(PressClass::Release),
            "1" => Some(PressClass::Short),
            "2" => Some(PressClass::Long),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerRule {
    pub key: KeyCode,
    pub modifiers: BTreeSet<KeyCode>,
    pub class: PressClass,
    pub command: String,
}

impl TriggerRule {
    fn matches(&self, key: KeyCode, class: PressClass, held: &BTreeSet<KeyCode>) -> bool {
        self.key == key && self.class == class && self.modifiers.is_subset(held)
    }
}

/// Splits off the first whitespace separated field.
fn next_field(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    let end = text.find(char::is_whitespace)?;
    Some((&text[..end], &text[end..]))
}

fn parse_key(line: usize, name: &str) -> Result<KeyCode, LineError> {
    name.parse()
        .map_err(|_| LineError::new(line, format!("unknown key name '{name}'")))
}

pub fn parse_triggers(text: &str) -> Result<Vec<TriggerRule>, LineError> {
    let mut rules: Vec<TriggerRule> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields = next_field(line).and_then(|(spec, rest)| {
            let (value, command) = next_field(rest)?;
            let command = command.trim();
            (!command.is_empty()).then_some((spec, value, command))
        });
        let Some((spec, value, command)) = fields else {
            return Err(LineError::new(number, "expected KEY VALUE COMMAND"));
        };

        let mut names = spec.split('+');
        let key = parse_key(number, names.next().unwrap_or_default())?;
        let modifiers = names
            .map(|name| parse_key(number, name))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let class = PressClass::from_value(value).ok_or_else(|| {
            LineError::new(number, format!("invalid value '{value}', expected 0, 1 or 2"))
        })?;

        if rules
            .iter()
            .any(|rule| rule.key == key && rule.class == class && rule.modifiers == modifiers)
        {
            return Err(LineError::new(number, format!("duplicate trigger for {spec} {value}")));
        }
        rules.push(TriggerRule {
            key,
            modifiers,
            class,
            command: command.to_string(),
        });
    }
    Ok(rules)
}

pub fn load_triggers(path: &Path) -> Result<Vec<TriggerRule>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rules = parse_triggers(&text).map_err(|err| err.in_file(path))?;
    info!("Loaded {} triggers from {}", rules.len(), path.display());
    Ok(rules)
}

/// Whether a release rule and a duration rule may both fire for one release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReleaseRules {
    /// Both fire, release rule first.
    #[default]
    Additive,
    /// A matching release rule suppresses the duration rule.
    Exclusive,
}

#[derive(Debug)]
struct PressState {
    pressed_at: Instant,
    modifiers: BTreeSet<KeyCode>,
}

/// Classifies presses and picks the commands to run on each release.
#[derive(Debug)]
pub struct TriggerEngine {
    rules: Vec<TriggerRule>,
    presses: HashMap<KeyCode, PressState>,
    long_press: Duration,
    release_rules: ReleaseRules,
}

impl TriggerEngine {
    pub fn new(rules: Vec<TriggerRule>, long_press: Duration, release_rules: ReleaseRules) -> Self {
        Self {
            rules,
            presses: HashMap::new(),
            long_press,
            release_rules,
        }
    }

    /// Keys with a recorded press.
    pub fn pending(&self) -> usize {
        self.presses.len()
    }

    /// Feeds one key event. Returns the commands to run, in firing order.
    pub fn handle(&mut self, event: &KeyEvent) -> Vec<String> {
        match event.value {
            KeyValue::Down => {
                self.presses.entry(event.code).or_insert_with(|| PressState {
                    pressed_at: event.timestamp,
                    modifiers: event.modifiers.clone(),
                });
                Vec::new()
            }
            KeyValue::Up => {
                let Some(press) = self.presses.remove(&event.code) else {
                    return Vec::new();
                };
                let held = event.timestamp.saturating_duration_since(press.pressed_at);
                let class = if held >= self.long_press {
                    PressClass::Long
                } else {
                    PressClass::Short
                };
                debug!("{:?} released after {:?} ({:?})", event.code, held, class);

                let mut fired = Vec::new();
                if let Some(rule) = self.best_match(event.code, PressClass::Release, &press.modifiers) {
                    fired.push(rule.command.clone());
                }
                if fired.is_empty() || self.release_rules == ReleaseRules::Additive {
                    if let Some(rule) = self.best_match(event.code, class, &press.modifiers) {
                        fired.push(rule.command.clone());
                    }
                }
                fired
            }
        }
    }

    /// Most specific matching rule, earliest in the file on a tie.
    fn best_match(
        &self,
        key: KeyCode,
        class: PressClass,
        held: &BTreeSet<KeyCode>,
    ) -> Option<&TriggerRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(key, class, held))
            .fold(None, |best: Option<&TriggerRule>, rule| match best {
                Some(best) if best.modifiers.len() >= rule.modifiers.len() => Some(best),
                _ => Some(rule),
            })
    }

    /// Forgets every recorded press without firing anything.
    pub fn clear(&mut self) {
        self.presses.clear();
    }
}

/// Runs trigger commands.
pub trait CommandDispatcher {
    /// Starts `command` without waiting for it.
    fn dispatch(&self, command: &str);
}

/// Runs commands through `<shell> -c` with stdio detached.
#[derive(Clone, Debug)]
pub struct ShellDispatcher {
    shell: PathBuf,
}

impl Default for ShellDispatcher {
    fn default() -> Self {
        Self::with_shell("/bin/sh")
    }
}

impl ShellDispatcher {
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandDispatcher for ShellDispatcher {
    fn dispatch(&self, command: &str) {
        let shown = truncate(command, LOGGED_COMMAND_LEN).to_string();
        info!("Running: {}", shown);

        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => debug!("'{}' finished", shown),
                        Ok(status) => warn!("'{}' exited with {}", shown, status),
                        Err(e) => warn!("Failed waiting for '{}': {}", shown, e),
                    }
                });
            }
            Err(e) => warn!("Failed to start '{}': {}", shown, e),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
