//! TOML settings: zones, safety relay, and actuation limits.
//!
//! Settings are owned by the operator. The controller never writes them back;
//! it re-reads the file on every operation so live edits apply on the next
//! call.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_active_zones")]
    pub max_active_zones: usize,
    /// Upper bound for a single zone activation, in minutes.
    #[serde(default = "default_max_zone_duration")]
    pub max_zone_duration: u32,
    /// Pause between program steps, in minutes.
    #[serde(default = "default_activation_delay")]
    pub activation_delay: u32,
    #[serde(default = "default_true")]
    pub automatic_programs_enabled: bool,
    /// Many common relay boards are active-low.
    #[serde(default = "default_true")]
    pub relay_active_low: bool,
    #[serde(default)]
    pub safety_relay: Option<SafetyRelayEntry>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRelayEntry {
    pub pin: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEntry {
    pub id: u8,
    pub pin: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_max_active_zones() -> usize {
    3
}

fn default_max_zone_duration() -> u32 {
    180
}

fn default_activation_delay() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    /// Factory layout: eight zones on pins 14-21, safety relay on 13.
    fn default() -> Self {
        let names = [
            "Giardino",
            "Terrazzo",
            "Cancelletto",
            "Zona 4",
            "Zona 5",
            "Zona 6",
            "Zona 7",
            "Zona 8",
        ];
        let zones = names
            .iter()
            .enumerate()
            .map(|(i, name)| ZoneEntry {
                id: i as u8,
                pin: 14 + i as i64,
                name: (*name).to_string(),
                visible: true,
            })
            .collect();

        Self {
            max_active_zones: default_max_active_zones(),
            max_zone_duration: default_max_zone_duration(),
            activation_delay: default_activation_delay(),
            automatic_programs_enabled: true,
            relay_active_low: true,
            safety_relay: Some(SafetyRelayEntry { pin: 13 }),
            zones,
        }
    }
}

impl Settings {
    pub fn zone(&self, zone_id: u8) -> Option<&ZoneEntry> {
        self.zones.iter().find(|z| z.id == zone_id)
    }

    /// `(zone_id, pin)` pairs for board initialisation.
    pub fn zone_pins(&self) -> Vec<(u8, u8)> {
        self.zones.iter().map(|z| (z.id, z.pin as u8)).collect()
    }

    pub fn safety_relay_pin(&self) -> Option<u8> {
        self.safety_relay.as_ref().map(|r| r.pin as u8)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_limits(&mut errors);
        self.validate_outputs(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_limits(&self, errors: &mut Vec<String>) {
        if self.max_active_zones == 0 {
            errors.push("max_active_zones must be at least 1".to_string());
        }
        if self.max_zone_duration == 0 {
            errors.push("max_zone_duration must be at least 1 minute".to_string());
        }
    }

    fn validate_outputs(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<u8> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        if let Some(relay) = &self.safety_relay {
            if VALID_GPIO_PINS.contains(&relay.pin) {
                seen_pins.insert(relay.pin);
            } else {
                errors.push(format!(
                    "safety_relay: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    relay.pin
                ));
            }
        }

        for z in &self.zones {
            let ctx = format!("zone {}", z.id);

            if !seen_ids.insert(z.id) {
                errors.push(format!("{ctx}: duplicate zone id"));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            if !VALID_GPIO_PINS.contains(&z.pin) {
                errors.push(format!(
                    "{ctx}: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    z.pin
                ));
            } else if !seen_pins.insert(z.pin) {
                errors.push(format!(
                    "{ctx}: pin {} is already used by another output",
                    z.pin
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate TOML settings text.
pub fn parse(contents: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(contents).context("failed to parse settings")?;
    settings.validate()?;
    Ok(settings)
}

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &str) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings: {path}"))?;
    parse(&contents).with_context(|| format!("invalid settings: {path}"))
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Where the core reads its settings from. Called on every operation.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> Settings;
}

/// Settings file re-read on every call.
///
/// A missing file means factory defaults. A broken file keeps the last
/// settings that parsed, so a half-saved edit never takes zones offline.
pub struct FileSettings {
    path: PathBuf,
    last_good: Mutex<Option<Settings>>,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_good: Mutex::new(None),
        }
    }
}

impl SettingsSource for FileSettings {
    fn current(&self) -> Settings {
        let mut last_good = self.last_good.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.path.to_string_lossy();

        if !self.path.exists() {
            return last_good.clone().unwrap_or_default();
        }

        match load(&path) {
            Ok(settings) => {
                *last_good = Some(settings.clone());
                settings
            }
            Err(e) => {
                tracing::warn!(path = %path, "settings unusable, keeping previous: {e:#}");
                last_good.clone().unwrap_or_default()
            }
        }
    }
}

/// In-memory settings, shared and editable. Used by tests and embedders.
#[derive(Clone, Default)]
pub struct StaticSettings {
    inner: Arc<Mutex<Settings>>,
}

impl StaticSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut s);
    }
}

impl SettingsSource for StaticSettings {
    fn current(&self) -> Settings {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
