//! Configuration management for the agent
//!
//! Handles JSON configuration parsing, validation, merging of pushed
//! updates and write-through to disk

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{DEFAULT_POLL_INTERVAL, LOCAL_CONFIG_FILE, POLL_INTERVAL_MAX, POLL_INTERVAL_MIN};
use crate::error::ConfigError;

/// Driver library paths keyed by host OS, then vendor code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverTable(BTreeMap<String, BTreeMap<String, PathBuf>>);

impl DriverTable {
    /// Look up the driver for a vendor on the given OS. `macos` and
    /// `darwin` name the same OS.
    pub fn resolve(&self, os: &str, vendor: &str) -> Option<&Path> {
        let vendor = normalize_vendor(vendor).ok()?;
        let os = canonical_os(os);
        self.0
            .get(os.as_str())
            .and_then(|vendors| vendors.get(&vendor))
            .map(PathBuf::as_path)
    }

    pub fn insert(&mut self, os: &str, vendor: &str, path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        let vendor = normalize_vendor(vendor)?;
        self.0
            .entry(canonical_os(os))
            .or_default()
            .insert(vendor, path.into());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    fn normalized(self) -> Result<Self, ConfigError> {
        let mut table = DriverTable::default();
        for (os, vendors) in self.0 {
            for (vendor, path) in vendors {
                table.insert(&os, &vendor, path)?;
            }
        }
        Ok(table)
    }
}

/// Main agent configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfiguration {
    /// Driver library per OS and vendor
    #[serde(default, alias = "TokenDriver")]
    pub token_driver: DriverTable,
    /// Where the configuration is persisted
    #[serde(default, alias = "Path")]
    pub path: PathBuf,
    /// Poll interval (100ms-300s)
    #[serde(
        default = "default_reload_time",
        alias = "ReloadTime",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub reload_time: Duration,
    /// Vendor codes considered tokens
    #[serde(default, alias = "PossibleVendors")]
    pub possible_vendors: BTreeSet<String>,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            token_driver: DriverTable::default(),
            path: PathBuf::new(),
            reload_time: DEFAULT_POLL_INTERVAL,
            possible_vendors: BTreeSet::new(),
        }
    }
}

/// A pushed configuration update. Present fields replace live values,
/// absent fields keep theirs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default, alias = "TokenDriver")]
    pub token_driver: Option<DriverTable>,
    #[serde(default, alias = "Path")]
    pub path: Option<PathBuf>,
    #[serde(default, alias = "ReloadTime")]
    pub reload_time: Option<String>,
    #[serde(default, alias = "PossibleVendors")]
    pub possible_vendors: Option<Vec<String>>,
}

impl ConfigPatch {
    pub fn from_json(body: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(body)?)
    }
}

impl AgentConfiguration {
    /// Parse, normalize and validate a configuration document
    pub fn from_json(body: &[u8]) -> Result<Self, ConfigError> {
        let config: AgentConfiguration = serde_json::from_slice(body)?;
        config.normalized()
    }

    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&content)?;
        if config.path.as_os_str().is_empty() {
            config.path = path.to_path_buf();
        }
        Ok(config)
    }

    /// Load configuration from file, or the defaults bound to `path` when
    /// the file does not exist yet
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        Ok(Self {
            path: path.to_path_buf(),
            ..Self::default()
        })
    }

    /// Example configuration pushed by `tokenwatch config push` when no
    /// file is given
    pub fn example() -> Self {
        let mut token_driver = DriverTable::default();
        let _ = token_driver.insert("linux", "0A89", "/usr/lib/librtpkcs11ecp.so");
        let _ = token_driver.insert("darwin", "0A89", "/Library/Aktiv Co/Rutoken ECP/lib/librtpkcs11ecp.dylib");
        let _ = token_driver.insert("windows", "0A89", "C:\\Windows\\System32\\rtPKCS11.dll");

        Self {
            token_driver,
            path: PathBuf::from(LOCAL_CONFIG_FILE),
            reload_time: Duration::from_secs(10),
            possible_vendors: BTreeSet::from(["0A89".to_string()]),
        }
    }

    /// Apply a pushed update, returning the merged and validated result.
    /// `self` is left untouched.
    pub fn merged(&self, patch: ConfigPatch) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(token_driver) = patch.token_driver {
            next.token_driver = token_driver;
        }
        if let Some(path) = patch.path {
            next.path = path;
        }
        if let Some(reload_time) = patch.reload_time {
            next.reload_time = parse_duration(&reload_time)?;
        }
        if let Some(vendors) = patch.possible_vendors {
            next.possible_vendors = vendors.into_iter().collect();
        }
        next.normalized()
    }

    /// Write configuration to its path via a temporary file and rename
    pub fn save(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::NoLocation);
        }
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Check the allow-list against a device vendor code
    pub fn allows_vendor(&self, vendor: &str) -> bool {
        normalize_vendor(vendor)
            .map(|vendor| self.possible_vendors.contains(&vendor))
            .unwrap_or(false)
    }

    fn normalized(self) -> Result<Self, ConfigError> {
        if self.reload_time < POLL_INTERVAL_MIN || self.reload_time > POLL_INTERVAL_MAX {
            return Err(ConfigError::InvalidInterval(self.reload_time));
        }
        let possible_vendors = self
            .possible_vendors
            .iter()
            .map(|vendor| normalize_vendor(vendor))
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self {
            token_driver: self.token_driver.normalized()?,
            possible_vendors,
            ..self
        })
    }
}

/// Resolve where the configuration lives: an explicit path, then
/// `config.json` in the working directory, then the platform config dir
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Ok(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("tokenwatch").join(LOCAL_CONFIG_FILE))
        .ok_or(ConfigError::NoLocation)
}

/// OS key of the running host as used in the driver table
pub fn host_os_key() -> String {
    canonical_os(std::env::consts::OS)
}

fn canonical_os(os: &str) -> String {
    let os = os.trim().to_ascii_lowercase();
    if os == "macos" {
        "darwin".to_string()
    } else {
        os
    }
}

/// Normalize a vendor code to four upper-case hex digits
pub fn normalize_vendor(vendor: &str) -> Result<String, ConfigError> {
    let trimmed = vendor.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidVendor(vendor.to_string()));
    }
    u16::from_str_radix(digits, 16)
        .map(|code| format!("{:04X}", code))
        .map_err(|_| ConfigError::InvalidVendor(vendor.to_string()))
}

/// Parse a duration written as a sequence of number+unit pairs, e.g.
/// "10s", "1m30s", "1.5s", "250ms". Units: ms, s, m, h.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let segment = Duration::try_from_secs_f64(value * seconds_per_unit).map_err(|_| invalid())?;
        total = total.checked_add(segment).ok_or_else(invalid)?;
    }
    Ok(total)
}

/// Format a duration in the form accepted by `parse_duration`
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }

    let mut seconds = duration.as_secs();
    if seconds == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, size) in [("h", 3600), ("m", 60), ("s", 1)] {
        if seconds >= size {
            out.push_str(&format!("{}{}", seconds / size, unit));
            seconds %= size;
        }
    }
    out
}

fn default_reload_time() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*duration))
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_duration(&text).map_err(serde::de::Error::custom)
}
