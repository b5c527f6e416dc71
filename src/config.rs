//! Configuration loading and management
//!
//! Handles parsing of `config.toml` inside the data directory. Every field has
//! a default, so a missing file or a partial file is always usable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::date::CalendarDate;
use crate::error::{Error, Result};
use crate::lock::{self, DEFAULT_LOCK_TIMEOUT_MS};
use crate::storage::CONFIG_FILE;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Occurrence generation limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Periodic refresh settings
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Local persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Occurrence generation limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// No occurrence is generated after Dec 31 of this year
    #[serde(default = "default_horizon_year")]
    pub horizon_year: i32,

    /// Window length for templates without a final date
    #[serde(default = "default_span_years")]
    pub default_span_years: u32,

    /// Hard cap on occurrences generated for one template
    #[serde(default = "default_max_occurrences")]
    pub max_occurrences: usize,
}

fn default_horizon_year() -> i32 {
    2050
}

fn default_span_years() -> u32 {
    50
}

fn default_max_occurrences() -> usize {
    1200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            horizon_year: default_horizon_year(),
            default_span_years: default_span_years(),
            max_occurrences: default_max_occurrences(),
        }
    }
}

impl EngineConfig {
    /// Last date any occurrence may fall on
    pub fn horizon(&self) -> Option<CalendarDate> {
        CalendarDate::end_of_year(self.horizon_year)
    }

    fn validate(&self) -> Result<()> {
        if !(1970..=9999).contains(&self.horizon_year) {
            return Err(Error::InvalidConfig(format!(
                "engine.horizon_year must be between 1970 and 9999, got {}",
                self.horizon_year
            )));
        }
        if self.default_span_years == 0 {
            return Err(Error::InvalidConfig(
                "engine.default_span_years must be > 0".to_string(),
            ));
        }
        if self.max_occurrences == 0 {
            return Err(Error::InvalidConfig(
                "engine.max_occurrences must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Periodic refresh settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// How often `recur watch` reconciles (e.g. "60s", "5m")
    #[serde(default = "default_refresh_interval")]
    pub interval: String,
}

fn default_refresh_interval() -> String {
    "60s".to_string()
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: default_refresh_interval(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Result<Duration> {
        parse_duration(&self.interval)
    }
}

/// Local persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// How long to wait for a data file lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Parse durations like `30s`, `5m`, `2h`
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    let invalid = || Error::InvalidConfig(format!("invalid duration '{raw}' (expected e.g. 30s, 5m, 2h)"));
    let unit_len = trimmed.chars().last().map(char::len_utf8).unwrap_or(0);
    if trimmed.len() <= unit_len {
        return Err(invalid());
    }
    let (number, unit) = trimmed.split_at(trimmed.len() - unit_len);
    let value: u64 = number.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => value,
        "m" => value.checked_mul(60).ok_or_else(invalid)?,
        "h" => value.checked_mul(3600).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    if secs == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config.toml` from a data directory.
    ///
    /// A missing file yields the defaults; an invalid one is an error.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load(&config_path).map_err(|err| match err {
            Error::TomlParse(parse) => {
                Error::InvalidConfig(format!("{}: {parse}", config_path.display()))
            }
            other => other,
        })
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        lock::write_atomic(path, content.as_bytes())
    }

    fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.refresh.interval()?;
        if self.storage.lock_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "storage.lock_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_expected() {
        let cfg = Config::default();
        assert_eq!(cfg.engine.horizon_year, 2050);
        assert_eq!(cfg.engine.default_span_years, 50);
        assert_eq!(cfg.engine.max_occurrences, 1200);
        assert_eq!(cfg.refresh.interval, "60s");
        assert_eq!(cfg.storage.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
        assert_eq!(
            cfg.engine.horizon(),
            CalendarDate::from_ymd(2050, 12, 31)
        );
    }

    #[test]
    fn load_parses_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        let content = r#"
[engine]
horizon_year = 2040
default_span_years = 10

[refresh]
interval = "5m"
"#;
        fs::write(&path, content.trim()).expect("write config");

        let cfg = Config::load(&path).expect("load config");
        assert_eq!(cfg.engine.horizon_year, 2040);
        assert_eq!(cfg.engine.default_span_years, 10);
        assert_eq!(cfg.engine.max_occurrences, 1200);
        assert_eq!(cfg.refresh.interval().expect("interval"), Duration::from_secs(300));
    }

    #[test]
    fn invalid_values_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[engine]\ndefault_span_years = 0").expect("write config");

        let err = Config::load(&path).expect_err("invalid config");
        match err {
            Error::InvalidConfig(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn load_from_dir_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_from_dir(dir.path()).expect("defaults");
        assert_eq!(cfg.engine.horizon_year, 2050);

        fs::write(dir.path().join(CONFIG_FILE), "this = [not valid").expect("write");
        let err = Config::load_from_dir(dir.path()).expect_err("broken toml");
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.toml");
        let mut cfg = Config::default();
        cfg.refresh.interval = "2h".to_string();
        cfg.save(&path).expect("save config");

        let written = fs::read_to_string(&path).expect("read config");
        assert!(written.contains("interval = \"2h\""));
        let loaded = Config::load(&path).expect("load");
        assert_eq!(loaded.refresh.interval, "2h");
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("30s").expect("s"), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").expect("h"), Duration::from_secs(7200));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m").is_err());
    }
}
