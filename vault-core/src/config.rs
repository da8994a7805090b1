//! Structured configuration (§4.8 of SPEC_FULL.md). Read-only: this crate
//! never writes a config file on the user's behalf. Absence of a config
//! file is not an error — the Config health check reports `pass` in that
//! case.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub const CLIPBOARD_TIMEOUT_MIN: u64 = 5;
pub const CLIPBOARD_TIMEOUT_MAX: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub remote: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote: None,
        }
    }
}

fn default_clipboard_timeout() -> u64 {
    30
}

fn default_update_channel() -> String {
    "stable".to_string()
}

fn default_backup_retention_policy() -> String {
    "keep-all".to_string()
}

/// The set of keys this vault understands. Anything else present in the
/// TOML document is preserved in `unknown_keys` rather than rejected, so
/// the Config health check can warn about it without the load itself
/// failing.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vault_path: Option<String>,
    #[serde(default = "default_clipboard_timeout")]
    pub clipboard_timeout_secs: u64,
    #[serde(default = "default_update_channel")]
    pub update_channel: String,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Informational only — the engine never deletes a manual backup
    /// regardless of this value.
    #[serde(default = "default_backup_retention_policy")]
    pub backup_retention_policy: String,

    #[serde(skip)]
    pub unknown_keys: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_path: None,
            clipboard_timeout_secs: default_clipboard_timeout(),
            update_channel: default_update_channel(),
            sync: SyncConfig::default(),
            backup_retention_policy: default_backup_retention_policy(),
            unknown_keys: Vec::new(),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "vault_path",
    "clipboard_timeout_secs",
    "update_channel",
    "sync",
    "backup_retention_policy",
];

impl Config {
    /// Load from `path`. A missing file yields `Config::default()` — this
    /// mirrors the Config health checker's "absence is pass" rule.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        let raw: BTreeMap<String, toml::Value> = toml::from_str(text)?;
        config.unknown_keys = raw
            .keys()
            .filter(|k| !KNOWN_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        Ok(config)
    }

    /// Values outside the documented range (5-300s) for clipboard
    /// auto-clear. Clipboard itself is out of scope; only this range check
    /// (surfaced by the Config health check) is.
    pub fn clipboard_timeout_out_of_range(&self) -> bool {
        !(CLIPBOARD_TIMEOUT_MIN..=CLIPBOARD_TIMEOUT_MAX).contains(&self.clipboard_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let config = Config::load(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(config.clipboard_timeout_secs, 30);
        assert!(config.unknown_keys.is_empty());
    }

    #[test]
    fn unknown_keys_are_collected_not_rejected() {
        let config = Config::parse("vault_path = \"/tmp/v\"\nfrobnicate = true\n").unwrap();
        assert_eq!(config.unknown_keys, vec!["frobnicate".to_string()]);
    }

    #[test]
    fn out_of_range_clipboard_timeout_detected() {
        let config = Config::parse("clipboard_timeout_secs = 1000\n").unwrap();
        assert!(config.clipboard_timeout_out_of_range());
    }

    #[test]
    fn in_range_clipboard_timeout_ok() {
        let config = Config::default();
        assert!(!config.clipboard_timeout_out_of_range());
    }
}
