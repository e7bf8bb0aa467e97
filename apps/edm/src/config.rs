//! Configuration file parsing and settings resolution.
//!
//! The optional TOML file provides defaults; command-line flags override
//! it, and `EDM_LOG_FORMAT` overrides its log format.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable selecting the log format.
pub const LOG_FORMAT_ENV: &str = "EDM_LOG_FORMAT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Persistent redb database.
    #[default]
    Redb,
    /// Volatile in-memory store, discarded when the command ends.
    Memory,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Contents of `edm.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: Option<PathBuf>,

    #[serde(default)]
    pub backend: Option<BackendKind>,

    #[serde(default)]
    pub space: Option<String>,

    #[serde(default)]
    pub log_format: Option<LogFormat>,

    // Internal: path to config file (for relative path resolution)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

/// Effective settings of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database: PathBuf,
    pub backend: BackendKind,
    pub space: String,
    pub log_format: LogFormat,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub backend: Option<BackendKind>,
    pub space: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load the file if it exists, otherwise use an empty configuration.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Merge with command-line overrides and fill in defaults.
    pub fn resolve(&self, overrides: Overrides) -> Settings {
        let database = overrides
            .database
            .or_else(|| self.database.as_ref().map(|p| self.resolve_path(p)))
            .unwrap_or_else(|| PathBuf::from("edm.redb"));
        Settings {
            database,
            backend: overrides.backend.or(self.backend).unwrap_or_default(),
            space: overrides
                .space
                .or_else(|| self.space.clone())
                .unwrap_or_else(|| "default".to_string()),
            log_format: overrides.log_format.or(self.log_format).unwrap_or_default(),
        }
    }

    /// Resolve a path relative to the config file location
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.config_path.as_ref().and_then(|p| p.parent()) {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }
}

/// Log format named by `EDM_LOG_FORMAT`, if set to a known value.
pub fn log_format_from_env() -> Option<LogFormat> {
    std::env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|v| LogFormat::from_str(&v, true).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let settings = Config::default().resolve(Overrides::default());
        assert_eq!(settings.database, PathBuf::from("edm.redb"));
        assert_eq!(settings.backend, BackendKind::Redb);
        assert_eq!(settings.space, "default");
        assert_eq!(settings.log_format, LogFormat::Text);
    }

    #[test]
    fn flags_override_file() {
        let config: Config = toml::from_str(
            r#"
            database = "/data/edm.redb"
            backend = "memory"
            space = "lab"
            log_format = "json"
            "#,
        )
        .expect("parse");
        let settings = config.resolve(Overrides {
            space: Some("other".to_string()),
            ..Overrides::default()
        });
        assert_eq!(settings.database, PathBuf::from("/data/edm.redb"));
        assert_eq!(settings.backend, BackendKind::Memory);
        assert_eq!(settings.space, "other");
        assert_eq!(settings.log_format, LogFormat::Json);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("port = 1").is_err());
    }
}
