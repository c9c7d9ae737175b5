//! Configuration loader with file and environment variable support

use crate::{AuditConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "audit-trail.toml",
    "config.toml",
    "./config/audit-trail.toml",
    "/etc/audit-trail/config.toml",
];

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "AUDIT_TRAIL_CONFIG";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AuditConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Load using a custom variable lookup instead of the process environment
    pub fn load_with<F>(&self, lookup: F) -> Result<AuditConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AuditConfig::default();

        if let Some(path) = self.find_config_file(&lookup)? {
            info!(?path, "Loading configuration from file");
            config = AuditConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file<F>(&self, lookup: &F) -> Result<Option<PathBuf>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // An explicitly requested file must exist
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ReadError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file {} not found", path.display()),
            )));
        }

        if let Some(path) = lookup(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::EnvError(format!(
                "{} points to missing file {}",
                CONFIG_ENV,
                path.display()
            )));
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }
}

/// Apply `AUDIT_TRAIL_*` overrides
fn apply_overrides<F>(config: &mut AuditConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Storage
    if let Some(val) = lookup("AUDIT_TRAIL_STORAGE_BACKEND") {
        config.storage.backend = val.parse()?;
    }
    if let Some(val) = lookup("AUDIT_TRAIL_STORAGE_URL") {
        config.storage.url = val;
    }
    if let Some(val) = lookup("AUDIT_TRAIL_STORAGE_DATABASE") {
        config.storage.database = val;
    }
    if let Some(val) = lookup("AUDIT_TRAIL_STORAGE_TABLE") {
        config.storage.table = val;
    }
    if let Some(val) = lookup("AUDIT_TRAIL_STORAGE_SCHEMA") {
        config.storage.schema = val;
    }
    if let Some(val) = lookup("AUDIT_TRAIL_AUTO_PROVISION") {
        config.storage.auto_provision = parse_bool("AUDIT_TRAIL_AUTO_PROVISION", &val)?;
    }

    // Document
    if let Some(val) = lookup("AUDIT_TRAIL_DOCUMENT_FORMAT") {
        config.document.format = val.parse().map_err(ConfigError::EnvError)?;
    }

    // Writer
    if let Some(val) = lookup("AUDIT_TRAIL_MAX_INSERT_RETRIES") {
        config.writer.max_insert_retries = val.parse().map_err(|_| {
            ConfigError::EnvError(format!(
                "AUDIT_TRAIL_MAX_INSERT_RETRIES must be a non-negative integer, got '{}'",
                val
            ))
        })?;
    }

    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvError(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
