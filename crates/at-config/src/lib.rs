//! AuditTrail Configuration System
//!
//! TOML-based configuration with environment variable override support.

use at_common::DocumentFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub storage: StorageConfig,
    pub document: DocumentConfig,
    pub writer: WriterConfig,
}

/// Backing technology for the audit table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
    Postgres,
    Mongo,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Sqlite => "sqlite",
            StorageBackend::Postgres => "postgres",
            StorageBackend::Mongo => "mongo",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown storage backend '{}' (expected memory, sqlite, postgres or mongo)",
                other
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Connection URL (sqlite://, postgres://, mongodb://)
    pub url: String,
    /// MongoDB database name
    pub database: String,
    /// Table (or collection) holding audit documents
    pub table: String,
    /// Optional PostgreSQL schema qualifying the table
    pub schema: String,
    /// Create the table and indexes when missing
    pub auto_provision: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: String::new(),
            database: "audit".to_string(),
            table: "audit_logs".to_string(),
            schema: String::new(),
            auto_provision: true,
        }
    }
}

/// Document encoding configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    pub format: DocumentFormat,
}

/// Audit writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// How many times a lost insert race is retried as an update
    pub max_insert_retries: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { max_insert_retries: 3 }
    }
}

impl AuditConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AuditConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.backend != StorageBackend::Memory && self.storage.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "storage.url is required for the {} backend",
                self.storage.backend
            )));
        }
        if !is_identifier(&self.storage.table) {
            return Err(ConfigError::ValidationError(format!(
                "storage.table '{}' must contain only letters, digits and underscores",
                self.storage.table
            )));
        }
        if !self.storage.schema.is_empty() && !is_identifier(&self.storage.schema) {
            return Err(ConfigError::ValidationError(format!(
                "storage.schema '{}' must contain only letters, digits and underscores",
                self.storage.schema
            )));
        }
        if self.storage.backend == StorageBackend::Mongo && self.storage.database.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.database is required for the mongo backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# AuditTrail Configuration
# Environment variables (AUDIT_TRAIL_*) override these settings

[storage]
backend = "sqlite"  # memory, sqlite, postgres, mongo
url = "sqlite://audit.db?mode=rwc"
database = "audit"  # mongo only
table = "audit_logs"
schema = ""  # postgres only
auto_provision = true

[document]
format = "json"  # json or xml; must match what is already stored

[writer]
max_insert_retries = 3
"#
        .to_string()
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
