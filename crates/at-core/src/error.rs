//! Audit Engine Error Types

use at_common::IdentityError;
use thiserror::Error;

use crate::document::DocumentError;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Entity type {type_name} is not configured for auditing")]
    UnconfiguredEntity { type_name: String },

    #[error("Related type {type_name} is not configured for auditing")]
    UnconfiguredRelated { type_name: String },

    #[error("Invalid audit configuration: {message}")]
    Configuration { message: String },

    #[error("Audit table {table} does not exist and auto-provisioning is disabled. Create it with:\n{statement}")]
    SchemaMissing { table: String, statement: String },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Invalid audit identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Invalid audit query: {message}")]
    InvalidQuery { message: String },

    #[error("{count} buffered {source_type} audit event(s) never had their source key assigned")]
    UnresolvedKey { source_type: String, count: usize },

    #[error("Gave up appending to {identity} after {attempts} lost insert race(s)")]
    InsertConflict { identity: String, attempts: u32 },

    #[error("Saving {identity} would drop or rewrite its {stored} stored audit event(s)")]
    StaleDocument { identity: String, stored: usize },

    #[error("Audit operation cancelled")]
    Cancelled,

    #[error("Audit storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AuditError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery { message: message.into() }
    }

    /// Configuration errors are fatal: retrying the operation cannot succeed
    pub fn is_configuration(&self) -> bool {
        match self {
            AuditError::UnconfiguredEntity { .. }
            | AuditError::UnconfiguredRelated { .. }
            | AuditError::Configuration { .. }
            | AuditError::SchemaMissing { .. } => true,
            AuditError::Document(e) => e.is_format_mismatch(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;
