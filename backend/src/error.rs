//! Typed failures surfaced by the scan engine.

use thiserror::Error;

use crate::models::{AccountId, ScanId, ScanStatus};

/// Rejections returned to a client submitting a scan. None of these create
/// a scan record or leave a quota charge behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Invalid target {url:?}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Scan quota exhausted for account {0}")]
    QuotaExhausted(AccountId),

    #[error("Unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("Scan engine is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn invalid_target(url: &str, reason: impl Into<String>) -> Self {
        SubmitError::InvalidTarget {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// Consistency failures of the scan registry. `ScanNotMutable` and
/// `InvalidTransition` indicate a caller bug, not bad user input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Scan {0} not found")]
    NotFound(ScanId),

    #[error("Scan {id} is {status} and no longer accepts findings")]
    ScanNotMutable { id: ScanId, status: ScanStatus },

    #[error("Scan {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: ScanId,
        from: ScanStatus,
        to: ScanStatus,
    },

    #[error("Scan {0} is still in progress")]
    ScanActive(ScanId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {field} - {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
