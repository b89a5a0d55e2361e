//! Error types for the monplane control plane

use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("SSH authentication failed: {0}")]
    AuthFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("SSH session failed: {0}")]
    SessionFailed(String),

    #[error("config validation failed: {0}")]
    ValidationFailed(String),

    #[error("service reload failed: {0}")]
    ReloadFailed(String),

    #[error("version drift: expected {expected}, observed {observed}")]
    VersionDrift { expected: String, observed: String },

    #[error("version mismatch after upgrade: expected {expected}, observed {observed}")]
    VersionMismatch { expected: String, observed: String },

    #[error("service failed to stop: {0}")]
    ServiceStopTimeout(String),

    #[error("unresolved template placeholder: {0}")]
    TemplateUnresolved(String),

    #[error("conflicting task already running: {0}")]
    Conflict(String),

    #[error("canceled by operator")]
    Canceled,

    #[error("task orphaned by process restart")]
    Orphaned,

    #[error("upgrade exceeded {0}s timeout")]
    UpgradeTimeout(u64),

    #[error("task store error: {0}")]
    StoreError(String),

    #[error("rollback failed: {rollback}; original failure: {original}")]
    RollbackFailed { original: String, rollback: String },

    #[error("remote command failed: {0}")]
    CommandFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("shutdown error: {0}")]
    ShutdownError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Internal(err.to_string())
    }
}

impl From<russh::Error> for ControlError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::NotAuthenticated | russh::Error::NoAuthMethod => {
                ControlError::AuthFailed(err.to_string())
            }
            russh::Error::ConnectionTimeout => ControlError::Timeout(err.to_string()),
            other => ControlError::SessionFailed(other.to_string()),
        }
    }
}
