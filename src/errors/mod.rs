use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KaminoError {
    #[error("Configuration Error: {0}")]
    Config(String),

    /// Network-level failure talking to the cluster or the shared cache.
    #[error("Transient Error: {0}")]
    Transient(String),

    #[error("Cluster returned {status} for {path}: {message}")]
    Remote {
        status: u16,
        path: String,
        message: String,
    },

    #[error("Malformed cluster response: {0}")]
    Decode(String),

    #[error("Lock {key} still held after {attempts} attempts")]
    LockContention {
        key: String,
        attempts: u32,
    },

    #[error("Pod {pod} did not provision cleanly: {}", .errors.join("; "))]
    PartialFailure {
        pod: String,
        errors: Vec<String>,
    },

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Timed out after {}s waiting for {what}{}", .elapsed.as_secs(), cleanup_suffix(.cleanup))]
    Timeout {
        what: String,
        elapsed: Duration,
        cleanup: Option<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("no pod ids available")]
    PodIdsExhausted,
}

fn cleanup_suffix(cleanup: &Option<String>) -> String {
    match cleanup {
        Some(c) => format!(" (cleanup failed: {})", c),
        None => String::new(),
    }
}

/// Coarse classification callers branch on instead of matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Transient,
    Remote,
    LockContention,
    PartialFailure,
    Authorization,
    Timeout,
    NotFound,
    Capacity,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Remote => write!(f, "remote"),
            ErrorKind::LockContention => write!(f, "lock_contention"),
            ErrorKind::PartialFailure => write!(f, "partial_failure"),
            ErrorKind::Authorization => write!(f, "authorization"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Capacity => write!(f, "capacity"),
        }
    }
}

impl KaminoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KaminoError::Config(_) => ErrorKind::Config,
            KaminoError::Transient(_) => ErrorKind::Transient,
            KaminoError::Remote { .. } | KaminoError::Decode(_) => ErrorKind::Remote,
            KaminoError::LockContention { .. } => ErrorKind::LockContention,
            KaminoError::PartialFailure { .. } => ErrorKind::PartialFailure,
            KaminoError::Authorization(_) => ErrorKind::Authorization,
            KaminoError::Timeout { .. } => ErrorKind::Timeout,
            KaminoError::NotFound(_) => ErrorKind::NotFound,
            KaminoError::PodIdsExhausted => ErrorKind::Capacity,
        }
    }

    pub fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        KaminoError::Timeout {
            what: what.into(),
            elapsed,
            cleanup: None,
        }
    }
}

impl From<config::ConfigError> for KaminoError {
    fn from(err: config::ConfigError) -> Self {
        KaminoError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for KaminoError {
    fn from(err: serde_json::Error) -> Self {
        KaminoError::Decode(err.to_string())
    }
}

pub type KaminoResult<T> = Result<T, KaminoError>;
