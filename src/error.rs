//! Error taxonomy shared by the store adapters and the lifecycle operations.

use crate::object::{ErrorCode, Kind, ObjectKey};
use thiserror::Error;

/// Errors surfaced by an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The object changed since it was read; re-fetch and retry.
    #[error("conflict on {0}: {1}")]
    Conflict(String, String),

    #[error("invalid object {0}: {1}")]
    Invalid(String, String),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(..))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// An error carrying machine readable codes reported by an agent.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ErrorWithCodes {
    pub message: String,
    pub codes: Vec<ErrorCode>,
}

impl ErrorWithCodes {
    pub fn new(message: impl Into<String>, codes: Vec<ErrorCode>) -> Self {
        Self {
            message: message.into(),
            codes,
        }
    }
}

/// Result of a failed health check.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HealthError {
    #[error("{0}")]
    Uncoded(String),

    /// Originates from an agent's `LastError`; subject to severe promotion.
    #[error("{0}")]
    Coded(ErrorWithCodes),
}

impl HealthError {
    pub fn uncoded(msg: impl Into<String>) -> Self {
        HealthError::Uncoded(msg.into())
    }

    pub fn codes(&self) -> &[ErrorCode] {
        match self {
            HealthError::Uncoded(_) => &[],
            HealthError::Coded(e) => &e.codes,
        }
    }

    pub fn is_coded(&self) -> bool {
        matches!(self, HealthError::Coded(_))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to {operation} {key}: {source}")]
    Store {
        operation: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    /// Final error of a wait, retaining the last observed domain error.
    #[error(transparent)]
    WithCodes(#[from] ErrorWithCodes),

    #[error("restore of {key} failed: {message}")]
    Restore { key: String, message: String },

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} error(s) occurred: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn store(operation: &'static str, key: &ObjectKey, source: StoreError) -> Self {
        Error::Store {
            operation,
            key: key.to_string(),
            source,
        }
    }

    pub fn list(kind: Kind, namespace: &str, source: StoreError) -> Self {
        Error::Store {
            operation: "list",
            key: format!("{kind} {namespace}"),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store { source, .. } if source.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store { source, .. } if source.is_conflict())
    }

    /// Error codes carried by this error or any aggregated error.
    pub fn codes(&self) -> Vec<ErrorCode> {
        match self {
            Error::WithCodes(e) => e.codes.clone(),
            Error::Aggregate(errors) => {
                let mut codes = Vec::new();
                for code in errors.iter().flat_map(Error::codes) {
                    if !codes.contains(&code) {
                        codes.push(code);
                    }
                }
                codes
            }
            _ => Vec::new(),
        }
    }

    /// Folds a list of errors into `Ok` when empty, the single error, or an
    /// aggregate.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

/// Tolerates a vanished object on idempotent paths.
pub fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
