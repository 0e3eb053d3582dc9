use crate::assessment::Attribute;
use std::time::Duration;
use thiserror::Error;

/// Malformed, missing or oversized input. Surfaced to the caller before any
/// classifier call is made or any state is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("text is required and must not be empty")]
    EmptyText,
    #[error("text too long: {len} characters (maximum {max})")]
    TextTooLong { len: usize, max: usize },
    #[error("threshold for {attribute} must be within 0.0..=1.0, got {value}")]
    InvalidThreshold { attribute: Attribute, value: f64 },
    #[error("score for {attribute} must be within 0.0..=1.0, got {value}")]
    InvalidScore { attribute: Attribute, value: f64 },
    #[error("batch must contain at least one text")]
    EmptyBatch,
    #[error("batch of {len} texts exceeds the maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },
}

/// Failure of the remote toxicity classifier. Always recovered by the
/// orchestrator into a fail-open decision.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifierError {
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),
    #[error("classifier unreachable: {0}")]
    Network(String),
    #[error("classifier returned a bad response (status {status:?}): {message}")]
    BadResponse {
        status: Option<u16>,
        message: String,
    },
}

impl From<reqwest::Error> for ClassifierError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not report the configured duration
            ClassifierError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            ClassifierError::BadResponse {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        } else {
            ClassifierError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("warning state I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("warning state (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("warning state write failed: {0}")]
    WriteFailed(String),
    #[error("warning state writer stopped")]
    WriterStopped,
}

/// A single batch entry that could not be evaluated. Sibling entries are
/// unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("batch item {index} failed: {source}")]
pub struct BatchItemError {
    pub index: usize,
    #[source]
    pub source: ValidationError,
}

/// Failure of an orchestrator operation. Evaluation only ever fails with
/// `Validation`; `Persistence` comes from administrative writes that must be
/// durable.
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Failure of a single platform side effect (delete, timeout, notify, log).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlatformError {
    #[error("target not found")]
    NotFound,
    #[error("missing permission: {0}")]
    PermissionDenied(String),
    #[error("platform request failed: {0}")]
    Failed(String),
}
