//! Errors - エラー型と分類
//!
//! Every error type maps onto an [`ErrorKind`] so callers can decide between
//! "retry with backoff", "record and move on" and "give up" without matching on
//! individual variants.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::ids::WorkId;
use super::state::{Bucket, WorkStatus};

/// Operational classification of an error.
///
/// - Transient: 一時的なエラー（backoff してリトライ）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: the shared store itself is unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum IdError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} {value:?} contains invalid character {character:?}")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        character: char,
    },
}

/// A lifecycle method was called on a record in the wrong status.
#[derive(Debug, Error)]
#[error("cannot {action} work order {work_id} in status {status}")]
pub struct TransitionError {
    pub work_id: WorkId,
    pub status: WorkStatus,
    pub action: &'static str,
}

/// A record's fields disagree with its status (or its bucket).
#[derive(Debug, Error)]
#[error("work order {work_id} violates invariant: {reason}")]
pub struct InvariantViolation {
    pub work_id: WorkId,
    pub reason: String,
}

/// Errors raised by the work order store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote advanced since our last sync; re-sync and redo the whole
    /// operation.
    #[error("store conflict: {detail}")]
    Conflict { detail: String },

    #[error("store operation `{operation}` timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("git {command} failed (status {status:?}): {stderr}")]
    Git {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("store unreachable: {detail}")]
    Unreachable { detail: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode {path}: {source}")]
    Codec {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("work order {work_id} not found in {bucket}")]
    NotFound { bucket: Bucket, work_id: WorkId },

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict { .. } | StoreError::Timeout { .. } | StoreError::Git { .. } => {
                ErrorKind::Transient
            }
            StoreError::Unreachable { .. } | StoreError::Io { .. } => ErrorKind::Infrastructure,
            StoreError::Codec { .. } | StoreError::NotFound { .. } | StoreError::Invariant(_) => {
                ErrorKind::Permanent
            }
        }
    }

    /// Worth another attempt after a sync and a backoff delay.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// The record itself is bad: undecodable or inconsistent with its bucket.
    /// Only that work order is affected.
    pub fn is_bad_record(&self) -> bool {
        matches!(self, StoreError::Codec { .. } | StoreError::Invariant(_))
    }
}

/// The claim protocol could not talk to the store (ClaimInfrastructureError).
///
/// Non-fatal on its own: the worker logs it and moves on to another candidate
/// or waits for the next cycle.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("claim infrastructure error on {work_id} during {step}: {source}")]
    Infrastructure {
        work_id: WorkId,
        step: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("listing available work failed: {0}")]
    Listing(#[source] StoreError),
}

impl ClaimError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Infrastructure
    }
}

/// Failure reported by the task executor; recorded on the work order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors from the replenishment source of truth.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read seed file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse seed file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("work source unavailable: {0}")]
    Unavailable(String),
}

/// Bad configuration (FatalConfigurationError); aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown environment {0:?} (expected development, testing or production)")]
    UnknownEnvironment(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that end a worker run with a non-zero exit.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store infrastructure failed {failures} cycles in a row: {last}")]
    Infrastructure { failures: u32, last: String },

    #[error("cannot write session export {path}: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn work_id() -> WorkId {
        WorkId::parse("W1").unwrap()
    }

    #[rstest]
    #[case::conflict(StoreError::Conflict { detail: "push rejected".into() }, true)]
    #[case::timeout(StoreError::Timeout { operation: "fetch".into(), after: Duration::from_secs(1) }, true)]
    #[case::unreachable(StoreError::Unreachable { detail: "dns".into() }, true)]
    #[case::not_found(StoreError::NotFound { bucket: Bucket::Active, work_id: work_id() }, false)]
    fn store_errors_classify_retryability(#[case] err: StoreError, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable);
    }

    #[rstest]
    #[case::codec(
        StoreError::Codec {
            path: "retry/W1.json".into(),
            source: serde_json::from_str::<serde_json::Value>("{ truncated").unwrap_err(),
        },
        true
    )]
    #[case::invariant(
        StoreError::Invariant(InvariantViolation { work_id: work_id(), reason: "claim missing".into() }),
        true
    )]
    #[case::not_found(StoreError::NotFound { bucket: Bucket::Retry, work_id: work_id() }, false)]
    #[case::unreachable(StoreError::Unreachable { detail: "dns".into() }, false)]
    fn only_codec_and_invariant_errors_are_bad_records(#[case] err: StoreError, #[case] bad: bool) {
        assert_eq!(err.is_bad_record(), bad);
    }

    #[test]
    fn transition_error_message_names_the_action() {
        let err = TransitionError {
            work_id: work_id(),
            status: WorkStatus::Completed,
            action: "claim",
        };
        assert_eq!(
            err.to_string(),
            "cannot claim work order W1 in status completed"
        );
    }
}
