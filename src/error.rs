//! Error taxonomy for the sync engine.
//!
//! Every failure the engine can observe is classified into a [`SyncError`]
//! variant. The classification decides three things:
//!
//! - whether the [`RetryPolicy`](crate::retry::RetryPolicy) tries again
//!   ([`SyncError::is_retryable`], [`SyncError::retry_after`]),
//! - whether the run must stop ([`SyncError::is_fatal`]),
//! - which per-item bucket a recovered failure is counted in
//!   ([`SyncError::failure_kind`]).
//!
//! | Class | Variant(s) | Handling |
//! |-------|-----------|----------|
//! | transient-network | `Network`, `Server` | retried, surfaced only when exhausted |
//! | rate-limited | `RateLimited` | retried with the server hint or backoff |
//! | malformed-record | `Malformed` | item skipped and counted |
//! | destination-rejected | `Rejected` | item skipped and counted |
//! | checkpoint-unwritable | `Checkpoint` | fatal |
//! | credential-missing/invalid | `Credentials`, `Unauthorized` | fatal |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::EntityType;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection reset, DNS failure, timeout, or an unreadable response body.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429. `retry_after` carries the server's hint when it sent one.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// HTTP 4xx other than 401, 403 and 429.
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// HTTP 401 or 403: the configured credential is invalid.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A record that could not be parsed or turned into a document.
    #[error("malformed {entity} record {id}: {reason}")]
    Malformed {
        entity: EntityType,
        id: String,
        reason: String,
    },

    #[error("checkpoint store unwritable: {0}")]
    Checkpoint(String),

    #[error("missing credential: {0}")]
    Credentials(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A retryable error persisted through every allowed attempt.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },

    /// Too many consecutive documents ran out of retries; the destination
    /// is treated as down rather than the documents as bad.
    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Transient classes: network, 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::RateLimited { .. } | SyncError::Server { .. }
        )
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Errors that abort the whole run (leaving the last checkpoint intact).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Checkpoint(_)
                | SyncError::Credentials(_)
                | SyncError::Unauthorized(_)
                | SyncError::Config(_)
                | SyncError::DestinationUnavailable(_)
        )
    }

    /// Per-item bucket for errors that are recovered locally.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Malformed { .. } => FailureKind::Malformed,
            SyncError::Rejected { .. } => FailureKind::Rejected,
            _ => FailureKind::Exhausted,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: String) -> Self {
        match status {
            429 => SyncError::RateLimited { retry_after },
            401 | 403 => SyncError::Unauthorized(format!("HTTP {}: {}", status, body)),
            500..=599 => SyncError::Server { status, body },
            _ => SyncError::Rejected { status, body },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

/// Per-item failure classes counted in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Record failed to parse or build.
    Malformed,
    /// Destination refused the document (non-retryable 4xx).
    Rejected,
    /// Transient errors outlasted the retry budget.
    Exhausted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Malformed => "malformed",
            FailureKind::Rejected => "rejected",
            FailureKind::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}
