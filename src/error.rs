use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::Kind;

/// Failure reported by the external queue store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        StoreError(message.into())
    }
}

/// A directive that could not be applied to the store.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to {action} {kind} {id}: {source}")]
    Store {
        action: &'static str,
        kind: Kind,
        id: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to {action} unsupported type")]
    UnsupportedType { action: &'static str },
}

/// Why the client never reached its first synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unsupported keeper protocol version {0}")]
    UnsupportedVersion(u64),
    #[error("{count} directive(s) failed to apply before the first synchronization")]
    ApplyFailed { count: usize },
    #[error("sync worker stopped before the first synchronization")]
    WorkerStopped,
    #[error("no synchronization within {0:?}")]
    Timeout(Duration),
}

/// Outcome of the insert filter that keeps a message out of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InsertError {
    #[error("warm-up filtering left no usable local address")]
    NoViableAddress,
}

#[derive(Debug, Serialize)]
struct Rejection {
    error: &'static str,
}

impl InsertError {
    pub fn code(&self) -> &'static str {
        match self {
            InsertError::NoViableAddress => "NO_IPS",
        }
    }

    /// Structured value handed back to the host script, e.g. `{"error":"NO_IPS"}`.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(Rejection { error: self.code() })
            .unwrap_or(serde_json::Value::Null)
    }
}
