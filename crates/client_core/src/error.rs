use std::time::Duration;

use shared::domain::RecordId;
use thiserror::Error;

use crate::transport::CallCategory;

/// Error taxonomy of the connectivity core.
///
/// `Timeout` and `Channel` are recovered locally (retry/reconnect) wherever
/// possible; `NoSession` and `SessionExpired` propagate up to force a logout;
/// `Transport` is surfaced to the initiating UI action. Cloneable so a
/// deduplicated refresh outcome can be fanned out to every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("{category:?} call exceeded its {limit:?} deadline")]
    Timeout {
        category: CallCategory,
        limit: Duration,
    },
    #[error("no session credential is available")]
    NoSession,
    #[error("session refresh was rejected; a fresh login is required")]
    SessionExpired,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("realtime channel error: {0}")]
    Channel(String),
    #[error("edit window elapsed for record {0:?}")]
    EditWindowExpired(RecordId),
}

impl CoreError {
    /// True for failures that invalidate the session entirely.
    pub fn forces_logout(&self) -> bool {
        matches!(self, CoreError::NoSession | CoreError::SessionExpired)
    }

    /// True for failures that are always safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Timeout { .. } | CoreError::Channel(_))
    }
}
