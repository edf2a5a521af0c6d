use std::{future::Future, time::Duration};

use tracing::warn;

use crate::error::CoreError;

const INTERACTIVE_DEADLINE: Duration = Duration::from_secs(25);
const AUTH_DEADLINE: Duration = Duration::from_secs(20);
const UPLOAD_DEADLINE: Duration = Duration::from_secs(90);

/// Classifies an outbound call so the guard can pick its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallCategory {
    /// Metadata reads and interactive writes.
    Interactive,
    /// Session validation and refresh.
    Auth,
    /// Large binary transfers.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub interactive: Duration,
    pub auth: Duration,
    pub upload: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            interactive: INTERACTIVE_DEADLINE,
            auth: AUTH_DEADLINE,
            upload: UPLOAD_DEADLINE,
        }
    }
}

impl Deadlines {
    pub fn for_category(&self, category: CallCategory) -> Duration {
        match category {
            CallCategory::Interactive => self.interactive,
            CallCategory::Auth => self.auth,
            CallCategory::Upload => self.upload,
        }
    }
}

/// Runs `call` under the deadline for its category.
///
/// Resolves exactly once: with the call's own result, or with `Timeout` once
/// the deadline elapses, at which point the inner future is dropped and the
/// underlying I/O cancelled. Never retries; retry is the caller's decision.
pub async fn guarded<T, F>(
    deadlines: &Deadlines,
    category: CallCategory,
    call: F,
) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>>,
{
    let limit = deadlines.for_category(category);
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(?category, ?limit, "call hit its deadline; cancelling");
            Err(CoreError::Timeout { category, limit })
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
