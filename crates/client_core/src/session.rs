use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::protocol::Credential;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    backend::AuthBackend,
    error::CoreError,
    transport::{self, CallCategory, Deadlines},
};

/// Refresh when the stored credential is this close to its absolute expiry.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, CoreError>>>;

/// Owns the credential and presents a single "the session is usable right
/// now" guarantee to every caller.
pub struct SessionGuardian {
    auth: Arc<dyn AuthBackend>,
    deadlines: Deadlines,
    state: Arc<Mutex<GuardianState>>,
}

#[derive(Default)]
struct GuardianState {
    credential: Option<Credential>,
    refresh_in_flight: Option<RefreshFuture>,
    // Bumped by clear/set_credential so a refresh that raced either one
    // discards its outcome instead of writing back a stale session.
    epoch: u64,
}

impl SessionGuardian {
    pub fn new(auth: Arc<dyn AuthBackend>, deadlines: Deadlines) -> Self {
        Self {
            auth,
            deadlines,
            state: Arc::new(Mutex::new(GuardianState::default())),
        }
    }

    /// Adopts a credential produced by the login flow.
    pub async fn set_credential(&self, credential: Credential) {
        let mut state = self.state.lock().await;
        state.credential = Some(credential);
        state.refresh_in_flight = None;
        state.epoch += 1;
    }

    pub async fn current(&self) -> Option<Credential> {
        self.state.lock().await.credential.clone()
    }

    /// Logout teardown.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.credential = None;
        state.refresh_in_flight = None;
        state.epoch += 1;
    }

    /// Returns a credential that is valid now and not within the expiry
    /// margin, refreshing otherwise.
    ///
    /// At most one refresh is in flight at any time; callers arriving while
    /// one runs await the same shared outcome, and no second request is
    /// issued.
    pub async fn ensure_valid(&self) -> Result<Credential, CoreError> {
        let refresh = {
            let mut state = self.state.lock().await;
            if let Some(credential) = &state.credential {
                if !credential.expires_within(expiry_margin()) {
                    return Ok(credential.clone());
                }
            }
            match &state.refresh_in_flight {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = Self::run_refresh(
                        Arc::clone(&self.auth),
                        Arc::clone(&self.state),
                        self.deadlines,
                        state.epoch,
                    )
                    .boxed()
                    .shared();
                    state.refresh_in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    async fn run_refresh(
        auth: Arc<dyn AuthBackend>,
        state: Arc<Mutex<GuardianState>>,
        deadlines: Deadlines,
        epoch: u64,
    ) -> Result<Credential, CoreError> {
        let result = Self::perform_refresh(auth.as_ref(), &state, &deadlines).await;

        let mut guard = state.lock().await;
        if guard.epoch != epoch {
            // The session was cleared or replaced while this refresh ran;
            // its outcome no longer describes the current session.
            warn!("discarding refresh outcome from a superseded session");
            return Err(CoreError::NoSession);
        }
        guard.refresh_in_flight = None;
        match &result {
            Ok(credential) => {
                info!(user_id = credential.user_id.0, "session refreshed");
                guard.credential = Some(credential.clone());
            }
            Err(err) if err.forces_logout() => {
                warn!(%err, "session is unrecoverable without a fresh login");
                guard.credential = None;
            }
            // Timeouts and transport hiccups keep the stored credential; the
            // next ensure_valid call retries.
            Err(_) => {}
        }
        result
    }

    async fn perform_refresh(
        auth: &dyn AuthBackend,
        state: &Mutex<GuardianState>,
        deadlines: &Deadlines,
    ) -> Result<Credential, CoreError> {
        let stored_token = {
            let guard = state.lock().await;
            guard
                .credential
                .as_ref()
                .map(|credential| credential.refresh_token.clone())
        };

        let refresh_token = match stored_token {
            Some(token) => token,
            None => {
                let existing =
                    transport::guarded(deadlines, CallCategory::Auth, auth.get_session()).await?;
                let Some(credential) = existing else {
                    return Err(CoreError::NoSession);
                };
                if !credential.expires_within(expiry_margin()) {
                    return Ok(credential);
                }
                credential.refresh_token
            }
        };

        transport::guarded(
            deadlines,
            CallCategory::Auth,
            auth.refresh_session(&refresh_token),
        )
        .await
    }
}

fn expiry_margin() -> ChronoDuration {
    ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
