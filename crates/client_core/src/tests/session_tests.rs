use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared::domain::UserId;

use super::*;

fn credential(token: &str, expires_in_secs: i64) -> Credential {
    Credential {
        user_id: UserId(1),
        access_token: token.to_string(),
        refresh_token: format!("{token}-refresh"),
        expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
    }
}

struct MockAuth {
    session: Option<Credential>,
    refresh_outcome: Result<Credential, CoreError>,
    refresh_delay: Duration,
    get_session_calls: Arc<Mutex<u32>>,
    refresh_calls: Arc<Mutex<u32>>,
}

impl MockAuth {
    fn new(session: Option<Credential>, refresh_outcome: Result<Credential, CoreError>) -> Self {
        Self {
            session,
            refresh_outcome,
            refresh_delay: Duration::ZERO,
            get_session_calls: Arc::new(Mutex::new(0)),
            refresh_calls: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl AuthBackend for MockAuth {
    async fn get_session(&self) -> Result<Option<Credential>, CoreError> {
        *self.get_session_calls.lock().await += 1;
        Ok(self.session.clone())
    }

    async fn refresh_session(&self, _refresh_token: &str) -> Result<Credential, CoreError> {
        *self.refresh_calls.lock().await += 1;
        tokio::time::sleep(self.refresh_delay).await;
        self.refresh_outcome.clone()
    }
}

fn guardian_with(auth: MockAuth) -> (SessionGuardian, Arc<Mutex<u32>>, Arc<Mutex<u32>>) {
    let get_session_calls = Arc::clone(&auth.get_session_calls);
    let refresh_calls = Arc::clone(&auth.refresh_calls);
    let guardian = SessionGuardian::new(Arc::new(auth), Deadlines::default());
    (guardian, get_session_calls, refresh_calls)
}

#[tokio::test]
async fn stored_credential_outside_the_margin_is_returned_as_is() {
    let (guardian, _, refresh_calls) =
        guardian_with(MockAuth::new(None, Err(CoreError::SessionExpired)));
    guardian.set_credential(credential("live", 3600)).await;

    let got = guardian.ensure_valid().await.expect("valid");
    assert_eq!(got.access_token, "live");
    assert_eq!(*refresh_calls.lock().await, 0);
}

#[tokio::test]
async fn credential_inside_the_margin_is_refreshed_and_stored() {
    let (guardian, _, refresh_calls) =
        guardian_with(MockAuth::new(None, Ok(credential("fresh", 3600))));
    guardian.set_credential(credential("stale", 30)).await;

    let got = guardian.ensure_valid().await.expect("refreshed");
    assert_eq!(got.access_token, "fresh");
    assert_eq!(*refresh_calls.lock().await, 1);
    assert_eq!(
        guardian.current().await.map(|c| c.access_token),
        Some("fresh".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_a_single_refresh_request() {
    let mut auth = MockAuth::new(None, Ok(credential("fresh", 3600)));
    auth.refresh_delay = Duration::from_millis(50);
    let (guardian, _, refresh_calls) = guardian_with(auth);
    guardian.set_credential(credential("stale", 30)).await;

    let (a, b, c) = tokio::join!(
        guardian.ensure_valid(),
        guardian.ensure_valid(),
        guardian.ensure_valid(),
    );
    assert_eq!(a.expect("a").access_token, "fresh");
    assert_eq!(b.expect("b").access_token, "fresh");
    assert_eq!(c.expect("c").access_token, "fresh");
    assert_eq!(*refresh_calls.lock().await, 1);
}

#[tokio::test]
async fn missing_credential_falls_back_to_the_backend_session() {
    let (guardian, get_session_calls, refresh_calls) = guardian_with(MockAuth::new(
        Some(credential("restored", 3600)),
        Err(CoreError::SessionExpired),
    ));

    let got = guardian.ensure_valid().await.expect("restored");
    assert_eq!(got.access_token, "restored");
    assert_eq!(*get_session_calls.lock().await, 1);
    assert_eq!(*refresh_calls.lock().await, 0);
}

#[tokio::test]
async fn near_expiry_backend_session_is_refreshed_immediately() {
    let (guardian, _, refresh_calls) = guardian_with(MockAuth::new(
        Some(credential("stale", 30)),
        Ok(credential("fresh", 3600)),
    ));

    let got = guardian.ensure_valid().await.expect("refreshed");
    assert_eq!(got.access_token, "fresh");
    assert_eq!(*refresh_calls.lock().await, 1);
}

#[tokio::test]
async fn no_session_anywhere_reports_no_session() {
    let (guardian, _, _) = guardian_with(MockAuth::new(None, Ok(credential("fresh", 3600))));
    assert_eq!(guardian.ensure_valid().await, Err(CoreError::NoSession));
}

#[tokio::test]
async fn rejected_refresh_clears_the_stored_credential() {
    let (guardian, _, _) = guardian_with(MockAuth::new(None, Err(CoreError::SessionExpired)));
    guardian.set_credential(credential("stale", 30)).await;

    assert_eq!(
        guardian.ensure_valid().await,
        Err(CoreError::SessionExpired)
    );
    assert!(guardian.current().await.is_none());
}

#[tokio::test]
async fn transient_refresh_failure_keeps_the_stored_credential() {
    let (guardian, _, _) = guardian_with(MockAuth::new(
        None,
        Err(CoreError::Transport("connection reset".into())),
    ));
    guardian.set_credential(credential("stale", 30)).await;

    assert!(guardian.ensure_valid().await.is_err());
    assert!(guardian.current().await.is_some());
}

#[tokio::test]
async fn clear_drops_the_credential() {
    let (guardian, _, _) = guardian_with(MockAuth::new(None, Ok(credential("fresh", 3600))));
    guardian.set_credential(credential("live", 3600)).await;
    guardian.clear().await;
    assert!(guardian.current().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn logout_during_an_in_flight_refresh_is_not_resurrected() {
    let mut auth = MockAuth::new(None, Ok(credential("fresh", 3600)));
    auth.refresh_delay = Duration::from_millis(50);
    let (guardian, _, _) = guardian_with(auth);
    let guardian = Arc::new(guardian);
    guardian.set_credential(credential("stale", 30)).await;

    let refreshing = tokio::spawn({
        let guardian = Arc::clone(&guardian);
        async move { guardian.ensure_valid().await }
    });
    tokio::task::yield_now().await;
    guardian.clear().await;

    assert_eq!(
        refreshing.await.expect("task"),
        Err(CoreError::NoSession)
    );
    assert!(guardian.current().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn relogin_during_an_in_flight_refresh_wins() {
    let mut auth = MockAuth::new(None, Ok(credential("old", 3600)));
    auth.refresh_delay = Duration::from_millis(50);
    let (guardian, _, _) = guardian_with(auth);
    let guardian = Arc::new(guardian);
    guardian.set_credential(credential("stale", 30)).await;

    let refreshing = tokio::spawn({
        let guardian = Arc::clone(&guardian);
        async move { guardian.ensure_valid().await }
    });
    tokio::task::yield_now().await;
    guardian.set_credential(credential("relogin", 3600)).await;

    assert!(refreshing.await.expect("task").is_err());
    assert_eq!(
        guardian.current().await.map(|c| c.access_token),
        Some("relogin".to_string())
    );
}
