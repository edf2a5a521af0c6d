//! Connectivity and synchronization core for the hosted backend.
//!
//! Everything the UI needs to stay live sits behind [`SyncClient`]: guarded
//! outbound calls, a self-healing session credential, idle detection with
//! one-shot recovery, per-topic realtime subscriptions, and optimistic
//! writes reconciled against the authoritative stream.

pub mod activity;
pub mod backend;
pub mod error;
pub mod http;
pub mod optimistic;
pub mod realtime;
pub mod session;
pub mod transport;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::{EntityKind, RecordId, Topic},
    protocol::{Credential, EntityRecord},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;
use url::Url;

use crate::{
    activity::{ActivityKind, IdleMonitor, IDLE_THRESHOLD},
    backend::{AuthBackend, DataBackend, ReadFilter, RealtimeBackend},
    error::CoreError,
    http::{HostedBackend, WsRealtime},
    optimistic::{ListEntry, Reconciler},
    realtime::{ChangeHandlers, SubscriptionHandle, SubscriptionManager, RECONNECT_DELAY},
    session::SessionGuardian,
    transport::{CallCategory, Deadlines},
};

/// Out-of-band notifications for the UI shell.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// An idle-to-active recovery cycle completed.
    IdleRecovered,
    /// The session is unrecoverable; route the user to login.
    ForceLogout,
    /// A realtime channel dropped and is reconnecting.
    ChannelDegraded { topic: Topic },
    /// A previously degraded channel is live again.
    ChannelRestored { topic: Topic },
    /// A user-initiated write failed and was rolled back.
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub deadlines: Deadlines,
    pub idle_threshold: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            deadlines: Deadlines::default(),
            idle_threshold: IDLE_THRESHOLD,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// A write that failed after its optimistic application. The speculative
/// entry has already been rolled back; `restored_payload` carries the user's
/// input so the shell can put it back in the composer.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct WriteFailure {
    pub error: CoreError,
    pub restored_payload: Value,
}

/// The single entry point the UI talks to.
pub struct SyncClient {
    guardian: Arc<SessionGuardian>,
    monitor: IdleMonitor,
    reconciler: Arc<Reconciler>,
    subscriptions: SubscriptionManager,
    data: Arc<dyn DataBackend>,
    deadlines: Deadlines,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        data: Arc<dyn DataBackend>,
        realtime: Arc<dyn RealtimeBackend>,
    ) -> Arc<Self> {
        Self::with_config(auth, data, realtime, ClientConfig::default())
    }

    pub fn with_config(
        auth: Arc<dyn AuthBackend>,
        data: Arc<dyn DataBackend>,
        realtime: Arc<dyn RealtimeBackend>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let guardian = Arc::new(SessionGuardian::new(auth, config.deadlines));
        let reconciler = Arc::new(Reconciler::new());
        let subscriptions = SubscriptionManager::new(
            realtime,
            Arc::clone(&reconciler),
            Arc::clone(&guardian),
            events.clone(),
            config.reconnect_delay,
            config.deadlines,
        );
        Arc::new(Self {
            guardian,
            monitor: IdleMonitor::new(config.idle_threshold),
            reconciler,
            subscriptions,
            data,
            deadlines: config.deadlines,
            events,
        })
    }

    /// Builds a client wired to the hosted backend at `base_url`.
    pub fn hosted(base_url: Url) -> Result<Arc<Self>, CoreError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        let rest = Arc::new(HostedBackend::new(http.clone(), base_url.clone()));
        let realtime = Arc::new(WsRealtime::new(http, base_url));
        Ok(Self::new(rest.clone(), rest, realtime))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Adopts a credential produced by the login flow.
    pub async fn adopt_session(&self, credential: Credential) {
        self.guardian.set_credential(credential).await;
    }

    pub async fn ensure_session_valid(&self) -> Result<Credential, CoreError> {
        self.guardian.ensure_valid().await
    }

    pub async fn subscribe(
        &self,
        topic: Topic,
        handlers: Arc<dyn ChangeHandlers>,
    ) -> SubscriptionHandle {
        self.subscriptions.subscribe(topic, handlers).await
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscriptions.unsubscribe(handle).await;
    }

    /// The reconciled local list for a topic, speculative entries included.
    pub async fn entries(&self, topic: Topic) -> Vec<ListEntry> {
        self.reconciler.entries(topic).await
    }

    /// Optimistic create: the entry appears in `entries` before the write is
    /// issued; on failure it is rolled back and the payload handed back.
    pub async fn apply_optimistic(
        &self,
        topic: Topic,
        entity: EntityKind,
        payload: Value,
    ) -> Result<EntityRecord, WriteFailure> {
        // A write attempted with no credential at all never gets an
        // optimistic entry; it fails before anything is applied.
        let author = match self.guardian.current().await {
            Some(credential) => credential.user_id,
            None => match self.guardian.ensure_valid().await {
                Ok(credential) => credential.user_id,
                Err(error) => return Err(self.write_failure(error, payload)),
            },
        };

        let operation = self
            .reconciler
            .apply(topic, entity, author, payload.clone())
            .await;

        let credential = match self.guardian.ensure_valid().await {
            Ok(credential) => credential,
            Err(error) => {
                let restored = self
                    .reconciler
                    .roll_back(topic, operation.temp_id)
                    .await
                    .unwrap_or(payload);
                return Err(self.write_failure(error, restored));
            }
        };

        let result = transport::guarded(
            &self.deadlines,
            CallCategory::Interactive,
            self.data.create(&credential, entity, &operation.payload),
        )
        .await;

        match result {
            Ok(record) => {
                self.reconciler
                    .confirm_response(topic, operation.temp_id, record.clone())
                    .await;
                Ok(record)
            }
            Err(error) => {
                let restored = self
                    .reconciler
                    .roll_back(topic, operation.temp_id)
                    .await
                    .unwrap_or(payload);
                Err(self.write_failure(error, restored))
            }
        }
    }

    /// Optimistic in-place edit of an already-confirmed entity.
    pub async fn apply_edit(
        &self,
        topic: Topic,
        id: RecordId,
        new_body: Value,
    ) -> Result<EntityRecord, WriteFailure> {
        let prior = match self
            .reconciler
            .begin_edit(topic, id, new_body.clone(), Utc::now())
            .await
        {
            Ok(prior) => prior,
            Err(error) => return Err(self.write_failure(error, new_body)),
        };

        let credential = match self.guardian.ensure_valid().await {
            Ok(credential) => credential,
            Err(error) => {
                self.reconciler.abort_edit(topic, id).await;
                return Err(self.write_failure(error, new_body));
            }
        };

        let result = transport::guarded(
            &self.deadlines,
            CallCategory::Interactive,
            self.data.update(&credential, prior.entity, id, &new_body),
        )
        .await;

        match result {
            Ok(record) => {
                self.reconciler
                    .commit_edit(topic, id, Some(record.clone()))
                    .await;
                Ok(record)
            }
            Err(error) => {
                self.reconciler.abort_edit(topic, id).await;
                Err(self.write_failure(error, new_body))
            }
        }
    }

    /// Optimistic delete: the entry disappears immediately and is restored at
    /// its original position when the call fails.
    pub async fn apply_delete(&self, topic: Topic, id: RecordId) -> Result<(), WriteFailure> {
        let Some(entry) = self.reconciler.begin_remove(topic, id).await else {
            return Ok(());
        };

        let credential = match self.guardian.ensure_valid().await {
            Ok(credential) => credential,
            Err(error) => {
                self.reconciler.undo_remove(topic, id).await;
                return Err(self.write_failure(error, entry.record.body));
            }
        };

        let result = transport::guarded(
            &self.deadlines,
            CallCategory::Interactive,
            self.data.delete(&credential, entry.record.entity, id),
        )
        .await;

        match result {
            Ok(()) => {
                self.reconciler.commit_remove(topic, id).await;
                Ok(())
            }
            Err(error) => {
                self.reconciler.undo_remove(topic, id).await;
                Err(self.write_failure(error, entry.record.body))
            }
        }
    }

    /// Feed of UI-side activity. Crossing the idle boundary triggers one
    /// recovery cycle: revalidate the session, resync every channel, and
    /// issue one lightweight read to confirm the backend answers.
    pub async fn record_activity(&self, kind: ActivityKind) {
        if !self.monitor.observe(kind).await {
            return;
        }
        let Some(_guard) = self.monitor.begin_recovery() else {
            return;
        };

        match self.recover().await {
            Ok(()) => {
                self.emit(ClientEvent::IdleRecovered);
            }
            Err(err) if err.forces_logout() => {
                self.emit(ClientEvent::ForceLogout);
            }
            Err(err) => {
                warn!(%err, "idle recovery failed; will retry on next idle transition");
                self.monitor.reset().await;
            }
        }
    }

    async fn recover(&self) -> Result<(), CoreError> {
        let credential = self.guardian.ensure_valid().await?;
        self.subscriptions.reconnect_all().await;
        transport::guarded(
            &self.deadlines,
            CallCategory::Interactive,
            self.data.read(
                &credential,
                EntityKind::Notification,
                ReadFilter::Latest { limit: 1 },
            ),
        )
        .await?;
        Ok(())
    }

    /// Logout teardown: every channel closed, credential dropped.
    pub async fn shutdown(&self) {
        self.subscriptions.shutdown_all().await;
        self.guardian.clear().await;
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.events.send(event);
    }

    fn write_failure(&self, error: CoreError, restored_payload: Value) -> WriteFailure {
        if error.forces_logout() {
            self.emit(ClientEvent::ForceLogout);
        }
        self.emit(ClientEvent::Error(error.to_string()));
        WriteFailure {
            error,
            restored_payload,
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
