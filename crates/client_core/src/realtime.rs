use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use shared::{
    domain::{EntityKind, RecordId, Topic},
    protocol::{ChangeEvent, EntityRecord},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::RealtimeBackend,
    optimistic::{InsertOutcome, Reconciler},
    session::SessionGuardian,
    transport::{self, CallCategory, Deadlines},
    ClientEvent,
};

/// Fixed delay before a dropped channel is resynced and reopened.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Degraded,
    Closed,
}

/// Per-topic change callbacks, keyed by change kind. Invoked after the
/// reconciler has folded the event into local state.
pub trait ChangeHandlers: Send + Sync {
    fn on_insert(&self, record: EntityRecord);
    fn on_update(&self, record: EntityRecord);
    fn on_delete(&self, entity: EntityKind, id: RecordId);
}

enum SubscriptionCommand {
    Reconnect,
    Shutdown,
}

struct SubscriptionEntry {
    topic: Topic,
    commands: mpsc::Sender<SubscriptionCommand>,
    task: JoinHandle<()>,
}

/// Owns one dispatch task per live feed and keeps each channel open:
/// reconnect with fixed delay on failure, snapshot resync on reconnect,
/// deterministic release on teardown. A channel dropped by error is always
/// either reconnecting or explicitly closed, never silently abandoned.
pub struct SubscriptionManager {
    backend: Arc<dyn RealtimeBackend>,
    reconciler: Arc<Reconciler>,
    guardian: Arc<SessionGuardian>,
    events: broadcast::Sender<ClientEvent>,
    reconnect_delay: Duration,
    deadlines: Deadlines,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
    next_id: AtomicU64,
}

pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
    commands: mpsc::Sender<SubscriptionCommand>,
    status: watch::Receiver<ChannelStatus>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        // Best-effort: an explicitly unsubscribed handle already shut the
        // task down and this send lands in a closed channel.
        let _ = self.commands.try_send(SubscriptionCommand::Shutdown);
    }
}

impl SubscriptionManager {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        reconciler: Arc<Reconciler>,
        guardian: Arc<SessionGuardian>,
        events: broadcast::Sender<ClientEvent>,
        reconnect_delay: Duration,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            backend,
            reconciler,
            guardian,
            events,
            reconnect_delay,
            deadlines,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn subscribe(
        &self,
        topic: Topic,
        handlers: Arc<dyn ChangeHandlers>,
    ) -> SubscriptionHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.backend),
            Arc::clone(&self.reconciler),
            Arc::clone(&self.guardian),
            self.events.clone(),
            topic,
            handlers,
            status_tx,
            command_rx,
            self.reconnect_delay,
            self.deadlines,
        ));

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().await.insert(
            id,
            SubscriptionEntry {
                topic,
                commands: command_tx.clone(),
                task,
            },
        );
        info!(%topic, "subscription opened");
        SubscriptionHandle {
            id,
            topic,
            commands: command_tx,
            status: status_rx,
        }
    }

    /// Tears the subscription down and waits for its channel resource to be
    /// released.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let entry = self.subscriptions.lock().await.remove(&handle.id);
        let Some(entry) = entry else {
            return;
        };
        if entry
            .commands
            .send(SubscriptionCommand::Shutdown)
            .await
            .is_err()
        {
            entry.task.abort();
        }
        let _ = entry.task.await;
        info!(topic = %entry.topic, "subscription closed");
    }

    /// Forces every active subscription through a resync-and-reopen cycle.
    /// Used by idle recovery.
    pub async fn reconnect_all(&self) {
        let subscriptions = self.subscriptions.lock().await;
        for entry in subscriptions.values() {
            if entry
                .commands
                .send(SubscriptionCommand::Reconnect)
                .await
                .is_err()
            {
                warn!(topic = %entry.topic, "reconnect request to a finished subscription task");
            }
        }
    }

    pub async fn active_topics(&self) -> Vec<Topic> {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions.values().map(|entry| entry.topic).collect()
    }

    pub async fn shutdown_all(&self) {
        let entries: Vec<SubscriptionEntry> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if entry
                .commands
                .send(SubscriptionCommand::Shutdown)
                .await
                .is_err()
            {
                entry.task.abort();
            }
            let _ = entry.task.await;
        }
    }
}

/// Why the dispatch loop is (re)opening the channel. A commanded reconnect
/// resyncs a healthy channel and must not surface as degradation.
#[derive(Clone, Copy)]
enum ReopenCause {
    Initial,
    Commanded,
    Dropped,
}

#[allow(clippy::too_many_arguments)]
async fn run_subscription(
    backend: Arc<dyn RealtimeBackend>,
    reconciler: Arc<Reconciler>,
    guardian: Arc<SessionGuardian>,
    events: broadcast::Sender<ClientEvent>,
    topic: Topic,
    handlers: Arc<dyn ChangeHandlers>,
    status: watch::Sender<ChannelStatus>,
    mut commands: mpsc::Receiver<SubscriptionCommand>,
    reconnect_delay: Duration,
    deadlines: Deadlines,
) {
    let mut degraded = false;
    let mut cause = ReopenCause::Initial;
    loop {
        match cause {
            ReopenCause::Initial => {}
            // Idle recovery asked for a resync: no degraded signal, no
            // backoff, straight to the snapshot.
            ReopenCause::Commanded => {
                if !resync_topic(
                    backend.as_ref(),
                    &reconciler,
                    &guardian,
                    handlers.as_ref(),
                    topic,
                    &deadlines,
                )
                .await
                {
                    cause = ReopenCause::Dropped;
                    continue;
                }
            }
            // After an error drop: fixed delay, then a full snapshot to
            // cover events missed while disconnected, then reopen.
            ReopenCause::Dropped => {
                let _ = status.send(ChannelStatus::Degraded);
                if !degraded {
                    degraded = true;
                    let _ = events.send(ClientEvent::ChannelDegraded { topic });
                }

                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay) => {}
                    command = commands.recv() => match command {
                        Some(SubscriptionCommand::Reconnect) => {}
                        Some(SubscriptionCommand::Shutdown) | None => {
                            let _ = status.send(ChannelStatus::Closed);
                            return;
                        }
                    },
                }

                if !resync_topic(
                    backend.as_ref(),
                    &reconciler,
                    &guardian,
                    handlers.as_ref(),
                    topic,
                    &deadlines,
                )
                .await
                {
                    continue;
                }
            }
        }

        let _ = status.send(ChannelStatus::Connecting);
        let stream = match guardian.ensure_valid().await {
            Ok(credential) => {
                transport::guarded(
                    &deadlines,
                    CallCategory::Interactive,
                    backend.open_channel(&credential, topic),
                )
                .await
            }
            Err(err) => Err(err),
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%topic, %err, "failed to open realtime channel");
                cause = ReopenCause::Dropped;
                continue;
            }
        };

        let _ = status.send(ChannelStatus::Open);
        if degraded {
            degraded = false;
            let _ = events.send(ClientEvent::ChannelRestored { topic });
        }
        info!(%topic, "realtime channel open");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SubscriptionCommand::Reconnect) => {
                        info!(%topic, "reconnect requested");
                        cause = ReopenCause::Commanded;
                        break;
                    }
                    Some(SubscriptionCommand::Shutdown) | None => {
                        let _ = status.send(ChannelStatus::Closed);
                        return;
                    }
                },
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        dispatch(&reconciler, handlers.as_ref(), topic, event).await;
                    }
                    Some(Err(err)) => {
                        warn!(%topic, %err, "realtime channel error");
                        cause = ReopenCause::Dropped;
                        break;
                    }
                    None => {
                        warn!(%topic, "realtime channel closed by peer");
                        cause = ReopenCause::Dropped;
                        break;
                    }
                },
            }
        }
    }
}

/// Revalidates the session and replays a full topic snapshot, both under the
/// transport guard so a hung backend cannot wedge the dispatch task. Returns
/// false when the resync could not complete.
async fn resync_topic(
    backend: &dyn RealtimeBackend,
    reconciler: &Reconciler,
    guardian: &SessionGuardian,
    handlers: &dyn ChangeHandlers,
    topic: Topic,
    deadlines: &Deadlines,
) -> bool {
    let credential = match guardian.ensure_valid().await {
        Ok(credential) => credential,
        Err(err) => {
            warn!(%topic, %err, "session unavailable for resync; retrying");
            return false;
        }
    };
    match transport::guarded(
        deadlines,
        CallCategory::Interactive,
        backend.snapshot(&credential, topic),
    )
    .await
    {
        Ok(records) => {
            resync(reconciler, handlers, topic, records).await;
            true
        }
        Err(err) => {
            warn!(%topic, %err, "snapshot resync failed; retrying");
            false
        }
    }
}

/// Events are delivered in arrival order; the reconciler folds each one into
/// local state before the handler sees it, so INSERT dedup against pending
/// optimistic entries happens in exactly one place.
async fn dispatch(
    reconciler: &Reconciler,
    handlers: &dyn ChangeHandlers,
    topic: Topic,
    event: ChangeEvent,
) {
    match event {
        ChangeEvent::Insert { record, .. } => {
            match reconciler.ingest_insert(topic, record.clone()).await {
                InsertOutcome::New => handlers.on_insert(record),
                InsertOutcome::ConfirmedPending { temp_id } => {
                    debug!(%topic, %temp_id, "realtime insert confirmed a pending entry");
                    handlers.on_update(record);
                }
                InsertOutcome::AlreadyKnown => handlers.on_update(record),
            }
        }
        ChangeEvent::Update { record, .. } => {
            reconciler.ingest_update(topic, record.clone()).await;
            handlers.on_update(record);
        }
        ChangeEvent::Delete { entity, id } => {
            reconciler.ingest_delete(topic, id).await;
            handlers.on_delete(entity, id);
        }
    }
}

/// Snapshot records replace by identifier; a record the list already holds
/// must not be appended a second time.
async fn resync(
    reconciler: &Reconciler,
    handlers: &dyn ChangeHandlers,
    topic: Topic,
    records: Vec<EntityRecord>,
) {
    for record in records {
        match reconciler.resync_upsert(topic, record.clone()).await {
            InsertOutcome::New => handlers.on_insert(record),
            InsertOutcome::ConfirmedPending { .. } | InsertOutcome::AlreadyKnown => {
                handlers.on_update(record);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
