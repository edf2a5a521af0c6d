use std::{collections::VecDeque, sync::Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use serde_json::json;
use shared::domain::{ConversationId, UserId};
use shared::protocol::Credential;

use super::*;
use crate::{backend::AuthBackend, error::CoreError, transport::Deadlines};

fn topic() -> Topic {
    Topic::Conversation(ConversationId(1))
}

fn record(id: i64, body: serde_json::Value) -> EntityRecord {
    EntityRecord {
        id: RecordId::Server(id),
        entity: EntityKind::Message,
        author_id: UserId(2),
        body,
        created_at: Utc::now(),
    }
}

fn insert(rec: EntityRecord) -> Result<ChangeEvent, CoreError> {
    Ok(ChangeEvent::Insert {
        entity: rec.entity,
        record: rec,
    })
}

struct StaticAuth;

#[async_trait]
impl AuthBackend for StaticAuth {
    async fn get_session(&self) -> Result<Option<Credential>, CoreError> {
        Ok(None)
    }

    async fn refresh_session(&self, _refresh_token: &str) -> Result<Credential, CoreError> {
        Err(CoreError::SessionExpired)
    }
}

/// One entry per expected `open_channel` call: the frames to deliver, and
/// whether the channel stays open afterwards or drops.
type Script = (Vec<Result<ChangeEvent, CoreError>>, bool);

struct ScriptedRealtime {
    scripts: StdMutex<VecDeque<Script>>,
    snapshot_records: StdMutex<Vec<EntityRecord>>,
    hang_snapshots: bool,
    opens: StdMutex<u32>,
    snapshots: StdMutex<u32>,
}

impl ScriptedRealtime {
    fn new(scripts: Vec<Script>, snapshot_records: Vec<EntityRecord>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into_iter().collect()),
            snapshot_records: StdMutex::new(snapshot_records),
            hang_snapshots: false,
            opens: StdMutex::new(0),
            snapshots: StdMutex::new(0),
        })
    }

    fn with_hanging_snapshots(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into_iter().collect()),
            snapshot_records: StdMutex::new(Vec::new()),
            hang_snapshots: true,
            opens: StdMutex::new(0),
            snapshots: StdMutex::new(0),
        })
    }

    fn opens(&self) -> u32 {
        *self.opens.lock().unwrap()
    }

    fn snapshots(&self) -> u32 {
        *self.snapshots.lock().unwrap()
    }
}

#[async_trait]
impl crate::backend::RealtimeBackend for ScriptedRealtime {
    async fn open_channel(
        &self,
        _credential: &Credential,
        _topic: Topic,
    ) -> Result<crate::backend::EventStream, CoreError> {
        *self.opens.lock().unwrap() += 1;
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some((frames, true)) => Ok(stream::iter(frames)
                .chain(stream::pending::<Result<ChangeEvent, CoreError>>())
                .boxed()),
            Some((frames, false)) => Ok(stream::iter(frames).boxed()),
            // An exhausted script holds the channel open quietly.
            None => Ok(stream::pending::<Result<ChangeEvent, CoreError>>().boxed()),
        }
    }

    async fn snapshot(
        &self,
        _credential: &Credential,
        _topic: Topic,
    ) -> Result<Vec<EntityRecord>, CoreError> {
        *self.snapshots.lock().unwrap() += 1;
        if self.hang_snapshots {
            std::future::pending::<()>().await;
        }
        Ok(self.snapshot_records.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct RecordingHandlers {
    inserts: StdMutex<Vec<EntityRecord>>,
    updates: StdMutex<Vec<EntityRecord>>,
    deletes: StdMutex<Vec<RecordId>>,
}

impl ChangeHandlers for RecordingHandlers {
    fn on_insert(&self, record: EntityRecord) {
        self.inserts.lock().unwrap().push(record);
    }

    fn on_update(&self, record: EntityRecord) {
        self.updates.lock().unwrap().push(record);
    }

    fn on_delete(&self, _entity: EntityKind, id: RecordId) {
        self.deletes.lock().unwrap().push(id);
    }
}

async fn manager_with(
    realtime: Arc<ScriptedRealtime>,
) -> (
    SubscriptionManager,
    Arc<Reconciler>,
    broadcast::Receiver<ClientEvent>,
) {
    let guardian = Arc::new(SessionGuardian::new(Arc::new(StaticAuth), Deadlines::default()));
    guardian
        .set_credential(Credential {
            user_id: UserId(1),
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
        .await;

    let reconciler = Arc::new(Reconciler::new());
    let (events, receiver) = broadcast::channel(64);
    let manager = SubscriptionManager::new(
        realtime,
        Arc::clone(&reconciler),
        guardian,
        events,
        RECONNECT_DELAY,
        Deadlines::default(),
    );
    (manager, reconciler, receiver)
}

/// Lets the spawned subscription task run; under paused time each step also
/// advances the clock.
async fn drive(ms: u64) {
    for _ in 0..(ms / 10) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain(receiver: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn events_flow_through_the_reconciler_to_the_handlers() {
    let first = record(1, json!({"text": "a"}));
    let second = record(2, json!({"text": "b"}));
    let mut edited = second.clone();
    edited.body = json!({"text": "b!"});

    let realtime = ScriptedRealtime::new(
        vec![(
            vec![
                insert(first.clone()),
                insert(second.clone()),
                Ok(ChangeEvent::Update {
                    entity: edited.entity,
                    record: edited.clone(),
                }),
                Ok(ChangeEvent::Delete {
                    entity: first.entity,
                    id: first.id,
                }),
            ],
            true,
        )],
        vec![],
    );
    let (manager, reconciler, _events) = manager_with(Arc::clone(&realtime)).await;

    let handlers = Arc::new(RecordingHandlers::default());
    let handle = manager
        .subscribe(topic(), handlers.clone() as Arc<dyn ChangeHandlers>)
        .await;
    drive(100).await;

    assert_eq!(handle.status(), ChannelStatus::Open);
    assert_eq!(handlers.inserts.lock().unwrap().len(), 2);
    assert_eq!(handlers.updates.lock().unwrap().len(), 1);
    assert_eq!(*handlers.deletes.lock().unwrap(), vec![first.id]);

    let entries = reconciler.entries(topic()).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record, edited);

    manager.shutdown_all().await;
}

#[tokio::test(start_paused = true)]
async fn insert_confirming_a_pending_entry_surfaces_as_an_update() {
    let mut confirmed = record(10, json!({"text": "hi"}));
    // The server stamps the record after the optimistic apply below.
    confirmed.created_at = Utc::now() + chrono::Duration::seconds(5);
    let realtime = ScriptedRealtime::new(vec![(vec![insert(confirmed.clone())], true)], vec![]);
    let (manager, reconciler, _events) = manager_with(Arc::clone(&realtime)).await;

    reconciler
        .apply(topic(), EntityKind::Message, UserId(2), json!({"text": "hi"}))
        .await;

    let handlers = Arc::new(RecordingHandlers::default());
    let _handle = manager
        .subscribe(topic(), handlers.clone() as Arc<dyn ChangeHandlers>)
        .await;
    drive(100).await;

    assert!(handlers.inserts.lock().unwrap().is_empty());
    assert_eq!(handlers.updates.lock().unwrap().len(), 1);
    assert_eq!(reconciler.entries(topic()).await.len(), 1);

    manager.shutdown_all().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_channel_resyncs_and_reopens_after_the_fixed_delay() {
    let live = record(1, json!({"text": "live"}));
    let missed = record(2, json!({"text": "missed"}));

    let realtime = ScriptedRealtime::new(
        vec![
            // Delivers one event, then the peer drops the connection.
            (vec![insert(live.clone())], false),
            (vec![], true),
        ],
        vec![live.clone(), missed.clone()],
    );
    let (manager, reconciler, mut events) = manager_with(Arc::clone(&realtime)).await;

    let handlers = Arc::new(RecordingHandlers::default());
    let handle = manager
        .subscribe(topic(), handlers.clone() as Arc<dyn ChangeHandlers>)
        .await;
    drive(2000).await;

    assert_eq!(realtime.opens(), 2);
    assert_eq!(realtime.snapshots(), 1);
    assert_eq!(handle.status(), ChannelStatus::Open);

    // The snapshot fills the gap without duplicating what was already seen.
    let entries = reconciler.entries(topic()).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(handlers.inserts.lock().unwrap().len(), 2);

    let seen = drain(&mut events);
    assert!(seen.contains(&ClientEvent::ChannelDegraded { topic: topic() }));
    assert!(seen.contains(&ClientEvent::ChannelRestored { topic: topic() }));

    manager.shutdown_all().await;
}

#[tokio::test(start_paused = true)]
async fn stream_error_is_treated_as_a_drop() {
    let realtime = ScriptedRealtime::new(
        vec![
            (vec![Err(CoreError::Channel("reset".into()))], true),
            (vec![], true),
        ],
        vec![],
    );
    let (manager, _reconciler, _events) = manager_with(Arc::clone(&realtime)).await;

    let _handle = manager
        .subscribe(topic(), Arc::new(RecordingHandlers::default()))
        .await;
    drive(2000).await;

    assert_eq!(realtime.opens(), 2);
    assert_eq!(realtime.snapshots(), 1);

    manager.shutdown_all().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_all_forces_a_resync_cycle() {
    let rec = record(1, json!({"text": "snapshot"}));
    let realtime = ScriptedRealtime::new(
        vec![(vec![], true), (vec![], true)],
        vec![rec.clone()],
    );
    let (manager, reconciler, _events) = manager_with(Arc::clone(&realtime)).await;

    let _handle = manager
        .subscribe(topic(), Arc::new(RecordingHandlers::default()))
        .await;
    drive(100).await;
    assert_eq!(realtime.opens(), 1);

    manager.reconnect_all().await;
    drive(2000).await;

    assert_eq!(realtime.opens(), 2);
    assert_eq!(realtime.snapshots(), 1);
    assert_eq!(reconciler.entries(topic()).await, vec![
        crate::optimistic::ListEntry {
            record: rec,
            status: crate::optimistic::OperationStatus::Confirmed,
        }
    ]);

    manager.shutdown_all().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_stops_the_task_and_releases_the_channel() {
    let realtime = ScriptedRealtime::new(vec![(vec![], true)], vec![]);
    let (manager, _reconciler, _events) = manager_with(Arc::clone(&realtime)).await;

    let handle = manager
        .subscribe(topic(), Arc::new(RecordingHandlers::default()))
        .await;
    drive(100).await;
    assert!(manager.active_topics().await.contains(&topic()));

    manager.unsubscribe(handle).await;
    assert!(manager.active_topics().await.is_empty());

    // No reconnect attempts after an explicit close.
    drive(5000).await;
    assert_eq!(realtime.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_completes_while_a_snapshot_hangs() {
    // The first channel drops immediately, sending the task into a resync
    // whose snapshot never answers.
    let realtime = ScriptedRealtime::with_hanging_snapshots(vec![(vec![], false)]);
    let (manager, _reconciler, _events) = manager_with(Arc::clone(&realtime)).await;

    let handle = manager
        .subscribe(topic(), Arc::new(RecordingHandlers::default()))
        .await;
    drive(2000).await;
    assert_eq!(realtime.snapshots(), 1);

    // The deadline guard bounds the hung snapshot, so the task gets back to
    // its command channel and the close completes.
    tokio::time::timeout(Duration::from_secs(120), manager.unsubscribe(handle))
        .await
        .expect("unsubscribe must not block on a hung snapshot");
    assert!(manager.active_topics().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn commanded_reconnect_skips_backoff_and_degraded_signal() {
    let rec = record(1, json!({"text": "snapshot"}));
    let realtime = ScriptedRealtime::new(
        vec![(vec![], true), (vec![], true)],
        vec![rec.clone()],
    );
    let (manager, _reconciler, mut events) = manager_with(Arc::clone(&realtime)).await;

    let handle = manager
        .subscribe(topic(), Arc::new(RecordingHandlers::default()))
        .await;
    drive(50).await;
    assert_eq!(realtime.opens(), 1);

    manager.reconnect_all().await;
    // Well under the reconnect delay: a commanded cycle must not wait it out.
    drive(200).await;

    assert_eq!(realtime.opens(), 2);
    assert_eq!(realtime.snapshots(), 1);
    assert_eq!(handle.status(), ChannelStatus::Open);

    let seen = drain(&mut events);
    assert!(!seen.contains(&ClientEvent::ChannelDegraded { topic: topic() }));

    manager.shutdown_all().await;
}
