use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use shared::{
    domain::{EntityKind, RecordId, Topic, UserId},
    protocol::EntityRecord,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;

/// An already-confirmed entity may be edited up to this long after creation,
/// measured at the moment the edit is attempted.
pub const EDIT_WINDOW_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Confirmed,
    Failed,
}

/// A locally-applied, not-yet-confirmed mutation.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub temp_id: Uuid,
    pub entity: EntityKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub status: OperationStatus,
}

/// One rendered entry of a topic's local list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub record: EntityRecord,
    pub status: OperationStatus,
}

/// How an incoming authoritative INSERT related to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Nothing speculative matched; the record is genuinely new.
    New,
    /// Replaced a pending optimistic entry in place.
    ConfirmedPending { temp_id: Uuid },
    /// The record id was already present; replaced by identifier.
    AlreadyKnown,
}

#[derive(Default)]
struct TopicList {
    entries: Vec<ListEntry>,
    /// Pre-edit snapshots of records with an optimistic edit in flight.
    open_edits: HashMap<RecordId, EntityRecord>,
    /// Optimistically removed entries awaiting the delete call's outcome,
    /// keyed by id, with their original list position.
    removed: HashMap<RecordId, (usize, ListEntry)>,
}

/// The one reconciler every user-initiated write goes through: apply a
/// speculative local change immediately, then reconcile it against whichever
/// authoritative signal arrives first (the write's own response or a pushed
/// realtime event). Local entity lists are mutated only here.
pub struct Reconciler {
    lists: Mutex<HashMap<Topic, TopicList>>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
        }
    }

    /// Synchronously inserts a speculative entry for a user action. The entry
    /// is observable before any write request is issued.
    pub async fn apply(
        &self,
        topic: Topic,
        entity: EntityKind,
        author: UserId,
        payload: Value,
    ) -> PendingOperation {
        let operation = PendingOperation {
            temp_id: Uuid::new_v4(),
            entity,
            payload: payload.clone(),
            created_at: Utc::now(),
            status: OperationStatus::Pending,
        };
        let record = EntityRecord {
            id: RecordId::Local(operation.temp_id),
            entity,
            author_id: author,
            body: payload,
            created_at: operation.created_at,
        };
        let mut lists = self.lists.lock().await;
        lists.entry(topic).or_default().entries.push(ListEntry {
            record,
            status: OperationStatus::Pending,
        });
        debug!(%topic, temp_id = %operation.temp_id, ?entity, "optimistic entry applied");
        operation
    }

    /// Direct-response reconciliation: replaces the pending entry with the
    /// authoritative record. A no-op when a realtime event already confirmed
    /// the entity (the race in either direction is idempotent).
    pub async fn confirm_response(&self, topic: Topic, temp_id: Uuid, record: EntityRecord) -> bool {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        match list
            .entries
            .iter_mut()
            .find(|entry| entry.record.id == RecordId::Local(temp_id))
        {
            Some(entry) => {
                entry.record = record;
                entry.status = OperationStatus::Confirmed;
                true
            }
            None => {
                debug!(%topic, %temp_id, "pending entry already reconciled by realtime event");
                false
            }
        }
    }

    /// Removes a failed speculative entry and hands back its payload so the
    /// caller can restore the user's input.
    pub async fn roll_back(&self, topic: Topic, temp_id: Uuid) -> Option<Value> {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        let position = list
            .entries
            .iter()
            .position(|entry| entry.record.id == RecordId::Local(temp_id))?;
        let entry = list.entries.remove(position);
        warn!(%topic, %temp_id, "optimistic entry rolled back");
        Some(entry.record.body)
    }

    /// Realtime INSERT path. Dedupes against pending entries before the event
    /// may be surfaced as new.
    pub async fn ingest_insert(&self, topic: Topic, record: EntityRecord) -> InsertOutcome {
        let mut lists = self.lists.lock().await;
        upsert(lists.entry(topic).or_default(), record)
    }

    /// Snapshot resync path: identical semantics to `ingest_insert` — replace
    /// by identifier, never append a duplicate.
    pub async fn resync_upsert(&self, topic: Topic, record: EntityRecord) -> InsertOutcome {
        let mut lists = self.lists.lock().await;
        upsert(lists.entry(topic).or_default(), record)
    }

    /// Realtime UPDATE path: replace the matching entity by identifier.
    pub async fn ingest_update(&self, topic: Topic, record: EntityRecord) -> bool {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        match list
            .entries
            .iter_mut()
            .find(|entry| entry.record.id == record.id)
        {
            Some(entry) => {
                entry.record = record;
                entry.status = OperationStatus::Confirmed;
                true
            }
            None => false,
        }
    }

    /// Realtime DELETE path: remove by identifier and cancel any in-progress
    /// edit of the entity.
    pub async fn ingest_delete(&self, topic: Topic, id: RecordId) -> bool {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        if list.open_edits.remove(&id).is_some() {
            debug!(%topic, ?id, "open edit cancelled by authoritative delete");
        }
        list.removed.remove(&id);
        match list.entries.iter().position(|entry| entry.record.id == id) {
            Some(position) => {
                list.entries.remove(position);
                true
            }
            None => false,
        }
    }

    /// Starts an optimistic in-place edit of an already-confirmed entity.
    /// Returns the pre-edit record (for the caller's write call); the
    /// snapshot is kept for rollback. Rejected outside the edit window.
    pub async fn begin_edit(
        &self,
        topic: Topic,
        id: RecordId,
        new_body: Value,
        now: DateTime<Utc>,
    ) -> Result<EntityRecord, CoreError> {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        let entry = list
            .entries
            .iter_mut()
            .find(|entry| entry.record.id == id && entry.status == OperationStatus::Confirmed)
            .ok_or_else(|| CoreError::Transport(format!("no confirmed record {id:?} to edit")))?;

        if !edit_allowed(entry.record.created_at, now) {
            return Err(CoreError::EditWindowExpired(id));
        }

        let prior = entry.record.clone();
        list.open_edits.entry(id).or_insert_with(|| prior.clone());
        if let Some(entry) = list.entries.iter_mut().find(|entry| entry.record.id == id) {
            entry.record.body = new_body;
        }
        Ok(prior)
    }

    /// The edit's write call succeeded; drop the rollback snapshot and adopt
    /// the authoritative record when the backend returned one.
    pub async fn commit_edit(&self, topic: Topic, id: RecordId, record: Option<EntityRecord>) {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        list.open_edits.remove(&id);
        if let Some(record) = record {
            if let Some(entry) = list.entries.iter_mut().find(|entry| entry.record.id == id) {
                entry.record = record;
            }
        }
    }

    /// The edit's write call failed; restore the pre-edit snapshot.
    pub async fn abort_edit(&self, topic: Topic, id: RecordId) {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        let Some(prior) = list.open_edits.remove(&id) else {
            return;
        };
        if let Some(entry) = list.entries.iter_mut().find(|entry| entry.record.id == id) {
            entry.record = prior;
        }
    }

    /// Optimistically removes an entity ahead of its delete call, remembering
    /// the original position for undo. Returns the removed entry.
    pub async fn begin_remove(&self, topic: Topic, id: RecordId) -> Option<ListEntry> {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        let position = list.entries.iter().position(|entry| entry.record.id == id)?;
        let entry = list.entries.remove(position);
        list.open_edits.remove(&id);
        list.removed.insert(id, (position, entry.clone()));
        Some(entry)
    }

    /// The delete call succeeded; forget the undo state.
    pub async fn commit_remove(&self, topic: Topic, id: RecordId) {
        let mut lists = self.lists.lock().await;
        lists.entry(topic).or_default().removed.remove(&id);
    }

    /// The delete call failed; restore the entry at its original position.
    pub async fn undo_remove(&self, topic: Topic, id: RecordId) {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(topic).or_default();
        let Some((position, entry)) = list.removed.remove(&id) else {
            return;
        };
        let position = position.min(list.entries.len());
        list.entries.insert(position, entry);
    }

    /// The rendered list for a topic. UI layers read this; they never mutate.
    pub async fn entries(&self, topic: Topic) -> Vec<ListEntry> {
        let lists = self.lists.lock().await;
        lists
            .get(&topic)
            .map(|list| list.entries.clone())
            .unwrap_or_default()
    }
}

/// Shared match rule for both reconciliation paths: an authoritative record
/// confirms a pending entry when they share the origin actor and logical
/// content and the authoritative creation time is at or after the pending
/// one. Two identical payloads in quick succession are ambiguous; the oldest
/// matching pending entry wins (known limitation, kept as-is).
fn matches_pending(entry: &ListEntry, record: &EntityRecord) -> bool {
    entry.status == OperationStatus::Pending
        && entry.record.author_id == record.author_id
        && entry.record.body == record.body
        && record.created_at >= entry.record.created_at
}

fn upsert(list: &mut TopicList, record: EntityRecord) -> InsertOutcome {
    if let Some(entry) = list
        .entries
        .iter_mut()
        .find(|entry| entry.record.id == record.id)
    {
        entry.record = record;
        entry.status = OperationStatus::Confirmed;
        return InsertOutcome::AlreadyKnown;
    }

    if let Some(entry) = list
        .entries
        .iter_mut()
        .find(|entry| matches_pending(entry, &record))
    {
        let temp_id = match entry.record.id {
            RecordId::Local(temp_id) => temp_id,
            // Pending entries always carry local ids.
            RecordId::Server(_) => {
                entry.record = record;
                entry.status = OperationStatus::Confirmed;
                return InsertOutcome::AlreadyKnown;
            }
        };
        entry.record = record;
        entry.status = OperationStatus::Confirmed;
        return InsertOutcome::ConfirmedPending { temp_id };
    }

    list.entries.push(ListEntry {
        record,
        status: OperationStatus::Confirmed,
    });
    InsertOutcome::New
}

fn edit_allowed(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at <= ChronoDuration::seconds(EDIT_WINDOW_SECS)
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
