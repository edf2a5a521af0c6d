use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{EntityKind, RecordId, Topic},
    protocol::{ChangeEvent, Credential, EntityRecord},
};

use crate::error::CoreError;

/// Row selection for generic reads.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadFilter {
    Topic(Topic),
    ById(RecordId),
    Latest { limit: u32 },
}

/// Session endpoints of the hosted backend.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Returns the session the backend still holds for this client, if any.
    async fn get_session(&self) -> Result<Option<Credential>, CoreError>;
    async fn refresh_session(&self, refresh_token: &str) -> Result<Credential, CoreError>;
}

/// Generic data-access surface of the hosted backend. Credentials are passed
/// by value per call; implementations never retain them.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn create(
        &self,
        credential: &Credential,
        entity: EntityKind,
        payload: &serde_json::Value,
    ) -> Result<EntityRecord, CoreError>;

    async fn read(
        &self,
        credential: &Credential,
        entity: EntityKind,
        filter: ReadFilter,
    ) -> Result<Vec<EntityRecord>, CoreError>;

    async fn update(
        &self,
        credential: &Credential,
        entity: EntityKind,
        id: RecordId,
        payload: &serde_json::Value,
    ) -> Result<EntityRecord, CoreError>;

    async fn delete(
        &self,
        credential: &Credential,
        entity: EntityKind,
        id: RecordId,
    ) -> Result<(), CoreError>;
}

pub type EventStream = BoxStream<'static, Result<ChangeEvent, CoreError>>;

/// Realtime fan-out surface of the hosted backend.
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Opens one logical channel; the stream ends on transport-level close.
    async fn open_channel(
        &self,
        credential: &Credential,
        topic: Topic,
    ) -> Result<EventStream, CoreError>;

    /// Full current state of a topic, used to resync after a disconnect.
    async fn snapshot(
        &self,
        credential: &Credential,
        topic: Topic,
    ) -> Result<Vec<EntityRecord>, CoreError>;
}
