use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EntityKind, RecordId, UserId};

/// The access/refresh token pair representing an authenticated session.
///
/// Owned exclusively by the session guardian; other components receive it by
/// value for a single outgoing call and never store it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True when the credential has expired or will expire within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at - Utc::now() <= margin
    }
}

/// One synchronized record as the backend stores it. `body` is the
/// entity-specific payload; the core never interprets it beyond equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: RecordId,
    pub entity: EntityKind,
    pub author_id: UserId,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A change pushed over a realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert {
        entity: EntityKind,
        record: EntityRecord,
    },
    Update {
        entity: EntityKind,
        record: EntityRecord,
    },
    Delete {
        entity: EntityKind,
        id: RecordId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}
