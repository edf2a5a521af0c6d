use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(PostId);
id_newtype!(MessageId);
id_newtype!(CommentId);
id_newtype!(NotificationId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    Post,
    Comment,
    Vote,
    Notification,
}

impl EntityKind {
    /// Path segment used by the data-access REST surface.
    pub fn as_path(&self) -> &'static str {
        match self {
            EntityKind::Message => "messages",
            EntityKind::Post => "posts",
            EntityKind::Comment => "comments",
            EntityKind::Vote => "votes",
            EntityKind::Notification => "notifications",
        }
    }
}

/// One logical realtime feed. The string form doubles as the channel name on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Topic {
    Conversation(ConversationId),
    PostThread(PostId),
    Notifications(UserId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Conversation(id) => write!(f, "conversation:{}", id.0),
            Topic::PostThread(id) => write!(f, "post:{}", id.0),
            Topic::Notifications(id) => write!(f, "notifications:{}", id.0),
        }
    }
}

/// Identifier of a synchronized record. Server-issued ids and client-local
/// temporary ids live in disjoint spaces; a collision is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Server(i64),
    Local(Uuid),
}

impl RecordId {
    pub fn is_local(&self) -> bool {
        matches!(self, RecordId::Local(_))
    }
}
