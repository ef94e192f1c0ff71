//! Task chat and direct-message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProfileSummary;
use crate::store::Collection;
use crate::sync::LiveEntity;

/// Message in a task's chat between owner and worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub task_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LiveEntity for Message {
    const COLLECTION: Collection = Collection::Messages;

    fn id(&self) -> Uuid {
        self.id
    }

    fn client_ref(&self) -> Option<&str> {
        self.client_ref.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationParticipant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LiveEntity for DirectMessage {
    const COLLECTION: Collection = Collection::DirectMessages;

    fn id(&self) -> Uuid {
        self.id
    }

    fn client_ref(&self) -> Option<&str> {
        self.client_ref.as_deref()
    }
}

/// Request DTO for a task chat or direct message
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

/// Request DTO for opening a conversation with another user
#[derive(Debug, Clone, Deserialize)]
pub struct StartConversationRequest {
    /// Profile id of the other participant
    pub user_id: Uuid,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

/// Inbox entry
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub other_user: Option<ProfileSummary>,
    pub last_message: Option<DirectMessage>,
    pub unread_count: usize,
}

/// Message with the sender's public profile
#[derive(Debug, Clone, Serialize)]
pub struct MessageWithSender<M> {
    #[serde(flatten)]
    pub message: M,
    pub sender: Option<ProfileSummary>,
}
