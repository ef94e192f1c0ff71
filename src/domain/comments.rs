//! Threaded task comments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProfileSummary;
use crate::store::Collection;
use crate::sync::LiveEntity;

/// Replies deeper than this are rendered flat by clients. Not enforced.
pub const MAX_REPLY_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Author's profile id
    pub user_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub content: String,
    #[serde(default)]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveEntity for Comment {
    const COLLECTION: Collection = Collection::Comments;

    fn id(&self) -> Uuid {
        self.id
    }

    fn client_ref(&self) -> Option<&str> {
        self.client_ref.as_deref()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCommentRequest {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCommentRequest {
    pub content: String,
}

/// One node of a comment thread
#[derive(Debug, Clone, Serialize)]
pub struct CommentNode {
    #[serde(flatten)]
    pub comment: Comment,
    pub author: Option<ProfileSummary>,
    /// 0 for top-level comments
    pub depth: usize,
    pub replies: Vec<CommentNode>,
}
