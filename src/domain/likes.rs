//! Task likes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Collection;
use crate::sync::LiveEntity;

/// One profile's like on one task. A pair likes at most once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Like {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl LiveEntity for Like {
    const COLLECTION: Collection = Collection::Likes;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LikeStatus {
    pub task_id: Uuid,
    pub count: usize,
    /// Whether the caller likes the task
    pub liked: bool,
}
