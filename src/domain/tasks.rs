//! Task domain types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProfileSummary;
use crate::store::Collection;
use crate::sync::LiveEntity;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    InProgress,
    Delivered,
    Done,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Delivered => "DELIVERED",
            Self::Done => "DONE",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Public
    }
}

/// Task entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub subject: String,
    pub budget: Decimal,
    pub deadline: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default)]
    pub visibility: Visibility,
    pub owner_id: Uuid,
    pub accepted_user_id: Option<Uuid>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_owner(&self, profile_id: Uuid) -> bool {
        self.owner_id == profile_id
    }

    pub fn is_worker(&self, profile_id: Uuid) -> bool {
        self.accepted_user_id == Some(profile_id)
    }
}

impl LiveEntity for Task {
    const COLLECTION: Collection = Collection::Tasks;

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

/// Attachment uploaded against a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttachment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub file_url: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
}

/// Request DTO for creating a task
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub subject: String,
    pub budget: Decimal,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

/// Request DTO for advancing a task
#[derive(Debug, Clone, Deserialize)]
pub struct AdvanceStatusRequest {
    pub status: TaskStatus,
}

/// Task with its joined profiles and attachments
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub owner: Option<ProfileSummary>,
    pub worker: Option<ProfileSummary>,
    pub attachments: Vec<TaskAttachment>,
}

/// Feed entry: a task with its owner
#[derive(Debug, Clone, Serialize)]
pub struct TaskWithOwner {
    #[serde(flatten)]
    pub task: Task,
    pub owner: Option<ProfileSummary>,
}
