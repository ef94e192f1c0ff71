//! Activity log domain types
//!
//! A per-profile history of marketplace actions, shown on profile pages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProfileSummary;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    TaskPosted,
    TaskAccepted,
    TaskCompleted,
    BidPlaced,
    RatingReceived,
    TaskLiked,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskPosted => "task_posted",
            Self::TaskAccepted => "task_accepted",
            Self::TaskCompleted => "task_completed",
            Self::BidPlaced => "bid_placed",
            Self::RatingReceived => "rating_received",
            Self::TaskLiked => "task_liked",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    /// Profile whose history this entry belongs to
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    /// The other party, when there is one
    #[serde(default)]
    pub related_user_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Entry joined with the task title and the other party's summary
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    #[serde(flatten)]
    pub activity: Activity,
    pub task_title: Option<String>,
    pub related_user: Option<ProfileSummary>,
}
