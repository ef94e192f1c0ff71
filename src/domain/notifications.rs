//! Notification domain types
//!
//! In-app alerts written as a side effect of marketplace actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification type enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    // Bid-related
    BidReceived,
    BidAccepted,
    BidRejected,
    BidWithdrawn,

    // Lifecycle
    TaskDelivered,
    TaskCompleted,

    // Conversation
    NewMessage,
    NewComment,

    RatingReceived,
    System,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

impl From<String> for NotificationType {
    fn from(s: String) -> Self {
        serde_json::from_str(&format!("\"{}\"", s)).unwrap_or(NotificationType::System)
    }
}

/// Notification entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Query params for listing notifications
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: Option<bool>,
}

/// Unread count response
#[derive(Debug, Clone, Serialize)]
pub struct UnreadCountResponse {
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_type_round_trips_through_strings() {
        assert_eq!(NotificationType::BidAccepted.to_string(), "bid_accepted");
        assert_eq!(
            NotificationType::from("task_delivered".to_string()),
            NotificationType::TaskDelivered
        );
        assert_eq!(NotificationType::from("bogus".to_string()), NotificationType::System);
    }
}
