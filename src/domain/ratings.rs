//! Rating domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProfileSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: Uuid,
    pub task_id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub stars: i16,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Request DTO for rating the other party of a finished task
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRatingRequest {
    pub stars: i16,
    #[serde(default)]
    pub comment: String,
}

/// Rating with the rater's public profile
#[derive(Debug, Clone, Serialize)]
pub struct RatingWithRater {
    #[serde(flatten)]
    pub rating: Rating,
    pub rater: Option<ProfileSummary>,
}
