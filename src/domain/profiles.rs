//! Profile domain types
//!
//! A profile is the marketplace identity behind an authenticated subject.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Active,
    Deactivated,
}

impl Default for ProfileStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// User profile entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    /// Subject of the identity token
    pub user_id: Uuid,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub completed_tasks: i32,
    #[serde(default)]
    pub status: ProfileStatus,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn is_active(&self) -> bool {
        self.status == ProfileStatus::Active
    }
}

/// Public subset joined onto tasks, bids, messages and comments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileSummary {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub rating: f64,
    pub is_verified: bool,
}

impl From<&Profile> for ProfileSummary {
    fn from(p: &Profile) -> Self {
        Self {
            id: p.id,
            username: p.username.clone(),
            full_name: p.full_name.clone(),
            avatar_url: p.avatar_url.clone(),
            rating: p.rating,
            is_verified: p.is_verified,
        }
    }
}

/// Request DTO for creating or updating the caller's profile
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertProfileRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub skills: Option<Vec<String>>,
}

/// Admin changes to a profile's trust flags
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminProfileUpdate {
    #[serde(default)]
    pub is_verified: Option<bool>,
    #[serde(default)]
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileSearch {
    /// Matches full name or username, case-insensitively
    #[serde(default)]
    pub search: Option<String>,
}

/// Aggregates shown on a profile page
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserStats {
    pub posted_count: usize,
    pub accepted_count: usize,
    pub completed_count: usize,
    /// Budget of DONE tasks where the user was the worker
    pub total_earned: Decimal,
    /// Budget of DONE tasks the user posted
    pub total_spent: Decimal,
    pub average_rating: f64,
    pub ratings_count: usize,
}
