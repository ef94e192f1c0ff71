//! Bid domain types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProfileSummary;
use crate::store::Collection;
use crate::sync::LiveEntity;

/// Bid status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

impl Default for BidStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Bid entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub task_id: Uuid,
    pub bidder_id: Uuid,
    pub proposed_budget: Decimal,
    #[serde(default)]
    pub proposed_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    pub status: BidStatus,
    #[serde(default)]
    pub client_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveEntity for Bid {
    const COLLECTION: Collection = Collection::Bids;

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

/// Request DTO for submitting a bid
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBidRequest {
    pub proposed_budget: Decimal,
    #[serde(default)]
    pub proposed_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub client_ref: Option<String>,
}

/// Bid with the bidder's public profile
#[derive(Debug, Clone, Serialize)]
pub struct BidWithBidder {
    #[serde(flatten)]
    pub bid: Bid,
    pub bidder: Option<ProfileSummary>,
}
