//! Storage boundary
//!
//! The marketplace core talks to its backing store only through the traits in
//! this module:
//! - [`Store`]: relational rows as JSON objects, plus named transactional procedures
//! - [`ChangeStream`]: row-level change events scoped by a [`Filter`]
//! - [`ObjectStorage`]: binary uploads resolved to public URLs
//!
//! Backends: [`MemoryStore`] (tests and local runs) and [`PgStore`] (Postgres).

mod filter;
mod hub;
mod memory;
mod object;
mod postgres;
mod retry;

pub use filter::{compare_values, Direction, Filter, Query, Range, Sort};
pub use hub::{ChangeHub, Subscription, SubscriptionGuard};
pub use memory::MemoryStore;
pub use object::{MemoryObjectStorage, ObjectStorage, SupabaseStorage};
pub use postgres::{PgChangeFeed, PgStore};
pub use retry::{ReadRetry, RetryPolicy};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid row: {0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Tables known to the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Profiles,
    Tasks,
    TaskAttachments,
    Bids,
    Messages,
    Conversations,
    ConversationParticipants,
    DirectMessages,
    Comments,
    Ratings,
    Notifications,
    Likes,
    ActivityLog,
}

impl Collection {
    pub const ALL: [Collection; 13] = [
        Collection::Profiles,
        Collection::Tasks,
        Collection::TaskAttachments,
        Collection::Bids,
        Collection::Messages,
        Collection::Conversations,
        Collection::ConversationParticipants,
        Collection::DirectMessages,
        Collection::Comments,
        Collection::Ratings,
        Collection::Notifications,
        Collection::Likes,
        Collection::ActivityLog,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Tasks => "tasks",
            Self::TaskAttachments => "task_attachments",
            Self::Bids => "bids",
            Self::Messages => "messages",
            Self::Conversations => "conversations",
            Self::ConversationParticipants => "conversation_participants",
            Self::DirectMessages => "direct_messages",
            Self::Comments => "comments",
            Self::Ratings => "ratings",
            Self::Notifications => "notifications",
            Self::Likes => "likes",
            Self::ActivityLog => "activity_log",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.table() == table)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Named all-or-nothing operations executed inside the store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Procedure {
    /// Accept `bid_id` on behalf of `owner_id`: the bid becomes accepted and
    /// its task moves to IN_PROGRESS with the bidder assigned, in one unit.
    AcceptBid {
        bid_id: Uuid,
        owner_id: Uuid,
        reject_other_pending: bool,
    },
    /// Return the conversation between two users, creating it (with both
    /// participant rows) if none exists for the unordered pair.
    GetOrCreateConversation {
        user_a: Uuid,
        user_b: Uuid,
        task_id: Option<Uuid>,
    },
}

impl Procedure {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AcceptBid { .. } => "accept_bid_and_update_task",
            Self::GetOrCreateConversation { .. } => "get_or_create_conversation",
        }
    }
}

/// Result of [`Procedure::AcceptBid`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptBidOutcome {
    pub task: Value,
    pub bid: Value,
    #[serde(default)]
    pub rejected_bid_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change pushed by the store.
///
/// For deletes `row` is the removed row. For updates `old` carries the
/// previous version when the backend knows it. The Postgres feed sends
/// deleted rows and `old` with their bulky text columns left out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: Collection,
    pub row: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(collection: Collection, row: Value) -> Self {
        Self { kind: ChangeKind::Insert, collection, row, old: None }
    }

    pub fn update(collection: Collection, row: Value, old: Option<Value>) -> Self {
        Self { kind: ChangeKind::Update, collection, row, old }
    }

    pub fn delete(collection: Collection, row: Value) -> Self {
        Self { kind: ChangeKind::Delete, collection, row, old: None }
    }

    pub fn row_id(&self) -> Option<Uuid> {
        row_id(&self.row)
    }
}

pub fn row_id(row: &Value) -> Option<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[async_trait]
pub trait Store: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn query(&self, query: &Query) -> StoreResult<Vec<Value>>;

    async fn insert(&self, collection: Collection, row: Value) -> StoreResult<Value>;

    /// Merge `patch` into the row. When `precondition` is given the update
    /// only happens if the current row matches it; otherwise `Conflict`.
    async fn update(
        &self,
        collection: Collection,
        id: Uuid,
        patch: Value,
        precondition: Option<&Filter>,
    ) -> StoreResult<Value>;

    async fn delete(
        &self,
        collection: Collection,
        id: Uuid,
        precondition: Option<&Filter>,
    ) -> StoreResult<()>;

    async fn transaction(&self, procedure: Procedure) -> StoreResult<Value>;

    async fn health_check(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait ChangeStream: Send + Sync {
    async fn subscribe(&self, collection: Collection, filter: Filter) -> StoreResult<Subscription>;
}

/// Typed helpers over the JSON row interface.
#[async_trait]
pub trait StoreExt: Store {
    async fn fetch<T: DeserializeOwned + Send>(&self, query: &Query) -> StoreResult<Vec<T>> {
        self.query(query).await?.into_iter().map(decode).collect()
    }

    async fn fetch_one<T: DeserializeOwned + Send>(&self, query: &Query) -> StoreResult<Option<T>> {
        let query = query.clone().range(0, 1);
        match self.query(&query).await?.into_iter().next() {
            Some(row) => decode(row).map(Some),
            None => Ok(None),
        }
    }

    async fn get<T: DeserializeOwned + Send>(&self, collection: Collection, id: Uuid) -> StoreResult<T> {
        let query = Query::new(collection).filter(Filter::eq("id", id));
        self.fetch_one(&query)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{collection} {id}")))
    }

    async fn create<T: Serialize + DeserializeOwned + Send + Sync>(
        &self,
        collection: Collection,
        row: &T,
    ) -> StoreResult<T> {
        let row = encode(row)?;
        decode(self.insert(collection, row).await?)
    }

    async fn patch<T: DeserializeOwned + Send>(
        &self,
        collection: Collection,
        id: Uuid,
        patch: Value,
        precondition: Option<&Filter>,
    ) -> StoreResult<T> {
        decode(self.update(collection, id, patch, precondition).await?)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

pub fn decode<T: DeserializeOwned>(row: Value) -> StoreResult<T> {
    serde_json::from_value(row).map_err(|e| StoreError::Invalid(e.to_string()))
}

pub fn encode<T: Serialize>(row: &T) -> StoreResult<Value> {
    serde_json::to_value(row).map_err(|e| StoreError::Invalid(e.to_string()))
}
