//! Fixtures shared by service tests

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::auth::Actor;
use crate::config::MarketPolicy;
use crate::domain::{CreateBidRequest, CreateTaskRequest, Profile, ProfileStatus, Task, Visibility};
use crate::store::{
    Collection, Filter, MemoryStore, Procedure, Query, Store, StoreError, StoreExt, StoreResult,
};

use super::{bidding, lifecycle};

pub fn market() -> MemoryStore {
    MemoryStore::new()
}

pub async fn actor(store: &MemoryStore, username: &str) -> Actor {
    let now = Utc::now();
    let profile = Profile {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        username: username.to_string(),
        full_name: String::new(),
        avatar_url: None,
        bio: String::new(),
        skills: Vec::new(),
        rating: 0.0,
        completed_tasks: 0,
        status: ProfileStatus::Active,
        is_verified: false,
        is_admin: false,
        created_at: now,
        updated_at: now,
    };
    let saved: Profile = store.create(Collection::Profiles, &profile).await.expect("profile");
    Actor::new(saved)
}

pub fn task_request(title: &str, budget: i64) -> CreateTaskRequest {
    CreateTaskRequest {
        title: title.to_string(),
        description: "Needs doing".to_string(),
        subject: "Math".to_string(),
        budget: Decimal::from(budget),
        deadline: Utc::now() + Duration::days(3),
        visibility: Visibility::Public,
        file_url: None,
        client_ref: None,
    }
}

pub fn bid_request(budget: i64) -> CreateBidRequest {
    CreateBidRequest {
        proposed_budget: Decimal::from(budget),
        proposed_deadline: None,
        message: "I can do it".to_string(),
        client_ref: None,
    }
}

pub async fn open_task(store: &MemoryStore, owner: &Actor) -> Task {
    lifecycle::create_task(store, &MarketPolicy::default(), owner, task_request("Algebra homework", 50))
        .await
        .expect("task")
}

/// A task whose bid from `worker` was accepted
pub async fn assigned_task(store: &MemoryStore, owner: &Actor, worker: &Actor) -> Task {
    let task = open_task(store, owner).await;
    let bid = bidding::submit_bid(store, task.id, worker, bid_request(45))
        .await
        .expect("bid");
    bidding::accept_bid(store, &MarketPolicy::default(), bid.id, owner)
        .await
        .expect("accept")
        .task
}

/// A [`MemoryStore`] whose reads start failing once a write commits after
/// [`FlakyReads::arm`].
pub struct FlakyReads {
    pub inner: MemoryStore,
    armed: AtomicBool,
    tripped: AtomicBool,
}

impl FlakyReads {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn committed<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if result.is_ok() && self.armed.load(Ordering::SeqCst) {
            self.tripped.store(true, Ordering::SeqCst);
        }
        result
    }
}

#[async_trait]
impl Store for FlakyReads {
    fn backend_tag(&self) -> &'static str {
        "flaky"
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Value>> {
        if self.tripped.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads are down".to_string()));
        }
        self.inner.query(query).await
    }

    async fn insert(&self, collection: Collection, row: Value) -> StoreResult<Value> {
        let result = self.inner.insert(collection, row).await;
        self.committed(result)
    }

    async fn update(
        &self,
        collection: Collection,
        id: Uuid,
        patch: Value,
        precondition: Option<&Filter>,
    ) -> StoreResult<Value> {
        let result = self.inner.update(collection, id, patch, precondition).await;
        self.committed(result)
    }

    async fn delete(&self, collection: Collection, id: Uuid, precondition: Option<&Filter>) -> StoreResult<()> {
        let result = self.inner.delete(collection, id, precondition).await;
        self.committed(result)
    }

    async fn transaction(&self, procedure: Procedure) -> StoreResult<Value> {
        let result = self.inner.transaction(procedure).await;
        self.committed(result)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }
}
