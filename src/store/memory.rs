//! In-memory store backend
//!
//! Emulates the relational guarantees the Postgres schema provides: unique
//! constraints, foreign keys with cascading deletes, the "bids only on OPEN
//! tasks" guard, and the two transactional procedures. Every write and its
//! change events happen under one write lock, so subscribers observe events
//! in commit order.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use uuid::Uuid;

use super::{
    row_id, AcceptBidOutcome, ChangeEvent, ChangeHub, ChangeStream, Collection, Filter, Procedure,
    Query, Store, StoreError, StoreResult, Subscription,
};

/// A uniqueness rule over a set of columns, optionally partial.
struct Unique {
    collection: Collection,
    columns: &'static [&'static str],
    /// Only rows with `column == value` participate.
    partial: Option<(&'static str, &'static str)>,
    message: &'static str,
}

const UNIQUE: &[Unique] = &[
    Unique {
        collection: Collection::Bids,
        columns: &["task_id", "bidder_id"],
        partial: Some(("status", "pending")),
        message: "bidder already has a pending bid on this task",
    },
    Unique {
        collection: Collection::Ratings,
        columns: &["task_id", "from_user_id", "to_user_id"],
        partial: None,
        message: "rating already submitted for this task",
    },
    Unique {
        collection: Collection::ConversationParticipants,
        columns: &["conversation_id", "user_id"],
        partial: None,
        message: "user already participates in this conversation",
    },
    Unique {
        collection: Collection::Profiles,
        columns: &["user_id"],
        partial: None,
        message: "profile already exists for this user",
    },
    Unique {
        collection: Collection::Likes,
        columns: &["task_id", "user_id"],
        partial: None,
        message: "task already liked",
    },
];

/// `child.column` references `parent.id`; deleting the parent cascades.
struct ForeignKey {
    child: Collection,
    column: &'static str,
    parent: Collection,
}

const FOREIGN_KEYS: &[ForeignKey] = &[
    ForeignKey { child: Collection::Tasks, column: "owner_id", parent: Collection::Profiles },
    ForeignKey { child: Collection::TaskAttachments, column: "task_id", parent: Collection::Tasks },
    ForeignKey { child: Collection::Bids, column: "task_id", parent: Collection::Tasks },
    ForeignKey { child: Collection::Messages, column: "task_id", parent: Collection::Tasks },
    ForeignKey { child: Collection::Comments, column: "task_id", parent: Collection::Tasks },
    ForeignKey { child: Collection::Comments, column: "parent_id", parent: Collection::Comments },
    ForeignKey { child: Collection::Ratings, column: "task_id", parent: Collection::Tasks },
    ForeignKey { child: Collection::Likes, column: "task_id", parent: Collection::Tasks },
    ForeignKey { child: Collection::ActivityLog, column: "task_id", parent: Collection::Tasks },
    ForeignKey {
        child: Collection::ConversationParticipants,
        column: "conversation_id",
        parent: Collection::Conversations,
    },
    ForeignKey {
        child: Collection::DirectMessages,
        column: "conversation_id",
        parent: Collection::Conversations,
    },
];

fn now_value() -> Value {
    json!(Utc::now())
}

#[derive(Default)]
struct Tables {
    rows: HashMap<Collection, Vec<Value>>,
}

impl Tables {
    fn table(&self, collection: Collection) -> &[Value] {
        self.rows.get(&collection).map(Vec::as_slice).unwrap_or(&[])
    }

    fn table_mut(&mut self, collection: Collection) -> &mut Vec<Value> {
        self.rows.entry(collection).or_default()
    }

    fn position(&self, collection: Collection, id: Uuid) -> Option<usize> {
        self.table(collection)
            .iter()
            .position(|row| row_id(row) == Some(id))
    }

    fn find(&self, collection: Collection, id: Uuid) -> Option<&Value> {
        self.position(collection, id).map(|i| &self.table(collection)[i])
    }

    fn check_unique(&self, collection: Collection, row: &Value) -> StoreResult<()> {
        let id = row_id(row);
        for rule in UNIQUE.iter().filter(|u| u.collection == collection) {
            let participates = |r: &Value| match rule.partial {
                Some((column, value)) => r.get(column).and_then(Value::as_str) == Some(value),
                None => true,
            };
            if !participates(row) {
                continue;
            }
            let clash = self.table(collection).iter().any(|other| {
                row_id(other) != id
                    && participates(other)
                    && rule
                        .columns
                        .iter()
                        .all(|c| row.get(*c).is_some() && row.get(*c) == other.get(*c))
            });
            if clash {
                return Err(StoreError::Conflict(rule.message.to_string()));
            }
        }
        Ok(())
    }

    fn check_references(&self, collection: Collection, row: &Value) -> StoreResult<()> {
        for fk in FOREIGN_KEYS.iter().filter(|fk| fk.child == collection) {
            let Some(parent_id) = row.get(fk.column).and_then(Value::as_str) else {
                continue;
            };
            let exists = Uuid::parse_str(parent_id)
                .ok()
                .and_then(|id| self.find(fk.parent, id))
                .is_some();
            if !exists {
                return Err(StoreError::NotFound(format!(
                    "{}.{} references missing {}",
                    collection, fk.column, fk.parent
                )));
            }
        }
        Ok(())
    }

    fn check_guards(&self, collection: Collection, row: &Value) -> StoreResult<()> {
        if collection == Collection::Bids {
            let task_open = row
                .get("task_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .and_then(|id| self.find(Collection::Tasks, id))
                .and_then(|task| task.get("status").and_then(Value::as_str))
                == Some("OPEN");
            if !task_open {
                return Err(StoreError::Conflict("task is not accepting bids".to_string()));
            }
        }
        Ok(())
    }

    /// Remove a row and everything that references it, returning the removed rows.
    fn cascade_delete(&mut self, collection: Collection, id: Uuid, out: &mut Vec<ChangeEvent>) {
        let id_str = id.to_string();
        for fk in FOREIGN_KEYS.iter().filter(|fk| fk.parent == collection) {
            let children: Vec<Uuid> = self
                .table(fk.child)
                .iter()
                .filter(|r| r.get(fk.column).and_then(Value::as_str) == Some(id_str.as_str()))
                .filter_map(row_id)
                .collect();
            for child in children {
                self.cascade_delete(fk.child, child, out);
            }
        }
        if let Some(pos) = self.position(collection, id) {
            let row = self.table_mut(collection).remove(pos);
            out.push(ChangeEvent::delete(collection, row));
        }
    }

    fn apply_patch(
        &mut self,
        collection: Collection,
        id: Uuid,
        patch: &Map<String, Value>,
    ) -> StoreResult<(Value, Value)> {
        let pos = self
            .position(collection, id)
            .ok_or_else(|| StoreError::NotFound(format!("{collection} {id}")))?;
        let old = self.table(collection)[pos].clone();
        let mut new = old.clone();
        if let Value::Object(fields) = &mut new {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        self.check_unique(collection, &new)?;
        self.check_references(collection, &new)?;
        self.table_mut(collection)[pos] = new.clone();
        Ok((old, new))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    hub: ChangeHub,
    offline: AtomicBool,
    failing_reads: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hub this store publishes its change events to.
    pub fn changes(&self) -> &ChangeHub {
        &self.hub
    }

    /// Make every operation fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` queries with `Unavailable`.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Store a row without publishing a change event or checking constraints.
    pub fn insert_unpublished(&self, collection: Collection, row: Value) {
        self.tables.write().table_mut(collection).push(row);
    }

    pub fn row_count(&self, collection: Collection) -> usize {
        self.tables.read().table(collection).len()
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn accept_bid(
        &self,
        bid_id: Uuid,
        owner_id: Uuid,
        reject_other_pending: bool,
    ) -> StoreResult<Value> {
        let mut tables = self.tables.write();

        let bid = tables
            .find(Collection::Bids, bid_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("bid {bid_id}")))?;
        let task_id = bid
            .get("task_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| StoreError::Invalid("bid without task_id".to_string()))?;
        let task = tables
            .find(Collection::Tasks, task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;

        if task.get("owner_id").and_then(Value::as_str) != Some(owner_id.to_string().as_str()) {
            return Err(StoreError::Denied("only the task owner can accept bids".to_string()));
        }
        let open = task.get("status").and_then(Value::as_str) == Some("OPEN")
            && task.get("accepted_user_id").map_or(true, Value::is_null);
        if !open {
            return Err(StoreError::Conflict("task is no longer open".to_string()));
        }
        if bid.get("status").and_then(Value::as_str) != Some("pending") {
            return Err(StoreError::Conflict("bid is not pending".to_string()));
        }

        let now = now_value();
        let bidder = bid.get("bidder_id").cloned().unwrap_or(Value::Null);
        let mut events = Vec::new();

        let task_patch = json!({ "status": "IN_PROGRESS", "accepted_user_id": bidder, "updated_at": now });
        let bid_patch = json!({ "status": "accepted", "updated_at": now });
        let (old_task, new_task) = tables.apply_patch(Collection::Tasks, task_id, as_object(&task_patch)?)?;
        let (old_bid, new_bid) = tables.apply_patch(Collection::Bids, bid_id, as_object(&bid_patch)?)?;
        events.push(ChangeEvent::update(Collection::Tasks, new_task.clone(), Some(old_task)));
        events.push(ChangeEvent::update(Collection::Bids, new_bid.clone(), Some(old_bid)));

        let mut rejected_bid_ids = Vec::new();
        if reject_other_pending {
            let task_str = task_id.to_string();
            let others: Vec<Uuid> = tables
                .table(Collection::Bids)
                .iter()
                .filter(|b| b.get("task_id").and_then(Value::as_str) == Some(task_str.as_str()))
                .filter(|b| b.get("status").and_then(Value::as_str) == Some("pending"))
                .filter_map(row_id)
                .collect();
            let reject_patch = json!({ "status": "rejected", "updated_at": now });
            for other in others {
                let (old, new) = tables.apply_patch(Collection::Bids, other, as_object(&reject_patch)?)?;
                events.push(ChangeEvent::update(Collection::Bids, new, Some(old)));
                rejected_bid_ids.push(other);
            }
        }

        for event in events {
            self.hub.publish(event);
        }

        let outcome = AcceptBidOutcome {
            task: new_task,
            bid: new_bid,
            rejected_bid_ids,
        };
        serde_json::to_value(outcome).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    fn get_or_create_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        task_id: Option<Uuid>,
    ) -> StoreResult<Value> {
        if user_a == user_b {
            return Err(StoreError::Conflict(
                "a conversation needs two distinct participants".to_string(),
            ));
        }
        let mut tables = self.tables.write();

        let (a, b) = (user_a.to_string(), user_b.to_string());
        let mut members: HashMap<String, Vec<String>> = HashMap::new();
        for p in tables.table(Collection::ConversationParticipants) {
            if let (Some(conv), Some(user)) = (
                p.get("conversation_id").and_then(Value::as_str),
                p.get("user_id").and_then(Value::as_str),
            ) {
                members.entry(conv.to_string()).or_default().push(user.to_string());
            }
        }
        let existing = members.into_iter().find(|(_, users)| {
            users.len() == 2 && users.contains(&a) && users.contains(&b)
        });
        if let Some((conv_id, _)) = existing {
            let id = Uuid::parse_str(&conv_id).map_err(|e| StoreError::Invalid(e.to_string()))?;
            return tables
                .find(Collection::Conversations, id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")));
        }

        let now = now_value();
        let conversation_id = Uuid::new_v4();
        let conversation = json!({
            "id": conversation_id,
            "task_id": task_id,
            "created_at": now,
            "updated_at": now,
        });
        tables.table_mut(Collection::Conversations).push(conversation.clone());
        self.hub.publish(ChangeEvent::insert(Collection::Conversations, conversation.clone()));

        for user in [user_a, user_b] {
            let participant = json!({
                "id": Uuid::new_v4(),
                "conversation_id": conversation_id,
                "user_id": user,
                "joined_at": now,
                "last_read_at": now,
            });
            tables
                .table_mut(Collection::ConversationParticipants)
                .push(participant.clone());
            self.hub
                .publish(ChangeEvent::insert(Collection::ConversationParticipants, participant));
        }

        Ok(conversation)
    }
}

fn as_object(value: &Value) -> StoreResult<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| StoreError::Invalid("expected a JSON object".to_string()))
}

#[async_trait]
impl Store for MemoryStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Value>> {
        self.ensure_online()?;
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }

        let tables = self.tables.read();
        let mut rows: Vec<Value> = tables
            .table(query.collection)
            .iter()
            .filter(|row| query.filter.matches(row))
            .cloned()
            .collect();
        // Stable: ties keep insertion order
        rows.sort_by(|a, b| query.compare_rows(a, b));

        if let Some(range) = query.range {
            rows = rows
                .into_iter()
                .skip(range.offset as usize)
                .take(range.limit as usize)
                .collect();
        }
        Ok(rows)
    }

    async fn insert(&self, collection: Collection, row: Value) -> StoreResult<Value> {
        self.ensure_online()?;
        let mut row = row;
        let fields = row
            .as_object_mut()
            .ok_or_else(|| StoreError::Invalid("row must be a JSON object".to_string()))?;
        if fields.get("id").map_or(true, Value::is_null) {
            fields.insert("id".to_string(), json!(Uuid::new_v4()));
        }
        if !fields.contains_key("created_at") {
            fields.insert("created_at".to_string(), now_value());
        }

        let mut tables = self.tables.write();
        let id = row_id(&row).ok_or_else(|| StoreError::Invalid("row id is not a uuid".to_string()))?;
        if tables.find(collection, id).is_some() {
            return Err(StoreError::Conflict(format!("{collection} {id} already exists")));
        }
        tables.check_unique(collection, &row)?;
        tables.check_references(collection, &row)?;
        tables.check_guards(collection, &row)?;

        tables.table_mut(collection).push(row.clone());
        self.hub.publish(ChangeEvent::insert(collection, row.clone()));
        Ok(row)
    }

    async fn update(
        &self,
        collection: Collection,
        id: Uuid,
        patch: Value,
        precondition: Option<&Filter>,
    ) -> StoreResult<Value> {
        self.ensure_online()?;
        let patch = as_object(&patch)?;
        let mut tables = self.tables.write();

        let current = tables
            .find(collection, id)
            .ok_or_else(|| StoreError::NotFound(format!("{collection} {id}")))?;
        if let Some(filter) = precondition {
            if !filter.matches(current) {
                return Err(StoreError::Conflict(format!(
                    "{collection} {id} changed concurrently"
                )));
            }
        }

        let (old, new) = tables.apply_patch(collection, id, patch)?;
        self.hub
            .publish(ChangeEvent::update(collection, new.clone(), Some(old)));
        Ok(new)
    }

    async fn delete(
        &self,
        collection: Collection,
        id: Uuid,
        precondition: Option<&Filter>,
    ) -> StoreResult<()> {
        self.ensure_online()?;
        let mut tables = self.tables.write();

        let current = tables
            .find(collection, id)
            .ok_or_else(|| StoreError::NotFound(format!("{collection} {id}")))?;
        if let Some(filter) = precondition {
            if !filter.matches(current) {
                return Err(StoreError::Conflict(format!(
                    "{collection} {id} changed concurrently"
                )));
            }
        }

        let mut events = Vec::new();
        tables.cascade_delete(collection, id, &mut events);
        for event in events {
            self.hub.publish(event);
        }
        Ok(())
    }

    async fn transaction(&self, procedure: Procedure) -> StoreResult<Value> {
        self.ensure_online()?;
        tracing::debug!(procedure = procedure.name(), "Running store procedure");
        match procedure {
            Procedure::AcceptBid {
                bid_id,
                owner_id,
                reject_other_pending,
            } => self.accept_bid(bid_id, owner_id, reject_other_pending),
            Procedure::GetOrCreateConversation {
                user_a,
                user_b,
                task_id,
            } => self.get_or_create_conversation(user_a, user_b, task_id),
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_online()
    }
}

#[async_trait]
impl ChangeStream for MemoryStore {
    async fn subscribe(&self, collection: Collection, filter: Filter) -> StoreResult<Subscription> {
        self.ensure_online()?;
        Ok(self.hub.register(collection, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Direction;

    async fn seed_task(store: &MemoryStore, status: &str) -> (Uuid, Uuid) {
        let owner = Uuid::new_v4();
        store
            .insert(Collection::Profiles, json!({ "id": owner, "user_id": Uuid::new_v4() }))
            .await
            .expect("profile");
        let task = Uuid::new_v4();
        store
            .insert(
                Collection::Tasks,
                json!({ "id": task, "owner_id": owner, "status": status, "accepted_user_id": null }),
            )
            .await
            .expect("task");
        (owner, task)
    }

    #[tokio::test]
    async fn pending_bids_are_unique_per_bidder_and_task() {
        let store = MemoryStore::new();
        let (_, task) = seed_task(&store, "OPEN").await;
        let bidder = Uuid::new_v4();

        store
            .insert(Collection::Bids, json!({ "task_id": task, "bidder_id": bidder, "status": "pending" }))
            .await
            .expect("first bid");
        let second = store
            .insert(Collection::Bids, json!({ "task_id": task, "bidder_id": bidder, "status": "pending" }))
            .await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));

        // A rejected bid does not block a new pending one
        store
            .insert(Collection::Bids, json!({ "task_id": task, "bidder_id": bidder, "status": "rejected" }))
            .await
            .expect("rejected bid");
    }

    #[tokio::test]
    async fn bids_on_closed_tasks_are_refused() {
        let store = MemoryStore::new();
        let (_, task) = seed_task(&store, "IN_PROGRESS").await;
        let result = store
            .insert(Collection::Bids, json!({ "task_id": task, "bidder_id": Uuid::new_v4(), "status": "pending" }))
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn deleting_a_task_cascades_to_its_rows() {
        let store = MemoryStore::new();
        let (_, task) = seed_task(&store, "OPEN").await;
        let parent = Uuid::new_v4();
        store
            .insert(Collection::Comments, json!({ "id": parent, "task_id": task, "parent_id": null }))
            .await
            .expect("comment");
        store
            .insert(Collection::Comments, json!({ "task_id": task, "parent_id": parent }))
            .await
            .expect("reply");

        let mut sub = store.changes().register(Collection::Comments, Filter::everything());
        store.delete(Collection::Tasks, task, None).await.expect("delete");

        assert_eq!(store.row_count(Collection::Comments), 0);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
    }

    #[tokio::test]
    async fn precondition_mismatch_is_a_conflict() {
        let store = MemoryStore::new();
        let (_, task) = seed_task(&store, "DELIVERED").await;
        let result = store
            .update(
                Collection::Tasks,
                task,
                json!({ "status": "DONE" }),
                Some(&Filter::eq("status", "IN_PROGRESS")),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn query_sorts_filters_and_pages() {
        let store = MemoryStore::new();
        let (owner, _) = seed_task(&store, "OPEN").await;
        for budget in [30, 10, 20] {
            store
                .insert(Collection::Tasks, json!({ "owner_id": owner, "status": "OPEN", "budget": budget }))
                .await
                .expect("task");
        }
        let query = Query::new(Collection::Tasks)
            .filter(Filter::not_null("budget"))
            .order_by("budget", Direction::Asc)
            .range(1, 5);
        let rows = store.query(&query).await.expect("query");
        let budgets: Vec<i64> = rows.iter().filter_map(|r| r["budget"].as_i64()).collect();
        assert_eq!(budgets, vec![20, 30]);
    }

    #[tokio::test]
    async fn conversation_lookup_ignores_participant_order() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = store
            .transaction(Procedure::GetOrCreateConversation { user_a: a, user_b: b, task_id: None })
            .await
            .expect("create");
        let second = store
            .transaction(Procedure::GetOrCreateConversation { user_a: b, user_b: a, task_id: None })
            .await
            .expect("lookup");
        assert_eq!(first["id"], second["id"]);
        assert_eq!(store.row_count(Collection::ConversationParticipants), 2);
    }
}
