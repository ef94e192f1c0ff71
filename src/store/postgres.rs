//! Postgres store backend
//!
//! Rows travel as `jsonb`. Filter values are bound as one-key JSON objects and
//! cast through `jsonb_populate_record(NULL::<table>, ..)`, so every
//! comparison happens on the column's own SQL type (timestamps, numerics,
//! uuids) rather than on text.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{postgres::PgListener, types::Json, PgPool};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    ChangeEvent, ChangeHub, ChangeKind, Collection, Direction, Filter, Procedure, Query, Store,
    StoreError, StoreResult,
};

fn ident(name: &str) -> StoreResult<&str> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::Invalid(format!("illegal column name {name:?}")))
    }
}

enum Bind {
    Json(Value),
    Text(String),
    Uuid(Uuid),
    OptUuid(Option<Uuid>),
    Bool(bool),
}

/// Accumulates SQL text and positional binds.
struct SqlBuilder {
    table: &'static str,
    sql: String,
    binds: Vec<Bind>,
}

impl SqlBuilder {
    fn new(collection: Collection) -> Self {
        Self {
            table: collection.table(),
            sql: String::new(),
            binds: Vec::new(),
        }
    }

    fn bind(&mut self, bind: Bind) -> String {
        self.binds.push(bind);
        format!("${}", self.binds.len())
    }

    /// Expression yielding `value` cast to the type of column `field`.
    fn typed(&mut self, field: &str, value: &Value) -> StoreResult<String> {
        let field = ident(field)?;
        let placeholder = self.bind(Bind::Json(json!({ field: value })));
        Ok(format!(
            "(jsonb_populate_record(NULL::{}, {}::jsonb)).{}",
            self.table, placeholder, field
        ))
    }

    fn compare(&mut self, field: &str, op: &str, value: &Value) -> StoreResult<String> {
        let rhs = self.typed(field, value)?;
        Ok(format!("t.{} {} {}", ident(field)?, op, rhs))
    }

    fn filter(&mut self, filter: &Filter) -> StoreResult<String> {
        Ok(match filter {
            Filter::All(parts) if parts.is_empty() => "TRUE".to_string(),
            Filter::Any(parts) if parts.is_empty() => "FALSE".to_string(),
            Filter::All(parts) => self.join(parts, " AND ")?,
            Filter::Any(parts) => self.join(parts, " OR ")?,
            Filter::Eq(f, v) => self.compare(f, "=", v)?,
            Filter::Neq(f, v) => self.compare(f, "<>", v)?,
            Filter::Gt(f, v) => self.compare(f, ">", v)?,
            Filter::Gte(f, v) => self.compare(f, ">=", v)?,
            Filter::Lt(f, v) => self.compare(f, "<", v)?,
            Filter::Lte(f, v) => self.compare(f, "<=", v)?,
            Filter::Contains(f, needle) => {
                let escaped = needle
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                let placeholder = self.bind(Bind::Text(format!("%{escaped}%")));
                format!("t.{}::text ILIKE {}", ident(f)?, placeholder)
            }
            Filter::In(_, values) if values.is_empty() => "FALSE".to_string(),
            Filter::In(f, values) => {
                let field = ident(f)?;
                let placeholder = self.bind(Bind::Json(Value::Array(values.clone())));
                format!(
                    "t.{field} = ANY(ARRAY(SELECT (jsonb_populate_record(NULL::{table}, jsonb_build_object('{field}', x))).{field} FROM jsonb_array_elements({placeholder}::jsonb) AS x))",
                    table = self.table,
                )
            }
            Filter::IsNull(f) => format!("t.{} IS NULL", ident(f)?),
            Filter::NotNull(f) => format!("t.{} IS NOT NULL", ident(f)?),
        })
    }

    fn join(&mut self, parts: &[Filter], sep: &str) -> StoreResult<String> {
        let compiled = parts
            .iter()
            .map(|p| self.filter(p).map(|sql| format!("({sql})")))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(compiled.join(sep))
    }

    async fn fetch_rows(self, pool: &PgPool) -> StoreResult<Vec<Value>> {
        let mut query = sqlx::query_scalar::<_, Json<Value>>(&self.sql);
        for bind in self.binds {
            query = match bind {
                Bind::Json(v) => query.bind(Json(v)),
                Bind::Text(s) => query.bind(s),
                Bind::Uuid(id) => query.bind(id),
                Bind::OptUuid(id) => query.bind(id),
                Bind::Bool(flag) => query.bind(flag),
            };
        }
        let rows = query.fetch_all(pool).await.map_err(map_sqlx)?;
        Ok(rows.into_iter().map(|Json(v)| v).collect())
    }

    async fn execute(self, pool: &PgPool) -> StoreResult<u64> {
        let mut query = sqlx::query(&self.sql);
        for bind in self.binds {
            query = match bind {
                Bind::Json(v) => query.bind(Json(v)),
                Bind::Text(s) => query.bind(s),
                Bind::Uuid(id) => query.bind(id),
                Bind::OptUuid(id) => query.bind(id),
                Bind::Bool(flag) => query.bind(flag),
            };
        }
        let result = query.execute(pool).await.map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some("23505") => StoreError::Conflict(message),
                Some("23503") => StoreError::NotFound(message),
                Some("23514") | Some("TM409") => StoreError::Conflict(message),
                Some("TM403") => StoreError::Denied(message),
                Some("TM404") => StoreError::NotFound(message),
                // serialization failure / deadlock: nothing was applied
                Some("40001") | Some("40P01") => StoreError::Unavailable(message),
                _ => StoreError::Backend(anyhow::Error::new(err)),
            }
        }
        _ => StoreError::Backend(anyhow::Error::new(err)),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, collection: Collection, id: Uuid) -> StoreResult<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)", collection.table());
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn call(&self, sql: &str, binds: Vec<Bind>) -> StoreResult<Value> {
        let builder = SqlBuilder {
            table: "",
            sql: sql.to_string(),
            binds,
        };
        builder
            .fetch_rows(&self.pool)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Invalid("procedure returned no row".to_string()))
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend_tag(&self) -> &'static str {
        "postgres"
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Value>> {
        let mut b = SqlBuilder::new(query.collection);
        let where_sql = b.filter(&query.filter)?;
        let mut sql = format!("SELECT to_jsonb(t) FROM {} AS t WHERE {}", b.table, where_sql);

        if !query.sort.is_empty() {
            let keys = query
                .sort
                .iter()
                .map(|s| {
                    let dir = match s.direction {
                        Direction::Asc => "ASC",
                        Direction::Desc => "DESC",
                    };
                    ident(&s.field).map(|f| format!("t.{f} {dir} NULLS LAST"))
                })
                .collect::<StoreResult<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        if let Some(range) = query.range {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", range.limit, range.offset));
        }

        b.sql = sql;
        b.fetch_rows(&self.pool).await
    }

    async fn insert(&self, collection: Collection, row: Value) -> StoreResult<Value> {
        let mut row = row;
        let fields = row
            .as_object_mut()
            .ok_or_else(|| StoreError::Invalid("row must be a JSON object".to_string()))?;
        if fields.get("id").map_or(true, Value::is_null) {
            fields.insert("id".to_string(), json!(Uuid::new_v4()));
        }
        if fields.get("created_at").map_or(true, Value::is_null) {
            fields.insert("created_at".to_string(), json!(chrono::Utc::now()));
        }
        for key in fields.keys() {
            ident(key)?;
        }

        let mut b = SqlBuilder::new(collection);
        let placeholder = b.bind(Bind::Json(row));
        b.sql = format!(
            "INSERT INTO {table} AS t SELECT * FROM jsonb_populate_record(NULL::{table}, {placeholder}::jsonb) RETURNING to_jsonb(t)",
            table = b.table,
        );
        b.fetch_rows(&self.pool)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Invalid("insert returned no row".to_string()))
    }

    async fn update(
        &self,
        collection: Collection,
        id: Uuid,
        patch: Value,
        precondition: Option<&Filter>,
    ) -> StoreResult<Value> {
        let keys: Vec<String> = patch
            .as_object()
            .ok_or_else(|| StoreError::Invalid("patch must be a JSON object".to_string()))?
            .keys()
            .filter(|k| k.as_str() != "id")
            .cloned()
            .collect();
        if keys.is_empty() {
            return Err(StoreError::Invalid("empty patch".to_string()));
        }

        let mut b = SqlBuilder::new(collection);
        let id_placeholder = b.bind(Bind::Uuid(id));
        let patch_placeholder = b.bind(Bind::Json(patch));
        let assignments = keys
            .iter()
            .map(|k| {
                ident(k).map(|k| {
                    format!(
                        "{k} = (jsonb_populate_record(NULL::{}, {patch_placeholder}::jsonb)).{k}",
                        b.table
                    )
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let guard = match precondition {
            Some(filter) => b.filter(filter)?,
            None => "TRUE".to_string(),
        };
        b.sql = format!(
            "UPDATE {} AS t SET {} WHERE t.id = {} AND ({}) RETURNING to_jsonb(t)",
            b.table,
            assignments.join(", "),
            id_placeholder,
            guard
        );

        match b.fetch_rows(&self.pool).await?.into_iter().next() {
            Some(row) => Ok(row),
            None if self.exists(collection, id).await? => Err(StoreError::Conflict(format!(
                "{collection} {id} changed concurrently"
            ))),
            None => Err(StoreError::NotFound(format!("{collection} {id}"))),
        }
    }

    async fn delete(
        &self,
        collection: Collection,
        id: Uuid,
        precondition: Option<&Filter>,
    ) -> StoreResult<()> {
        let mut b = SqlBuilder::new(collection);
        let id_placeholder = b.bind(Bind::Uuid(id));
        let guard = match precondition {
            Some(filter) => b.filter(filter)?,
            None => "TRUE".to_string(),
        };
        b.sql = format!(
            "DELETE FROM {} AS t WHERE t.id = {} AND ({})",
            b.table, id_placeholder, guard
        );

        if b.execute(&self.pool).await? > 0 {
            return Ok(());
        }
        if self.exists(collection, id).await? {
            Err(StoreError::Conflict(format!("{collection} {id} changed concurrently")))
        } else {
            Err(StoreError::NotFound(format!("{collection} {id}")))
        }
    }

    async fn transaction(&self, procedure: Procedure) -> StoreResult<Value> {
        tracing::debug!(procedure = procedure.name(), "Running store procedure");
        match procedure {
            Procedure::AcceptBid {
                bid_id,
                owner_id,
                reject_other_pending,
            } => {
                self.call(
                    "SELECT accept_bid_and_update_task($1, $2, $3)",
                    vec![
                        Bind::Uuid(bid_id),
                        Bind::Uuid(owner_id),
                        Bind::Bool(reject_other_pending),
                    ],
                )
                .await
            }
            Procedure::GetOrCreateConversation {
                user_a,
                user_b,
                task_id,
            } => {
                self.call(
                    "SELECT get_or_create_conversation($1, $2, $3)",
                    vec![
                        Bind::Uuid(user_a),
                        Bind::Uuid(user_b),
                        Bind::OptUuid(task_id),
                    ],
                )
                .await
            }
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx)
    }
}

/// Envelope emitted by the `notify_row_change()` trigger.
#[derive(Debug, Deserialize)]
struct NotifyEnvelope {
    table: String,
    op: String,
    id: Uuid,
    /// Previous row without its free-text columns
    #[serde(default)]
    old: Option<Value>,
}

impl NotifyEnvelope {
    fn collection(&self) -> Option<Collection> {
        Collection::from_table(&self.table)
    }

    fn kind(&self) -> Option<ChangeKind> {
        match self.op.as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    /// Build the event from the row as it reads now. `None` for inserts and
    /// updates means the row is already gone; its delete follows.
    fn into_event(self, current: Option<Value>) -> Option<ChangeEvent> {
        let collection = self.collection()?;
        match self.kind()? {
            ChangeKind::Insert => Some(ChangeEvent::insert(collection, current?)),
            ChangeKind::Update => Some(ChangeEvent::update(collection, current?, self.old)),
            ChangeKind::Delete => {
                let row = self.old.unwrap_or_else(|| json!({ "id": self.id }));
                Some(ChangeEvent::delete(collection, row))
            }
        }
    }
}

/// Relays Postgres `NOTIFY` envelopes into a [`ChangeHub`].
pub struct PgChangeFeed;

impl PgChangeFeed {
    pub const CHANNEL: &'static str = "row_changes";

    pub async fn spawn(pool: &PgPool, hub: ChangeHub) -> anyhow::Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(Self::CHANNEL).await?;
        tracing::info!(channel = Self::CHANNEL, "Listening for row changes");
        let store = PgStore::new(pool.clone());

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<NotifyEnvelope>(notification.payload()) {
                            Ok(envelope) => Self::relay(&store, &hub, envelope).await,
                            Err(e) => tracing::warn!(error = %e, "Malformed change payload"),
                        }
                    }
                    Err(e) => {
                        // events in the gap are lost; views resubscribe and refetch
                        tracing::warn!(error = %e, "Change feed connection lost");
                        hub.close_all();
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    async fn relay(store: &PgStore, hub: &ChangeHub, envelope: NotifyEnvelope) {
        let Some(collection) = envelope.collection() else {
            tracing::debug!(table = %envelope.table, "Ignoring change on unknown table");
            return;
        };
        let current = if envelope.kind() == Some(ChangeKind::Delete) {
            None
        } else {
            let query = Query::new(collection).filter(Filter::eq("id", envelope.id));
            match store.query(&query).await {
                Ok(rows) => rows.into_iter().next(),
                Err(e) => {
                    tracing::warn!(
                        collection = %collection,
                        id = %envelope.id,
                        error = %e,
                        "Failed to read changed row"
                    );
                    hub.close_all();
                    return;
                }
            }
        };
        match envelope.into_event(current) {
            Some(event) => hub.publish(event),
            None => tracing::debug!(collection = %collection, "Changed row no longer exists"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_compile_to_typed_comparisons() {
        let mut b = SqlBuilder::new(Collection::Tasks);
        let filter = Filter::eq("status", "OPEN")
            .and(Filter::gte("budget", 100))
            .and(Filter::is_null("accepted_user_id"));
        let sql = b.filter(&filter).expect("compile");
        assert_eq!(
            sql,
            "(t.status = (jsonb_populate_record(NULL::tasks, $1::jsonb)).status) AND \
             (t.budget >= (jsonb_populate_record(NULL::tasks, $2::jsonb)).budget) AND \
             (t.accepted_user_id IS NULL)"
        );
        assert_eq!(b.binds.len(), 2);
    }

    #[test]
    fn contains_escapes_like_wildcards() {
        let mut b = SqlBuilder::new(Collection::Tasks);
        b.filter(&Filter::contains("title", "100%_done")).expect("compile");
        match &b.binds[0] {
            Bind::Text(pattern) => assert_eq!(pattern, "%100\\%\\_done%"),
            _ => panic!("expected a text bind"),
        }
    }

    #[test]
    fn column_names_are_validated() {
        let mut b = SqlBuilder::new(Collection::Tasks);
        let result = b.filter(&Filter::eq("status; DROP TABLE tasks", "OPEN"));
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn updates_are_rebuilt_from_the_current_row() {
        let envelope: NotifyEnvelope = serde_json::from_str(
            r#"{"table":"bids","op":"UPDATE","id":"00000000-0000-0000-0000-000000000001","old":{"status":"pending"}}"#,
        )
        .expect("parse");
        let event = envelope
            .into_event(Some(json!({ "id": "00000000-0000-0000-0000-000000000001", "status": "accepted" })))
            .expect("event");
        assert_eq!(event.collection, Collection::Bids);
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.row["status"], "accepted");
        assert_eq!(event.old.expect("old")["status"], "pending");
    }

    #[test]
    fn deletes_carry_the_envelope_keys() {
        let envelope: NotifyEnvelope = serde_json::from_str(
            r#"{"table":"messages","op":"DELETE","id":"00000000-0000-0000-0000-000000000002","old":{"id":"00000000-0000-0000-0000-000000000002","task_id":"t"}}"#,
        )
        .expect("parse");
        let event = envelope.into_event(None).expect("event");
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.row["task_id"], "t");
    }

    #[test]
    fn vanished_rows_publish_nothing() {
        let envelope: NotifyEnvelope = serde_json::from_str(
            r#"{"table":"tasks","op":"INSERT","id":"00000000-0000-0000-0000-000000000003"}"#,
        )
        .expect("parse");
        assert!(envelope.into_event(None).is_none());
    }

    /// Runs against `TEST_DATABASE_URL` when it is set.
    #[tokio::test]
    async fn large_rows_commit_and_reach_subscribers() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        let hub = ChangeHub::new();
        let feed = PgChangeFeed::spawn(&pool, hub.clone()).await.expect("listen");
        let store = PgStore::new(pool);

        let owner = store
            .insert(
                Collection::Profiles,
                json!({
                    "user_id": Uuid::new_v4(),
                    "username": "bulky",
                    "full_name": "",
                    "bio": "",
                    "skills": [],
                    "rating": 0.0,
                    "completed_tasks": 0,
                    "status": "active",
                    "is_verified": false,
                    "is_admin": false,
                    "updated_at": chrono::Utc::now(),
                }),
            )
            .await
            .expect("profile");
        let mut sub = hub.register(Collection::Tasks, Filter::eq("owner_id", owner["id"].clone()));
        let description = "x".repeat(9000);
        let task = store
            .insert(
                Collection::Tasks,
                json!({
                    "title": "Long brief",
                    "description": description,
                    "subject": "Math",
                    "budget": 50,
                    "deadline": chrono::Utc::now() + chrono::Duration::days(2),
                    "status": "OPEN",
                    "visibility": "public",
                    "owner_id": owner["id"],
                    "updated_at": chrono::Utc::now(),
                }),
            )
            .await
            .expect("a 9000-character description is stored");

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("notified")
            .expect("event");
        assert_eq!(event.row["id"], task["id"]);
        assert_eq!(event.row["description"].as_str().map(str::len), Some(9000));
        feed.abort();
    }
}
