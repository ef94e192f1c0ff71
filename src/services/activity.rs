//! Activity log
//!
//! Entries are a side effect of marketplace actions, written the way
//! notifications are: a failed write is logged and the action stands.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

use super::profiles;
use crate::domain::{Activity, ActivityEntry, ActivityType, Task};
use crate::error::MarketResult;
use crate::store::{Collection, Direction, Filter, Query, Store, StoreExt};

/// Entries shown on a profile page
pub const ACTIVITY_LIMIT: u32 = 20;

pub fn activity_query(user_id: Uuid) -> Query {
    Query::new(Collection::ActivityLog)
        .filter(Filter::eq("user_id", user_id))
        .order_by("created_at", Direction::Desc)
        .range(0, ACTIVITY_LIMIT)
}

/// Append an entry to `user_id`'s history.
pub async fn record(
    store: &dyn Store,
    user_id: Uuid,
    activity_type: ActivityType,
    task_id: Option<Uuid>,
    related_user_id: Option<Uuid>,
    metadata: Value,
) {
    let activity = Activity {
        id: Uuid::new_v4(),
        user_id,
        activity_type,
        task_id,
        related_user_id,
        metadata,
        created_at: Utc::now(),
    };
    match store.create::<Activity>(Collection::ActivityLog, &activity).await {
        Ok(_) => tracing::debug!(user_id = %user_id, activity_type = %activity_type, "Activity recorded"),
        Err(e) => tracing::warn!(
            user_id = %user_id,
            activity_type = %activity_type,
            error = %e,
            "Failed to record activity"
        ),
    }
}

pub async fn task_posted(store: &dyn Store, task: &Task) {
    record(store, task.owner_id, ActivityType::TaskPosted, Some(task.id), None, json!({})).await
}

pub async fn bid_placed(store: &dyn Store, task: &Task, bidder_id: Uuid, proposed_budget: Decimal) {
    record(
        store,
        bidder_id,
        ActivityType::BidPlaced,
        Some(task.id),
        Some(task.owner_id),
        json!({ "proposed_budget": proposed_budget }),
    )
    .await
}

pub async fn task_accepted(store: &dyn Store, task: &Task, worker_id: Uuid) {
    record(store, worker_id, ActivityType::TaskAccepted, Some(task.id), Some(task.owner_id), json!({})).await
}

pub async fn task_completed(store: &dyn Store, task: &Task, worker_id: Uuid) {
    record(store, worker_id, ActivityType::TaskCompleted, Some(task.id), Some(task.owner_id), json!({})).await
}

pub async fn rating_received(store: &dyn Store, task: &Task, rater_id: Uuid, ratee_id: Uuid, stars: i16) {
    record(
        store,
        ratee_id,
        ActivityType::RatingReceived,
        Some(task.id),
        Some(rater_id),
        json!({ "stars": stars }),
    )
    .await
}

pub async fn task_liked(store: &dyn Store, task: &Task, liker_id: Uuid) {
    record(store, liker_id, ActivityType::TaskLiked, Some(task.id), Some(task.owner_id), json!({})).await
}

/// The latest entries of a profile's history, newest first
pub async fn list_activity(store: &dyn Store, profile_id: Uuid) -> MarketResult<Vec<ActivityEntry>> {
    profiles::get_profile(store, profile_id).await?;
    let entries: Vec<Activity> = store.fetch(&activity_query(profile_id)).await?;

    let task_ids: Vec<Uuid> = entries.iter().filter_map(|a| a.task_id).collect();
    let titles: HashMap<Uuid, String> = if task_ids.is_empty() {
        HashMap::new()
    } else {
        store
            .fetch::<Task>(&Query::new(Collection::Tasks).filter(Filter::is_in("id", task_ids)))
            .await?
            .into_iter()
            .map(|t| (t.id, t.title))
            .collect()
    };
    let people = profiles::summaries(store, entries.iter().filter_map(|a| a.related_user_id)).await?;

    Ok(entries
        .into_iter()
        .map(|activity| ActivityEntry {
            task_title: activity.task_id.and_then(|id| titles.get(&id).cloned()),
            related_user: activity.related_user_id.and_then(|id| people.get(&id).cloned()),
            activity,
        })
        .collect())
}
