//! Notification service
//!
//! Notifications are a side effect of marketplace actions. A failure to write
//! one is logged and never fails the action that triggered it.

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Actor;
use crate::domain::notifications::{Notification, NotificationType};
use crate::domain::{Bid, Task};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, Query, Store, StoreExt};

/// Create a notification for a user
pub async fn create_notification(
    store: &dyn Store,
    user_id: Uuid,
    notification_type: NotificationType,
    title: &str,
    message: Option<&str>,
    data: Option<Value>,
) -> MarketResult<Uuid> {
    let notification = Notification {
        id: Uuid::new_v4(),
        user_id,
        notification_type,
        title: title.to_string(),
        message: message.map(str::to_string),
        data: data.unwrap_or_else(|| json!({})),
        is_read: false,
        read_at: None,
        created_at: Utc::now(),
    };
    let saved = store.create(Collection::Notifications, &notification).await?;

    tracing::info!(
        user_id = %user_id,
        notification_type = %notification_type,
        notification_id = %saved.id,
        "Notification created"
    );

    Ok(saved.id)
}

/// Fire-and-log wrapper: the caller's action has already succeeded.
async fn best_effort(
    store: &dyn Store,
    user_id: Uuid,
    notification_type: NotificationType,
    title: &str,
    message: Option<&str>,
    data: Value,
) {
    if let Err(e) =
        create_notification(store, user_id, notification_type, title, message, Some(data)).await
    {
        tracing::warn!(
            user_id = %user_id,
            notification_type = %notification_type,
            error = %e,
            "Failed to create notification"
        );
    }
}

/// Tell the task owner about a new bid
pub async fn notify_bid_received(store: &dyn Store, task: &Task, bid: &Bid, bidder: &str) {
    best_effort(
        store,
        task.owner_id,
        NotificationType::BidReceived,
        &format!("New bid on {}", task.title),
        Some(&format!("{} offered ${}", bidder, bid.proposed_budget)),
        json!({ "task_id": task.id, "bid_id": bid.id }),
    )
    .await
}

pub async fn notify_bid_accepted(store: &dyn Store, task: &Task, bid: &Bid) {
    best_effort(
        store,
        bid.bidder_id,
        NotificationType::BidAccepted,
        "Your bid was accepted!",
        Some(&format!("You can start working on '{}'.", task.title)),
        json!({ "task_id": task.id, "bid_id": bid.id }),
    )
    .await
}

pub async fn notify_bid_rejected(store: &dyn Store, task: &Task, bidder_id: Uuid, bid_id: Uuid) {
    best_effort(
        store,
        bidder_id,
        NotificationType::BidRejected,
        "Bid not selected",
        Some(&format!(
            "Your bid for '{}' was not selected. Keep bidding on other tasks!",
            task.title
        )),
        json!({ "task_id": task.id, "bid_id": bid_id }),
    )
    .await
}

pub async fn notify_bid_withdrawn(store: &dyn Store, task: &Task, bid: &Bid) {
    best_effort(
        store,
        task.owner_id,
        NotificationType::BidWithdrawn,
        &format!("A bid on {} was withdrawn", task.title),
        None,
        json!({ "task_id": task.id, "bid_id": bid.id }),
    )
    .await
}

pub async fn notify_task_delivered(store: &dyn Store, task: &Task) {
    best_effort(
        store,
        task.owner_id,
        NotificationType::TaskDelivered,
        &format!("{} was delivered", task.title),
        Some("Review the delivery and mark the task as complete."),
        json!({ "task_id": task.id }),
    )
    .await
}

pub async fn notify_task_completed(store: &dyn Store, task: &Task, worker_id: Uuid) {
    best_effort(
        store,
        worker_id,
        NotificationType::TaskCompleted,
        &format!("{} was marked complete", task.title),
        Some("Don't forget to rate the task owner."),
        json!({ "task_id": task.id }),
    )
    .await
}

pub async fn notify_new_message(store: &dyn Store, recipient: Uuid, sender: &str, data: Value) {
    best_effort(
        store,
        recipient,
        NotificationType::NewMessage,
        &format!("New message from {}", sender),
        None,
        data,
    )
    .await
}

pub async fn notify_new_comment(store: &dyn Store, task: &Task, author: &str, comment_id: Uuid) {
    best_effort(
        store,
        task.owner_id,
        NotificationType::NewComment,
        &format!("{} commented on {}", author, task.title),
        None,
        json!({ "task_id": task.id, "comment_id": comment_id }),
    )
    .await
}

pub async fn notify_rating_received(store: &dyn Store, task: &Task, to_user_id: Uuid, stars: i16) {
    best_effort(
        store,
        to_user_id,
        NotificationType::RatingReceived,
        &format!("You received {} stars", stars),
        Some(&format!("For '{}'.", task.title)),
        json!({ "task_id": task.id, "stars": stars }),
    )
    .await
}

/// The actor's notifications, newest first
pub async fn list_notifications(
    store: &dyn Store,
    actor: &Actor,
    unread_only: bool,
) -> MarketResult<Vec<Notification>> {
    let mut query = Query::new(Collection::Notifications)
        .filter(Filter::eq("user_id", actor.id()))
        .order_by("created_at", Direction::Desc);
    if unread_only {
        query = query.filter(Filter::eq("is_read", false));
    }
    Ok(store.fetch(&query).await?)
}

pub async fn unread_count(store: &dyn Store, actor: &Actor) -> MarketResult<usize> {
    Ok(list_notifications(store, actor, true).await?.len())
}

pub async fn mark_read(store: &dyn Store, actor: &Actor, id: Uuid) -> MarketResult<Notification> {
    let notification: Notification = store.get(Collection::Notifications, id).await?;
    if notification.user_id != actor.id() {
        return Err(MarketError::not_found("Notification not found"));
    }
    if notification.is_read {
        return Ok(notification);
    }
    Ok(store
        .patch(
            Collection::Notifications,
            id,
            json!({ "is_read": true, "read_at": Utc::now() }),
            None,
        )
        .await?)
}
