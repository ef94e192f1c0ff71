//! Task likes
//!
//! A profile likes a task at most once; the store's unique rule on
//! `(task_id, user_id)` settles racing toggles. The returned status is
//! computed from the read taken before the write.

use chrono::Utc;
use uuid::Uuid;

use super::{activity, lifecycle::get_task};
use crate::auth::Actor;
use crate::domain::{Like, LikeStatus};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, Query, Store, StoreError, StoreExt};

pub fn likes_query(task_id: Uuid) -> Query {
    Query::new(Collection::Likes)
        .filter(Filter::eq("task_id", task_id))
        .order_by("created_at", Direction::Asc)
}

pub async fn like_status(store: &dyn Store, task_id: Uuid, viewer_id: Uuid) -> MarketResult<LikeStatus> {
    let task = get_task(store, task_id).await?;
    let likes: Vec<Like> = store.fetch(&likes_query(task.id)).await?;
    Ok(LikeStatus {
        task_id: task.id,
        count: likes.len(),
        liked: likes.iter().any(|l| l.user_id == viewer_id),
    })
}

/// Like the task, or take the like back if the actor already likes it.
pub async fn toggle_like(store: &dyn Store, task_id: Uuid, actor: &Actor) -> MarketResult<LikeStatus> {
    if !actor.is_active() {
        return Err(MarketError::forbidden("deactivated profiles cannot like tasks"));
    }
    let task = get_task(store, task_id).await?;
    let likes: Vec<Like> = store.fetch(&likes_query(task.id)).await?;
    let others = likes.iter().filter(|l| l.user_id != actor.id()).count();

    match likes.iter().find(|l| l.user_id == actor.id()) {
        Some(mine) => {
            tracing::info!(actor_id = %actor.id(), task_id = %task.id, "Unliking task");
            match store.delete(Collection::Likes, mine.id, None).await {
                // a concurrent toggle removed it first
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            Ok(LikeStatus { task_id: task.id, count: others, liked: false })
        }
        None => {
            tracing::info!(actor_id = %actor.id(), task_id = %task.id, "Liking task");
            let like = Like {
                id: Uuid::new_v4(),
                task_id: task.id,
                user_id: actor.id(),
                created_at: Utc::now(),
            };
            match store.create::<Like>(Collection::Likes, &like).await {
                Ok(_) => activity::task_liked(store, &task, actor.id()).await,
                // a concurrent toggle liked it first
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
            Ok(LikeStatus { task_id: task.id, count: others + 1, liked: true })
        }
    }
}
