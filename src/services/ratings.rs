//! Ratings between the two parties of a finished task

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::lifecycle::{get_task, role_of, Role};
use super::{activity, notifications, profiles};
use crate::auth::Actor;
use crate::domain::{CreateRatingRequest, Rating, RatingWithRater, Task, TaskStatus};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, Query, Store, StoreError, StoreExt};

/// Resolve who the actor rates on this task.
pub fn rating_target(task: &Task, actor_id: Uuid, stars: i16) -> MarketResult<Uuid> {
    if !(1..=5).contains(&stars) {
        return Err(MarketError::validation("stars must be between 1 and 5"));
    }
    let role = role_of(task, actor_id)
        .ok_or_else(|| MarketError::forbidden("only the task owner and worker can rate each other"))?;
    if task.status != TaskStatus::Done {
        return Err(MarketError::conflict("ratings open once the task is done"));
    }
    match role {
        Role::Owner => task
            .accepted_user_id
            .ok_or_else(|| MarketError::conflict("task has no worker to rate")),
        Role::Worker => Ok(task.owner_id),
    }
}

pub async fn has_rated(store: &dyn Store, task_id: Uuid, from_user_id: Uuid) -> MarketResult<bool> {
    let query = Query::new(Collection::Ratings)
        .filter(Filter::eq("task_id", task_id).and(Filter::eq("from_user_id", from_user_id)));
    Ok(store.fetch_one::<Rating>(&query).await?.is_some())
}

pub async fn rate(
    store: &dyn Store,
    task_id: Uuid,
    actor: &Actor,
    req: CreateRatingRequest,
) -> MarketResult<Rating> {
    let task = get_task(store, task_id).await?;
    let to_user_id = rating_target(&task, actor.id(), req.stars)?;
    if has_rated(store, task.id, actor.id()).await? {
        return Err(MarketError::conflict("you already rated this task"));
    }

    let rating = Rating {
        id: Uuid::new_v4(),
        task_id: task.id,
        from_user_id: actor.id(),
        to_user_id,
        stars: req.stars,
        comment: req.comment.trim().to_string(),
        created_at: Utc::now(),
    };
    tracing::info!(
        actor_id = %actor.id(),
        task_id = %task.id,
        to_user_id = %to_user_id,
        stars = rating.stars,
        "Submitting rating"
    );
    let saved: Rating = store.create(Collection::Ratings, &rating).await.map_err(|e| match e {
        StoreError::Conflict(_) => MarketError::conflict("you already rated this task"),
        other => other.into(),
    })?;

    if let Err(e) = refresh_average(store, to_user_id).await {
        tracing::warn!(profile_id = %to_user_id, error = %e, "Failed to refresh rating average");
    }
    activity::rating_received(store, &task, actor.id(), to_user_id, saved.stars).await;
    notifications::notify_rating_received(store, &task, to_user_id, saved.stars).await;
    Ok(saved)
}

/// Recompute a profile's average from all ratings it received.
async fn refresh_average(store: &dyn Store, profile_id: Uuid) -> MarketResult<f64> {
    let received: Vec<Rating> = store
        .fetch(&Query::new(Collection::Ratings).filter(Filter::eq("to_user_id", profile_id)))
        .await?;
    let average = average_stars(&received);
    store
        .update(
            Collection::Profiles,
            profile_id,
            json!({ "rating": average, "updated_at": Utc::now() }),
            None,
        )
        .await?;
    Ok(average)
}

pub fn average_stars(ratings: &[Rating]) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    let total: i64 = ratings.iter().map(|r| i64::from(r.stars)).sum();
    let avg = total as f64 / ratings.len() as f64;
    (avg * 100.0).round() / 100.0
}

/// Ratings a profile received, newest first
pub async fn ratings_for(store: &dyn Store, profile_id: Uuid) -> MarketResult<Vec<RatingWithRater>> {
    let ratings: Vec<Rating> = store
        .fetch(
            &Query::new(Collection::Ratings)
                .filter(Filter::eq("to_user_id", profile_id))
                .order_by("created_at", Direction::Desc),
        )
        .await?;
    let people = profiles::summaries(store, ratings.iter().map(|r| r.from_user_id)).await?;
    Ok(ratings
        .into_iter()
        .map(|rating| RatingWithRater {
            rater: people.get(&rating.from_user_id).cloned(),
            rating,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Visibility;
    use rust_decimal::Decimal;

    fn done_task(owner: Uuid, worker: Uuid) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: "Essay review".into(),
            description: String::new(),
            subject: "History".into(),
            budget: Decimal::from(30),
            deadline: now,
            status: TaskStatus::Done,
            visibility: Visibility::Public,
            owner_id: owner,
            accepted_user_id: Some(worker),
            file_url: None,
            client_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn each_party_rates_the_other() {
        let (owner, worker) = (Uuid::new_v4(), Uuid::new_v4());
        let task = done_task(owner, worker);
        assert_eq!(rating_target(&task, owner, 5).unwrap(), worker);
        assert_eq!(rating_target(&task, worker, 4).unwrap(), owner);
        assert!(matches!(
            rating_target(&task, Uuid::new_v4(), 4),
            Err(MarketError::Authorization(_))
        ));
    }

    #[test]
    fn stars_and_status_are_checked() {
        let (owner, worker) = (Uuid::new_v4(), Uuid::new_v4());
        let mut task = done_task(owner, worker);
        assert!(matches!(rating_target(&task, owner, 0), Err(MarketError::Validation(_))));
        assert!(matches!(rating_target(&task, owner, 6), Err(MarketError::Validation(_))));

        task.status = TaskStatus::Delivered;
        assert!(matches!(rating_target(&task, owner, 5), Err(MarketError::Conflict(_))));
    }

    #[test]
    fn averages_round_to_two_places() {
        let mk = |stars| Rating {
            id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            from_user_id: Uuid::nil(),
            to_user_id: Uuid::nil(),
            stars,
            comment: String::new(),
            created_at: Utc::now(),
        };
        assert_eq!(average_stars(&[]), 0.0);
        assert_eq!(average_stars(&[mk(5), mk(4), mk(4)]), 4.33);
    }
}
