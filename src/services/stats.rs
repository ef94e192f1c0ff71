//! Profile statistics

use rust_decimal::Decimal;
use uuid::Uuid;

use super::profiles;
use super::ratings::average_stars;
use crate::domain::{Rating, Task, TaskStatus, UserStats};
use crate::error::MarketResult;
use crate::store::{Collection, Filter, Query, Store, StoreExt};

/// Fold the tasks a user owns or worked on into their stats.
pub fn summarize(profile_id: Uuid, tasks: &[Task], received: &[Rating]) -> UserStats {
    let posted: Vec<&Task> = tasks.iter().filter(|t| t.owner_id == profile_id).collect();
    let accepted: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.accepted_user_id == Some(profile_id))
        .collect();
    let done = |t: &&&Task| t.status == TaskStatus::Done;

    UserStats {
        posted_count: posted.len(),
        accepted_count: accepted.len(),
        completed_count: accepted.iter().filter(done).count(),
        total_earned: accepted.iter().filter(done).map(|t| t.budget).sum::<Decimal>(),
        total_spent: posted.iter().filter(done).map(|t| t.budget).sum::<Decimal>(),
        average_rating: average_stars(received),
        ratings_count: received.len(),
    }
}

pub async fn user_stats(store: &dyn Store, profile_id: Uuid) -> MarketResult<UserStats> {
    let profile = profiles::get_profile(store, profile_id).await?;
    let tasks: Vec<Task> = store
        .fetch(&Query::new(Collection::Tasks).filter(Filter::any(vec![
            Filter::eq("owner_id", profile.id),
            Filter::eq("accepted_user_id", profile.id),
        ])))
        .await?;
    let received: Vec<Rating> = store
        .fetch(&Query::new(Collection::Ratings).filter(Filter::eq("to_user_id", profile.id)))
        .await?;
    Ok(summarize(profile.id, &tasks, &received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Visibility;
    use chrono::Utc;

    fn task(owner: Uuid, worker: Option<Uuid>, status: TaskStatus, budget: i64) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: String::new(),
            subject: "s".into(),
            budget: Decimal::from(budget),
            deadline: now,
            status,
            visibility: Visibility::Public,
            owner_id: owner,
            accepted_user_id: worker,
            file_url: None,
            client_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn earnings_and_spending_count_done_tasks_only() {
        let (me, other) = (Uuid::new_v4(), Uuid::new_v4());
        let tasks = vec![
            task(me, Some(other), TaskStatus::Done, 100),
            task(me, None, TaskStatus::Open, 40),
            task(other, Some(me), TaskStatus::Done, 70),
            task(other, Some(me), TaskStatus::InProgress, 25),
        ];
        let stats = summarize(me, &tasks, &[]);

        assert_eq!(stats.posted_count, 2);
        assert_eq!(stats.accepted_count, 2);
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.total_earned, Decimal::from(70));
        assert_eq!(stats.total_spent, Decimal::from(100));
        assert_eq!(stats.ratings_count, 0);
    }
}
