//! Task lifecycle
//!
//! Status changes are defined only by [`TRANSITIONS`]. Every other module
//! asks this one whether a change is legal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::{activity, client_ref_or_new, load, notifications, profiles};
use crate::auth::Actor;
use crate::config::MarketPolicy;
use crate::domain::{
    CreateTaskRequest, Profile, Task, TaskAttachment, TaskDetail, TaskStatus,
};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, Query, Store, StoreError, StoreExt};

/// Who may fire a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Worker,
}

/// What fires a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Only reachable through bid acceptance
    BidAccepted,
    /// Explicit status change by the role holder
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub role: Role,
    pub trigger: Trigger,
}

pub const TRANSITIONS: &[Transition] = &[
    Transition {
        from: TaskStatus::Open,
        to: TaskStatus::InProgress,
        role: Role::Owner,
        trigger: Trigger::BidAccepted,
    },
    Transition {
        from: TaskStatus::InProgress,
        to: TaskStatus::Delivered,
        role: Role::Worker,
        trigger: Trigger::Advance,
    },
    Transition {
        from: TaskStatus::Delivered,
        to: TaskStatus::Done,
        role: Role::Owner,
        trigger: Trigger::Advance,
    },
];

pub fn transition(from: TaskStatus, to: TaskStatus) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.from == from && t.to == to)
}

pub fn role_of(task: &Task, profile_id: Uuid) -> Option<Role> {
    if task.is_owner(profile_id) {
        Some(Role::Owner)
    } else if task.is_worker(profile_id) {
        Some(Role::Worker)
    } else {
        None
    }
}

/// Decide whether `actor_id` may move `task` to `to` with an explicit advance.
pub fn check_advance(task: &Task, to: TaskStatus, actor_id: Uuid) -> MarketResult<&'static Transition> {
    let edge = transition(task.status, to)
        .filter(|t| t.trigger == Trigger::Advance)
        .ok_or_else(|| {
            MarketError::illegal_transition(format!("cannot move a task from {} to {}", task.status, to))
        })?;
    if role_of(task, actor_id) != Some(edge.role) {
        let who = match edge.role {
            Role::Owner => "task owner",
            Role::Worker => "assigned worker",
        };
        return Err(MarketError::forbidden(format!(
            "only the {who} can move a task from {} to {}",
            edge.from, edge.to
        )));
    }
    Ok(edge)
}

pub fn check_delete(task: &Task, actor_id: Uuid) -> MarketResult<()> {
    if !task.is_owner(actor_id) {
        return Err(MarketError::forbidden("only the task owner can delete it"));
    }
    if task.accepted_user_id.is_some() {
        return Err(MarketError::conflict("a task with an accepted worker cannot be deleted"));
    }
    Ok(())
}

pub fn validate_new_task(
    policy: &MarketPolicy,
    req: &CreateTaskRequest,
    now: DateTime<Utc>,
) -> MarketResult<()> {
    if req.title.trim().is_empty() {
        return Err(MarketError::validation("title is required"));
    }
    if req.subject.trim().is_empty() {
        return Err(MarketError::validation("subject is required"));
    }
    if req.budget <= rust_decimal::Decimal::ZERO || req.budget < policy.min_task_budget {
        return Err(MarketError::validation(format!(
            "budget must be at least {}",
            policy.min_task_budget
        )));
    }
    if req.deadline <= now {
        return Err(MarketError::validation("deadline must be in the future"));
    }
    Ok(())
}

pub async fn create_task(
    store: &dyn Store,
    policy: &MarketPolicy,
    actor: &Actor,
    req: CreateTaskRequest,
) -> MarketResult<Task> {
    if !actor.is_active() {
        return Err(MarketError::forbidden("deactivated profiles cannot post tasks"));
    }
    let now = Utc::now();
    validate_new_task(policy, &req, now)?;

    let task = Task {
        id: Uuid::new_v4(),
        title: req.title.trim().to_string(),
        description: req.description,
        subject: req.subject.trim().to_string(),
        budget: req.budget,
        deadline: req.deadline,
        status: TaskStatus::Open,
        visibility: req.visibility,
        owner_id: actor.id(),
        accepted_user_id: None,
        file_url: req.file_url,
        client_ref: client_ref_or_new(req.client_ref),
        created_at: now,
        updated_at: now,
    };

    tracing::info!(actor_id = %actor.id(), task_id = %task.id, budget = %task.budget, "Creating task");
    let saved: Task = store.create(Collection::Tasks, &task).await?;
    activity::task_posted(store, &saved).await;
    Ok(saved)
}

pub async fn get_task(store: &dyn Store, id: Uuid) -> MarketResult<Task> {
    load(store, Collection::Tasks, id, "Task").await
}

pub async fn task_detail(store: &dyn Store, id: Uuid) -> MarketResult<TaskDetail> {
    let task = get_task(store, id).await?;
    let mut people = profiles::summaries(store, [Some(task.owner_id), task.accepted_user_id].into_iter().flatten()).await?;
    let attachments: Vec<TaskAttachment> = store
        .fetch(
            &Query::new(Collection::TaskAttachments)
                .filter(Filter::eq("task_id", task.id))
                .order_by("created_at", Direction::Asc),
        )
        .await?;

    Ok(TaskDetail {
        owner: people.remove(&task.owner_id),
        worker: task.accepted_user_id.and_then(|id| people.remove(&id)),
        task,
        attachments,
    })
}

/// Result of an explicit status change
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub task: Task,
    /// Set when the change makes a rating possible
    pub rating_prompt: Option<RatingPrompt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatingPrompt {
    pub task_id: Uuid,
    pub rater_id: Uuid,
    pub ratee_id: Uuid,
}

pub async fn advance_status(
    store: &dyn Store,
    task_id: Uuid,
    to: TaskStatus,
    actor: &Actor,
) -> MarketResult<StatusChange> {
    let task = get_task(store, task_id).await?;
    let edge = check_advance(&task, to, actor.id())?;

    tracing::info!(
        actor_id = %actor.id(),
        task_id = %task.id,
        from = %edge.from,
        to = %edge.to,
        "Advancing task status"
    );

    // Conditional on the status we validated against
    let guard = Filter::eq("status", edge.from.as_str());
    let updated: Task = store
        .patch(
            Collection::Tasks,
            task.id,
            json!({ "status": edge.to.as_str(), "updated_at": Utc::now() }),
            Some(&guard),
        )
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => MarketError::conflict("the task changed status concurrently"),
            other => other.into(),
        })?;

    let worker_id = updated.accepted_user_id;
    let rating_prompt = match (edge.to, worker_id) {
        (TaskStatus::Delivered, _) => {
            notifications::notify_task_delivered(store, &updated).await;
            None
        }
        (TaskStatus::Done, Some(worker_id)) => {
            record_completion(store, worker_id).await;
            activity::task_completed(store, &updated, worker_id).await;
            notifications::notify_task_completed(store, &updated, worker_id).await;
            Some(RatingPrompt {
                task_id: updated.id,
                rater_id: updated.owner_id,
                ratee_id: worker_id,
            })
        }
        _ => None,
    };

    Ok(StatusChange {
        task: updated,
        rating_prompt,
    })
}

/// Bump the worker's completed task counter. Failures are logged only.
async fn record_completion(store: &dyn Store, worker_id: Uuid) {
    let result: MarketResult<()> = async {
        let profile: Profile = load(store, Collection::Profiles, worker_id, "Profile").await?;
        let guard = Filter::eq("completed_tasks", profile.completed_tasks);
        store
            .update(
                Collection::Profiles,
                worker_id,
                json!({ "completed_tasks": profile.completed_tasks + 1, "updated_at": Utc::now() }),
                Some(&guard),
            )
            .await?;
        Ok(())
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(profile_id = %worker_id, error = %e, "Failed to record task completion");
    }
}

pub async fn delete_task(store: &dyn Store, task_id: Uuid, actor: &Actor) -> MarketResult<()> {
    let task = get_task(store, task_id).await?;
    check_delete(&task, actor.id())?;

    tracing::info!(actor_id = %actor.id(), task_id = %task.id, "Deleting task");
    let guard = Filter::is_null("accepted_user_id");
    store
        .delete(Collection::Tasks, task.id, Some(&guard))
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => {
                MarketError::conflict("a worker was accepted while the task was being deleted")
            }
            other => other.into(),
        })
}

/// Tasks the actor posted (`Role::Owner`) or works on (`Role::Worker`), newest first
pub async fn my_tasks(store: &dyn Store, actor: &Actor, role: Role) -> MarketResult<Vec<Task>> {
    let column = match role {
        Role::Owner => "owner_id",
        Role::Worker => "accepted_user_id",
    };
    let query = Query::new(Collection::Tasks)
        .filter(Filter::eq(column, actor.id()))
        .order_by("created_at", Direction::Desc);
    Ok(store.fetch(&query).await?)
}

/// Something the caller may do with a task right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskAction {
    PlaceBid,
    ManageBids,
    Delete,
    Chat,
    MarkDelivered,
    MarkDone,
    Rate { target: Uuid },
}

/// Facts about the caller that [`legal_actions`] cannot read off the task
#[derive(Debug, Clone, Copy, Default)]
pub struct ActorFacts {
    pub is_active: bool,
    pub has_pending_bid: bool,
    pub has_rated: bool,
}

pub fn legal_actions(task: &Task, actor_id: Uuid, facts: ActorFacts) -> Vec<TaskAction> {
    let mut actions = Vec::new();
    let role = role_of(task, actor_id);

    match role {
        None => {
            if task.status == TaskStatus::Open && facts.is_active && !facts.has_pending_bid {
                actions.push(TaskAction::PlaceBid);
            }
            return actions;
        }
        Some(Role::Owner) if task.status == TaskStatus::Open => {
            actions.push(TaskAction::ManageBids);
            if check_delete(task, actor_id).is_ok() {
                actions.push(TaskAction::Delete);
            }
        }
        Some(_) => {}
    }

    if task.status != TaskStatus::Open {
        actions.push(TaskAction::Chat);
    }
    for edge in TRANSITIONS.iter().filter(|t| t.trigger == Trigger::Advance) {
        if edge.from == task.status && Some(edge.role) == role {
            actions.push(match edge.to {
                TaskStatus::Delivered => TaskAction::MarkDelivered,
                _ => TaskAction::MarkDone,
            });
        }
    }
    if task.status == TaskStatus::Done && !facts.has_rated {
        let target = match role {
            Some(Role::Owner) => task.accepted_user_id,
            _ => Some(task.owner_id),
        };
        if let Some(target) = target {
            actions.push(TaskAction::Rate { target });
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Visibility;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn task(status: TaskStatus, owner: Uuid, worker: Option<Uuid>) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: "Proofread thesis".into(),
            description: String::new(),
            subject: "English".into(),
            budget: Decimal::from(40),
            deadline: now + Duration::days(3),
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
    fn only_the_table_defines_advances() {
        let (owner, worker) = (Uuid::new_v4(), Uuid::new_v4());

        let open = task(TaskStatus::Open, owner, None);
        assert!(matches!(
            check_advance(&open, TaskStatus::InProgress, owner),
            Err(MarketError::IllegalTransition(_))
        ));

        let done = task(TaskStatus::Done, owner, Some(worker));
        for to in [TaskStatus::Open, TaskStatus::InProgress, TaskStatus::Delivered] {
            assert!(matches!(
                check_advance(&done, to, owner),
                Err(MarketError::IllegalTransition(_))
            ));
        }

        let in_progress = task(TaskStatus::InProgress, owner, Some(worker));
        assert!(matches!(
            check_advance(&in_progress, TaskStatus::Done, owner),
            Err(MarketError::IllegalTransition(_))
        ));
    }

    #[test]
    fn edges_require_their_role() {
        let (owner, worker, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let in_progress = task(TaskStatus::InProgress, owner, Some(worker));
        assert!(check_advance(&in_progress, TaskStatus::Delivered, worker).is_ok());
        assert!(matches!(
            check_advance(&in_progress, TaskStatus::Delivered, owner),
            Err(MarketError::Authorization(_))
        ));

        let delivered = task(TaskStatus::Delivered, owner, Some(worker));
        assert!(check_advance(&delivered, TaskStatus::Done, owner).is_ok());
        assert!(matches!(
            check_advance(&delivered, TaskStatus::Done, stranger),
            Err(MarketError::Authorization(_))
        ));
    }

    #[test]
    fn new_tasks_are_validated() {
        let policy = MarketPolicy::default();
        let now = Utc::now();
        let req = |budget: i64, deadline: DateTime<Utc>, title: &str| CreateTaskRequest {
            title: title.into(),
            description: String::new(),
            subject: "Math".into(),
            budget: Decimal::from(budget),
            deadline,
            visibility: Visibility::Public,
            file_url: None,
            client_ref: None,
        };

        assert!(validate_new_task(&policy, &req(50, now + Duration::hours(1), "Calc"), now).is_ok());
        assert!(validate_new_task(&policy, &req(5, now + Duration::hours(1), "Calc"), now).is_err());
        assert!(validate_new_task(&policy, &req(50, now, "Calc"), now).is_err());
        assert!(validate_new_task(&policy, &req(50, now + Duration::hours(1), "  "), now).is_err());
    }

    #[test]
    fn deletion_needs_owner_and_no_worker() {
        let (owner, worker) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(check_delete(&task(TaskStatus::Open, owner, None), owner).is_ok());
        assert!(matches!(
            check_delete(&task(TaskStatus::Open, owner, None), worker),
            Err(MarketError::Authorization(_))
        ));
        assert!(matches!(
            check_delete(&task(TaskStatus::InProgress, owner, Some(worker)), owner),
            Err(MarketError::Conflict(_))
        ));
    }

    #[test]
    fn actions_follow_role_and_status() {
        let (owner, worker, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let facts = ActorFacts { is_active: true, ..Default::default() };

        let open = task(TaskStatus::Open, owner, None);
        assert_eq!(legal_actions(&open, owner, facts), vec![TaskAction::ManageBids, TaskAction::Delete]);
        assert_eq!(legal_actions(&open, stranger, facts), vec![TaskAction::PlaceBid]);
        let bidding = ActorFacts { has_pending_bid: true, ..facts };
        assert!(legal_actions(&open, stranger, bidding).is_empty());

        let in_progress = task(TaskStatus::InProgress, owner, Some(worker));
        assert_eq!(
            legal_actions(&in_progress, worker, facts),
            vec![TaskAction::Chat, TaskAction::MarkDelivered]
        );
        assert_eq!(legal_actions(&in_progress, owner, facts), vec![TaskAction::Chat]);
        assert!(legal_actions(&in_progress, stranger, facts).is_empty());

        let done = task(TaskStatus::Done, owner, Some(worker));
        assert_eq!(
            legal_actions(&done, worker, facts),
            vec![TaskAction::Chat, TaskAction::Rate { target: owner }]
        );
        let rated = ActorFacts { has_rated: true, ..facts };
        assert_eq!(legal_actions(&done, owner, rated), vec![TaskAction::Chat]);
    }

    mod flows {
        use super::*;
        use crate::domain::{Bid, BidStatus, CreateRatingRequest};
        use crate::services::feed::{public_feed, FeedParams};
        use crate::services::testing::{actor, assigned_task, bid_request, market, task_request};
        use crate::services::{bidding, ratings, stats};

        async fn in_feed(store: &dyn Store, id: Uuid) -> bool {
            let page = public_feed(store, &FeedParams::default(), &[]).await.expect("feed");
            page.data.iter().any(|entry| entry.task.id == id)
        }

        #[tokio::test]
        async fn posting_bidding_and_accepting() {
            let store = market();
            let owner = actor(&store, "owner").await;
            let worker = actor(&store, "worker").await;

            let mut req = task_request("Essay review", 500);
            req.deadline = Utc::now() + Duration::days(1);
            let task = create_task(&store, &MarketPolicy::default(), &owner, req).await.expect("post");
            assert_eq!(task.status, TaskStatus::Open);
            assert_eq!(task.accepted_user_id, None);
            assert!(in_feed(&store, task.id).await);

            let bid = bidding::submit_bid(&store, task.id, &worker, bid_request(450))
                .await
                .expect("bid");
            assert_eq!(bid.status, BidStatus::Pending);

            bidding::accept_bid(&store, &MarketPolicy::default(), bid.id, &owner)
                .await
                .expect("accept");
            let task = get_task(&store, task.id).await.expect("task");
            assert_eq!(task.status, TaskStatus::InProgress);
            assert_eq!(task.accepted_user_id, Some(worker.id()));
            let bid: Bid = store.get(Collection::Bids, bid.id).await.expect("bid");
            assert_eq!(bid.status, BidStatus::Accepted);
            assert!(!in_feed(&store, task.id).await);
        }

        #[tokio::test]
        async fn delivery_and_completion_prompt_the_owner_to_rate() {
            let store = market();
            let owner = actor(&store, "owner").await;
            let worker = actor(&store, "worker").await;
            let task = assigned_task(&store, &owner, &worker).await;

            let delivered = advance_status(&store, task.id, TaskStatus::Delivered, &worker)
                .await
                .expect("deliver");
            assert_eq!(delivered.task.status, TaskStatus::Delivered);
            assert!(delivered.rating_prompt.is_none());

            let done = advance_status(&store, task.id, TaskStatus::Done, &owner)
                .await
                .expect("complete");
            assert_eq!(done.task.status, TaskStatus::Done);
            let prompt = done.rating_prompt.expect("rating prompt");
            assert_eq!(prompt.rater_id, owner.id());
            assert_eq!(prompt.ratee_id, worker.id());

            let profile: Profile = store.get(Collection::Profiles, worker.id()).await.expect("worker");
            assert_eq!(profile.completed_tasks, 1);
        }

        #[tokio::test]
        async fn strangers_cannot_deliver_someone_elses_task() {
            let store = market();
            let owner = actor(&store, "owner").await;
            let worker = actor(&store, "worker").await;
            let other = actor(&store, "other").await;
            let task = assigned_task(&store, &owner, &worker).await;

            let result = advance_status(&store, task.id, TaskStatus::Delivered, &other).await;
            assert!(matches!(result, Err(MarketError::Authorization(_))));
            let task = get_task(&store, task.id).await.expect("task");
            assert_eq!(task.status, TaskStatus::InProgress);
        }

        #[tokio::test]
        async fn a_second_acceptance_leaves_the_first_intact() {
            let store = market();
            let owner = actor(&store, "owner").await;
            let (first, second) = (actor(&store, "first").await, actor(&store, "second").await);
            let policy = MarketPolicy {
                auto_reject_pending_bids: false,
                ..MarketPolicy::default()
            };
            let task = create_task(&store, &policy, &owner, task_request("Lab report", 80))
                .await
                .expect("post");
            let winner = bidding::submit_bid(&store, task.id, &first, bid_request(70)).await.expect("bid");
            let loser = bidding::submit_bid(&store, task.id, &second, bid_request(60)).await.expect("bid");
            bidding::accept_bid(&store, &policy, winner.id, &owner).await.expect("accept");

            let again = bidding::accept_bid(&store, &policy, loser.id, &owner).await;
            assert!(matches!(again, Err(MarketError::Conflict(_))));

            let task = get_task(&store, task.id).await.expect("task");
            assert_eq!(task.accepted_user_id, Some(first.id()));
            let winner: Bid = store.get(Collection::Bids, winner.id).await.expect("bid");
            assert_eq!(winner.status, BidStatus::Accepted);
            let loser: Bid = store.get(Collection::Bids, loser.id).await.expect("bid");
            assert_eq!(loser.status, BidStatus::Pending);
        }

        #[tokio::test]
        async fn finished_tasks_are_rated_once_per_side() {
            let store = market();
            let owner = actor(&store, "owner").await;
            let worker = actor(&store, "worker").await;
            let task = assigned_task(&store, &owner, &worker).await;
            advance_status(&store, task.id, TaskStatus::Delivered, &worker).await.expect("deliver");

            let stars = |stars: i16| CreateRatingRequest { stars, comment: String::new() };
            let early = ratings::rate(&store, task.id, &owner, stars(5)).await;
            assert!(matches!(early, Err(MarketError::Conflict(_))));

            advance_status(&store, task.id, TaskStatus::Done, &owner).await.expect("complete");
            ratings::rate(&store, task.id, &owner, stars(5)).await.expect("owner rates");
            ratings::rate(&store, task.id, &worker, stars(4)).await.expect("worker rates");

            let twice = ratings::rate(&store, task.id, &owner, stars(3)).await;
            assert!(matches!(twice, Err(MarketError::Conflict(_))));

            let rated: Profile = store.get(Collection::Profiles, worker.id()).await.expect("worker");
            assert_eq!(rated.rating, 5.0);
            let summary = stats::user_stats(&store, worker.id()).await.expect("stats");
            assert_eq!(summary.completed_count, 1);
            assert_eq!(summary.total_earned, task.budget);
        }

        #[tokio::test]
        async fn assigned_tasks_cannot_be_deleted() {
            let store = market();
            let owner = actor(&store, "owner").await;
            let worker = actor(&store, "worker").await;
            let task = assigned_task(&store, &owner, &worker).await;

            let result = delete_task(&store, task.id, &owner).await;
            assert!(matches!(result, Err(MarketError::Conflict(_))));

            let open = create_task(&store, &MarketPolicy::default(), &owner, task_request("Spare", 20))
                .await
                .expect("post");
            bidding::submit_bid(&store, open.id, &worker, bid_request(20)).await.expect("bid");
            delete_task(&store, open.id, &owner).await.expect("delete");
            assert!(matches!(get_task(&store, open.id).await, Err(MarketError::NotFound(_))));
            let remaining: Vec<Bid> = store.fetch(&bidding::bids_query(open.id)).await.expect("bids");
            assert!(remaining.is_empty());
        }
    }
}
