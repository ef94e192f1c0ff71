//! Bid resolution
//!
//! Competing bids on one task collapse to at most one accepted bid. The
//! acceptance and the task's move to IN_PROGRESS are a single store
//! procedure; there is no client-side two-step path.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use super::lifecycle::{self, get_task};
use super::{activity, client_ref_or_new, load, notifications, profiles};
use crate::auth::Actor;
use crate::config::MarketPolicy;
use crate::domain::{Bid, BidStatus, BidWithBidder, CreateBidRequest, Task, TaskStatus};
use crate::error::{MarketError, MarketResult};
use crate::store::{
    decode, AcceptBidOutcome, Collection, Direction, Filter, Procedure, Query, Store, StoreError,
    StoreExt,
};

/// The bidder's pending bid on a task, if any
pub async fn pending_bid_for(
    store: &dyn Store,
    task_id: Uuid,
    bidder_id: Uuid,
) -> MarketResult<Option<Bid>> {
    let query = Query::new(Collection::Bids).filter(
        Filter::eq("task_id", task_id)
            .and(Filter::eq("bidder_id", bidder_id))
            .and(Filter::eq("status", BidStatus::Pending.as_str())),
    );
    Ok(store.fetch_one(&query).await?)
}

/// Checks that need only the task and the request
pub fn check_submit(task: &Task, actor: &Actor, req: &CreateBidRequest) -> MarketResult<()> {
    if !actor.is_active() {
        return Err(MarketError::forbidden("deactivated profiles cannot bid"));
    }
    if req.proposed_budget <= Decimal::ZERO {
        return Err(MarketError::validation("proposed budget must be positive"));
    }
    if let Some(deadline) = req.proposed_deadline {
        if deadline <= Utc::now() {
            return Err(MarketError::validation("proposed deadline must be in the future"));
        }
    }
    if task.status != TaskStatus::Open {
        return Err(MarketError::conflict("task is not accepting bids"));
    }
    if task.is_owner(actor.id()) {
        return Err(MarketError::conflict("you cannot bid on your own task"));
    }
    Ok(())
}

/// Build the row a submission would insert, without storing it.
pub fn provisional_bid(task_id: Uuid, actor: &Actor, req: CreateBidRequest) -> Bid {
    let now = Utc::now();
    Bid {
        id: Uuid::new_v4(),
        task_id,
        bidder_id: actor.id(),
        proposed_budget: req.proposed_budget,
        proposed_deadline: req.proposed_deadline,
        message: req.message.trim().to_string(),
        status: BidStatus::Pending,
        client_ref: client_ref_or_new(req.client_ref),
        created_at: now,
        updated_at: now,
    }
}

pub async fn submit_bid(
    store: &dyn Store,
    task_id: Uuid,
    actor: &Actor,
    req: CreateBidRequest,
) -> MarketResult<Bid> {
    let task = get_task(store, task_id).await?;
    check_submit(&task, actor, &req)?;
    if pending_bid_for(store, task.id, actor.id()).await?.is_some() {
        return Err(MarketError::conflict("you already have a pending bid on this task"));
    }
    insert_bid(store, &task, actor, provisional_bid(task.id, actor, req)).await
}

/// Store an already-built bid. The store enforces pending uniqueness and the
/// OPEN guard again, so racing submissions still collapse to one.
pub async fn insert_bid(store: &dyn Store, task: &Task, actor: &Actor, bid: Bid) -> MarketResult<Bid> {
    tracing::info!(
        actor_id = %actor.id(),
        task_id = %task.id,
        bid_id = %bid.id,
        proposed_budget = %bid.proposed_budget,
        "Submitting bid"
    );
    let saved: Bid = store.create(Collection::Bids, &bid).await?;
    activity::bid_placed(store, task, saved.bidder_id, saved.proposed_budget).await;
    notifications::notify_bid_received(store, task, &saved, &actor.profile.username).await;
    Ok(saved)
}

/// Accepted bid together with the task it assigned
#[derive(Debug, Clone, serde::Serialize)]
pub struct Acceptance {
    pub task: Task,
    pub bid: Bid,
    pub rejected_bid_ids: Vec<Uuid>,
}

pub async fn accept_bid(
    store: &dyn Store,
    policy: &MarketPolicy,
    bid_id: Uuid,
    actor: &Actor,
) -> MarketResult<Acceptance> {
    let bid: Bid = load(store, Collection::Bids, bid_id, "Bid").await?;
    let task = get_task(store, bid.task_id).await?;

    // Locally knowable preconditions; the procedure re-checks all of them under lock
    if !task.is_owner(actor.id()) {
        return Err(MarketError::forbidden("only the task owner can accept bids"));
    }
    if lifecycle::transition(task.status, TaskStatus::InProgress).is_none() {
        return Err(MarketError::conflict("task is no longer open"));
    }
    if bid.status != BidStatus::Pending {
        return Err(MarketError::conflict("bid is not pending"));
    }

    tracing::info!(
        actor_id = %actor.id(),
        task_id = %task.id,
        bid_id = %bid.id,
        "Accepting bid"
    );

    let outcome: AcceptBidOutcome = decode(
        store
            .transaction(Procedure::AcceptBid {
                bid_id: bid.id,
                owner_id: actor.id(),
                reject_other_pending: policy.auto_reject_pending_bids,
            })
            .await?,
    )?;
    let acceptance = Acceptance {
        task: decode(outcome.task)?,
        bid: decode(outcome.bid)?,
        rejected_bid_ids: outcome.rejected_bid_ids,
    };

    activity::task_accepted(store, &acceptance.task, acceptance.bid.bidder_id).await;
    notifications::notify_bid_accepted(store, &acceptance.task, &acceptance.bid).await;
    notify_rejected_bidders(store, &acceptance).await;

    Ok(acceptance)
}

/// Tell the auto-rejected bidders. The acceptance has committed by now, so a
/// failed lookup only costs the notifications.
async fn notify_rejected_bidders(store: &dyn Store, acceptance: &Acceptance) {
    if acceptance.rejected_bid_ids.is_empty() {
        return;
    }
    let query = Query::new(Collection::Bids).filter(Filter::is_in(
        "id",
        acceptance.rejected_bid_ids.iter().copied(),
    ));
    let rejected: Vec<Bid> = match store.fetch(&query).await {
        Ok(rejected) => rejected,
        Err(e) => {
            tracing::warn!(
                task_id = %acceptance.task.id,
                rejected = acceptance.rejected_bid_ids.len(),
                error = %e,
                "Could not load rejected bids to notify their bidders"
            );
            return;
        }
    };
    for other in rejected {
        notifications::notify_bid_rejected(store, &acceptance.task, other.bidder_id, other.id).await;
    }
}

pub async fn reject_bid(store: &dyn Store, bid_id: Uuid, actor: &Actor) -> MarketResult<Bid> {
    let bid: Bid = load(store, Collection::Bids, bid_id, "Bid").await?;
    let task = get_task(store, bid.task_id).await?;
    if !task.is_owner(actor.id()) {
        return Err(MarketError::forbidden("only the task owner can reject bids"));
    }
    if bid.status != BidStatus::Pending {
        return Err(MarketError::conflict("bid is not pending"));
    }

    tracing::info!(actor_id = %actor.id(), task_id = %task.id, bid_id = %bid.id, "Rejecting bid");
    let guard = Filter::eq("status", BidStatus::Pending.as_str());
    let rejected: Bid = store
        .patch(
            Collection::Bids,
            bid.id,
            json!({ "status": BidStatus::Rejected.as_str(), "updated_at": Utc::now() }),
            Some(&guard),
        )
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => MarketError::conflict("bid is not pending"),
            other => other.into(),
        })?;

    notifications::notify_bid_rejected(store, &task, rejected.bidder_id, rejected.id).await;
    Ok(rejected)
}

/// Withdraw a pending bid. The row is deleted.
pub async fn withdraw_bid(store: &dyn Store, bid_id: Uuid, actor: &Actor) -> MarketResult<()> {
    let bid: Bid = load(store, Collection::Bids, bid_id, "Bid").await?;
    if bid.bidder_id != actor.id() {
        return Err(MarketError::forbidden("only the bidder can withdraw a bid"));
    }
    if bid.status != BidStatus::Pending {
        return Err(MarketError::conflict("only pending bids can be withdrawn"));
    }

    tracing::info!(actor_id = %actor.id(), task_id = %bid.task_id, bid_id = %bid.id, "Withdrawing bid");
    let guard = Filter::eq("status", BidStatus::Pending.as_str());
    store
        .delete(Collection::Bids, bid.id, Some(&guard))
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => MarketError::conflict("only pending bids can be withdrawn"),
            other => other.into(),
        })?;

    if let Ok(task) = get_task(store, bid.task_id).await {
        notifications::notify_bid_withdrawn(store, &task, &bid).await;
    }
    Ok(())
}

/// The query behind a task's bid list, newest first
pub fn bids_query(task_id: Uuid) -> Query {
    Query::new(Collection::Bids)
        .filter(Filter::eq("task_id", task_id))
        .order_by("created_at", Direction::Desc)
}

/// All bids on a task, visible to its owner only
pub async fn list_bids(store: &dyn Store, task_id: Uuid, actor: &Actor) -> MarketResult<Vec<BidWithBidder>> {
    let task = get_task(store, task_id).await?;
    if !task.is_owner(actor.id()) {
        return Err(MarketError::forbidden("only the task owner can see its bids"));
    }
    let bids: Vec<Bid> = store.fetch(&bids_query(task.id)).await?;
    with_bidders(store, bids).await
}

/// The caller's own bids on a task, newest first
pub async fn my_bids(store: &dyn Store, task_id: Uuid, actor: &Actor) -> MarketResult<Vec<Bid>> {
    let query = bids_query(task_id).filter(Filter::eq("bidder_id", actor.id()));
    Ok(store.fetch(&query).await?)
}

async fn with_bidders(store: &dyn Store, bids: Vec<Bid>) -> MarketResult<Vec<BidWithBidder>> {
    let people = profiles::summaries(store, bids.iter().map(|b| b.bidder_id)).await?;
    Ok(bids
        .into_iter()
        .map(|bid| BidWithBidder {
            bidder: people.get(&bid.bidder_id).cloned(),
            bid,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{actor, assigned_task, bid_request, market, open_task, FlakyReads};

    #[tokio::test]
    async fn acceptance_stands_when_the_rejected_bid_lookup_fails() {
        let flaky = FlakyReads::new(market());
        let store = &flaky.inner;
        let owner = actor(store, "owner").await;
        let (alice, bob) = (actor(store, "alice").await, actor(store, "bob").await);
        let task = open_task(store, &owner).await;
        let a = submit_bid(store, task.id, &alice, bid_request(40)).await.expect("alice bids");
        let b = submit_bid(store, task.id, &bob, bid_request(35)).await.expect("bob bids");

        flaky.arm();
        let acceptance = accept_bid(&flaky, &MarketPolicy::default(), a.id, &owner)
            .await
            .expect("committed acceptance is reported as such");
        assert_eq!(acceptance.rejected_bid_ids, vec![b.id]);

        let saved: Task = store.get(Collection::Tasks, task.id).await.expect("task");
        assert_eq!(saved.status, TaskStatus::InProgress);
        assert_eq!(saved.accepted_user_id, Some(alice.id()));
    }

    #[tokio::test]
    async fn accepting_one_bid_assigns_the_task_and_rejects_the_rest() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let (alice, bob) = (actor(&store, "alice").await, actor(&store, "bob").await);
        let task = open_task(&store, &owner).await;

        let a = submit_bid(&store, task.id, &alice, bid_request(40)).await.expect("alice bids");
        let b = submit_bid(&store, task.id, &bob, bid_request(35)).await.expect("bob bids");

        let acceptance = accept_bid(&store, &MarketPolicy::default(), a.id, &owner)
            .await
            .expect("accept");
        assert_eq!(acceptance.task.status, TaskStatus::InProgress);
        assert_eq!(acceptance.task.accepted_user_id, Some(alice.id()));
        assert_eq!(acceptance.bid.status, BidStatus::Accepted);
        assert_eq!(acceptance.rejected_bid_ids, vec![b.id]);

        let loser: Bid = store.get(Collection::Bids, b.id).await.expect("bob's bid");
        assert_eq!(loser.status, BidStatus::Rejected);

        let late = accept_bid(&store, &MarketPolicy::default(), b.id, &owner).await;
        assert!(matches!(late, Err(MarketError::Conflict(_))));
    }

    #[tokio::test]
    async fn concurrent_accepts_resolve_to_exactly_one_winner() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let (alice, bob) = (actor(&store, "alice").await, actor(&store, "bob").await);
        let task = open_task(&store, &owner).await;
        let a = submit_bid(&store, task.id, &alice, bid_request(40)).await.expect("alice bids");
        let b = submit_bid(&store, task.id, &bob, bid_request(35)).await.expect("bob bids");

        let policy = MarketPolicy::default();
        let (first, second) = tokio::join!(
            accept_bid(&store, &policy, a.id, &owner),
            accept_bid(&store, &policy, b.id, &owner),
        );

        let winners = [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1);
        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(loser, Err(MarketError::Conflict(_))));

        let bids: Vec<Bid> = store.fetch(&bids_query(task.id)).await.expect("bids");
        let accepted = bids.iter().filter(|b| b.status == BidStatus::Accepted).count();
        assert_eq!(accepted, 1);
        let task = get_task(&store, task.id).await.expect("task");
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn other_bids_stay_pending_without_auto_reject() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let (alice, bob) = (actor(&store, "alice").await, actor(&store, "bob").await);
        let task = open_task(&store, &owner).await;
        let a = submit_bid(&store, task.id, &alice, bid_request(40)).await.expect("alice bids");
        let b = submit_bid(&store, task.id, &bob, bid_request(35)).await.expect("bob bids");

        let policy = MarketPolicy {
            auto_reject_pending_bids: false,
            ..MarketPolicy::default()
        };
        let acceptance = accept_bid(&store, &policy, a.id, &owner).await.expect("accept");
        assert!(acceptance.rejected_bid_ids.is_empty());

        let other: Bid = store.get(Collection::Bids, b.id).await.expect("bob's bid");
        assert_eq!(other.status, BidStatus::Pending);
    }

    #[tokio::test]
    async fn one_pending_bid_per_bidder() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let alice = actor(&store, "alice").await;
        let task = open_task(&store, &owner).await;

        let bid = submit_bid(&store, task.id, &alice, bid_request(40)).await.expect("first bid");
        let again = submit_bid(&store, task.id, &alice, bid_request(30)).await;
        assert!(matches!(again, Err(MarketError::Conflict(_))));

        // A second insert that skipped the lookup still collapses
        let raced = insert_bid(&store, &task, &alice, provisional_bid(task.id, &alice, bid_request(30))).await;
        assert!(matches!(raced, Err(MarketError::Conflict(_))));

        withdraw_bid(&store, bid.id, &alice).await.expect("withdraw");
        submit_bid(&store, task.id, &alice, bid_request(30))
            .await
            .expect("bid after withdrawing");
    }

    #[tokio::test]
    async fn owners_and_closed_tasks_do_not_take_bids() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let (alice, bob) = (actor(&store, "alice").await, actor(&store, "bob").await);

        let open = open_task(&store, &owner).await;
        let own = submit_bid(&store, open.id, &owner, bid_request(40)).await;
        assert!(matches!(own, Err(MarketError::Conflict(_))));

        let assigned = assigned_task(&store, &owner, &alice).await;
        let late = submit_bid(&store, assigned.id, &bob, bid_request(40)).await;
        assert!(matches!(late, Err(MarketError::Conflict(_))));

        let free = submit_bid(&store, open.id, &bob, bid_request(0)).await;
        assert!(matches!(free, Err(MarketError::Validation(_))));
    }

    #[tokio::test]
    async fn only_the_owner_resolves_bids() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let (alice, bob) = (actor(&store, "alice").await, actor(&store, "bob").await);
        let task = open_task(&store, &owner).await;
        let bid = submit_bid(&store, task.id, &alice, bid_request(40)).await.expect("bid");

        let by_bob = accept_bid(&store, &MarketPolicy::default(), bid.id, &bob).await;
        assert!(matches!(by_bob, Err(MarketError::Authorization(_))));
        let by_alice = reject_bid(&store, bid.id, &alice).await;
        assert!(matches!(by_alice, Err(MarketError::Authorization(_))));
        assert!(matches!(
            list_bids(&store, task.id, &bob).await,
            Err(MarketError::Authorization(_))
        ));

        let rejected = reject_bid(&store, bid.id, &owner).await.expect("reject");
        assert_eq!(rejected.status, BidStatus::Rejected);
        let withdraw = withdraw_bid(&store, bid.id, &alice).await;
        assert!(matches!(withdraw, Err(MarketError::Conflict(_))));
    }

    #[tokio::test]
    async fn bidders_hear_about_the_outcome() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let (alice, bob) = (actor(&store, "alice").await, actor(&store, "bob").await);
        let task = open_task(&store, &owner).await;
        let a = submit_bid(&store, task.id, &alice, bid_request(40)).await.expect("alice bids");
        submit_bid(&store, task.id, &bob, bid_request(35)).await.expect("bob bids");
        accept_bid(&store, &MarketPolicy::default(), a.id, &owner).await.expect("accept");

        let inbox = |id: Uuid| {
            Query::new(Collection::Notifications)
                .filter(Filter::eq("user_id", id))
        };
        assert_eq!(store.query(&inbox(owner.id())).await.expect("owner").len(), 2);
        assert_eq!(store.query(&inbox(alice.id())).await.expect("alice").len(), 1);
        assert_eq!(store.query(&inbox(bob.id())).await.expect("bob").len(), 1);
    }

    #[tokio::test]
    async fn owner_bid_list_tracks_submissions_and_acceptance() {
        use crate::sync::LiveView;
        use std::sync::Arc;
        use std::time::Duration;

        let memory = Arc::new(market());
        let owner = actor(&memory, "owner").await;
        let (alice, bob) = (actor(&memory, "alice").await, actor(&memory, "bob").await);
        let task = open_task(&memory, &owner).await;

        let view: LiveView<Bid> = LiveView::open(memory.clone(), memory.clone(), bids_query(task.id))
            .await
            .expect("open view");
        let mut revisions = view.watch();

        // Alice's client shows her bid before the store confirms it
        let provisional = provisional_bid(task.id, &alice, bid_request(40));
        let commit = {
            let (store, task, alice, bid) = (memory.clone(), task.clone(), alice.clone(), provisional.clone());
            async move { insert_bid(store.as_ref(), &task, &alice, bid).await }
        };
        let mine = view.insert_optimistic(provisional, commit).await.expect("alice bids");

        let theirs = submit_bid(memory.as_ref(), task.id, &bob, bid_request(35)).await.expect("bob bids");
        accept_bid(memory.as_ref(), &MarketPolicy::default(), mine.id, &owner)
            .await
            .expect("accept");

        let settled = |view: &LiveView<Bid>| {
            view.get(theirs.id).map(|b| b.status) == Some(BidStatus::Rejected)
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while !settled(&view) {
                if revisions.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("rejection reached the view");

        assert_eq!(view.len(), 2);
        assert_eq!(view.get(mine.id).map(|b| b.status), Some(BidStatus::Accepted));
    }
}
