//! Bid routes

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::live;
use crate::api::{Created, DataResponse, NoContent};
use crate::app::AppState;
use crate::auth::RequireActor;
use crate::domain::{Bid, BidWithBidder, CreateBidRequest};
use crate::error::{MarketError, MarketResult};
use crate::services::bidding::{self, Acceptance};
use crate::services::lifecycle;

/// GET /tasks/:task_id/bids
///
/// All bids on the task, for its owner.
pub async fn list_bids(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<BidWithBidder>>> {
    Ok(DataResponse::new(
        bidding::list_bids(state.store.as_ref(), task_id, &actor).await?,
    ))
}

/// GET /tasks/:task_id/bids/mine
pub async fn my_bids(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<Bid>>> {
    Ok(DataResponse::new(
        bidding::my_bids(state.store.as_ref(), task_id, &actor).await?,
    ))
}

/// GET /tasks/:task_id/bids/live
pub async fn live_bids(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<impl IntoResponse> {
    let task = lifecycle::get_task(state.store.as_ref(), task_id).await?;
    if !task.is_owner(actor.id()) {
        return Err(MarketError::forbidden("only the task owner can watch its bids"));
    }
    live::open::<Bid>(&state, bidding::bids_query(task.id)).await
}

/// POST /tasks/:task_id/bids
pub async fn submit_bid(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(req): Json<CreateBidRequest>,
) -> MarketResult<Created<Bid>> {
    let bid = bidding::submit_bid(state.store.as_ref(), task_id, &actor, req).await?;
    Ok(Created(bid))
}

/// POST /bids/:bid_id/accept
pub async fn accept_bid(
    State(state): State<Arc<AppState>>,
    Path(bid_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Acceptance>> {
    let acceptance =
        bidding::accept_bid(state.store.as_ref(), &state.settings.policy, bid_id, &actor).await?;
    Ok(DataResponse::new(acceptance))
}

/// POST /bids/:bid_id/reject
pub async fn reject_bid(
    State(state): State<Arc<AppState>>,
    Path(bid_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Bid>> {
    Ok(DataResponse::new(
        bidding::reject_bid(state.store.as_ref(), bid_id, &actor).await?,
    ))
}

/// DELETE /bids/:bid_id
pub async fn withdraw_bid(
    State(state): State<Arc<AppState>>,
    Path(bid_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<NoContent> {
    bidding::withdraw_bid(state.store.as_ref(), bid_id, &actor).await?;
    Ok(NoContent)
}
