//! Task routes
//!
//! Feed, posting, lifecycle changes, attachments and ratings.

use axum::{
    extract::{Multipart, Path, Query, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::{live, read_file};
use crate::api::{Created, DataResponse, NoContent, Paginated};
use crate::app::AppState;
use crate::auth::{RequireActor, RequireAuth};
use crate::domain::{
    AdvanceStatusRequest, CreateRatingRequest, CreateTaskRequest, Rating, Task, TaskAttachment,
    TaskDetail, TaskWithOwner,
};
use crate::error::MarketResult;
use crate::services::feed::{self, FeedParams};
use crate::services::lifecycle::{self, ActorFacts, StatusChange, TaskAction};
use crate::services::{attachments, bidding, ratings};

/// GET /tasks
///
/// Public OPEN feed. Signed-in callers with skills get matching tasks first.
pub async fn list_feed(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FeedParams>,
    actor: Option<RequireActor>,
) -> MarketResult<Paginated<TaskWithOwner>> {
    let skills = actor.map(|a| a.0.profile.skills).unwrap_or_default();
    feed::public_feed(state.store.as_ref(), &params, &skills).await
}

/// GET /tasks/live
///
/// The requested page of the feed as a live SSE stream. The view holds at
/// most `per_page` rows; newer tasks push the oldest out.
pub async fn live_feed(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FeedParams>,
    _auth: RequireAuth,
) -> MarketResult<impl IntoResponse> {
    let pagination = params.pagination();
    let query = feed::feed_query(&params).range(pagination.offset(), pagination.limit());
    live::open::<Task>(&state, query).await
}

/// POST /tasks
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    RequireActor(actor): RequireActor,
    Json(req): Json<CreateTaskRequest>,
) -> MarketResult<Created<Task>> {
    let task = lifecycle::create_task(state.store.as_ref(), &state.settings.policy, &actor, req).await?;
    Ok(Created(task))
}

/// GET /tasks/:task_id
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<DataResponse<TaskDetail>> {
    Ok(DataResponse::new(
        lifecycle::task_detail(state.store.as_ref(), task_id).await?,
    ))
}

/// DELETE /tasks/:task_id
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<NoContent> {
    lifecycle::delete_task(state.store.as_ref(), task_id, &actor).await?;
    Ok(NoContent)
}

/// GET /tasks/:task_id/actions
///
/// What the caller may do with the task right now.
pub async fn get_actions(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<TaskAction>>> {
    let store = state.store.as_ref();
    let task = lifecycle::get_task(store, task_id).await?;
    let facts = ActorFacts {
        is_active: actor.is_active(),
        has_pending_bid: bidding::pending_bid_for(store, task.id, actor.id()).await?.is_some(),
        has_rated: ratings::has_rated(store, task.id, actor.id()).await?,
    };
    Ok(DataResponse::new(lifecycle::legal_actions(&task, actor.id(), facts)))
}

/// POST /tasks/:task_id/status
pub async fn advance_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(req): Json<AdvanceStatusRequest>,
) -> MarketResult<DataResponse<StatusChange>> {
    let change = lifecycle::advance_status(state.store.as_ref(), task_id, req.status, &actor).await?;
    Ok(DataResponse::new(change))
}

/// GET /tasks/:task_id/attachments
pub async fn list_attachments(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<DataResponse<Vec<TaskAttachment>>> {
    Ok(DataResponse::new(
        attachments::list_attachments(state.store.as_ref(), task_id).await?,
    ))
}

/// POST /tasks/:task_id/attachments (multipart, field `file`)
pub async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    multipart: Multipart,
) -> MarketResult<Created<TaskAttachment>> {
    let upload = read_file(multipart).await?;
    let attachment = attachments::upload_attachment(
        state.store.as_ref(),
        state.objects.as_ref(),
        task_id,
        &actor,
        upload,
        state.settings.policy.max_upload_bytes,
    )
    .await?;
    Ok(Created(attachment))
}

/// POST /tasks/:task_id/ratings
pub async fn rate_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(req): Json<CreateRatingRequest>,
) -> MarketResult<Created<Rating>> {
    let rating = ratings::rate(state.store.as_ref(), task_id, &actor, req).await?;
    Ok(Created(rating))
}
