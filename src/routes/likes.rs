//! Task like routes

use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use std::sync::Arc;
use uuid::Uuid;

use super::live;
use crate::api::DataResponse;
use crate::app::AppState;
use crate::auth::{RequireActor, RequireAuth};
use crate::domain::{Like, LikeStatus};
use crate::error::MarketResult;
use crate::services::{lifecycle, likes};

/// GET /tasks/:task_id/likes
pub async fn like_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<LikeStatus>> {
    Ok(DataResponse::new(
        likes::like_status(state.store.as_ref(), task_id, actor.id()).await?,
    ))
}

/// POST /tasks/:task_id/likes
///
/// Likes the task, or takes the like back if the caller already gave one.
pub async fn toggle_like(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<LikeStatus>> {
    Ok(DataResponse::new(
        likes::toggle_like(state.store.as_ref(), task_id, &actor).await?,
    ))
}

/// GET /tasks/:task_id/likes/live
pub async fn live_likes(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<impl IntoResponse> {
    let task = lifecycle::get_task(state.store.as_ref(), task_id).await?;
    live::open::<Like>(&state, likes::likes_query(task.id)).await
}
