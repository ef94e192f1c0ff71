//! Comment routes

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::live;
use crate::api::{Created, DataResponse};
use crate::app::AppState;
use crate::auth::{RequireActor, RequireAuth};
use crate::domain::{Comment, CommentNode, CreateCommentRequest, UpdateCommentRequest};
use crate::error::MarketResult;
use crate::services::{comments, lifecycle};

/// GET /tasks/:task_id/comments
///
/// The task's comments as reply trees.
pub async fn list_comments(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<DataResponse<Vec<CommentNode>>> {
    Ok(DataResponse::new(
        comments::list_comments(state.store.as_ref(), task_id).await?,
    ))
}

/// GET /tasks/:task_id/comments/live
///
/// Flat, creation-ordered comments; clients build the tree.
pub async fn live_comments(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<impl IntoResponse> {
    let task = lifecycle::get_task(state.store.as_ref(), task_id).await?;
    live::open::<Comment>(&state, comments::comments_query(task.id)).await
}

/// POST /tasks/:task_id/comments
pub async fn create_comment(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(req): Json<CreateCommentRequest>,
) -> MarketResult<Created<Comment>> {
    let comment = comments::create_comment(state.store.as_ref(), task_id, &actor, req).await?;
    Ok(Created(comment))
}

/// PATCH /comments/:comment_id
pub async fn edit_comment(
    State(state): State<Arc<AppState>>,
    Path(comment_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(req): Json<UpdateCommentRequest>,
) -> MarketResult<DataResponse<Comment>> {
    Ok(DataResponse::new(
        comments::edit_comment(state.store.as_ref(), comment_id, &actor, req).await?,
    ))
}

#[derive(Serialize)]
pub struct DeletedComments {
    pub deleted: usize,
}

/// DELETE /comments/:comment_id
///
/// Removes the comment and all of its replies.
pub async fn delete_comment(
    State(state): State<Arc<AppState>>,
    Path(comment_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<DeletedComments>> {
    let deleted = comments::delete_comment(state.store.as_ref(), comment_id, &actor).await?;
    Ok(DataResponse::new(DeletedComments { deleted }))
}
