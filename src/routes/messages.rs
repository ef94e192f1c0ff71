//! Task chat routes

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::live;
use crate::api::{Created, DataResponse};
use crate::app::AppState;
use crate::auth::RequireActor;
use crate::domain::{Message, MessageWithSender, SendMessageRequest};
use crate::error::MarketResult;
use crate::services::{chat, lifecycle};

/// GET /tasks/:task_id/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<MessageWithSender<Message>>>> {
    Ok(DataResponse::new(
        chat::list_messages(state.store.as_ref(), task_id, &actor).await?,
    ))
}

/// POST /tasks/:task_id/messages
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(req): Json<SendMessageRequest>,
) -> MarketResult<Created<Message>> {
    let message = chat::send_message(state.store.as_ref(), task_id, &actor, req).await?;
    Ok(Created(message))
}

/// GET /tasks/:task_id/messages/live
pub async fn live_messages(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<impl IntoResponse> {
    let task = lifecycle::get_task(state.store.as_ref(), task_id).await?;
    chat::check_participant(&task, actor.id())?;
    live::open::<Message>(&state, chat::messages_query(task.id)).await
}
