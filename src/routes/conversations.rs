//! Direct message routes

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
use crate::auth::RequireActor;
use crate::domain::{
    Conversation, ConversationSummary, DirectMessage, MessageWithSender, SendMessageRequest,
    StartConversationRequest,
};
use crate::error::MarketResult;
use crate::services::conversations;

/// GET /conversations
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<ConversationSummary>>> {
    Ok(DataResponse::new(
        conversations::list_conversations(state.store.as_ref(), &actor).await?,
    ))
}

/// POST /conversations
///
/// Returns the existing conversation with that user, or starts one.
pub async fn start_conversation(
    State(state): State<Arc<AppState>>,
    RequireActor(actor): RequireActor,
    Json(req): Json<StartConversationRequest>,
) -> MarketResult<DataResponse<Conversation>> {
    Ok(DataResponse::new(
        conversations::start_conversation(state.store.as_ref(), &actor, req).await?,
    ))
}

/// GET /conversations/:conversation_id/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<MessageWithSender<DirectMessage>>>> {
    Ok(DataResponse::new(
        conversations::list_direct_messages(state.store.as_ref(), conversation_id, &actor).await?,
    ))
}

/// POST /conversations/:conversation_id/messages
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(req): Json<SendMessageRequest>,
) -> MarketResult<Created<DirectMessage>> {
    let message =
        conversations::send_direct_message(state.store.as_ref(), conversation_id, &actor, req).await?;
    Ok(Created(message))
}

/// GET /conversations/:conversation_id/messages/live
pub async fn live_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<impl IntoResponse> {
    conversations::membership(state.store.as_ref(), conversation_id, actor.id()).await?;
    live::open::<DirectMessage>(&state, conversations::direct_messages_query(conversation_id)).await
}

#[derive(Serialize)]
pub struct MarkedRead {
    pub marked: usize,
}

/// POST /conversations/:conversation_id/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<MarkedRead>> {
    let marked = conversations::mark_read(state.store.as_ref(), conversation_id, &actor).await?;
    Ok(DataResponse::new(MarkedRead { marked }))
}
