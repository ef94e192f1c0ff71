//! Notification routes

use axum::extract::{Path, Query, State};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::DataResponse;
use crate::app::AppState;
use crate::auth::RequireActor;
use crate::domain::notifications::{Notification, NotificationQuery, UnreadCountResponse};
use crate::error::MarketResult;
use crate::services::notifications;

/// GET /notifications?unread_only=true
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NotificationQuery>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<Notification>>> {
    let unread_only = query.unread_only.unwrap_or(false);
    Ok(DataResponse::new(
        notifications::list_notifications(state.store.as_ref(), &actor, unread_only).await?,
    ))
}

/// GET /notifications/unread-count
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<UnreadCountResponse>> {
    let count = notifications::unread_count(state.store.as_ref(), &actor).await?;
    Ok(DataResponse::new(UnreadCountResponse { count }))
}

/// POST /notifications/:notification_id/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Notification>> {
    Ok(DataResponse::new(
        notifications::mark_read(state.store.as_ref(), &actor, notification_id).await?,
    ))
}
