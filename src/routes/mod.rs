pub mod admin;
pub mod bids;
pub mod comments;
pub mod conversations;
pub mod health;
pub mod likes;
pub mod live;
pub mod me;
pub mod messages;
pub mod notifications;
pub mod profiles;
pub mod tasks;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;

use crate::app::AppState;

/// Build the API router with all routes
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Public routes
        .route("/health", get(health::health_check))
        // Caller's profile
        .route("/me", get(me::get_me).post(me::upsert_me))
        .route("/me/avatar", post(me::upload_avatar))
        .route("/me/tasks", get(me::my_tasks))
        // Profiles
        .route("/profiles/:profile_id", get(profiles::get_profile))
        .route("/profiles/:profile_id/stats", get(profiles::get_stats))
        .route("/profiles/:profile_id/ratings", get(profiles::list_ratings))
        .route("/profiles/:profile_id/activity", get(profiles::list_activity))
        // Tasks
        .route("/tasks", get(tasks::list_feed).post(tasks::create_task))
        .route("/tasks/live", get(tasks::live_feed))
        .route("/tasks/:task_id", get(tasks::get_task).delete(tasks::delete_task))
        .route("/tasks/:task_id/actions", get(tasks::get_actions))
        .route("/tasks/:task_id/status", post(tasks::advance_status))
        .route(
            "/tasks/:task_id/attachments",
            get(tasks::list_attachments).post(tasks::upload_attachment),
        )
        .route("/tasks/:task_id/ratings", post(tasks::rate_task))
        // Likes
        .route("/tasks/:task_id/likes", get(likes::like_status).post(likes::toggle_like))
        .route("/tasks/:task_id/likes/live", get(likes::live_likes))
        // Bids
        .route("/tasks/:task_id/bids", get(bids::list_bids).post(bids::submit_bid))
        .route("/tasks/:task_id/bids/mine", get(bids::my_bids))
        .route("/tasks/:task_id/bids/live", get(bids::live_bids))
        .route("/bids/:bid_id/accept", post(bids::accept_bid))
        .route("/bids/:bid_id/reject", post(bids::reject_bid))
        .route("/bids/:bid_id", delete(bids::withdraw_bid))
        // Task chat
        .route(
            "/tasks/:task_id/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/tasks/:task_id/messages/live", get(messages::live_messages))
        // Comments
        .route(
            "/tasks/:task_id/comments",
            get(comments::list_comments).post(comments::create_comment),
        )
        .route("/tasks/:task_id/comments/live", get(comments::live_comments))
        .route(
            "/comments/:comment_id",
            patch(comments::edit_comment).delete(comments::delete_comment),
        )
        // Direct messages
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route(
            "/conversations/:conversation_id/messages",
            get(conversations::list_messages).post(conversations::send_message),
        )
        .route(
            "/conversations/:conversation_id/messages/live",
            get(conversations::live_messages),
        )
        .route("/conversations/:conversation_id/read", post(conversations::mark_read))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/:notification_id/read", post(notifications::mark_read))
        // Admin
        .route("/admin/profiles", get(admin::list_profiles))
        .route("/admin/profiles/:profile_id", patch(admin::update_profile))
}

/// Read the `file` part of a multipart upload.
pub(crate) async fn read_file(
    mut multipart: axum::extract::Multipart,
) -> crate::error::MarketResult<crate::services::attachments::Upload> {
    use crate::error::MarketError;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| MarketError::validation(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("file").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| MarketError::validation(format!("failed to read upload: {e}")))?;
        return Ok(crate::services::attachments::Upload {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
    }
    Err(MarketError::validation("multipart body has no `file` part"))
}
