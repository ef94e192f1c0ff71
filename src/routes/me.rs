//! The caller's own profile and tasks

use axum::{
    extract::{Multipart, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::read_file;
use crate::api::DataResponse;
use crate::app::AppState;
use crate::auth::{RequireActor, RequireAuth};
use crate::domain::{Profile, Task, UpsertProfileRequest};
use crate::error::MarketResult;
use crate::services::lifecycle::{self, Role};
use crate::services::profiles;

#[derive(Serialize)]
pub struct MeResponse {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub role: Option<String>,
    /// `None` until the user creates a profile
    pub profile: Option<Profile>,
}

/// GET /me
pub async fn get_me(
    State(state): State<Arc<AppState>>,
    auth: RequireAuth,
) -> MarketResult<DataResponse<MeResponse>> {
    let profile = profiles::find_by_user(state.store.as_ref(), auth.user_id).await?;
    Ok(DataResponse::new(MeResponse {
        user_id: auth.user_id,
        email: auth.email.clone(),
        role: auth.role.clone(),
        profile,
    }))
}

/// POST /me
///
/// Create the caller's profile, or update the fields present in the body.
pub async fn upsert_me(
    State(state): State<Arc<AppState>>,
    auth: RequireAuth,
    Json(req): Json<UpsertProfileRequest>,
) -> MarketResult<DataResponse<Profile>> {
    let profile = profiles::upsert_profile(state.store.as_ref(), &auth, req).await?;
    Ok(DataResponse::new(profile))
}

/// POST /me/avatar
pub async fn upload_avatar(
    State(state): State<Arc<AppState>>,
    RequireActor(actor): RequireActor,
    multipart: Multipart,
) -> MarketResult<DataResponse<Profile>> {
    let upload = read_file(multipart).await?;
    let profile = profiles::upload_avatar(
        state.store.as_ref(),
        state.objects.as_ref(),
        &actor,
        upload.bytes,
        &upload.content_type,
        state.settings.policy.max_upload_bytes,
    )
    .await?;
    Ok(DataResponse::new(profile))
}

#[derive(Debug, Deserialize)]
pub struct MyTasksParams {
    #[serde(default)]
    pub role: Option<TaskRole>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskRole {
    Owner,
    Worker,
}

/// GET /me/tasks?role=owner|worker
pub async fn my_tasks(
    State(state): State<Arc<AppState>>,
    RequireActor(actor): RequireActor,
    Query(params): Query<MyTasksParams>,
) -> MarketResult<DataResponse<Vec<Task>>> {
    let role = match params.role.unwrap_or(TaskRole::Owner) {
        TaskRole::Owner => Role::Owner,
        TaskRole::Worker => Role::Worker,
    };
    let tasks = lifecycle::my_tasks(state.store.as_ref(), &actor, role).await?;
    Ok(DataResponse::new(tasks))
}
