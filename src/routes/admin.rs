//! Admin routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::DataResponse;
use crate::app::AppState;
use crate::auth::RequireActor;
use crate::domain::{AdminProfileUpdate, Profile, ProfileSearch};
use crate::error::MarketResult;
use crate::services::admin;

/// GET /admin/profiles?search=
pub async fn list_profiles(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProfileSearch>,
    RequireActor(actor): RequireActor,
) -> MarketResult<DataResponse<Vec<Profile>>> {
    Ok(DataResponse::new(
        admin::list_profiles(state.store.as_ref(), &actor, params.search.as_deref()).await?,
    ))
}

/// PATCH /admin/profiles/:profile_id
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
    RequireActor(actor): RequireActor,
    Json(update): Json<AdminProfileUpdate>,
) -> MarketResult<DataResponse<Profile>> {
    Ok(DataResponse::new(
        admin::update_flags(state.store.as_ref(), &actor, profile_id, update).await?,
    ))
}
