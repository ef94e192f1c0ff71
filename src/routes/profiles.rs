//! Public profile pages

use axum::extract::{Path, State};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::DataResponse;
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::{ActivityEntry, Profile, RatingWithRater, UserStats};
use crate::error::MarketResult;
use crate::services::{activity, profiles, ratings, stats};

/// GET /profiles/:profile_id
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<DataResponse<Profile>> {
    Ok(DataResponse::new(
        profiles::get_profile(state.store.as_ref(), profile_id).await?,
    ))
}

/// GET /profiles/:profile_id/stats
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<DataResponse<UserStats>> {
    Ok(DataResponse::new(
        stats::user_stats(state.store.as_ref(), profile_id).await?,
    ))
}

/// GET /profiles/:profile_id/ratings
pub async fn list_ratings(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<DataResponse<Vec<RatingWithRater>>> {
    profiles::get_profile(state.store.as_ref(), profile_id).await?;
    Ok(DataResponse::new(
        ratings::ratings_for(state.store.as_ref(), profile_id).await?,
    ))
}

/// GET /profiles/:profile_id/activity
///
/// The profile's most recent marketplace actions, newest first.
pub async fn list_activity(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
    _auth: RequireAuth,
) -> MarketResult<DataResponse<Vec<ActivityEntry>>> {
    Ok(DataResponse::new(
        activity::list_activity(state.store.as_ref(), profile_id).await?,
    ))
}
