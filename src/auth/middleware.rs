use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use std::sync::Arc;

use super::{Actor, AuthContext};
use crate::app::AppState;
use crate::domain::Profile;
use crate::error::{ErrorResponse, MarketError};
use crate::store::{Collection, Filter, Query, StoreExt};

/// Extractor that requires a valid JWT
///
/// Example:
/// ```ignore
/// async fn protected_route(auth: RequireAuth) -> impl IntoResponse {
///     format!("Hello, user {}", auth.user_id)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequireAuth(pub AuthContext);

impl std::ops::Deref for RequireAuth {
    type Target = AuthContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match &self {
            AuthError::MissingToken => "Missing authorization token",
            AuthError::InvalidToken(_) => "Invalid or expired token",
        };

        let body = ErrorResponse {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            request_id: None,
        };

        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

impl From<AuthError> for MarketError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => Self::Unauthenticated("Missing authorization token".into()),
            AuthError::InvalidToken(_) => Self::Unauthenticated("Invalid or expired token".into()),
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AuthError::MissingToken)?;

        if bearer.token().is_empty() {
            return Err(AuthError::MissingToken);
        }

        let claims = state.verifier.verify_token(bearer.token()).map_err(|e| {
            tracing::warn!(error = %e, "JWT verification failed");
            AuthError::InvalidToken(e.to_string())
        })?;

        let context = AuthContext::from_claims(&claims).map_err(|e| {
            tracing::warn!(error = %e, "Failed to build auth context");
            AuthError::InvalidToken(e.to_string())
        })?;

        Ok(RequireAuth(context))
    }
}

/// Extractor that requires a valid JWT whose user has a profile
#[derive(Debug, Clone)]
pub struct RequireActor(pub Actor);

impl std::ops::Deref for RequireActor {
    type Target = Actor;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub async fn resolve_profile(state: &AppState, auth: &AuthContext) -> Result<Option<Profile>, MarketError> {
    let query = Query::new(Collection::Profiles).filter(Filter::eq("user_id", auth.user_id));
    Ok(state.store.fetch_one::<Profile>(&query).await?)
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireActor {
    type Rejection = MarketError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let RequireAuth(auth) = RequireAuth::from_request_parts(parts, state).await?;

        let profile = resolve_profile(state, &auth)
            .await?
            .ok_or_else(|| MarketError::forbidden("Create a profile before using the marketplace"))?;

        Ok(RequireActor(Actor::new(profile)))
    }
}
