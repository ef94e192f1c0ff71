use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceHealth,
}

#[derive(Serialize)]
pub struct ServiceHealth {
    pub store: String,
    pub backend: String,
}

/// Health check endpoint - public
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store_result = state.store.health_check().await;
    if let Err(e) = &store_result {
        tracing::warn!(error = %e, "Store health check failed");
    }

    let (status, status_code) = match store_result {
        Ok(()) => ("healthy", StatusCode::OK),
        Err(_) => ("unhealthy", StatusCode::SERVICE_UNAVAILABLE),
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: ServiceHealth {
                store: if status_code.is_success() { "ok" } else { "error" }.to_string(),
                backend: state.store.backend_tag().to_string(),
            },
        }),
    )
}
