use axum::{extract::DefaultBodyLimit, http::HeaderName, http::HeaderValue, Router};
use std::sync::Arc;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::auth::JwtVerifier;
use crate::config::Settings;
use crate::routes;
use crate::store::{ChangeStream, MemoryObjectStorage, MemoryStore, ObjectStorage, Store};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Multipart framing on top of the largest accepted file
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared application state
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub changes: Arc<dyn ChangeStream>,
    pub objects: Arc<dyn ObjectStorage>,
    pub settings: Settings,
    pub verifier: JwtVerifier,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        changes: Arc<dyn ChangeStream>,
        objects: Arc<dyn ObjectStorage>,
        settings: Settings,
    ) -> Arc<Self> {
        let verifier = JwtVerifier::new(&settings.supabase_jwt_secret, &settings.supabase_jwt_audience);
        Arc::new(Self {
            store,
            changes,
            objects,
            settings,
            verifier,
        })
    }

    /// State backed entirely by in-process stores. Returns the concrete
    /// backends so callers can seed and inspect them.
    pub fn in_memory(settings: Settings) -> (Arc<Self>, Arc<MemoryStore>, Arc<MemoryObjectStorage>) {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStorage::new());
        let state = Self::new(store.clone(), store.clone(), objects.clone(), settings);
        (state, store, objects)
    }
}

/// Sets an `x-request-id` on requests that lack one and copies it to the response.
fn request_id_layers() -> (SetRequestIdLayer<MakeRequestUuid>, PropagateRequestIdLayer) {
    let header = HeaderName::from_static(X_REQUEST_ID);
    (
        SetRequestIdLayer::new(header.clone(), MakeRequestUuid),
        PropagateRequestIdLayer::new(header),
    )
}

/// Build the complete application with all middleware
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.settings);

    // Spans at DEBUG to keep INFO quiet
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let (set_request_id, propagate_request_id) = request_id_layers();
    let body_limit = DefaultBodyLimit::max(state.settings.policy.max_upload_bytes + BODY_OVERHEAD_BYTES);

    Router::new()
        .merge(routes::api_router())
        .layer(body_limit)
        // Middleware stack (applied bottom-up)
        .layer(propagate_request_id)
        .layer(trace_layer)
        .layer(set_request_id)
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allow_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let max_age = if settings.env.is_dev() {
        std::time::Duration::from_secs(86400)
    } else {
        std::time::Duration::from_secs(3600)
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::list([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::CACHE_CONTROL,
            HeaderName::from_static(X_REQUEST_ID),
        ]))
        .allow_credentials(true)
        .max_age(max_age)
}
