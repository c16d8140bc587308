//! Route modules for the tus server

pub mod health;
pub mod tus;

use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
///
/// Mounts health endpoints at `/health` and the tus protocol at the
/// configured base path.
pub fn app(state: AppState) -> Router {
    let base_path = state.config().tus.base_path.clone();

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            tus::TUS_RESUMABLE,
            tus::UPLOAD_OFFSET,
            tus::UPLOAD_LENGTH,
            tus::UPLOAD_DEFER_LENGTH,
            tus::UPLOAD_METADATA,
            tus::UPLOAD_CHECKSUM,
        ])
        .expose_headers(
            tus::EXPOSED_HEADERS
                .into_iter()
                .chain([header::LOCATION])
                .collect::<Vec<_>>(),
        );

    Router::new()
        .nest("/health", health::router())
        .nest(&base_path, tus::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
