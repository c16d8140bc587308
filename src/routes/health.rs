//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::Result;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub tus_version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "tus-server",
        tus_version: crate::upload::TUS_VERSION,
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub database: &'static str,
}

/// Readiness: the record store answers queries
pub async fn ready_check(State(state): State<AppState>) -> Result<Json<ReadyResponse>> {
    let database = match state.db() {
        Some(pool) => {
            sqlx::query("SELECT 1").execute(pool).await?;
            "ok"
        }
        None => "not configured",
    };

    Ok(Json(ReadyResponse {
        status: "ready",
        database,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(ready_check))
}
