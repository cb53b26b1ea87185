//! HTTP API for the timbre conversion server.
//!
//! Runs on port 6575 by default. Every `/generate` response carries a
//! base64-encoded `message`: empty on success, the validation error on 400,
//! the diagnostic trace on 500.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use timbre_core::types::GenerateResponse;

use crate::pipeline::ConversionService;

/// Build the axum router around a shared [`ConversionService`].
pub fn router(service: ConversionService) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/gpu-info", get(gpu_info))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn generate(State(service): State<ConversionService>, body: Bytes) -> Response {
    let outcome = service.generate(&body).await;
    (outcome.status(), Json(GenerateResponse::encode(outcome.message()))).into_response()
}

async fn gpu_info(State(service): State<ConversionService>) -> Response {
    match service.gpu_info().await {
        Ok(gpus) => Json(gpus).into_response(),
        Err(e) => {
            tracing::warn!("gpu enumeration failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}
