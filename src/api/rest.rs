//! Axum REST API handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    body::Bytes,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::engine::metrics::CONTENT_TYPE;
use crate::engine::InterpreterBackend;
use crate::error::Error;
use crate::service::RuntimeContext;

use super::dto::*;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState<B: InterpreterBackend> {
    pub context: Arc<RuntimeContext<B>>,
}

/// Create the REST API router
pub fn create_rest_router<B: InterpreterBackend>(state: Arc<AppState<B>>) -> Router {
    Router::new()
        .route("/", get(index_handler::<B>))
        .route("/health", get(health_handler::<B>))
        .route("/metrics", get(metrics_handler::<B>))
        .route("/infer", post(infer_handler::<B>))
        // Middleware
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_error(e: Error) -> ApiError {
    (e.status_code(), Json(ErrorResponse::new(&e.to_string())))
}

/// Classify an uploaded image
async fn infer_handler<B: InterpreterBackend>(
    State(state): State<Arc<AppState<B>>>,
    request: Request,
) -> Result<Json<InferResponse>, ApiError> {
    if !state.context.is_loaded() {
        return Err(api_error(Error::NotLoaded));
    }

    let image_data = extract_image(request).await?.ok_or_else(|| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("No image provided")))
    })?;

    let result = state.context.classify(image_data).await.map_err(|e| {
        error!("Inference error: {}", e);
        api_error(e)
    })?;

    Ok(Json(result.into()))
}

/// Pull image bytes from a multipart `image` field or the raw body
async fn extract_image(request: Request) -> Result<Option<Vec<u8>>, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if is_multipart {
        let mut multipart = Multipart::from_request(request, &()).await.map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.body_text())))
        })?;

        while let Some(field) = multipart.next_field().await.map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string())))
        })? {
            if field.name() == Some("image") {
                let data = field.bytes().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string())))
                })?;
                return Ok((!data.is_empty()).then(|| data.to_vec()));
            }
        }
        return Ok(None);
    }

    let body = Bytes::from_request(request, &()).await.map_err(|e| {
        (e.status(), Json(ErrorResponse::new(&e.body_text())))
    })?;
    Ok((!body.is_empty()).then(|| body.to_vec()))
}

/// Health check
async fn health_handler<B: InterpreterBackend>(
    State(state): State<Arc<AppState<B>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let health = state.context.health();
    let status = if health.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(HealthResponse {
        status: if health.healthy { "healthy" } else { "unhealthy" },
        model_loaded: health.healthy,
        inference_count: health.inference_count,
    }))
}

/// Prometheus metrics
async fn metrics_handler<B: InterpreterBackend>(
    State(state): State<Arc<AppState<B>>>,
) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], state.context.metrics().render())
}

/// API documentation and status
async fn index_handler<B: InterpreterBackend>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<IndexResponse> {
    let labels = state.context.labels();
    let endpoints = BTreeMap::from([
        ("GET /", "This documentation"),
        ("GET /health", "Health check"),
        ("GET /metrics", "Prometheus metrics"),
        ("POST /infer", "Run inference (multipart/form-data with image field)"),
    ]);

    Json(IndexResponse {
        service: labels.service.clone(),
        hardware: labels.hardware.clone(),
        model: labels.model.clone(),
        endpoints,
        status: state.context.status().into(),
    })
}
