//! HTTP control and observability API.
//!
//! - GET /health
//! - GET /v1/stats
//! - GET /v1/classification
//! - PUT /v1/classification
//! - GET /v1/blocks/resident
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::block::BlockId;
use crate::cache::classifier::ClassificationType;
use crate::gpu::TextureHandle;
use crate::server::metrics::StreamerMetrics;
use crate::streaming::{BlockCollection, ClassificationState, CollectionStats};

/// Application state shared across handlers.
pub struct AppState {
    pub collection: Arc<BlockCollection>,
    pub metrics: StreamerMetrics,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/stats", get(stats))
        .route(
            "/v1/classification",
            get(get_classification).put(put_classification),
        )
        .route("/v1/blocks/resident", get(resident_blocks))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub total_blocks: usize,
    pub shown_blocks: usize,
    pub loader_running: bool,
}

/// New classification. `kind` defaults to the current statistic.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClassificationRequest {
    #[serde(default)]
    pub kind: Option<ClassificationType>,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResidentBlock {
    pub id: BlockId,
    pub coord: [u64; 3],
    pub origin: [f32; 3],
    pub scale: [f32; 3],
    pub texture: TextureHandle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let collection = &state.collection;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        total_blocks: collection.blocks().len(),
        shown_blocks: collection.classification().shown,
        loader_running: collection.loader().is_running(),
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<CollectionStats> {
    Json(state.collection.stats())
}

async fn get_classification(State(state): State<Arc<AppState>>) -> Json<ClassificationState> {
    Json(state.collection.classification())
}

async fn put_classification(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClassificationRequest>,
) -> Result<Json<ClassificationState>, (StatusCode, Json<ErrorResponse>)> {
    let collection = &state.collection;
    let kind = req.kind.unwrap_or(collection.classification().kind);

    match collection.set_classification(kind, req.low, req.high) {
        Ok(shown) => {
            info!(kind = %kind, low = req.low, high = req.high, shown, "Classification changed via API");
            Ok(Json(collection.classification()))
        }
        Err(e) => {
            warn!(low = req.low, high = req.high, error = %e, "Rejected classification");
            Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

async fn resident_blocks(State(state): State<Arc<AppState>>) -> Json<Vec<ResidentBlock>> {
    let blocks = state
        .collection
        .visible_gpu_resident_blocks()
        .into_iter()
        .map(|item| ResidentBlock {
            id: item.block.id(),
            coord: item.block.coord(),
            origin: item.block.origin(),
            scale: item.block.scale(),
            texture: item.texture,
        })
        .collect();
    Json(blocks)
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.update(&state.collection.stats());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
