//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use super::state::AppState;
use crate::detect::MetricSample;
use crate::orchestrator::{ServiceStatus, TrainingResult};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/train", post(train))
        .route("/detect", get(detect))
        .route("/status", get(status))
        .route("/metrics", post(ingest_metrics))
}

type ApiError = (StatusCode, Json<Value>);

fn failure(code: StatusCode, message: impl Into<String>) -> ApiError {
    (code, Json(json!({ "success": false, "message": message.into() })))
}

async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "outlierwatch",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "environment": state.environment,
        "endpoints": {
            "health": "/api/health",
            "train": "/api/train",
            "detect": "/api/detect",
            "status": "/api/status",
            "metrics": "/api/metrics"
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let orchestrator = &state.orchestrator;
    let database = orchestrator.repository().ping().await.is_ok();
    let publisher = orchestrator.publisher();
    let broker = publisher.is_connected();

    Json(json!({
        "status": if database && broker { "healthy" } else { "degraded" },
        "service": "outlierwatch",
        "version": env!("CARGO_PKG_VERSION"),
        "database": if database { "connected" } else { "disconnected" },
        "broker": if broker { "connected" } else { "disconnected" },
        "alerts_buffered": publisher.pending(),
        "alerts_evicted": publisher.evicted(),
        "is_model_trained": orchestrator.has_trained_models(),
        "last_training": orchestrator.last_training(),
    }))
}

async fn train(State(state): State<AppState>) -> Json<TrainingResult> {
    Json(state.orchestrator.train_all().await)
}

#[derive(Debug, Deserialize)]
struct DetectQuery {
    service: Option<String>,
}

async fn detect(State(state): State<AppState>, Query(query): Query<DetectQuery>) -> Json<Value> {
    let service = query.service.filter(|s| !s.is_empty());
    let anomalies = state.orchestrator.detect_all(service.as_deref()).await;

    Json(json!({
        "success": true,
        "service": service.as_deref().unwrap_or("all"),
        "anomalies_detected": anomalies.len(),
        "timestamp": Utc::now(),
        "details": anomalies,
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: ServiceStatus,
    broker_connected: bool,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.orchestrator.status().await,
        broker_connected: state.orchestrator.publisher().is_connected(),
    })
}

async fn ingest_metrics(
    State(state): State<AppState>,
    Json(samples): Json<Vec<MetricSample>>,
) -> Result<Json<Value>, ApiError> {
    if let Some(bad) = samples.iter().position(|s| s.id.is_empty() || s.service.is_empty()) {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            format!("sample {bad}: id and service are required"),
        ));
    }

    let stored = state.metrics.insert_samples(samples).await.map_err(|e| {
        error!(error = %e, "metric ingestion failed");
        failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    info!(stored, "ingested metrics");
    Ok(Json(json!({ "success": true, "stored": stored })))
}
