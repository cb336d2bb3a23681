//! REST API for IOC lookup and context retrieval

pub mod auth;
pub mod lookup;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use validator::Validate;

use crate::metrics::Metrics;
use crate::models::{CheckRequest, CheckResponse, HealthResponse};
use crate::storage::blob::BlobStore;
use crate::storage::bloom::BloomStore;
use crate::storage::clickhouse::ClickHouseStore;
use crate::storage::Dependency;

const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Application state shared across handlers.
pub struct AppState {
    pub ch: ClickHouseStore,
    pub bloom: BloomStore,
    pub blob: BlobStore,
    pub metrics: Arc<Metrics>,
    pub api_key: String,
    /// Probed by `/readyz`, in bootstrap order.
    pub deps: Vec<Arc<dyn Dependency>>,
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/check", post(check))
        .route("/context/:file_id", get(context))
        .route("/stats", get(stats))
        .route("/search/fuzzy", post(fuzzy_search))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Structured error body shared by handlers and middleware.
pub(crate) fn error_response(code: StatusCode, error: &str, details: Option<&str>) -> Response {
    let (status, body) = error_body(code, error, details);
    (status, body).into_response()
}

fn error_body(
    code: StatusCode,
    error: &str,
    details: Option<&str>,
) -> (StatusCode, Json<Value>) {
    let mut body = json!({
        "error": error,
        "code": code.as_u16(),
    });
    if let Some(details) = details {
        body["details"] = json!(details);
    }
    (code, Json(body))
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "recovered from panic in request handler");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
}

// ==================== Handlers ====================

async fn health() -> Json<HealthResponse> {
    let mut components = BTreeMap::new();
    components.insert("api".to_string(), "up".to_string());
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    })
}

/// Probe every backing store; 503 unless all answer within the deadline.
async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let mut components = BTreeMap::new();
    let mut all_healthy = true;

    for dep in &state.deps {
        let verdict = match tokio::time::timeout(READINESS_TIMEOUT, dep.ping()).await {
            Ok(Ok(())) => "up".to_string(),
            Ok(Err(e)) => {
                all_healthy = false;
                format!("down: {e}")
            }
            Err(_) => {
                all_healthy = false;
                "down: timed out".to_string()
            }
        };
        components.insert(dep.name().to_string(), verdict);
    }

    let (status, code) = if all_healthy {
        ("ready", StatusCode::OK)
    } else {
        ("not ready", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            components,
        }),
    )
}

/// Bulk IOC existence check: Bloom filter first, then the index for the
/// survivors. Output order matches input order positionally.
async fn check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, (StatusCode, Json<Value>)> {
    let started = Instant::now();

    if req.validate().is_err() {
        return Err(if req.iocs.is_empty() {
            error_body(StatusCode::BAD_REQUEST, "No IOCs provided", None)
        } else {
            error_body(
                StatusCode::BAD_REQUEST,
                "Too many IOCs",
                Some("Maximum 1000 IOCs per request"),
            )
        });
    }

    // Stage 1: membership pre-filter. On error, degrade to "all possibly
    // present" so the index still gives an authoritative answer.
    let verdicts = match state.bloom.mexists(&req.iocs).await {
        Ok(verdicts) if verdicts.len() == req.iocs.len() => verdicts,
        Ok(_) | Err(_) => {
            tracing::error!("Bloom filter check failed, degrading to full index lookup");
            vec![true; req.iocs.len()]
        }
    };
    for &verdict in &verdicts {
        state.metrics.record_bloom_check(verdict);
    }

    // Stage 2: authoritative index lookup for the surviving candidates.
    let candidates = lookup::candidates(&req.iocs, &verdicts);
    let rows = if candidates.is_empty() {
        Vec::new()
    } else {
        state.ch.lookup_iocs(&candidates).await.map_err(|e| {
            tracing::error!(error = %e, "IOC index query failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "IOC index query failed", None)
        })?
    };

    let best = lookup::best_by_value(rows);
    let (results, found) = lookup::assemble(&req.iocs, &best);

    let elapsed = started.elapsed();
    state
        .metrics
        .record_api_request("/check", "POST", StatusCode::OK.as_u16(), elapsed.as_secs_f64());

    let total = req.iocs.len();
    Ok(Json(CheckResponse {
        results,
        total,
        found,
        not_found: total - found,
        query_time: format!("{elapsed:?}"),
    }))
}

/// Stream an archived file body from the blob store with its metadata.
async fn context(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    if file_id.trim().is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "Missing file_id", None));
    }

    let record = state.ch.get_file(&file_id).await.map_err(|e| {
        tracing::error!(error = %e, file_id = %file_id, "registry lookup failed");
        error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch file record",
            None,
        )
    })?;

    let Some(record) = record else {
        return Err(error_body(
            StatusCode::NOT_FOUND,
            "File not found",
            Some(&file_id),
        ));
    };
    if record.blob_key.is_empty() {
        return Err(error_body(
            StatusCode::NOT_FOUND,
            "File content not available",
            Some(&file_id),
        ));
    }

    let object = state.blob.get(&record.blob_key).await.map_err(|e| {
        tracing::error!(error = %e, file_id = %file_id, "failed to read blob");
        error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read file content",
            None,
        )
    })?;
    let Some(object) = object else {
        return Err(error_body(
            StatusCode::NOT_FOUND,
            "File content not available",
            Some(&file_id),
        ));
    };

    state
        .metrics
        .record_api_request("/context", "GET", StatusCode::OK.as_u16(), 0.0);

    Response::builder()
        .header(header::CONTENT_TYPE, &object.content_type)
        .header(header::CONTENT_LENGTH, object.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_id}\""),
        )
        .header("X-File-ID", &record.file_id)
        .header("X-Original-Path", &record.file_path)
        .body(Body::from_stream(object.into_stream()))
        .map_err(|e| {
            tracing::error!(error = %e, "failed to build context response");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to stream file content",
                None,
            )
        })
}

/// System statistics: IOC counts by type, file counts by status, and the
/// membership filter's own view of itself. Partial on store errors.
async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let ioc_stats = match state.ch.type_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!(error = %e, "failed to get IOC stats");
            BTreeMap::new()
        }
    };

    let file_stats = match state.ch.status_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!(error = %e, "failed to get file stats");
            BTreeMap::new()
        }
    };

    let bloom_info = match state.bloom.info().await {
        Ok(info) => {
            state.metrics.update_bloom_state(info.size, info.items_inserted);
            Some(info)
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to get Bloom filter info");
            None
        }
    };

    Json(json!({
        "ioc_stats": ioc_stats,
        "file_stats": file_stats,
        "bloom_filter_info": bloom_info,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Reserved surface for similarity search; no vector store is wired in at
/// this revision.
async fn fuzzy_search() -> (StatusCode, Json<Value>) {
    error_body(
        StatusCode::NOT_IMPLEMENTED,
        "Not implemented",
        Some("Fuzzy search is not available at this revision"),
    )
}
