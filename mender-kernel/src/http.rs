/**
 * ADMIN API - HTTP inspection and manual recovery for operators
 *
 * ROUTES:
 * - /health, /system/health           liveness of the coordinator itself
 * - /api/health                       latest worker HealthReport
 * - /api/registry                     service -> instance ids
 * - /api/logs, /api/logs/clear        failure log text, truncate
 * - /api/remediation                  single-flight status and history
 * - /api/backups, /api/backups/{app}/restore   list, manual rollback
 *
 * SECURITY:
 * - With an API key configured, every route except /health* requires a
 *   matching `x-api-key` header. Without one the API is open; the server
 *   logs a warning at startup.
 */

use crate::backup::{BackupError, BackupInfo, Restored};
use crate::health::KernelHealth;
use crate::models::{HealthReport, InstanceId, ServiceName};
use crate::remediation::RemediationStatus;
use crate::state::AppState;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected admin request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/health", get(get_health_report))
        .route("/api/registry", get(get_registry))
        .route("/api/logs", get(get_logs))
        .route("/api/logs/clear", post(clear_logs))
        .route("/api/remediation", get(get_remediation))
        .route("/api/backups", get(list_backups))
        .route("/api/backups/{app}/restore", post(restore_backup))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() })))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.registry, &app.heartbeats, &app.remediator))
}

// GET /api/health (latest report, evaluated on the spot before the first cycle)
async fn get_health_report(State(app): State<AppState>) -> Json<HealthReport> {
    let report = app
        .health_tracker
        .latest()
        .unwrap_or_else(|| app.health_tracker.evaluate_now(&app.registry, &app.heartbeats, app.liveness_timeout));
    Json(report)
}

// GET /api/registry
async fn get_registry(State(app): State<AppState>) -> Json<BTreeMap<ServiceName, Vec<InstanceId>>> {
    Json(app.registry.lock().snapshot())
}

#[derive(Serialize)]
struct LogView {
    path: String,
    size: usize,
    content: String,
}

// GET /api/logs
async fn get_logs(State(app): State<AppState>) -> Result<Json<LogView>, (StatusCode, Json<serde_json::Value>)> {
    let content = app.failures.read_all().await.map_err(internal_error)?;
    Ok(Json(LogView {
        path: app.failures.path().display().to_string(),
        size: content.len(),
        content,
    }))
}

// POST /api/logs/clear
async fn clear_logs(State(app): State<AppState>) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    app.failures.clear().await.map_err(internal_error)?;
    info!("failure log cleared through admin api");
    Ok(Json(serde_json::json!({ "status": "cleared" })))
}

// GET /api/remediation
async fn get_remediation(State(app): State<AppState>) -> Json<RemediationStatus> {
    Json(app.remediator.status())
}

// GET /api/backups
async fn list_backups(State(app): State<AppState>) -> Result<Json<Vec<BackupInfo>>, (StatusCode, Json<serde_json::Value>)> {
    let backups = app.remediator.sources().list_backups().await.map_err(internal_error)?;
    Ok(Json(backups))
}

// POST /api/backups/{app}/restore
async fn restore_backup(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    match app.remediator.sources().restore_latest(&name).await {
        Ok(restored) => Json::<Restored>(restored).into_response(),
        Err(e @ BackupError::InvalidName(_)) => {
            (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
        Err(e @ BackupError::NoBackup(_)) => {
            (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}
