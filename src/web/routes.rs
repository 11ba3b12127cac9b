//! HTTP handlers

use axum::{
    extract::{Path, State},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, info};

use super::error::{ok, ApiError};
use super::AppState;

fn entity_id(raw: &str) -> Result<&str, ApiError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("entity id is required".to_string()));
    }
    Ok(id)
}

/// POST /api/v1/inventory/:entity_id/sync
pub async fn sync_inventory(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let id = entity_id(&raw_id)?;

    // Only well-formedness is checked; the payload is stored as sent
    if serde_json::from_slice::<serde::de::IgnoredAny>(&body).is_err() {
        return Err(ApiError::BadRequest("invalid JSON".to_string()));
    }

    let size = body.len();
    state.inventory.sync(id, body.to_vec()).await?;

    Ok(ok(json!({
        "status": "synced",
        "user_id": id,
        "size": size,
    })))
}

/// GET /api/v1/inventory/:entity_id
pub async fn get_inventory(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = entity_id(&raw_id)?;

    let snapshot = state
        .inventory
        .fetch(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no inventory for {}", id)))?;

    let inventory: Value = serde_json::from_slice(&snapshot.payload).map_err(|e| {
        error!("Stored inventory for {} is not valid JSON: {}", id, e);
        ApiError::Internal("stored inventory is unreadable".to_string())
    })?;

    Ok(ok(json!({
        "entity_id": id,
        "owner_id": snapshot.owner_id,
        "inventory": inventory,
        "synced_at": snapshot.updated_at,
    })))
}

/// GET /api/v1/health
pub async fn health() -> Json<Value> {
    ok(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/v1/admin/stats
pub async fn admin_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = Utc::now() - state.started_at;
    let mut stats = Map::new();
    stats.insert("uptime_seconds".to_string(), json!(uptime.num_seconds()));
    stats.insert("server_time".to_string(), json!(Utc::now()));
    stats.insert("db_type".to_string(), json!(state.repo.backend()));

    let buffer = match &state.buffer {
        Some(buffer) => match buffer.count().await {
            Ok(pending) => json!({
                "status": "connected",
                "pending_items": pending,
                "loop": format!("{:?}", buffer.state()).to_lowercase(),
            }),
            Err(e) => json!({ "status": "error", "error": e.to_string() }),
        },
        None => json!({ "status": "not_configured" }),
    };
    stats.insert("buffer".to_string(), buffer);

    let storage = match state.repo.stats().await {
        Ok(mut repo_stats) => {
            repo_stats.insert("status".to_string(), json!("connected"));
            Value::Object(repo_stats)
        }
        Err(e) => json!({ "status": "error", "error": e.to_string() }),
    };
    stats.insert("storage".to_string(), storage);

    let cleanup = state.cleanup.settings();
    stats.insert(
        "cleanup".to_string(),
        json!({
            "state": format!("{:?}", state.cleanup.state()).to_lowercase(),
            "inactive_threshold_seconds": cleanup.inactive_threshold.as_secs(),
            "interval_seconds": cleanup.interval.as_secs(),
        }),
    );

    ok(stats)
}

/// POST /api/v1/admin/cleanup
pub async fn admin_cleanup(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let deleted = state.cleanup.run_now().await.map_err(|e| {
        error!("Manual cleanup failed: {}", e);
        ApiError::Internal("cleanup failed".to_string())
    })?;
    info!("Manual cleanup deleted {} inactive inventories", deleted);
    Ok(ok(json!({ "deleted": deleted })))
}

/// POST /api/v1/admin/flush
pub async fn admin_flush(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let buffer = state
        .buffer
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("write buffer is not configured".to_string()))?;

    buffer.flush().await.map_err(|e| {
        error!("Manual flush failed: {}", e);
        ApiError::Internal("flush failed".to_string())
    })?;
    let pending = buffer.count().await.ok();

    Ok(ok(json!({ "status": "flushed", "pending_items": pending })))
}
