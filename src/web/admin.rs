use crate::error::Error;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::response::{parse_id, success, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct LinesQuery {
    #[serde(default = "default_lines")]
    pub lines: u32,
}

fn default_lines() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default = "default_minutes")]
    pub minutes: u32,
}

fn default_minutes() -> u32 {
    60
}

#[derive(Debug, Deserialize)]
pub struct StreamInfoRequest {
    pub source_url: String,
}

/// Host memory (MB) and load next to what this relay is carrying.
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let (mem_total_mb, mem_avail_mb) = sys_info::mem_info()
        .map(|m| (m.total / 1024, m.avail / 1024))
        .unwrap_or_default();
    let load_one = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    let transcoders = state.engine.list().await;
    let listeners: usize = transcoders.iter().map(|t| t.listeners).sum();

    Json(json!({
        "host": {
            "mem_total_mb": mem_total_mb,
            "mem_avail_mb": mem_avail_mb,
            "load_one": load_one,
        },
        "relay": {
            "local_transcoders": transcoders.iter().filter(|t| t.alive).count(),
            "local_listeners": listeners,
            "cached_playlists": state.cache.playlists.len(),
            "cached_segments": state.cache.segments.len(),
            "control_plane_state": state.lifecycle.state(),
            "monitor_running": state.lifecycle.monitor_running(),
        },
    }))
}

async fn source_url(state: &SharedState, channel_id: i64) -> Result<String, ApiError> {
    state
        .catalog
        .find(channel_id)
        .await
        .map(|c| c.stream_url)
        .ok_or_else(|| Error::not_found("channel", channel_id).into())
}

// --- control-plane workers ---

pub async fn list_workers(State(state): State<SharedState>) -> ApiResult {
    success(state.control.list_workers().await)
}

pub async fn worker_status(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    match state.control.query_worker(channel_id).await {
        Some(record) => success(record),
        None => Err(Error::not_found("worker", channel_id).into()),
    }
}

pub async fn start_worker(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    let source_url = source_url(&state, channel_id).await?;
    let record = state.control.start_worker(channel_id, &source_url).await?;
    success(record)
}

pub async fn stop_worker(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    let stopped = state.control.stop_worker(channel_id).await?;
    state.cache.purge_channel(channel_id);
    // Already stopped counts as success.
    success(json!({
        "channel_id": channel_id,
        "stopped": stopped.is_some(),
        "worker": stopped,
    }))
}

pub async fn stop_all_workers(State(state): State<SharedState>) -> ApiResult {
    let report = state.control.stop_all_workers().await;
    for channel_id in &report.stopped {
        state.cache.purge_channel(*channel_id);
    }
    success(report)
}

pub async fn worker_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LinesQuery>,
) -> ApiResult {
    let channel_id = parse_id(&id)?;
    success(state.control.fetch_logs(channel_id, query.lines).await)
}

pub async fn recover_worker(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    let result = state.control.trigger_recovery(channel_id).await?;
    let purged = state.cache.purge_channel(channel_id);
    info!(channel_id, purged, "recovery triggered, channel cache purged");
    success(result)
}

pub async fn touch_worker(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    let updated = state.control.touch_activity(channel_id).await;
    success(json!({ "channel_id": channel_id, "updated": updated }))
}

pub async fn error_history(State(state): State<SharedState>, Query(query): Query<WindowQuery>) -> ApiResult {
    success(state.control.fetch_error_history(query.minutes).await)
}

pub async fn health(State(state): State<SharedState>) -> ApiResult {
    let available = state.control.is_available().await;
    let (health, service) = if available {
        tokio::join!(state.control.fetch_health(), state.control.fetch_service_status())
    } else {
        (None, None)
    };
    success(json!({
        "control_plane_url": state.config.control_plane.base_url,
        "direct_mode": state.config.server.direct_mode,
        "control_plane_available": available,
        "health": health,
        "service_status": service,
        "cached_playlists": state.cache.playlists.len(),
        "cached_segments": state.cache.segments.len(),
    }))
}

pub async fn force_cleanup(State(state): State<SharedState>) -> ApiResult {
    let message = state.control.force_cleanup().await?;
    state.cache.clear();
    success(json!({ "message": message }))
}

// --- control-plane process ---

pub async fn control_plane_status(State(state): State<SharedState>) -> ApiResult {
    success(state.lifecycle.status().await)
}

pub async fn control_plane_start(State(state): State<SharedState>) -> ApiResult {
    success(state.lifecycle.start().await?)
}

pub async fn control_plane_stop(State(state): State<SharedState>) -> ApiResult {
    success(state.lifecycle.stop().await?)
}

pub async fn control_plane_restart(State(state): State<SharedState>) -> ApiResult {
    success(state.lifecycle.restart().await?)
}

pub async fn control_plane_auto_fix(State(state): State<SharedState>) -> ApiResult {
    success(state.lifecycle.auto_fix().await)
}

pub async fn monitor_start(State(state): State<SharedState>) -> ApiResult {
    let started = state.lifecycle.start_monitor();
    success(json!({ "started": started, "monitor_running": state.lifecycle.monitor_running() }))
}

pub async fn monitor_stop(State(state): State<SharedState>) -> ApiResult {
    let stopped = state.lifecycle.stop_monitor();
    success(json!({ "stopped": stopped, "monitor_running": state.lifecycle.monitor_running() }))
}

pub async fn list_transcoder_processes(State(state): State<SharedState>) -> ApiResult {
    success(state.lifecycle.transcoder_processes().await)
}

pub async fn kill_transcoder_process(State(state): State<SharedState>, Path(pid): Path<String>) -> ApiResult {
    let pid: u32 = pid
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid pid: {pid}")))?;
    let killed = state.lifecycle.kill_transcoder(pid).await?;
    success(json!({ "pid": pid, "killed": killed }))
}

pub async fn check_transcoder_binary(State(state): State<SharedState>) -> ApiResult {
    success(state.engine.check_binary().await)
}

// --- local transcoders ---

pub async fn list_local(State(state): State<SharedState>) -> ApiResult {
    success(state.engine.list().await)
}

pub async fn start_local(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    let source_url = source_url(&state, channel_id).await?;
    let handle = state.engine.start(channel_id, &source_url).await?;
    success(json!({ "channel_id": channel_id, "pid": handle.pid }))
}

pub async fn stop_local(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    if state.engine.stop(channel_id).await {
        success(json!({ "channel_id": channel_id, "stopped": true }))
    } else {
        Err(Error::not_found("transcoder", channel_id).into())
    }
}

pub async fn local_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LinesQuery>,
) -> ApiResult {
    let channel_id = parse_id(&id)?;
    let logs = state.engine.logs(channel_id, query.lines as usize).await;
    success(json!({ "channel_id": channel_id, "logs": logs }))
}

pub async fn cleanup_local(State(state): State<SharedState>) -> ApiResult {
    success(json!({ "cleaned": state.engine.cleanup_idle().await }))
}

pub async fn stop_all_local(State(state): State<SharedState>) -> ApiResult {
    success(json!({ "stopped": state.engine.stop_all().await }))
}

pub async fn stream_info(State(state): State<SharedState>, Json(req): Json<StreamInfoRequest>) -> ApiResult {
    success(state.engine.stream_info(&req.source_url).await?)
}
