//! Admin HTTP routes: roster CRUD, telemetry snapshots, command triggers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use solarbot_core::{FleetError, FleetManager, RosterEntry, StoreError};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetManager>,
}

/// API response wrapper
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            message: None,
            error: None,
        }
    }

    fn message(msg: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(msg.into()),
            error: None,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(msg.into()),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn bad_request(msg: impl Into<String>) -> Reply {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::error(msg)))
}

fn not_found(msg: impl Into<String>) -> Reply {
    (StatusCode::NOT_FOUND, Json(ApiResponse::error(msg)))
}

/// Map store/fleet failures onto the admin error contract
fn fleet_error(e: &FleetError) -> Reply {
    let status = match e {
        FleetError::UnknownRobot(_) => StatusCode::NOT_FOUND,
        FleetError::TopicCollision { .. } | FleetError::Store(StoreError::Conflict { .. }) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(e.to_string())))
}

fn store_error(e: &StoreError) -> Reply {
    let status = match e {
        StoreError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(e.to_string())))
}

/// Generate a fresh 16-hex-character device-EUI
fn generate_eui() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(rename = "pageSize", default = "default_page_size")]
    page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

#[derive(Deserialize)]
struct LookupQuery {
    /// `type=serial` switches lookup from EUI to device number
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Resolve a path id to a device-EUI, honoring the `type=serial` switch
fn resolve_eui(state: &AppState, id: &str, query: &LookupQuery) -> Result<String, Reply> {
    if query.kind.as_deref() == Some("serial") {
        let serial: u16 = id
            .parse()
            .map_err(|_| bad_request(format!("invalid serial number: {id}")))?;
        match state.fleet.store().get_robot_by_serial(serial) {
            Ok(Some(entry)) => Ok(entry.robot_id),
            Ok(None) => Err(not_found(format!("no robot with serial {serial}"))),
            Err(e) => Err(store_error(&e)),
        }
    } else {
        Ok(id.to_string())
    }
}

// ── Roster ──────────────────────────────────────────────────────────

async fn list_robots(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    match state.fleet.store().list_robots(query.page, query.page_size) {
        Ok(page) => {
            let page_size = query.page_size.clamp(1, 500);
            let body = serde_json::json!({
                "data": page.data,
                "pagination": {
                    "page": query.page.max(1),
                    "pageSize": page_size,
                    "total": page.total,
                    "totalPages": page.total.div_ceil(page_size),
                },
                "statistics": {
                    "total": page.total,
                    "enabled": page.enabled,
                    "disabled": page.disabled,
                },
            });
            (StatusCode::OK, Json(ApiResponse::success(body)))
        }
        Err(e) => store_error(&e),
    }
}

#[derive(Deserialize)]
struct AddRobotRequest {
    #[serde(default)]
    robot_name: String,
    serial_number: Option<i64>,
}

impl AddRobotRequest {
    fn validated_serial(&self) -> Result<u16, Reply> {
        match self.serial_number {
            Some(serial) if (1..=i64::from(u16::MAX)).contains(&serial) => Ok(serial as u16),
            Some(serial) => Err(bad_request(format!("serial_number out of range: {serial}"))),
            None => Err(bad_request("serial_number is required")),
        }
    }
}

async fn add_robot(
    State(state): State<AppState>,
    Json(req): Json<AddRobotRequest>,
) -> impl IntoResponse {
    let serial = match req.validated_serial() {
        Ok(serial) => serial,
        Err(reply) => return reply,
    };

    let eui = generate_eui();
    let name = if req.robot_name.is_empty() {
        format!("Robot {serial}")
    } else {
        req.robot_name.clone()
    };

    if let Err(e) = state
        .fleet
        .store()
        .add_robot(&RosterEntry::new(eui.clone(), name, serial))
    {
        return store_error(&e);
    }
    if let Err(e) = state.fleet.add(&eui).await {
        return fleet_error(&e);
    }

    tracing::info!("admin added robot {} (serial {})", eui, serial);
    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "robot_id": eui,
            "serial_number": serial,
        }))),
    )
}

async fn remove_robot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LookupQuery>,
) -> impl IntoResponse {
    let eui = match resolve_eui(&state, &id, &query) {
        Ok(eui) => eui,
        Err(reply) => return reply,
    };

    if let Err(e) = state.fleet.remove(&eui).await {
        return fleet_error(&e);
    }
    match state.fleet.store().remove_robot(&eui) {
        Ok(true) => {
            tracing::info!("admin removed robot {}", eui);
            (
                StatusCode::OK,
                Json(ApiResponse::message("robot removed")),
            )
        }
        Ok(false) => not_found(format!("robot not found: {eui}")),
        Err(e) => store_error(&e),
    }
}

#[derive(Deserialize)]
struct StatusRequest {
    enabled: bool,
}

async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LookupQuery>,
    Json(req): Json<StatusRequest>,
) -> impl IntoResponse {
    let eui = match resolve_eui(&state, &id, &query) {
        Ok(eui) => eui,
        Err(reply) => return reply,
    };

    match state.fleet.store().set_enabled(&eui, req.enabled) {
        Ok(true) => {}
        Ok(false) => return not_found(format!("robot not found: {eui}")),
        Err(e) => return store_error(&e),
    }

    // Apply immediately rather than waiting a reconciler period
    let result = if req.enabled {
        state.fleet.add(&eui).await
    } else {
        state.fleet.remove(&eui).await
    };
    if let Err(e) = result {
        return fleet_error(&e);
    }

    tracing::info!("admin set robot {} enabled={}", eui, req.enabled);
    let message = if req.enabled {
        "robot enabled"
    } else {
        "robot disabled"
    };
    (StatusCode::OK, Json(ApiResponse::message(message)))
}

async fn batch_add(
    State(state): State<AppState>,
    Json(requests): Json<Vec<AddRobotRequest>>,
) -> impl IntoResponse {
    if requests.is_empty() {
        return bad_request("empty batch");
    }

    let mut entries = Vec::with_capacity(requests.len());
    for req in &requests {
        let serial = match req.validated_serial() {
            Ok(serial) => serial,
            Err(reply) => return reply,
        };
        let name = if req.robot_name.is_empty() {
            format!("Robot {serial}")
        } else {
            req.robot_name.clone()
        };
        entries.push(RosterEntry::new(generate_eui(), name, serial));
    }

    // One transaction: a single conflict rolls the whole batch back
    if let Err(e) = state.fleet.store().batch_add(&entries) {
        return store_error(&e);
    }
    for entry in &entries {
        if let Err(e) = state.fleet.add(&entry.robot_id).await {
            tracing::error!("batch add: {} not started: {}", entry.robot_id, e);
        }
    }

    tracing::info!("admin batch-added {} robots", entries.len());
    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "added": entries.len(),
            "robot_ids": entries.iter().map(|e| e.robot_id.clone()).collect::<Vec<_>>(),
        }))),
    )
}

#[derive(Deserialize)]
struct BatchDeleteRequest {
    robot_ids: Vec<String>,
}

async fn batch_delete(
    State(state): State<AppState>,
    Json(req): Json<BatchDeleteRequest>,
) -> impl IntoResponse {
    if req.robot_ids.is_empty() {
        return bad_request("empty batch");
    }

    for eui in &req.robot_ids {
        if let Err(e) = state.fleet.remove(eui).await {
            tracing::error!("batch delete: {} not stopped: {}", eui, e);
        }
    }
    match state.fleet.store().batch_remove(&req.robot_ids) {
        Ok(removed) => {
            tracing::info!("admin batch-removed {} robots", removed);
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({ "removed": removed }))),
            )
        }
        Err(e) => store_error(&e),
    }
}

// ── Telemetry and triggers ──────────────────────────────────────────

async fn get_robot_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LookupQuery>,
) -> impl IntoResponse {
    let eui = match resolve_eui(&state, &id, &query) {
        Ok(eui) => eui,
        Err(reply) => return reply,
    };

    match state.fleet.get_robot(&eui) {
        Some(robot) => (
            StatusCode::OK,
            Json(ApiResponse::success(robot.describe())),
        ),
        None => not_found(format!("robot not live: {eui}")),
    }
}

#[derive(Deserialize)]
struct ScheduleStartRequest {
    task_id: u8,
    weekday: u8,
    hour: u8,
    minute: u8,
    run_count: u8,
}

async fn trigger_schedule_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LookupQuery>,
    Json(req): Json<ScheduleStartRequest>,
) -> impl IntoResponse {
    if req.weekday > 6 || req.hour > 23 || req.minute > 59 {
        return bad_request("weekday/hour/minute out of range");
    }
    let eui = match resolve_eui(&state, &id, &query) {
        Ok(eui) => eui,
        Err(reply) => return reply,
    };
    let Some(robot) = state.fleet.get_robot(&eui) else {
        return not_found(format!("robot not live: {eui}"));
    };
    match robot.send_schedule_start(req.task_id, req.weekday, req.hour, req.minute, req.run_count)
    {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::message("schedule-start request queued")),
        ),
        Err(e) => fleet_error(&e),
    }
}

async fn trigger_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LookupQuery>,
) -> impl IntoResponse {
    let eui = match resolve_eui(&state, &id, &query) {
        Ok(eui) => eui,
        Err(reply) => return reply,
    };
    let Some(robot) = state.fleet.get_robot(&eui) else {
        return not_found(format!("robot not live: {eui}"));
    };
    match robot.send_start() {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::message("start request queued")),
        ),
        Err(e) => fleet_error(&e),
    }
}

async fn trigger_time_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LookupQuery>,
) -> impl IntoResponse {
    let eui = match resolve_eui(&state, &id, &query) {
        Ok(eui) => eui,
        Err(reply) => return reply,
    };
    let Some(robot) = state.fleet.get_robot(&eui) else {
        return not_found(format!("robot not live: {eui}"));
    };
    match robot.send_time_sync() {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::message("time-sync request queued")),
        ),
        Err(e) => fleet_error(&e),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the admin router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/robots", get(list_robots).post(add_robot))
        .route("/api/robots/batch", post(batch_add))
        .route("/api/robots/batch-delete", post(batch_delete))
        .route("/api/robots/:id", delete(remove_robot))
        .route("/api/robots/:id/status", patch(set_status))
        .route("/api/robots/:id/data", get(get_robot_data))
        .route("/api/robots/:id/schedule-start", post(trigger_schedule_start))
        .route("/api/robots/:id/start", post(trigger_start))
        .route("/api/robots/:id/time-sync", post(trigger_time_sync))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
