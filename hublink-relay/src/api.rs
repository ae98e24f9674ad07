//! HTTP API over the device store.
//!
//! Thin accessors: every handler reads or appends through the shared
//! [`DeviceStore`](hublink_store::DeviceStore) and wraps the result in the
//! `{success, data?, count?, message?, error?}` envelope.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use hublink_store::{LogLevel, Operation, OperationStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::iso_timestamp;
use crate::relay::{ControlAction, Relay};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    relay: Arc<Relay>,
    ws_url: String,
}

impl ApiState {
    pub fn new(relay: Arc<Relay>, ws_url: impl Into<String>) -> Self {
        Self {
            relay,
            ws_url: ws_url.into(),
        }
    }
}

/// API failures, rendered as `{success: false, error}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        log::debug!("Rejected request body: {rejection}");
        ApiError::BadRequest("Invalid JSON body".to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        log::debug!("Rejected query: {rejection}");
        ApiError::BadRequest("Invalid query parameters".to_string())
    }
}

/// Success envelope.
#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    fn data(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            count: None,
            message: None,
        })
    }

    fn with_message(data: T, message: &str) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            count: None,
            message: Some(message.to_string()),
        })
    }
}

impl<T: Serialize> Envelope<Vec<T>> {
    fn list(data: Vec<T>) -> Json<Self> {
        let count = data.len();
        Json(Self {
            success: true,
            data: Some(data),
            count: Some(count),
            message: None,
        })
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    device_id: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CreateOperationRequest {
    #[serde(rename = "type")]
    op_type: Option<String>,
    action: Option<String>,
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CreateLogRequest {
    level: Option<String>,
    message: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinStatusQuery {
    pin: Option<String>,
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlRequest {
    pin: Option<Value>,
    action: Option<String>,
    instance_id: Option<String>,
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/api/websocket/info", get(websocket_info))
        .route("/api/stats", get(stats))
        .route("/api/devices", get(list_devices).post(register_device))
        .route(
            "/api/devices/:device_id",
            get(get_device).delete(clear_device),
        )
        .route(
            "/api/devices/:device_id/operations",
            get(list_operations).post(create_operation),
        )
        .route("/api/devices/:device_id/operations/last", get(last_operation))
        .route(
            "/api/devices/:device_id/logs",
            get(list_logs).post(create_log),
        )
        .route("/api/devices/:device_id/interactions", get(list_interactions))
        .route("/api/devices/:device_id/history", get(device_history))
        .route("/api/device/control", get(control_usage).post(device_control))
        .route("/api/device/status", get(device_status))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": iso_timestamp(Utc::now()) }))
}

async fn websocket_info(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "wsUrl": state.ws_url,
        "protocol": "WebSocket",
        "connectionFormat": format!("{}?instanceId={{moduleId}}", state.ws_url),
        "description": "Connect to WebSocket server with your module ID",
    }))
}

async fn stats(State(state): State<ApiState>) -> ApiResult<crate::relay::RelayStats> {
    Ok(Envelope::data(state.relay.stats().await))
}

async fn list_devices(State(state): State<ApiState>) -> ApiResult<Vec<hublink_store::Device>> {
    Ok(Envelope::list(state.relay.store().get_all_devices()))
}

async fn register_device(
    State(state): State<ApiState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<hublink_store::Device> {
    let Json(req) = body?;
    let device_id = req
        .device_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("deviceId is required".to_string()))?;
    Ok(Envelope::data(
        state.relay.store().register_device(&device_id, req.metadata),
    ))
}

async fn get_device(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<hublink_store::Device> {
    state
        .relay
        .store()
        .get_device(&device_id)
        .map(Envelope::data)
        .ok_or_else(|| ApiError::NotFound("Device not found".to_string()))
}

async fn clear_device(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<Value> {
    let store = state.relay.store();
    if !store.contains(&device_id) {
        return Err(ApiError::NotFound("Device not found".to_string()));
    }
    store.clear_device_data(&device_id);
    Ok(Envelope::with_message(
        json!({ "deviceId": device_id }),
        "Device data cleared",
    ))
}

async fn list_operations(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<Operation>> {
    let Query(query) = query?;
    Ok(Envelope::list(
        state.relay.store().get_operations(&device_id, query.limit),
    ))
}

async fn create_operation(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    body: Result<Json<CreateOperationRequest>, JsonRejection>,
) -> ApiResult<Operation> {
    let Json(req) = body?;
    let (Some(op_type), Some(action)) = (
        req.op_type.filter(|t| !t.is_empty()),
        req.action.filter(|a| !a.is_empty()),
    ) else {
        return Err(ApiError::BadRequest("type and action are required".to_string()));
    };
    let op = state.relay.store().add_operation(
        &device_id,
        &op_type,
        &action,
        req.payload,
        OperationStatus::Pending,
    );
    Ok(Envelope::data(op))
}

async fn last_operation(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<Option<Operation>> {
    match state.relay.store().get_last_operation(&device_id) {
        Some(op) => Ok(Envelope::data(Some(op))),
        None => Ok(Envelope::with_message(
            None,
            "No operations found for this device",
        )),
    }
}

async fn list_logs(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<hublink_store::DeviceLog>> {
    let Query(query) = query?;
    Ok(Envelope::list(
        state.relay.store().get_logs(&device_id, query.limit),
    ))
}

async fn create_log(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    body: Result<Json<CreateLogRequest>, JsonRejection>,
) -> ApiResult<hublink_store::DeviceLog> {
    let Json(req) = body?;
    let (Some(level), Some(message)) = (
        req.level.filter(|l| !l.is_empty()),
        req.message.filter(|m| !m.is_empty()),
    ) else {
        return Err(ApiError::BadRequest("level and message are required".to_string()));
    };
    let level = LogLevel::parse(&level).ok_or_else(|| {
        ApiError::BadRequest("level must be one of info, warn, error, debug".to_string())
    })?;
    Ok(Envelope::data(state.relay.store().add_log(
        &device_id,
        level,
        &message,
        req.metadata,
    )))
}

async fn list_interactions(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<hublink_store::Interaction>> {
    let Query(query) = query?;
    Ok(Envelope::list(
        state.relay.store().get_interactions(&device_id, query.limit),
    ))
}

async fn device_history(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<hublink_store::DeviceHistory> {
    let Query(query) = query?;
    Ok(Envelope::data(
        state.relay.store().get_device_history(&device_id, query.limit),
    ))
}

async fn device_control(
    State(state): State<ApiState>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(req) = body?;
    let invalid = || {
        ApiError::BadRequest(
            "Invalid parameters. Required: pin (number), action (ON/OFF), instanceId (string)"
                .to_string(),
        )
    };
    let pin = req.pin.as_ref().and_then(Value::as_i64).ok_or_else(invalid)?;
    let action = req.action.filter(|a| !a.is_empty()).ok_or_else(invalid)?;
    let instance_id = req.instance_id.filter(|i| !i.is_empty()).ok_or_else(invalid)?;
    let action = ControlAction::parse(&action)
        .ok_or_else(|| ApiError::BadRequest("Action must be either ON or OFF".to_string()))?;

    let dispatch = state
        .relay
        .dispatch_control(&instance_id, pin, action)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Envelope::with_message(
        json!({
            "pin": pin,
            "action": action.as_str(),
            "state": action.state(),
            "instanceId": instance_id,
            "operationId": dispatch.operation.id,
            "delivered": dispatch.delivered,
            "timestamp": iso_timestamp(Utc::now()),
        }),
        "Device control command sent",
    ))
}

async fn control_usage() -> Json<Value> {
    Json(json!({
        "endpoint": "POST /api/device/control",
        "description": "Control devices by sending PIN and action",
        "format": {
            "pin": "number (e.g., 13)",
            "action": "ON or OFF",
            "instanceId": "module name",
        },
        "example": {
            "pin": 13,
            "action": "ON",
            "instanceId": "living-room",
        },
    }))
}

/// Pin level as last commanded. A pin never commanded reads as OFF.
async fn device_status(
    State(state): State<ApiState>,
    query: Result<Query<PinStatusQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let Query(query) = query?;
    let (Some(pin), Some(instance_id)) = (
        query.pin.filter(|p| !p.is_empty()),
        query.instance_id.filter(|i| !i.is_empty()),
    ) else {
        return Err(ApiError::BadRequest(
            "Missing required parameters: pin and instanceId".to_string(),
        ));
    };
    let pin: i64 = pin
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest("PIN must be a valid number".to_string()))?;

    let (action, operation_id) = match state.relay.pin_state(&instance_id, pin) {
        Some((action, op)) => (action, Some(op.id)),
        None => (ControlAction::Off, None),
    };
    Ok(Envelope::data(json!({
        "pin": pin,
        "state": action.state(),
        "action": action.as_str(),
        "instanceId": instance_id,
        "operationId": operation_id,
        "timestamp": iso_timestamp(Utc::now()),
    })))
}
