//! Session and device handlers

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use picontrol_core::{Device, DeviceDirectory, DeviceFields, Session};

use crate::error::ApiError;
use crate::session::{AuthUser, CurrentSession};
use crate::state::SharedState;

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "picontrol-server"
    }))
}

/// Login request body
#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default, alias = "email")]
    identity: String,
    #[serde(default)]
    password: String,
}

/// Password login against the users collection
pub async fn login_handler(
    State(state): State<SharedState>,
    CurrentSession(session): CurrentSession,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    if req.identity.is_empty() {
        return Err(ApiError::missing("identity"));
    }
    if req.password.is_empty() {
        return Err(ApiError::missing("password"));
    }

    let auth = state.auth.authenticate(&req.identity, &req.password).await?;
    let user = auth.record.clone();
    let authed = Session::from_auth(auth).map_err(|e| ApiError::Persistence(e.to_string()))?;
    session.replace(authed).await;

    tracing::info!("User {} logged in", user.id);
    Ok(Json(serde_json::json!({ "success": true, "user": user })))
}

/// Clear the session; the middleware expires the cookie under every scope
pub async fn logout_handler(CurrentSession(session): CurrentSession) -> Response {
    session.clear().await;

    let mut response = Json(serde_json::json!({ "success": true })).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

/// Create/update body; every field is required
#[derive(Deserialize)]
pub struct DeviceRequest {
    device_name: Option<String>,
    mac_addr: Option<String>,
    ip_addr: Option<String>,
    #[serde(rename = "type", alias = "device_type")]
    device_type: Option<String>,
}

impl DeviceRequest {
    fn into_fields(self) -> Result<DeviceFields, ApiError> {
        fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ApiError::missing(field))
        }

        Ok(DeviceFields {
            name: required(self.device_name, "device_name")?,
            mac_address: required(self.mac_addr, "mac_addr")?,
            ip_address: required(self.ip_addr, "ip_addr")?,
            device_type: required(self.device_type, "type")?,
        })
    }
}

/// `{"devices": [...]}`
#[derive(Serialize)]
pub struct DeviceList {
    devices: Vec<Device>,
}

/// `{"device": {...}}`, with `"success": true` on writes
#[derive(Serialize)]
pub struct DeviceEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    device: Device,
}

impl DeviceEnvelope {
    fn found(device: Device) -> Json<Self> {
        Json(Self { success: None, device })
    }

    fn written(device: Device) -> Json<Self> {
        Json(Self {
            success: Some(true),
            device,
        })
    }
}

fn parse_device(body: Result<Json<DeviceRequest>, JsonRejection>) -> Result<DeviceFields, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    req.into_fields()
}

pub async fn list_devices_handler(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
) -> Result<Json<DeviceList>, ApiError> {
    let directory = DeviceDirectory::new(state.store.as_ref(), &user.token);
    let devices = directory.list(Some(user.user_id())).await?;
    Ok(Json(DeviceList { devices }))
}

pub async fn create_device_handler(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
    body: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<DeviceEnvelope>, ApiError> {
    let fields = parse_device(body)?;
    let directory = DeviceDirectory::new(state.store.as_ref(), &user.token);
    Ok(DeviceEnvelope::written(directory.create(fields, Some(user.user_id())).await?))
}

pub async fn get_device_handler(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<DeviceEnvelope>, ApiError> {
    let directory = DeviceDirectory::new(state.store.as_ref(), &user.token);
    Ok(DeviceEnvelope::found(directory.get(&name, Some(user.user_id())).await?))
}

pub async fn update_device_handler(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
    Path(name): Path<String>,
    body: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<DeviceEnvelope>, ApiError> {
    let fields = parse_device(body)?;
    let directory = DeviceDirectory::new(state.store.as_ref(), &user.token);
    Ok(DeviceEnvelope::written(directory.update(&name, Some(user.user_id()), fields).await?))
}

pub async fn delete_device_handler(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let directory = DeviceDirectory::new(state.store.as_ref(), &user.token);
    directory.delete(&name, Some(user.user_id())).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
