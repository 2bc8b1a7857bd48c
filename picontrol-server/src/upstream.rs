//! Device-service proxy and network scan handlers

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, Method, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use picontrol_core::{ProxyRequest, ScannedDevice, ServiceKind, StatusReply, UpstreamResponse};

use crate::error::ApiError;
use crate::session::AuthUser;
use crate::state::SharedState;

/// Query parameters consumed by the proxy itself rather than forwarded
const PROXY_PARAMS: [&str; 2] = ["ip", "endpoint"];

fn param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

fn required_param<'a>(query: &'a [(String, String)], name: &str) -> Result<&'a str, ApiError> {
    param(query, name).ok_or_else(|| ApiError::Validation(format!("Missing required query parameter: {}", name)))
}

fn passthrough(upstream: UpstreamResponse) -> Response {
    let mut response = Response::builder().status(upstream.status);
    if let Some(content_type) = upstream.content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(encoding) = upstream.content_encoding {
        response = response.header(header::CONTENT_ENCODING, encoding);
    }
    response
        .body(Body::from(upstream.body))
        .unwrap_or_else(|e| ApiError::UpstreamUnreachable(e.to_string()).into_response())
}

async fn poll(state: &SharedState, kind: ServiceKind, query: &[(String, String)]) -> Result<Json<StatusReply>, ApiError> {
    let ip = required_param(query, "ip")?;
    Ok(Json(state.proxy.poll_status(kind, ip).await?))
}

/// Normalized status of the sensor firmware; unreachable reads as offline
pub async fn esp_status_handler(
    _user: AuthUser,
    State(state): State<SharedState>,
    Query(query): Query<Vec<(String, String)>>,
) -> Result<Json<StatusReply>, ApiError> {
    poll(&state, ServiceKind::Firmware, &query).await
}

/// Normalized status of the helper daemon; unreachable reads as offline
pub async fn helper_status_handler(
    _user: AuthUser,
    State(state): State<SharedState>,
    Query(query): Query<Vec<(String, String)>>,
) -> Result<Json<StatusReply>, ApiError> {
    poll(&state, ServiceKind::Helper, &query).await
}

/// Raw sensor readings from the firmware
pub async fn esp_sensors_handler(
    _user: AuthUser,
    State(state): State<SharedState>,
    Query(query): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let ip = required_param(&query, "ip")?;
    let target = state.proxy.target(ServiceKind::Firmware, ip, "sensors")?;

    let request = ProxyRequest::new(target, Method::GET, state.config.upstream.proxy_timeout());
    Ok(passthrough(state.proxy.forward(request).await?))
}

/// Generic forward to a helper daemon endpoint (GET and POST)
pub async fn helper_proxy_handler(
    _user: AuthUser,
    State(state): State<SharedState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ip = required_param(&query, "ip")?;
    let endpoint = required_param(&query, "endpoint")?;
    let target = state.proxy.target(ServiceKind::Helper, ip, endpoint)?;

    let mut request = ProxyRequest::new(target, method.clone(), state.config.upstream.proxy_timeout()).headers(headers);
    if method == Method::GET {
        let forwarded = query
            .iter()
            .filter(|(k, _)| !PROXY_PARAMS.contains(&k.as_str()))
            .cloned()
            .collect();
        request = request.query(forwarded);
    } else {
        request = request.body(body);
    }

    tracing::debug!("Helper proxy {} {} on {}", method, endpoint, ip);
    Ok(passthrough(state.proxy.forward(request).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    network_devices: Vec<ScannedDevice>,
}

/// Hosts found on the local network by the scanner service
pub async fn scan_handler(_user: AuthUser, State(state): State<SharedState>) -> Result<Json<ScanResponse>, ApiError> {
    let network_devices = state.proxy.scan().await?;
    Ok(Json(ScanResponse { network_devices }))
}
