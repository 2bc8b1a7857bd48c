//! Upstream proxy to device-local services
//!
//! Requests are forwarded to a service on a managed device (helper daemon,
//! sensor firmware) or to the local network scanner. Each call is a single
//! attempt bounded by a timeout; dropping the future on timeout releases the
//! connection. The caller's `pb_auth` cookie never leaves this process.
//! An `Authorization` header is meant for the upstream service itself and is
//! forwarded as is.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::status::{StatusReply, normalize_status};

/// Path prefix for endpoint names without a fixed mapping
pub const GENERIC_PREFIX: &str = "/";

/// Headers never forwarded upstream: the session cookie, the hop-by-hop set,
/// and `accept-encoding` since bodies are relayed without decoding
const STRIPPED_HEADERS: [&str; 12] = [
    "cookie",
    "host",
    "accept-encoding",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid target host: {0}")]
    InvalidTarget(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("{url} did not respond within {}ms", .after.as_millis())]
    Timeout { url: String, after: Duration },

    #[error("Failed to reach {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

impl ProxyError {
    /// Bad input from the caller, as opposed to an upstream failure
    pub fn is_validation(&self) -> bool {
        matches!(self, ProxyError::InvalidTarget(_) | ProxyError::InvalidEndpoint(_))
    }

    fn from_reqwest(url: &str, after: Duration, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            ProxyError::Timeout {
                url: url.to_string(),
                after,
            }
        } else {
            ProxyError::Unreachable {
                url: url.to_string(),
                source,
            }
        }
    }
}

/// Kind of upstream service; fixes the port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Helper daemon on SSH-accessible hosts
    Helper,
    /// ESP32 sensor firmware
    Firmware,
    /// Local network-scan service
    Scanner,
}

impl ServiceKind {
    pub fn label(self) -> &'static str {
        match self {
            ServiceKind::Helper => "Helper",
            ServiceKind::Firmware => "ESP32",
            ServiceKind::Scanner => "Scanner",
        }
    }

    pub fn port(self, config: &UpstreamConfig) -> u16 {
        match self {
            ServiceKind::Helper => config.helper_port,
            ServiceKind::Firmware => config.firmware_port,
            ServiceKind::Scanner => config.scanner_port,
        }
    }

    fn known_endpoints(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ServiceKind::Firmware => &[("status", "/status"), ("sensors", "/sensors")],
            ServiceKind::Helper => &[
                ("status", "/status"),
                ("services", "/services"),
                ("service/status", "/service/status"),
                ("service-status", "/service/status"),
                ("service/control", "/service/control"),
                ("service-control", "/service/control"),
                ("install", "/install"),
                ("uninstall", "/uninstall"),
                ("search", "/search"),
                ("list_installed", "/list_installed"),
                ("list-installed", "/list_installed"),
            ],
            ServiceKind::Scanner => &[("scan", "/scan")],
        }
    }

    /// Resolve an endpoint name to a request path
    pub fn endpoint_path(self, endpoint: &str) -> Result<String, ProxyError> {
        let name = endpoint.trim().trim_start_matches('/');
        if name.is_empty()
            || name.contains("..")
            || name.contains("://")
            || name.contains(['?', '#', '\\'])
            || name.chars().any(char::is_control)
        {
            return Err(ProxyError::InvalidEndpoint(endpoint.to_string()));
        }

        Ok(self
            .known_endpoints()
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, path)| path.to_string())
            .unwrap_or_else(|| format!("{}{}", GENERIC_PREFIX, name)))
    }
}

/// Where a proxied request goes. Built per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    host: String,
    port: u16,
    path: String,
}

impl ProxyTarget {
    pub fn new(host: &str, port: u16, path: &str) -> Result<Self, ProxyError> {
        let host = host.trim();
        if !is_valid_host(host) {
            return Err(ProxyError::InvalidTarget(host.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn url(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("http://[{}]:{}{}", ip, self.port, self.path),
            _ => format!("http://{}:{}{}", self.host, self.port, self.path),
        }
    }
}

/// IP literal or a plain DNS hostname; nothing that could smuggle a
/// userinfo, port or path into the URL
fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }

    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with(['-', '.'])
        && host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Copy of `headers` without the session cookie and hop-by-hop headers
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in STRIPPED_HEADERS {
        forwarded.remove(name);
    }
    forwarded
}

/// One request to forward
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub target: ProxyTarget,
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

impl ProxyRequest {
    pub fn new(target: ProxyTarget, method: Method, timeout: Duration) -> Self {
        Self {
            target,
            method,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// Upstream answer, passed back verbatim
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub content_encoding: Option<HeaderValue>,
    pub body: Bytes,
}

/// Host found by the network scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    #[serde(rename(serialize = "mac_address", deserialize = "mac"))]
    pub mac_address: String,
    #[serde(rename(serialize = "ip_address", deserialize = "ip"))]
    pub ip_address: String,
}

/// HTTP forwarder for device-local services
#[derive(Clone)]
pub struct UpstreamProxy {
    client: Client,
    config: UpstreamConfig,
}

impl UpstreamProxy {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Target for `endpoint` of the `kind` service on `host`
    pub fn target(&self, kind: ServiceKind, host: &str, endpoint: &str) -> Result<ProxyTarget, ProxyError> {
        ProxyTarget::new(host, kind.port(&self.config), &kind.endpoint_path(endpoint)?)
    }

    /// Forward one request; a single attempt bounded by `request.timeout`.
    pub async fn forward(&self, request: ProxyRequest) -> Result<UpstreamResponse, ProxyError> {
        let url = request.target.url();
        let timeout = request.timeout;
        tracing::debug!("Proxying {} {}", request.method, url);

        let mut builder = self
            .client
            .request(request.method, &url)
            .headers(forwardable_headers(&request.headers))
            .timeout(timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::from_reqwest(&url, timeout, e))?;

        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let content_encoding = response.headers().get(header::CONTENT_ENCODING).cloned();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::from_reqwest(&url, timeout, e))?;

        Ok(UpstreamResponse {
            status,
            content_type,
            content_encoding,
            body,
        })
    }

    /// Poll a service's status endpoint.
    ///
    /// Unreachable, slow, or failing services read as `offline`; only an
    /// invalid host is an error.
    pub async fn poll_status(&self, kind: ServiceKind, host: &str) -> Result<StatusReply, ProxyError> {
        let target = self.target(kind, host, "status")?;
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let request = ProxyRequest::new(target, Method::GET, self.config.status_timeout()).headers(headers);

        let reply = match self.forward(request).await {
            Ok(resp) if resp.status.is_success() => normalize_status(&resp.body).into(),
            Ok(resp) => StatusReply::offline(format!("{} returned {}", kind.label(), resp.status)),
            Err(ProxyError::Timeout { .. }) => StatusReply::offline("Device unreachable"),
            Err(e) => StatusReply::offline(format!("Connection failed: {}", e)),
        };

        if let StatusReply::Offline { error } = &reply {
            tracing::warn!("{} at {} is offline: {}", kind.label(), host, error);
        }
        Ok(reply)
    }

    /// Ask the scanner service for hosts on the local network
    pub async fn scan(&self) -> Result<Vec<ScannedDevice>, ProxyError> {
        let target = self.target(ServiceKind::Scanner, &self.config.scanner_host, "scan")?;
        let url = target.url();
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let request = ProxyRequest::new(target, Method::GET, self.config.scan_timeout()).headers(headers);

        let resp = self.forward(request).await?;
        if !resp.status.is_success() {
            return Err(ProxyError::InvalidResponse {
                url,
                message: format!("HTTP {}", resp.status.as_u16()),
            });
        }

        // The scanner encodes "nothing found" as null
        let devices: Option<Vec<ScannedDevice>> =
            serde_json::from_slice(&resp.body).map_err(|e| ProxyError::InvalidResponse {
                url,
                message: e.to_string(),
            })?;
        let devices = devices.unwrap_or_default();
        tracing::info!("Scan complete, found {} devices", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_urls() {
        let config = UpstreamConfig::default();
        let proxy = UpstreamProxy::new(config);

        let status = proxy.target(ServiceKind::Firmware, "192.168.1.50", "status").unwrap();
        assert_eq!(status.url(), "http://192.168.1.50:8321/status");

        let helper = proxy.target(ServiceKind::Helper, "pi.local", "service-status").unwrap();
        assert_eq!(helper.url(), "http://pi.local:8220/service/status");

        let v6 = proxy.target(ServiceKind::Helper, "fe80::1", "status").unwrap();
        assert_eq!(v6.url(), "http://[fe80::1]:8220/status");
    }

    #[test]
    fn test_unknown_endpoint_uses_generic_prefix() {
        assert_eq!(ServiceKind::Helper.endpoint_path("packages/upgrade").unwrap(), "/packages/upgrade");
        assert_eq!(ServiceKind::Firmware.endpoint_path("/config").unwrap(), "/config");
    }

    #[test]
    fn test_rejects_bad_endpoints() {
        for endpoint in ["", "../etc/passwd", "http://evil", "status?x=1", "a#b"] {
            assert!(
                matches!(ServiceKind::Helper.endpoint_path(endpoint), Err(ProxyError::InvalidEndpoint(_))),
                "{endpoint}"
            );
        }
    }

    #[test]
    fn test_rejects_bad_hosts() {
        for host in ["", "evil.com/path", "user@host", "host:80", "-x", "a b"] {
            assert!(
                matches!(ProxyTarget::new(host, 80, "/"), Err(ProxyError::InvalidTarget(_))),
                "{host}"
            );
        }
        assert!(ProxyTarget::new("10.0.0.1", 80, "/").is_ok());
        assert!(ProxyTarget::new("esp-kitchen", 80, "/").is_ok());
    }

    #[test]
    fn test_strips_session_and_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("pb_auth=secret"));
        headers.insert(header::HOST, HeaderValue::from_static("app.local"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer helper-session"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("42"));

        let forwarded = forwardable_headers(&headers);
        assert!(forwarded.get(header::COOKIE).is_none());
        assert!(forwarded.get(header::HOST).is_none());
        assert!(forwarded.get(header::ACCEPT_ENCODING).is_none());
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert_eq!(forwarded.get(header::AUTHORIZATION).unwrap(), "Bearer helper-session");
        assert_eq!(forwarded.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(forwarded.get("x-request-id").unwrap(), "42");
    }

    #[test]
    fn test_scanned_device_mapping() {
        let devices: Vec<ScannedDevice> =
            serde_json::from_str(r#"[{"ip":"192.168.1.7","mac":"aa:bb:cc:dd:ee:ff"}]"#).unwrap();
        let json = serde_json::to_value(&devices).unwrap();
        assert_eq!(json[0]["mac_address"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(json[0]["ip_address"], "192.168.1.7");
    }

    #[tokio::test]
    async fn test_poll_unreachable_is_offline() {
        // Port 9 (discard) on loopback is closed on test hosts
        let config = UpstreamConfig {
            firmware_port: 9,
            status_timeout_ms: 500,
            ..UpstreamConfig::default()
        };
        let proxy = UpstreamProxy::new(config);

        let reply = tokio_test::assert_ok!(proxy.poll_status(ServiceKind::Firmware, "127.0.0.1").await);
        assert!(matches!(reply, StatusReply::Offline { .. }));
    }

    #[tokio::test]
    async fn test_poll_invalid_host_is_error() {
        let proxy = UpstreamProxy::new(UpstreamConfig::default());
        let result = proxy.poll_status(ServiceKind::Firmware, "evil.com/x").await;
        assert!(result.is_err_and(|e| e.is_validation()));
    }
}
