//! PocketBase REST API client
//!
//! PocketBase is the data store and identity provider. This client covers
//! the slice of its API the backend needs:
//! - password auth and token refresh on the users collection
//! - record CRUD on the devices collection
//!
//! Every call carries the caller's own token so PocketBase's collection rules
//! stay in force.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::auth::{AuthBackend, AuthError, AuthSession};
use crate::config::PocketBaseConfig;
use crate::device::{Device, DeviceFields, NewDevice};
use crate::store::{DeviceStore, Filter, StoreError};

/// Records fetched per page when listing
const LIST_BATCH: usize = 500;

/// PocketBase API client
#[derive(Clone)]
pub struct PocketBaseClient {
    client: Client,
    base_url: String,
    users_collection: String,
    devices_collection: String,
}

/// Error body returned by every PocketBase endpoint
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Map<String, serde_json::Value>,
}

impl ErrorBody {
    /// `message` plus per-field validation details, e.g.
    /// `Failed to create record. (device_name: Value must be unique.)`
    fn describe(&self, status: StatusCode) -> String {
        let mut message = if self.message.is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            self.message.clone()
        };

        let details: Vec<String> = self
            .data
            .iter()
            .filter_map(|(field, v)| v.get("message").and_then(|m| m.as_str()).map(|m| format!("{}: {}", field, m)))
            .collect();
        if !details.is_empty() {
            message.push_str(&format!(" ({})", details.join(", ")));
        }
        message
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

impl PocketBaseClient {
    pub fn new(config: &PocketBaseConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            users_collection: config.users_collection.clone(),
            devices_collection: config.devices_collection.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // Private helpers

    fn collection_url(&self, collection: &str, tail: &str) -> String {
        format!("{}/api/collections/{}/{}", self.base_url, collection, tail)
    }

    fn records_url(&self) -> String {
        self.collection_url(&self.devices_collection, "records")
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/{}", self.records_url(), id)
    }

    fn authed_request(&self, method: Method, url: &str, token: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        if token.is_empty() {
            req
        } else {
            req.header(reqwest::header::AUTHORIZATION, token)
        }
    }

    async fn handle_error_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body: ErrorBody = resp.json().await.unwrap_or_default();
        let message = body.describe(status);

        Err(match status {
            StatusCode::BAD_REQUEST => StoreError::BadRequest(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied(message),
            StatusCode::NOT_FOUND => StoreError::NotFound,
            _ => StoreError::ServerError(message),
        })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, StoreError> {
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    async fn fetch_page(
        &self,
        token: &str,
        filter: Option<&Filter>,
        sort: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Device>, StoreError> {
        let mut query = vec![
            ("page", page.to_string()),
            ("perPage", per_page.to_string()),
            ("skipTotal", "1".to_string()),
        ];
        if !sort.is_empty() {
            query.push(("sort", sort.to_string()));
        }
        if let Some(filter) = filter {
            query.push(("filter", filter.to_string()));
        }

        let resp = self
            .authed_request(Method::GET, &self.records_url(), token)
            .query(&query)
            .send()
            .await?;
        let resp = Self::handle_error_status(resp).await?;
        let list: ListResponse<Device> = Self::decode(resp).await?;
        Ok(list.items)
    }

    async fn auth_call(&self, tail: &str, token: &str, body: Option<serde_json::Value>) -> Result<AuthSession, AuthError> {
        let url = self.collection_url(&self.users_collection, tail);
        let mut req = self.authed_request(Method::POST, &url, token);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        match resp.status() {
            s if s.is_success() => {
                let bytes = resp.bytes().await?;
                serde_json::from_slice(&bytes).map_err(|e| AuthError::InvalidResponse(e.to_string()))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Err(AuthError::Rejected),
            StatusCode::BAD_REQUEST => Err(AuthError::InvalidCredentials),
            s => Err(AuthError::InvalidResponse(format!("HTTP {}", s.as_u16()))),
        }
    }
}

#[async_trait]
impl AuthBackend for PocketBaseClient {
    async fn authenticate(&self, identity: &str, password: &str) -> Result<AuthSession, AuthError> {
        let body = serde_json::json!({ "identity": identity, "password": password });
        self.auth_call("auth-with-password", "", Some(body)).await
    }

    async fn refresh(&self, token: &str) -> Result<AuthSession, AuthError> {
        self.auth_call("auth-refresh", token, None).await
    }
}

#[async_trait]
impl DeviceStore for PocketBaseClient {
    async fn list(&self, auth: &str, filter: Option<&Filter>, sort: &str) -> Result<Vec<Device>, StoreError> {
        let mut devices = Vec::new();
        let mut page = 1;

        loop {
            let items = self.fetch_page(auth, filter, sort, page, LIST_BATCH).await?;
            let short = items.len() < LIST_BATCH;
            devices.extend(items);
            if short {
                return Ok(devices);
            }
            page += 1;
        }
    }

    async fn first(&self, auth: &str, filter: &Filter) -> Result<Option<Device>, StoreError> {
        let items = self.fetch_page(auth, Some(filter), "", 1, 1).await?;
        Ok(items.into_iter().next())
    }

    async fn create(&self, auth: &str, device: &NewDevice) -> Result<Device, StoreError> {
        let resp = self
            .authed_request(Method::POST, &self.records_url(), auth)
            .json(device)
            .send()
            .await?;
        let resp = Self::handle_error_status(resp).await?;
        Self::decode(resp).await
    }

    async fn update(&self, auth: &str, id: &str, fields: &DeviceFields) -> Result<Device, StoreError> {
        let resp = self
            .authed_request(Method::PATCH, &self.record_url(id), auth)
            .json(fields)
            .send()
            .await?;
        let resp = Self::handle_error_status(resp).await?;
        Self::decode(resp).await
    }

    async fn delete(&self, auth: &str, id: &str) -> Result<(), StoreError> {
        let resp = self
            .authed_request(Method::DELETE, &self.record_url(id), auth)
            .send()
            .await?;
        Self::handle_error_status(resp).await?;
        Ok(())
    }
}
