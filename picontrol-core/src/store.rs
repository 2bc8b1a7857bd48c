//! Persistence seam for the devices collection

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::device::{Device, DeviceFields, NewDevice};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The store refused the request as malformed, e.g. an unknown filter field
    #[error("{0}")]
    BadRequest(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Record not found")]
    NotFound,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// The query itself was rejected (as opposed to failing to run)
    pub fn is_query_rejection(&self) -> bool {
        matches!(self, StoreError::BadRequest(_))
    }
}

/// Conjunction of `field = "value"` clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<(String, String)>,
}

impl Filter {
    pub fn eq(field: &str, value: &str) -> Self {
        Self {
            clauses: vec![(field.to_string(), value.to_string())],
        }
    }

    pub fn and_eq(mut self, field: &str, value: &str) -> Self {
        self.clauses.push((field.to_string(), value.to_string()));
        self
    }

    pub fn clauses(&self) -> impl Iterator<Item = (&str, &str)> {
        self.clauses.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }

    pub fn references(&self, field: &str) -> bool {
        self.clauses.iter().any(|(f, _)| f == field)
    }
}

/// Renders PocketBase filter syntax with values quoted and escaped
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            write!(f, "{}=\"{}\"", field, escaped)?;
        }
        Ok(())
    }
}

/// Devices collection. `auth` is the caller's token, forwarded so the store
/// can apply its own access rules.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list(&self, auth: &str, filter: Option<&Filter>, sort: &str) -> Result<Vec<Device>, StoreError>;

    /// First record matching `filter`, `None` if the query ran and matched nothing
    async fn first(&self, auth: &str, filter: &Filter) -> Result<Option<Device>, StoreError>;

    async fn create(&self, auth: &str, device: &NewDevice) -> Result<Device, StoreError>;

    async fn update(&self, auth: &str, id: &str, fields: &DeviceFields) -> Result<Device, StoreError>;

    async fn delete(&self, auth: &str, id: &str) -> Result<(), StoreError>;
}
