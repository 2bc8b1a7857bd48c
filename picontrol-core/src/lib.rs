//! picontrol-core: Shared library for the picontrol device backend
//!
//! This crate provides:
//! - Cookie-backed session model with a concurrent-safe refresh store
//! - The auth guard used by every protected route
//! - PocketBase REST client (authentication + device collection)
//! - Device directory with an ordered owner-fallback lookup policy
//! - Upstream proxy to device-local services with status normalization

pub mod auth;
pub mod config;
pub mod device;
pub mod pocketbase;
pub mod proxy;
pub mod session;
pub mod status;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use auth::{AuthBackend, AuthError, AuthSession, Principal, Unauthorized, UserRecord, authorize};
pub use config::Config;
pub use device::{Device, DeviceDirectory, DeviceFields, DirectoryError, LookupStrategy, NewDevice};
pub use pocketbase::PocketBaseClient;
pub use proxy::{ProxyError, ProxyRequest, ScannedDevice, ServiceKind, UpstreamProxy, UpstreamResponse};
pub use session::{RefreshOutcome, RefreshPolicy, RevokedTokens, Session, SessionStore};
pub use status::{NormalizedStatus, StatusReply};
pub use store::{DeviceStore, Filter, StoreError};

/// Name of the auth cookie shared with the PocketBase JS SDK
pub const AUTH_COOKIE: &str = "pb_auth";

/// Default HTTP port for picontrol-server
pub const DEFAULT_HTTP_PORT: u16 = 5173;

/// PocketBase data store
pub const DEFAULT_POCKETBASE_PORT: u16 = 8090;

/// Helper daemon running on managed hosts
pub const DEFAULT_HELPER_PORT: u16 = 8220;

/// ESP32 sensor firmware
pub const DEFAULT_FIRMWARE_PORT: u16 = 8321;

/// Local network-scan service
pub const DEFAULT_SCANNER_PORT: u16 = 3000;
