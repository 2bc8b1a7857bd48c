//! Shared server state

use std::sync::Arc;

use picontrol_core::{AuthBackend, Config, DeviceStore, PocketBaseClient, RevokedTokens, UpstreamProxy};

pub type SharedState = Arc<AppState>;

/// Process-wide collaborators; per-request session state lives in the
/// request's `SessionStore` extension, never here. Only signed-out tokens
/// are remembered across requests.
pub struct AppState {
    pub config: Config,

    /// Issues and refreshes session tokens
    pub auth: Arc<dyn AuthBackend>,

    /// Devices collection
    pub store: Arc<dyn DeviceStore>,

    /// Device-local services and the network scanner
    pub proxy: UpstreamProxy,

    /// Tokens of sessions ended by logout or a new login
    pub revoked: RevokedTokens,
}

impl AppState {
    pub fn new(config: Config, auth: Arc<dyn AuthBackend>, store: Arc<dyn DeviceStore>) -> Self {
        let proxy = UpstreamProxy::new(config.upstream.clone());
        Self {
            config,
            auth,
            store,
            proxy,
            revoked: RevokedTokens::new(),
        }
    }

    /// State backed by a single PocketBase instance for both auth and storage
    pub fn with_pocketbase(config: Config) -> Self {
        let client = Arc::new(PocketBaseClient::new(&config.pocketbase));
        Self::new(config, client.clone(), client)
    }
}
