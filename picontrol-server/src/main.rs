//! picontrol-server: HTTP backend for managing networked devices
//!
//! This server sits between the browser and the services it manages:
//! - Carries the PocketBase session in the `pb_auth` cookie and refreshes it
//! - Serves owner-scoped device CRUD on top of the PocketBase collection
//! - Proxies status and control calls to ESP32 firmware and helper daemons
//! - Fronts the local network scanner

mod app;
mod error;
mod handlers;
mod session;
mod state;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use picontrol_core::Config;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "picontrol_server=debug,picontrol_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("PocketBase backend: {}", config.pocketbase.url);

    let addr = SocketAddr::from((config.server.listen_addr.parse::<std::net::IpAddr>()?, config.server.port));
    let state = Arc::new(AppState::with_pocketbase(config));
    let app = app::build_router(state);

    tracing::info!("picontrol-server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
