//! Router assembly

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::{handlers, session, upstream};

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        // Session
        .route("/api/login", post(handlers::login_handler))
        .route("/api/logout", post(handlers::logout_handler))
        // Devices
        .route(
            "/api/devices",
            get(handlers::list_devices_handler).post(handlers::create_device_handler),
        )
        .route(
            "/api/devices/{device_name}",
            get(handlers::get_device_handler)
                .put(handlers::update_device_handler)
                .delete(handlers::delete_device_handler),
        )
        // Device-local services
        .route("/api/esp-status", get(upstream::esp_status_handler))
        .route("/api/esp-sensors", get(upstream::esp_sensors_handler))
        .route("/api/helper-status", get(upstream::helper_status_handler))
        .route(
            "/api/helper-proxy",
            get(upstream::helper_proxy_handler).post(upstream::helper_proxy_handler),
        )
        .route("/api/scan", get(upstream::scan_handler))
        .layer(middleware::from_fn_with_state(state.clone(), session::session_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
