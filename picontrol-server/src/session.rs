//! Request-scoped sessions
//!
//! `session_layer` loads the session from the `pb_auth` cookie, refreshes it
//! once against the auth backend, hands it to handlers as a `SessionStore`
//! request extension, and writes the resulting cookie state back. Sessions a
//! handler replaces or clears are revoked so their cookie cannot be replayed.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    middleware::Next,
    response::Response,
};

use picontrol_core::session::has_cookie;
use picontrol_core::{Principal, Session, SessionStore, authorize};

use crate::error::ApiError;
use crate::state::SharedState;

fn cookie_header(headers: &HeaderMap) -> String {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join("; ")
}

pub async fn session_layer(State(state): State<SharedState>, mut req: Request, next: Next) -> Response {
    let session_config = &state.config.session;
    let header = cookie_header(req.headers());
    let had_cookie = has_cookie(&header, &session_config.cookie_name);

    let mut loaded = Session::from_cookie_header(&header, &session_config.cookie_name);
    if state.revoked.is_revoked(&loaded).await {
        tracing::debug!("Ignoring signed-out session token");
        loaded = Session::empty();
    }

    let store = SessionStore::new(loaded.clone());
    if store.is_valid().await {
        let outcome = store.refresh(state.auth.as_ref()).await;
        tracing::debug!("Per-request auth refresh: {:?}", outcome);
    }

    let refreshed = store.snapshot().await;
    let epoch = store.epoch().await;
    req.extensions_mut().insert(store.clone());

    let mut response = next.run(req).await;

    // Logout or a new login ended the sessions this request arrived with
    if store.epoch().await != epoch {
        let current = store.snapshot().await;
        for ended in [&loaded, &refreshed] {
            if ended.token().is_some() && ended.token() != current.token() {
                state.revoked.revoke(ended).await;
            }
        }
    }

    // Untouched anonymous requests get no cookie churn
    if had_cookie || store.is_valid().await || store.epoch().await != epoch {
        for cookie in store.export_cookies(session_config).await {
            match HeaderValue::from_str(&cookie.encoded().to_string()) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(e) => tracing::warn!("Dropping unencodable auth cookie: {}", e),
            }
        }
    }

    response
}

/// The session of the current request
pub struct CurrentSession(pub SessionStore);

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionStore>()
            .cloned()
            .map(CurrentSession)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Authorized caller. Extracting it is the auth guard: a handler taking
/// `AuthUser` never runs for an unauthenticated request.
pub struct AuthUser(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentSession(store) = CurrentSession::from_request_parts(parts, state).await?;
        let principal = authorize(&store.snapshot().await)?;
        Ok(AuthUser(principal))
    }
}
