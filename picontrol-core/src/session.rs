//! Cookie-backed sessions
//!
//! A [`Session`] is either fully authenticated (token + user record + expiry)
//! or empty. It is mirrored into the `pb_auth` cookie using the same JSON
//! payload the PocketBase JS SDK writes, so browser and server agree on it.
//!
//! [`SessionStore`] is the shared handle two independent triggers write
//! through: the per-request refresh and the background refresh task. Writes
//! are whole-value swaps under a lock; never a field at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::auth::{AuthBackend, AuthSession, TokenError, UserRecord, decode_claims, unix_now};
use crate::config::SessionConfig;

#[derive(Debug, Clone, PartialEq)]
struct SessionAuth {
    token: String,
    user: UserRecord,
    valid_until: i64,
}

/// Authenticated identity for one browser client, or nothing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    auth: Option<SessionAuth>,
}

/// JSON stored inside the cookie
#[derive(Serialize, Deserialize)]
struct CookiePayload {
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record: Option<UserRecord>,
    // Older SDK releases wrote the record under "model"
    #[serde(default, skip_serializing)]
    model: Option<UserRecord>,
}

impl Session {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a session from an auth response; fails if the token is unreadable.
    pub fn from_auth(auth: AuthSession) -> Result<Self, TokenError> {
        let claims = decode_claims(&auth.token)?;
        Ok(Self {
            auth: Some(SessionAuth {
                token: auth.token,
                user: auth.record,
                valid_until: claims.exp,
            }),
        })
    }

    /// Parse the session out of a raw `Cookie` request header.
    ///
    /// Anything missing or malformed yields an empty session.
    pub fn from_cookie_header(header: &str, cookie_name: &str) -> Self {
        let Some(value) = cookie_value(header, cookie_name) else {
            return Self::empty();
        };

        let payload: CookiePayload = match serde_json::from_str(&value) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Ignoring malformed auth cookie: {}", e);
                return Self::empty();
            }
        };

        let Some(record) = payload.record.or(payload.model) else {
            return Self::empty();
        };

        Self::from_auth(AuthSession {
            token: payload.token,
            record,
        })
        .unwrap_or_else(|e| {
            tracing::debug!("Ignoring auth cookie with unreadable token: {}", e);
            Self::empty()
        })
    }

    pub fn token(&self) -> Option<&str> {
        self.auth.as_ref().map(|a| a.token.as_str())
    }

    pub fn user(&self) -> Option<&UserRecord> {
        self.auth.as_ref().map(|a| &a.user)
    }

    pub fn valid_until(&self) -> Option<i64> {
        self.auth.as_ref().map(|a| a.valid_until)
    }

    pub fn is_empty(&self) -> bool {
        self.auth.is_none()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(unix_now())
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        self.auth
            .as_ref()
            .is_some_and(|a| !a.token.is_empty() && a.valid_until > now)
    }

    /// Cookies that persist this session in the browser.
    ///
    /// A valid session exports one cookie; anything else exports removal
    /// cookies for every scope the auth cookie may have been set under.
    pub fn to_cookies(&self, config: &SessionConfig) -> Vec<Cookie<'static>> {
        match &self.auth {
            Some(auth) if self.is_valid() => {
                let payload = CookiePayload {
                    token: auth.token.clone(),
                    record: Some(auth.user.clone()),
                    model: None,
                };
                let Ok(value) = serde_json::to_string(&payload) else {
                    return removal_cookies(&config.cookie_name);
                };

                let cookie = Cookie::build((config.cookie_name.clone(), value))
                    .path("/")
                    .http_only(true)
                    .secure(config.secure)
                    .same_site(SameSite::Lax)
                    .expires(OffsetDateTime::from_unix_timestamp(auth.valid_until).ok())
                    .build();
                vec![cookie]
            }
            _ => removal_cookies(&config.cookie_name),
        }
    }
}

fn cookie_value(header: &str, cookie_name: &str) -> Option<String> {
    Cookie::split_parse_encoded(header)
        .filter_map(Result::ok)
        .find(|c| c.name() == cookie_name)
        .map(|c| c.value().to_string())
}

/// Whether the raw `Cookie` header carries `cookie_name` at all, even empty
pub fn has_cookie(header: &str, cookie_name: &str) -> bool {
    cookie_value(header, cookie_name).is_some()
}

/// A cookie scope the auth cookie has historically been written under
#[derive(Debug, Clone, Copy)]
struct CookieScope {
    domain: Option<&'static str>,
    http_only: Option<bool>,
    secure: Option<bool>,
}

/// Browsers key cookies by (name, domain, path); a removal only hits the
/// variant with matching attributes, so each one is expired separately.
const REMOVAL_SCOPES: [CookieScope; 5] = [
    CookieScope { domain: None, http_only: None, secure: None },
    CookieScope { domain: Some("localhost"), http_only: None, secure: None },
    CookieScope { domain: Some("127.0.0.1"), http_only: None, secure: None },
    CookieScope { domain: None, http_only: Some(true), secure: None },
    CookieScope { domain: None, http_only: Some(true), secure: Some(false) },
];

/// Immediately-expiring cookies covering every known auth cookie scope
pub fn removal_cookies(name: &str) -> Vec<Cookie<'static>> {
    REMOVAL_SCOPES
        .iter()
        .map(|scope| {
            let mut builder = Cookie::build((name.to_string(), String::new()))
                .path("/")
                .same_site(SameSite::Lax);
            if let Some(domain) = scope.domain {
                builder = builder.domain(domain);
            }
            if let Some(http_only) = scope.http_only {
                builder = builder.http_only(http_only);
            }
            if let Some(secure) = scope.secure {
                builder = builder.secure(secure);
            }

            let mut cookie = builder.build();
            cookie.make_removal();
            cookie
        })
        .collect()
}

/// Result of one refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New token installed
    Refreshed,
    /// Nothing to refresh (empty or expired session)
    Skipped,
    /// Refresh failed and the session was cleared
    Cleared,
    /// Another write landed first; this attempt changed nothing
    Superseded,
}

#[derive(Debug, Default)]
struct Slot {
    session: Session,
    /// Bumped on every write
    generation: u64,
    /// Bumped on explicit replace/clear (login, logout)
    epoch: u64,
}

/// What a refresh started from
struct Ticket {
    token: String,
    generation: u64,
    epoch: u64,
}

/// Shared, concurrently refreshable session handle
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    slot: Arc<RwLock<Slot>>,
}

impl SessionStore {
    pub fn new(session: Session) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Slot {
                session,
                generation: 0,
                epoch: 0,
            })),
        }
    }

    pub async fn snapshot(&self) -> Session {
        self.slot.read().await.session.clone()
    }

    pub async fn is_valid(&self) -> bool {
        self.slot.read().await.session.is_valid()
    }

    /// Explicit-write counter; changes when a handler logged in or out
    pub async fn epoch(&self) -> u64 {
        self.slot.read().await.epoch
    }

    /// Install a new session (login). Any refresh in flight is discarded.
    pub async fn replace(&self, session: Session) {
        let mut slot = self.slot.write().await;
        slot.session = session;
        slot.generation += 1;
        slot.epoch += 1;
    }

    /// Drop the session (logout). Any refresh in flight is discarded.
    pub async fn clear(&self) {
        self.replace(Session::empty()).await;
    }

    pub async fn export_cookies(&self, config: &SessionConfig) -> Vec<Cookie<'static>> {
        self.snapshot().await.to_cookies(config)
    }

    /// Refresh once; a failure clears the session instead of retrying.
    ///
    /// Safe to call concurrently: the last successful response wins and a
    /// failure never clears a session another caller refreshed meanwhile.
    pub async fn refresh(&self, backend: &dyn AuthBackend) -> RefreshOutcome {
        let Some(ticket) = self.begin().await else {
            return RefreshOutcome::Skipped;
        };

        match backend.refresh(&ticket.token).await {
            Ok(auth) => self.complete(&ticket, auth).await,
            Err(e) => {
                tracing::warn!("Auth refresh failed: {}", e);
                self.abandon(&ticket).await
            }
        }
    }

    /// Start the periodic refresh task for this store.
    ///
    /// Stop it by aborting the returned handle.
    pub fn spawn_auto_refresh(&self, backend: Arc<dyn AuthBackend>, policy: RefreshPolicy) -> JoinHandle<()> {
        let store = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy.interval);
            // First tick completes immediately
            ticker.tick().await;
            let mut failures = 0u32;

            loop {
                ticker.tick().await;

                let Some(ticket) = store.begin().await else {
                    failures = 0;
                    continue;
                };

                match backend.refresh(&ticket.token).await {
                    Ok(auth) => {
                        failures = 0;
                        let outcome = store.complete(&ticket, auth).await;
                        tracing::debug!("Background auth refresh: {:?}", outcome);
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            "Background auth refresh failed ({}/{}): {}",
                            failures,
                            policy.max_failures,
                            e
                        );
                        if failures >= policy.max_failures {
                            failures = 0;
                            store.abandon(&ticket).await;
                        }
                    }
                }
            }
        })
    }

    async fn begin(&self) -> Option<Ticket> {
        let slot = self.slot.read().await;
        if !slot.session.is_valid() {
            return None;
        }

        slot.session.token().map(|token| Ticket {
            token: token.to_string(),
            generation: slot.generation,
            epoch: slot.epoch,
        })
    }

    async fn complete(&self, ticket: &Ticket, auth: AuthSession) -> RefreshOutcome {
        let session = match Session::from_auth(auth) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Auth refresh returned an unreadable token: {}", e);
                return self.abandon(ticket).await;
            }
        };

        let mut slot = self.slot.write().await;
        if slot.epoch != ticket.epoch {
            return RefreshOutcome::Superseded;
        }
        slot.session = session;
        slot.generation += 1;
        RefreshOutcome::Refreshed
    }

    async fn abandon(&self, ticket: &Ticket) -> RefreshOutcome {
        let mut slot = self.slot.write().await;
        if slot.generation != ticket.generation {
            return RefreshOutcome::Superseded;
        }
        slot.session = Session::empty();
        slot.generation += 1;
        RefreshOutcome::Cleared
    }
}

/// Background refresh schedule
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// Must stay below the token lifetime
    pub interval: Duration,
    /// Consecutive failures tolerated before clearing
    pub max_failures: u32,
}

/// Tokens signed out before their expiry.
///
/// The data store honours a token until `exp`, so a signed-out cookie
/// replayed later would refresh into a live session again. Entries are
/// pruned once the token would have expired anyway.
#[derive(Debug, Clone, Default)]
pub struct RevokedTokens {
    tokens: Arc<RwLock<HashMap<String, i64>>>,
}

impl RevokedTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse `session`'s token from now until it expires
    pub async fn revoke(&self, session: &Session) {
        let (Some(token), Some(valid_until)) = (session.token(), session.valid_until()) else {
            return;
        };

        let now = unix_now();
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, exp| *exp > now);
        if valid_until > now {
            tokens.insert(token.to_string(), valid_until);
        }
    }

    pub async fn is_revoked(&self, session: &Session) -> bool {
        match session.token() {
            Some(token) => self.tokens.read().await.contains_key(token),
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticAuthBackend, auth_cookie_header, token_for, user};

    fn session_for(id: &str, ttl: i64) -> Session {
        Session::from_auth(AuthSession {
            token: token_for(id, ttl),
            record: user(id),
        })
        .unwrap()
    }

    #[test]
    fn test_load_from_cookie() {
        let session = session_for("u1", 900);
        let header = auth_cookie_header(&session);

        let loaded = Session::from_cookie_header(&format!("theme=dark; {}", header), "pb_auth");
        assert_eq!(loaded, session);
        assert!(loaded.is_valid());
    }

    #[test]
    fn test_load_accepts_legacy_model_key() {
        let token = token_for("u1", 900);
        let json = serde_json::json!({ "token": token, "model": { "id": "u1" } }).to_string();
        let header = Cookie::new("pb_auth", json).encoded().to_string();

        let loaded = Session::from_cookie_header(&header, "pb_auth");
        assert_eq!(loaded.user().map(|u| u.id.as_str()), Some("u1"));
    }

    #[test]
    fn test_load_malformed_yields_empty() {
        for header in [
            "",
            "pb_auth=",
            "pb_auth=not-json",
            "pb_auth=%7B%22token%22%3A%22%22%7D",
            "other=1",
        ] {
            assert!(Session::from_cookie_header(header, "pb_auth").is_empty(), "{header}");
        }

        // Token without a user record is not a session
        let json = serde_json::json!({ "token": token_for("u1", 900) }).to_string();
        let header = Cookie::new("pb_auth", json).encoded().to_string();
        assert!(Session::from_cookie_header(&header, "pb_auth").is_empty());
    }

    #[test]
    fn test_has_cookie() {
        assert!(has_cookie("pb_auth=", "pb_auth"));
        assert!(has_cookie("a=1; pb_auth=x", "pb_auth"));
        assert!(!has_cookie("a=1", "pb_auth"));
    }

    #[test]
    fn test_export_valid_session() {
        let cookies = session_for("u1", 900).to_cookies(&SessionConfig::default());
        assert_eq!(cookies.len(), 1);

        let cookie = &cookies[0];
        assert_eq!(cookie.name(), "pb_auth");
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_ne!(cookie.secure(), Some(true));
        assert!(cookie.expires_datetime().is_some());
    }

    #[test]
    fn test_export_cleared_session_covers_every_scope() {
        let cookies = Session::empty().to_cookies(&SessionConfig::default());
        assert_eq!(cookies.len(), 5);

        let domains: Vec<_> = cookies.iter().map(|c| c.domain()).collect();
        assert!(domains.contains(&None));
        assert!(domains.contains(&Some("localhost")));
        assert!(domains.contains(&Some("127.0.0.1")));
        assert!(cookies.iter().any(|c| c.http_only() == Some(true)));

        let now = OffsetDateTime::now_utc();
        for cookie in &cookies {
            assert_eq!(cookie.value(), "");
            assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
            assert!(cookie.expires_datetime().is_some_and(|t| t < now));
        }
    }

    #[tokio::test]
    async fn test_refresh_installs_new_token() {
        let backend = StaticAuthBackend::new().with_user("u1", "a@example.com", "pw");
        let session = session_for("u1", 900);
        let old_token = session.token().unwrap().to_string();
        let store = SessionStore::new(session);

        assert_eq!(store.refresh(&backend).await, RefreshOutcome::Refreshed);

        let current = store.snapshot().await;
        assert!(current.is_valid());
        assert_ne!(current.token(), Some(old_token.as_str()));
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears() {
        let backend = StaticAuthBackend::new().with_user("u1", "a@example.com", "pw");
        backend.set_fail_refresh(true);
        let store = SessionStore::new(session_for("u1", 900));

        assert_eq!(store.refresh(&backend).await, RefreshOutcome::Cleared);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_skips_empty_session() {
        let backend = StaticAuthBackend::new();
        let store = SessionStore::default();

        assert_eq!(store.refresh(&backend).await, RefreshOutcome::Skipped);
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_consistent() {
        let backend = StaticAuthBackend::new()
            .with_user("u1", "a@example.com", "pw")
            .with_delay(Duration::from_millis(20));
        let store = SessionStore::new(session_for("u1", 900));

        let (a, b) = tokio::join!(store.refresh(&backend), store.refresh(&backend));
        assert_eq!(a, RefreshOutcome::Refreshed);
        assert_eq!(b, RefreshOutcome::Refreshed);

        let current = store.snapshot().await;
        assert!(current.is_valid());
        assert_eq!(current.user().map(|u| u.id.as_str()), Some("u1"));
        assert_eq!(backend.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_clear_concurrent_success() {
        let store = SessionStore::new(session_for("u1", 900));
        let ticket = store.begin().await.unwrap();

        // Another caller refreshes while this one is in flight
        let winner = store.begin().await.unwrap();
        let fresh = AuthSession {
            token: token_for("u1", 900),
            record: user("u1"),
        };
        assert_eq!(store.complete(&winner, fresh).await, RefreshOutcome::Refreshed);

        assert_eq!(store.abandon(&ticket).await, RefreshOutcome::Superseded);
        assert!(store.is_valid().await);
    }

    #[tokio::test]
    async fn test_refresh_does_not_resurrect_logged_out_session() {
        let store = SessionStore::new(session_for("u1", 900));
        let ticket = store.begin().await.unwrap();

        store.clear().await;

        let fresh = AuthSession {
            token: token_for("u1", 900),
            record: user("u1"),
        };
        assert_eq!(store.complete(&ticket, fresh).await, RefreshOutcome::Superseded);
        assert!(store.snapshot().await.is_empty());
        assert_eq!(store.epoch().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_clears_after_repeated_failures() {
        let backend = Arc::new(StaticAuthBackend::new().with_user("u1", "a@example.com", "pw"));
        let store = SessionStore::new(session_for("u1", 3600));
        let policy = RefreshPolicy {
            interval: Duration::from_secs(60),
            max_failures: 2,
        };

        let handle = store.spawn_auto_refresh(backend.clone(), policy);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(backend.refresh_calls(), 1);
        assert!(store.is_valid().await);

        backend.set_fail_refresh(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.is_valid().await, "one failure is tolerated");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.snapshot().await.is_empty());
        assert_eq!(backend.refresh_calls(), 3);

        handle.abort();
    }

    #[tokio::test]
    async fn test_revoked_tokens() {
        let revoked = RevokedTokens::new();
        let signed_out = session_for("u1", 900);
        let other = session_for("u1", 900);

        revoked.revoke(&signed_out).await;
        assert!(revoked.is_revoked(&signed_out).await);
        assert!(!revoked.is_revoked(&other).await);
        assert!(!revoked.is_revoked(&Session::empty()).await);

        // Nothing to remember for tokens that are already dead
        revoked.revoke(&session_for("u2", -10)).await;
        revoked.revoke(&Session::empty()).await;
        assert_eq!(revoked.len().await, 1);
    }
}
