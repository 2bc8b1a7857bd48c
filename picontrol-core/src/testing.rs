//! In-memory doubles for the auth and persistence collaborators
//!
//! Both count their calls so tests can assert that a code path never reached
//! the collaborator at all.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cookie::Cookie;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;

use crate::auth::{AuthBackend, AuthError, AuthSession, UserRecord, decode_claims, unix_now};
use crate::device::{Device, DeviceFields, NewDevice};
use crate::session::Session;
use crate::store::{DeviceStore, Filter, StoreError};

const TEST_SECRET: &[u8] = b"picontrol-test-secret";

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize)]
struct TestClaims<'a> {
    id: &'a str,
    exp: i64,
    #[serde(rename = "type")]
    token_type: &'a str,
    #[serde(rename = "collectionId")]
    collection_id: &'a str,
    jti: u64,
}

/// Mint a PocketBase-shaped token for `user_id` expiring in `ttl_secs`
pub fn token_for(user_id: &str, ttl_secs: i64) -> String {
    let claims = TestClaims {
        id: user_id,
        exp: unix_now() + ttl_secs,
        token_type: "auth",
        collection_id: "_pb_users_auth_",
        jti: TOKEN_SEQ.fetch_add(1, Ordering::Relaxed),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(TEST_SECRET))
        .unwrap_or_default()
}

pub fn user(id: &str) -> UserRecord {
    let mut fields = serde_json::Map::new();
    fields.insert("email".to_string(), format!("{}@example.com", id).into());
    UserRecord {
        id: id.to_string(),
        fields,
    }
}

/// Authenticated session for `user_id`
pub fn session_for(user_id: &str) -> Session {
    Session::from_auth(AuthSession {
        token: token_for(user_id, 900),
        record: user(user_id),
    })
    .unwrap_or_default()
}

/// `Cookie` request header value carrying `session`, expired or not
pub fn auth_cookie_header(session: &Session) -> String {
    let payload = serde_json::json!({
        "token": session.token().unwrap_or_default(),
        "record": session.user(),
    });
    Cookie::new(crate::AUTH_COOKIE, payload.to_string()).encoded().to_string()
}

pub fn sample_fields(name: &str) -> DeviceFields {
    DeviceFields {
        name: name.to_string(),
        mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
        ip_address: "192.168.1.50".to_string(),
        device_type: "esp32".to_string(),
    }
}

/// Auth backend with a fixed user table
#[derive(Default)]
pub struct StaticAuthBackend {
    users: HashMap<String, (String, UserRecord)>,
    refresh_calls: AtomicUsize,
    auth_calls: AtomicUsize,
    fail_refresh: AtomicBool,
    delay: Option<Duration>,
}

impl StaticAuthBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, id: &str, email: &str, password: &str) -> Self {
        let mut record = user(id);
        record.fields.insert("email".to_string(), email.into());
        self.users.insert(email.to_string(), (password.to_string(), record));
        self
    }

    /// Delay every call, to widen race windows
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.refresh_calls() + self.auth_calls.load(Ordering::SeqCst)
    }

    fn record_by_id(&self, id: &str) -> Option<UserRecord> {
        self.users.values().find(|(_, r)| r.id == id).map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl AuthBackend for StaticAuthBackend {
    async fn authenticate(&self, identity: &str, password: &str) -> Result<AuthSession, AuthError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.users.get(identity) {
            Some((expected, record)) if expected == password => Ok(AuthSession {
                token: token_for(&record.id, 900),
                record: record.clone(),
            }),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    async fn refresh(&self, token: &str) -> Result<AuthSession, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(AuthError::Rejected);
        }

        let claims = decode_claims(token)?;
        if claims.exp <= unix_now() {
            return Err(AuthError::Rejected);
        }

        let record = claims
            .id
            .as_deref()
            .and_then(|id| self.record_by_id(id))
            .ok_or(AuthError::Rejected)?;

        Ok(AuthSession {
            token: token_for(&record.id, 900),
            record,
        })
    }
}

/// Devices collection kept in memory
pub struct MemoryDeviceStore {
    records: Mutex<Vec<Device>>,
    owner_field: bool,
    calls: AtomicUsize,
    rejected: AtomicUsize,
}

impl Default for MemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            owner_field: true,
            calls: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Schema without an `owner` field: filters on it are rejected and
    /// owner values are dropped on write
    pub fn without_owner_field() -> Self {
        Self {
            owner_field: false,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn rejected_queries(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn check_filter(&self, filter: &Filter) -> Result<(), StoreError> {
        if !self.owner_field && filter.references("owner") {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::BadRequest(
                "Something went wrong while processing your request. Invalid filter.".to_string(),
            ));
        }
        Ok(())
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, Vec<Device>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::ServerError("store poisoned".to_string()))
    }

    fn conflicts(records: &[Device], name: &str, owner: &Option<String>, except: Option<&str>) -> bool {
        records
            .iter()
            .any(|d| d.name == name && &d.owner == owner && Some(d.id.as_str()) != except)
    }
}

fn matches(device: &Device, filter: &Filter) -> bool {
    filter.clauses().all(|(field, value)| match field {
        "id" => device.id == value,
        "device_name" => device.name == value,
        "mac_addr" => device.mac_address == value,
        "ip_addr" => device.ip_address == value,
        "type" => device.device_type == value,
        "owner" => device.owner.as_deref() == Some(value),
        _ => false,
    })
}

fn unique_violation() -> StoreError {
    StoreError::BadRequest("Failed to create record. (device_name: Value must be unique.)".to_string())
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn list(&self, _auth: &str, filter: Option<&Filter>, _sort: &str) -> Result<Vec<Device>, StoreError> {
        self.touch();
        if let Some(filter) = filter {
            self.check_filter(filter)?;
        }

        // Records are appended in creation order; newest first
        Ok(self
            .records()?
            .iter()
            .rev()
            .filter(|d| filter.is_none_or(|f| matches(d, f)))
            .cloned()
            .collect())
    }

    async fn first(&self, _auth: &str, filter: &Filter) -> Result<Option<Device>, StoreError> {
        self.touch();
        self.check_filter(filter)?;
        Ok(self.records()?.iter().find(|d| matches(d, filter)).cloned())
    }

    async fn create(&self, _auth: &str, device: &NewDevice) -> Result<Device, StoreError> {
        self.touch();
        let owner = device.owner.clone().filter(|_| self.owner_field);

        let mut records = self.records()?;
        if Self::conflicts(&records, &device.fields.name, &owner, None) {
            return Err(unique_violation());
        }

        let record = Device {
            id: uuid::Uuid::new_v4().simple().to_string()[..15].to_string(),
            name: device.fields.name.clone(),
            mac_address: device.fields.mac_address.clone(),
            ip_address: device.fields.ip_address.clone(),
            device_type: device.fields.device_type.clone(),
            owner,
            created: device.created.clone(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn update(&self, _auth: &str, id: &str, fields: &DeviceFields) -> Result<Device, StoreError> {
        self.touch();
        let mut records = self.records()?;

        let owner = records
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.owner.clone())
            .ok_or(StoreError::NotFound)?;
        if Self::conflicts(&records, &fields.name, &owner, Some(id)) {
            return Err(unique_violation());
        }

        let record = records.iter_mut().find(|d| d.id == id).ok_or(StoreError::NotFound)?;
        record.name = fields.name.clone();
        record.mac_address = fields.mac_address.clone();
        record.ip_address = fields.ip_address.clone();
        record.device_type = fields.device_type.clone();
        Ok(record.clone())
    }

    async fn delete(&self, _auth: &str, id: &str) -> Result<(), StoreError> {
        self.touch();
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|d| d.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
