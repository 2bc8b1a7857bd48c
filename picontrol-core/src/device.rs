//! Device records and the owner-scoped directory over them
//!
//! Lookups follow an ordered list of [`LookupStrategy`] values. The first
//! strategy whose query the store accepts decides the answer; a strategy
//! whose query is rejected hands over to the next one.
//!
//! The owner-less fallback exists for deployments whose devices collection
//! predates the `owner` field. It is a transitional compatibility policy and
//! NOT an isolation boundary: once it kicks in, any authenticated user can
//! reach any device by name.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::store::{DeviceStore, Filter, StoreError};

/// Newest first
pub const DEFAULT_SORT: &str = "-created";

/// Persisted device record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(rename = "device_name")]
    pub name: String,
    #[serde(rename = "mac_addr")]
    pub mac_address: String,
    #[serde(rename = "ip_addr")]
    pub ip_address: String,
    #[serde(rename = "type", alias = "device_type")]
    pub device_type: String,
    /// PocketBase returns an empty string for an unset relation
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub created: String,
}

/// Mutable fields; an update replaces all of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFields {
    #[serde(rename = "device_name")]
    pub name: String,
    #[serde(rename = "mac_addr")]
    pub mac_address: String,
    #[serde(rename = "ip_addr")]
    pub ip_address: String,
    #[serde(rename = "type", alias = "device_type")]
    pub device_type: String,
}

/// Create payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDevice {
    #[serde(flatten)]
    pub fields: DeviceFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created: String,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// One way of finding devices for a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Constrain to `owner = <caller>`
    OwnerScoped,
    /// No owner constraint
    Unscoped,
}

/// Owner-scoped first, unscoped when the store rejects the owner field
pub const LOOKUP_POLICY: &[LookupStrategy] = &[LookupStrategy::OwnerScoped, LookupStrategy::Unscoped];

impl LookupStrategy {
    /// Filter for a by-name lookup, `None` if the strategy does not apply
    pub fn name_filter(self, name: &str, owner: Option<&str>) -> Option<Filter> {
        match self {
            LookupStrategy::OwnerScoped => owner.map(|owner| Filter::eq("device_name", name).and_eq("owner", owner)),
            LookupStrategy::Unscoped => Some(Filter::eq("device_name", name)),
        }
    }

    /// Filter for a listing: `None` if not applicable, `Some(None)` for everything
    pub fn list_filter(self, owner: Option<&str>) -> Option<Option<Filter>> {
        match self {
            LookupStrategy::OwnerScoped => owner.map(|owner| Some(Filter::eq("owner", owner))),
            LookupStrategy::Unscoped => Some(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// CRUD over the devices collection on behalf of one caller
pub struct DeviceDirectory<'a> {
    store: &'a dyn DeviceStore,
    auth: &'a str,
    policy: &'a [LookupStrategy],
}

impl<'a> DeviceDirectory<'a> {
    pub fn new(store: &'a dyn DeviceStore, auth: &'a str) -> Self {
        Self {
            store,
            auth,
            policy: LOOKUP_POLICY,
        }
    }

    pub fn with_policy(mut self, policy: &'a [LookupStrategy]) -> Self {
        self.policy = policy;
        self
    }

    /// Devices visible to `owner`, newest first
    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, DirectoryError> {
        let mut last_rejection = None;

        for strategy in self.policy {
            let Some(filter) = strategy.list_filter(owner) else {
                continue;
            };

            match self.store.list(self.auth, filter.as_ref(), DEFAULT_SORT).await {
                Ok(devices) => {
                    tracing::debug!("Listed {} devices via {:?}", devices.len(), strategy);
                    return Ok(devices);
                }
                Err(e) if e.is_query_rejection() => {
                    tracing::warn!("Device listing rejected under {:?}, trying next strategy: {}", strategy, e);
                    last_rejection = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_rejection {
            Some(e) => Err(e.into()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get(&self, name: &str, owner: Option<&str>) -> Result<Device, DirectoryError> {
        for strategy in self.policy {
            let Some(filter) = strategy.name_filter(name, owner) else {
                continue;
            };

            match self.store.first(self.auth, &filter).await {
                Ok(Some(device)) => return Ok(device),
                Ok(None) => return Err(DirectoryError::NotFound(name.to_string())),
                Err(e) if e.is_query_rejection() => {
                    tracing::warn!("Device lookup rejected under {:?}, trying next strategy: {}", strategy, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DirectoryError::NotFound(name.to_string()))
    }

    /// Create a device, stamped with `owner` when the caller has one.
    ///
    /// Name conflicts are reported by the store and passed through as-is.
    pub async fn create(&self, fields: DeviceFields, owner: Option<&str>) -> Result<Device, DirectoryError> {
        let device = NewDevice {
            fields,
            owner: owner.map(str::to_string),
            created: chrono::Utc::now().to_rfc3339(),
        };

        let created = self.store.create(self.auth, &device).await?;
        tracing::info!("Created device {} ({})", created.name, created.id);
        Ok(created)
    }

    pub async fn update(&self, name: &str, owner: Option<&str>, fields: DeviceFields) -> Result<Device, DirectoryError> {
        let existing = self.get(name, owner).await?;
        let updated = self.store.update(self.auth, &existing.id, &fields).await?;
        tracing::info!("Updated device {} ({})", updated.name, updated.id);
        Ok(updated)
    }

    pub async fn delete(&self, name: &str, owner: Option<&str>) -> Result<(), DirectoryError> {
        let existing = self.get(name, owner).await?;
        self.store.delete(self.auth, &existing.id).await?;
        tracing::info!("Deleted device {} ({})", existing.name, existing.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryDeviceStore, sample_fields};

    #[test]
    fn test_record_field_names() {
        let device: Device = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "device_name": "sensor1",
            "mac_addr": "AA:BB:CC:DD:EE:FF",
            "ip_addr": "192.168.1.50",
            "device_type": "esp32",
            "owner": "",
            "created": "2024-01-01 00:00:00.000Z"
        }))
        .unwrap();

        assert_eq!(device.device_type, "esp32");
        assert_eq!(device.owner, None);

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["type"], "esp32");
        assert!(json.get("owner").is_none());
    }

    #[tokio::test]
    async fn test_owner_scoped_lookup_skips_fallback_on_match() {
        let store = MemoryDeviceStore::new();
        let directory = DeviceDirectory::new(&store, "token");
        directory.create(sample_fields("sensor1"), Some("u1")).await.unwrap();

        let calls_before = store.calls();
        let device = directory.get("sensor1", Some("u1")).await.unwrap();

        assert_eq!(device.owner.as_deref(), Some("u1"));
        assert_eq!(store.calls() - calls_before, 1);
        assert_eq!(store.rejected_queries(), 0);
    }

    #[tokio::test]
    async fn test_owner_scoped_miss_is_not_found() {
        let store = MemoryDeviceStore::new();
        let directory = DeviceDirectory::new(&store, "token");
        directory.create(sample_fields("sensor1"), Some("u1")).await.unwrap();

        let result = directory.get("sensor1", Some("u2")).await;
        assert!(matches!(result, Err(DirectoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_falls_back_when_owner_field_missing() {
        let store = MemoryDeviceStore::without_owner_field();
        let directory = DeviceDirectory::new(&store, "token");
        directory.create(sample_fields("sensor1"), Some("u1")).await.unwrap();

        let device = directory.get("sensor1", Some("u1")).await.unwrap();
        assert_eq!(device.name, "sensor1");
        assert_eq!(store.rejected_queries(), 1);

        let mut fields = sample_fields("sensor1");
        fields.ip_address = "192.168.1.51".to_string();
        let updated = directory.update("sensor1", Some("u1"), fields).await.unwrap();
        assert_eq!(updated.ip_address, "192.168.1.51");

        directory.delete("sensor1", Some("u1")).await.unwrap();
        assert!(matches!(
            directory.get("sensor1", Some("u1")).await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_is_owner_scoped() {
        let store = MemoryDeviceStore::new();
        let directory = DeviceDirectory::new(&store, "token");
        directory.create(sample_fields("a"), Some("u1")).await.unwrap();
        directory.create(sample_fields("b"), Some("u2")).await.unwrap();

        let devices = directory.list(Some("u1")).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "a");
    }

    #[tokio::test]
    async fn test_list_falls_back_to_unscoped() {
        let store = MemoryDeviceStore::without_owner_field();
        let directory = DeviceDirectory::new(&store, "token");
        directory.create(sample_fields("a"), Some("u1")).await.unwrap();
        directory.create(sample_fields("b"), Some("u2")).await.unwrap();

        let devices = directory.list(Some("u1")).await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_create_without_owner() {
        let store = MemoryDeviceStore::new();
        let directory = DeviceDirectory::new(&store, "token");

        let device = directory.create(sample_fields("a"), None).await.unwrap();
        assert_eq!(device.owner, None);

        // No owner means only the unscoped strategy applies
        let found = directory.get("a", None).await.unwrap();
        assert_eq!(found.id, device.id);
    }

    #[tokio::test]
    async fn test_create_conflict_surfaces_store_error() {
        let store = MemoryDeviceStore::new();
        let directory = DeviceDirectory::new(&store, "token");
        directory.create(sample_fields("a"), Some("u1")).await.unwrap();

        let result = directory.create(sample_fields("a"), Some("u1")).await;
        match result {
            Err(DirectoryError::Persistence(StoreError::BadRequest(message))) => {
                assert!(message.contains("unique"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_custom_policy() {
        let store = MemoryDeviceStore::new();
        let directory = DeviceDirectory::new(&store, "token").with_policy(&[LookupStrategy::OwnerScoped]);
        directory.create(sample_fields("a"), None).await.unwrap();

        // Only the owner-scoped strategy is allowed and the caller has no id
        assert!(matches!(directory.get("a", None).await, Err(DirectoryError::NotFound(_))));
    }
}
