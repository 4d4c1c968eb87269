//! Device records and the external record-store / event-dispatch interfaces.
//!
//! The durable device store and the notification fan-out belong to the
//! surrounding system; this engine reads and updates records through
//! [`DeviceStore`] and emits creation/change events through
//! [`DeviceEventSink`]. An in-memory store is provided for single-process
//! deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::info;

/// Device connectivity flags (bitmask).
pub mod conn {
    /// A CIRA tunnel to the device terminates on some server in the cluster.
    pub const TUNNEL: u32 = 1;
    /// The device's management interface is reachable by direct socket.
    pub const DIRECT: u32 = 2;
}

/// Activation mode flags stored on a device record (bitmask).
pub mod amt_flags {
    /// Activated in client control mode.
    pub const CCM: u32 = 2;
    /// Activated in admin control mode.
    pub const ACM: u32 = 4;
}

/// Out-of-band management identity provisioned on a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmtInfo {
    /// Administrative account name (always `admin` on these endpoints).
    pub user: String,
    /// Administrative credential. Stripped from every dispatched event.
    pub pass: String,
    /// HTTP-Digest realm reported by the device.
    pub realm: String,
    /// Operator-assigned tag.
    #[serde(default)]
    pub tag: String,
    /// Firmware version, `x.y.z`.
    pub ver: String,
    /// Firmware SKU.
    #[serde(default)]
    pub sku: Option<u64>,
    /// Activation mode bits, see [`amt_flags`].
    pub flags: u32,
    /// Whether the management interface requires TLS for direct connections.
    #[serde(default)]
    pub tls: bool,
}

/// The durable device entry, keyed by node id, unique by UUID within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Node id, `node/<domain>/<unique>`.
    pub id: String,
    /// Device group the record belongs to.
    pub domain: String,
    /// Hardware UUID reported during activation (36 characters).
    pub uuid: String,
    /// Display name.
    pub name: String,
    /// Host address the management interface answers on.
    pub host: String,
    /// Connectivity flags, see [`conn`].
    pub conn: u32,
    /// Management identity, present once the device is activated.
    pub amt: Option<AmtInfo>,
}

impl DeviceRecord {
    /// JSON representation safe for event dispatch: the administrative
    /// credential never leaves through the event sink.
    pub fn to_event_value(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(amt) = v.get_mut("amt").and_then(Value::as_object_mut) {
            amt.remove("pass");
        }
        v
    }
}

/// Record store collaborator: `Get`/`Set` by key, plus the UUID lookup the
/// activation engine needs. Updates replace the stored record wholesale; the
/// caller merges fields first.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, node_id: &str) -> Option<DeviceRecord>;
    async fn set(&self, record: DeviceRecord);
    async fn find_by_uuid(&self, domain: &str, uuid: &str) -> Option<DeviceRecord>;
}

/// In-memory device store for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryDeviceStore {
    inner: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get(&self, node_id: &str) -> Option<DeviceRecord> {
        self.inner.read().await.get(node_id).cloned()
    }

    async fn set(&self, record: DeviceRecord) {
        self.inner.write().await.insert(record.id.clone(), record);
    }

    async fn find_by_uuid(&self, domain: &str, uuid: &str) -> Option<DeviceRecord> {
        self.inner
            .read()
            .await
            .values()
            .find(|r| r.domain == domain && r.uuid == uuid)
            .cloned()
    }
}

/// Notification/event-dispatch sink collaborator.
pub trait DeviceEventSink: Send + Sync {
    /// Dispatch one event. Payloads are pre-sanitized by the caller.
    fn dispatch(&self, event: Value);
}

/// Event sink that logs events instead of fanning them out. Used when the
/// engine runs without the surrounding notification system.
pub struct LogEventSink;

impl DeviceEventSink for LogEventSink {
    fn dispatch(&self, event: Value) {
        info!(event = %event, "Device event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> DeviceRecord {
        DeviceRecord {
            id: "node/default/abc123".to_string(),
            domain: "default".to_string(),
            uuid: "12345678-1234-1234-1234-123456789012".to_string(),
            name: "lab-node".to_string(),
            host: "10.0.0.7".to_string(),
            conn: conn::DIRECT,
            amt: Some(AmtInfo {
                user: "admin".to_string(),
                pass: "S3cret!x".to_string(),
                realm: "Digest:12345678ABCD".to_string(),
                tag: String::new(),
                ver: "16.1.25".to_string(),
                sku: Some(16392),
                flags: amt_flags::CCM,
                tls: true,
            }),
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryDeviceStore::new();
        store.set(sample_record()).await;

        let by_id = store.get("node/default/abc123").await.unwrap();
        assert_eq!(by_id.host, "10.0.0.7");

        let by_uuid = store
            .find_by_uuid("default", "12345678-1234-1234-1234-123456789012")
            .await
            .unwrap();
        assert_eq!(by_uuid.id, "node/default/abc123");

        assert!(store.find_by_uuid("other", &by_id.uuid).await.is_none());
        assert!(store.get("node/default/missing").await.is_none());
    }

    #[test]
    fn test_event_value_strips_credential() {
        let v = sample_record().to_event_value();
        assert!(v["amt"].get("pass").is_none());
        assert_eq!(v["amt"]["realm"], "Digest:12345678ABCD");
        assert_eq!(v["uuid"], "12345678-1234-1234-1234-123456789012");
    }
}
