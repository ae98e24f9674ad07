//! In-memory device registry and history ledger.
//!
//! ```text
//!              ┌──────────────────── DeviceStore ───────────────────┐
//! relay ──────►│ devices       IndexMap<deviceId, Device>            │
//!              │ operations    deviceId → VecDeque<Operation>        │◄────── HTTP API
//!              │ logs          deviceId → VecDeque<DeviceLog>        │
//!              │ interactions  deviceId → VecDeque<Interaction>      │
//!              └─────────────────────────────────────────────────────┘
//! ```
//!
//! All state sits behind one `parking_lot::RwLock`. Calls are synchronous and
//! finish in bounded time, so the store can be used from async tasks without
//! holding anything across an `.await`.
//!
//! Mutations against an unknown device are silent no-ops and reads return
//! empty results: the relay must keep running even when clients reference
//! ids the store has never seen.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;

use crate::id::IdGenerator;
use crate::types::{
    Device, DeviceHistory, DeviceLog, DeviceStatus, Direction, Interaction, LogLevel, Operation,
    OperationStatus,
};

/// Store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Maximum entries kept per history list (None = unbounded).
    ///
    /// When the cap is hit the oldest entry is dropped.
    pub max_history: Option<usize>,
}

#[derive(Default)]
struct Histories {
    devices: IndexMap<String, Device>,
    operations: HashMap<String, VecDeque<Operation>>,
    logs: HashMap<String, VecDeque<DeviceLog>>,
    interactions: HashMap<String, VecDeque<Interaction>>,
}

/// Process-wide registry of devices and their append-only histories.
///
/// Construct one at startup and share it (`Arc<DeviceStore>`) between the
/// relay and the HTTP layer.
pub struct DeviceStore {
    config: StoreConfig,
    ids: IdGenerator,
    inner: RwLock<Histories>,
}

impl DeviceStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            ids: IdGenerator::new(),
            inner: RwLock::new(Histories::default()),
        }
    }

    /// Unbounded store.
    pub fn with_defaults() -> Self {
        Self::new(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Create or replace the device record, marking it online.
    ///
    /// A second registration replaces name and metadata wholesale; nothing is
    /// merged from the previous record.
    pub fn register_device(&self, device_id: &str, metadata: Option<Value>) -> Device {
        let now = Utc::now();
        let name = metadata
            .as_ref()
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .unwrap_or(device_id)
            .to_string();

        let device = Device {
            device_id: device_id.to_string(),
            name,
            status: DeviceStatus::Online,
            last_seen: now,
            connected_at: now,
            metadata,
        };

        self.inner
            .write()
            .devices
            .insert(device_id.to_string(), device.clone());
        log::info!("Registered device {device_id}");
        device
    }

    /// Set status and refresh `last_seen`. Going online also resets
    /// `connected_at`. Unknown ids are ignored.
    pub fn update_device_status(&self, device_id: &str, status: DeviceStatus) {
        let mut inner = self.inner.write();
        if let Some(device) = inner.devices.get_mut(device_id) {
            let now = Utc::now();
            device.status = status;
            device.last_seen = now;
            if status == DeviceStatus::Online {
                device.connected_at = now;
            }
            log::info!("Device {device_id} is now {status:?}");
        }
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.inner.read().devices.get(device_id).cloned()
    }

    /// All devices in registration order.
    pub fn get_all_devices(&self) -> Vec<Device> {
        self.inner.read().devices.values().cloned().collect()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.inner.read().devices.contains_key(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.inner.read().devices.len()
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Append a new operation with a fresh id and timestamp.
    pub fn add_operation(
        &self,
        device_id: &str,
        op_type: &str,
        action: &str,
        payload: Option<Value>,
        status: OperationStatus,
    ) -> Operation {
        let op = Operation {
            id: self.ids.next_id(),
            device_id: device_id.to_string(),
            op_type: op_type.to_string(),
            action: action.to_string(),
            payload,
            status,
            error: None,
            timestamp: Utc::now(),
        };

        let mut inner = self.inner.write();
        let list = inner.operations.entry(device_id.to_string()).or_default();
        push_capped(list, op.clone(), self.config.max_history);
        log::debug!("Operation {} ({action}) added for {device_id}", op.id);
        op
    }

    /// Settle an operation. `error` is kept only while the status is
    /// failed: a non-failed status clears it, and a failed update without a
    /// message keeps the previous one.
    pub fn update_operation_status(
        &self,
        device_id: &str,
        operation_id: &str,
        status: OperationStatus,
        error: Option<String>,
    ) {
        let mut inner = self.inner.write();
        let Some(ops) = inner.operations.get_mut(device_id) else {
            return;
        };
        if let Some(op) = ops.iter_mut().find(|o| o.id == operation_id) {
            op.status = status;
            if status != OperationStatus::Failed {
                op.error = None;
            } else if let Some(error) = error {
                op.error = Some(error);
            }
            log::debug!("Operation {operation_id} for {device_id} -> {}", status.as_str());
        }
    }

    pub fn get_last_operation(&self, device_id: &str) -> Option<Operation> {
        self.inner
            .read()
            .operations
            .get(device_id)
            .and_then(|ops| ops.back().cloned())
    }

    /// Operations in insertion order, optionally only the last `limit`.
    pub fn get_operations(&self, device_id: &str, limit: Option<usize>) -> Vec<Operation> {
        tail(self.inner.read().operations.get(device_id), limit)
    }

    // ── Logs ───────────────────────────────────────────────────────

    pub fn add_log(
        &self,
        device_id: &str,
        level: LogLevel,
        message: &str,
        metadata: Option<Value>,
    ) -> DeviceLog {
        let entry = DeviceLog {
            id: self.ids.next_id(),
            device_id: device_id.to_string(),
            level,
            message: message.to_string(),
            metadata,
            timestamp: Utc::now(),
        };

        let mut inner = self.inner.write();
        let list = inner.logs.entry(device_id.to_string()).or_default();
        push_capped(list, entry.clone(), self.config.max_history);
        entry
    }

    pub fn get_logs(&self, device_id: &str, limit: Option<usize>) -> Vec<DeviceLog> {
        tail(self.inner.read().logs.get(device_id), limit)
    }

    // ── Interactions ───────────────────────────────────────────────

    pub fn add_interaction(
        &self,
        device_id: &str,
        kind: &str,
        direction: Direction,
        data: Value,
    ) -> Interaction {
        let entry = Interaction {
            id: self.ids.next_id(),
            device_id: device_id.to_string(),
            kind: kind.to_string(),
            direction,
            data,
            timestamp: Utc::now(),
        };

        let mut inner = self.inner.write();
        let list = inner.interactions.entry(device_id.to_string()).or_default();
        push_capped(list, entry.clone(), self.config.max_history);
        entry
    }

    pub fn get_interactions(&self, device_id: &str, limit: Option<usize>) -> Vec<Interaction> {
        tail(self.inner.read().interactions.get(device_id), limit)
    }

    // ── Bulk ───────────────────────────────────────────────────────

    /// Snapshot of all three histories, taken under a single read lock.
    pub fn get_device_history(&self, device_id: &str, limit: Option<usize>) -> DeviceHistory {
        let inner = self.inner.read();
        DeviceHistory {
            device_id: device_id.to_string(),
            operations: tail(inner.operations.get(device_id), limit),
            logs: tail(inner.logs.get(device_id), limit),
            interactions: tail(inner.interactions.get(device_id), limit),
        }
    }

    /// Remove the device and every history list for it. Irreversible.
    pub fn clear_device_data(&self, device_id: &str) {
        let mut inner = self.inner.write();
        inner.devices.shift_remove(device_id);
        inner.operations.remove(device_id);
        inner.logs.remove(device_id);
        inner.interactions.remove(device_id);
        log::info!("Cleared all data for device {device_id}");
    }
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn push_capped<T>(list: &mut VecDeque<T>, item: T, cap: Option<usize>) {
    list.push_back(item);
    if let Some(cap) = cap {
        while list.len() > cap {
            list.pop_front();
        }
    }
}

/// Last `limit` items in order. A zero limit means "everything".
fn tail<T: Clone>(list: Option<&VecDeque<T>>, limit: Option<usize>) -> Vec<T> {
    let Some(list) = list else {
        return Vec::new();
    };
    let skip = match limit {
        Some(k) if k > 0 => list.len().saturating_sub(k),
        _ => 0,
    };
    list.iter().skip(skip).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_register_device_defaults() {
        let store = DeviceStore::with_defaults();
        let device = store.register_device("lamp1", None);
        assert_eq!(device.device_id, "lamp1");
        assert_eq!(device.name, "lamp1");
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_seen, device.connected_at);
        assert!(device.metadata.is_none());
    }

    #[test]
    fn test_register_uses_metadata_name() {
        let store = DeviceStore::with_defaults();
        let device = store.register_device("lamp1", Some(json!({"name": "Kitchen lamp"})));
        assert_eq!(device.name, "Kitchen lamp");
    }

    #[test]
    fn test_reregister_overwrites() {
        let store = DeviceStore::with_defaults();
        store.register_device("lamp1", Some(json!({"name": "Kitchen", "room": 3})));
        store.register_device("lamp1", None);

        let device = store.get_device("lamp1").unwrap();
        assert_eq!(device.name, "lamp1");
        assert!(device.metadata.is_none());
        assert_eq!(store.device_count(), 1);
    }

    #[test]
    fn test_update_status() {
        let store = DeviceStore::with_defaults();
        let registered = store.register_device("lamp1", None);

        store.update_device_status("lamp1", DeviceStatus::Offline);
        let offline = store.get_device("lamp1").unwrap();
        assert_eq!(offline.status, DeviceStatus::Offline);
        assert!(offline.last_seen >= registered.last_seen);
        assert_eq!(offline.connected_at, registered.connected_at);

        store.update_device_status("lamp1", DeviceStatus::Online);
        let online = store.get_device("lamp1").unwrap();
        assert_eq!(online.status, DeviceStatus::Online);
        assert!(online.connected_at >= offline.last_seen);
    }

    #[test]
    fn test_update_status_unknown_is_noop() {
        let store = DeviceStore::with_defaults();
        store.update_device_status("ghost", DeviceStatus::Online);
        assert!(store.get_device("ghost").is_none());
        assert_eq!(store.device_count(), 0);
    }

    #[test]
    fn test_all_devices_in_registration_order() {
        let store = DeviceStore::with_defaults();
        for id in ["c", "a", "b"] {
            store.register_device(id, None);
        }
        // Re-registering keeps the original slot.
        store.register_device("c", None);

        let ids: Vec<String> = store.get_all_devices().into_iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_operation_lifecycle() {
        let store = DeviceStore::with_defaults();
        let op = store.add_operation(
            "lamp1",
            "command",
            "test_command",
            Some(json!({"pin": 13})),
            OperationStatus::Pending,
        );
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.action, "test_command");

        store.update_operation_status("lamp1", &op.id, OperationStatus::Success, None);
        let last = store.get_last_operation("lamp1").unwrap();
        assert_eq!(last.id, op.id);
        assert_eq!(last.status, OperationStatus::Success);
        assert!(last.error.is_none());
    }

    #[test]
    fn test_operation_failure_sets_error() {
        let store = DeviceStore::with_defaults();
        let op = store.add_operation("lamp1", "command", "ON", None, OperationStatus::Pending);
        store.update_operation_status(
            "lamp1",
            &op.id,
            OperationStatus::Failed,
            Some("relay stuck".into()),
        );
        let last = store.get_last_operation("lamp1").unwrap();
        assert_eq!(last.status, OperationStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("relay stuck"));
    }

    #[test]
    fn test_retry_after_failure_clears_error() {
        let store = DeviceStore::with_defaults();
        let op = store.add_operation("lamp1", "command", "ON", None, OperationStatus::Pending);
        store.update_operation_status(
            "lamp1",
            &op.id,
            OperationStatus::Failed,
            Some("relay stuck".into()),
        );
        store.update_operation_status("lamp1", &op.id, OperationStatus::Failed, None);
        assert_eq!(
            store.get_last_operation("lamp1").unwrap().error.as_deref(),
            Some("relay stuck")
        );

        store.update_operation_status("lamp1", &op.id, OperationStatus::Success, None);
        let last = store.get_last_operation("lamp1").unwrap();
        assert_eq!(last.status, OperationStatus::Success);
        assert!(last.error.is_none());

        store.update_operation_status(
            "lamp1",
            &op.id,
            OperationStatus::Pending,
            Some("ignored".into()),
        );
        assert!(store.get_last_operation("lamp1").unwrap().error.is_none());
    }

    #[test]
    fn test_update_unknown_operation_is_noop() {
        let store = DeviceStore::with_defaults();
        let op = store.add_operation("lamp1", "command", "ON", None, OperationStatus::Pending);
        store.update_operation_status("lamp1", "nope", OperationStatus::Success, None);
        store.update_operation_status("other", &op.id, OperationStatus::Success, None);
        assert_eq!(
            store.get_last_operation("lamp1").unwrap().status,
            OperationStatus::Pending
        );
    }

    #[test]
    fn test_tail_limit_semantics() {
        let store = DeviceStore::with_defaults();
        for i in 0..5 {
            store.add_log("lamp1", LogLevel::Info, &format!("line {i}"), None);
        }

        let all: Vec<String> = store.get_logs("lamp1", None).into_iter().map(|l| l.message).collect();
        assert_eq!(all, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);

        let last_two: Vec<String> = store
            .get_logs("lamp1", Some(2))
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(last_two, vec!["line 3", "line 4"]);

        assert_eq!(store.get_logs("lamp1", Some(50)).len(), 5);
        assert_eq!(store.get_logs("lamp1", Some(0)).len(), 5);
    }

    #[test]
    fn test_reads_on_unknown_device_are_empty() {
        let store = DeviceStore::with_defaults();
        assert!(store.get_device("ghost").is_none());
        assert!(store.get_last_operation("ghost").is_none());
        assert!(store.get_operations("ghost", Some(3)).is_empty());
        assert!(store.get_logs("ghost", None).is_empty());
        assert!(store.get_interactions("ghost", None).is_empty());

        let history = store.get_device_history("ghost", None);
        assert_eq!(history.device_id, "ghost");
        assert!(history.operations.is_empty());
    }

    #[test]
    fn test_history_bundle_with_limit() {
        let store = DeviceStore::with_defaults();
        for i in 0..3 {
            store.add_operation("lamp1", "command", &format!("a{i}"), None, OperationStatus::Pending);
            store.add_interaction("lamp1", "message", Direction::Inbound, json!({"n": i}));
        }
        store.add_log("lamp1", LogLevel::Warn, "hot", None);

        let full = store.get_device_history("lamp1", None);
        assert_eq!(full.operations.len(), 3);
        assert_eq!(full.logs.len(), 1);
        assert_eq!(full.interactions.len(), 3);

        let limited = store.get_device_history("lamp1", Some(1));
        assert_eq!(limited.operations[0].action, "a2");
        assert_eq!(limited.interactions[0].data, json!({"n": 2}));
        assert_eq!(limited.logs.len(), 1);
    }

    #[test]
    fn test_clear_device_data() {
        let store = DeviceStore::with_defaults();
        store.register_device("lamp1", None);
        store.add_operation("lamp1", "command", "ON", None, OperationStatus::Pending);
        store.add_log("lamp1", LogLevel::Info, "hello", None);
        store.add_interaction("lamp1", "message", Direction::Inbound, json!({}));
        store.register_device("lamp2", None);

        store.clear_device_data("lamp1");

        assert!(store.get_device("lamp1").is_none());
        assert!(store.get_operations("lamp1", None).is_empty());
        assert!(store.get_logs("lamp1", None).is_empty());
        assert!(store.get_interactions("lamp1", None).is_empty());
        assert!(store.contains("lamp2"));
    }

    #[test]
    fn test_retention_cap_keeps_newest() {
        let store = DeviceStore::new(StoreConfig { max_history: Some(3) });
        for i in 0..10 {
            store.add_interaction("lamp1", "message", Direction::Inbound, json!(i));
        }
        let data: Vec<Value> = store
            .get_interactions("lamp1", None)
            .into_iter()
            .map(|i| i.data)
            .collect();
        assert_eq!(data, vec![json!(7), json!(8), json!(9)]);
        assert_eq!(store.get_interactions("lamp1", Some(2)).len(), 2);
    }

    #[test]
    fn test_concurrent_appends_keep_every_record() {
        let store = Arc::new(DeviceStore::with_defaults());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        store.add_operation(
                            "shared",
                            "command",
                            &format!("{t}-{i}"),
                            None,
                            OperationStatus::Pending,
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let ops = store.get_operations("shared", None);
        assert_eq!(ops.len(), 2000);
        let unique: std::collections::HashSet<_> = ops.iter().map(|o| o.id.clone()).collect();
        assert_eq!(unique.len(), 2000);
    }
}
