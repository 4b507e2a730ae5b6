//! The bridge's view of the cloud device fleet

use crate::protocol::DeviceRecord;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Known devices, filled from cloud inventories and fleet events
///
/// Cloning shares the same registry. Lookups are synchronous so inbound
/// validation never waits on I/O.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole fleet with a fresh inventory
    pub fn replace(&self, devices: &[DeviceRecord]) {
        let mut map = self.write();
        map.clear();
        map.extend(devices.iter().map(|d| (d.id.clone(), d.clone())));
    }

    pub fn insert(&self, device: DeviceRecord) {
        self.write().insert(device.id.clone(), device);
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceRecord> {
        self.write().remove(device_id)
    }

    /// Record the latest reported state; unknown devices are ignored
    pub fn update_state(&self, device_id: &str, state: Value) -> bool {
        match self.write().get_mut(device_id) {
            Some(device) => {
                device.state = state;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.read().contains_key(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.read().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All devices, ordered by id
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceRecord>> {
        self.devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceRecord>> {
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replace_and_lookup() {
        let registry = DeviceRegistry::new();
        registry.insert(DeviceRecord::new("stale"));
        registry.replace(&[DeviceRecord::new("b"), DeviceRecord::new("a")]);

        assert!(!registry.contains("stale"));
        assert!(registry.contains("a"));
        assert_eq!(
            registry
                .snapshot()
                .iter()
                .map(|d| d.id.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_clones_share_state() {
        let registry = DeviceRegistry::new();
        let view = registry.clone();

        registry.insert(DeviceRecord::new("d1"));
        assert!(view.contains("d1"));

        assert!(view.remove("d1").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_state_only_for_known_devices() {
        let registry = DeviceRegistry::new();
        registry.insert(DeviceRecord::new("d1"));

        assert!(registry.update_state("d1", json!({"on": true})));
        assert!(!registry.update_state("ghost", json!({})));
        assert_eq!(registry.get("d1").unwrap().state, json!({"on": true}));
    }
}
