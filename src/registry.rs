//! Deduplicated registry of peripherals observed during a scan window.

use std::collections::HashMap;

use crate::transport::Device;

/// Devices observed during the current (or most recent) scan window, keyed by
/// identifier. Cleared when a new scan begins; duplicates are suppressed by
/// identifier, never by name.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all devices from the previous scan window.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Record an observed advertisement. A device already present under the
    /// same identifier is left untouched.
    pub fn observe(&mut self, device: Device) {
        self.devices
            .entry(device.identifier.clone())
            .or_insert(device);
    }

    /// Resolve an identifier to a device observed in the last scan.
    pub fn resolve(&self, identifier: &str) -> Option<&Device> {
        self.devices.get(identifier)
    }

    /// Snapshot of the registry's contents.
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: Option<&str>) -> Device {
        Device {
            identifier: id.to_string(),
            display_name: name.map(str::to_string),
        }
    }

    #[test]
    fn duplicate_identifiers_are_suppressed() {
        let mut registry = DeviceRegistry::new();
        registry.observe(device("aa:bb", Some("Printer")));
        registry.observe(device("aa:bb", Some("Printer (renamed)")));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.resolve("aa:bb").unwrap().display_name.as_deref(),
            Some("Printer")
        );
    }

    #[test]
    fn same_name_different_identifier_kept() {
        let mut registry = DeviceRegistry::new();
        registry.observe(device("aa:bb", Some("Printer")));
        registry.observe(device("cc:dd", Some("Printer")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn nameless_devices_are_listed() {
        let mut registry = DeviceRegistry::new();
        registry.observe(device("aa:bb", None));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn clear_empties_the_registry() {
        let mut registry = DeviceRegistry::new();
        registry.observe(device("aa:bb", None));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.resolve("aa:bb").is_none());
    }
}
