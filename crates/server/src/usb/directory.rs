//! Device Directory
//!
//! Pure query over the OS device list. Nothing is cached: every call asks
//! the host again and builds fresh descriptors.

use crate::usb::filter::DeviceFilter;
use crate::usb::host::{RawDevice, UsbHost};
use protocol::{DeviceDescriptor, DeviceIdentity, SessionError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stable identity for a raw device
///
/// The physical port path when the OS reports one, otherwise the OS numeric
/// device id. The hotplug relay uses the same rule so a Detached event names
/// the identity `list_devices` returned earlier.
pub fn identity_of(device: &RawDevice) -> DeviceIdentity {
    match &device.port_path {
        Some(path) if !path.is_empty() => DeviceIdentity::new(path.as_str()),
        _ => DeviceIdentity::new(format!("usb-dev-{}", device.os_device_id())),
    }
}

/// Build the consumer-facing descriptor for a raw device
pub fn describe(device: &RawDevice) -> DeviceDescriptor {
    DeviceDescriptor {
        identity: identity_of(device),
        vendor_id: device.vendor_id,
        product_id: device.product_id,
    }
}

#[derive(Clone)]
pub struct DeviceDirectory {
    host: Arc<dyn UsbHost>,
    filter: DeviceFilter,
}

impl DeviceDirectory {
    pub fn new(host: Arc<dyn UsbHost>, filter: DeviceFilter) -> Self {
        Self { host, filter }
    }

    pub fn filter(&self) -> &DeviceFilter {
        &self.filter
    }

    /// Raw devices that pass the filter, in OS order
    fn visible(&self) -> Result<Vec<RawDevice>, SessionError> {
        let devices = self.host.devices().map_err(|e| {
            warn!("Device enumeration failed: {}", e);
            SessionError::EnumerationError {
                message: e.to_string(),
            }
        })?;

        Ok(devices
            .into_iter()
            .filter(|d| self.filter.allows(d))
            .collect())
    }

    /// Snapshot of the attached devices
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, SessionError> {
        let devices: Vec<DeviceDescriptor> = self.visible()?.iter().map(describe).collect();
        debug!("Listing {} devices", devices.len());
        Ok(devices)
    }

    /// Find the live device behind `identity`
    pub fn resolve(&self, identity: &DeviceIdentity) -> Result<RawDevice, SessionError> {
        self.visible()?
            .into_iter()
            .find(|d| identity_of(d) == *identity)
            .ok_or_else(|| SessionError::DeviceNotFound {
                identity: identity.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockUsbHost, raw_device};

    #[test]
    fn test_identity_prefers_port_path() {
        let device = raw_device(1, 5, Some("1-1.4"));
        assert_eq!(identity_of(&device).as_str(), "1-1.4");
    }

    #[test]
    fn test_identity_falls_back_to_os_id() {
        let a = raw_device(1, 5, None);
        let b = raw_device(2, 5, None);
        assert_eq!(identity_of(&a).as_str(), "usb-dev-1005");
        assert_ne!(identity_of(&a), identity_of(&b));

        let empty = raw_device(1, 6, Some(""));
        assert_eq!(identity_of(&empty).as_str(), "usb-dev-1006");
    }

    #[test]
    fn test_list_and_resolve() {
        let host = Arc::new(MockUsbHost::new());
        host.attach(raw_device(1, 5, Some("1-1")));
        let directory = DeviceDirectory::new(host.clone(), DeviceFilter::allow_all());

        let devices = directory.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identity.as_str(), "1-1");

        assert!(directory.resolve(&DeviceIdentity::new("1-1")).is_ok());
        assert_eq!(
            directory.resolve(&DeviceIdentity::new("1-2")).unwrap_err(),
            SessionError::DeviceNotFound {
                identity: DeviceIdentity::new("1-2")
            }
        );
    }

    #[test]
    fn test_enumeration_failure_is_reported() {
        let host = Arc::new(MockUsbHost::new());
        host.fail_enumeration(true);
        let directory = DeviceDirectory::new(host, DeviceFilter::allow_all());

        assert!(matches!(
            directory.list_devices(),
            Err(SessionError::EnumerationError { .. })
        ));
    }

    #[test]
    fn test_filtered_device_cannot_be_resolved() {
        let host = Arc::new(MockUsbHost::new());
        let mut hub = raw_device(1, 1, Some("1-0"));
        hub.vendor_id = 0x1d6b;
        hub.class_code = 0x09;
        host.attach(hub);

        let filter = DeviceFilter::new(&[], false, true).unwrap();
        let directory = DeviceDirectory::new(host, filter);
        assert!(directory.list_devices().unwrap().is_empty());
        assert!(matches!(
            directory.resolve(&DeviceIdentity::new("1-0")),
            Err(SessionError::DeviceNotFound { .. })
        ));
    }
}
