//! OS USB capability boundary
//!
//! Everything the session manager needs from the operating system goes
//! through [`UsbHost`]: one enumeration query, a live permission check, a raw
//! open, and a hotplug registration. The production implementation lives in
//! [`super::linux`]; tests drive the core through
//! [`crate::test_utils::MockUsbHost`].

use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use thiserror::Error;

/// A device as reported by one OS enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
    /// Physical port path in sysfs naming (`"1-1.4"`), when the OS knows it
    pub port_path: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device class from the device descriptor
    pub class_code: u8,
    /// Exposes a CDC-ACM (class 0x02, subclass 0x02) interface
    pub cdc_acm: bool,
}

impl RawDevice {
    /// OS-assigned numeric device id
    ///
    /// Unique among devices attached at the same time, but reassigned on
    /// every re-attachment.
    pub fn os_device_id(&self) -> u32 {
        u32::from(self.bus) * 1000 + u32::from(self.address)
    }

    /// usbfs node for this device
    pub fn node_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/dev/bus/usb/{:03}/{:03}",
            self.bus, self.address
        ))
    }
}

impl fmt::Display for RawDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bus={} addr={} vid={:04x} pid={:04x}",
            self.bus, self.address, self.vendor_id, self.product_id
        )
    }
}

/// A raw notification from the OS hotplug facility
///
/// `action` is the OS spelling (`"add"`, `"remove"`, ...); classification
/// happens in the relay.
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub action: String,
    pub device: RawDevice,
}

/// Failures reported by the OS layer
#[derive(Debug, Error)]
pub enum HostError {
    #[error("USB enumeration failed: {0}")]
    Enumeration(String),

    #[error("device or resource busy")]
    Busy,

    #[error("open failed: {0}")]
    Open(String),

    #[error("hotplug registration failed: {0}")]
    Hotplug(String),
}

/// An open OS connection to a device
///
/// Dropping the connection releases its handle.
pub trait UsbConnection: Send {
    /// The underlying OS handle; may be negative if the OS produced an
    /// unusable connection
    fn raw_fd(&self) -> RawFd;
}

/// Keeps an OS hotplug registration alive; dropping it unregisters
pub struct WatchGuard {
    _inner: Box<dyn Send>,
}

impl WatchGuard {
    pub fn new(inner: impl Send + 'static) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WatchGuard")
    }
}

/// OS USB subsystem
pub trait UsbHost: Send + Sync + 'static {
    /// Query the currently attached devices
    fn devices(&self) -> Result<Vec<RawDevice>, HostError>;

    /// Whether this process currently holds OS access to `device`
    fn has_permission(&self, device: &RawDevice) -> bool;

    /// Open a raw connection to `device`
    fn open(&self, device: &RawDevice) -> Result<Box<dyn UsbConnection>, HostError>;

    /// Register with the OS hotplug facility
    ///
    /// Notifications are pushed into `sink` from an OS-owned context. The
    /// sink is closed if the registration is lost.
    fn watch(
        &self,
        sink: async_channel::Sender<RawNotification>,
    ) -> Result<WatchGuard, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(bus: u8, address: u8) -> RawDevice {
        RawDevice {
            bus,
            address,
            port_path: None,
            vendor_id: 0x1209,
            product_id: 0x0001,
            class_code: 0x02,
            cdc_acm: true,
        }
    }

    #[test]
    fn test_os_device_id() {
        assert_eq!(device(1, 5).os_device_id(), 1005);
        assert_eq!(device(2, 7).os_device_id(), 2007);
        assert_ne!(device(1, 12).os_device_id(), device(11, 2).os_device_id());
    }

    #[test]
    fn test_node_path() {
        assert_eq!(
            device(1, 5).node_path(),
            PathBuf::from("/dev/bus/usb/001/005")
        );
    }
}
