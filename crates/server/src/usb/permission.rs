//! Permission Gate
//!
//! Answers whether this process currently holds OS access to a device. The
//! OS is the source of truth; nothing is cached, and a vanished device is
//! reported as such rather than as "denied".

use crate::usb::directory::DeviceDirectory;
use crate::usb::host::{RawDevice, UsbHost};
use protocol::{DeviceIdentity, PermissionState, SessionError};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct PermissionGate {
    host: Arc<dyn UsbHost>,
    directory: DeviceDirectory,
}

impl PermissionGate {
    pub fn new(host: Arc<dyn UsbHost>, directory: DeviceDirectory) -> Self {
        Self { host, directory }
    }

    /// Live permission state of an already-resolved device
    pub fn state_of(&self, device: &RawDevice) -> PermissionState {
        PermissionState::from(self.host.has_permission(device))
    }

    pub fn has_permission(&self, identity: &DeviceIdentity) -> Result<bool, SessionError> {
        let device = self.directory.resolve(identity)?;
        let state = self.state_of(&device);
        debug!(%identity, ?state, "Permission check");
        Ok(state.is_granted())
    }
}
