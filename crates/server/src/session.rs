//! Session Manager
//!
//! Thin facade over the directory, permission gate, descriptor handoff and
//! hotplug relay. It owns the only shared state in the core: the set of
//! identities with an open in flight, and (through the relay) the single
//! subscriber slot. Both live exactly as long as the manager.
//!
//! Blocking OS work runs on the blocking thread pool so callers on the async
//! runtime are never stalled by libusb or usbfs.

use crate::usb::{
    DescriptorHandoff, DeviceDirectory, DeviceFilter, DupStrategy, HotplugRelay,
    HotplugSubscription, OwnedHandle, PermissionGate, UsbHost,
};
use protocol::{DeviceDescriptor, DeviceIdentity, SessionError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on a single OS open
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Construction parameters for [`SessionManager`]
pub struct SessionOptions {
    pub filter: DeviceFilter,
    pub dup_strategy: Arc<dyn DupStrategy>,
    pub open_timeout: Duration,
}

impl SessionOptions {
    pub fn new(dup_strategy: Arc<dyn DupStrategy>) -> Self {
        Self {
            filter: DeviceFilter::allow_all(),
            dup_strategy,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

type InFlight = Arc<Mutex<HashSet<DeviceIdentity>>>;

/// Marks an identity as being opened; removed again on drop
struct InFlightGuard {
    set: InFlight,
    identity: DeviceIdentity,
}

impl InFlightGuard {
    fn acquire(set: &InFlight, identity: &DeviceIdentity) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.clone());

        inserted.then(|| Self {
            set: set.clone(),
            identity: identity.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.identity);
    }
}

pub struct SessionManager {
    directory: DeviceDirectory,
    gate: PermissionGate,
    handoff: Arc<DescriptorHandoff>,
    relay: HotplugRelay,
    in_flight: InFlight,
    open_timeout: Duration,
}

impl SessionManager {
    /// Build the core and register for hotplug notifications
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(host: Arc<dyn UsbHost>, options: SessionOptions) -> Self {
        let directory = DeviceDirectory::new(host.clone(), options.filter.clone());
        let gate = PermissionGate::new(host.clone(), directory.clone());
        let handoff = DescriptorHandoff::new(
            host.clone(),
            directory.clone(),
            gate.clone(),
            options.dup_strategy,
        );
        let relay = HotplugRelay::start(host.as_ref(), options.filter);

        info!(
            open_timeout = ?options.open_timeout,
            "Device session manager started"
        );

        Self {
            directory,
            gate,
            handoff: Arc::new(handoff),
            relay,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            open_timeout: options.open_timeout,
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, SessionError> {
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || directory.list_devices())
            .await
            .unwrap_or_else(|e| {
                Err(SessionError::EnumerationError {
                    message: format!("enumeration task failed: {}", e),
                })
            })
    }

    pub async fn has_permission(&self, identity: &DeviceIdentity) -> Result<bool, SessionError> {
        let gate = self.gate.clone();
        let id = identity.clone();
        tokio::task::spawn_blocking(move || gate.has_permission(&id))
            .await
            .unwrap_or_else(|e| {
                Err(SessionError::EnumerationError {
                    message: format!("permission task failed: {}", e),
                })
            })
    }

    /// Open a device and hand back an independent duplicate of its handle
    ///
    /// At most one open per identity runs at a time; a concurrent request
    /// for the same identity fails with `AlreadyOpening`. The wait is bounded
    /// by the configured open timeout. A stuck OS call keeps the identity
    /// marked until it returns, and its late handle is closed.
    pub async fn open_and_duplicate(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<OwnedHandle, SessionError> {
        let guard = InFlightGuard::acquire(&self.in_flight, identity).ok_or_else(|| {
            debug!(%identity, "Open already in flight");
            SessionError::AlreadyOpening {
                identity: identity.clone(),
            }
        })?;

        let handoff = self.handoff.clone();
        let id = identity.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            handoff.open_and_duplicate(&id)
        });

        match tokio::time::timeout(self.open_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SessionError::open_failed(
                identity,
                format!("open task failed: {}", e),
            )),
            Err(_) => {
                warn!(%identity, timeout = ?self.open_timeout, "Device open timed out");
                Err(SessionError::open_failed(
                    identity,
                    format!("timed out after {:?}", self.open_timeout),
                ))
            }
        }
    }

    /// Whether an open for `identity` is currently in flight
    pub fn is_opening(&self, identity: &DeviceIdentity) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(identity)
    }

    /// Become the single hotplug subscriber
    pub fn subscribe(&self) -> HotplugSubscription {
        self.relay.subscribe()
    }

    /// Tear down: end the active subscription and drop the OS registration
    ///
    /// Handles already handed out are unaffected.
    pub async fn close(&self) {
        info!("Closing device session manager");
        self.relay.close().await;
    }
}
