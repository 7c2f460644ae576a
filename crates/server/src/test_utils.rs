//! Test doubles for the USB host boundary
//!
//! [`MockUsbHost`] scripts everything the OS would do: the device list,
//! permission grants, busy devices, unusable handles, slow opens and hotplug
//! notifications. Connections are real socketpairs, so handles produced by
//! the core can be read and written like a device node.

use crate::usb::directory::identity_of;
use crate::usb::host::{HostError, RawDevice, RawNotification, UsbConnection, UsbHost, WatchGuard};
use common::test_utils::{TEST_PID, TEST_VID};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A CDC-ACM test device at `bus`/`address`
pub fn raw_device(bus: u8, address: u8, port_path: Option<&str>) -> RawDevice {
    RawDevice {
        bus,
        address,
        port_path: port_path.map(str::to_string),
        vendor_id: TEST_VID,
        product_id: TEST_PID,
        class_code: 0x02,
        cdc_acm: true,
    }
}

#[derive(Default)]
struct MockState {
    devices: Vec<RawDevice>,
    granted: HashSet<String>,
    busy: HashSet<String>,
    invalid_handle: HashSet<String>,
    enumeration_fails: bool,
    watch_fails: bool,
    /// Device-side ends of the most recent connection per identity
    peers: HashMap<String, UnixStream>,
}

type HotplugSlot = Arc<Mutex<Option<async_channel::Sender<RawNotification>>>>;

/// Blocks opens while held
#[derive(Default)]
struct OpenLatch {
    held: Mutex<bool>,
    released: Condvar,
}

/// Scripted OS USB subsystem
#[derive(Default)]
pub struct MockUsbHost {
    state: Mutex<MockState>,
    hotplug: HotplugSlot,
    open_connections: Arc<AtomicUsize>,
    open_calls: AtomicUsize,
    latch: OpenLatch,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockUsbHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the OS list without a hotplug notification
    pub fn attach(&self, device: RawDevice) {
        lock(&self.state).devices.push(device);
    }

    /// Remove a device from the OS list without a hotplug notification
    pub fn detach(&self, identity: &str) -> Option<RawDevice> {
        let mut state = lock(&self.state);
        let index = state
            .devices
            .iter()
            .position(|d| identity_of(d).as_str() == identity)?;
        Some(state.devices.remove(index))
    }

    /// Attach a device and notify hotplug listeners
    pub fn plug(&self, device: RawDevice) {
        self.attach(device.clone());
        self.inject("add", device);
    }

    /// Detach a device and notify hotplug listeners
    pub fn unplug(&self, identity: &str) {
        if let Some(device) = self.detach(identity) {
            self.inject("remove", device);
        }
    }

    /// Deliver a raw notification as the OS would, without touching the
    /// device list
    pub fn inject(&self, action: &str, device: RawDevice) {
        if let Some(sink) = lock(&self.hotplug).as_ref() {
            let _ = sink.try_send(RawNotification {
                action: action.to_string(),
                device,
            });
        }
    }

    /// Drop the hotplug registration as if the OS revoked it
    pub fn lose_registration(&self) {
        lock(&self.hotplug).take();
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.hotplug).is_some()
    }

    /// Grant OS access, as the external permission flow would
    pub fn grant(&self, identity: &str) {
        lock(&self.state).granted.insert(identity.to_string());
    }

    pub fn revoke(&self, identity: &str) {
        lock(&self.state).granted.remove(identity);
    }

    /// Make opens of `identity` fail with EBUSY
    pub fn set_busy(&self, identity: &str, busy: bool) {
        let mut state = lock(&self.state);
        if busy {
            state.busy.insert(identity.to_string());
        } else {
            state.busy.remove(identity);
        }
    }

    /// Make opens of `identity` succeed but report a negative raw handle
    pub fn set_invalid_handle(&self, identity: &str) {
        lock(&self.state).invalid_handle.insert(identity.to_string());
    }

    pub fn fail_enumeration(&self, fail: bool) {
        lock(&self.state).enumeration_fails = fail;
    }

    /// Make the next `watch` call fail
    pub fn fail_watch(&self, fail: bool) {
        lock(&self.state).watch_fails = fail;
    }

    /// Block every open until [`release_opens`](Self::release_opens)
    pub fn hold_opens(&self) {
        *lock(&self.latch.held) = true;
    }

    pub fn release_opens(&self) {
        *lock(&self.latch.held) = false;
        self.latch.released.notify_all();
    }

    /// Connections opened and not yet released
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Number of times the OS open was attempted
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Device side of the most recent connection to `identity`
    pub fn take_peer(&self, identity: &str) -> Option<UnixStream> {
        lock(&self.state).peers.remove(identity)
    }

    fn wait_for_latch(&self) {
        let mut held = lock(&self.latch.held);
        while *held {
            held = self
                .latch
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl UsbHost for MockUsbHost {
    fn devices(&self) -> Result<Vec<RawDevice>, HostError> {
        let state = lock(&self.state);
        if state.enumeration_fails {
            return Err(HostError::Enumeration("mock enumeration failure".to_string()));
        }
        Ok(state.devices.clone())
    }

    fn has_permission(&self, device: &RawDevice) -> bool {
        lock(&self.state)
            .granted
            .contains(identity_of(device).as_str())
    }

    fn open(&self, device: &RawDevice) -> Result<Box<dyn UsbConnection>, HostError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for_latch();

        let identity = identity_of(device).to_string();
        let mut state = lock(&self.state);
        if state.busy.contains(&identity) {
            return Err(HostError::Busy);
        }

        let (local, peer) =
            UnixStream::pair().map_err(|e| HostError::Open(format!("socketpair: {}", e)))?;
        state.peers.insert(identity.clone(), peer);

        Ok(Box::new(MockConnection::new(
            OwnedFd::from(local),
            state.invalid_handle.contains(&identity),
            self.open_connections.clone(),
        )))
    }

    fn watch(
        &self,
        sink: async_channel::Sender<RawNotification>,
    ) -> Result<WatchGuard, HostError> {
        if lock(&self.state).watch_fails {
            return Err(HostError::Hotplug("mock registration failure".to_string()));
        }
        *lock(&self.hotplug) = Some(sink);
        Ok(WatchGuard::new(MockRegistration {
            slot: self.hotplug.clone(),
        }))
    }
}

/// Clears the hotplug sink on drop, like unregistering the OS callback
struct MockRegistration {
    slot: HotplugSlot,
}

impl Drop for MockRegistration {
    fn drop(&mut self) {
        lock(&self.slot).take();
    }
}

/// Socketpair-backed connection counted by the host's probe
pub struct MockConnection {
    fd: OwnedFd,
    invalid: bool,
    probe: Arc<AtomicUsize>,
}

impl MockConnection {
    fn new(fd: OwnedFd, invalid: bool, probe: Arc<AtomicUsize>) -> Self {
        probe.fetch_add(1, Ordering::SeqCst);
        Self { fd, invalid, probe }
    }
}

impl UsbConnection for MockConnection {
    fn raw_fd(&self) -> RawFd {
        if self.invalid { -1 } else { self.fd.as_raw_fd() }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.probe.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Duplication strategy that always fails
#[derive(Debug, Default)]
pub struct FailingDup;

impl crate::usb::DupStrategy for FailingDup {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn duplicate(&self, _fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
        Err(io::Error::other("mock duplication failure"))
    }
}
