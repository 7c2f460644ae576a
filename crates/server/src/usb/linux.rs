//! Linux USB host backed by libusb and usbfs
//!
//! Enumeration and hotplug registration go through `rusb`; the connection
//! handed to consumers is a read/write open of the device's usbfs node,
//! which is what Android-style consumers expect to receive.

use crate::usb::host::{HostError, RawDevice, RawNotification, UsbConnection, UsbHost, WatchGuard};
use nix::errno::Errno;
use nix::unistd::{AccessFlags, access};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// USB interface class for communications devices
const CDC_CLASS: u8 = 0x02;
/// Abstract Control Model subclass
const ACM_SUBCLASS: u8 = 0x02;

/// How long one `handle_events` call may block before the stop flag is checked
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive event-loop failures treated as loss of registration
const MAX_EVENT_ERRORS: u32 = 50;

/// Production [`UsbHost`] for Linux
pub struct RusbHost {
    context: Context,
}

impl RusbHost {
    pub fn new() -> Result<Self, HostError> {
        let context = Context::new().map_err(|e| HostError::Enumeration(e.to_string()))?;
        Ok(Self { context })
    }
}

impl UsbHost for RusbHost {
    fn devices(&self) -> Result<Vec<RawDevice>, HostError> {
        let list = self
            .context
            .devices()
            .map_err(|e| HostError::Enumeration(e.to_string()))?;

        let mut devices = Vec::with_capacity(list.len());
        for device in list.iter() {
            match describe_device(&device) {
                Ok(raw) => devices.push(raw),
                Err(e) => warn!(
                    bus = device.bus_number(),
                    address = device.address(),
                    "Skipping device with unreadable descriptor: {}",
                    e
                ),
            }
        }

        debug!("Enumerated {} devices", devices.len());
        Ok(devices)
    }

    fn has_permission(&self, device: &RawDevice) -> bool {
        access(&device.node_path(), AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
    }

    fn open(&self, device: &RawDevice) -> Result<Box<dyn UsbConnection>, HostError> {
        let path = device.node_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.raw_os_error() == Some(Errno::EBUSY as i32) {
                    HostError::Busy
                } else {
                    HostError::Open(format!("{}: {}", path.display(), e))
                }
            })?;

        debug!(node = %path.display(), fd = file.as_raw_fd(), "Opened usbfs node");
        Ok(Box::new(UsbfsConnection { file }))
    }

    fn watch(
        &self,
        sink: async_channel::Sender<RawNotification>,
    ) -> Result<WatchGuard, HostError> {
        if !rusb::has_hotplug() {
            return Err(HostError::Hotplug(
                "libusb was built without hotplug support".to_string(),
            ));
        }

        let context = self.context.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run_hotplug_loop(context, sink, thread_stop, ready_tx))
            .map_err(|e| HostError::Hotplug(format!("failed to spawn hotplug thread: {}", e)))?;

        // The registration is created on the hotplug thread; wait for the verdict
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(WatchGuard::new(HotplugThread {
                stop,
                handle: Some(handle),
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(HostError::Hotplug("hotplug thread exited early".to_string()))
            }
        }
    }
}

/// A usbfs node opened read/write
struct UsbfsConnection {
    file: File,
}

impl UsbConnection for UsbfsConnection {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Owns the hotplug thread; dropping it stops the thread and unregisters
struct HotplugThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for HotplugThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("USB hotplug thread panicked");
        }
    }
}

/// Body of the `usb-hotplug` thread
///
/// Registers the callback, reports the outcome on `ready`, then drives libusb
/// events until stopped. Returning drops both the registration and the sink,
/// which the relay observes as the end of the OS stream.
fn run_hotplug_loop(
    context: Context,
    sink: async_channel::Sender<RawNotification>,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), HostError>>,
) {
    let callback = HotplugCallback { sink: sink.clone() };
    let registration: rusb::Registration<Context> = match HotplugBuilder::new()
        .enumerate(false)
        .register(&context, Box::new(callback))
    {
        Ok(registration) => registration,
        Err(e) => {
            let _ = ready.send(Err(HostError::Hotplug(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!("USB hotplug thread started");

    let mut consecutive_errors = 0;
    while !stop.load(Ordering::SeqCst) {
        match context.handle_events(Some(EVENT_POLL_INTERVAL)) {
            Ok(()) => consecutive_errors = 0,
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("Error handling USB events: {}", e);
                if consecutive_errors >= MAX_EVENT_ERRORS {
                    error!("USB event loop failing persistently, dropping hotplug registration");
                    break;
                }
                std::thread::sleep(EVENT_POLL_INTERVAL);
            }
        }

        if sink.is_closed() {
            debug!("Hotplug sink closed by receiver");
            break;
        }
    }

    drop(registration);
    info!("USB hotplug thread stopped");
}

/// Forwards libusb hotplug callbacks into the relay's raw channel
struct HotplugCallback {
    sink: async_channel::Sender<RawNotification>,
}

impl HotplugCallback {
    fn forward<T: UsbContext>(&self, action: &str, device: &Device<T>) {
        let raw = match describe_device(device) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    bus = device.bus_number(),
                    address = device.address(),
                    action,
                    "Dropping hotplug notification, descriptor unreadable: {}",
                    e
                );
                return;
            }
        };

        trace!(action, device = %raw, "Hotplug callback");
        if let Err(e) = self.sink.send_blocking(RawNotification {
            action: action.to_string(),
            device: raw,
        }) {
            error!("Failed to forward hotplug notification: {}", e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        self.forward("add", &device);
    }

    fn device_left(&mut self, device: Device<T>) {
        self.forward("remove", &device);
    }
}

/// Snapshot what the core needs from a libusb device
fn describe_device<T: UsbContext>(device: &Device<T>) -> Result<RawDevice, rusb::Error> {
    let desc = device.device_descriptor()?;
    let bus = device.bus_number();

    let port_path = match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => Some(format_port_path(bus, &ports)),
        _ => None,
    };

    // Config descriptors may be unreadable for a detached device; treat as non-ACM
    let cdc_acm = device
        .active_config_descriptor()
        .map(|config| {
            config.interfaces().any(|interface| {
                interface.descriptors().any(|alt| {
                    alt.class_code() == CDC_CLASS && alt.sub_class_code() == ACM_SUBCLASS
                })
            })
        })
        .unwrap_or(false);

    Ok(RawDevice {
        bus,
        address: device.address(),
        port_path,
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        class_code: desc.class_code(),
        cdc_acm,
    })
}

/// sysfs-style port path: `<bus>-<port>[.<port>...]`
fn format_port_path(bus: u8, ports: &[u8]) -> String {
    let ports: Vec<String> = ports.iter().map(u8::to_string).collect();
    format!("{}-{}", bus, ports.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_port_path() {
        assert_eq!(format_port_path(1, &[1]), "1-1");
        assert_eq!(format_port_path(3, &[2, 1, 4]), "3-2.1.4");
    }

    #[test]
    fn test_rusb_host_creation() {
        // libusb may be unavailable in sandboxed environments
        match RusbHost::new() {
            Ok(host) => {
                let _ = host.devices();
            }
            Err(e) => eprintln!("libusb context unavailable (expected in CI): {}", e),
        }
    }

    #[test]
    fn test_hotplug_registration_round_trip() {
        let Ok(host) = RusbHost::new() else {
            return;
        };
        if !rusb::has_hotplug() {
            return;
        }

        let (sink, raw) = async_channel::unbounded();
        match host.watch(sink) {
            Ok(guard) => {
                assert!(!raw.is_closed());
                // Unregisters and joins the hotplug thread
                drop(guard);
            }
            Err(e) => eprintln!("hotplug registration unavailable: {}", e),
        }
    }
}
