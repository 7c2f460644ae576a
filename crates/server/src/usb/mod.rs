//! USB subsystem
//!
//! The device session core, leaves first:
//! - `host`: the OS capability boundary and its Linux implementation
//! - `directory`: enumeration and the identity rule
//! - `permission`: live OS access checks
//! - `handoff`: open, duplicate, release
//! - `hotplug`: single-subscriber attach/detach relay
//!
//! libusb work (enumeration, hotplug event handling) happens on blocking
//! threads; only the relay task runs on the Tokio runtime.

pub mod directory;
pub mod filter;
pub mod handoff;
pub mod host;
pub mod hotplug;
pub mod linux;
pub mod permission;

pub use directory::{DeviceDirectory, describe, identity_of};
pub use filter::{DeviceFilter, FilterPattern};
pub use handoff::{
    CloexecDup, DescriptorHandoff, DupStrategy, DupStrategyKind, LegacyDup, OwnedHandle,
    select_strategy,
};
pub use host::{HostError, RawDevice, RawNotification, UsbConnection, UsbHost, WatchGuard};
pub use hotplug::{HotplugRelay, HotplugSubscription};
pub use linux::RusbHost;
pub use permission::PermissionGate;
