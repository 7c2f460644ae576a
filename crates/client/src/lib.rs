//! Consumer side of the USB descriptor bridge
//!
//! Connects to the bridge daemon, lists devices, checks permission, receives
//! duplicated device descriptors and follows the hotplug stream.
//!
//! # Example
//!
//! ```no_run
//! use client::BridgeClient;
//! use protocol::DeviceIdentity;
//!
//! # async fn example() -> common::Result<()> {
//! let bridge = BridgeClient::connect("/run/user/1000/usb-fd-bridge.sock").await?;
//! for device in bridge.list_devices().await? {
//!     println!("{}", device);
//! }
//! let (_identity, fd) = bridge.open_and_duplicate(&DeviceIdentity::new("1-1")).await?;
//! // `fd` is ours to use and close
//! # drop(fd);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;

pub use bridge::{BridgeClient, DEFAULT_REQUEST_TIMEOUT, HotplugFeed};
