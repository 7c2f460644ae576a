//! USB descriptor bridge daemon
//!
//! Discovers USB serial devices, tracks OS access permission, relays
//! attach/detach notifications and hands exclusively-owned duplicated
//! device descriptors to a consumer process over a Unix socket.
//!
//! The core is [`session::SessionManager`]; [`rpc::BridgeServer`] exposes it
//! to consumers.

pub mod config;
pub mod rpc;
pub mod service;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use session::{SessionManager, SessionOptions};
