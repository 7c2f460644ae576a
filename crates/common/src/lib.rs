//! Common utilities for usb-fd-bridge
//!
//! This crate provides functionality shared by the bridge daemon and its
//! consumers: error handling, logging setup, framed message transport with
//! descriptor passing over Unix sockets, and test fixtures.

pub mod error;
pub mod fd_passing;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use fd_passing::{ReceivedMessage, recv_message, send_message, send_message_with_fd};
pub use logging::setup_logging;
