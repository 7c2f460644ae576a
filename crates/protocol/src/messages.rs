//! Protocol message definitions
//!
//! This module defines every message exchanged over the bridge socket.
//! Messages are organized into logical groups:
//! - Discovery (list devices, permission check)
//! - Descriptor hand-off (open and duplicate)
//! - Hotplug stream (subscribe, notifications, stream end)
//! - Connection errors

use crate::types::{
    DeviceDescriptor, DeviceIdentity, HotplugEvent, SessionError, StreamEndReason,
};
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Top-level message envelope
///
/// All protocol messages are wrapped in this envelope which includes
/// the protocol version for compatibility checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of this message
    pub version: ProtocolVersion,
    /// Message payload
    pub payload: MessagePayload,
}

impl Message {
    /// Wrap a payload in an envelope carrying the current version
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            version: crate::CURRENT_VERSION,
            payload,
        }
    }
}

/// All message types in the protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    // Discovery
    /// Request a snapshot of attached devices
    ListDevicesRequest,

    /// Device snapshot or enumeration failure
    ListDevicesResponse {
        result: Result<Vec<DeviceDescriptor>, SessionError>,
    },

    /// Ask whether the daemon currently holds OS access to a device
    HasPermissionRequest { identity: DeviceIdentity },

    /// Permission answer
    HasPermissionResponse { result: Result<bool, SessionError> },

    // Descriptor hand-off
    /// Open a device and hand over a duplicated descriptor
    OpenAndDuplicateRequest { identity: DeviceIdentity },

    /// Hand-off result
    ///
    /// On success the duplicated descriptor is attached to this frame as
    /// `SCM_RIGHTS` ancillary data; the payload only names the device.
    OpenAndDuplicateResponse {
        result: Result<DeviceIdentity, SessionError>,
    },

    // Hotplug stream
    /// Become the single hotplug subscriber (replaces any other)
    SubscribeHotplugRequest,

    /// Subscription is active
    HotplugSubscribed,

    /// Stop receiving hotplug events on this connection
    CancelHotplugRequest,

    /// Device attach/detach event
    HotplugNotification { event: HotplugEvent },

    /// The subscription on this connection has ended
    HotplugStreamEnded { reason: StreamEndReason },

    // Connection management
    /// Protocol-level error message
    Error {
        /// Human-readable error message
        message: String,
    },
}

impl MessagePayload {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::ListDevicesRequest => "ListDevicesRequest",
            MessagePayload::ListDevicesResponse { .. } => "ListDevicesResponse",
            MessagePayload::HasPermissionRequest { .. } => "HasPermissionRequest",
            MessagePayload::HasPermissionResponse { .. } => "HasPermissionResponse",
            MessagePayload::OpenAndDuplicateRequest { .. } => "OpenAndDuplicateRequest",
            MessagePayload::OpenAndDuplicateResponse { .. } => "OpenAndDuplicateResponse",
            MessagePayload::SubscribeHotplugRequest => "SubscribeHotplugRequest",
            MessagePayload::HotplugSubscribed => "HotplugSubscribed",
            MessagePayload::CancelHotplugRequest => "CancelHotplugRequest",
            MessagePayload::HotplugNotification { .. } => "HotplugNotification",
            MessagePayload::HotplugStreamEnded { .. } => "HotplugStreamEnded",
            MessagePayload::Error { .. } => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CURRENT_VERSION;

    #[test]
    fn test_message_new_uses_current_version() {
        let msg = Message::new(MessagePayload::ListDevicesRequest);
        assert_eq!(msg.version, CURRENT_VERSION);
        assert_eq!(msg.payload.kind(), "ListDevicesRequest");
    }
}
