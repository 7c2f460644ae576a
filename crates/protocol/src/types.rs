//! Device session type definitions
//!
//! This module defines the types exchanged between the bridge daemon and its
//! consumers: device identities and descriptors, hotplug events, and the
//! session error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable device identity
///
/// Derived from the physical port path (e.g. `"1-1.4"`) when the OS reports
/// one, otherwise from the OS-assigned numeric device id (`"usb-dev-1005"`).
/// The same physical attachment always maps to the same identity, and two
/// devices attached at the same time never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity(pub String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Device descriptor returned by enumeration and carried by hotplug events
///
/// Produced fresh on every query; never cached by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identity of the attachment
    pub identity: DeviceIdentity,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.identity, self.vendor_id, self.product_id
        )
    }
}

/// OS access permission for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionState {
    Granted,
    Denied,
}

impl PermissionState {
    pub fn is_granted(self) -> bool {
        self == PermissionState::Granted
    }
}

impl From<bool> for PermissionState {
    fn from(granted: bool) -> Self {
        if granted {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        }
    }
}

/// Kind of hotplug notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HotplugKind {
    Attached,
    Detached,
}

impl HotplugKind {
    /// Classify an OS action string
    ///
    /// Accepts the udev action names (`add`/`remove`) as well as the
    /// `attached`/`detached` spelling. Any other action (`bind`, `change`,
    /// ...) is not a hotplug transition and yields `None`.
    pub fn from_action(action: &str) -> Option<Self> {
        match action.to_ascii_lowercase().as_str() {
            "add" | "attached" | "arrived" => Some(HotplugKind::Attached),
            "remove" | "detached" | "left" => Some(HotplugKind::Detached),
            _ => None,
        }
    }
}

/// Hotplug event delivered to the single active subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugEvent {
    pub kind: HotplugKind,
    pub device: DeviceDescriptor,
}

/// Why a hotplug subscription stopped delivering events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEndReason {
    /// Another subscriber took over the stream
    Replaced,
    /// The subscriber cancelled
    Cancelled,
    /// The OS hotplug registration was lost; resubscribing may recover
    RegistrationLost,
    /// The session manager is shutting down
    Shutdown,
}

impl fmt::Display for StreamEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StreamEndReason::Replaced => "replaced by a newer subscriber",
            StreamEndReason::Cancelled => "cancelled",
            StreamEndReason::RegistrationLost => "OS hotplug registration lost",
            StreamEndReason::Shutdown => "session manager shut down",
        };
        f.write_str(text)
    }
}

/// Session command failure
///
/// Every failure of a consumer-facing command is reported as one of these;
/// none are swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum SessionError {
    /// The OS device query failed (transient, retry)
    #[error("device enumeration failed: {message}")]
    EnumerationError { message: String },

    /// The identity is stale (re-enumerate)
    #[error("device {identity} not found")]
    DeviceNotFound { identity: DeviceIdentity },

    /// The process lacks OS access (drive the permission flow, then retry)
    #[error("permission denied for device {identity}")]
    PermissionDenied { identity: DeviceIdentity },

    /// The OS refused the open or produced an unusable handle
    #[error("failed to open device {identity}: {reason}")]
    OpenFailed {
        identity: DeviceIdentity,
        reason: String,
        /// The OS reported the device as busy
        busy: bool,
    },

    /// An open for this identity is already in flight
    #[error("device {identity} is already being opened")]
    AlreadyOpening { identity: DeviceIdentity },
}

impl SessionError {
    /// Whether retrying the same command unchanged can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::EnumerationError { .. } => true,
            SessionError::OpenFailed { busy, .. } => *busy,
            _ => false,
        }
    }

    pub fn open_failed(identity: &DeviceIdentity, reason: impl Into<String>) -> Self {
        SessionError::OpenFailed {
            identity: identity.clone(),
            reason: reason.into(),
            busy: false,
        }
    }
}
