//! Wire protocol for the USB descriptor bridge
//!
//! This crate defines the types shared by the bridge daemon and its
//! consumers: device identities, descriptors, hotplug events, the session
//! error taxonomy, and the versioned message envelope with its postcard
//! codec.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceIdentity, Message, MessagePayload};
//! use protocol::{encode_framed, decode_framed};
//!
//! let msg = Message::new(MessagePayload::HasPermissionRequest {
//!     identity: DeviceIdentity::new("1-1"),
//! });
//!
//! let framed = encode_framed(&msg).unwrap();
//! let decoded = decode_framed(&framed).unwrap();
//! assert!(matches!(decoded.payload, MessagePayload::HasPermissionRequest { .. }));
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{
    FRAME_HEADER_LEN, MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed,
    encode_message, frame_length, read_framed, validate_version, write_framed,
};
pub use error::{ProtocolError, Result};
pub use messages::{Message, MessagePayload};
pub use types::{
    DeviceDescriptor, DeviceIdentity, HotplugEvent, HotplugKind, PermissionState, SessionError,
    StreamEndReason,
};
pub use version::{CURRENT_VERSION, ProtocolVersion};
