//! Message serialization and deserialization using postcard
//!
//! Messages are serialized with postcard and framed with a length prefix so
//! they can be carried over a Unix stream socket.
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][Message bytes (postcard serialized)]
//! ```
//!
//! A descriptor handed off to the consumer rides along as ancillary data on
//! the first byte of its response frame; the frame layout itself is unchanged.

use crate::{CURRENT_VERSION, Message, ProtocolVersion, error::ProtocolError, error::Result};
use std::io::{Read, Write};

/// Maximum allowed frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length of the frame header
pub const FRAME_HEADER_LEN: usize = 4;

/// Encode a message to bytes using postcard
///
/// # Example
/// ```
/// use protocol::{Message, MessagePayload, encode_message};
///
/// let msg = Message::new(MessagePayload::ListDevicesRequest);
/// let bytes = encode_message(&msg).unwrap();
/// assert!(!bytes.is_empty());
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(ProtocolError::from)
}

/// Decode a message from bytes using postcard
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate protocol version compatibility
///
/// Compatible if major versions match; minor differences are tolerated in
/// both directions.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if message_version.major != CURRENT_VERSION.major {
        return Err(ProtocolError::IncompatibleVersion {
            major: message_version.major,
            minor: message_version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

/// Parse a frame header into the body length
pub fn frame_length(header: [u8; FRAME_HEADER_LEN]) -> Result<usize> {
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(length)
}

/// Encode a message with length prefix for framing
///
/// # Example
/// ```
/// use protocol::{Message, MessagePayload, encode_framed};
///
/// let msg = Message::new(MessagePayload::SubscribeHotplugRequest);
/// let framed = encode_framed(&msg).unwrap();
/// assert!(framed.len() >= 4);
/// ```
pub fn encode_framed(message: &Message) -> Result<Vec<u8>> {
    let message_bytes = encode_message(message)?;
    let message_len = message_bytes.len();

    if message_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: message_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + message_len);
    frame.extend_from_slice(&(message_len as u32).to_be_bytes());
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

/// Decode a framed message
///
/// # Example
/// ```
/// use protocol::{Message, MessagePayload, encode_framed, decode_framed};
///
/// let msg = Message::new(MessagePayload::HotplugSubscribed);
/// let framed = encode_framed(&msg).unwrap();
/// let decoded = decode_framed(&framed).unwrap();
/// assert!(matches!(decoded.payload, MessagePayload::HotplugSubscribed));
/// ```
pub fn decode_framed(frame: &[u8]) -> Result<Message> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_LEN,
            actual: frame.len(),
        });
    }

    let length = frame_length([frame[0], frame[1], frame[2], frame[3]])?;

    if frame.len() < FRAME_HEADER_LEN + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_LEN + length,
            actual: frame.len(),
        });
    }

    decode_message(&frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length])
}

/// Write a framed message to a blocking writer
pub fn write_framed<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let framed = encode_framed(message)?;
    writer.write_all(&framed)?;
    Ok(())
}

/// Read a framed message from a blocking reader
///
/// # Example
/// ```
/// use protocol::{Message, MessagePayload, write_framed, read_framed};
/// use std::io::Cursor;
///
/// let mut buffer = Vec::new();
/// write_framed(&mut buffer, &Message::new(MessagePayload::ListDevicesRequest)).unwrap();
///
/// let decoded = read_framed(&mut Cursor::new(buffer)).unwrap();
/// assert!(matches!(decoded.payload, MessagePayload::ListDevicesRequest));
/// ```
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let length = frame_length(header)?;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes)?;

    decode_message(&message_bytes)
}
