//! Errors raised while encoding, framing or reading bridge messages

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// postcard could not encode or decode a message body
    #[error("Malformed message body: {0}")]
    Serialization(#[from] postcard::Error),

    /// The peer speaks another major protocol version
    #[error(
        "Peer uses protocol {major}.{minor}, this bridge speaks {expected_major}.{expected_minor}"
    )]
    IncompatibleVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Length prefix above `MAX_FRAME_SIZE`; the stream cannot be resynchronised
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// Buffer ends before the header or body it announces
    #[error("Truncated frame: {actual} of {expected} bytes present")]
    IncompleteFrame { expected: usize, actual: usize },

    #[error("Socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
