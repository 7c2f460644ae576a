//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error(transparent)]
    Session(#[from] protocol::SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Bridge reported an error: {0}")]
    Remote(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
