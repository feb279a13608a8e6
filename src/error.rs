//! Error taxonomy shared by every component

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("short read: {0}")]
    ShortRead(String),
    #[error("short write: {0}")]
    ShortWrite(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed by peer")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("handshake rejected: {0}")]
    BadHandshake(String),
    #[error("unexpected opcode {actual}, expected {expected}")]
    UnexpectedOpcode { expected: u32, actual: u32 },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("remote reported an error: {0}")]
    ApplicationError(String),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Not a failure; the operation should be retried later
    #[error("rate limited, retry in {0:?}")]
    RateLimited(std::time::Duration),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rejected: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Whether the failure means the underlying connection is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::ShortRead(_)
                    | TransportError::ShortWrite(_)
                    | TransportError::NotConnected
                    | TransportError::Closed
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
