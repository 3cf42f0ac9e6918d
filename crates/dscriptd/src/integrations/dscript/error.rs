use std::net::IpAddr;
use std::path::PathBuf;

use super::channel::ChannelKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the dScript integration and by protocol backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection to {0} failed: {1}")]
    Connection(IpAddr, #[source] std::io::Error),

    #[error("board {0} did not answer in time")]
    Timeout(IpAddr),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),

    #[error("unknown entity {0}")]
    UnknownEntity(String),

    #[error("{kind} channels do not accept {value}")]
    ValueMismatch { kind: ChannelKind, value: String },

    #[error("{kind} channels do not support {operation}")]
    Unsupported {
        kind: ChannelKind,
        operation: &'static str,
    },

    #[error("server did not reach {0} state after {1} polls")]
    ServerTimeout(&'static str, u32),

    #[error("failed to access cache file {0}: {1}")]
    CacheIo(PathBuf, #[source] std::io::Error),

    #[error("failed to decode cache file {0}: {1}")]
    CacheFormat(PathBuf, #[source] serde_json::Error),
}

impl Error {
    /// Whether this error means the board could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connection(..) | Error::Timeout(_))
    }
}
