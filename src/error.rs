//! Error types for the AT-command driver

use std::io;

use crate::protocol::ring_buffer::RingBufferError;

/// Result type alias using AtError
pub type AtResult<T> = std::result::Result<T, AtError>;

/// Errors surfaced by the protocol engine, sockets and the device controller
#[derive(Debug, thiserror::Error)]
pub enum AtError {
    /// No reply arrived within the allotted time
    #[error("timed out waiting for a reply{}", describe_command(.command))]
    CommandTimeout { command: Option<String> },

    /// A reply arrived but was not the one expected
    #[error("expected '{expected}' but the module answered '{actual}'")]
    UnexpectedReply { expected: String, actual: String },

    /// The module answered ERROR or FAIL
    #[error("module rejected '{command}'")]
    DeviceError { command: String },

    /// The module could not resolve the host
    #[error("DNS lookup failed for '{host}'")]
    DnsLookupFailed { host: String },

    /// Every channel slot is in use
    #[error("all channels are in use - close a socket first")]
    ChannelExhausted,

    /// Malformed traffic or an internal inconsistency with the module
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    /// The access point refused the join
    #[error("failed to join access point '{ssid}'")]
    JoinFailed { ssid: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("socket has been disposed")]
    SocketDisposed,

    #[error("driver is shutting down")]
    ShuttingDown,

    /// Serial link failure
    #[error("link error: {0}")]
    Link(#[from] io::Error),
}

impl AtError {
    /// Check if the error is worth retrying at the caller's level
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AtError::CommandTimeout { .. } | AtError::DnsLookupFailed { .. }
        )
    }

    pub(crate) fn timeout(command: Option<&str>) -> Self {
        AtError::CommandTimeout {
            command: command.map(str::to_string),
        }
    }
}

fn describe_command(command: &Option<String>) -> String {
    command
        .as_deref()
        .map(|c| format!(" to '{c}'"))
        .unwrap_or_default()
}

impl From<RingBufferError> for AtError {
    fn from(err: RingBufferError) -> Self {
        AtError::ProtocolFault(err.to_string())
    }
}
