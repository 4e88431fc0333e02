//! Error types for the NxScope client.
//!
//! Wire-level problems surface as [`nxscope_proto::ProtocolError`] wrapped
//! in [`ClientError::Protocol`]; everything the command layer and the
//! public API can fail with is a [`ClientError`].

use std::time::Duration;

use thiserror::Error;

use nxscope_proto::ProtocolError;

/// Result alias for client operations.
pub type Result<T> = core::result::Result<T, ClientError>;

/// Errors surfaced by the public client operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Operation requires a connected device
    #[error("not connected to a device")]
    NotConnected,

    /// Expected reply did not arrive within the control-path timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Caller supplied a channel id outside the device range
    #[error("channel id out of range: {chan} (chmax {chmax})")]
    InvalidChannel {
        /// Offending channel id
        chan: u8,
        /// Number of channels reported by the device
        chmax: u8,
    },

    /// Per-channel divider list does not cover the selected channels
    #[error("divider list has {got} entries for {expected} selected channels")]
    DividerLengthMismatch {
        /// Number of selected channels
        expected: usize,
        /// Number of divider entries supplied
        got: usize,
    },

    /// Device acknowledged the request with a nonzero return code
    #[error("device rejected the request: retcode {0}")]
    Nack(i32),

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire-level decode or encode failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Timeouts are transient; protocol violations and bad arguments are
    /// not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn other_errors_are_fatal() {
        assert!(!ClientError::NotConnected.is_transient());
        assert!(!ClientError::InvalidChannel { chan: 9, chmax: 4 }.is_transient());
        assert!(!ClientError::Nack(-1).is_transient());
        assert!(!ClientError::Transport("gone".to_string()).is_transient());
    }
}
