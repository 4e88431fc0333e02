//! Error types for the NxScope wire format.
//!
//! Header and footer errors are recoverable by byte-level resync in the
//! receive pipeline; the remaining variants indicate a payload that is
//! inconsistent with its frame id and cause the offending frame to be
//! dropped while the session continues.

use thiserror::Error;

use crate::frame::FrameId;

/// Result alias for protocol operations.
pub type Result<T> = core::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding NxScope frames and payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Buffer too short to contain the expected structure
    #[error("data too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Number of bytes available
        actual: usize,
    },

    /// Start-of-frame byte mismatch
    #[error("invalid start-of-frame byte: {0:#04x}")]
    InvalidSof(u8),

    /// Frame id byte does not map to a known frame type
    #[error("unknown frame id: {0:#04x}")]
    UnknownId(u8),

    /// Frame id cannot be put on the wire (sentinel values)
    #[error("frame id {0:?} is not encodable")]
    UnencodableId(FrameId),

    /// Length field smaller than header + footer
    #[error("frame length field out of range: {0}")]
    InvalidLength(u16),

    /// Payload does not fit the 16-bit length field
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Requested payload size
        size: usize,
        /// Maximum encodable payload size
        max: usize,
    },

    /// CRC residue over the full frame was nonzero
    #[error("crc mismatch: residue {0:#06x}")]
    CrcMismatch(u16),

    /// Payload decoded for a different frame id than expected
    #[error("unexpected frame id: expected {expected:?}, got {actual:?}")]
    UnexpectedId {
        /// Frame id required by the decoder
        expected: FrameId,
        /// Frame id actually present
        actual: FrameId,
    },

    /// Set-frame flags byte outside SINGLE/BULK/ALL
    #[error("invalid set-frame flags: {0:#04x}")]
    InvalidSetFlags(u8),

    /// Set-frame addressed a channel outside the device range
    #[error("channel id out of range: {chan} (chmax {chmax})")]
    ChannelOutOfRange {
        /// Offending channel id
        chan: u8,
        /// Number of channels reported by the device
        chmax: u8,
    },

    /// Stream sample referenced a channel the device does not report
    #[error("unknown channel id in stream: {0}")]
    UnknownChannel(u8),

    /// Channel dtype has no built-in format and no user registration
    #[error("no sample format for dtype {0}")]
    UnknownSampleType(u8),

    /// User type table entry is malformed
    #[error("invalid user type for dtype {dtype}: {reason}")]
    InvalidUserType {
        /// The dtype being registered or used
        dtype: u8,
        /// What is wrong with the definition
        reason: &'static str,
    },

    /// Character data was not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Sample data shape does not match the channel format
    #[error("sample data does not match the format of channel {0}")]
    SampleMismatch(u8),

    /// Metadata value count does not match the channel `mlen`
    #[error("metadata arity mismatch: mlen {mlen} with {values} values")]
    MetaMismatch {
        /// Channel metadata length in bytes
        mlen: u8,
        /// Number of metadata values supplied
        values: usize,
    },
}
