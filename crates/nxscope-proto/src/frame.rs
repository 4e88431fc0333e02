//! Serial frame codec.
//!
//! Every NxScope message travels in the same envelope:
//!
//! ```text
//! [SOF: 0x55] [length: u16 LE] [id: u8] [payload: 0..N] [crc16: u16 BE]
//! ```
//!
//! `length` counts the whole frame including header and footer. The footer
//! is CRC-16/XMODEM over header + payload, appended big-endian, which makes
//! the CRC over the *entire* frame zero. Validation is therefore a single
//! checksum pass over `length` bytes with no re-splitting.
//!
//! # Invariants
//!
//! - Size consistency: `length == HDR_LEN + payload.len() + FOOT_LEN`,
//!   enforced by [`Frame::create`] and verified by [`Frame::decode`].
//! - Known id: only ids in [`FrameId`] decode; the `Undef` and `Invalid`
//!   sentinels never appear on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{CRC_16_XMODEM, Crc};

use crate::errors::{ProtocolError, Result};

/// Start-of-frame sentinel byte.
pub const SOF: u8 = 0x55;

/// Serialized header size: SOF + length + id.
pub const HDR_LEN: usize = 4;

/// Serialized footer size: big-endian CRC-16.
pub const FOOT_LEN: usize = 2;

/// Largest payload that still fits the 16-bit total-length field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HDR_LEN - FOOT_LEN;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Frame type discriminator carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameId {
    /// Sentinel: no frame (never on the wire)
    Undef = 0,
    /// Unsolicited multi-channel sample data
    Stream = 1,
    /// Device capability request/reply
    Cmninfo = 2,
    /// Per-channel info request/reply
    Chinfo = 3,
    /// Acknowledgement with return code
    Ack = 4,
    /// Stream start/stop request
    Start = 5,
    /// Channel enable set-frame
    Enable = 6,
    /// Channel divider set-frame
    Div = 7,
    /// Sentinel: first invalid id (never on the wire)
    Invalid = 8,
}

impl FrameId {
    /// Decode a wire id byte. `None` for unknown values.
    #[must_use]
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Undef),
            1 => Some(Self::Stream),
            2 => Some(Self::Cmninfo),
            3 => Some(Self::Chinfo),
            4 => Some(Self::Ack),
            5 => Some(Self::Start),
            6 => Some(Self::Enable),
            7 => Some(Self::Div),
            8 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Wire representation of this id.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// True for ids that may be placed on the wire.
    #[must_use]
    pub fn is_encodable(self) -> bool {
        !matches!(self, Self::Undef | Self::Invalid)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type
    pub id: FrameId,
    /// Total frame length including header and footer
    pub len: u16,
}

impl FrameHeader {
    /// Decode a header from the first [`HDR_LEN`] bytes of `data`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::TooShort`] if fewer than [`HDR_LEN`] bytes
    /// - [`ProtocolError::InvalidSof`] if the first byte is not [`SOF`]
    /// - [`ProtocolError::UnknownId`] if the id byte is not recognized
    /// - [`ProtocolError::InvalidLength`] if the length field is smaller
    ///   than an empty frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        let hdr: &[u8; HDR_LEN] = data
            .get(..HDR_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or(ProtocolError::TooShort { expected: HDR_LEN, actual: data.len() })?;

        if hdr[0] != SOF {
            return Err(ProtocolError::InvalidSof(hdr[0]));
        }

        let len = u16::from_le_bytes([hdr[1], hdr[2]]);
        if (len as usize) < HDR_LEN + FOOT_LEN {
            return Err(ProtocolError::InvalidLength(len));
        }

        let id = FrameId::from_u8(hdr[3]).ok_or(ProtocolError::UnknownId(hdr[3]))?;

        Ok(Self { id, len })
    }
}

/// Position of the first [`SOF`] byte in `data`, if any.
#[must_use]
pub fn sof_find(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == SOF)
}

/// Validate the CRC residue over a complete frame.
///
/// Because the footer CRC is chosen so that the checksum over the whole
/// frame is zero, this accepts exactly the frames whose payload and header
/// are undamaged.
#[must_use]
pub fn footer_validate(frame: &[u8]) -> bool {
    CRC16.checksum(frame) == 0
}

/// A decoded protocol frame: id plus raw payload bytes.
///
/// Payload semantics are determined by [`FrameId`]; see
/// [`crate::payloads`] and [`crate::stream`] for the per-id codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub id: FrameId,
    /// Raw payload bytes (without header or footer)
    pub payload: Bytes,
}

impl Frame {
    /// Encode a complete wire frame for `id` with `payload`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnencodableId`] for the `Undef`/`Invalid`
    ///   sentinels
    /// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    ///   [`MAX_PAYLOAD`]
    pub fn create(id: FrameId, payload: &[u8]) -> Result<Bytes> {
        if !id.is_encodable() {
            return Err(ProtocolError::UnencodableId(id));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(frame_write(id, payload))
    }

    /// Decode a frame from `data`, which must hold the complete frame.
    ///
    /// Trailing bytes after the declared length are ignored; the caller
    /// keeps them for the next frame.
    ///
    /// # Errors
    ///
    /// Header errors as in [`FrameHeader::decode`], plus
    /// [`ProtocolError::TooShort`] when `data` is shorter than the
    /// declared length and [`ProtocolError::CrcMismatch`] on a bad footer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let hdr = FrameHeader::decode(data)?;

        let flen = hdr.len as usize;
        let body = data
            .get(..flen)
            .ok_or(ProtocolError::TooShort { expected: flen, actual: data.len() })?;

        let residue = CRC16.checksum(body);
        if residue != 0 {
            return Err(ProtocolError::CrcMismatch(residue));
        }

        Ok(Self {
            id: hdr.id,
            payload: Bytes::copy_from_slice(&body[HDR_LEN..flen - FOOT_LEN]),
        })
    }
}

/// Assemble a frame without validation. Internal fast path for the payload
/// builders, which construct ids and sizes that are valid by construction.
pub(crate) fn frame_write(id: FrameId, payload: &[u8]) -> Bytes {
    let flen = (HDR_LEN + payload.len() + FOOT_LEN) as u16;

    let mut buf = BytesMut::with_capacity(flen as usize);
    buf.put_u8(SOF);
    buf.put_u16_le(flen);
    buf.put_u8(id.to_u8());
    buf.put_slice(payload);

    let crc = CRC16.checksum(&buf);
    buf.put_u16(crc);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_frame_wire_bytes() {
        let frame = Frame::create(FrameId::Start, &[0x01]).unwrap();
        assert_eq!(frame.as_ref(), &[0x55, 0x07, 0x00, 0x05, 0x01, 0x88, 0x9c]);

        let decoded = Frame::decode(&frame).unwrap();
        assert_eq!(decoded.id, FrameId::Start);
        assert_eq!(decoded.payload.as_ref(), &[0x01]);
    }

    #[test]
    fn empty_payload_frame() {
        let frame = Frame::create(FrameId::Cmninfo, &[]).unwrap();
        assert_eq!(frame.len(), HDR_LEN + FOOT_LEN);

        let decoded = Frame::decode(&frame).unwrap();
        assert_eq!(decoded.id, FrameId::Cmninfo);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn sentinels_are_not_encodable() {
        assert_eq!(
            Frame::create(FrameId::Undef, &[]),
            Err(ProtocolError::UnencodableId(FrameId::Undef))
        );
        assert_eq!(
            Frame::create(FrameId::Invalid, &[]),
            Err(ProtocolError::UnencodableId(FrameId::Invalid))
        );
    }

    #[test]
    fn reject_bad_sof() {
        let mut frame = Frame::create(FrameId::Ack, &[0, 0, 0, 0]).unwrap().to_vec();
        frame[0] = 0xAA;
        assert_eq!(Frame::decode(&frame), Err(ProtocolError::InvalidSof(0xAA)));
    }

    #[test]
    fn reject_unknown_id() {
        let mut frame = Frame::create(FrameId::Ack, &[0, 0, 0, 0]).unwrap().to_vec();
        frame[3] = 0x42;
        // fix up the footer so only the id is wrong
        let flen = frame.len();
        let crc = CRC16.checksum(&frame[..flen - FOOT_LEN]);
        frame[flen - 2..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(Frame::decode(&frame), Err(ProtocolError::UnknownId(0x42)));
    }

    #[test]
    fn reject_corrupted_payload() {
        let mut frame = Frame::create(FrameId::Stream, &[0x00, 0x01, 0x02]).unwrap().to_vec();
        frame[5] ^= 0xFF;
        assert!(matches!(Frame::decode(&frame), Err(ProtocolError::CrcMismatch(_))));
    }

    #[test]
    fn reject_truncated_frame() {
        let frame = Frame::create(FrameId::Chinfo, &[0x07]).unwrap();
        let result = Frame::decode(&frame[..frame.len() - 1]);
        assert_eq!(result, Err(ProtocolError::TooShort { expected: 7, actual: 6 }));
    }

    #[test]
    fn reject_undersized_length_field() {
        // length field claims 4 bytes, below the empty-frame minimum of 6
        let data = [SOF, 0x04, 0x00, 0x01];
        assert_eq!(FrameHeader::decode(&data), Err(ProtocolError::InvalidLength(4)));
    }

    #[test]
    fn footer_residue_is_zero_for_valid_frames() {
        let frame = Frame::create(FrameId::Start, &[0x01]).unwrap();
        assert!(footer_validate(&frame));
        assert!(!footer_validate(&frame[..frame.len() - 1]));
    }

    #[test]
    fn payload_size_boundary() {
        let max = vec![0xA5u8; MAX_PAYLOAD];
        let frame = Frame::create(FrameId::Stream, &max).unwrap();
        assert_eq!(frame.len(), u16::MAX as usize);
        assert_eq!(Frame::decode(&frame).unwrap().payload.len(), MAX_PAYLOAD);

        let over = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            Frame::create(FrameId::Stream, &over),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn sof_scan_finds_first_sentinel() {
        assert_eq!(sof_find(&[0x00, 0x11, SOF, SOF]), Some(2));
        assert_eq!(sof_find(&[0x00, 0x11, 0x22]), None);
        assert_eq!(sof_find(&[]), None);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut data = Frame::create(FrameId::Start, &[0x00]).unwrap().to_vec();
        data.extend_from_slice(&[0xDE, 0xAD]);
        let decoded = Frame::decode(&data).unwrap();
        assert_eq!(decoded.payload.as_ref(), &[0x00]);
    }
}
