//! Control payload codecs.
//!
//! Host-side builders produce complete wire frames for the request set
//! (START, CMNINFO, CHINFO, ENABLE, DIV) and decoders for the replies
//! (CMNINFO, CHINFO, ACK). The device-side half (request decode, reply
//! encode) lives here too so the loopback harness mirrors the protocol
//! from the same codec.
//!
//! ENABLE and DIV share the set-frame envelope:
//!
//! ```text
//! [flags: u8] [chan: u8] [body]
//! ```
//!
//! where `flags` selects SINGLE (one value for `chan`), ALL (one value for
//! every channel) or BULK (`chmax` values, one per channel). A full vector
//! whose values are all equal is emitted as ALL, never BULK.

use bytes::{BufMut, Bytes, BytesMut};

use crate::device::{Device, DeviceChannel, DeviceFlags};
use crate::errors::{ProtocolError, Result};
use crate::frame::{Frame, FrameId, frame_write};

/// Set-frame envelope flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetFlags {
    /// One value for one channel
    Single = 0,
    /// One value per channel, `chmax` values
    Bulk = 1,
    /// One value applied to every channel
    All = 2,
    /// Sentinel: first invalid flavor
    Invalid = 3,
}

impl SetFlags {
    /// Decode a flags byte. `None` for unknown values.
    #[must_use]
    pub fn from_u8(flags: u8) -> Option<Self> {
        match flags {
            0 => Some(Self::Single),
            1 => Some(Self::Bulk),
            2 => Some(Self::All),
            3 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A channel configuration request for ENABLE or DIV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetRequest<T> {
    /// Change one channel
    Single {
        /// Target channel id
        chan: u8,
        /// New value
        value: T,
    },
    /// Replace the configuration of every channel (`chmax` values)
    Vector(Vec<T>),
}

/// Build a START request frame (`true` starts, `false` stops the stream).
#[must_use]
pub fn start_frame(start: bool) -> Bytes {
    frame_write(FrameId::Start, &[u8::from(start)])
}

/// Build a CMNINFO request frame.
#[must_use]
pub fn cmninfo_frame() -> Bytes {
    frame_write(FrameId::Cmninfo, &[])
}

/// Build a CHINFO request frame for one channel.
#[must_use]
pub fn chinfo_frame(chan: u8) -> Bytes {
    frame_write(FrameId::Chinfo, &[chan])
}

/// Build an ENABLE set-frame.
///
/// # Errors
///
/// [`ProtocolError::ChannelOutOfRange`] for a bad single-channel id or a
/// vector whose length is not `chmax`.
pub fn enable_frame(req: &SetRequest<bool>, chmax: u8) -> Result<Bytes> {
    set_frame(FrameId::Enable, req, chmax, |en| u8::from(*en))
}

/// Build a DIV set-frame.
///
/// # Errors
///
/// [`ProtocolError::ChannelOutOfRange`] for a bad single-channel id or a
/// vector whose length is not `chmax`.
pub fn div_frame(req: &SetRequest<u8>, chmax: u8) -> Result<Bytes> {
    set_frame(FrameId::Div, req, chmax, |div| *div)
}

fn set_frame<T: PartialEq>(
    id: FrameId,
    req: &SetRequest<T>,
    chmax: u8,
    to_byte: impl Fn(&T) -> u8,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match req {
        SetRequest::Single { chan, value } => {
            if *chan >= chmax {
                return Err(ProtocolError::ChannelOutOfRange { chan: *chan, chmax });
            }
            buf.put_u8(SetFlags::Single.to_u8());
            buf.put_u8(*chan);
            buf.put_u8(to_byte(value));
        }
        SetRequest::Vector(values) => {
            if values.len() != chmax as usize || values.is_empty() {
                return Err(ProtocolError::ChannelOutOfRange {
                    chan: values.len().min(u8::MAX as usize) as u8,
                    chmax,
                });
            }
            if values.windows(2).all(|w| w[0] == w[1]) {
                // uniform full vector: ALL is the minimal wire form
                buf.put_u8(SetFlags::All.to_u8());
                buf.put_u8(0);
                buf.put_u8(to_byte(&values[0]));
            } else {
                buf.put_u8(SetFlags::Bulk.to_u8());
                buf.put_u8(0);
                for value in values {
                    buf.put_u8(to_byte(value));
                }
            }
        }
    }
    Ok(frame_write(id, &buf))
}

/// Decoded CMNINFO reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cmninfo {
    /// Number of channels
    pub chmax: u8,
    /// Capability flags
    pub flags: DeviceFlags,
    /// Required write-side alignment (0 = none)
    pub rxpadding: u8,
}

/// Decode a CMNINFO reply frame.
///
/// # Errors
///
/// [`ProtocolError::UnexpectedId`] for a non-CMNINFO frame,
/// [`ProtocolError::TooShort`] when the payload is under 3 bytes.
pub fn cmninfo_decode(frame: &Frame) -> Result<Cmninfo> {
    expect_id(frame, FrameId::Cmninfo)?;
    let data: &[u8; 3] = frame
        .payload
        .get(..3)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::TooShort { expected: 3, actual: frame.payload.len() })?;
    Ok(Cmninfo {
        chmax: data[0],
        flags: DeviceFlags::from_byte(data[1]),
        rxpadding: data[2],
    })
}

/// Decode a CHINFO reply frame into a channel record for `chan`.
///
/// The name is the payload remainder: bytes up to the first NUL, UTF-8.
///
/// # Errors
///
/// [`ProtocolError::UnexpectedId`], [`ProtocolError::TooShort`] (payload
/// under 5 bytes) or [`ProtocolError::InvalidUtf8`] for a bad name.
pub fn chinfo_decode(frame: &Frame, chan: u8) -> Result<DeviceChannel> {
    expect_id(frame, FrameId::Chinfo)?;
    let payload = &frame.payload;
    let fixed: &[u8; 5] = payload
        .get(..5)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::TooShort { expected: 5, actual: payload.len() })?;

    let raw_name = &payload[5..];
    let name_end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
    let name = core::str::from_utf8(&raw_name[..name_end])
        .map_err(|_| ProtocolError::InvalidUtf8("channel name"))?;

    Ok(DeviceChannel {
        chan,
        ctype: fixed[1],
        vdim: fixed[2],
        name: name.to_string(),
        en: fixed[0] != 0,
        div: fixed[3],
        mlen: fixed[4],
    })
}

/// Decoded ACK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Device return code; 0 means success
    pub retcode: i32,
}

impl Ack {
    /// True for a success return code.
    #[must_use]
    pub fn ok(self) -> bool {
        self.retcode == 0
    }
}

/// Decode an ACK reply frame.
///
/// # Errors
///
/// [`ProtocolError::UnexpectedId`] or [`ProtocolError::TooShort`].
pub fn ack_decode(frame: &Frame) -> Result<Ack> {
    expect_id(frame, FrameId::Ack)?;
    let data: &[u8; 4] = frame
        .payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::TooShort { expected: 4, actual: frame.payload.len() })?;
    Ok(Ack { retcode: i32::from_le_bytes(*data) })
}

fn expect_id(frame: &Frame, expected: FrameId) -> Result<()> {
    if frame.id != expected {
        return Err(ProtocolError::UnexpectedId { expected, actual: frame.id });
    }
    Ok(())
}

/// Decode a START request payload (device side).
///
/// # Errors
///
/// [`ProtocolError::TooShort`] on an empty payload.
pub fn start_decode(payload: &[u8]) -> Result<bool> {
    payload
        .first()
        .map(|&b| b != 0)
        .ok_or(ProtocolError::TooShort { expected: 1, actual: 0 })
}

/// Decode an ENABLE set-frame payload into the resulting per-channel
/// enable vector (device side). `current` is the device's present state,
/// used as the base for SINGLE updates.
///
/// # Errors
///
/// [`ProtocolError::InvalidSetFlags`], [`ProtocolError::TooShort`] or
/// [`ProtocolError::ChannelOutOfRange`].
pub fn enable_decode(payload: &[u8], current: &[bool], chmax: u8) -> Result<Vec<bool>> {
    set_decode(payload, current, chmax, |b| b != 0)
}

/// Decode a DIV set-frame payload into the resulting per-channel divider
/// vector (device side).
///
/// # Errors
///
/// [`ProtocolError::InvalidSetFlags`], [`ProtocolError::TooShort`] or
/// [`ProtocolError::ChannelOutOfRange`].
pub fn div_decode(payload: &[u8], current: &[u8], chmax: u8) -> Result<Vec<u8>> {
    set_decode(payload, current, chmax, |b| b)
}

fn set_decode<T: Copy>(
    payload: &[u8],
    current: &[T],
    chmax: u8,
    from_byte: impl Fn(u8) -> T,
) -> Result<Vec<T>> {
    debug_assert_eq!(current.len(), chmax as usize);

    let envelope: &[u8; 2] = payload
        .get(..2)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::TooShort { expected: 2, actual: payload.len() })?;
    let flags = SetFlags::from_u8(envelope[0])
        .filter(|f| *f != SetFlags::Invalid)
        .ok_or(ProtocolError::InvalidSetFlags(envelope[0]))?;
    let chan = envelope[1];

    let value_at = |idx: usize| {
        payload
            .get(idx)
            .copied()
            .ok_or(ProtocolError::TooShort { expected: idx + 1, actual: payload.len() })
    };

    match flags {
        SetFlags::Single => {
            if chan >= chmax {
                return Err(ProtocolError::ChannelOutOfRange { chan, chmax });
            }
            let mut out = current.to_vec();
            out[chan as usize] = from_byte(value_at(2)?);
            Ok(out)
        }
        SetFlags::All => {
            let value = from_byte(value_at(2)?);
            Ok(vec![value; chmax as usize])
        }
        SetFlags::Bulk => {
            let body = payload.get(2..2 + chmax as usize).ok_or(ProtocolError::TooShort {
                expected: 2 + chmax as usize,
                actual: payload.len(),
            })?;
            Ok(body.iter().map(|&b| from_byte(b)).collect())
        }
        SetFlags::Invalid => Err(ProtocolError::InvalidSetFlags(envelope[0])),
    }
}

/// Encode a CMNINFO reply frame (device side).
#[must_use]
pub fn cmninfo_reply(dev: &Device) -> Bytes {
    frame_write(FrameId::Cmninfo, &[dev.chmax, dev.flags.to_byte(), dev.rxpadding])
}

/// Encode a CHINFO reply frame (device side).
#[must_use]
pub fn chinfo_reply(ch: &DeviceChannel) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + ch.name.len());
    buf.put_u8(u8::from(ch.en));
    buf.put_u8(ch.dtype().to_u8());
    buf.put_u8(ch.vdim);
    buf.put_u8(ch.div);
    buf.put_u8(ch.mlen);
    buf.put_slice(ch.name.as_bytes());
    frame_write(FrameId::Chinfo, &buf)
}

/// Encode an ACK reply frame (device side).
#[must_use]
pub fn ack_reply(retcode: i32) -> Bytes {
    frame_write(FrameId::Ack, &retcode.to_le_bytes())
}
