//! Stream sample codec.
//!
//! A STREAM payload is a flags byte followed by a sequence of samples:
//!
//! ```text
//! [flags: u8] ( [chan: u8] [data: vdim x width, LE] [meta: mlen bytes] )*
//! ```
//!
//! The per-channel data layout is driven by the channel's dtype through a
//! format table: integer and float scalars pass through, fixed-point types
//! are divided by their scale on decode (multiplied on encode), and CHAR
//! channels carry `vdim` bytes of UTF-8. Host-registered user types
//! (dtype 20..=31) describe their own field layout; for those, `vdim` is
//! the total byte size of one sample rather than an element count.
//!
//! Metadata is decoded by size: 0 = none, 1/2/4/8 = one little-endian
//! unsigned integer, anything else = one value per raw byte.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::device::{ChannelType, DTYPE_USER_FIRST, DTYPE_USER_LAST, Device};
use crate::errors::{ProtocolError, Result};

/// Flags byte of a STREAM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(u8);

impl StreamFlags {
    /// The device dropped samples since the previous stream frame.
    pub const OVERFLOW: u8 = 1 << 0;

    /// Wrap a raw flags byte.
    #[must_use]
    pub fn from_byte(flags: u8) -> Self {
        Self(flags)
    }

    /// Raw flags byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// True if the overflow bit is set.
    #[must_use]
    pub fn overflow(self) -> bool {
        self.0 & Self::OVERFLOW != 0
    }
}

/// Scalar wire encoding for one sample element, always little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // names are the wire widths
pub enum FieldCode {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl FieldCode {
    /// Encoded size in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Decode one element from exactly [`FieldCode::size`] bytes.
    fn decode(self, raw: &[u8]) -> f64 {
        debug_assert_eq!(raw.len(), self.size());
        let mut b = [0u8; 8];
        b[..raw.len()].copy_from_slice(raw);
        match self {
            Self::U8 => f64::from(raw[0]),
            Self::I8 => f64::from(raw[0] as i8),
            Self::U16 => f64::from(u16::from_le_bytes([raw[0], raw[1]])),
            Self::I16 => f64::from(i16::from_le_bytes([raw[0], raw[1]])),
            Self::U32 => f64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Self::I32 => f64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Self::U64 => u64::from_le_bytes(b) as f64,
            Self::I64 => i64::from_le_bytes(b) as f64,
            Self::F32 => f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Self::F64 => f64::from_le_bytes(b),
        }
    }

    /// Encode one element, rounding for the integer codes.
    fn encode(self, value: f64, buf: &mut BytesMut) {
        match self {
            Self::U8 => buf.put_u8(value.round() as u8),
            Self::I8 => buf.put_i8(value.round() as i8),
            Self::U16 => buf.put_u16_le(value.round() as u16),
            Self::I16 => buf.put_i16_le(value.round() as i16),
            Self::U32 => buf.put_u32_le(value.round() as u32),
            Self::I32 => buf.put_i32_le(value.round() as i32),
            Self::U64 => buf.put_u64_le(value.round() as u64),
            Self::I64 => buf.put_i64_le(value.round() as i64),
            Self::F32 => buf.put_f32_le(value as f32),
            Self::F64 => buf.put_f64_le(value),
        }
    }
}

/// Shape of a decoded sample value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// No data (metadata-only channels)
    None,
    /// Numeric vector
    Num,
    /// Character data
    Char,
    /// Mixed per-field values (user types)
    Complex,
}

/// One sub-value of a complex user-type sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComplexField {
    /// Numeric sub-value
    Num(f64),
    /// Character sub-value
    Char(char),
}

/// Decoded sample data.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    /// No data
    None,
    /// Numeric vector of `vdim` values
    Num(Vec<f64>),
    /// UTF-8 character data, stored verbatim (including any NUL padding)
    Chars(String),
    /// Per-field values of a complex user type
    Complex(Vec<ComplexField>),
}

impl SampleData {
    /// True if there is nothing to put on the wire.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Num(v) => v.is_empty(),
            Self::Chars(s) => s.is_empty(),
            Self::Complex(v) => v.is_empty(),
        }
    }
}

/// Host-registered decoder for one user dtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserType {
    /// Field layout, in wire order
    pub fields: Vec<FieldCode>,
    /// Shape of the decoded value
    pub kind: SampleKind,
    /// Per-field kinds, required when `kind` is [`SampleKind::Complex`]
    pub subkinds: Vec<SampleKind>,
}

impl UserType {
    /// Total wire size of one sample in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.fields.iter().map(|f| f.size()).sum()
    }
}

/// Registry of user-defined sample types for dtype 20..=31.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserTypeTable {
    map: BTreeMap<u8, UserType>,
}

impl UserTypeTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for `dtype`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidUserType`] when `dtype` is outside the user
    /// range, the layout is empty, or the complex sub-kind list does not
    /// line up with the field layout.
    pub fn register(&mut self, dtype: u8, def: UserType) -> Result<()> {
        if !(DTYPE_USER_FIRST..=DTYPE_USER_LAST).contains(&dtype) {
            return Err(ProtocolError::InvalidUserType {
                dtype,
                reason: "dtype outside the user range 20..=31",
            });
        }
        if def.fields.is_empty() {
            return Err(ProtocolError::InvalidUserType { dtype, reason: "empty field layout" });
        }
        match def.kind {
            SampleKind::Complex => {
                if def.subkinds.len() != def.fields.len() {
                    return Err(ProtocolError::InvalidUserType {
                        dtype,
                        reason: "complex type needs one sub-kind per field",
                    });
                }
                if def
                    .subkinds
                    .iter()
                    .any(|k| !matches!(k, SampleKind::Num | SampleKind::Char))
                {
                    return Err(ProtocolError::InvalidUserType {
                        dtype,
                        reason: "complex sub-kinds must be Num or Char",
                    });
                }
            }
            _ => {
                if !def.subkinds.is_empty() {
                    return Err(ProtocolError::InvalidUserType {
                        dtype,
                        reason: "sub-kinds are only valid for complex types",
                    });
                }
            }
        }
        self.map.insert(dtype, def);
        Ok(())
    }

    /// Registered decoder for `dtype`, if any.
    #[must_use]
    pub fn get(&self, dtype: u8) -> Option<&UserType> {
        self.map.get(&dtype)
    }
}

/// Per-dtype wire layout.
enum FormatSpec<'a> {
    /// No data bytes
    None,
    /// `vdim` elements of `code`, each divided by `scale` on decode
    Scalar { code: FieldCode, scale: f64 },
    /// `vdim` bytes of UTF-8
    Text,
    /// User-registered layout
    User(&'a UserType),
}

fn format_for<'a>(dtype: ChannelType, user: &'a UserTypeTable) -> Result<FormatSpec<'a>> {
    let scalar = |code, scale| Ok(FormatSpec::Scalar { code, scale });
    match dtype {
        ChannelType::Undef => Err(ProtocolError::UnknownSampleType(dtype.to_u8())),
        ChannelType::None => Ok(FormatSpec::None),
        ChannelType::Uint8 => scalar(FieldCode::U8, 1.0),
        ChannelType::Int8 => scalar(FieldCode::I8, 1.0),
        ChannelType::Uint16 => scalar(FieldCode::U16, 1.0),
        ChannelType::Int16 => scalar(FieldCode::I16, 1.0),
        ChannelType::Uint32 => scalar(FieldCode::U32, 1.0),
        ChannelType::Int32 => scalar(FieldCode::I32, 1.0),
        ChannelType::Uint64 => scalar(FieldCode::U64, 1.0),
        ChannelType::Int64 => scalar(FieldCode::I64, 1.0),
        ChannelType::Float => scalar(FieldCode::F32, 1.0),
        ChannelType::Double => scalar(FieldCode::F64, 1.0),
        ChannelType::Ub8 => scalar(FieldCode::U16, 256.0),
        ChannelType::B8 => scalar(FieldCode::I16, 256.0),
        ChannelType::Ub16 => scalar(FieldCode::U32, 65536.0),
        ChannelType::B16 => scalar(FieldCode::I32, 65536.0),
        ChannelType::Ub32 => scalar(FieldCode::U64, 4294967296.0),
        ChannelType::B32 => scalar(FieldCode::I64, 4294967296.0),
        ChannelType::Char | ChannelType::Wchar => Ok(FormatSpec::Text),
        _ => user
            .get(dtype.to_u8())
            .map(FormatSpec::User)
            .ok_or(ProtocolError::UnknownSampleType(dtype.to_u8())),
    }
}

/// One decoded stream sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSample {
    /// Channel id
    pub chan: u8,
    /// Shape of `data`
    pub kind: SampleKind,
    /// Channel vector dimension
    pub vdim: u8,
    /// Channel metadata length
    pub mlen: u8,
    /// Decoded data
    pub data: SampleData,
    /// Decoded metadata values
    pub meta: Vec<u64>,
}

/// A fully decoded STREAM payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPayload {
    /// Stream flags byte
    pub flags: StreamFlags,
    /// Samples in arrival order
    pub samples: Vec<StreamSample>,
}

/// Sample to be encoded into a STREAM payload (device side).
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSample {
    /// Channel id
    pub chan: u8,
    /// Sample data matching the channel format
    pub data: SampleData,
    /// Metadata values matching the channel `mlen`
    pub meta: Vec<u64>,
}

fn slice_at(payload: &[u8], pos: usize, len: usize) -> Result<&[u8]> {
    payload
        .get(pos..pos + len)
        .ok_or(ProtocolError::TooShort { expected: pos + len, actual: payload.len() })
}

/// Decode a STREAM payload against the device's channel table.
///
/// # Errors
///
/// Any structural inconsistency (unknown channel, data running past the
/// payload end, unregistered user dtype, invalid UTF-8 in character data)
/// fails the whole payload; the caller drops the frame.
pub fn stream_decode(
    payload: &[u8],
    dev: &Device,
    user: &UserTypeTable,
) -> Result<StreamPayload> {
    let first = payload
        .first()
        .ok_or(ProtocolError::TooShort { expected: 1, actual: 0 })?;
    let flags = StreamFlags::from_byte(*first);

    let mut samples = Vec::new();
    let mut pos = 1;
    while pos < payload.len() {
        let chan = payload[pos];
        pos += 1;

        let ch = dev.channel(chan).ok_or(ProtocolError::UnknownChannel(chan))?;
        let spec = format_for(ch.dtype(), user)?;
        let vdim = ch.vdim as usize;

        let (kind, data, dlen) = match spec {
            FormatSpec::None => (SampleKind::None, SampleData::None, 0),
            FormatSpec::Scalar { code, scale } => {
                let dlen = code.size() * vdim;
                let raw = slice_at(payload, pos, dlen)?;
                let vals = raw
                    .chunks_exact(code.size())
                    .map(|c| code.decode(c) / scale)
                    .collect();
                (SampleKind::Num, SampleData::Num(vals), dlen)
            }
            FormatSpec::Text => {
                let raw = slice_at(payload, pos, vdim)?;
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8("sample data"))?;
                (SampleKind::Char, SampleData::Chars(text), vdim)
            }
            FormatSpec::User(def) => {
                let dlen = def.size();
                if dlen != vdim {
                    return Err(ProtocolError::InvalidUserType {
                        dtype: ch.dtype().to_u8(),
                        reason: "layout size must equal the channel vdim",
                    });
                }
                let raw = slice_at(payload, pos, dlen)?;
                (user_kind(def), user_decode(def, raw)?, dlen)
            }
        };
        pos += dlen;

        let mlen = ch.mlen as usize;
        let meta = meta_decode(slice_at(payload, pos, mlen)?);
        pos += mlen;

        samples.push(StreamSample { chan, kind, vdim: ch.vdim, mlen: ch.mlen, data, meta });
    }

    Ok(StreamPayload { flags, samples })
}

fn user_kind(def: &UserType) -> SampleKind {
    def.kind
}

fn user_decode(def: &UserType, raw: &[u8]) -> Result<SampleData> {
    let mut fields = Vec::with_capacity(def.fields.len());
    let mut off = 0;
    for code in &def.fields {
        fields.push(code.decode(&raw[off..off + code.size()]));
        off += code.size();
    }

    Ok(match def.kind {
        SampleKind::None => SampleData::None,
        SampleKind::Num => SampleData::Num(fields),
        SampleKind::Char => SampleData::Chars(
            String::from_utf8(raw.to_vec())
                .map_err(|_| ProtocolError::InvalidUtf8("user sample data"))?,
        ),
        SampleKind::Complex => SampleData::Complex(
            fields
                .iter()
                .zip(&def.subkinds)
                .map(|(&val, sub)| match sub {
                    SampleKind::Char => ComplexField::Char(
                        char::from_u32(val as u32).unwrap_or(char::REPLACEMENT_CHARACTER),
                    ),
                    _ => ComplexField::Num(val),
                })
                .collect(),
        ),
    })
}

/// Decode a metadata blob by its length.
#[must_use]
pub fn meta_decode(raw: &[u8]) -> Vec<u64> {
    match raw.len() {
        0 => Vec::new(),
        1 => vec![u64::from(raw[0])],
        2 => vec![u64::from(u16::from_le_bytes([raw[0], raw[1]]))],
        4 => vec![u64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))],
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(raw);
            vec![u64::from_le_bytes(b)]
        }
        _ => raw.iter().map(|&b| u64::from(b)).collect(),
    }
}

fn meta_encode(mlen: u8, meta: &[u64], buf: &mut BytesMut) -> Result<()> {
    let arity = match mlen {
        0 => 0,
        1 | 2 | 4 | 8 => 1,
        n => n as usize,
    };
    if meta.len() != arity {
        return Err(ProtocolError::MetaMismatch { mlen, values: meta.len() });
    }
    match mlen {
        0 => {}
        1 => buf.put_u8(meta[0] as u8),
        2 => buf.put_u16_le(meta[0] as u16),
        4 => buf.put_u32_le(meta[0] as u32),
        8 => buf.put_u64_le(meta[0]),
        _ => {
            for &val in meta {
                buf.put_u8(val as u8);
            }
        }
    }
    Ok(())
}

fn text_encode(text: &str, size: usize, buf: &mut BytesMut) {
    let bytes = text.as_bytes();
    let take = bytes.len().min(size);
    buf.put_slice(&bytes[..take]);
    // zero-pad up to the fixed channel width
    for _ in take..size {
        buf.put_u8(0);
    }
}

/// Encode a STREAM payload from generated samples (device side).
///
/// Samples with neither data nor metadata are skipped; if nothing remains
/// the function returns `Ok(None)` and no frame should be sent.
///
/// # Errors
///
/// [`ProtocolError::SampleMismatch`] when a sample's data shape does not
/// match its channel format, plus the registration errors of user types.
pub fn stream_encode(
    flags: StreamFlags,
    samples: &[ChannelSample],
    dev: &Device,
    user: &UserTypeTable,
) -> Result<Option<Bytes>> {
    let mut buf = BytesMut::new();
    buf.put_u8(flags.to_byte());

    let mut cntr = 0usize;
    for sample in samples {
        if sample.data.is_empty() && sample.meta.is_empty() {
            continue;
        }
        cntr += 1;

        let ch = dev
            .channel(sample.chan)
            .ok_or(ProtocolError::UnknownChannel(sample.chan))?;
        let spec = format_for(ch.dtype(), user)?;

        buf.put_u8(sample.chan);
        match (spec, &sample.data) {
            (FormatSpec::None, SampleData::None) => {}
            (FormatSpec::Scalar { code, scale }, SampleData::Num(vals)) => {
                if vals.len() != ch.vdim as usize {
                    return Err(ProtocolError::SampleMismatch(sample.chan));
                }
                for &val in vals {
                    code.encode(val * scale, &mut buf);
                }
            }
            (FormatSpec::Text, SampleData::Chars(text)) => {
                text_encode(text, ch.vdim as usize, &mut buf);
            }
            (FormatSpec::User(def), data) => {
                user_encode(def, data, sample.chan, &mut buf)?;
            }
            _ => return Err(ProtocolError::SampleMismatch(sample.chan)),
        }

        meta_encode(ch.mlen, &sample.meta, &mut buf)?;
    }

    if cntr == 0 {
        return Ok(None);
    }
    Ok(Some(buf.freeze()))
}

fn user_encode(
    def: &UserType,
    data: &SampleData,
    chan: u8,
    buf: &mut BytesMut,
) -> Result<()> {
    match (def.kind, data) {
        (SampleKind::None, SampleData::None) => {
            for _ in 0..def.size() {
                buf.put_u8(0);
            }
        }
        (SampleKind::Num, SampleData::Num(vals)) => {
            if vals.len() != def.fields.len() {
                return Err(ProtocolError::SampleMismatch(chan));
            }
            for (code, &val) in def.fields.iter().zip(vals) {
                code.encode(val, buf);
            }
        }
        (SampleKind::Char, SampleData::Chars(text)) => {
            text_encode(text, def.size(), buf);
        }
        (SampleKind::Complex, SampleData::Complex(vals)) => {
            if vals.len() != def.fields.len() {
                return Err(ProtocolError::SampleMismatch(chan));
            }
            for (code, field) in def.fields.iter().zip(vals) {
                match field {
                    ComplexField::Num(val) => code.encode(*val, buf),
                    ComplexField::Char(c) => code.encode(f64::from(u32::from(*c)), buf),
                }
            }
        }
        _ => return Err(ProtocolError::SampleMismatch(chan)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceChannel, DeviceFlags};

    fn test_device() -> Device {
        let channels = vec![
            DeviceChannel::new(0, ChannelType::Float, 1, "ch0"),
            DeviceChannel::new(1, ChannelType::Float, 1, "ch1"),
            DeviceChannel::new(2, ChannelType::B8, 1, "fx"),
            DeviceChannel::new(3, ChannelType::Char, 8, "text"),
            DeviceChannel::with_mlen(4, ChannelType::Int8, 3, "vec", 1),
            DeviceChannel::with_mlen(5, ChannelType::None, 0, "meta", 16),
        ];
        Device::new(6, DeviceFlags::from_byte(0b11), 0, channels).unwrap()
    }

    #[test]
    fn decode_single_float_sample() {
        // flags=0, chan=1, 1.0f32 little-endian
        let payload = [0x00, 0x01, 0x00, 0x00, 0x80, 0x3F];
        let out = stream_decode(&payload, &test_device(), &UserTypeTable::new()).unwrap();

        assert!(!out.flags.overflow());
        assert_eq!(out.samples.len(), 1);
        let s = &out.samples[0];
        assert_eq!(s.chan, 1);
        assert_eq!(s.kind, SampleKind::Num);
        assert_eq!(s.data, SampleData::Num(vec![1.0]));
        assert!(s.meta.is_empty());
    }

    #[test]
    fn decode_applies_fixed_point_scale() {
        // b8 is i16 / 256; 0x0180 = 384 -> 1.5
        let payload = [0x00, 0x02, 0x80, 0x01];
        let out = stream_decode(&payload, &test_device(), &UserTypeTable::new()).unwrap();
        assert_eq!(out.samples[0].data, SampleData::Num(vec![1.5]));
    }

    #[test]
    fn decode_char_channel_keeps_padding() {
        let mut payload = vec![0x00, 0x03];
        payload.extend_from_slice(b"hi\0\0\0\0\0\0");
        let out = stream_decode(&payload, &test_device(), &UserTypeTable::new()).unwrap();
        assert_eq!(out.samples[0].data, SampleData::Chars("hi\0\0\0\0\0\0".to_string()));
    }

    #[test]
    fn decode_vector_with_metadata() {
        let payload = [0x00, 0x04, 0x01, 0x00, 0xFF, 0x2A];
        let out = stream_decode(&payload, &test_device(), &UserTypeTable::new()).unwrap();
        let s = &out.samples[0];
        assert_eq!(s.data, SampleData::Num(vec![1.0, 0.0, -1.0]));
        assert_eq!(s.meta, vec![42]);
    }

    #[test]
    fn decode_meta_only_channel() {
        let mut payload = vec![0x00, 0x05];
        payload.extend_from_slice(b"hello\0\0\0\0\0\0\0\0\0\0\0");
        let out = stream_decode(&payload, &test_device(), &UserTypeTable::new()).unwrap();
        let s = &out.samples[0];
        assert_eq!(s.data, SampleData::None);
        assert_eq!(s.meta.len(), 16);
        assert_eq!(s.meta[0], u64::from(b'h'));
    }

    #[test]
    fn decode_past_end_is_an_error() {
        // float channel claims 4 data bytes but only 2 are present
        let payload = [0x00, 0x01, 0x00, 0x00];
        let result = stream_decode(&payload, &test_device(), &UserTypeTable::new());
        assert!(matches!(result, Err(ProtocolError::TooShort { .. })));
    }

    #[test]
    fn decode_unknown_channel_is_an_error() {
        let payload = [0x00, 0x77, 0x00];
        let result = stream_decode(&payload, &test_device(), &UserTypeTable::new());
        assert_eq!(result, Err(ProtocolError::UnknownChannel(0x77)));
    }

    #[test]
    fn overflow_flag_with_empty_payload() {
        let out = stream_decode(&[0x01], &test_device(), &UserTypeTable::new()).unwrap();
        assert!(out.flags.overflow());
        assert!(out.samples.is_empty());
    }

    #[test]
    fn meta_format_by_size() {
        assert_eq!(meta_decode(&[]), Vec::<u64>::new());
        assert_eq!(meta_decode(&[7]), vec![7]);
        assert_eq!(meta_decode(&[0x34, 0x12]), vec![0x1234]);
        assert_eq!(meta_decode(&[0x78, 0x56, 0x34, 0x12]), vec![0x1234_5678]);
        assert_eq!(meta_decode(&[1, 0, 0, 0, 0, 0, 0, 0]), vec![1]);
        assert_eq!(meta_decode(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let dev = test_device();
        let user = UserTypeTable::new();
        let samples = vec![
            ChannelSample { chan: 0, data: SampleData::Num(vec![0.5]), meta: vec![] },
            ChannelSample {
                chan: 4,
                data: SampleData::Num(vec![1.0, 0.0, -1.0]),
                meta: vec![9],
            },
        ];

        let payload = stream_encode(StreamFlags::default(), &samples, &dev, &user)
            .unwrap()
            .unwrap();
        let out = stream_decode(&payload, &dev, &user).unwrap();

        assert_eq!(out.samples.len(), 2);
        assert_eq!(out.samples[0].data, SampleData::Num(vec![0.5]));
        assert_eq!(out.samples[1].data, SampleData::Num(vec![1.0, 0.0, -1.0]));
        assert_eq!(out.samples[1].meta, vec![9]);
    }

    #[test]
    fn encode_skips_empty_samples() {
        let dev = test_device();
        let samples =
            vec![ChannelSample { chan: 0, data: SampleData::None, meta: vec![] }];
        let out =
            stream_encode(StreamFlags::default(), &samples, &dev, &UserTypeTable::new()).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn user_type_round_trip() {
        let mut user = UserTypeTable::new();
        user.register(
            20,
            UserType {
                fields: vec![FieldCode::I16, FieldCode::U8],
                kind: SampleKind::Num,
                subkinds: vec![],
            },
        )
        .unwrap();

        // user sample layout is 3 bytes, so the channel reports vdim = 3
        let channels = vec![DeviceChannel::new(0, ChannelType::User1, 3, "usr")];
        let dev = Device::new(1, DeviceFlags::default(), 0, channels).unwrap();

        let samples = vec![ChannelSample {
            chan: 0,
            data: SampleData::Num(vec![-2.0, 7.0]),
            meta: vec![],
        }];
        let payload = stream_encode(StreamFlags::default(), &samples, &dev, &user)
            .unwrap()
            .unwrap();
        let out = stream_decode(&payload, &dev, &user).unwrap();
        assert_eq!(out.samples[0].data, SampleData::Num(vec![-2.0, 7.0]));
    }

    #[test]
    fn user_type_vdim_mismatch_is_an_error() {
        let mut user = UserTypeTable::new();
        user.register(
            20,
            UserType { fields: vec![FieldCode::U32], kind: SampleKind::Num, subkinds: vec![] },
        )
        .unwrap();

        // channel vdim says 2 bytes but the layout is 4 bytes wide
        let channels = vec![DeviceChannel::new(0, ChannelType::User1, 2, "usr")];
        let dev = Device::new(1, DeviceFlags::default(), 0, channels).unwrap();

        let result = stream_decode(&[0x00, 0x00, 1, 2, 3, 4], &dev, &user);
        assert!(matches!(result, Err(ProtocolError::InvalidUserType { .. })));
    }

    #[test]
    fn user_table_rejects_bad_registrations() {
        let mut user = UserTypeTable::new();

        let out_of_range = user.register(
            5,
            UserType { fields: vec![FieldCode::U8], kind: SampleKind::Num, subkinds: vec![] },
        );
        assert!(out_of_range.is_err());

        let bad_complex = user.register(
            20,
            UserType {
                fields: vec![FieldCode::U8, FieldCode::U8],
                kind: SampleKind::Complex,
                subkinds: vec![SampleKind::Num],
            },
        );
        assert!(bad_complex.is_err());
    }

    #[test]
    fn complex_user_type_decodes_mixed_fields() {
        let mut user = UserTypeTable::new();
        user.register(
            21,
            UserType {
                fields: vec![FieldCode::I16, FieldCode::U8],
                kind: SampleKind::Complex,
                subkinds: vec![SampleKind::Num, SampleKind::Char],
            },
        )
        .unwrap();

        let channels = vec![DeviceChannel::new(0, ChannelType::User2, 3, "cpx")];
        let dev = Device::new(1, DeviceFlags::default(), 0, channels).unwrap();

        // -1 as i16 LE, then 'x'
        let payload = [0x00, 0x00, 0xFF, 0xFF, b'x'];
        let out = stream_decode(&payload, &dev, &user).unwrap();
        assert_eq!(
            out.samples[0].data,
            SampleData::Complex(vec![ComplexField::Num(-1.0), ComplexField::Char('x')])
        );
    }
}
