//! Device and channel model.
//!
//! A [`Device`] record is discovered once during the connect handshake
//! (cmninfo + one chinfo per channel) and is immutable afterwards, except
//! for the per-channel `en`/`div` runtime fields which the client's channel
//! state component writes back after a confirmed configuration commit.

use crate::errors::{ProtocolError, Result};

/// Sample data type carried in the low 5 bits of the channel type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)] // variant names mirror the wire-level taxonomy
pub enum ChannelType {
    Undef = 0,
    None = 1,
    Uint8 = 2,
    Int8 = 3,
    Uint16 = 4,
    Int16 = 5,
    Uint32 = 6,
    Int32 = 7,
    Uint64 = 8,
    Int64 = 9,
    Float = 10,
    Double = 11,
    Ub8 = 12,
    B8 = 13,
    Ub16 = 14,
    B16 = 15,
    Ub32 = 16,
    B32 = 17,
    Char = 18,
    Wchar = 19,
    User1 = 20,
    User2 = 21,
    User3 = 22,
    User4 = 23,
    User5 = 24,
    User6 = 25,
    User7 = 26,
    User8 = 27,
    User9 = 28,
    User10 = 29,
    User11 = 30,
    User12 = 31,
}

/// First dtype value reserved for host-registered user types.
pub const DTYPE_USER_FIRST: u8 = 20;

/// Last dtype value reserved for host-registered user types.
pub const DTYPE_USER_LAST: u8 = 31;

impl ChannelType {
    /// Decode a 5-bit dtype value. Total for `0..=31`.
    #[must_use]
    pub fn from_u8(dtype: u8) -> Option<Self> {
        match dtype {
            0 => Some(Self::Undef),
            1 => Some(Self::None),
            2 => Some(Self::Uint8),
            3 => Some(Self::Int8),
            4 => Some(Self::Uint16),
            5 => Some(Self::Int16),
            6 => Some(Self::Uint32),
            7 => Some(Self::Int32),
            8 => Some(Self::Uint64),
            9 => Some(Self::Int64),
            10 => Some(Self::Float),
            11 => Some(Self::Double),
            12 => Some(Self::Ub8),
            13 => Some(Self::B8),
            14 => Some(Self::Ub16),
            15 => Some(Self::B16),
            16 => Some(Self::Ub32),
            17 => Some(Self::B32),
            18 => Some(Self::Char),
            19 => Some(Self::Wchar),
            20 => Some(Self::User1),
            21 => Some(Self::User2),
            22 => Some(Self::User3),
            23 => Some(Self::User4),
            24 => Some(Self::User5),
            25 => Some(Self::User6),
            26 => Some(Self::User7),
            27 => Some(Self::User8),
            28 => Some(Self::User9),
            29 => Some(Self::User10),
            30 => Some(Self::User11),
            31 => Some(Self::User12),
            _ => None,
        }
    }

    /// Numeric dtype value.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// True for dtype values in the user-defined range.
    #[must_use]
    pub fn is_user(self) -> bool {
        (DTYPE_USER_FIRST..=DTYPE_USER_LAST).contains(&self.to_u8())
    }
}

/// Device capability flags from the cmninfo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFlags(u8);

impl DeviceFlags {
    /// The device honours per-channel sample dividers.
    pub const DIVIDER_SUPPORT: u8 = 1 << 0;

    /// The device acknowledges configuration frames with an ACK.
    pub const ACK_SUPPORT: u8 = 1 << 1;

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

    /// True if the device supports sample dividers.
    #[must_use]
    pub fn div_supported(self) -> bool {
        self.0 & Self::DIVIDER_SUPPORT != 0
    }

    /// True if the device acknowledges configuration frames.
    #[must_use]
    pub fn ack_supported(self) -> bool {
        self.0 & Self::ACK_SUPPORT != 0
    }
}

/// Metadata and runtime state for one device channel.
///
/// `chan`, `ctype`, `vdim`, `mlen` and `name` are fixed at discovery;
/// `en` and `div` mirror the device-confirmed runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChannel {
    /// Channel id, unique per device
    pub chan: u8,
    /// Raw type byte: low 5 bits dtype, bit 7 critical, bits 5-6 reserved
    pub ctype: u8,
    /// Vector dimension: values per sample (0 = none)
    pub vdim: u8,
    /// Channel name (may be empty)
    pub name: String,
    /// Enabled state last confirmed by the device
    pub en: bool,
    /// Sample divider last confirmed by the device (0 = every sample)
    pub div: u8,
    /// Per-sample metadata length in bytes
    pub mlen: u8,
}

impl DeviceChannel {
    /// Create a channel record with disabled/zero runtime state.
    #[must_use]
    pub fn new(chan: u8, ctype: ChannelType, vdim: u8, name: &str) -> Self {
        Self {
            chan,
            ctype: ctype.to_u8(),
            vdim,
            name: name.to_string(),
            en: false,
            div: 0,
            mlen: 0,
        }
    }

    /// Same as [`DeviceChannel::new`] with a metadata length.
    #[must_use]
    pub fn with_mlen(chan: u8, ctype: ChannelType, vdim: u8, name: &str, mlen: u8) -> Self {
        Self { mlen, ..Self::new(chan, ctype, vdim, name) }
    }

    /// Sample data type (low 5 bits of the type byte).
    #[must_use]
    pub fn dtype(&self) -> ChannelType {
        // from_u8 is total over the masked 5-bit range
        ChannelType::from_u8(self.ctype & 0x1F).unwrap_or(ChannelType::Undef)
    }

    /// Critical-channel marker (bit 7 of the type byte).
    #[must_use]
    pub fn critical(&self) -> bool {
        self.ctype & 0x80 != 0
    }

    /// Reserved type bits 5-6, kept verbatim.
    #[must_use]
    pub fn type_res(&self) -> u8 {
        self.ctype & 0x60
    }

    /// True unless the dtype is `Undef`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.dtype() != ChannelType::Undef
    }

    /// True for channels carrying numeric sample data.
    #[must_use]
    pub fn is_numerical(&self) -> bool {
        !matches!(
            self.dtype(),
            ChannelType::Undef | ChannelType::None | ChannelType::Char | ChannelType::Wchar
        )
    }
}

/// Device record assembled from the connect handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Number of channels
    pub chmax: u8,
    /// Capability flags
    pub flags: DeviceFlags,
    /// Required write-side alignment in bytes (0 = none)
    pub rxpadding: u8,
    channels: Vec<DeviceChannel>,
}

impl Device {
    /// Assemble a device record.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ChannelOutOfRange`] if the channel count does not
    /// match `chmax` or channel ids are not unique.
    pub fn new(
        chmax: u8,
        flags: DeviceFlags,
        rxpadding: u8,
        channels: Vec<DeviceChannel>,
    ) -> Result<Self> {
        if channels.len() != chmax as usize {
            return Err(ProtocolError::ChannelOutOfRange {
                chan: channels.len().min(u8::MAX as usize) as u8,
                chmax,
            });
        }
        for (i, ch) in channels.iter().enumerate() {
            if channels[..i].iter().any(|other| other.chan == ch.chan) {
                return Err(ProtocolError::ChannelOutOfRange { chan: ch.chan, chmax });
            }
        }
        Ok(Self { chmax, flags, rxpadding, channels })
    }

    /// All channel records in id order.
    #[must_use]
    pub fn channels(&self) -> &[DeviceChannel] {
        &self.channels
    }

    /// Channel record by id. `None` for out-of-range ids.
    #[must_use]
    pub fn channel(&self, chan: u8) -> Option<&DeviceChannel> {
        self.channels.iter().find(|ch| ch.chan == chan)
    }

    /// Enabled state of every channel, in id order.
    #[must_use]
    pub fn channels_en(&self) -> Vec<bool> {
        self.channels.iter().map(|ch| ch.en).collect()
    }

    /// Divider of every channel, in id order.
    #[must_use]
    pub fn channels_div(&self) -> Vec<u8> {
        self.channels.iter().map(|ch| ch.div).collect()
    }

    /// Write back device-confirmed enable state for every channel.
    pub fn update_en(&mut self, en: &[bool]) {
        debug_assert_eq!(en.len(), self.channels.len());
        for (ch, &val) in self.channels.iter_mut().zip(en) {
            ch.en = val;
        }
    }

    /// Write back device-confirmed dividers for every channel.
    pub fn update_div(&mut self, div: &[u8]) {
        debug_assert_eq!(div.len(), self.channels.len());
        for (ch, &val) in self.channels.iter_mut().zip(div) {
            ch.div = val;
        }
    }
}
