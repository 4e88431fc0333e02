//! Wire format for the NxScope sample streaming protocol.
//!
//! NxScope devices publish timestamped, typed sample streams to a host
//! over byte-oriented transports (serial, RTT). This crate implements the
//! protocol's wire layer with no I/O and no threads:
//!
//! - [`frame`]: the serial frame envelope (SOF, LE16 length, id, payload,
//!   CRC-16/XMODEM footer)
//! - [`device`]: the device/channel model discovered during the handshake
//! - [`payloads`]: control request/reply codecs and the SINGLE/BULK/ALL
//!   set-frame envelope
//! - [`stream`]: multi-channel sample (de)serialization, including
//!   fixed-point scaling, per-sample metadata and host-registered user
//!   types
//!
//! The host-side client built on top of this crate lives in
//! `nxscope-client`; the loopback device used for testing lives in
//! `nxscope-harness`.

pub mod device;
pub mod errors;
pub mod frame;
pub mod payloads;
pub mod stream;

pub use device::{ChannelType, Device, DeviceChannel, DeviceFlags};
pub use errors::{ProtocolError, Result};
pub use frame::{FOOT_LEN, Frame, FrameHeader, FrameId, HDR_LEN, SOF, footer_validate, sof_find};
pub use payloads::{Ack, Cmninfo, SetFlags, SetRequest};
pub use stream::{
    ChannelSample, SampleData, SampleKind, StreamFlags, StreamPayload, StreamSample, UserType,
    UserTypeTable,
};
