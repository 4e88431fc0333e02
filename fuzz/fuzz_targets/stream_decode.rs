//! Fuzz target for the stream sample decoder
//!
//! Feeds arbitrary payload bytes through stream decoding against a fixed
//! channel table covering scalars, fixed-point types, vectors, character
//! data, metadata and an undefined channel.
//!
//! The fuzzer should NEVER panic. All invalid inputs must return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nxscope_proto::{
    ChannelType, Device, DeviceChannel, DeviceFlags, UserTypeTable, stream::stream_decode,
};

fn fuzz_device() -> Device {
    let channels = vec![
        DeviceChannel::new(0, ChannelType::Float, 1, "f"),
        DeviceChannel::new(1, ChannelType::Double, 2, "d"),
        DeviceChannel::new(2, ChannelType::B8, 1, "fx"),
        DeviceChannel::new(3, ChannelType::Ub32, 1, "ufx"),
        DeviceChannel::new(4, ChannelType::Char, 16, "text"),
        DeviceChannel::with_mlen(5, ChannelType::Int8, 3, "vec", 1),
        DeviceChannel::with_mlen(6, ChannelType::None, 0, "meta", 7),
        DeviceChannel::new(7, ChannelType::Undef, 0, ""),
    ];
    Device::new(8, DeviceFlags::from_byte(0b11), 0, channels)
        .unwrap_or_else(|_| unreachable!("static channel table is valid"))
}

fuzz_target!(|data: &[u8]| {
    let dev = fuzz_device();
    let user = UserTypeTable::new();
    let _ = stream_decode(data, &dev, &user);
});
