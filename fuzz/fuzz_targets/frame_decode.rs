//! Fuzz target for Frame::decode
//!
//! Exercises frame decoding with arbitrary byte sequences to find:
//! - Parser crashes or panics
//! - Integer overflows in length handling
//! - Buffer over-reads past the declared frame length
//!
//! The fuzzer should NEVER panic. All invalid inputs must return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nxscope_proto::Frame;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must either decode to a frame or return an error,
    // never panic.
    let _ = Frame::decode(data);
});
