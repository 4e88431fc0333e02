//! Fuzz target for the device-side set-frame decoders
//!
//! Exercises ENABLE/DIV payload decoding (SINGLE/BULK/ALL envelopes) with
//! arbitrary bytes against a range of channel counts.
//!
//! The fuzzer should NEVER panic. All invalid inputs must return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nxscope_proto::payloads::{div_decode, enable_decode, start_decode};

fuzz_target!(|data: &[u8]| {
    for chmax in [1u8, 4, 32, 255] {
        let en = vec![false; chmax as usize];
        let _ = enable_decode(data, &en, chmax);

        let div = vec![0u8; chmax as usize];
        let _ = div_decode(data, &div, chmax);
    }
    let _ = start_decode(data);
});
