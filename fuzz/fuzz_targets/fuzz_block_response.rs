//! Fuzz target: `ota::block::decode_block`
//!
//! Stream block responses arrive from the network.  Decoding must never
//! panic and never yield more than one block's worth of data.
//!
//! cargo fuzz run fuzz_block_response

#![no_main]

use fleetnode::ota::block::{BLOCK_CAPACITY, decode_block};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(block) = decode_block(data) {
        assert!(block.data.len() <= BLOCK_CAPACITY);
    }
});
