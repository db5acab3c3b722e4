//! Stream block request and response payloads.
//!
//! Request (device → cloud): `{"s":1,"f":<file>,"l":<block size>,"o":<block>,"n":1}`
//!
//! Response (cloud → device): `{"f":<file>,"i":<block>,"l":<len>,"p":"<base64>"}`

use std::borrow::Cow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::config::MAX_BLOCK_SIZE;
use crate::error::MalformedError;

/// Largest decoded block.
pub const BLOCK_CAPACITY: usize = MAX_BLOCK_SIZE as usize;

/// Client token echoed by the streaming service.  Unused by this side.
const CLIENT_TOKEN: u32 = 1;

#[derive(Serialize)]
struct BlockRequest {
    s: u32,
    f: u32,
    l: u32,
    o: u32,
    n: u32,
}

/// Ask for one block of `file_id`.
pub fn request_payload(file_id: u32, block_size: u32, block_index: u32) -> Vec<u8> {
    serde_json::to_vec(&BlockRequest {
        s: CLIENT_TOKEN,
        f: file_id,
        l: block_size,
        o: block_index,
        n: 1,
    })
    .unwrap_or_default()
}

#[derive(Deserialize)]
struct BlockResponse<'a> {
    f: u32,
    i: u32,
    l: u32,
    #[serde(borrow)]
    p: Cow<'a, str>,
}

/// One decoded block.
#[derive(Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub file_id: u32,
    pub index: u32,
    pub data: heapless::Vec<u8, BLOCK_CAPACITY>,
}

impl core::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataBlock")
            .field("file_id", &self.file_id)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

pub fn decode_block(payload: &[u8]) -> Result<DataBlock, MalformedError> {
    let msg: BlockResponse<'_> =
        serde_json::from_slice(payload).map_err(|_| MalformedError::InvalidJson)?;

    let mut buf = [0u8; BLOCK_CAPACITY];
    let n = STANDARD
        .decode_slice(msg.p.as_bytes(), &mut buf)
        .map_err(|_| MalformedError::InvalidValue("p"))?;
    if n != msg.l as usize {
        return Err(MalformedError::InvalidValue("l"));
    }
    let data = heapless::Vec::from_slice(&buf[..n]).map_err(|()| MalformedError::FieldTooLong("p"))?;

    Ok(DataBlock {
        file_id: msg.f,
        index: msg.i,
        data,
    })
}
