//! Firmware job manifest.
//!
//! ```json
//! {"afr_ota":{"streamname":"AFR_OTA-…","files":[
//!     {"filepath":"firmware.patch","filesize":1104808,"fileid":0}]}}
//! ```
//!
//! Only the first file entry is downloaded.

use serde_json::Value;

use crate::error::MalformedError;
use crate::jobs::dispatcher::FIRMWARE_MANIFEST_KEY;

/// Longest stream name the block topics can carry.
pub const STREAM_NAME_CAPACITY: usize = 128;
pub const FILE_PATH_CAPACITY: usize = 128;

const PATCH_SUFFIX: &str = ".patch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifest {
    pub stream: heapless::String<STREAM_NAME_CAPACITY>,
    pub file_id: u32,
    pub file_size: u32,
    pub file_path: heapless::String<FILE_PATH_CAPACITY>,
}

impl FileManifest {
    /// Delta patches are named `*.patch`; everything else is a full image.
    pub fn is_patch(&self) -> bool {
        self.file_path.ends_with(PATCH_SUFFIX)
    }
}

fn bounded<const N: usize>(
    s: &str,
    field: &'static str,
) -> Result<heapless::String<N>, MalformedError> {
    let mut out = heapless::String::new();
    out.push_str(s)
        .map_err(|()| MalformedError::FieldTooLong(field))?;
    Ok(out)
}

fn u32_field(obj: &Value, field: &'static str) -> Result<u32, MalformedError> {
    let raw = obj
        .get(field)
        .ok_or(MalformedError::MissingField(field))?
        .as_u64()
        .ok_or(MalformedError::InvalidValue(field))?;
    u32::try_from(raw).map_err(|_| MalformedError::InvalidValue(field))
}

pub fn parse_manifest(document: &[u8]) -> Result<FileManifest, MalformedError> {
    let root: Value = serde_json::from_slice(document).map_err(|_| MalformedError::InvalidJson)?;
    let ota = root
        .get(FIRMWARE_MANIFEST_KEY)
        .ok_or(MalformedError::MissingField(FIRMWARE_MANIFEST_KEY))?;

    let stream = ota
        .get("streamname")
        .and_then(Value::as_str)
        .ok_or(MalformedError::MissingField("streamname"))?;
    if stream.is_empty() || stream.contains(['+', '#', '/']) {
        return Err(MalformedError::InvalidValue("streamname"));
    }

    let file = ota
        .get("files")
        .and_then(Value::as_array)
        .and_then(|files| files.first())
        .ok_or(MalformedError::MissingField("files"))?;

    let file_size = u32_field(file, "filesize")?;
    if file_size == 0 {
        return Err(MalformedError::InvalidValue("filesize"));
    }
    let file_path = match file.get("filepath") {
        None => "",
        Some(v) => v.as_str().ok_or(MalformedError::InvalidValue("filepath"))?,
    };

    Ok(FileManifest {
        stream: bounded(stream, "streamname")?,
        file_id: u32_field(file, "fileid")?,
        file_size,
        file_path: bounded(file_path, "filepath")?,
    })
}
