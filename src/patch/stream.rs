//! Seekable byte streams the patch engine reads and writes through.
//!
//! The engine never touches storage directly; it only sees
//! [`PatchStream`].  [`MemoryStream`] backs tests and tooling,
//! [`RegionStream`] backs the device, with one stream per flash region.

use core::cell::RefCell;
use std::io::SeekFrom;

use super::PatchError;
use crate::app::ports::{ImageStore, Region};

pub trait PatchStream {
    /// Move the cursor.  Positions past the end of the stream are refused.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, PatchError>;

    /// Read into `buf`, short at the end of the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PatchError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, PatchError>;

    fn tell(&self) -> u64;
}

/// Resolve `pos` against `current` and `size`, refusing anything outside
/// `0..=size`.
fn resolve(pos: SeekFrom, current: u64, size: u64) -> Result<u64, PatchError> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(d) => current.checked_add_signed(d),
        SeekFrom::End(d) => size.checked_add_signed(d),
    };
    match target {
        Some(t) if t <= size => Ok(t),
        _ => Err(PatchError::Seek),
    }
}

// ── In-memory ─────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    pos: u64,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl PatchStream for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, PatchError> {
        self.pos = resolve(pos, self.pos, self.data.len() as u64)?;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PatchError> {
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, PatchError> {
        let start = self.pos as usize;
        let end = start + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn tell(&self) -> u64 {
        self.pos
    }
}

// ── Flash region ──────────────────────────────────────────────

/// One region of an [`ImageStore`], several of which may be open at once
/// over the same store.
pub struct RegionStream<'a, 's> {
    store: &'a RefCell<&'s mut dyn ImageStore>,
    region: Region,
    pos: u64,
    size: u64,
}

impl<'a, 's> RegionStream<'a, 's> {
    /// `size` is the readable length: the region capacity for the running
    /// image, the received byte count for a patch, zero for a fresh target.
    pub fn new(store: &'a RefCell<&'s mut dyn ImageStore>, region: Region, size: u64) -> Self {
        Self {
            store,
            region,
            pos: 0,
            size,
        }
    }
}

impl PatchStream for RegionStream<'_, '_> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, PatchError> {
        self.pos = resolve(pos, self.pos, self.size)?;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PatchError> {
        let remaining = self.size.saturating_sub(self.pos);
        let want = buf.len().min(remaining as usize);
        if want == 0 {
            return Ok(0);
        }
        let offset = u32::try_from(self.pos).map_err(|_| PatchError::Io)?;
        let n = self
            .store
            .borrow()
            .read_at(self.region, offset, &mut buf[..want])
            .map_err(|_| PatchError::Io)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, PatchError> {
        let offset = u32::try_from(self.pos).map_err(|_| PatchError::Io)?;
        self.store
            .borrow_mut()
            .write_at(self.region, offset, buf)
            .map_err(|_| PatchError::Io)?;
        self.pos += buf.len() as u64;
        self.size = self.size.max(self.pos);
        Ok(buf.len())
    }

    fn tell(&self) -> u64 {
        self.pos
    }
}
