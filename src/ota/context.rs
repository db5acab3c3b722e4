//! Download bookkeeping for the one firmware job in flight.
//!
//! Blocks are written at `index * block_size`, so arrival order does not
//! matter.  A per-block bitmap makes redelivery harmless: a block already
//! recorded is reported as [`BlockCheck::Duplicate`] and never rewritten
//! or counted twice.

use crate::app::ports::Region;
use crate::error::IntegrityError;
use crate::events::JOB_ID_CAPACITY;

use super::manifest::{FileManifest, STREAM_NAME_CAPACITY};

const BITMAP_WORDS: usize = 256;
/// Largest block count a download may have.
pub const MAX_BLOCKS: u32 = (BITMAP_WORDS as u32) * 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Full,
    Patch,
}

/// Verdict on an incoming block before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCheck {
    /// New block; write it at this byte offset.
    Write { offset: u32 },
    Duplicate,
}

#[derive(Debug)]
pub struct UpdateContext {
    pub job_id: heapless::String<JOB_ID_CAPACITY>,
    pub stream: heapless::String<STREAM_NAME_CAPACITY>,
    pub file_id: u32,
    pub file_size: u32,
    pub block_size: u32,
    pub kind: ImageKind,
    bytes_written: u32,
    total_blocks: u32,
    remaining: u32,
    received: heapless::Vec<u32, BITMAP_WORDS>,
    valid: bool,
}

impl UpdateContext {
    pub fn new(
        job_id: &str,
        manifest: &FileManifest,
        block_size: u32,
        max_file_size: u32,
    ) -> Result<Self, IntegrityError> {
        if manifest.file_size > max_file_size {
            return Err(IntegrityError::FileTooLarge);
        }
        let total_blocks = manifest.file_size.div_ceil(block_size);
        if total_blocks > MAX_BLOCKS {
            return Err(IntegrityError::FileTooLarge);
        }
        let words = total_blocks.div_ceil(32) as usize;
        let mut received = heapless::Vec::new();
        // Fits: words <= BITMAP_WORDS by the check above.
        let _ = received.resize(words, 0);

        let mut id = heapless::String::new();
        let _ = id.push_str(job_id);

        Ok(Self {
            job_id: id,
            stream: manifest.stream.clone(),
            file_id: manifest.file_id,
            file_size: manifest.file_size,
            block_size,
            kind: if manifest.is_patch() {
                ImageKind::Patch
            } else {
                ImageKind::Full
            },
            bytes_written: 0,
            total_blocks,
            remaining: total_blocks,
            received,
            valid: true,
        })
    }

    /// Region the downloaded bytes go to.
    pub fn region(&self) -> Region {
        match self.kind {
            ImageKind::Full => Region::Update,
            ImageKind::Patch => Region::PatchStaging,
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn blocks_remaining(&self) -> u32 {
        self.remaining
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the download unusable.  Nothing from it may be finalized.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    fn is_received(&self, index: u32) -> bool {
        self.received
            .get((index / 32) as usize)
            .is_some_and(|w| w & (1 << (index % 32)) != 0)
    }

    /// Lowest block not yet received.
    pub fn next_missing(&self) -> Option<u32> {
        self.received.iter().enumerate().find_map(|(w, bits)| {
            let free = !bits;
            if free == 0 {
                return None;
            }
            let index = (w as u32) * 32 + free.trailing_zeros();
            (index < self.total_blocks).then_some(index)
        })
    }

    /// Expected length of block `index`: full blocks except possibly the last.
    fn expected_len(&self, index: u32) -> u32 {
        let offset = index * self.block_size;
        (self.file_size - offset).min(self.block_size)
    }

    /// Validate a block against the file bounds.
    pub fn check(&self, index: u32, len: usize) -> Result<BlockCheck, IntegrityError> {
        if index >= self.total_blocks {
            return Err(IntegrityError::OffsetOutOfBounds);
        }
        let offset = index * self.block_size;
        let len = u32::try_from(len).map_err(|_| IntegrityError::BlockLength)?;
        if offset.checked_add(len).is_none_or(|end| end > self.file_size) {
            return Err(IntegrityError::OffsetOutOfBounds);
        }
        if len != self.expected_len(index) {
            return Err(IntegrityError::BlockLength);
        }
        if self.is_received(index) {
            return Ok(BlockCheck::Duplicate);
        }
        Ok(BlockCheck::Write { offset })
    }

    /// Account for a block once it is in flash.
    pub fn record(&mut self, index: u32, len: usize) {
        if index >= self.total_blocks || self.is_received(index) {
            return;
        }
        if let Some(word) = self.received.get_mut((index / 32) as usize) {
            *word |= 1 << (index % 32);
            self.remaining -= 1;
            self.bytes_written += len as u32;
        }
    }
}
