//! Three-way streaming delta patch engine (janpatch/jdiff format).
//!
//! ```text
//!   source (running image) ─┐
//!                           ├──▶ apply() ──▶ target (update region)
//!   patch (staging region) ─┘
//! ```
//!
//! Each stream is read or written through a page buffer of `window`
//! bytes, so memory use is three windows regardless of image size.
//!
//! ## Patch format
//!
//! The patch is a sequence of `ESC op [length]` instructions:
//!
//! | Op    | Byte | Effect                                             |
//! |-------|------|----------------------------------------------------|
//! | `EQL` | 0xA3 | copy `length` bytes from source                    |
//! | `MOD` | 0xA6 | literal bytes follow; each one also skips a source byte |
//! | `INS` | 0xA5 | literal bytes follow; source untouched             |
//! | `DEL` | 0xA4 | skip `length` source bytes                         |
//! | `BKT` | 0xA2 | move the source cursor back `length` bytes         |
//!
//! Literal runs end at the next `ESC op`.  A data byte equal to `ESC` is
//! written `ESC ESC`.  An `ESC` that is the last byte of the patch is
//! neither data nor an instruction, and fails the patch.  Lengths are `b+1` for `b < 252`, `253+n` after a
//! 252 prefix, a big-endian `u16` after 253 and a big-endian `u32` after
//! 254.

pub mod build;
pub mod stream;

use core::fmt;
use std::io::SeekFrom;

use log::debug;

use crate::error::IntegrityError;
use stream::PatchStream;

pub const ESC: u8 = 0xA7;
pub const MOD: u8 = 0xA6;
pub const INS: u8 = 0xA5;
pub const DEL: u8 = 0xA4;
pub const EQL: u8 = 0xA3;
pub const BKT: u8 = 0xA2;

pub const DEFAULT_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// A stream refused a seek.
    Seek,
    /// A stream read or write failed.
    Io,
    /// A write was accepted only partially.
    ShortWrite,
    /// Patch byte where an `ESC` was required.
    MissingEscape(u8),
    UnknownOpcode(u8),
    /// Length prefix malformed or cut short.
    InvalidLength,
    /// `EQL` ran past the end of the source.
    SourceExhausted,
    /// `BKT` moved before the start of the source.
    SourceUnderflow,
    /// Patch ends on an `ESC` with no opcode after it.
    DanglingEscape,
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seek => write!(f, "seek out of range"),
            Self::Io => write!(f, "stream I/O failed"),
            Self::ShortWrite => write!(f, "short write"),
            Self::MissingEscape(b) => write!(f, "expected ESC, got {b:#04x}"),
            Self::UnknownOpcode(b) => write!(f, "unknown opcode {b:#04x}"),
            Self::InvalidLength => write!(f, "invalid length"),
            Self::SourceExhausted => write!(f, "source exhausted"),
            Self::SourceUnderflow => write!(f, "source cursor underflow"),
            Self::DanglingEscape => write!(f, "patch ends after ESC"),
        }
    }
}

impl From<PatchError> for IntegrityError {
    fn from(e: PatchError) -> Self {
        match e {
            PatchError::Seek | PatchError::Io | PatchError::ShortWrite => Self::PatchIo,
            _ => Self::PatchFormat,
        }
    }
}

impl From<PatchError> for crate::error::Error {
    fn from(e: PatchError) -> Self {
        Self::Integrity(e.into())
    }
}

// ---------------------------------------------------------------------------
// Paged reader / writer
// ---------------------------------------------------------------------------

/// Read cursor over a stream with a single cached page.
struct PagedReader<'s, S: PatchStream + ?Sized> {
    stream: &'s mut S,
    page: Vec<u8>,
    page_index: Option<u64>,
    page_len: usize,
    position: u64,
}

impl<'s, S: PatchStream + ?Sized> PagedReader<'s, S> {
    fn new(stream: &'s mut S, window: usize) -> Self {
        Self {
            stream,
            page: vec![0; window],
            page_index: None,
            page_len: 0,
            position: 0,
        }
    }

    /// Next byte, or `None` at end of stream.  The cursor does not move
    /// past the end.
    fn getc(&mut self) -> Result<Option<u8>, PatchError> {
        let window = self.page.len() as u64;
        let index = self.position / window;
        if self.page_index != Some(index) {
            match self.stream.seek(SeekFrom::Start(index * window)) {
                Ok(_) => self.page_len = self.stream.read(&mut self.page)?,
                // Cursor parked beyond the stream (after DEL): nothing to read.
                Err(PatchError::Seek) => self.page_len = 0,
                Err(e) => return Err(e),
            }
            self.page_index = Some(index);
        }
        let offset = (self.position - index * window) as usize;
        if offset >= self.page_len {
            return Ok(None);
        }
        self.position += 1;
        Ok(Some(self.page[offset]))
    }
}

/// Sequential write cursor that emits whole pages.
struct PagedWriter<'s, S: PatchStream + ?Sized> {
    stream: &'s mut S,
    page: Vec<u8>,
    window: usize,
    fill: usize,
    written: u64,
}

impl<'s, S: PatchStream + ?Sized> PagedWriter<'s, S> {
    fn new(stream: &'s mut S, window: usize) -> Self {
        Self {
            stream,
            page: Vec::with_capacity(window),
            window,
            fill: 0,
            written: 0,
        }
    }

    fn putc(&mut self, byte: u8) -> Result<(), PatchError> {
        self.page.push(byte);
        self.fill += 1;
        if self.fill == self.window {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PatchError> {
        if self.fill == 0 {
            return Ok(());
        }
        self.stream.seek(SeekFrom::Start(self.written))?;
        let n = self.stream.write(&self.page)?;
        if n != self.fill {
            return Err(PatchError::ShortWrite);
        }
        self.written += n as u64;
        self.page.clear();
        self.fill = 0;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.written + self.fill as u64
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

fn read_length<S: PatchStream + ?Sized>(patch: &mut PagedReader<'_, S>) -> Result<u64, PatchError> {
    let mut next = || -> Result<u8, PatchError> { patch.getc()?.ok_or(PatchError::InvalidLength) };
    let len = match next()? {
        b @ 0..=251 => u64::from(b) + 1,
        252 => 253 + u64::from(next()?),
        253 => {
            let hi = u64::from(next()?);
            (hi << 8) | u64::from(next()?)
        }
        254 => {
            let mut v = 0u64;
            for _ in 0..4 {
                v = (v << 8) | u64::from(next()?);
            }
            v
        }
        _ => return Err(PatchError::InvalidLength),
    };
    Ok(len)
}

fn emit<S, T>(
    byte: u8,
    source: &mut PagedReader<'_, S>,
    target: &mut PagedWriter<'_, T>,
    consume_source: bool,
) -> Result<(), PatchError>
where
    S: PatchStream + ?Sized,
    T: PatchStream + ?Sized,
{
    target.putc(byte)?;
    if consume_source {
        source.getc()?;
    }
    Ok(())
}

/// Copy a literal run to the target.  For `MOD` every byte written also
/// consumes one source byte.
fn literal_run<S, P, T>(
    source: &mut PagedReader<'_, S>,
    patch: &mut PagedReader<'_, P>,
    target: &mut PagedWriter<'_, T>,
    consume_source: bool,
) -> Result<(), PatchError>
where
    S: PatchStream + ?Sized,
    P: PatchStream + ?Sized,
    T: PatchStream + ?Sized,
{
    loop {
        let Some(byte) = patch.getc()? else {
            return Ok(());
        };
        if byte != ESC {
            emit(byte, source, target, consume_source)?;
            continue;
        }
        match patch.getc()? {
            Some(ESC) => emit(ESC, source, target, consume_source)?,
            Some(BKT..=MOD) => {
                // Start of the next instruction: hand it back.
                patch.position -= 2;
                return Ok(());
            }
            Some(other) => {
                emit(ESC, source, target, consume_source)?;
                emit(other, source, target, consume_source)?;
            }
            None => return Err(PatchError::DanglingEscape),
        }
    }
}

/// Build `target` from `source` and `patch`.  Returns the target length.
///
/// On error the target may be partially written and must not be used.
pub fn apply<S, P, T>(
    source: &mut S,
    patch: &mut P,
    target: &mut T,
    window: usize,
) -> Result<u64, PatchError>
where
    S: PatchStream + ?Sized,
    P: PatchStream + ?Sized,
    T: PatchStream + ?Sized,
{
    let window = window.max(1);
    let mut src = PagedReader::new(source, window);
    let mut pat = PagedReader::new(patch, window);
    let mut dst = PagedWriter::new(target, window);

    while let Some(byte) = pat.getc()? {
        if byte != ESC {
            return Err(PatchError::MissingEscape(byte));
        }
        let Some(op) = pat.getc()? else {
            return Err(PatchError::DanglingEscape);
        };
        match op {
            EQL => {
                let len = read_length(&mut pat)?;
                for _ in 0..len {
                    let b = src.getc()?.ok_or(PatchError::SourceExhausted)?;
                    dst.putc(b)?;
                }
            }
            MOD => literal_run(&mut src, &mut pat, &mut dst, true)?,
            INS => literal_run(&mut src, &mut pat, &mut dst, false)?,
            DEL => {
                let len = read_length(&mut pat)?;
                src.position = src.position.saturating_add(len);
            }
            BKT => {
                let len = read_length(&mut pat)?;
                src.position = src
                    .position
                    .checked_sub(len)
                    .ok_or(PatchError::SourceUnderflow)?;
            }
            other => return Err(PatchError::UnknownOpcode(other)),
        }
    }

    dst.flush()?;
    let len = dst.position();
    debug!("patch: produced {} bytes", len);
    Ok(len)
}
