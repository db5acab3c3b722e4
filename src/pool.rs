//! Block buffer pool.
//!
//! Inbound stream blocks are copied into a pooled buffer by the callback,
//! carried to the update agent inside an [`Event`](crate::events::Event),
//! and handed back when the event is dropped.
//!
//! ```text
//!   free list ──acquire──▶ PooledBlock ──event──▶ agent ──drop──┐
//!       ▲                                                       │
//!       └───────────────────────────────────────────────────────┘
//! ```
//!
//! A buffer is owned by exactly one [`PooledBlock`] while in use, so it
//! can never be released while still referenced.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::warn;

use crate::error::ResourceError;

/// Room for the largest block message: base64 of a 2 KiB block plus the
/// JSON envelope.
pub const BLOCK_BUFFER_CAPACITY: usize = 4096;
/// Upper bound on pool size.
pub const MAX_POOL_BUFFERS: usize = 4;

type Buffer = Box<heapless::Vec<u8, BLOCK_BUFFER_CAPACITY>>;

pub struct BlockPool {
    free: Channel<CriticalSectionRawMutex, Buffer, MAX_POOL_BUFFERS>,
    capacity: usize,
}

impl BlockPool {
    /// Create a pool of `capacity` buffers (clamped to `1..=MAX_POOL_BUFFERS`).
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.clamp(1, MAX_POOL_BUFFERS);
        let pool = Self {
            free: Channel::new(),
            capacity,
        };
        for _ in 0..capacity {
            // Cannot fail: the channel holds MAX_POOL_BUFFERS.
            let _ = pool.free.try_send(Box::new(heapless::Vec::new()));
        }
        Arc::new(pool)
    }

    /// Take a buffer if one is free right now.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBlock> {
        self.free.try_receive().ok().map(|buf| PooledBlock {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    /// Wait up to `timeout` for a buffer.  Exhaustion is expected to be
    /// transient, so this blocks rather than failing straight away.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledBlock, ResourceError> {
        if let Some(block) = self.try_acquire() {
            return Ok(block);
        }
        let buf = futures_lite::future::block_on(futures_lite::future::or(
            async { Some(self.free.receive().await) },
            async {
                async_io_mini::Timer::after(timeout).await;
                None
            },
        ));
        match buf {
            Some(buf) => Ok(PooledBlock {
                buf: Some(buf),
                pool: Arc::clone(self),
            }),
            None => {
                warn!("BlockPool: no buffer free after {:?}", timeout);
                Err(ResourceError::PoolEmpty)
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently held by live [`PooledBlock`]s.
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    fn release(&self, mut buf: Buffer) {
        buf.clear();
        // Never full: every buffer in circulation came from this channel.
        let _ = self.free.try_send(buf);
    }
}

/// Exclusive handle on one pool buffer.
pub struct PooledBlock {
    buf: Option<Buffer>,
    pool: Arc<BlockPool>,
}

impl PooledBlock {
    /// Replace the contents with `data`.
    pub fn fill(&mut self, data: &[u8]) -> Result<(), ResourceError> {
        let buf = self.buf.as_mut().ok_or(ResourceError::PoolEmpty)?;
        buf.clear();
        buf.extend_from_slice(data)
            .map_err(|()| ResourceError::BufferOverflow)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().map_or(&[], |b| b.as_slice())
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl fmt::Debug for PooledBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledBlock({} bytes)", self.len())
    }
}
