//! Bounded event queues between the network callback context and the agents.
//!
//! Events are produced by:
//! - pub/sub inbound callbacks (job notifications, stream blocks, CSR and
//!   revoke responses)
//! - the connection manager (reconnect outcome)
//! - the agents themselves (follow-up steps such as `RequestBlock`)
//!
//! Each agent owns exactly one queue and is its only consumer.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ MQTT inbound │────▶│              │     │              │
//! │ Connection   │────▶│  EventQueue  │────▶│ Agent runner │
//! │ Agent itself │────▶│  (bounded)   │     │  (consumer)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! A full queue is a capacity-exhaustion error, never a silent drop: the
//! producer gets [`ResourceError::QueueFull`] back and the failure is
//! logged at error level.

use core::fmt;
use core::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::error;

use crate::error::{MalformedError, ResourceError};
use crate::pool::PooledBlock;

/// Maximum job id length accepted from the jobs service.
pub const JOB_ID_CAPACITY: usize = 64;
/// Maximum size of an embedded job document.
pub const JOB_DOC_CAPACITY: usize = 2048;

/// Default depth of each agent's queue.
pub const AGENT_QUEUE_DEPTH: usize = 10;

// ── Payloads ──────────────────────────────────────────────────

/// A job as delivered by the dispatcher.  Owns a copy of the document
/// because the inbound buffer is reused as soon as the callback returns.
#[derive(Clone, PartialEq, Eq)]
pub struct JobDocument {
    pub job_id: heapless::String<JOB_ID_CAPACITY>,
    pub document: heapless::Vec<u8, JOB_DOC_CAPACITY>,
}

impl JobDocument {
    pub fn new(job_id: &str, document: &[u8]) -> Result<Self, MalformedError> {
        let mut id = heapless::String::new();
        id.push_str(job_id)
            .map_err(|()| MalformedError::FieldTooLong("jobId"))?;
        let document = heapless::Vec::from_slice(document)
            .map_err(|()| MalformedError::FieldTooLong("jobDocument"))?;
        Ok(Self {
            job_id: id,
            document,
        })
    }

    pub fn id(&self) -> &str {
        self.job_id.as_str()
    }
}

impl fmt::Debug for JobDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDocument")
            .field("job_id", &self.job_id.as_str())
            .field("len", &self.document.len())
            .finish()
    }
}

/// At most one payload travels with an event.
#[derive(Debug)]
pub enum Payload {
    None,
    Job(Box<JobDocument>),
    /// Raw inbound bytes held in a pool buffer.  Dropping the payload
    /// returns the buffer.
    Block(PooledBlock),
}

/// Tagged event: an agent-specific kind plus an optional payload.
#[derive(Debug)]
pub struct Event<K> {
    pub kind: K,
    pub payload: Payload,
}

impl<K> Event<K> {
    pub fn signal(kind: K) -> Self {
        Self {
            kind,
            payload: Payload::None,
        }
    }

    pub fn job(kind: K, job: JobDocument) -> Self {
        Self {
            kind,
            payload: Payload::Job(Box::new(job)),
        }
    }

    pub fn block(kind: K, block: PooledBlock) -> Self {
        Self {
            kind,
            payload: Payload::Block(block),
        }
    }

    /// Move the job document out, if this event carries one.
    pub fn take_job(self) -> Option<Box<JobDocument>> {
        match self.payload {
            Payload::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn take_block(self) -> Option<PooledBlock> {
        match self.payload {
            Payload::Block(block) => Some(block),
            _ => None,
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────

/// Fixed-capacity FIFO.  Any number of producers, one consumer.
pub struct EventQueue<K, const N: usize = AGENT_QUEUE_DEPTH> {
    name: &'static str,
    channel: Channel<CriticalSectionRawMutex, Event<K>, N>,
}

impl<K: fmt::Debug, const N: usize> EventQueue<K, N> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            channel: Channel::new(),
        }
    }

    /// Non-blocking send.  Never waits for room.
    pub fn send(&self, event: Event<K>) -> Result<(), ResourceError> {
        self.channel.try_send(event).map_err(|e| {
            let embassy_sync::channel::TrySendError::Full(rejected) = e;
            error!(
                "{}: queue full ({} slots), failed to send {:?}",
                self.name, N, rejected.kind
            );
            ResourceError::QueueFull
        })
    }

    /// Wait up to `timeout` for the next event.  A zero timeout polls once.
    pub fn receive(&self, timeout: Duration) -> Option<Event<K>> {
        if let Ok(event) = self.channel.try_receive() {
            return Some(event);
        }
        if timeout.is_zero() {
            return None;
        }
        futures_lite::future::block_on(futures_lite::future::or(
            async { Some(self.channel.receive().await) },
            async {
                async_io_mini::Timer::after(timeout).await;
                None
            },
        ))
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
