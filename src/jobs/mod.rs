//! Job intake: notification parsing, routing, and per-agent job claims.
//!
//! ```text
//!  notify-next ──▶ JobDispatcher ──classify──▶ JobSink (update agent)
//!                        │                └──▶ JobSink (rotation agent)
//!                        └── malformed / unknown ──▶ REJECTED status
//! ```

pub mod dispatcher;
pub mod status;

use std::sync::Mutex;

use crate::error::ResourceError;
use crate::events::{JOB_ID_CAPACITY, JobDocument};

/// Result of trying to claim an agent for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    /// This job is the one already running.
    Duplicate,
    /// Another job is running.
    Busy,
}

/// At most one active job per agent.  Claimed by the dispatcher, released
/// by the agent when the job reaches a terminal status.
#[derive(Default)]
pub struct JobSlot {
    active: Mutex<Option<heapless::String<JOB_ID_CAPACITY>>>,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self, job_id: &str) -> Claim {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match active.as_ref() {
            Some(current) if current.as_str() == job_id => Claim::Duplicate,
            Some(_) => Claim::Busy,
            None => {
                let mut id = heapless::String::new();
                if id.push_str(job_id).is_err() {
                    // Over-long ids never get this far; JobDocument rejects them.
                    return Claim::Busy;
                }
                *active = Some(id);
                Claim::Claimed
            }
        }
    }

    pub fn release(&self) {
        *self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    pub fn current(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|s| s.as_str().to_owned())
    }
}

/// An agent's job intake, as seen by the dispatcher.
pub trait JobSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn slot(&self) -> &JobSlot;

    /// Enqueue the job for the agent.  Must not block.
    fn deliver(&self, job: JobDocument) -> Result<(), ResourceError>;
}
