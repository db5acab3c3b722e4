//! Subscription router.
//!
//! Maps topic filters to inbound handlers.  The pub/sub client adapter
//! calls [`Router::dispatch`] for every inbound publish; the router finds
//! every handler whose filter matches and calls it.
//!
//! ```text
//!  inbound publish ──▶ Router::dispatch ──▶ handler(s) ──▶ EventQueue
//!                             │
//!                             └─ no match ─▶ own job-update ack? ─▶ debug
//!                                                   │
//!                                                   └─ else ─▶ warn "unsolicited"
//! ```
//!
//! Handlers run in the client's callback context and must not block.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use super::topic;
use crate::error::{MalformedError, ResourceError};
use crate::events::JOB_ID_CAPACITY;

/// Fixed number of subscription slots.
pub const MAX_SUBSCRIPTIONS: usize = 10;
/// Longest topic filter the table will store.
pub const TOPIC_FILTER_CAPACITY: usize = 192;

/// Receiver of inbound publishes.  Implemented by each agent's callbacks.
pub trait InboundHandler: Send + Sync {
    fn on_publish(&self, topic: &str, payload: &[u8]);
}

struct Subscription {
    filter: heapless::String<TOPIC_FILTER_CAPACITY>,
    handler: Arc<dyn InboundHandler>,
}

#[derive(Default)]
struct Table {
    slots: [Option<Subscription>; MAX_SUBSCRIPTIONS],
    tracked_job: Option<heapless::String<JOB_ID_CAPACITY>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
    Full,
    FilterTooLong,
}

impl From<RouterError> for crate::error::Error {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Full => ResourceError::TableFull.into(),
            RouterError::FilterTooLong => MalformedError::FieldTooLong("topic filter").into(),
        }
    }
}

pub struct Router {
    thing_name: heapless::String<128>,
    table: Mutex<Table>,
}

impl Router {
    pub fn new(thing_name: &str) -> Self {
        let mut name = heapless::String::new();
        if name.push_str(thing_name).is_err() {
            warn!("Router: thing name truncated to 128 bytes");
            for c in thing_name.chars() {
                if name.push(c).is_err() {
                    break;
                }
            }
        }
        Self {
            thing_name: name,
            table: Mutex::new(Table::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A handler that panicked must not take routing down with it.
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register `handler` for `filter`.  Adding the same pair twice is a
    /// no-op success.
    pub fn add(&self, filter: &str, handler: Arc<dyn InboundHandler>) -> Result<(), RouterError> {
        self.register(filter, handler).map(|_| ())
    }

    /// Like [`Router::add`], but reports whether a new entry was made.
    pub fn register(&self, filter: &str, handler: Arc<dyn InboundHandler>) -> Result<bool, RouterError> {
        let mut stored = heapless::String::new();
        stored
            .push_str(filter)
            .map_err(|()| RouterError::FilterTooLong)?;

        let mut table = self.lock();
        let duplicate = table.slots.iter().flatten().any(|s| {
            s.filter.as_str() == filter && Arc::ptr_eq(&s.handler, &handler)
        });
        if duplicate {
            return Ok(false);
        }
        let slot = table
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(RouterError::Full)?;
        *slot = Some(Subscription {
            filter: stored,
            handler,
        });
        Ok(true)
    }

    /// Remove the one entry pairing `filter` with `handler`.
    pub fn remove_handler(&self, filter: &str, handler: &Arc<dyn InboundHandler>) -> bool {
        let mut table = self.lock();
        let found = table.slots.iter_mut().find(|slot| {
            slot.as_ref()
                .is_some_and(|s| s.filter.as_str() == filter && Arc::ptr_eq(&s.handler, handler))
        });
        match found {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Whether any handler is registered for exactly `filter`.
    pub fn has_filter(&self, filter: &str) -> bool {
        self.lock()
            .slots
            .iter()
            .flatten()
            .any(|s| s.filter.as_str() == filter)
    }

    /// Remove every entry registered for `filter`.  Returns how many went.
    pub fn remove(&self, filter: &str) -> usize {
        let mut table = self.lock();
        let mut removed = 0;
        for slot in &mut table.slots {
            if slot.as_ref().is_some_and(|s| s.filter.as_str() == filter) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Every distinct filter currently registered.
    pub fn filters(&self) -> Vec<String> {
        let table = self.lock();
        let mut out: Vec<String> = Vec::new();
        for sub in table.slots.iter().flatten() {
            if !out.iter().any(|f| f == sub.filter.as_str()) {
                out.push(sub.filter.as_str().to_owned());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lock().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remember which job our status updates refer to, so the broker's
    /// responses to them are not reported as unsolicited.
    pub fn track_job(&self, job_id: Option<&str>) {
        let mut table = self.lock();
        table.tracked_job = job_id.and_then(|id| {
            let mut s = heapless::String::new();
            s.push_str(id).ok().map(|()| s)
        });
    }

    /// Deliver an inbound publish.  Returns `true` if any handler ran.
    pub fn dispatch(&self, topic_name: &str, payload: &[u8]) -> bool {
        let mut matched: heapless::Vec<Arc<dyn InboundHandler>, MAX_SUBSCRIPTIONS> =
            heapless::Vec::new();
        let tracked = {
            let table = self.lock();
            for sub in table.slots.iter().flatten() {
                if topic::topic_matches(sub.filter.as_str(), topic_name) {
                    // Capacity equals the slot count.
                    let _ = matched.push(Arc::clone(&sub.handler));
                }
            }
            table.tracked_job.clone()
        };

        if matched.is_empty() {
            let own_ack = tracked.as_ref().is_some_and(|job| {
                topic::is_job_update_response(topic_name, self.thing_name.as_str(), job.as_str())
            });
            if own_ack {
                debug!("Router: job update response on {}", topic_name);
            } else {
                warn!(
                    "Router: unsolicited publish on {} ({} bytes)",
                    topic_name,
                    payload.len()
                );
            }
            return false;
        }

        for handler in &matched {
            handler.on_publish(topic_name, payload);
        }
        true
    }
}
