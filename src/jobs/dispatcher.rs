//! Job notification dispatcher.
//!
//! Runs in the pub/sub callback context.  Parses the notification, decides
//! which agent the job belongs to from the document's shape, claims that
//! agent and enqueues the job.  Anything unrecognisable is answered with a
//! single `REJECTED` status and never forwarded.

use std::sync::Arc;

use log::{debug, error, warn};
use serde_json::Value;

use super::status::{self, JobStatus};
use super::{Claim, JobSink};
use crate::app::ports::QoS;
use crate::error::{Error, MalformedError};
use crate::events::JobDocument;
use crate::mqtt::router::InboundHandler;
use crate::mqtt::session::Session;
use crate::mqtt::topic;

/// Firmware manifest key.
pub const FIRMWARE_MANIFEST_KEY: &str = "afr_ota";
/// Rotation operations this device understands.
pub const ROTATION_OPERATIONS: &[&str] = &["CertRotation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Firmware,
    CredentialRotation,
}

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Forwarded(JobKind),
    Rejected(MalformedError),
    /// Same job already running on its agent.
    Duplicate,
    /// Agent busy with another job, or its queue is full.
    Dropped,
    /// No pending job, or no job id to answer to.
    Ignored,
}

/// A parsed notification: job id plus the document, or why the document
/// is unusable.
#[derive(Debug)]
pub struct Notification {
    pub job_id: String,
    pub document: Result<Value, MalformedError>,
}

/// Parse a notify-next (or `$next/get/accepted`) payload.
///
/// `Ok(None)` means the payload carries no pending execution.  The job
/// document may be inline JSON or a string holding JSON.
pub fn parse_notification(payload: &[u8]) -> Result<Option<Notification>, MalformedError> {
    let root: Value = serde_json::from_slice(payload).map_err(|_| MalformedError::InvalidJson)?;
    let Some(execution) = root.get("execution") else {
        return Ok(None);
    };
    let job_id = execution
        .get("jobId")
        .and_then(Value::as_str)
        .ok_or(MalformedError::MissingField("jobId"))?
        .to_owned();

    let document = match execution.get("jobDocument") {
        None => Err(MalformedError::MissingField("jobDocument")),
        Some(Value::String(raw)) => {
            serde_json::from_str::<Value>(raw).map_err(|_| MalformedError::InvalidJson)
        }
        Some(doc) => Ok(doc.clone()),
    };

    Ok(Some(Notification { job_id, document }))
}

/// Decide which agent a document belongs to.
pub fn classify(document: &Value) -> Option<JobKind> {
    if !document.is_object() {
        return None;
    }
    if document.get(FIRMWARE_MANIFEST_KEY).is_some() {
        return Some(JobKind::Firmware);
    }
    let op = document.get("operation").and_then(Value::as_str)?;
    ROTATION_OPERATIONS
        .contains(&op)
        .then_some(JobKind::CredentialRotation)
}

pub struct JobDispatcher {
    session: Arc<Session>,
    firmware: Arc<dyn JobSink>,
    rotation: Arc<dyn JobSink>,
}

impl JobDispatcher {
    pub fn new(session: Arc<Session>, firmware: Arc<dyn JobSink>, rotation: Arc<dyn JobSink>) -> Self {
        Self {
            session,
            firmware,
            rotation,
        }
    }

    /// Subscribe to job notifications and ask for any job already pending.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let thing = self.session.thing_name();
        let notify = topic::jobs_notify_next(thing);
        let next = topic::jobs_next_get_accepted(thing);
        let handler: Arc<dyn InboundHandler> = self.clone();
        self.session.subscribe(&[&notify, &next], &handler)?;
        self.session
            .publish(&topic::jobs_next_get(thing), b"{}", QoS::AtLeastOnce)?;
        Ok(())
    }

    pub fn handle(&self, payload: &[u8]) -> Dispatch {
        let notification = match parse_notification(payload) {
            Ok(Some(n)) => n,
            Ok(None) => {
                debug!("Jobs: no pending execution");
                return Dispatch::Ignored;
            }
            Err(e) => {
                error!("Jobs: undecodable notification ({}), no job id to reject", e);
                return Dispatch::Ignored;
            }
        };

        let job_id = notification.job_id.as_str();
        let (kind, doc) = match notification.document {
            Ok(doc) => match classify(&doc) {
                Some(kind) => (kind, doc),
                None => return self.reject(job_id, MalformedError::UnknownJob),
            },
            Err(e) => return self.reject(job_id, e),
        };

        let sink = match kind {
            JobKind::Firmware => &self.firmware,
            JobKind::CredentialRotation => &self.rotation,
        };

        match sink.slot().try_claim(job_id) {
            Claim::Claimed => {}
            Claim::Duplicate => {
                debug!("Jobs: {} already active on {}", job_id, sink.name());
                return Dispatch::Duplicate;
            }
            Claim::Busy => {
                warn!("Jobs: {} busy, dropping job {}", sink.name(), job_id);
                return Dispatch::Dropped;
            }
        }

        let bytes = serde_json::to_vec(&doc).unwrap_or_default();
        let job = match JobDocument::new(job_id, &bytes) {
            Ok(job) => job,
            Err(e) => {
                sink.slot().release();
                return self.reject(job_id, e);
            }
        };

        match sink.deliver(job) {
            Ok(()) => {
                debug!("Jobs: {} -> {}", job_id, sink.name());
                Dispatch::Forwarded(kind)
            }
            Err(e) => {
                error!("Jobs: could not hand {} to {}: {}", job_id, sink.name(), e);
                sink.slot().release();
                Dispatch::Dropped
            }
        }
    }

    fn reject(&self, job_id: &str, reason: MalformedError) -> Dispatch {
        warn!("Jobs: rejecting {}: {}", job_id, reason);
        // Callback context: fire and forget.
        let _ = status::report(
            &self.session,
            job_id,
            JobStatus::Rejected,
            None,
            QoS::AtMostOnce,
        );
        Dispatch::Rejected(reason)
    }
}

impl InboundHandler for JobDispatcher {
    fn on_publish(&self, _topic: &str, payload: &[u8]) {
        self.handle(payload);
    }
}
