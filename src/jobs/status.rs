//! Job execution status updates.
//!
//! Every job outcome is reported on `$aws/things/<thing>/jobs/<id>/update`
//! as `{"status":"..","statusDetails":{..}}`.

use core::fmt;

use log::{info, warn};
use serde::Serialize;

use crate::app::ports::QoS;
use crate::error::{Error, ProtocolError};
use crate::mqtt::session::Session;
use crate::mqtt::topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
    Rejected,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// `statusDetails` object.  Exactly one of `message`/`error` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusDetails<'a> {
    #[serde(rename = "Code")]
    pub code: &'a str,
    #[serde(rename = "Message", skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

impl<'a> StatusDetails<'a> {
    pub const fn ok(code: &'a str, message: &'a str) -> Self {
        Self {
            code,
            message: Some(message),
            error: None,
        }
    }

    pub const fn error(code: &'a str, error: &'a str) -> Self {
        Self {
            code,
            message: None,
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
struct StatusUpdate<'a> {
    status: JobStatus,
    #[serde(rename = "statusDetails", skip_serializing_if = "Option::is_none")]
    details: Option<StatusDetails<'a>>,
}

pub fn status_payload(status: JobStatus, details: Option<StatusDetails<'_>>) -> Vec<u8> {
    // Serialising plain strings and enums into a Vec cannot fail.
    serde_json::to_vec(&StatusUpdate { status, details }).unwrap_or_default()
}

/// Publish a status update for `job_id`.
///
/// `qos` is [`QoS::AtMostOnce`] from callback context, where waiting for an
/// ack is not allowed.
pub fn report(
    session: &Session,
    job_id: &str,
    status: JobStatus,
    details: Option<StatusDetails<'_>>,
    qos: QoS,
) -> Result<(), Error> {
    let topic = topic::job_update(session.thing_name(), job_id);
    let payload = status_payload(status, details);
    if payload.is_empty() {
        return Err(ProtocolError::PublishFailed.into());
    }
    session.router().track_job(Some(job_id));
    info!("Job {}: status {}", job_id, status);
    session.publish(&topic, &payload, qos).map_err(|e| {
        warn!("Job {}: status update not delivered: {}", job_id, e);
        e.into()
    })
}
