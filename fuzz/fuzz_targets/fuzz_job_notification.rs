//! Fuzz target: job notification parsing and routing
//!
//! Runs arbitrary payloads through the notification parser, the document
//! classifier and both agents' document parsers.
//!
//! cargo fuzz run fuzz_job_notification

#![no_main]

use fleetnode::cert::messages::parse_rotation_job;
use fleetnode::jobs::dispatcher::{JobKind, classify, parse_notification};
use fleetnode::ota::manifest::parse_manifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(Some(notification)) = parse_notification(data) else {
        return;
    };
    let Ok(document) = notification.document else {
        return;
    };
    let bytes = serde_json::to_vec(&document).unwrap_or_default();
    match classify(&document) {
        Some(JobKind::Firmware) => {
            let _ = parse_manifest(&bytes);
        }
        Some(JobKind::CredentialRotation) => {
            let job = parse_rotation_job(&bytes).ok();
            // Only string fields reach the agent.
            if let Some(job) = job {
                assert!(!job.operation.is_empty());
            }
        }
        None => {}
    }
});
