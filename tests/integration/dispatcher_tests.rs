//! Job dispatch through the router: which agent gets what, and what is
//! answered without reaching an agent at all.

use fleetnode::app::ports::QoS;
use fleetnode::cert::CertState;
use fleetnode::jobs::dispatcher::{Dispatch, JobKind};
use fleetnode::mqtt::topic;
use fleetnode::ota::OtaState;

use crate::mock_cloud::{Device, THING, firmware_manifest, image, notification, rotation_document};

fn booted() -> Device {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    dev
}

#[test]
fn start_subscribes_and_asks_for_pending_job() {
    let mut dev = Device::new(&image(16, 0));
    dev.supervisor.connection_mut().connect_with_backoff().unwrap();
    dev.dispatcher.start().unwrap();

    let subscribed = dev.mqtt.subscribed();
    assert!(subscribed.contains(&topic::jobs_notify_next(THING)));
    assert!(subscribed.contains(&topic::jobs_next_get_accepted(THING)));
    let query = dev.mqtt.published_to(&topic::jobs_next_get(THING));
    assert_eq!(query.len(), 1);
    assert_eq!(query[0].payload, b"{}");
}

#[test]
fn pending_job_answer_is_dispatched_like_a_notification() {
    let mut dev = booted();
    let payload = notification("job-next", &firmware_manifest("firmware.bin", 2048));
    assert!(dev.inbound(&topic::jobs_next_get_accepted(THING), &payload));
    dev.settle();

    assert_eq!(dev.ota.state(), OtaState::ProcessingBlock);
    assert_eq!(dev.cert.state(), CertState::Ready);
}

#[test]
fn documents_go_to_the_agent_that_owns_them() {
    let dev = booted();
    assert_eq!(
        dev.dispatcher
            .handle(&notification("fw", &firmware_manifest("firmware.bin", 10))),
        Dispatch::Forwarded(JobKind::Firmware)
    );
    assert_eq!(
        dev.dispatcher.handle(&notification("rot", &rotation_document())),
        Dispatch::Forwarded(JobKind::CredentialRotation)
    );
    assert_eq!(dev.ota_inbox.queue().len(), 1);
    assert_eq!(dev.cert_inbox.queue().len(), 1);
}

#[test]
fn both_agents_run_jobs_concurrently() {
    let mut dev = booted();
    assert!(dev.notify_job("fw", &firmware_manifest("firmware.bin", 4096)));
    assert!(dev.notify_job("rot", &rotation_document()));
    dev.settle();

    assert_eq!(dev.ota.state(), OtaState::ProcessingBlock);
    assert_eq!(dev.cert.state(), CertState::WaitingSignedCertificate);
}

#[test]
fn invalid_job_document_is_rejected_once_and_never_forwarded() {
    let mut dev = booted();
    let payload = br#"{"execution":{"jobId":"bad-1","jobDocument":"{not json"}}"#;
    assert!(dev.inbound(&topic::jobs_notify_next(THING), payload));
    dev.settle();

    let updates = dev.mqtt.published_to(&topic::job_update(THING, "bad-1"));
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].json()["status"], "REJECTED");
    assert_eq!(updates[0].qos, QoS::AtMostOnce);
    assert!(dev.mqtt.subscribed().is_empty());
    assert_eq!(dev.ota.state(), OtaState::Ready);
    assert_eq!(dev.cert.state(), CertState::Ready);
    assert!(dev.ota_inbox.queue().is_empty());
    assert!(dev.cert_inbox.queue().is_empty());
}

#[test]
fn unknown_document_shape_is_rejected() {
    let dev = booted();
    let doc = serde_json::json!({ "operation": "Reboot" });
    assert!(matches!(
        dev.dispatcher.handle(&notification("odd", &doc)),
        Dispatch::Rejected(_)
    ));
    assert_eq!(dev.mqtt.published_to(&topic::job_update(THING, "odd")).len(), 1);
}

#[test]
fn notification_without_execution_is_ignored() {
    let dev = booted();
    assert_eq!(dev.dispatcher.handle(br#"{"timestamp":1}"#), Dispatch::Ignored);
    assert_eq!(dev.dispatcher.handle(b"garbage"), Dispatch::Ignored);
    assert!(dev.mqtt.published().is_empty());
}

#[test]
fn job_update_responses_are_not_unsolicited() {
    let mut dev = booted();
    assert!(dev.notify_job("fw", &firmware_manifest("firmware.bin", 2048)));
    dev.settle();

    // Nobody subscribes to these; the router only logs them.
    let accepted = format!("{}/accepted", topic::job_update(THING, "fw"));
    assert!(!dev.inbound(&accepted, b"{}"));
    assert_eq!(dev.ota.state(), OtaState::ProcessingBlock);
}
