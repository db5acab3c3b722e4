//! Firmware update flows: job notification through block download to the
//! boot selection, against the mock broker and simulated flash.

use fleetnode::app::ports::{QoS, Region};
use fleetnode::jobs::dispatcher::{Dispatch, JobKind};
use fleetnode::mqtt::topic;
use fleetnode::ota::OtaState;
use fleetnode::patch::build::diff;

use crate::mock_cloud::{
    Device, FlashWrite, STREAM, THING, block_response, firmware_manifest, image, notification,
};

const BLOCK: usize = 1024;

fn data_topic() -> String {
    topic::stream_data(THING, STREAM)
}

/// Deliver block `index` of `file` and let the agents react.
fn feed(dev: &mut Device, file: &[u8], index: usize) {
    let start = index * BLOCK;
    let end = (start + BLOCK).min(file.len());
    assert!(dev.inbound(&data_topic(), &block_response(0, index as u32, &file[start..end])));
    dev.settle();
}

fn start_job(dev: &mut Device, job_id: &str, path: &str, file: &[u8]) {
    assert!(dev.notify_job(job_id, &firmware_manifest(path, file.len())));
    dev.settle();
}

fn last_status(dev: &Device, job_id: &str) -> serde_json::Value {
    dev.statuses(job_id).pop().expect("no status published")
}

// ── Full image ────────────────────────────────────────────────

#[test]
fn four_block_image_downloads_in_order_and_finalizes() {
    let mut dev = Device::new(&image(2048, 9));
    dev.boot();
    let new_image = image(4096, 3);

    start_job(&mut dev, "job-a", "firmware.bin", &new_image);
    assert_eq!(dev.ota.state(), OtaState::ProcessingBlock);
    assert!(dev.mqtt.subscribed().contains(&data_topic()));
    assert_eq!(last_status(&dev, "job-a")["status"], "IN_PROGRESS");

    for i in 0..4 {
        feed(&mut dev, &new_image, i);
    }

    assert_eq!(dev.block_requests(), vec![0, 1, 2, 3]);
    let offsets: Vec<u32> = dev.flash.writes().iter().map(|w| w.offset).collect();
    assert_eq!(offsets, vec![0, 1024, 2048, 3072]);
    assert!(dev.flash.writes().iter().all(|w| w.region == Region::Update));
    assert_eq!(dev.flash.boot_image(), Some(new_image));

    let done = last_status(&dev, "job-a");
    assert_eq!(done["status"], "SUCCEEDED");
    assert_eq!(done["statusDetails"]["Code"], "200");
    assert_eq!(dev.system.restart_requests(), 1);
    assert!(dev.mqtt.unsubscribed().contains(&data_topic()));
    assert_eq!(dev.ota.state(), OtaState::Ready);
}

#[test]
fn block_request_names_file_and_size() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    start_job(&mut dev, "job-r", "firmware.bin", &image(1500, 1));

    let requests = dev.mqtt.published_to(&topic::stream_get(THING, STREAM));
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].qos, QoS::AtLeastOnce);
    let body = requests[0].json();
    assert_eq!(body["f"], 0);
    assert_eq!(body["l"], 1024);
    assert_eq!(body["o"], 0);
    assert_eq!(body["n"], 1);
}

#[test]
fn short_last_block_completes_image() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    let new_image = image(1500, 7);
    start_job(&mut dev, "job-s", "firmware.bin", &new_image);
    feed(&mut dev, &new_image, 0);
    feed(&mut dev, &new_image, 1);

    assert_eq!(dev.flash.writes()[1], FlashWrite {
        region: Region::Update,
        offset: 1024,
        len: 476,
    });
    assert_eq!(dev.flash.boot_image(), Some(new_image));
}

#[test]
fn duplicate_block_is_not_counted_twice() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    let new_image = image(4096, 5);
    start_job(&mut dev, "job-d", "firmware.bin", &new_image);

    feed(&mut dev, &new_image, 0);
    feed(&mut dev, &new_image, 0);

    let update = dev.ota.update().unwrap();
    assert_eq!(update.bytes_written(), 1024);
    assert_eq!(update.blocks_remaining(), 3);
    assert_eq!(dev.flash.writes().len(), 1);
    // The duplicate triggers a fresh request for the lowest missing block.
    assert_eq!(dev.block_requests(), vec![0, 1, 1]);
}

#[test]
fn undecodable_block_is_requested_again() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    start_job(&mut dev, "job-u", "firmware.bin", &image(2048, 2));

    assert!(dev.inbound(&data_topic(), b"{\"f\":0,\"i\":0"));
    dev.settle();

    assert_eq!(dev.block_requests(), vec![0, 0]);
    assert!(dev.flash.writes().is_empty());
    assert_eq!(dev.ota.state(), OtaState::ProcessingBlock);
}

#[test]
fn block_beyond_file_fails_job_without_restart() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    start_job(&mut dev, "job-o", "firmware.bin", &image(4096, 1));

    assert!(dev.inbound(&data_topic(), &block_response(0, 9, &[0u8; 1024])));
    dev.settle();

    let failed = last_status(&dev, "job-o");
    assert_eq!(failed["status"], "FAILED");
    assert_eq!(failed["statusDetails"]["Code"], "500");
    assert_eq!(dev.ota.state(), OtaState::Ready);
    assert!(dev.ota.update().is_none());
    assert_eq!(dev.flash.boot_image(), None);
    assert_eq!(dev.system.restart_requests(), 0);
    assert!(dev.mqtt.unsubscribed().contains(&data_topic()));
}

#[test]
fn manifest_without_stream_is_rejected_by_agent() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    let doc = serde_json::json!({
        "afr_ota": { "files": [{ "filepath": "fw", "filesize": 10, "fileid": 0 }] }
    });
    assert!(dev.notify_job("job-m", &doc));
    dev.settle();

    let statuses = dev.statuses("job-m");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["status"], "REJECTED");
    assert_eq!(statuses[0]["statusDetails"]["Code"], "400");
    assert!(dev.mqtt.subscribed().is_empty());
    assert_eq!(dev.ota.state(), OtaState::Ready);
}

#[test]
fn oversized_image_fails_before_download() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    let doc = firmware_manifest("firmware.bin", dev.config.max_file_size as usize + 1);
    assert!(dev.notify_job("job-big", &doc));
    dev.settle();

    assert_eq!(last_status(&dev, "job-big")["status"], "FAILED");
    assert!(dev.block_requests().is_empty());
    assert_eq!(dev.ota.state(), OtaState::Ready);
}

// ── Delta patch ───────────────────────────────────────────────

#[test]
fn patch_job_rebuilds_new_image_from_running_one() {
    let old = image(3000, 11);
    let mut new = old.clone();
    new[100..140].copy_from_slice(&[0xA7; 40]);
    new.splice(1800..1800, image(200, 99));
    new.truncate(3100);
    let patch = diff(&old, &new);

    let mut dev = Device::new(&old);
    dev.boot();
    start_job(&mut dev, "job-p", "firmware.patch", &patch);
    for i in 0..patch.len().div_ceil(BLOCK) {
        feed(&mut dev, &patch, i);
    }

    assert!(
        dev.flash
            .writes()
            .iter()
            .take(patch.len().div_ceil(BLOCK))
            .all(|w| w.region == Region::PatchStaging)
    );
    assert_eq!(dev.flash.boot_image(), Some(new));
    assert_eq!(last_status(&dev, "job-p")["status"], "SUCCEEDED");
    assert_eq!(dev.system.restart_requests(), 1);
}

#[test]
fn corrupt_patch_fails_and_keeps_running_image() {
    let old = image(512, 4);
    let mut dev = Device::new(&old);
    dev.boot();
    // Every instruction must start with the escape byte.
    let garbage = vec![0x11u8; 300];
    start_job(&mut dev, "job-x", "firmware.patch", &garbage);
    feed(&mut dev, &garbage, 0);

    let failed = last_status(&dev, "job-x");
    assert_eq!(failed["status"], "FAILED");
    assert_eq!(dev.flash.boot_image(), None);
    assert_eq!(dev.system.restart_requests(), 0);
    assert_eq!(dev.ota.state(), OtaState::Ready);
}

// ── Suspend / resume ──────────────────────────────────────────

#[test]
fn blocks_received_while_suspended_are_dropped_and_buffers_returned() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    let new_image = image(4096, 6);
    start_job(&mut dev, "job-sr", "firmware.bin", &new_image);
    feed(&mut dev, &new_image, 0);
    let in_use_before = dev.pool.in_use();

    dev.ota_inbox.suspend().unwrap();
    dev.settle();
    assert_eq!(dev.ota.state(), OtaState::Suspended);

    for i in 1..4 {
        let start = i * BLOCK;
        dev.inbound(
            &data_topic(),
            &block_response(0, i as u32, &new_image[start..start + BLOCK]),
        );
    }
    assert_eq!(dev.pool.in_use(), in_use_before + 3);
    dev.settle();
    assert_eq!(dev.pool.in_use(), in_use_before);
    assert_eq!(dev.flash.writes().len(), 1);

    dev.ota_inbox.resume().unwrap();
    dev.settle();
    assert_eq!(dev.ota.state(), OtaState::ProcessingBlock);
    assert_eq!(dev.block_requests(), vec![0, 1, 1]);
    assert_eq!(dev.ota.update().unwrap().blocks_remaining(), 3);

    for i in 1..4 {
        feed(&mut dev, &new_image, i);
    }
    assert_eq!(dev.flash.boot_image(), Some(new_image));
}

#[test]
fn pool_exhaustion_drops_excess_blocks() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    let new_image = image(6144, 8);
    start_job(&mut dev, "job-px", "firmware.bin", &new_image);

    let capacity = dev.pool.capacity();
    for i in 0..=capacity {
        let start = i * BLOCK;
        dev.inbound(
            &data_topic(),
            &block_response(0, i as u32, &new_image[start..start + BLOCK]),
        );
    }
    assert_eq!(dev.pool.in_use(), capacity);
    dev.settle();
    assert_eq!(dev.pool.in_use(), 0);
    // Only the block answering the outstanding request is applied.
    assert_eq!(dev.ota.update().unwrap().blocks_remaining(), 5);
    assert_eq!(dev.block_requests(), vec![0, 1]);
}

#[test]
fn connection_loss_resumes_from_lowest_missing_block() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    let new_image = image(3072, 12);
    start_job(&mut dev, "job-cl", "firmware.bin", &new_image);
    feed(&mut dev, &new_image, 0);

    dev.ota_inbox.suspend().unwrap();
    dev.settle();
    dev.mqtt.clear();
    dev.supervisor.connection_mut().recover().unwrap();
    dev.session.resubscribe_all().unwrap();
    dev.ota_inbox.resume().unwrap();
    dev.settle();

    assert!(dev.mqtt.subscribed().contains(&data_topic()));
    assert_eq!(dev.block_requests(), vec![1]);
    feed(&mut dev, &new_image, 1);
    feed(&mut dev, &new_image, 2);
    assert_eq!(dev.flash.boot_image(), Some(new_image));
}

#[test]
fn job_offered_while_suspended_is_fetched_again_on_resume() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    dev.ota_inbox.suspend().unwrap();
    dev.settle();

    let doc = firmware_manifest("firmware.bin", 2048);
    assert_eq!(
        dev.dispatcher.handle(&notification("job-late", &doc)),
        Dispatch::Forwarded(JobKind::Firmware)
    );
    dev.settle();
    assert_eq!(dev.ota.state(), OtaState::Suspended);
    assert!(dev.statuses("job-late").is_empty());

    dev.ota_inbox.resume().unwrap();
    dev.settle();
    assert_eq!(dev.ota.state(), OtaState::Ready);
    let queries = dev.mqtt.published_to(&topic::jobs_next_get(THING));
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].qos, QoS::AtMostOnce);

    // The slot was given back, so the re-offered job is accepted.
    assert_eq!(
        dev.dispatcher.handle(&notification("job-late", &doc)),
        Dispatch::Forwarded(JobKind::Firmware)
    );
}

#[test]
fn second_firmware_job_is_dropped_while_busy() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    start_job(&mut dev, "job-1", "firmware.bin", &image(2048, 1));

    let doc = firmware_manifest("firmware.bin", 1024);
    assert_eq!(dev.dispatcher.handle(&notification("job-2", &doc)), Dispatch::Dropped);
    assert_eq!(
        dev.dispatcher.handle(&notification("job-1", &doc)),
        Dispatch::Duplicate
    );
    assert!(dev.statuses("job-2").is_empty());
}

#[test]
fn unacknowledged_subscribe_fails_job_and_leaves_no_handler() {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    dev.mqtt.fail_acks(true);
    start_job(&mut dev, "job-na", "firmware.bin", &image(2048, 1));

    assert_eq!(last_status(&dev, "job-na")["status"], "FAILED");
    assert!(!dev.router.filters().contains(&data_topic()));
    assert!(dev.block_requests().is_empty());
    assert_eq!(dev.ota.state(), OtaState::Ready);
}
