//! The connection task: link loss, and what happens when the broker is
//! gone for good.

use core::time::Duration;

use fleetnode::mqtt::topic;
use fleetnode::ota::OtaState;

use crate::mock_cloud::{Device, OLD_CERT, THING, image};

fn booted() -> Device {
    let mut dev = Device::new(&image(16, 0));
    dev.boot();
    dev
}

fn drop_link(dev: &Device) {
    dev.transport.state.lock().unwrap().connected = false;
}

#[test]
fn healthy_link_is_left_alone() {
    let mut dev = booted();
    let attempts = dev.transport.attempts().len();

    assert_eq!(dev.supervisor.poll(Duration::ZERO), None);
    assert_eq!(dev.transport.attempts().len(), attempts);
    assert!(dev.mqtt.subscribed().is_empty());
}

#[test]
fn lost_link_is_recovered_and_resubscribed() {
    let mut dev = booted();
    drop_link(&dev);

    assert_eq!(dev.supervisor.poll(Duration::ZERO), None);
    dev.settle();

    assert!(dev.transport.is_connected());
    assert_eq!(dev.transport.attempts().last().map(String::as_str), Some(OLD_CERT));
    assert!(dev.mqtt.subscribed().contains(&topic::jobs_notify_next(THING)));
    assert_eq!(dev.system.restart_requests(), 0);
    assert_eq!(dev.ota.state(), OtaState::Ready);
}

#[test]
fn unreachable_broker_requests_restart() {
    let mut dev = booted();
    drop_link(&dev);
    dev.transport.state.lock().unwrap().accepted.clear();

    assert_eq!(dev.supervisor.poll(Duration::ZERO), None);
    assert!(!dev.transport.is_connected());
    assert_eq!(dev.system.restart_requests(), 1);
}
