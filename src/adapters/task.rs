//! Agent task spawning.
//!
//! Each agent, and the connection owner, runs as its own thread.  On
//! ESP-IDF `std::thread` is a pthread over a FreeRTOS task, and
//! `esp_pthread_set_cfg()` sets affinity, priority and stack for the
//! *next* thread the calling thread creates, so configure-then-spawn must
//! not interleave with other spawns from the same thread.

use std::io;
use std::thread::JoinHandle;

use log::info;

/// ESP32 CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// PRO_CPU: Wi-Fi, lwIP and esp-mqtt live here.
    Pro = 0,
    /// APP_CPU: agent work.
    App = 1,
}

/// Placement and sizing of one agent task.
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec {
    /// Must end in `\0`; the IDF keeps the pointer.
    pub name: &'static str,
    pub core: Core,
    pub priority: u8,
    pub stack_kb: usize,
}

impl TaskSpec {
    fn display_name(&self) -> &'static str {
        self.name.trim_end_matches('\0')
    }
}

pub const OTA_TASK: TaskSpec = TaskSpec {
    name: "ota-agent\0",
    core: Core::App,
    priority: 5,
    stack_kb: 16,
};

pub const CERT_TASK: TaskSpec = TaskSpec {
    name: "cert-agent\0",
    core: Core::App,
    priority: 5,
    stack_kb: 12,
};

pub const CONNECTION_TASK: TaskSpec = TaskSpec {
    name: "connection\0",
    core: Core::Pro,
    priority: 6,
    stack_kb: 8,
};

#[cfg(target_os = "espidf")]
pub fn spawn(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> io::Result<JoinHandle<()>> {
    // SAFETY: the config is copied by the IDF before the next pthread_create.
    let ret = unsafe {
        let mut cfg = esp_idf_svc::sys::esp_create_default_pthread_config();
        cfg.pin_to_core = spec.core as i32;
        cfg.prio = i32::from(spec.priority);
        cfg.stack_size = (spec.stack_kb * 1024) as i32;
        cfg.thread_name = spec.name.as_ptr().cast();
        esp_idf_svc::sys::esp_pthread_set_cfg(&cfg)
    };
    if ret != esp_idf_svc::sys::ESP_OK {
        return Err(io::Error::other(format!("esp_pthread_set_cfg failed: {ret}")));
    }

    info!(
        "Spawning '{}' on {:?} (pri={}, stack={}KB)",
        spec.display_name(),
        spec.core,
        spec.priority,
        spec.stack_kb
    );
    std::thread::Builder::new()
        .name(spec.display_name().into())
        .spawn(f)
}

/// Host fallback: plain named thread, no pinning.
#[cfg(not(target_os = "espidf"))]
pub fn spawn(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> io::Result<JoinHandle<()>> {
    info!("Spawning '{}' (sim, stack={}KB)", spec.display_name(), spec.stack_kb);
    std::thread::Builder::new()
        .name(spec.display_name().into())
        .stack_size(spec.stack_kb * 1024)
        .spawn(f)
}
