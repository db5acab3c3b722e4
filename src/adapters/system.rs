//! Restart and halt.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{error, warn};

use crate::app::ports::SystemPort;

/// Device control.  On host targets the calls are only counted.
#[derive(Debug, Default)]
pub struct DeviceControl {
    restarts: AtomicU32,
    halted: AtomicBool,
}

impl DeviceControl {
    pub const fn new() -> Self {
        Self {
            restarts: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        }
    }

    pub fn restart_requests(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }
}

impl SystemPort for DeviceControl {
    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        warn!("System: restarting");
        #[cfg(target_os = "espidf")]
        esp_idf_svc::hal::reset::restart();
    }

    fn halt(&self, reason: &str) {
        self.halted.store(true, Ordering::Relaxed);
        error!("System: halted: {}", reason);
        #[cfg(target_os = "espidf")]
        loop {
            std::thread::sleep(core::time::Duration::from_secs(3600));
        }
    }
}
