//! `critical-section` provider for the ESP-IDF build.
//!
//! `embassy-sync` queues and signals lock through `critical-section`.  The
//! agents, the connection task and the esp-mqtt receive thread are all
//! ordinary FreeRTOS tasks, so a process-wide reentrant mutex is enough;
//! interrupts never touch these primitives.

use core::cell::{Cell, RefCell};
use std::sync::{Mutex, MutexGuard, PoisonError};

static SECTION: Mutex<()> = Mutex::new(());

thread_local! {
    static DEPTH: Cell<u8> = const { Cell::new(0) };
    static HELD: RefCell<Option<MutexGuard<'static, ()>>> = const { RefCell::new(None) };
}

#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_acquire() -> u8 {
    DEPTH.with(|depth| {
        let d = depth.get();
        if d == 0 {
            let guard = SECTION.lock().unwrap_or_else(PoisonError::into_inner);
            HELD.with(|held| *held.borrow_mut() = Some(guard));
        }
        let d = d.saturating_add(1);
        depth.set(d);
        d
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_release(_token: u8) {
    DEPTH.with(|depth| {
        let d = depth.get();
        if d == 0 {
            return;
        }
        depth.set(d - 1);
        if d == 1 {
            HELD.with(|held| *held.borrow_mut() = None);
        }
    });
}
