//! Connection task: the single owner of the broker connection.
//!
//! ```text
//!  ReconnectSignal ─▶ suspend OTA ─▶ reconnect_with_staged ─▶ resubscribe
//!                                                │
//!                          CertInbox::on_rotation_outcome ◀┘ ─▶ resume OTA
//!
//!  link down ─▶ suspend OTA ─▶ recover ─▶ resubscribe ─▶ resume OTA
//! ```
//!
//! Suspend, resume and the rotation outcome are control events: an agent
//! that never sees one stays parked for good.  They are retried while the
//! agent drains its queue, and a delivery that still fails ends in a
//! device restart.

use core::time::Duration;
use std::sync::Arc;

use log::{error, info, warn};

use crate::app::ports::SystemPort;
use crate::cert::CertInbox;
use crate::error::ResourceError;
use crate::mqtt::connection::{ConnectionManager, ReconnectSignal, RotationOutcome};
use crate::mqtt::session::Session;
use crate::ota::OtaInbox;

/// Send attempts for one control event.
pub const DELIVERY_ATTEMPTS: u32 = 25;
/// Pause between attempts, long enough for an agent to take one event.
pub const DELIVERY_RETRY: Duration = Duration::from_millis(20);

/// Reports whether the broker session is still up.
pub type LinkCheck = Box<dyn Fn() -> bool + Send>;

/// What the connection task is built from.
pub struct SupervisorDeps {
    pub connection: ConnectionManager,
    pub session: Arc<Session>,
    pub reconnect: Arc<ReconnectSignal>,
    pub ota: Arc<OtaInbox>,
    pub cert: Arc<CertInbox>,
    pub system: Arc<dyn SystemPort>,
    pub link_up: LinkCheck,
}

pub struct ConnectionSupervisor {
    connection: ConnectionManager,
    session: Arc<Session>,
    reconnect: Arc<ReconnectSignal>,
    ota: Arc<OtaInbox>,
    cert: Arc<CertInbox>,
    system: Arc<dyn SystemPort>,
    link_up: LinkCheck,
}

impl ConnectionSupervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        Self {
            connection: deps.connection,
            session: deps.session,
            reconnect: deps.reconnect,
            ota: deps.ota,
            cert: deps.cert,
            system: deps.system,
            link_up: deps.link_up,
        }
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager {
        &mut self.connection
    }

    /// One pass of the task: serve a rotation request if one arrives
    /// within `timeout`, otherwise check the link.
    pub fn poll(&mut self, timeout: Duration) -> Option<RotationOutcome> {
        if self.reconnect.wait(timeout) {
            return self.rotate();
        }
        if !(self.link_up)() {
            self.recover();
        }
        None
    }

    pub fn run(mut self, timeout: Duration) -> ! {
        loop {
            self.poll(timeout);
        }
    }

    /// Swap to the staged identity and tell the rotation agent how it went.
    pub fn rotate(&mut self) -> Option<RotationOutcome> {
        self.deliver("ota suspend", || self.ota.suspend());
        let outcome = match self.connection.reconnect_with_staged() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Connection: rotation reconnect failed: {}", e);
                return None;
            }
        };
        self.resubscribe();
        info!("Connection: rotation outcome {:?}", outcome);
        self.deliver("rotation outcome", || self.cert.on_rotation_outcome(outcome));
        self.deliver("ota resume", || self.ota.resume());
        Some(outcome)
    }

    fn recover(&mut self) {
        self.deliver("ota suspend", || self.ota.suspend());
        if self.connection.recover().is_ok() {
            self.resubscribe();
            self.deliver("ota resume", || self.ota.resume());
        }
    }

    fn resubscribe(&self) {
        if let Err(e) = self.session.resubscribe_all() {
            error!("Connection: resubscribe failed: {}", e);
        }
    }

    /// Retry `send` while the receiving queue is full.  Restarts the
    /// device if the event never gets through.
    fn deliver(&self, what: &str, send: impl Fn() -> Result<(), ResourceError>) -> bool {
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match send() {
                Ok(()) => return true,
                Err(e) if attempt < DELIVERY_ATTEMPTS => {
                    warn!("Connection: {} not delivered ({}), retrying", what, e);
                    std::thread::sleep(DELIVERY_RETRY);
                }
                Err(e) => error!("Connection: {} lost after {} attempts: {}", what, attempt, e),
            }
        }
        self.system.restart();
        false
    }
}
