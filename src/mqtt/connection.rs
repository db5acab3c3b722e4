//! Broker connection lifecycle.
//!
//! Owns the transport and is the only code that reads the credential set
//! to authenticate.  Two entry points matter:
//!
//! - [`ConnectionManager::recover`]: connection lost, retry with backoff,
//!   request a device restart when every attempt fails.
//! - [`ConnectionManager::reconnect_with_staged`]: credential rotation.
//!
//! ```text
//!  disconnect ─▶ commit staged ─▶ connect once ─ ok ──▶ confirm ─▶ Adopted
//!                                     │
//!                                     └ fail ─▶ rollback ─▶ reload stored
//!                                                   │
//!                                   connect with backoff ─ ok ──▶ RolledBack
//!                                                   │
//!                                                   └ fail ─▶ halt (IdentityAmbiguity)
//! ```

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{error, info, warn};

use super::backoff::Backoff;
use crate::adapters::cert_store::CredentialStore;
use crate::app::ports::{
    SessionControl, StoragePort, SystemPort, TransportError, TransportPort,
};
use crate::cert::credentials::CredentialSet;
use crate::config::AgentConfig;
use crate::error::{Error, ProtocolError};

pub type SharedCredentials = Arc<Mutex<CredentialSet>>;
pub type SharedStorage = Arc<Mutex<dyn StoragePort>>;

/// Result of a rotation reconnect that kept the device online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The new identity authenticated and is now committed.
    Adopted,
    /// The new identity failed; the previous one is back in use.
    RolledBack,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct ConnectionManager {
    transport: Box<dyn TransportPort>,
    credentials: SharedCredentials,
    storage: SharedStorage,
    system: Arc<dyn SystemPort>,
    port: u16,
    backoff: Backoff,
    connected: bool,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn TransportPort>,
        credentials: SharedCredentials,
        storage: SharedStorage,
        system: Arc<dyn SystemPort>,
        cfg: &AgentConfig,
        seed: u64,
    ) -> Self {
        Self {
            transport,
            credentials,
            storage,
            system,
            port: cfg.mqtt_port,
            backoff: Backoff::from_config(cfg, seed),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect_once(&mut self) -> Result<(), TransportError> {
        let creds = lock(&self.credentials);
        let Some(identity) = creds.tls_identity() else {
            warn!("Connection: no committed identity");
            return Err(TransportError::AuthRejected);
        };
        self.transport.connect(&creds.endpoint, self.port, &identity)
    }

    /// Connect, retrying with jittered exponential backoff.
    pub fn connect_with_backoff(&mut self) -> Result<(), Error> {
        self.backoff.reset();
        loop {
            match self.connect_once() {
                Ok(()) => {
                    self.connected = true;
                    info!("Connection: connected");
                    return Ok(());
                }
                Err(e) => {
                    let Some(delay) = self.backoff.next_delay() else {
                        error!(
                            "Connection: giving up after {} attempts",
                            self.backoff.attempts()
                        );
                        return Err(ProtocolError::ReconnectExhausted.into());
                    };
                    info!(
                        "Connection: attempt {} failed ({}), retrying in {:?}",
                        self.backoff.attempts(),
                        e,
                        delay
                    );
                    sleep(delay);
                }
            }
        }
    }

    /// The session dropped.  Reconnect or request a restart.
    pub fn recover(&mut self) -> Result<(), Error> {
        warn!("Connection: lost, reconnecting");
        self.disconnect();
        self.connect_with_backoff().inspect_err(|_| {
            error!("Connection: control plane unreachable, restarting");
            self.system.restart();
        })
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.connected = false;
    }

    /// Tear the session down and bring it back up under the staged identity.
    pub fn reconnect_with_staged(&mut self) -> Result<RotationOutcome, Error> {
        self.disconnect();
        if !lock(&self.credentials).commit_staged() {
            warn!("Connection: rotation reconnect with nothing staged");
        }

        match self.connect_once() {
            Ok(()) => {
                lock(&self.credentials).confirm();
                self.connected = true;
                info!("Connection: new identity authenticated");
                return Ok(RotationOutcome::Adopted);
            }
            Err(e) => warn!("Connection: new identity rejected ({}), rolling back", e),
        }

        self.disconnect();
        lock(&self.credentials).rollback();
        self.reload_stored_identity();

        match self.connect_with_backoff() {
            Ok(()) => Ok(RotationOutcome::RolledBack),
            Err(_) => {
                error!("Connection: neither new nor stored identity authenticates");
                self.system.halt("no credential authenticates");
                Err(Error::IdentityAmbiguity)
            }
        }
    }

    fn reload_stored_identity(&mut self) {
        let stored = {
            let mut storage = lock(&self.storage);
            CredentialStore::new(&mut *storage).load_identity()
        };
        match stored {
            Ok(Some(identity)) => lock(&self.credentials).restore_committed(identity),
            Ok(None) => warn!("Connection: no stored identity to reload"),
            Err(e) => warn!("Connection: reloading stored identity failed: {}", e),
        }
    }
}

#[cfg(not(test))]
fn sleep(d: Duration) {
    std::thread::sleep(d);
}

#[cfg(test)]
fn sleep(_: Duration) {}

// ───────────────────────────────────────────────────────────────
// Reconnect requests
// ───────────────────────────────────────────────────────────────

/// Raised by the credential agent, consumed by the connection task.
pub struct ReconnectSignal {
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl ReconnectSignal {
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    /// Wait up to `timeout` for a request.  Consumes it.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.signal.try_take().is_some() {
            return true;
        }
        futures_lite::future::block_on(futures_lite::future::or(
            async {
                self.signal.wait().await;
                true
            },
            async {
                async_io_mini::Timer::after(timeout).await;
                false
            },
        ))
    }

    pub fn is_pending(&self) -> bool {
        self.signal.signaled()
    }
}

impl Default for ReconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl for ReconnectSignal {
    fn request_reconnect(&self) -> Result<(), ProtocolError> {
        info!("Connection: reconnect requested");
        self.signal.signal(());
        Ok(())
    }
}
