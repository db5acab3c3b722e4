//! Fleet provisioning: trade the factory claim identity for a device
//! identity of its own.
//!
//! ```text
//!  claim session ─▶ create-from-csr ─accepted─▶ RegisterThing ─accepted─▶ store
//!                        │ rejected / silent          │ rejected / silent
//!                        └────────────▶ Err ◀─────────┘
//! ```
//!
//! Runs once, before the agents start, on a session authenticated with the
//! claim certificate.  Onboarding stays enabled until the new identity and
//! thing name are stored, so an interrupted run is repeated on next boot.

use core::fmt;
use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{error, info, warn};

use crate::adapters::cert_store::CredentialStore;
use crate::app::ports::{CryptoError, CsrPort, QoS, StorageError};
use crate::config::AgentConfig;
use crate::error::{Error, MalformedError, ProtocolError};
use crate::events::{Event, EventQueue};
use crate::mqtt::connection::SharedStorage;
use crate::mqtt::router::InboundHandler;
use crate::mqtt::session::Session;
use crate::mqtt::topic;
use crate::pool::BlockPool;

use super::credentials::Identity;
use super::messages::{
    csr_request_payload, parse_created_certificate, parse_registered_thing, register_thing_payload,
    rejection_summary,
};

/// Provisioning template the cloud registers new devices with.
pub const PROVISIONING_TEMPLATE: &str = "FleetProvisioning-prod";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningEvent {
    CertificateCreated,
    CertificateRejected,
    ThingRegistered,
    RegistrationRejected,
}

impl ProvisioningEvent {
    fn is_rejection(self) -> bool {
        matches!(self, Self::CertificateRejected | Self::RegistrationRejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingError {
    /// Key pair or signing request could not be generated.
    Keys(CryptoError),
    /// The exchange with the provisioning service failed.
    Exchange(Error),
    /// Credentials were issued but could not be stored.
    Store(StorageError),
}

impl fmt::Display for OnboardingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keys(e) => write!(f, "key generation: {e}"),
            Self::Exchange(e) => write!(f, "provisioning exchange: {e}"),
            Self::Store(e) => write!(f, "storing credentials: {e}"),
        }
    }
}

impl From<Error> for OnboardingError {
    fn from(e: Error) -> Self {
        Self::Exchange(e)
    }
}

impl From<ProtocolError> for OnboardingError {
    fn from(e: ProtocolError) -> Self {
        Self::Exchange(e.into())
    }
}

impl From<MalformedError> for OnboardingError {
    fn from(e: MalformedError) -> Self {
        Self::Exchange(e.into())
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────
// Inbound side
// ───────────────────────────────────────────────────────────────

pub struct ProvisioningInbox {
    queue: EventQueue<ProvisioningEvent>,
    pool: Arc<BlockPool>,
    acquire_timeout: Duration,
}

impl ProvisioningInbox {
    pub fn new(pool: Arc<BlockPool>, acquire_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue: EventQueue::new("provisioning"),
            pool,
            acquire_timeout,
        })
    }
}

fn classify_response(topic_name: &str) -> Option<ProvisioningEvent> {
    let accepted = topic::is_accepted(topic_name);
    if topic_name.starts_with(topic::FLEET_CSR_CREATE) {
        Some(if accepted {
            ProvisioningEvent::CertificateCreated
        } else {
            ProvisioningEvent::CertificateRejected
        })
    } else if topic_name.starts_with("$aws/provisioning-templates/") {
        Some(if accepted {
            ProvisioningEvent::ThingRegistered
        } else {
            ProvisioningEvent::RegistrationRejected
        })
    } else {
        None
    }
}

impl InboundHandler for ProvisioningInbox {
    fn on_publish(&self, topic_name: &str, payload: &[u8]) {
        let Some(kind) = classify_response(topic_name) else {
            warn!("Onboarding: unexpected publish on {}", topic_name);
            return;
        };
        let mut buf = match self.pool.acquire(self.acquire_timeout) {
            Ok(b) => b,
            Err(e) => {
                error!("Onboarding: dropping {:?}: {}", kind, e);
                return;
            }
        };
        if let Err(e) = buf.fill(payload) {
            error!("Onboarding: {:?} payload of {} bytes dropped: {}", kind, payload.len(), e);
            return;
        }
        // A dropped response surfaces as a timeout in the waiting step.
        let _ = self.queue.send(Event::block(kind, buf));
    }
}

// ───────────────────────────────────────────────────────────────
// Provisioning run
// ───────────────────────────────────────────────────────────────

/// What provisioning produced, already stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub thing_name: String,
    pub certificate_id: String,
}

pub struct OnboardingDeps {
    pub session: Arc<Session>,
    pub inbox: Arc<ProvisioningInbox>,
    pub storage: SharedStorage,
    pub csr: Box<dyn CsrPort>,
    /// Sent as the template's `MacAddress` parameter.
    pub mac_address: String,
    /// How long to wait for each service response.
    pub response_timeout: Duration,
}

pub struct Onboarding {
    session: Arc<Session>,
    inbox: Arc<ProvisioningInbox>,
    storage: SharedStorage,
    csr: Box<dyn CsrPort>,
    mac_address: String,
    subject: String,
    template: &'static str,
    response_timeout: Duration,
}

impl Onboarding {
    pub fn new(deps: OnboardingDeps, config: &AgentConfig) -> Self {
        Self {
            session: deps.session,
            inbox: deps.inbox,
            storage: deps.storage,
            csr: deps.csr,
            mac_address: deps.mac_address,
            subject: config.csr_subject.as_str().to_owned(),
            template: PROVISIONING_TEMPLATE,
            response_timeout: deps.response_timeout,
        }
    }

    fn topics(&self) -> [String; 4] {
        [
            topic::fleet_csr_accepted(),
            topic::fleet_csr_rejected(),
            topic::fleet_register_accepted(self.template),
            topic::fleet_register_rejected(self.template),
        ]
    }

    /// Obtain, register and store a device identity.  On success the
    /// onboarding flag is cleared and the device should reconnect with
    /// the stored credentials.
    pub fn provision(&mut self) -> Result<Provisioned, OnboardingError> {
        let topics = self.topics();
        let filters: Vec<&str> = topics.iter().map(String::as_str).collect();
        let handler: Arc<dyn InboundHandler> = self.inbox.clone();
        self.session.subscribe(&filters, &handler)?;

        let exchanged = self.exchange();
        if let Err(e) = self.session.unsubscribe(&filters) {
            warn!("Onboarding: unsubscribe failed: {}", e);
        }
        let (identity, thing_name) = exchanged?;

        self.store(&identity, &thing_name)
            .map_err(OnboardingError::Store)?;
        info!("Onboarding: provisioned as '{}'", thing_name);
        Ok(Provisioned {
            thing_name,
            certificate_id: identity.certificate_id,
        })
    }

    fn exchange(&mut self) -> Result<(Identity, String), OnboardingError> {
        let material = self
            .csr
            .generate_keypair_and_csr(&self.subject)
            .map_err(OnboardingError::Keys)?;
        self.session.publish(
            topic::FLEET_CSR_CREATE,
            &csr_request_payload(&material.csr_pem),
            QoS::AtMostOnce,
        )?;
        let created = self.await_response(ProvisioningEvent::CertificateCreated, parse_created_certificate)?;
        info!("Onboarding: certificate {} issued", created.certificate.certificate_id);

        self.session.publish(
            &topic::fleet_register(self.template),
            &register_thing_payload(&created.ownership_token, &self.mac_address),
            QoS::AtMostOnce,
        )?;
        let thing_name = self.await_response(ProvisioningEvent::ThingRegistered, parse_registered_thing)?;

        let identity = Identity {
            certificate: created.certificate.certificate_pem,
            private_key: material.private_key_pem,
            certificate_id: created.certificate.certificate_id,
        };
        Ok((identity, thing_name))
    }

    /// Wait for `wanted`, skipping stray responses to the other request.
    fn await_response<T>(
        &self,
        wanted: ProvisioningEvent,
        parse: fn(&[u8]) -> Result<T, MalformedError>,
    ) -> Result<T, OnboardingError> {
        let deadline = Instant::now() + self.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(ev) = self.inbox.queue.receive(remaining) else {
                error!("Onboarding: no answer to {:?} request", wanted);
                return Err(ProtocolError::ResponseTimeout.into());
            };
            let kind = ev.kind;
            let Some(buf) = ev.take_block() else {
                continue;
            };
            if kind == wanted {
                return Ok(parse(buf.as_slice())?);
            }
            if kind.is_rejection() {
                error!("Onboarding: {:?}: {}", kind, rejection_summary(buf.as_slice()));
                return Err(ProtocolError::Rejected.into());
            }
            warn!("Onboarding: ignoring stray {:?}", kind);
        }
    }

    /// The flag goes last: until it is cleared the next boot provisions again.
    fn store(&self, identity: &Identity, thing_name: &str) -> Result<(), StorageError> {
        let mut storage = lock(&self.storage);
        let mut store = CredentialStore::new(&mut *storage);
        store.persist_identity(identity)?;
        store.store_thing_name(thing_name)?;
        store.disable_onboarding()
    }
}
