//! Credential rotation agent.
//!
//! ```text
//!  Init ─▶ Ready ─ReceivedJob─▶ ProcessingJob ─▶ ClientCertRenewal ─▶ RenewingClientCert
//!            ▲                                                            │
//!            │                                          WaitingSignedCertificate
//!            │                                                            │ signed cert
//!            │                                          ProcessingSignedCertificate
//!            │                                              │ stage + reconnect
//!            │                   RejectedSignedCertificate ─┤
//!            │                                              │ RevokeOldCertificate
//!            └──────────── accepted / rejected ──── RevokingOldCertificate
//! ```
//!
//! The agent never touches the transport.  It stages the new identity in
//! the shared credential set and asks the connection task to reconnect;
//! the connection task commits, verifies and reports back with
//! [`CertInbox::on_rotation_outcome`].

pub mod credentials;
pub mod messages;
pub mod onboarding;

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};

use crate::adapters::cert_store::CredentialStore;
use crate::app::ports::{CsrPort, QoS, SessionControl, StorageError};
use crate::config::AgentConfig;
use crate::error::{Error, ResourceError};
use crate::events::{Event, EventQueue, JobDocument};
use crate::fsm::{Runner, StateMatch, Transition};
use crate::jobs::status::{self, JobStatus, StatusDetails};
use crate::jobs::{JobSink, JobSlot};
use crate::mqtt::connection::{RotationOutcome, SharedCredentials, SharedStorage};
use crate::mqtt::router::InboundHandler;
use crate::mqtt::session::Session;
use crate::mqtt::topic;
use crate::pool::BlockPool;

use self::credentials::Identity;
use self::messages::{
    csr_request_payload, parse_rotation_job, parse_signed_certificate, rejection_summary,
    revoke_payload,
};

const RENEWED: StatusDetails<'static> = StatusDetails::ok("200", "Successful certificate renewal");
const RENEWAL_FAILED: StatusDetails<'static> = StatusDetails::error("400", "Failed to renewal certificate");
const REVOKE_FAILED: StatusDetails<'static> = StatusDetails::error("400", "Failed to revoke certificate");
const STORE_FAILED: StatusDetails<'static> = StatusDetails::error("400", "Failed to store certificate");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    Init,
    Ready,
    ProcessingJob,
    ClientCertRenewal,
    RenewingClientCert,
    WaitingSignedCertificate,
    ProcessingSignedCertificate,
    RevokingOldCertificate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertEvent {
    Start,
    ReceivedJob,
    ClientCertificateRenewal,
    GenerateCsr,
    WaitSignedCertificate,
    ReceivedSignedCertificate,
    RejectedCertificateSigningRequest,
    RevokeOldCertificate,
    RejectedSignedCertificate,
    AcceptedOldCertificateRevoke,
    RejectedOldCertificateRevoke,
}

pub type CertQueue = EventQueue<CertEvent>;

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────
// Inbound side
// ───────────────────────────────────────────────────────────────

pub struct CertInbox {
    queue: CertQueue,
    slot: JobSlot,
    pool: Arc<BlockPool>,
    acquire_timeout: Duration,
}

impl CertInbox {
    pub fn new(pool: Arc<BlockPool>, acquire_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue: EventQueue::new("cert"),
            slot: JobSlot::new(),
            pool,
            acquire_timeout,
        })
    }

    pub fn queue(&self) -> &CertQueue {
        &self.queue
    }

    /// Result of the rotation reconnect, from the connection task.
    pub fn on_rotation_outcome(&self, outcome: RotationOutcome) -> Result<(), ResourceError> {
        let kind = match outcome {
            RotationOutcome::Adopted => CertEvent::RevokeOldCertificate,
            RotationOutcome::RolledBack => CertEvent::RejectedSignedCertificate,
        };
        self.queue.send(Event::signal(kind))
    }
}

/// Which response a certificate service topic carries.
fn classify_response(topic_name: &str) -> Option<CertEvent> {
    let accepted = topic::is_accepted(topic_name);
    if topic_name.contains("/create-from-csr/") {
        Some(if accepted {
            CertEvent::ReceivedSignedCertificate
        } else {
            CertEvent::RejectedCertificateSigningRequest
        })
    } else if topic_name.contains("/revoke/") {
        Some(if accepted {
            CertEvent::AcceptedOldCertificateRevoke
        } else {
            CertEvent::RejectedOldCertificateRevoke
        })
    } else {
        None
    }
}

impl JobSink for CertInbox {
    fn name(&self) -> &'static str {
        "cert"
    }

    fn slot(&self) -> &JobSlot {
        &self.slot
    }

    fn deliver(&self, job: JobDocument) -> Result<(), ResourceError> {
        self.queue.send(Event::job(CertEvent::ReceivedJob, job))
    }
}

impl InboundHandler for CertInbox {
    fn on_publish(&self, topic_name: &str, payload: &[u8]) {
        let Some(kind) = classify_response(topic_name) else {
            warn!("Cert: unexpected publish on {}", topic_name);
            return;
        };
        let mut buf = match self.pool.acquire(self.acquire_timeout) {
            Ok(b) => b,
            Err(e) => {
                error!("Cert: dropping {:?}: {}", kind, e);
                return;
            }
        };
        if let Err(e) = buf.fill(payload) {
            error!("Cert: {:?} payload of {} bytes dropped: {}", kind, payload.len(), e);
            return;
        }
        let _ = self.queue.send(Event::block(kind, buf));
    }
}

// ───────────────────────────────────────────────────────────────
// Agent context
// ───────────────────────────────────────────────────────────────

pub struct CertContext {
    session: Arc<Session>,
    inbox: Arc<CertInbox>,
    credentials: SharedCredentials,
    storage: SharedStorage,
    csr: Box<dyn CsrPort>,
    control: Arc<dyn SessionControl>,
    subject: String,
    job_id: Option<String>,
    pending_key: Option<String>,
}

impl CertContext {
    fn emit(&self, kind: CertEvent) -> bool {
        self.inbox.queue.send(Event::signal(kind)).is_ok()
    }

    fn csr_topics(&self) -> [String; 2] {
        let thing = self.session.thing_name();
        [topic::csr_accepted(thing), topic::csr_rejected(thing)]
    }

    fn revoke_topics(&self) -> [String; 2] {
        let thing = self.session.thing_name();
        [topic::revoke_accepted(thing), topic::revoke_rejected(thing)]
    }

    fn subscribe(&self, filters: &[String; 2]) -> Result<(), Error> {
        let handler: Arc<dyn InboundHandler> = self.inbox.clone();
        self.session
            .subscribe(&[filters[0].as_str(), filters[1].as_str()], &handler)
    }

    fn unsubscribe(&self, filters: &[String; 2]) {
        if let Err(e) = self.session.unsubscribe(&[filters[0].as_str(), filters[1].as_str()]) {
            warn!("Cert: unsubscribe failed: {}", e);
        }
    }

    fn report(&self, status: JobStatus, details: Option<StatusDetails<'_>>) {
        if let Some(id) = self.job_id.as_deref() {
            let _ = status::report(&self.session, id, status, details, QoS::AtLeastOnce);
        }
    }

    /// Report the terminal status and free the agent for the next job.
    fn finish(&mut self, status: JobStatus, details: Option<StatusDetails<'_>>) -> CertState {
        self.report(status, details);
        self.pending_key = None;
        self.job_id = None;
        self.inbox.slot.release();
        CertState::Ready
    }

    fn renewal_failed(&mut self) -> CertState {
        let topics = self.csr_topics();
        self.unsubscribe(&topics);
        lock(&self.credentials).discard_staged();
        self.finish(JobStatus::Failed, Some(RENEWAL_FAILED))
    }

    /// Persist the identity now in use so a restart comes back with it.
    fn persist_active(&self) -> Result<(), StorageError> {
        let Some(identity) = lock(&self.credentials).active().cloned() else {
            warn!("Cert: no active identity to persist");
            return Err(StorageError::NotFound);
        };
        let mut storage = lock(&self.storage);
        CredentialStore::new(&mut *storage).persist_identity(&identity)?;
        info!("Cert: stored identity {}", identity.certificate_id);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Transition actions
// ───────────────────────────────────────────────────────────────

fn start(_: &mut CertContext, _: Event<CertEvent>) -> CertState {
    CertState::Ready
}

fn receive_job(ctx: &mut CertContext, ev: Event<CertEvent>) -> CertState {
    let Some(job) = ev.take_job() else {
        return CertState::Ready;
    };
    ctx.job_id = Some(job.id().to_owned());

    let accepted = match parse_rotation_job(&job.document) {
        Ok(parsed) if parsed.targets_client_identity() => true,
        Ok(parsed) => {
            warn!(
                "Cert: job {} targets {} / {}, not this device",
                job.id(),
                parsed.operation,
                parsed.cert_name
            );
            false
        }
        Err(e) => {
            warn!("Cert: job {} unreadable: {}", job.id(), e);
            false
        }
    };
    if !accepted {
        return ctx.finish(JobStatus::Rejected, None);
    }

    ctx.report(JobStatus::InProgress, None);
    if ctx.emit(CertEvent::ClientCertificateRenewal) {
        CertState::ProcessingJob
    } else {
        ctx.finish(JobStatus::Failed, Some(RENEWAL_FAILED))
    }
}

fn start_renewal(ctx: &mut CertContext, _: Event<CertEvent>) -> CertState {
    let topics = ctx.csr_topics();
    if let Err(e) = ctx.subscribe(&topics) {
        error!("Cert: cannot subscribe to signing responses: {}", e);
        return ctx.finish(JobStatus::Failed, Some(RENEWAL_FAILED));
    }
    if ctx.emit(CertEvent::GenerateCsr) {
        CertState::ClientCertRenewal
    } else {
        ctx.renewal_failed()
    }
}

fn submit_csr(ctx: &mut CertContext, _: Event<CertEvent>) -> CertState {
    let material = match ctx.csr.generate_keypair_and_csr(&ctx.subject) {
        Ok(m) => m,
        Err(e) => {
            error!("Cert: CSR generation failed: {}", e);
            return ctx.renewal_failed();
        }
    };
    ctx.pending_key = Some(material.private_key_pem);

    // Queued ahead of the publish so a fast response cannot overtake it.
    if !ctx.emit(CertEvent::WaitSignedCertificate) {
        return ctx.renewal_failed();
    }
    let topic_name = topic::csr_create(ctx.session.thing_name());
    let payload = csr_request_payload(&material.csr_pem);
    match ctx.session.publish(&topic_name, &payload, QoS::AtLeastOnce) {
        Ok(()) => {
            info!("Cert: signing request submitted ({} bytes)", payload.len());
            CertState::RenewingClientCert
        }
        Err(e) => {
            error!("Cert: signing request not delivered: {}", e);
            ctx.renewal_failed()
        }
    }
}

fn await_certificate(_: &mut CertContext, _: Event<CertEvent>) -> CertState {
    CertState::WaitingSignedCertificate
}

fn ingest_certificate(ctx: &mut CertContext, ev: Event<CertEvent>) -> CertState {
    let parsed = ev
        .take_block()
        .ok_or(crate::error::MalformedError::MissingField("certificatePem"))
        .and_then(|buf| parse_signed_certificate(buf.as_slice()));
    let signed = match parsed {
        Ok(s) => s,
        Err(e) => {
            error!("Cert: signed certificate unusable: {}", e);
            return ctx.renewal_failed();
        }
    };
    let Some(private_key) = ctx.pending_key.take() else {
        error!("Cert: signed certificate without a pending key");
        return ctx.renewal_failed();
    };

    info!("Cert: received certificate {}", signed.certificate_id);
    lock(&ctx.credentials).stage(Identity {
        certificate: signed.certificate_pem,
        private_key,
        certificate_id: signed.certificate_id,
    });

    match ctx.control.request_reconnect() {
        Ok(()) => CertState::ProcessingSignedCertificate,
        Err(e) => {
            error!("Cert: reconnect request failed: {}", e);
            ctx.renewal_failed()
        }
    }
}

fn csr_rejected(ctx: &mut CertContext, ev: Event<CertEvent>) -> CertState {
    if let Some(buf) = ev.take_block() {
        error!("Cert: signing request rejected: {}", rejection_summary(buf.as_slice()));
    }
    ctx.renewal_failed()
}

fn new_identity_rejected(ctx: &mut CertContext, _: Event<CertEvent>) -> CertState {
    error!("Cert: new certificate did not authenticate, previous identity kept");
    ctx.renewal_failed()
}

fn revoke_old(ctx: &mut CertContext, _: Event<CertEvent>) -> CertState {
    let csr = ctx.csr_topics();
    ctx.unsubscribe(&csr);

    // The old certificate is only revoked once the new one is stored;
    // until then a restart must still be able to come back with the old.
    if let Err(e) = ctx.persist_active() {
        error!("Cert: storing new identity failed, old certificate kept valid: {}", e);
        lock(&ctx.credentials).clear_retired();
        return ctx.finish(JobStatus::Failed, Some(STORE_FAILED));
    }

    let retired = lock(&ctx.credentials)
        .retired_certificate_id()
        .map(str::to_owned);
    let Some(old_id) = retired else {
        warn!("Cert: previous certificate id unknown, cannot revoke");
        return ctx.finish(JobStatus::Failed, Some(REVOKE_FAILED));
    };

    let revoke = ctx.revoke_topics();
    if let Err(e) = ctx.subscribe(&revoke) {
        error!("Cert: cannot subscribe to revoke responses: {}", e);
        lock(&ctx.credentials).clear_retired();
        return ctx.finish(JobStatus::Failed, Some(REVOKE_FAILED));
    }

    let topic_name = topic::cert_revoke(ctx.session.thing_name());
    match ctx
        .session
        .publish(&topic_name, &revoke_payload(&old_id), QoS::AtLeastOnce)
    {
        Ok(()) => {
            info!("Cert: revoking {}", old_id);
            CertState::RevokingOldCertificate
        }
        Err(e) => {
            error!("Cert: revoke request not delivered: {}", e);
            ctx.unsubscribe(&revoke);
            lock(&ctx.credentials).clear_retired();
            ctx.finish(JobStatus::Failed, Some(REVOKE_FAILED))
        }
    }
}

fn revoke_accepted(ctx: &mut CertContext, _: Event<CertEvent>) -> CertState {
    let topics = ctx.revoke_topics();
    ctx.unsubscribe(&topics);
    lock(&ctx.credentials).clear_retired();
    info!("Cert: rotation complete");
    ctx.finish(JobStatus::Succeeded, Some(RENEWED))
}

/// The new certificate stays in use; only the cleanup failed.
fn revoke_rejected(ctx: &mut CertContext, ev: Event<CertEvent>) -> CertState {
    let topics = ctx.revoke_topics();
    ctx.unsubscribe(&topics);
    if let Some(buf) = ev.take_block() {
        error!("Cert: revoke rejected: {}", rejection_summary(buf.as_slice()));
    }
    lock(&ctx.credentials).clear_retired();
    ctx.finish(JobStatus::Failed, Some(REVOKE_FAILED))
}

use CertEvent as E;
use CertState as S;

const AWAITING_SIGNATURE: &[CertState] = &[S::RenewingClientCert, S::WaitingSignedCertificate];

static TABLE: &[Transition<CertState, CertEvent, CertContext>] = &[
    Transition { from: StateMatch::Is(S::Init), on: E::Start, action: start },
    Transition { from: StateMatch::Is(S::Ready), on: E::ReceivedJob, action: receive_job },
    Transition { from: StateMatch::Is(S::ProcessingJob), on: E::ClientCertificateRenewal, action: start_renewal },
    Transition { from: StateMatch::Is(S::ClientCertRenewal), on: E::GenerateCsr, action: submit_csr },
    Transition { from: StateMatch::Is(S::RenewingClientCert), on: E::WaitSignedCertificate, action: await_certificate },
    Transition { from: StateMatch::OneOf(AWAITING_SIGNATURE), on: E::ReceivedSignedCertificate, action: ingest_certificate },
    Transition { from: StateMatch::OneOf(AWAITING_SIGNATURE), on: E::RejectedCertificateSigningRequest, action: csr_rejected },
    Transition { from: StateMatch::Is(S::ProcessingSignedCertificate), on: E::RevokeOldCertificate, action: revoke_old },
    Transition { from: StateMatch::Is(S::ProcessingSignedCertificate), on: E::RejectedSignedCertificate, action: new_identity_rejected },
    Transition { from: StateMatch::Is(S::RevokingOldCertificate), on: E::AcceptedOldCertificateRevoke, action: revoke_accepted },
    Transition { from: StateMatch::Is(S::RevokingOldCertificate), on: E::RejectedOldCertificateRevoke, action: revoke_rejected },
];

// ───────────────────────────────────────────────────────────────
// Agent
// ───────────────────────────────────────────────────────────────

/// Collaborators the rotation agent is built from.
pub struct CertDeps {
    pub session: Arc<Session>,
    pub inbox: Arc<CertInbox>,
    pub credentials: SharedCredentials,
    pub storage: SharedStorage,
    pub csr: Box<dyn CsrPort>,
    pub control: Arc<dyn SessionControl>,
}

pub struct RotationAgent {
    runner: Runner<CertState, CertEvent, CertContext>,
    ctx: CertContext,
    queue_timeout: Duration,
}

impl RotationAgent {
    pub fn new(deps: CertDeps, config: &AgentConfig) -> Self {
        Self {
            runner: Runner::new("cert", TABLE, CertState::Init),
            ctx: CertContext {
                session: deps.session,
                inbox: deps.inbox,
                credentials: deps.credentials,
                storage: deps.storage,
                csr: deps.csr,
                control: deps.control,
                subject: config.csr_subject.as_str().to_owned(),
                job_id: None,
                pending_key: None,
            },
            queue_timeout: config.queue_timeout(),
        }
    }

    pub fn start(&self) -> Result<(), ResourceError> {
        self.ctx.inbox.queue.send(Event::signal(CertEvent::Start))
    }

    pub fn state(&self) -> CertState {
        self.runner.state()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.ctx.job_id.as_deref()
    }

    pub fn step(&mut self, timeout: Duration) -> bool {
        let inbox = Arc::clone(&self.ctx.inbox);
        self.runner.step(&mut self.ctx, inbox.queue(), timeout)
    }

    pub fn run_until_idle(&mut self) -> usize {
        let inbox = Arc::clone(&self.ctx.inbox);
        let mut total = 0;
        loop {
            let n = self.runner.drain(&mut self.ctx, inbox.queue());
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    pub fn run(mut self) -> ! {
        let timeout = self.queue_timeout;
        loop {
            self.step(timeout);
        }
    }
}
