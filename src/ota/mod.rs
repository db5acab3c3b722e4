//! Firmware update agent.
//!
//! ```text
//!  Init ─Start─▶ Ready ─ReceivedJob─▶ ProcessingJob ─ProcessJob─┐
//!                  ▲                                            │
//!                  │                              RequestingBlock ◀──┐
//!                  │                                    │ RequestBlock│
//!                  │                                    ▼             │
//!                  │                              ProcessingBlock ────┘
//!                  │                                    │ last block   ReceivedBlock
//!                  │                                    ▼
//!                  └──────────── FinishDownload ── DownloadFinalized
//!
//!  any ─Suspend─▶ Suspended ─Resume─▶ (where the download left off)
//! ```
//!
//! Blocks are fetched one at a time, always asking for the lowest block
//! not yet received.  Full images are written straight into the update
//! region; delta patches are staged and materialized by the patch engine
//! once the download completes.
//!
//! Every terminal outcome is reported on the job's status topic.  On
//! success the device restarts into the new image.

pub mod block;
pub mod context;
pub mod manifest;

use core::cell::RefCell;
use core::time::Duration;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::app::ports::{ImageStore, QoS, Region, SystemPort};
use crate::config::AgentConfig;
use crate::error::{Error, IntegrityError, ResourceError};
use crate::events::{Event, EventQueue, JobDocument};
use crate::fsm::{Runner, StateMatch, Transition};
use crate::jobs::status::{self, JobStatus, StatusDetails};
use crate::jobs::{JobSink, JobSlot};
use crate::mqtt::router::InboundHandler;
use crate::mqtt::session::Session;
use crate::mqtt::topic;
use crate::patch;
use crate::patch::stream::RegionStream;
use crate::pool::BlockPool;

use self::block::{decode_block, request_payload};
use self::context::{BlockCheck, ImageKind, UpdateContext};
use self::manifest::parse_manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Init,
    Ready,
    ProcessingJob,
    RequestingBlock,
    ProcessingBlock,
    DownloadFinalized,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaEvent {
    Start,
    ReceivedJob,
    ProcessJob,
    RequestBlock,
    ReceivedBlock,
    FinishDownload,
    Suspend,
    Resume,
}

pub type OtaQueue = EventQueue<OtaEvent>;

// ───────────────────────────────────────────────────────────────
// Inbound side (callback context)
// ───────────────────────────────────────────────────────────────

/// Everything the network callbacks may touch: the agent's queue, its
/// job slot and the block pool.  Never blocks for long.
pub struct OtaInbox {
    queue: OtaQueue,
    slot: JobSlot,
    pool: Arc<BlockPool>,
    acquire_timeout: Duration,
}

impl OtaInbox {
    pub fn new(pool: Arc<BlockPool>, acquire_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue: EventQueue::new("ota"),
            slot: JobSlot::new(),
            pool,
            acquire_timeout,
        })
    }

    pub fn queue(&self) -> &OtaQueue {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// Pause the download.  Takes effect at the next event.
    pub fn suspend(&self) -> Result<(), ResourceError> {
        self.queue.send(Event::signal(OtaEvent::Suspend))
    }

    pub fn resume(&self) -> Result<(), ResourceError> {
        self.queue.send(Event::signal(OtaEvent::Resume))
    }
}

impl JobSink for OtaInbox {
    fn name(&self) -> &'static str {
        "ota"
    }

    fn slot(&self) -> &JobSlot {
        &self.slot
    }

    fn deliver(&self, job: JobDocument) -> Result<(), ResourceError> {
        self.queue.send(Event::job(OtaEvent::ReceivedJob, job))
    }
}

impl InboundHandler for OtaInbox {
    fn on_publish(&self, topic: &str, payload: &[u8]) {
        let mut block = match self.pool.acquire(self.acquire_timeout) {
            Ok(b) => b,
            Err(e) => {
                error!("OTA: dropping block from {}: {}", topic, e);
                return;
            }
        };
        if let Err(e) = block.fill(payload) {
            error!("OTA: block message of {} bytes dropped: {}", payload.len(), e);
            return;
        }
        // On failure the event, and with it the buffer, is dropped here.
        let _ = self.queue.send(Event::block(OtaEvent::ReceivedBlock, block));
    }
}

// ───────────────────────────────────────────────────────────────
// Agent context (agent task only)
// ───────────────────────────────────────────────────────────────

pub struct OtaContext {
    session: Arc<Session>,
    inbox: Arc<OtaInbox>,
    store: Box<dyn ImageStore>,
    system: Arc<dyn SystemPort>,
    config: AgentConfig,
    pending: Option<Box<JobDocument>>,
    update: Option<UpdateContext>,
}

impl OtaContext {
    fn emit(&self, kind: OtaEvent) -> bool {
        self.inbox.queue.send(Event::signal(kind)).is_ok()
    }

    fn report(&self, job_id: &str, status: JobStatus, details: Option<StatusDetails<'_>>) {
        // Failures are logged by `report`; the outcome stands either way.
        let _ = status::report(&self.session, job_id, status, details, QoS::AtLeastOnce);
    }

    fn stream_topics(&self, update: &UpdateContext) -> (String, String) {
        let thing = self.session.thing_name();
        (
            topic::stream_data(thing, &update.stream),
            topic::stream_get(thing, &update.stream),
        )
    }

    /// Close out the current job without an image: drop the download,
    /// report, free the slot.
    fn end_job(&mut self, job_id: &str, status: JobStatus, err: &Error) -> OtaState {
        error!("OTA: job {} ended {}: {}", job_id, status, err);
        if let Some(mut update) = self.update.take() {
            update.invalidate();
            let (data, _) = self.stream_topics(&update);
            if let Err(e) = self.session.unsubscribe(&[&data]) {
                warn!("OTA: unsubscribe {} failed: {}", data, e);
            }
            self.store.abort();
        }
        let reason = err.to_string();
        let code = if status == JobStatus::Rejected { "400" } else { "500" };
        self.report(job_id, status, Some(StatusDetails::error(code, &reason)));
        self.inbox.slot.release();
        OtaState::Ready
    }

    fn fail(&mut self, err: Error) -> OtaState {
        let job_id = self
            .update
            .as_ref()
            .map(|u| u.job_id.as_str().to_owned())
            .or_else(|| self.inbox.slot.current())
            .unwrap_or_default();
        self.end_job(&job_id, JobStatus::Failed, &err)
    }

    fn begin(&mut self, job: &JobDocument) -> Result<(), Error> {
        let manifest = parse_manifest(&job.document)?;
        let update = UpdateContext::new(
            job.id(),
            &manifest,
            self.config.block_size,
            self.config.max_file_size,
        )?;
        info!(
            "OTA: job {} stream {} file {} ({} bytes, {} blocks, {:?})",
            job.id(),
            update.stream,
            update.file_id,
            update.file_size,
            update.total_blocks(),
            update.kind
        );

        let prepared = self.store.prepare(Region::Update).and_then(|()| {
            if update.kind == ImageKind::Patch {
                self.store.prepare(Region::PatchStaging)
            } else {
                Ok(())
            }
        });
        if let Err(e) = prepared {
            error!("OTA: cannot prepare flash: {}", e);
            self.store.abort();
            return Err(IntegrityError::FlashWrite.into());
        }

        let (data, _) = self.stream_topics(&update);
        let handler: Arc<dyn InboundHandler> = self.inbox.clone();
        if let Err(e) = self.session.subscribe(&[&data], &handler) {
            self.store.abort();
            return Err(e);
        }

        self.update = Some(update);
        self.report(job.id(), JobStatus::InProgress, None);
        Ok(())
    }

    fn finalize(&mut self, update: &UpdateContext) -> Result<u32, Error> {
        if !update.is_valid() || !update.is_complete() {
            return Err(IntegrityError::FinalizeFailed.into());
        }
        let image_len = match update.kind {
            ImageKind::Full => update.file_size,
            ImageKind::Patch => {
                let window = self.config.patch_window as usize;
                materialize_patch(self.store.as_mut(), update.file_size, window)?
            }
        };
        self.store.finalize(image_len).map_err(|e| {
            error!("OTA: finalize failed: {}", e);
            IntegrityError::FinalizeFailed
        })?;
        Ok(image_len)
    }
}

/// Run the patch engine over the three regions.  Returns the length of the
/// image written to the update region.
pub fn materialize_patch(
    store: &mut dyn ImageStore,
    patch_len: u32,
    window: usize,
) -> Result<u32, Error> {
    let source_len = store.capacity(Region::Running);
    let cell = RefCell::new(store);
    let mut source = RegionStream::new(&cell, Region::Running, u64::from(source_len));
    let mut patch_in = RegionStream::new(&cell, Region::PatchStaging, u64::from(patch_len));
    let mut target = RegionStream::new(&cell, Region::Update, 0);
    let len = patch::apply(&mut source, &mut patch_in, &mut target, window)?;
    info!("OTA: patch of {} bytes produced {} byte image", patch_len, len);
    u32::try_from(len).map_err(|_| IntegrityError::FileTooLarge.into())
}

// ───────────────────────────────────────────────────────────────
// Transition actions
// ───────────────────────────────────────────────────────────────

fn start(_: &mut OtaContext, _: Event<OtaEvent>) -> OtaState {
    OtaState::Ready
}

fn accept_job(ctx: &mut OtaContext, ev: Event<OtaEvent>) -> OtaState {
    let Some(job) = ev.take_job() else {
        return OtaState::Ready;
    };
    ctx.pending = Some(job);
    if ctx.emit(OtaEvent::ProcessJob) {
        OtaState::ProcessingJob
    } else {
        ctx.pending = None;
        ctx.inbox.slot.release();
        OtaState::Ready
    }
}

/// A job delivered while suspended.  The dispatcher claimed the slot for
/// it, so give the slot back.
fn drop_job(ctx: &mut OtaContext, ev: Event<OtaEvent>) -> OtaState {
    if let Some(job) = ev.take_job() {
        warn!("OTA: not ready, dropping job {}", job.id());
        let ours = ctx.update.is_none() && ctx.pending.is_none();
        if ours && ctx.inbox.slot.current().as_deref() == Some(job.id()) {
            ctx.inbox.slot.release();
        }
    }
    OtaState::Suspended
}

fn process_job(ctx: &mut OtaContext, _: Event<OtaEvent>) -> OtaState {
    let Some(job) = ctx.pending.take() else {
        return OtaState::Ready;
    };
    match ctx.begin(&job) {
        Ok(()) => {
            if ctx.emit(OtaEvent::RequestBlock) {
                OtaState::RequestingBlock
            } else {
                ctx.fail(ResourceError::QueueFull.into())
            }
        }
        Err(e @ Error::Malformed(_)) => ctx.end_job(job.id(), JobStatus::Rejected, &e),
        Err(e) => ctx.end_job(job.id(), JobStatus::Failed, &e),
    }
}

fn request_block(ctx: &mut OtaContext, _: Event<OtaEvent>) -> OtaState {
    let Some(update) = ctx.update.as_ref() else {
        return OtaState::Ready;
    };
    let Some(index) = update.next_missing() else {
        return if ctx.emit(OtaEvent::FinishDownload) {
            OtaState::DownloadFinalized
        } else {
            ctx.fail(ResourceError::QueueFull.into())
        };
    };
    if index == 0 {
        info!("OTA: starting download of {}", update.stream);
    }
    let (_, get) = ctx.stream_topics(update);
    let payload = request_payload(update.file_id, update.block_size, index);
    debug!("OTA: requesting block {}/{}", index, update.total_blocks());
    match ctx.session.publish(&get, &payload, QoS::AtLeastOnce) {
        Ok(()) => OtaState::ProcessingBlock,
        Err(e) => ctx.fail(e.into()),
    }
}

fn receive_block(ctx: &mut OtaContext, ev: Event<OtaEvent>) -> OtaState {
    let Some(raw) = ev.take_block() else {
        return OtaState::ProcessingBlock;
    };
    let decoded = decode_block(raw.as_slice());
    // Buffer goes back to the pool before any flash work.
    drop(raw);

    let Some(update) = ctx.update.as_mut() else {
        return OtaState::Ready;
    };

    let block = match decoded {
        Ok(b) if b.file_id == update.file_id => b,
        Ok(b) => {
            warn!("OTA: block for file {} while downloading {}", b.file_id, update.file_id);
            return rerequest(ctx);
        }
        Err(e) => {
            warn!("OTA: undecodable block: {}", e);
            return rerequest(ctx);
        }
    };

    let offset = match update.check(block.index, block.data.len()) {
        Ok(BlockCheck::Write { offset }) => offset,
        Ok(BlockCheck::Duplicate) => {
            debug!("OTA: duplicate block {}", block.index);
            return rerequest(ctx);
        }
        Err(e) => return ctx.fail(e.into()),
    };

    if let Err(e) = ctx.store.write_at(update.region(), offset, &block.data) {
        error!("OTA: write of block {} at {} failed: {}", block.index, offset, e);
        return ctx.fail(IntegrityError::FlashWrite.into());
    }
    update.record(block.index, block.data.len());
    debug!(
        "OTA: block {} stored, {} remaining",
        block.index,
        update.blocks_remaining()
    );

    let (next, state) = if update.is_complete() {
        (OtaEvent::FinishDownload, OtaState::DownloadFinalized)
    } else {
        (OtaEvent::RequestBlock, OtaState::RequestingBlock)
    };
    if ctx.emit(next) {
        state
    } else {
        ctx.fail(ResourceError::QueueFull.into())
    }
}

fn rerequest(ctx: &mut OtaContext) -> OtaState {
    if ctx.emit(OtaEvent::RequestBlock) {
        OtaState::RequestingBlock
    } else {
        OtaState::ProcessingBlock
    }
}

fn finish_download(ctx: &mut OtaContext, _: Event<OtaEvent>) -> OtaState {
    let Some(update) = ctx.update.take() else {
        return OtaState::Ready;
    };
    let (data, _) = ctx.stream_topics(&update);
    if let Err(e) = ctx.session.unsubscribe(&[&data]) {
        warn!("OTA: unsubscribe {} failed: {}", data, e);
    }

    let job_id = update.job_id.as_str();
    match ctx.finalize(&update) {
        Ok(len) => {
            info!("OTA: job {} image of {} bytes ready", job_id, len);
            ctx.report(
                job_id,
                JobStatus::Succeeded,
                Some(StatusDetails::ok("200", "Firmware update applied")),
            );
            ctx.inbox.slot.release();
            ctx.system.restart();
            OtaState::Ready
        }
        Err(e) => {
            ctx.store.abort();
            let reason = e.to_string();
            error!("OTA: job {} failed at finalize: {}", job_id, reason);
            ctx.report(
                job_id,
                JobStatus::Failed,
                Some(StatusDetails::error("500", &reason)),
            );
            ctx.inbox.slot.release();
            OtaState::Ready
        }
    }
}

fn suspend(_: &mut OtaContext, _: Event<OtaEvent>) -> OtaState {
    info!("OTA: suspended");
    OtaState::Suspended
}

/// Pick up where the download stopped.  Anything dropped while suspended
/// is re-derived from the update context.
fn resume(ctx: &mut OtaContext, _: Event<OtaEvent>) -> OtaState {
    if ctx.pending.is_some() {
        return if ctx.emit(OtaEvent::ProcessJob) {
            OtaState::ProcessingJob
        } else {
            OtaState::Suspended
        };
    }
    match ctx.update.as_ref() {
        Some(update) => {
            let (next, state) = if update.is_complete() {
                (OtaEvent::FinishDownload, OtaState::DownloadFinalized)
            } else {
                (OtaEvent::RequestBlock, OtaState::RequestingBlock)
            };
            info!("OTA: resuming, {} blocks remaining", update.blocks_remaining());
            if ctx.emit(next) { state } else { OtaState::Suspended }
        }
        None => {
            // Jobs offered while suspended were dropped; ask again.
            let thing = ctx.session.thing_name();
            if let Err(e) = ctx
                .session
                .publish(&topic::jobs_next_get(thing), b"{}", QoS::AtMostOnce)
            {
                warn!("OTA: pending job query failed: {}", e);
            }
            OtaState::Ready
        }
    }
}

use OtaEvent as E;
use OtaState as S;

static TABLE: &[Transition<OtaState, OtaEvent, OtaContext>] = &[
    Transition { from: StateMatch::Is(S::Init), on: E::Start, action: start },
    Transition { from: StateMatch::Is(S::Ready), on: E::ReceivedJob, action: accept_job },
    Transition { from: StateMatch::Is(S::Suspended), on: E::ReceivedJob, action: drop_job },
    Transition { from: StateMatch::Is(S::ProcessingJob), on: E::ProcessJob, action: process_job },
    Transition { from: StateMatch::Is(S::RequestingBlock), on: E::RequestBlock, action: request_block },
    Transition { from: StateMatch::Is(S::ProcessingBlock), on: E::ReceivedBlock, action: receive_block },
    Transition { from: StateMatch::Is(S::DownloadFinalized), on: E::FinishDownload, action: finish_download },
    Transition { from: StateMatch::Any, on: E::Suspend, action: suspend },
    Transition { from: StateMatch::Is(S::Suspended), on: E::Resume, action: resume },
];

// ───────────────────────────────────────────────────────────────
// Agent
// ───────────────────────────────────────────────────────────────

pub struct UpdateAgent {
    runner: Runner<OtaState, OtaEvent, OtaContext>,
    ctx: OtaContext,
}

impl UpdateAgent {
    pub fn new(
        session: Arc<Session>,
        inbox: Arc<OtaInbox>,
        store: Box<dyn ImageStore>,
        system: Arc<dyn SystemPort>,
        config: AgentConfig,
    ) -> Self {
        Self {
            runner: Runner::new("ota", TABLE, OtaState::Init),
            ctx: OtaContext {
                session,
                inbox,
                store,
                system,
                config,
                pending: None,
                update: None,
            },
        }
    }

    /// Queue the `Start` event.  Must precede job delivery.
    pub fn start(&self) -> Result<(), ResourceError> {
        self.ctx.inbox.queue.send(Event::signal(OtaEvent::Start))
    }

    pub fn state(&self) -> OtaState {
        self.runner.state()
    }

    pub fn update(&self) -> Option<&UpdateContext> {
        self.ctx.update.as_ref()
    }

    /// Handle at most one event, waiting up to `timeout` for it.
    pub fn step(&mut self, timeout: Duration) -> bool {
        let inbox = Arc::clone(&self.ctx.inbox);
        self.runner.step(&mut self.ctx, inbox.queue(), timeout)
    }

    /// Handle everything queued, including follow-up events the handlers
    /// emit, without waiting.
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

    /// Agent task body.
    pub fn run(mut self) -> ! {
        let timeout = self.ctx.config.queue_timeout();
        loop {
            self.step(timeout);
        }
    }
}

impl core::fmt::Debug for UpdateAgent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UpdateAgent")
            .field("state", &self.runner.state())
            .field("update", &self.ctx.update)
            .finish_non_exhaustive()
    }
}
