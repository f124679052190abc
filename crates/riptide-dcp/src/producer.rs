//! The producer-side send engine for one replication channel.
//!
//! A producer merges four ordered sources into the single stream a peer
//! sees, in strict priority order:
//!
//! 1. high-priority vbucket events (state transitions, stream control),
//! 2. background-fetched items that have come back from disk,
//! 3. the live mutation queue,
//! 4. low-priority vbucket events.
//!
//! `step()` never blocks on I/O: when there is nothing to send it reports
//! so and parks the channel until the next notification; when the ack
//! window is full it asks the front-end to wait.
//!
//! Lock order within a producer: the vbucket filter is read (and released)
//! before the send-state mutex; the backfill mutex is taken only with the
//! send-state mutex not held by the same call path's callees that need it
//! back. Neither lock is ever held across a dispatcher hop.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use riptide_error::{EngineStatus, RiptideError};
use riptide_types::{Cookie, Item, QueueOp, QueuedItem, Vbid, VbucketState};

use crate::acklog::{AckLog, AckedEvent};
use crate::admission::BackfillAdmission;
use crate::config::DcpSettings;
use crate::conn::ConnCore;
use crate::filter::VBucketFilter;
use crate::host::{BackfillSink, BackfillVisitor, Dispatcher, FetchOutcome, ItemFetcher};
use crate::queue::EventQueue;
use crate::response::{
    EventPriority, IncludeValue, IncludeXattrs, OPAQUE_ENABLE_AUTO_NACK,
    OPAQUE_INITIAL_VBUCKET_STREAM, OutboundEvent, OutboundPayload, StreamEndReason, VbucketEvent,
    VbucketEventKind,
};
use crate::stats::{StatSink, add_prefixed_stat};

// ---------------------------------------------------------------------------
// Open flags
// ---------------------------------------------------------------------------

/// Flags a client passes when opening a producer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Replay historical items from storage before the live stream.
    pub const BACKFILL: Self = Self(0x01);
    /// Drain the current contents, then disconnect.
    pub const DUMP: Self = Self(0x02);
    /// The client speaks the ack protocol.
    pub const SUPPORT_ACK: Self = Self(0x10);
    /// Send keys only, no document bodies.
    pub const KEYS_ONLY: Self = Self(0x20);

    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(name)
        };
        if self.contains(Self::BACKFILL) {
            put(f, "backfill")?;
        }
        if self.contains(Self::DUMP) {
            put(f, "dump")?;
        }
        if self.contains(Self::SUPPORT_ACK) {
            put(f, "support_ack")?;
        }
        if self.contains(Self::KEYS_ONLY) {
            put(f, "keys_only")?;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step outcome and per-stream state
// ---------------------------------------------------------------------------

/// What `step()` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The next event for the wire codec.
    Event(OutboundEvent),
    /// Nothing to send; the channel is paused until notified.
    NothingToSend,
    /// The ack window is full; the front-end should wait for acks.
    Wait,
}

/// Lifecycle of one vbucket's stream on this producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// A backfill over this vbucket has been scheduled but not finished.
    PendingBackfill,
    /// Serving from the live queue.
    InMemory,
    /// Drained; a stream-end is owed.
    Completing,
    /// Stream over, with the reason that ended it.
    Closed(StreamEndReason),
}

/// A single item awaiting background fetch from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgFetchJob {
    pub key: String,
    pub disk_id: u64,
    pub vbucket: Vbid,
    pub vb_version: u16,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Everything guarded by the send-state mutex.
#[derive(Debug)]
struct SendState {
    queue: EventQueue,
    vb_high: VecDeque<VbucketEvent>,
    vb_low: VecDeque<VbucketEvent>,
    ack_log: AckLog,
    /// Send seqno of the most recently emitted event.
    seqno: u32,
    /// Highest seqno the peer has acked (or nacked).
    seqno_received: u32,
    /// Data events since the last ack request.
    events_since_ack: u32,
    window_full_since: Option<Instant>,
    streams: HashMap<Vbid, StreamState>,
    end_announced: bool,
}

impl SendState {
    fn new() -> Self {
        Self {
            queue: EventQueue::new(),
            vb_high: VecDeque::new(),
            vb_low: VecDeque::new(),
            ack_log: AckLog::new(),
            seqno: 0,
            seqno_received: 0,
            events_since_ack: 0,
            window_full_since: None,
            streams: HashMap::new(),
            end_announced: false,
        }
    }
}

/// Everything guarded by the backfill mutex.
#[derive(Debug, Default)]
struct BackfillState {
    filter: VBucketFilter,
    jobs: VecDeque<BgFetchJob>,
    items: VecDeque<Item>,
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Per-channel send engine.
pub struct Producer {
    /// Self-reference for handing owned clones to dispatcher jobs.
    weak_self: Weak<Producer>,
    core: ConnCore,
    flags: OpenFlags,
    dump_queue: bool,
    include_value: IncludeValue,
    include_xattrs: IncludeXattrs,
    settings: Arc<DcpSettings>,
    admission: Arc<BackfillAdmission>,

    filter: RwLock<VBucketFilter>,
    send: Mutex<SendState>,
    backfill: Mutex<BackfillState>,

    pending_backfill: AtomicBool,
    bg_fetch_scheduled: AtomicBool,
    disk_backfill_counter: AtomicUsize,
    bg_queue_size: AtomicUsize,
    bg_result_size: AtomicUsize,
    bg_queued: AtomicU64,
    bg_fetched: AtomicU64,
    bg_jobs_issued: AtomicU64,
    bg_jobs_completed: AtomicU64,

    records_fetched: AtomicU64,
    records_skipped: AtomicU64,
    queue_fill: AtomicU64,
    queue_drain: AtomicU64,
    num_backoffs: AtomicU64,
    reconnects: AtomicU64,

    pending_flush: AtomicBool,
    suspended: AtomicBool,
    noop_requested: AtomicBool,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("cookie", &self.core.cookie())
            .field("name", &self.core.name())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Producer {
    #[must_use]
    pub fn new(
        cookie: Cookie,
        name: String,
        flags: OpenFlags,
        settings: Arc<DcpSettings>,
        admission: Arc<BackfillAdmission>,
    ) -> Arc<Self> {
        let core = ConnCore::new(cookie, name);
        let mut send = SendState::new();
        if flags.contains(OpenFlags::SUPPORT_ACK) {
            core.set_supports_ack(true);
            // Negotiate auto-nack before any data moves.
            send.vb_high.push_back(VbucketEvent::new(
                Vbid::new(0),
                VbucketEventKind::Opaque(OPAQUE_ENABLE_AUTO_NACK),
            ));
        }
        let include_value = if flags.contains(OpenFlags::KEYS_ONLY) {
            IncludeValue::No
        } else {
            IncludeValue::Yes
        };
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            core,
            flags,
            dump_queue: flags.contains(OpenFlags::DUMP),
            include_value,
            include_xattrs: IncludeXattrs::Yes,
            settings,
            admission,
            filter: RwLock::new(VBucketFilter::all()),
            send: Mutex::new(send),
            backfill: Mutex::new(BackfillState::default()),
            pending_backfill: AtomicBool::new(false),
            bg_fetch_scheduled: AtomicBool::new(false),
            disk_backfill_counter: AtomicUsize::new(0),
            bg_queue_size: AtomicUsize::new(0),
            bg_result_size: AtomicUsize::new(0),
            bg_queued: AtomicU64::new(0),
            bg_fetched: AtomicU64::new(0),
            bg_jobs_issued: AtomicU64::new(0),
            bg_jobs_completed: AtomicU64::new(0),
            records_fetched: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            queue_fill: AtomicU64::new(0),
            queue_drain: AtomicU64::new(0),
            num_backoffs: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            pending_flush: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            noop_requested: AtomicBool::new(false),
        })
    }

    #[inline]
    #[must_use]
    pub const fn core(&self) -> &ConnCore {
        &self.core
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current filter, cloned for diagnostics.
    #[must_use]
    pub fn filter(&self) -> VBucketFilter {
        self.filter.read().clone()
    }

    pub(crate) fn set_vbucket_filter(&self, vbuckets: &[Vbid]) {
        let mut filter = self.filter.write();
        filter.assign(vbuckets.iter().copied());
        debug!(
            target: "riptide_dcp::producer",
            name = self.core.name(),
            filter = %filter,
            "vbucket filter replaced"
        );
    }

    // -- live queue ---------------------------------------------------------

    /// Offer a mutation to the channel. Items outside the filter are
    /// ignored. Returns whether the queue was empty beforehand, which is
    /// the caller's cue to wake the channel.
    pub fn enqueue(&self, item: QueuedItem) -> bool {
        if !self.filter.read().admits(item.vbucket()) {
            return self.send.lock().queue.is_empty();
        }
        let mut send = self.send.lock();
        let len_before = send.queue.len();
        let was_empty = send.queue.push(item);
        if send.queue.len() > len_before {
            self.queue_fill.fetch_add(1, Ordering::Relaxed);
        }
        was_empty
    }

    /// Splice a drained batch back onto the tail (requeue path). The batch
    /// must be duplicate-free against the queue.
    pub fn requeue(&self, batch: Vec<QueuedItem>) {
        let count = batch.len() as u64;
        self.send.lock().queue.append(batch);
        self.queue_fill.fetch_add(count, Ordering::Relaxed);
    }

    /// Drop the live queue and latch the flush marker.
    pub fn flush(&self) {
        self.pending_flush.store(true, Ordering::Release);
        self.send.lock().queue.clear();
        info!(
            target: "riptide_dcp::producer",
            name = self.core.name(),
            "pending queue flushed"
        );
    }

    /// Consume the flush marker.
    pub fn should_flush(&self) -> bool {
        self.pending_flush.swap(false, Ordering::AcqRel)
    }

    // -- vbucket events -----------------------------------------------------

    /// Queue a state-transition event ahead of all data (takeover path).
    pub fn set_vbucket_state(&self, vbucket: Vbid, state: VbucketState) {
        self.send.lock().vb_high.push_back(VbucketEvent::new(
            vbucket,
            VbucketEventKind::SetVbucketState(state),
        ));
    }

    /// Queue a state-transition event behind all data.
    pub fn set_vbucket_state_lazily(&self, vbucket: Vbid, state: VbucketState) {
        self.send.lock().vb_low.push_back(VbucketEvent::new(
            vbucket,
            VbucketEventKind::SetVbucketState(state),
        ));
    }

    /// Close the stream for `vbucket`, if this producer has one (an open
    /// stream entry, or explicit filter membership). Returns whether a
    /// stream was closed.
    pub fn close_stream(&self, vbucket: Vbid, reason: StreamEndReason) -> bool {
        let in_filter = {
            let filter = self.filter.read();
            !filter.is_empty() && filter.admits(vbucket)
        };
        let mut send = self.send.lock();
        let open_stream = matches!(
            send.streams.get(&vbucket),
            Some(StreamState::PendingBackfill | StreamState::InMemory | StreamState::Completing)
        );
        if !open_stream && !in_filter {
            return false;
        }
        if matches!(send.streams.get(&vbucket), Some(StreamState::Closed(_))) {
            return false;
        }
        send.streams.insert(vbucket, StreamState::Closed(reason));
        send.vb_high.push_back(VbucketEvent::new(
            vbucket,
            VbucketEventKind::StreamEnd(reason),
        ));
        info!(
            target: "riptide_dcp::producer",
            name = self.core.name(),
            vbucket = vbucket.get(),
            reason = reason.as_str(),
            "stream closed"
        );
        true
    }

    /// Close every open stream with `reason`.
    pub fn close_all_streams(&self, reason: StreamEndReason) {
        let mut send = self.send.lock();
        let open: Vec<Vbid> = send
            .streams
            .iter()
            .filter(|(_, state)| !matches!(state, StreamState::Closed(_)))
            .map(|(vb, _)| *vb)
            .collect();
        for vb in open {
            send.streams.insert(vb, StreamState::Closed(reason));
            send.vb_high
                .push_back(VbucketEvent::new(vb, VbucketEventKind::StreamEnd(reason)));
        }
    }

    /// The registry's reaction to a vbucket leaving the active state.
    pub fn vbucket_state_changed(&self, vbucket: Vbid, state: VbucketState) {
        if state != VbucketState::Active {
            self.close_stream(vbucket, StreamEndReason::StateChanged);
        }
    }

    /// Best-effort corrective action for a stream that has fallen behind:
    /// drop its queued backlog and end the stream. Streams mid-backfill are
    /// left alone. Returns whether any action was taken.
    pub fn handle_slow_stream(&self, vbucket: Vbid, name: &str) -> bool {
        if self.core.name() != name {
            return false;
        }
        if !self.filter.read().admits(vbucket) {
            return false;
        }
        let mut send = self.send.lock();
        if matches!(
            send.streams.get(&vbucket),
            Some(StreamState::PendingBackfill)
        ) {
            return false;
        }
        let purged = send.queue.purge_vbucket(vbucket);
        self.records_skipped
            .fetch_add(purged as u64, Ordering::Relaxed);
        send.streams
            .insert(vbucket, StreamState::Closed(StreamEndReason::Slow));
        send.vb_high.push_back(VbucketEvent::new(
            vbucket,
            VbucketEventKind::StreamEnd(StreamEndReason::Slow),
        ));
        warn!(
            target: "riptide_dcp::producer",
            name = self.core.name(),
            vbucket = vbucket.get(),
            purged,
            "slow stream backlog dropped"
        );
        true
    }

    /// State of the stream for `vbucket`, if one was ever started.
    #[must_use]
    pub fn stream_state(&self, vbucket: Vbid) -> Option<StreamState> {
        self.send.lock().streams.get(&vbucket).copied()
    }

    // -- notification -------------------------------------------------------

    /// A durable mutation landed on `vbucket`. Returns whether the caller
    /// should wake the front-end connection; repeated notifications before
    /// the channel steps coalesce into one wake.
    pub fn notify_seqno_available(&self, vbucket: Vbid, seqno: u64) -> bool {
        if self.suspended.load(Ordering::Acquire) {
            return false;
        }
        if !self.filter.read().admits(vbucket) {
            return false;
        }
        trace!(
            target: "riptide_dcp::producer",
            name = self.core.name(),
            vbucket = vbucket.get(),
            seqno,
            "seqno available"
        );
        self.core.is_paused() && self.core.claim_notify()
    }

    /// Clear the paused state. Returns whether the caller should deliver a
    /// front-end wake.
    pub fn notify_paused(&self) -> bool {
        let was_paused = self.core.is_paused();
        self.core.set_paused(false);
        was_paused && self.core.claim_notify()
    }

    // -- the ack protocol ---------------------------------------------------

    /// Handle an ack (or nack) from the peer at `seqno`.
    pub fn process_ack(&self, seqno: u32, status: EngineStatus) -> EngineStatus {
        let mut send = self.send.lock();
        if seqno > send.seqno {
            let err = RiptideError::MalformedAck {
                seqno,
                detail: format!("beyond send seqno {}", send.seqno),
            };
            warn!(
                target: "riptide_dcp::producer",
                name = self.core.name(),
                error = %err,
                "ack ignored"
            );
            return EngineStatus::Success;
        }
        send.seqno_received = seqno;

        if status.is_success() {
            send.ack_log.ack_through(seqno);
            if !send
                .ack_log
                .is_window_full(self.settings.ack_window_size)
            {
                send.window_full_since = None;
            }
            if send.end_announced && self.drained(&send) && self.queues_idle(&send) {
                return EngineStatus::Disconnect;
            }
            return EngineStatus::Success;
        }

        // Negative ack: replay everything from this seqno forward.
        self.num_backoffs.fetch_add(1, Ordering::Relaxed);
        let replay = send.ack_log.drain_from(seqno);
        let replayed = replay.len();
        for element in replay.into_iter().rev() {
            match element.event {
                AckedEvent::Mutation(item) => {
                    send.queue.push_front(item);
                }
                AckedEvent::Vbucket { event, priority } => match priority {
                    EventPriority::High => send.vb_high.push_front(event),
                    EventPriority::Low => send.vb_low.push_front(event),
                },
            }
        }
        send.seqno = seqno.saturating_sub(1);
        send.events_since_ack = 0;
        send.window_full_since = None;
        warn!(
            target: "riptide_dcp::producer",
            name = self.core.name(),
            seqno,
            status = status.as_str(),
            replayed,
            "negative ack; send stream rolled back"
        );
        EngineStatus::Success
    }

    /// Whether the ack window blocks further sends.
    #[must_use]
    pub fn ack_window_full(&self) -> bool {
        self.core.supports_ack()
            && self
                .send
                .lock()
                .ack_log
                .is_window_full(self.settings.ack_window_size)
    }

    /// Current send seqno.
    #[must_use]
    pub fn seqno(&self) -> u32 {
        self.send.lock().seqno
    }

    // -- backfill pipeline --------------------------------------------------

    /// Schedule a backfill over `vbuckets` on the dispatcher. The visitor
    /// walks storage and splits items by residency; non-resident items flow
    /// through the background-fetch queue.
    pub fn schedule_backfill(
        &self,
        vbuckets: &[Vbid],
        dispatcher: &dyn Dispatcher,
        visitor: Arc<dyn BackfillVisitor>,
    ) {
        if vbuckets.is_empty() {
            return;
        }
        let Some(producer) = self.weak_self.upgrade() else {
            return;
        };
        self.backfill
            .lock()
            .filter
            .assign(vbuckets.iter().copied());
        self.pending_backfill.store(true, Ordering::Release);
        {
            let mut send = self.send.lock();
            for &vb in vbuckets {
                send.streams.insert(vb, StreamState::PendingBackfill);
                send.vb_high.push_back(VbucketEvent::new(
                    vb,
                    VbucketEventKind::Opaque(OPAQUE_INITIAL_VBUCKET_STREAM),
                ));
                send.vb_high
                    .push_back(VbucketEvent::new(vb, VbucketEventKind::StreamStart));
            }
        }
        info!(
            target: "riptide_dcp::producer",
            name = self.core.name(),
            vbuckets = vbuckets.len(),
            "backfill scheduled"
        );
        dispatcher.schedule(Box::new(move || {
            let filter = producer.backfill.lock().filter.clone();
            let mut sink = ProducerBackfillSink {
                producer: &producer,
            };
            visitor.visit(&filter, &mut sink);
            producer.complete_backfill();
        }));
    }

    /// Queue one ejected item for background fetch.
    pub fn queue_bg_fetch(&self, key: &str, disk_id: u64, vbucket: Vbid, vb_version: u16) {
        self.backfill.lock().jobs.push_back(BgFetchJob {
            key: key.to_owned(),
            disk_id,
            vbucket,
            vb_version,
        });
        self.bg_queue_size.fetch_add(1, Ordering::AcqRel);
        self.bg_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Deposit one background-fetched item, ready for `step()`.
    pub fn got_bg_item(&self, item: Item) {
        self.backfill.lock().items.push_back(item);
        self.bg_result_size.fetch_add(1, Ordering::AcqRel);
        self.bg_fetched.fetch_add(1, Ordering::Relaxed);
    }

    /// The backfill visitor has walked everything it was asked to.
    pub fn complete_backfill(&self) {
        self.pending_backfill.store(false, Ordering::Release);
        {
            let mut send = self.send.lock();
            for state in send.streams.values_mut() {
                if matches!(state, StreamState::PendingBackfill) {
                    *state = StreamState::InMemory;
                }
            }
        }
        self.maybe_disconnect_when_done();
    }

    /// Whether any backfill work (visitor or disk fetch) is outstanding.
    #[must_use]
    pub fn is_pending_backfill(&self) -> bool {
        self.pending_backfill.load(Ordering::Acquire)
            || self.disk_backfill_counter.load(Ordering::Acquire) > 0
            || self.bg_jobs_issued.load(Ordering::Acquire)
                != self.bg_jobs_completed.load(Ordering::Acquire)
    }

    /// Pending work across all sources; drives the `backlog_size` stat.
    #[must_use]
    pub fn backlog_size(&self) -> usize {
        let in_flight = (self.bg_jobs_issued.load(Ordering::Acquire)
            - self.bg_jobs_completed.load(Ordering::Acquire)) as usize;
        self.bg_result_size.load(Ordering::Acquire)
            + self.bg_queue_size.load(Ordering::Acquire)
            + in_flight
            + self.send.lock().queue.len()
    }

    /// If there are queued disk fetches and no job in flight, claim an
    /// admission slot and dispatch one. Admission denial is silent; the
    /// periodic manager re-pokes paused channels and we try again.
    fn maybe_schedule_bg_fetch(&self, fetcher: &Arc<dyn ItemFetcher>, dispatcher: &dyn Dispatcher) {
        if self.bg_queue_size.load(Ordering::Acquire) == 0 {
            return;
        }
        if self.bg_fetch_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(producer) = self.weak_self.upgrade() else {
            self.bg_fetch_scheduled.store(false, Ordering::Release);
            return;
        };
        if !self.admission.try_acquire() {
            self.bg_fetch_scheduled.store(false, Ordering::Release);
            trace!(
                target: "riptide_dcp::producer",
                name = self.core.name(),
                "backfill admission denied; snoozing"
            );
            return;
        }
        self.disk_backfill_counter.fetch_add(1, Ordering::AcqRel);
        self.bg_jobs_issued.fetch_add(1, Ordering::AcqRel);
        let fetcher = Arc::clone(fetcher);
        dispatcher.schedule(Box::new(move || producer.run_bg_fetch_job(&*fetcher)));
    }

    /// One dispatcher job: fetch up to `bg_max_pending` queued items.
    fn run_bg_fetch_job(&self, fetcher: &dyn ItemFetcher) {
        let jobs: Vec<BgFetchJob> = {
            let mut backfill = self.backfill.lock();
            let take = backfill.jobs.len().min(self.settings.bg_max_pending);
            backfill.jobs.drain(..take).collect()
        };
        self.bg_queue_size.fetch_sub(jobs.len(), Ordering::AcqRel);
        for job in jobs {
            match fetcher.fetch(&job.key, job.vbucket, job.vb_version) {
                FetchOutcome::Resident(item) => self.got_bg_item(item),
                FetchOutcome::Ejected { disk_id } => {
                    warn!(
                        target: "riptide_dcp::producer",
                        name = self.core.name(),
                        key = %job.key,
                        disk_id,
                        "item still ejected after disk fetch; dropped"
                    );
                }
                FetchOutcome::Miss => {
                    debug!(
                        target: "riptide_dcp::producer",
                        name = self.core.name(),
                        key = %job.key,
                        "backfill item vanished before fetch"
                    );
                }
                FetchOutcome::Error(status) => {
                    warn!(
                        target: "riptide_dcp::producer",
                        name = self.core.name(),
                        key = %job.key,
                        status = status.as_str(),
                        "background fetch failed"
                    );
                }
            }
        }
        self.completed_bg_fetch_job();
    }

    /// Bookkeeping when a fetch job finishes: return the admission slot and
    /// re-check whether the channel is done.
    fn completed_bg_fetch_job(&self) {
        self.bg_jobs_completed.fetch_add(1, Ordering::AcqRel);
        self.disk_backfill_counter.fetch_sub(1, Ordering::AcqRel);
        self.admission.release();
        self.bg_fetch_scheduled.store(false, Ordering::Release);
        self.maybe_disconnect_when_done();
    }

    /// A dump connection with nothing left anywhere disconnects itself.
    fn maybe_disconnect_when_done(&self) {
        let send = self.send.lock();
        if self.dump_queue && self.drained(&send) && self.queues_idle(&send) {
            drop(send);
            self.core.set_disconnect();
            info!(
                target: "riptide_dcp::producer",
                name = self.core.name(),
                "dump complete; disconnecting"
            );
        }
    }

    // -- step ---------------------------------------------------------------

    /// Produce the next wire event, or report why there is none.
    pub fn step(&self, fetcher: &Arc<dyn ItemFetcher>, dispatcher: &dyn Dispatcher) -> StepOutcome {
        self.core.clear_notify();
        self.core.set_expiry(None);
        self.maybe_schedule_bg_fetch(fetcher, dispatcher);

        let filter = self.filter.read().clone();
        let mut send = self.send.lock();

        // 1. High-priority vbucket events jump everything, including the
        //    ack window.
        if let Some(event) = Self::next_vb_event(&mut send.vb_high, &filter) {
            let out = self.emit_vbucket(&mut send, event, EventPriority::High);
            return StepOutcome::Event(out);
        }

        // Steps 2-4 move data; the ack window gates them.
        if self.core.supports_ack()
            && send.ack_log.is_window_full(self.settings.ack_window_size)
        {
            return self.window_full_wait(&mut send);
        }

        // 2. Background-fetched items.
        if let Some(item) = self.next_backfilled_item() {
            let out = self.emit_data(
                &mut send,
                QueuedItem::new(item.key(), item.vbucket(), QueueOp::Mutation),
                OutboundPayload::Mutation(item),
            );
            return StepOutcome::Event(out);
        }

        // 3. The live queue. Bodies come from the cache; ejected items
        //    detour through the background-fetch queue.
        loop {
            let popped = send.queue.pop(&filter);
            if popped.skipped > 0 {
                self.records_skipped
                    .fetch_add(popped.skipped as u64, Ordering::Relaxed);
            }
            let Some(queued) = popped.item else { break };
            match queued.op() {
                QueueOp::Mutation => {
                    match fetcher.fetch(queued.key(), queued.vbucket(), 0) {
                        FetchOutcome::Resident(item) => {
                            let out = self.emit_data(
                                &mut send,
                                queued,
                                OutboundPayload::Mutation(item),
                            );
                            return StepOutcome::Event(out);
                        }
                        FetchOutcome::Ejected { disk_id } => {
                            self.queue_bg_fetch(queued.key(), disk_id, queued.vbucket(), 0);
                        }
                        FetchOutcome::Miss => {
                            trace!(
                                target: "riptide_dcp::producer",
                                name = self.core.name(),
                                key = queued.key(),
                                "queued item vanished; skipped"
                            );
                        }
                        FetchOutcome::Error(status) => {
                            warn!(
                                target: "riptide_dcp::producer",
                                name = self.core.name(),
                                key = queued.key(),
                                status = status.as_str(),
                                "fetch failed; item skipped"
                            );
                        }
                    }
                }
                QueueOp::Deletion => {
                    let payload = OutboundPayload::Deletion(queued.clone());
                    let out = self.emit_data(&mut send, queued, payload);
                    return StepOutcome::Event(out);
                }
                QueueOp::Expiration => {
                    let payload = OutboundPayload::Expiration(queued.clone());
                    let out = self.emit_data(&mut send, queued, payload);
                    return StepOutcome::Event(out);
                }
                QueueOp::Flush => {
                    let out = self.emit_data(&mut send, queued, OutboundPayload::Flush);
                    return StepOutcome::Event(out);
                }
                QueueOp::SetVbucket => {
                    // State transitions travel the priority queues.
                    debug!(
                        target: "riptide_dcp::producer",
                        name = self.core.name(),
                        "set-vbucket op on the data queue; skipped"
                    );
                }
            }
        }

        // 4. Low-priority vbucket events drain when nothing else is left.
        if let Some(event) = Self::next_vb_event(&mut send.vb_low, &filter) {
            let out = self.emit_vbucket(&mut send, event, EventPriority::Low);
            return StepOutcome::Event(out);
        }

        // 5. Everything drained: a dump (or disconnecting) channel owes a
        //    stream-end, then goes down.
        if self.drained(&send) && (self.dump_queue || self.core.do_disconnect()) {
            if !send.end_announced {
                return StepOutcome::Event(self.announce_end(&mut send, &filter));
            }
            self.core.set_disconnect();
            return StepOutcome::NothingToSend;
        }

        // 6. Nothing to send; park until notified. The expiry bounds how
        //    long a park may last before the manager forces a disconnect.
        self.core.set_paused(true);
        self.core
            .set_expiry(Some(Instant::now() + self.settings.conn_keep_alive));
        StepOutcome::NothingToSend
    }

    fn next_vb_event(
        queue: &mut VecDeque<VbucketEvent>,
        filter: &VBucketFilter,
    ) -> Option<VbucketEvent> {
        while let Some(event) = queue.pop_front() {
            // Auto-nack negotiation is connection-scoped, not vbucket-scoped.
            let bypass = matches!(
                event.kind,
                VbucketEventKind::Opaque(OPAQUE_ENABLE_AUTO_NACK)
            );
            if bypass || filter.admits(event.vbucket) {
                return Some(event);
            }
        }
        None
    }

    fn next_backfilled_item(&self) -> Option<Item> {
        let item = self.backfill.lock().items.pop_front();
        if item.is_some() {
            self.bg_result_size.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    fn window_full_wait(&self, send: &mut SendState) -> StepOutcome {
        let now = Instant::now();
        let since = *send.window_full_since.get_or_insert(now);
        self.num_backoffs.fetch_add(1, Ordering::Relaxed);
        self.core.set_paused(true);
        self.core
            .set_expiry(Some(now + self.settings.conn_keep_alive));
        if now.duration_since(since) > self.settings.ack_grace_period {
            warn!(
                target: "riptide_dcp::producer",
                name = self.core.name(),
                window = self.settings.ack_window_size,
                "ack grace period exceeded; disconnecting"
            );
            self.core.set_disconnect();
        }
        StepOutcome::Wait
    }

    fn emit_vbucket(
        &self,
        send: &mut SendState,
        event: VbucketEvent,
        priority: EventPriority,
    ) -> OutboundEvent {
        self.records_fetched.fetch_add(1, Ordering::Relaxed);
        if let VbucketEventKind::StreamEnd(reason) = event.kind {
            send.streams
                .insert(event.vbucket, StreamState::Closed(reason));
        }
        send.seqno += 1;
        let seqno = send.seqno;
        let ack_requested = if self.core.supports_ack() {
            send.events_since_ack = 0;
            send.ack_log
                .record(seqno, AckedEvent::Vbucket { event, priority });
            true
        } else {
            false
        };
        OutboundEvent {
            seqno,
            ack_requested,
            payload: OutboundPayload::Vbucket(event),
        }
    }

    fn emit_data(
        &self,
        send: &mut SendState,
        logged: QueuedItem,
        payload: OutboundPayload,
    ) -> OutboundEvent {
        self.records_fetched.fetch_add(1, Ordering::Relaxed);
        self.queue_drain.fetch_add(1, Ordering::Relaxed);
        send.seqno += 1;
        let seqno = send.seqno;
        let ack_requested = if self.core.supports_ack() {
            send.ack_log.record(seqno, AckedEvent::Mutation(logged));
            send.events_since_ack += 1;
            if send.events_since_ack >= self.settings.ack_interval {
                send.events_since_ack = 0;
                true
            } else {
                false
            }
        } else {
            false
        };
        OutboundEvent {
            seqno,
            ack_requested,
            payload,
        }
    }

    /// Emit the stream-end that precedes disconnect, one open stream per
    /// step; with no explicit streams a single end is sent for the channel.
    fn announce_end(&self, send: &mut SendState, filter: &VBucketFilter) -> OutboundEvent {
        let reason = if self.dump_queue {
            StreamEndReason::Ok
        } else {
            StreamEndReason::Disconnected
        };
        let next_open: Option<Vbid> = send
            .streams
            .iter()
            .filter(|(_, state)| !matches!(state, StreamState::Closed(_)))
            .map(|(vb, _)| *vb)
            .min();
        let vbucket = match next_open {
            Some(vb) => {
                send.streams.insert(vb, StreamState::Completing);
                vb
            }
            None => {
                send.end_announced = true;
                self.core.set_disconnect();
                filter.iter().next().unwrap_or(Vbid::new(0))
            }
        };
        let remaining_open = send
            .streams
            .values()
            .any(|state| !matches!(state, StreamState::Closed(_) | StreamState::Completing));
        if next_open.is_some() && !remaining_open {
            send.end_announced = true;
            self.core.set_disconnect();
        }
        self.emit_vbucket(
            send,
            VbucketEvent::new(vbucket, VbucketEventKind::StreamEnd(reason)),
            EventPriority::Low,
        )
    }

    fn drained(&self, send: &SendState) -> bool {
        send.queue.is_empty()
            && self.bg_queue_size.load(Ordering::Acquire) == 0
            && self.bg_result_size.load(Ordering::Acquire) == 0
            && !self.is_pending_backfill()
    }

    fn queues_idle(&self, send: &SendState) -> bool {
        send.vb_high.is_empty() && send.vb_low.is_empty() && send.ack_log.is_empty()
    }

    // -- misc state ---------------------------------------------------------

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Mark the receiver too slow to keep notifying (or resume it).
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Consume the noop latch set by the periodic manager.
    pub fn is_time_for_noop(&self) -> bool {
        self.noop_requested.swap(false, Ordering::AcqRel)
    }

    pub fn set_time_for_noop(&self) {
        self.noop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub const fn include_value(&self) -> IncludeValue {
        self.include_value
    }

    #[must_use]
    pub const fn include_xattrs(&self) -> IncludeXattrs {
        self.include_xattrs
    }

    // -- stats --------------------------------------------------------------

    pub fn add_stats(&self, sink: &mut dyn StatSink) {
        self.core.add_base_stats("producer", sink);
        let name = self.core.name();
        let (qlen, queue_mem, high, low, ack_log_size, seqno, seqno_received) = {
            let send = self.send.lock();
            (
                send.queue.len(),
                send.queue.mem_size(),
                send.vb_high.len(),
                send.vb_low.len(),
                send.ack_log.len(),
                send.seqno,
                send.seqno_received,
            )
        };
        add_prefixed_stat(sink, name, "qlen", qlen);
        add_prefixed_stat(sink, name, "qlen_high_pri", high);
        add_prefixed_stat(sink, name, "qlen_low_pri", low);
        add_prefixed_stat(sink, name, "queue_memory", queue_mem);
        add_prefixed_stat(
            sink,
            name,
            "queue_fill",
            self.queue_fill.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "queue_drain",
            self.queue_drain.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "queue_backoff",
            self.num_backoffs.load(Ordering::Relaxed),
        );
        add_prefixed_stat(sink, name, "ack_seqno", seqno);
        add_prefixed_stat(sink, name, "recv_ack_seqno", seqno_received);
        add_prefixed_stat(sink, name, "ack_log_size", ack_log_size);
        add_prefixed_stat(sink, name, "ack_window_full", self.ack_window_full());
        add_prefixed_stat(
            sink,
            name,
            "bg_queued",
            self.bg_queued.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "bg_fetched",
            self.bg_fetched.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "bg_jobs_issued",
            self.bg_jobs_issued.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "bg_jobs_completed",
            self.bg_jobs_completed.load(Ordering::Relaxed),
        );
        add_prefixed_stat(sink, name, "bg_backlog_size", self.backlog_size());
        add_prefixed_stat(
            sink,
            name,
            "rec_fetched",
            self.records_fetched.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "rec_skipped",
            self.records_skipped.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "reconnects",
            self.reconnects.load(Ordering::Relaxed),
        );
        add_prefixed_stat(sink, name, "paused", self.core.is_paused());
        add_prefixed_stat(sink, name, "suspended", self.is_suspended());
        add_prefixed_stat(sink, name, "reserved", self.core.is_reserved());
        add_prefixed_stat(sink, name, "flags", self.flags);
        add_prefixed_stat(sink, name, "filter", self.filter.read().clone());
    }
}

/// Routes visitor output into the producer's pipelines.
struct ProducerBackfillSink<'a> {
    producer: &'a Producer,
}

impl BackfillSink for ProducerBackfillSink<'_> {
    fn resident(&mut self, item: Item) {
        self.producer.got_bg_item(item);
    }

    fn not_resident(&mut self, key: &str, disk_id: u64, vbucket: Vbid, vb_version: u16) {
        self.producer.queue_bg_fetch(key, disk_id, vbucket, vb_version);
    }
}
