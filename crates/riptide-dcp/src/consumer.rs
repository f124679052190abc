//! The consumer-side receive engine for one replication channel.
//!
//! A consumer owns the passive streams for the vbuckets it replicates.
//! Inbound events are validated against the stream table (vbucket known,
//! opaque matching) and then forwarded to the engine; per-op counters track
//! what was processed and what failed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use riptide_error::{EngineStatus, Result, RiptideError};
use riptide_types::{Cookie, Vbid, VbucketState};

use crate::conn::ConnCore;
use crate::host::ReplicaApplier;
use crate::response::{InboundEvent, InboundEventKind};
use crate::stats::{StatSink, add_prefixed_stat};

/// Consumer-side state for one vbucket's inbound replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassiveStream {
    pub opaque: u32,
    pub flags: u32,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    mutations: AtomicU64,
    mutations_failed: AtomicU64,
    deletions: AtomicU64,
    deletions_failed: AtomicU64,
    snapshots: AtomicU64,
    snapshots_failed: AtomicU64,
    vbucket_sets: AtomicU64,
    vbucket_sets_failed: AtomicU64,
    stream_ends: AtomicU64,
    unknown: AtomicU64,
}

/// Per-channel receive engine.
pub struct Consumer {
    core: ConnCore,
    streams: Mutex<HashMap<Vbid, PassiveStream>>,
    counters: ConsumerCounters,
    task_cancelled: AtomicBool,
    processor_yield_threshold: AtomicUsize,
    process_buffered_messages_batch_size: AtomicUsize,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("cookie", &self.core.cookie())
            .field("name", &self.core.name())
            .finish_non_exhaustive()
    }
}

impl Consumer {
    #[must_use]
    pub fn new(
        cookie: Cookie,
        name: String,
        yield_threshold: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            core: ConnCore::new(cookie, name),
            streams: Mutex::new(HashMap::new()),
            counters: ConsumerCounters::default(),
            task_cancelled: AtomicBool::new(false),
            processor_yield_threshold: AtomicUsize::new(yield_threshold),
            process_buffered_messages_batch_size: AtomicUsize::new(batch_size),
        }
    }

    #[inline]
    #[must_use]
    pub const fn core(&self) -> &ConnCore {
        &self.core
    }

    // -- passive streams ----------------------------------------------------

    /// Open the passive stream for `vbucket`. Fails if this consumer
    /// already has one; the registry separately enforces uniqueness across
    /// all consumers.
    pub fn add_stream(&self, opaque: u32, vbucket: Vbid, flags: u32) -> Result<()> {
        if self.core.do_disconnect() {
            return Err(RiptideError::Disconnecting);
        }
        let mut streams = self.streams.lock();
        if streams.contains_key(&vbucket) {
            return Err(RiptideError::DuplicatePassiveStream {
                vbucket: vbucket.get(),
            });
        }
        streams.insert(vbucket, PassiveStream { opaque, flags });
        info!(
            target: "riptide_dcp::consumer",
            name = self.core.name(),
            vbucket = vbucket.get(),
            opaque,
            "passive stream added"
        );
        Ok(())
    }

    /// Whether a passive stream exists for `vbucket`.
    #[must_use]
    pub fn is_stream_present(&self, vbucket: Vbid) -> bool {
        self.streams.lock().contains_key(&vbucket)
    }

    #[must_use]
    pub fn stream(&self, vbucket: Vbid) -> Option<PassiveStream> {
        self.streams.lock().get(&vbucket).copied()
    }

    /// Drop the stream when its vbucket leaves the replica state.
    pub fn vbucket_state_changed(&self, vbucket: Vbid, state: VbucketState) {
        if state == VbucketState::Replica {
            return;
        }
        if self.streams.lock().remove(&vbucket).is_some() {
            info!(
                target: "riptide_dcp::consumer",
                name = self.core.name(),
                vbucket = vbucket.get(),
                state = state.as_str(),
                "passive stream closed on state change"
            );
        }
    }

    pub fn close_all_streams(&self) {
        let mut streams = self.streams.lock();
        if !streams.is_empty() {
            debug!(
                target: "riptide_dcp::consumer",
                name = self.core.name(),
                count = streams.len(),
                "closing all passive streams"
            );
        }
        streams.clear();
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    // -- inbound events -----------------------------------------------------

    /// The stream an inbound event belongs to, or why it has none.
    fn validate_stream(&self, event: &InboundEvent) -> Result<PassiveStream> {
        let stream = self
            .stream(event.vbucket)
            .ok_or(RiptideError::NoPassiveStream {
                vbucket: event.vbucket.get(),
            })?;
        if stream.opaque != event.opaque {
            return Err(RiptideError::OpaqueMismatch {
                vbucket: event.vbucket.get(),
                expected: stream.opaque,
                actual: event.opaque,
            });
        }
        Ok(stream)
    }

    /// Validate one inbound event and forward it to the engine.
    pub fn process_event(&self, event: &InboundEvent, applier: &dyn ReplicaApplier) -> EngineStatus {
        if self.core.do_disconnect() {
            return EngineStatus::Disconnect;
        }
        if let Err(err) = self.validate_stream(event) {
            self.counters.unknown.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "riptide_dcp::consumer",
                name = self.core.name(),
                kind = event.kind.kind_str(),
                error = %err,
                "inbound event rejected"
            );
            return err.status();
        }

        let status = applier.apply(event);
        self.count_processed(&event.kind, status);

        if matches!(event.kind, InboundEventKind::StreamEnd(_)) {
            self.streams.lock().remove(&event.vbucket);
        }
        status
    }

    fn count_processed(&self, kind: &InboundEventKind, status: EngineStatus) {
        let failed = !status.is_success();
        match kind {
            InboundEventKind::Mutation { .. } => {
                self.counters.mutations.fetch_add(1, Ordering::Relaxed);
                if failed {
                    self.counters.mutations_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            InboundEventKind::Deletion { .. } => {
                self.counters.deletions.fetch_add(1, Ordering::Relaxed);
                if failed {
                    self.counters.deletions_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            InboundEventKind::SnapshotMarker => {
                self.counters.snapshots.fetch_add(1, Ordering::Relaxed);
                if failed {
                    self.counters.snapshots_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            InboundEventKind::SetVbucketState(_) => {
                self.counters.vbucket_sets.fetch_add(1, Ordering::Relaxed);
                if failed {
                    self.counters
                        .vbucket_sets_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            InboundEventKind::StreamEnd(_) => {
                self.counters.stream_ends.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // -- processor task -----------------------------------------------------

    /// Stop the buffered-message processor task. Idempotent.
    pub fn cancel_task(&self) {
        if !self.task_cancelled.swap(true, Ordering::AcqRel) {
            debug!(
                target: "riptide_dcp::consumer",
                name = self.core.name(),
                "processor task cancelled"
            );
        }
    }

    #[must_use]
    pub fn is_task_cancelled(&self) -> bool {
        self.task_cancelled.load(Ordering::Acquire)
    }

    // -- live tunables ------------------------------------------------------

    pub fn set_processor_yield_threshold(&self, value: usize) {
        self.processor_yield_threshold.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn processor_yield_threshold(&self) -> usize {
        self.processor_yield_threshold.load(Ordering::Acquire)
    }

    pub fn set_process_buffered_messages_batch_size(&self, value: usize) {
        self.process_buffered_messages_batch_size
            .store(value, Ordering::Release);
    }

    #[must_use]
    pub fn process_buffered_messages_batch_size(&self) -> usize {
        self.process_buffered_messages_batch_size
            .load(Ordering::Acquire)
    }

    // -- stats --------------------------------------------------------------

    pub fn add_stats(&self, sink: &mut dyn StatSink) {
        self.core.add_base_stats("consumer", sink);
        let name = self.core.name();
        add_prefixed_stat(sink, name, "passive_streams", self.stream_count());
        add_prefixed_stat(
            sink,
            name,
            "num_mutations",
            self.counters.mutations.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "num_mutations_failed",
            self.counters.mutations_failed.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "num_deletions",
            self.counters.deletions.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "num_deletions_failed",
            self.counters.deletions_failed.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "num_snapshot_markers",
            self.counters.snapshots.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "num_vbucket_sets",
            self.counters.vbucket_sets.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "num_stream_ends",
            self.counters.stream_ends.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "num_unknown_events",
            self.counters.unknown.load(Ordering::Relaxed),
        );
        add_prefixed_stat(
            sink,
            name,
            "processor_yield_threshold",
            self.processor_yield_threshold(),
        );
        add_prefixed_stat(
            sink,
            name,
            "processor_batch_size",
            self.process_buffered_messages_batch_size(),
        );
    }
}
