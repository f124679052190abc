//! Interfaces onto the rest of the engine.
//!
//! The replication layer never owns I/O, storage, or scheduling. The bucket
//! engine implements these traits and hands them in; tests substitute small
//! in-memory fakes.

use riptide_error::EngineStatus;
use riptide_types::{Cookie, Item, Vbid, VbucketState};

use crate::filter::VBucketFilter;

/// Callbacks into the engine and the front-end I/O layer.
pub trait EngineHost: Send + Sync {
    /// Wake the front-end connection identified by `cookie`; it will call
    /// `step()` again.
    fn notify_io_complete(&self, cookie: Cookie, status: EngineStatus);

    /// Drop the front-end's reference on `cookie`. Called exactly once per
    /// reaped channel.
    fn release_cookie(&self, cookie: Cookie);

    /// Current state of a vbucket, or `None` if unknown on this node.
    fn vbucket_state(&self, vbucket: Vbid) -> Option<VbucketState>;
}

/// Result of asking the storage layer for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The document is resident in cache.
    Resident(Item),
    /// The document exists but was ejected; fetch it from disk under the
    /// given id.
    Ejected { disk_id: u64 },
    /// The document no longer exists.
    Miss,
    /// The storage layer failed.
    Error(EngineStatus),
}

/// Document lookup, keyed the way the replication layer addresses items.
pub trait ItemFetcher: Send + Sync {
    fn fetch(&self, key: &str, vbucket: Vbid, vb_version: u16) -> FetchOutcome;
}

/// The engine's background task pool.
pub trait Dispatcher: Send + Sync {
    /// Run `job` on a background thread, soon.
    fn schedule(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs scheduled jobs inline on the calling thread. Used by tests and by
/// embedders without a task pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn schedule(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

/// Receives the items a backfill visitor finds, split by residency.
pub trait BackfillSink {
    /// The item is resident; hand it straight to the send path.
    fn resident(&mut self, item: Item);

    /// The item was ejected; it must be fetched from disk before sending.
    fn not_resident(&mut self, key: &str, disk_id: u64, vbucket: Vbid, vb_version: u16);
}

/// A storage-side walk over every item in the vbuckets a filter admits.
///
/// The storage engine implements this; the producer drives it from a
/// background task when a backfill is scheduled.
pub trait BackfillVisitor: Send + Sync {
    fn visit(&self, filter: &VBucketFilter, sink: &mut dyn BackfillSink);
}

/// Where a consumer forwards validated inbound events.
pub trait ReplicaApplier: Send + Sync {
    fn apply(&self, event: &crate::response::InboundEvent) -> EngineStatus;
}
