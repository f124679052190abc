//! Replication connection management for the Riptide key-value store.
//!
//! This crate maintains the lifecycle of the long-lived streaming channels
//! that carry ordered mutation sequences between a bucket engine and its
//! replicas or external consumers.
//!
//! The two central pieces:
//!
//! - [`ConnMap`]: the concurrently-accessed catalog of every live channel,
//!   with a sharded per-vbucket index for the hot notify path and the
//!   disconnect/notify/reap state machine.
//! - [`Producer`]: the per-channel send engine, merging high-priority
//!   vbucket events, the live deduplicated queue, background-fetched items
//!   and low-priority events into one ordered stream, under an optional
//!   windowed ack/retransmit protocol.
//!
//! Storage, scheduling, the wire codec, and the front-end I/O loop are all
//! external; see [`host`] for the traits they implement.

pub mod acklog;
pub mod admission;
pub mod config;
pub mod conn;
pub mod connmap;
pub mod consumer;
pub mod filter;
pub mod host;
pub mod producer;
pub mod queue;
pub mod response;
pub mod stats;

pub use admission::BackfillAdmission;
pub use config::{DcpSettings, TunableStore, ValueChangedListener};
pub use conn::{ConnCore, Connection};
pub use connmap::{ConnMap, ConnNotifier, VB_CONN_LOCK_NUM};
pub use consumer::{Consumer, PassiveStream};
pub use filter::VBucketFilter;
pub use host::{
    BackfillSink, BackfillVisitor, Dispatcher, EngineHost, FetchOutcome, InlineDispatcher,
    ItemFetcher, ReplicaApplier,
};
pub use producer::{BgFetchJob, OpenFlags, Producer, StepOutcome, StreamState};
pub use response::{
    InboundEvent, InboundEventKind, OutboundEvent, OutboundPayload, StreamEndReason, VbucketEvent,
    VbucketEventKind,
};
pub use stats::StatSink;
