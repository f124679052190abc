//! Replication stream events and their on-wire sizes.
//!
//! The wire codec itself lives in the front-end; the replication layer only
//! needs to know how large each message will be once encoded, because the
//! flow-control accounting charges bytes before the codec runs. The base
//! sizes below are the fixed packet sizes of the binary protocol.

use riptide_types::{Item, QueuedItem, Vbid, VbucketState};

// ---------------------------------------------------------------------------
// Base message sizes (bytes on the wire)
// ---------------------------------------------------------------------------

pub const STREAM_REQUEST_BASE_MSG_BYTES: u32 = 72;
pub const ADD_STREAM_RESPONSE_BASE_MSG_BYTES: u32 = 28;
pub const SNAPSHOT_MARKER_RESPONSE_BASE_MSG_BYTES: u32 = 24;
pub const SET_VBUCKET_STATE_RESPONSE_BASE_MSG_BYTES: u32 = 24;
pub const STREAM_END_RESPONSE_BASE_MSG_BYTES: u32 = 28;
pub const SET_VBUCKET_STATE_BASE_MSG_BYTES: u32 = 25;
pub const SNAPSHOT_MARKER_BASE_MSG_BYTES: u32 = 44;
pub const MUTATION_BASE_MSG_BYTES: u32 = 55;
pub const DELETION_BASE_MSG_BYTES: u32 = 42;

/// Opaque payload announcing that the peer should enable automatic
/// negative acks.
pub const OPAQUE_ENABLE_AUTO_NACK: u32 = 0;
/// Opaque payload marking the start of the initial vbucket stream.
pub const OPAQUE_INITIAL_VBUCKET_STREAM: u32 = 1;

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StreamEndReason {
    /// The stream transferred everything it was asked for.
    Ok,
    /// The peer closed the stream.
    Closed,
    /// The vbucket moved out of the streamed state.
    StateChanged,
    /// The channel is being torn down.
    Disconnected,
    /// The vbucket was rolled back under the stream.
    Rollback,
    /// The stream was dropped as a slow-stream corrective action.
    Slow,
}

impl StreamEndReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Closed => "closed",
            Self::StateChanged => "state_changed",
            Self::Disconnected => "disconnected",
            Self::Rollback => "rollback",
            Self::Slow => "slow",
        }
    }
}

/// Whether a vbucket event jumps the data queue or trails it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPriority {
    /// Sent before any queued data.
    High,
    /// Sent only when there is nothing else to send.
    Low,
}

/// A change to the state of a vbucket, carried on the stream alongside the
/// data events. Only a vbucket id and a small payload; the queues holding
/// these can get long and must stay cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbucketEvent {
    pub vbucket: Vbid,
    pub kind: VbucketEventKind,
}

/// The payload of a [`VbucketEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbucketEventKind {
    /// An engine-internal marker rides the stream (auto-nack negotiation,
    /// initial-stream boundary).
    Opaque(u32),
    /// Tell the peer to move the vbucket to a new state.
    SetVbucketState(VbucketState),
    /// The stream for this vbucket is starting.
    StreamStart,
    /// The stream for this vbucket is over.
    StreamEnd(StreamEndReason),
}

impl VbucketEvent {
    #[must_use]
    pub const fn new(vbucket: Vbid, kind: VbucketEventKind) -> Self {
        Self { vbucket, kind }
    }

    /// Stable event name for logs and stats.
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self.kind {
            VbucketEventKind::Opaque(_) => "opaque",
            VbucketEventKind::SetVbucketState(_) => "set_vbucket_state",
            VbucketEventKind::StreamStart => "stream_start",
            VbucketEventKind::StreamEnd(_) => "stream_end",
        }
    }

    /// Encoded size of this event on the wire.
    #[must_use]
    pub const fn message_size(&self) -> u32 {
        match self.kind {
            // Opaque markers are carried in a set-vbucket-state packet.
            VbucketEventKind::Opaque(_) | VbucketEventKind::SetVbucketState(_) => {
                SET_VBUCKET_STATE_BASE_MSG_BYTES
            }
            VbucketEventKind::StreamStart => STREAM_REQUEST_BASE_MSG_BYTES,
            VbucketEventKind::StreamEnd(_) => STREAM_END_RESPONSE_BASE_MSG_BYTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Producer-side outbound events
// ---------------------------------------------------------------------------

/// Value/xattr projection switches, set from the channel's open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeValue {
    Yes,
    No,
}

/// See [`IncludeValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeXattrs {
    Yes,
    No,
}

/// One event produced by `Producer::step`, ready for the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    /// Channel-local send sequence number.
    pub seqno: u32,
    /// Whether the wire message carries the ack-request flag.
    pub ack_requested: bool,
    pub payload: OutboundPayload,
}

/// The payload of an [`OutboundEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    /// A document mutation with its materialized body.
    Mutation(Item),
    /// A document deletion; no body.
    Deletion(QueuedItem),
    /// A document expiration; encoded as a deletion.
    Expiration(QueuedItem),
    /// The bucket was flushed.
    Flush,
    /// A vbucket state event (either priority queue).
    Vbucket(VbucketEvent),
}

impl OutboundPayload {
    /// Stable event name for logs and stats.
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::Mutation(_) => "mutation",
            Self::Deletion(_) => "deletion",
            Self::Expiration(_) => "expiration",
            Self::Flush => "flush",
            Self::Vbucket(ev) => ev.kind_str(),
        }
    }

    /// Encoded size of this event on the wire, honoring the channel's
    /// value/xattr projection.
    #[must_use]
    pub fn message_size(&self, include_value: IncludeValue, include_xattrs: IncludeXattrs) -> u32 {
        match self {
            Self::Mutation(item) => mutation_message_size(item, include_value, include_xattrs),
            Self::Deletion(qi) | Self::Expiration(qi) => {
                DELETION_BASE_MSG_BYTES + qi.key().len() as u32
            }
            Self::Flush => SET_VBUCKET_STATE_BASE_MSG_BYTES,
            Self::Vbucket(ev) => ev.message_size(),
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer-side inbound events
// ---------------------------------------------------------------------------

/// One event received from a peer producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// The opaque co-issued at stream setup; must match the passive stream.
    pub opaque: u32,
    pub vbucket: Vbid,
    pub kind: InboundEventKind,
}

/// The payload of an [`InboundEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEventKind {
    Mutation { key: String, value: Vec<u8> },
    Deletion { key: String },
    SnapshotMarker,
    SetVbucketState(VbucketState),
    StreamEnd(StreamEndReason),
}

impl InboundEventKind {
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::Mutation { .. } => "mutation",
            Self::Deletion { .. } => "deletion",
            Self::SnapshotMarker => "snapshot_marker",
            Self::SetVbucketState(_) => "set_vbucket_state",
            Self::StreamEnd(_) => "stream_end",
        }
    }
}

// ---------------------------------------------------------------------------
// Mutation sizing
// ---------------------------------------------------------------------------

/// Offset of the document body within a value whose datatype carries the
/// xattr bit: a 4-byte big-endian length prefix covering the xattr section,
/// followed by the section itself.
///
/// Returns 0 for values too short to carry the prefix.
#[must_use]
pub fn xattr_body_offset(value: &[u8]) -> u32 {
    match value.first_chunk::<4>() {
        Some(prefix) => u32::from_be_bytes(*prefix) + 4,
        None => 0,
    }
}

/// Bytes on the wire for a mutation (or deletion-with-body) message.
///
/// The body charge depends on the channel projection: the xattr section is
/// included only with `include_xattrs`, the document body only with
/// `include_value`.
#[must_use]
pub fn mutation_message_size(
    item: &Item,
    include_value: IncludeValue,
    include_xattrs: IncludeXattrs,
) -> u32 {
    let header = if item.is_deleted() {
        DELETION_BASE_MSG_BYTES
    } else {
        MUTATION_BASE_MSG_BYTES
    };

    let mut body = item.key().len() as u32;
    let xattr_len = if item.datatype().is_xattr() {
        xattr_body_offset(item.value()).min(item.value().len() as u32)
    } else {
        0
    };

    if matches!(include_xattrs, IncludeXattrs::Yes) {
        body += xattr_len;
    }
    if matches!(include_value, IncludeValue::Yes) {
        body += item.value().len() as u32 - xattr_len;
    }
    body += item.ext_meta().len() as u32;

    header + body
}
