//! Error and status types for the Riptide key-value store.
//!
//! Two layers: [`RiptideError`] is the structured error enum used inside the
//! engine, and [`EngineStatus`] is the numeric status code surfaced across
//! the engine boundary to the front-end (the codes match the binary
//! protocol's status values).

use thiserror::Error;

/// Primary error type for Riptide replication operations.
#[derive(Error, Debug)]
pub enum RiptideError {
    /// A channel already exists for this front-end cookie.
    #[error("connection for cookie {cookie:#x} already exists")]
    DuplicateCookie { cookie: u64 },

    /// A passive stream for this vbucket already exists on some consumer.
    #[error("a passive stream already exists for vb:{vbucket}")]
    DuplicatePassiveStream { vbucket: u16 },

    /// No channel is bound to this cookie.
    #[error("no connection found for cookie {cookie:#x}")]
    UnknownConnection { cookie: u64 },

    /// The channel is draining toward disconnect and cannot take new work.
    #[error("connection is marked for disconnect")]
    Disconnecting,

    /// An inbound event referenced a vbucket with no passive stream.
    #[error("no passive stream for vb:{vbucket}")]
    NoPassiveStream { vbucket: u16 },

    /// An inbound event carried an opaque that does not match the stream.
    #[error("opaque mismatch on vb:{vbucket}: expected {expected:#x}, got {actual:#x}")]
    OpaqueMismatch {
        vbucket: u16,
        expected: u32,
        actual: u32,
    },

    /// An ack referenced a sequence number not present in the ack log.
    #[error("malformed ack for seqno {seqno}: {detail}")]
    MalformedAck { seqno: u32, detail: String },

    /// Transient back-pressure: the caller should retry after a notification.
    #[error("temporary failure: {0}")]
    Tmpfail(&'static str),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Engine status codes surfaced across the engine boundary.
///
/// Numeric values match the binary protocol so they can be handed straight
/// to the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EngineStatus {
    /// Operation completed.
    Success = 0x00,
    /// Key not found.
    KeyEnoent = 0x01,
    /// Key (or stream) already exists.
    KeyEexists = 0x02,
    /// The caller should block until notified.
    Ewouldblock = 0x07,
    /// The connection should be torn down.
    Disconnect = 0x0a,
    /// The vbucket is not owned by this node.
    NotMyVbucket = 0x0c,
    /// Transient failure; retry later.
    Tmpfail = 0x0d,
}

impl EngineStatus {
    /// Stable textual name for logs and stats.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::KeyEnoent => "key_enoent",
            Self::KeyEexists => "key_eexists",
            Self::Ewouldblock => "ewouldblock",
            Self::Disconnect => "disconnect",
            Self::NotMyVbucket => "not_my_vbucket",
            Self::Tmpfail => "tmpfail",
        }
    }

    /// Whether this status indicates success.
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl RiptideError {
    /// Map this error to the status code crossing the engine boundary.
    #[must_use]
    pub const fn status(&self) -> EngineStatus {
        match self {
            Self::DuplicateCookie { .. } | Self::DuplicatePassiveStream { .. } => {
                EngineStatus::KeyEexists
            }
            Self::UnknownConnection { .. }
            | Self::NoPassiveStream { .. }
            | Self::OpaqueMismatch { .. } => EngineStatus::KeyEnoent,
            Self::Disconnecting => EngineStatus::Disconnect,
            Self::MalformedAck { .. } | Self::Internal(_) => EngineStatus::Disconnect,
            Self::Tmpfail(_) => EngineStatus::Tmpfail,
        }
    }

    /// Whether this is a transient condition that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Tmpfail(_))
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `RiptideError`.
pub type Result<T> = std::result::Result<T, RiptideError>;
