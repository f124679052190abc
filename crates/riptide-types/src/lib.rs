//! Shared vocabulary types for the Riptide key-value store.
//!
//! Everything here is deliberately small and dependency-free: partition
//! identifiers, vbucket states, connection cookies, and the queued-item
//! representation shared between the replication subsystem and the engine.

use std::fmt;

/// A vbucket identifier: one logical partition of the keyspace.
///
/// Riptide shards the keyspace into a fixed number of vbuckets (1024 by
/// default); each is independently replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct Vbid(u16);

impl Vbid {
    /// Create a new vbucket id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Get the raw u16 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb:{}", self.0)
    }
}

impl From<u16> for Vbid {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

/// The replication state of a vbucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum VbucketState {
    /// Serving reads and writes; the authoritative copy.
    Active,
    /// Receiving a replication stream from the active copy.
    Replica,
    /// Mid-transfer; not yet serving traffic.
    Pending,
    /// Not present on this node.
    Dead,
}

impl VbucketState {
    /// Stable textual name, as rendered in stats and log output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Replica => "replica",
            Self::Pending => "pending",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for VbucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque, process-unique token identifying one front-end connection.
///
/// The front-end I/O layer mints cookies; the replication layer only ever
/// compares them and hands them back through the host API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct Cookie(u64);

impl Cookie {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// The logical operation a queued item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum QueueOp {
    /// A document was stored or updated.
    Mutation,
    /// A document was deleted.
    Deletion,
    /// A document expired.
    Expiration,
    /// The whole bucket was flushed.
    Flush,
    /// A vbucket state transition rides the data queue.
    SetVbucket,
}

impl QueueOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::Deletion => "deletion",
            Self::Expiration => "expiration",
            Self::Flush => "flush",
            Self::SetVbucket => "set_vbucket",
        }
    }
}

/// A logical mutation pending transmission on a replication channel.
///
/// The pending queue stores only keys, not document bodies; bodies are
/// re-fetched at send time so that a long queue does not pin the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    key: String,
    vbucket: Vbid,
    op: QueueOp,
}

impl QueuedItem {
    #[must_use]
    pub fn new(key: impl Into<String>, vbucket: Vbid, op: QueueOp) -> Self {
        Self {
            key: key.into(),
            vbucket,
            op,
        }
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    #[must_use]
    pub const fn vbucket(&self) -> Vbid {
        self.vbucket
    }

    #[inline]
    #[must_use]
    pub const fn op(&self) -> QueueOp {
        self.op
    }

    /// Approximate memory footprint, used for queue accounting.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len()
    }
}

/// Datatype bits carried on a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[repr(transparent)]
pub struct Datatype(u8);

impl Datatype {
    /// Raw bytes, no interpretation.
    pub const RAW: Self = Self(0x00);
    /// The value is JSON.
    pub const JSON: Self = Self(0x01);
    /// The value is compressed.
    pub const SNAPPY: Self = Self(0x02);
    /// The value carries an extended-attribute section prefix.
    pub const XATTR: Self = Self(0x04);

    #[inline]
    #[must_use]
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether the xattr bit is set.
    #[inline]
    #[must_use]
    pub const fn is_xattr(self) -> bool {
        self.0 & Self::XATTR.0 != 0
    }

    /// Union of two datatype sets.
    #[inline]
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A fully materialized document, as fetched from cache or disk for
/// transmission on a replication channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    key: String,
    vbucket: Vbid,
    value: Vec<u8>,
    datatype: Datatype,
    ext_meta: Vec<u8>,
    by_seqno: u64,
    deleted: bool,
}

impl Item {
    #[must_use]
    pub fn new(key: impl Into<String>, vbucket: Vbid, value: Vec<u8>, by_seqno: u64) -> Self {
        Self {
            key: key.into(),
            vbucket,
            value,
            datatype: Datatype::RAW,
            ext_meta: Vec::new(),
            by_seqno,
            deleted: false,
        }
    }

    /// Builder-style datatype override.
    #[must_use]
    pub fn with_datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    /// Builder-style extended-metadata override.
    #[must_use]
    pub fn with_ext_meta(mut self, ext_meta: Vec<u8>) -> Self {
        self.ext_meta = ext_meta;
        self
    }

    /// Builder-style deletion marker.
    #[must_use]
    pub fn into_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    #[must_use]
    pub const fn vbucket(&self) -> Vbid {
        self.vbucket
    }

    #[inline]
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    #[inline]
    #[must_use]
    pub const fn datatype(&self) -> Datatype {
        self.datatype
    }

    #[inline]
    #[must_use]
    pub fn ext_meta(&self) -> &[u8] {
        &self.ext_meta
    }

    #[inline]
    #[must_use]
    pub const fn by_seqno(&self) -> u64 {
        self.by_seqno
    }

    #[inline]
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Approximate memory footprint.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value.len() + self.ext_meta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vbid_display() {
        assert_eq!(Vbid::new(7).to_string(), "vb:7");
        assert_eq!(Vbid::from(1023).get(), 1023);
    }

    #[test]
    fn vbucket_state_names() {
        assert_eq!(VbucketState::Active.as_str(), "active");
        assert_eq!(VbucketState::Dead.to_string(), "dead");
    }

    #[test]
    fn cookie_display_is_hex() {
        assert_eq!(Cookie::new(0xAB).to_string(), "0xab");
    }

    #[test]
    fn queued_item_mem_size_tracks_key() {
        let short = QueuedItem::new("k", Vbid::new(0), QueueOp::Mutation);
        let long = QueuedItem::new("a-much-longer-key", Vbid::new(0), QueueOp::Mutation);
        assert!(long.mem_size() > short.mem_size());
        assert_eq!(
            long.mem_size() - short.mem_size(),
            "a-much-longer-key".len() - 1
        );
    }

    #[test]
    fn datatype_bits() {
        let dt = Datatype::JSON.with(Datatype::XATTR);
        assert!(dt.is_xattr());
        assert_eq!(dt.bits(), 0x05);
        assert!(!Datatype::SNAPPY.is_xattr());
    }

    #[test]
    fn item_builders() {
        let item = Item::new("k", Vbid::new(3), vec![1, 2, 3], 99)
            .with_datatype(Datatype::XATTR)
            .into_deleted();
        assert!(item.is_deleted());
        assert!(item.datatype().is_xattr());
        assert_eq!(item.by_seqno(), 99);
        assert_eq!(item.value(), &[1, 2, 3]);
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn queued_item_mem_size_is_base_plus_key(
                key in ".{0,64}",
                vb in any::<u16>(),
            ) {
                let item = QueuedItem::new(key.clone(), Vbid::new(vb), QueueOp::Mutation);
                prop_assert_eq!(
                    item.mem_size(),
                    std::mem::size_of::<QueuedItem>() + key.len()
                );
            }

            #[test]
            fn item_mem_size_counts_every_buffer(
                key in "[a-z]{1,16}",
                value_len in 0usize..1024,
                meta_len in 0usize..64,
            ) {
                let item = Item::new(key.clone(), Vbid::new(0), vec![0u8; value_len], 1)
                    .with_ext_meta(vec![0u8; meta_len]);
                prop_assert_eq!(
                    item.mem_size(),
                    std::mem::size_of::<Item>() + key.len() + value_len + meta_len
                );
            }

            #[test]
            fn datatype_union_is_a_superset(a in any::<u8>(), b in any::<u8>()) {
                let joined = Datatype::new(a).with(Datatype::new(b));
                prop_assert_eq!(joined.bits() & a, a);
                prop_assert_eq!(joined.bits() & b, b);
                prop_assert_eq!(joined.is_xattr(), (a | b) & Datatype::XATTR.bits() != 0);
            }
        }
    }
}
