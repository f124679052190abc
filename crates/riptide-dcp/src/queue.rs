//! The deduplicated FIFO of pending mutations for one channel.
//!
//! The queue pairs an insertion-ordered list with an ordered dedup index
//! keyed on `(vbucket, key)`. A duplicate push keeps the existing entry in
//! its original position and skips the new one; only the most recent op for
//! a key matters to a replica, and the earlier queue slot delivers it
//! sooner.
//!
//! Invariants, checked at every mutator exit in debug builds:
//! - `list.len() == index.len()`
//! - `mem_size` equals the sum of `mem_size()` over the listed items

use std::collections::{BTreeSet, VecDeque};

use riptide_types::{QueuedItem, Vbid};

use crate::filter::VBucketFilter;

/// Result of popping the queue head through a filter.
#[derive(Debug, PartialEq, Eq)]
pub struct PopOutcome {
    /// The first filter-admitted item, if any.
    pub item: Option<QueuedItem>,
    /// Items discarded because the current filter rejected them.
    pub skipped: usize,
}

/// Deduplicated FIFO of pending mutations.
#[derive(Debug, Default)]
pub struct EventQueue {
    list: VecDeque<QueuedItem>,
    index: BTreeSet<(Vbid, String)>,
    mem_size: usize,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item` unless an item with the same `(key, vbucket)` is
    /// already pending. Returns whether the queue was empty before the
    /// insertion attempt; callers use that to decide whether to notify.
    pub fn push(&mut self, item: QueuedItem) -> bool {
        let was_empty = self.list.is_empty();
        if self.index.insert((item.vbucket(), item.key().to_owned())) {
            self.mem_size += item.mem_size();
            self.list.push_back(item);
        }
        self.check_invariants();
        was_empty
    }

    /// Insert `item` at the head, for ack-log replay. Deduplication still
    /// applies: if the key is already pending, the existing (later) entry is
    /// kept and this insert is skipped.
    pub fn push_front(&mut self, item: QueuedItem) -> bool {
        let was_empty = self.list.is_empty();
        if self.index.insert((item.vbucket(), item.key().to_owned())) {
            self.mem_size += item.mem_size();
            self.list.push_front(item);
        }
        self.check_invariants();
        was_empty
    }

    /// Remove from the head, skipping items the current filter rejects.
    /// Skipped items are dropped and counted, not retained.
    pub fn pop(&mut self, filter: &VBucketFilter) -> PopOutcome {
        let mut skipped = 0;
        while let Some(item) = self.list.pop_front() {
            self.index.remove(&(item.vbucket(), item.key().to_owned()));
            self.mem_size = self.mem_size.saturating_sub(item.mem_size());
            if filter.admits(item.vbucket()) {
                self.check_invariants();
                return PopOutcome {
                    item: Some(item),
                    skipped,
                };
            }
            skipped += 1;
        }
        self.check_invariants();
        PopOutcome {
            item: None,
            skipped,
        }
    }

    /// Splice a batch onto the tail in order. The caller asserts the batch
    /// is duplicate-free with respect to the queue; dedup is not re-checked
    /// here (this is the bulk path used when requeueing drained work).
    pub fn append(&mut self, batch: impl IntoIterator<Item = QueuedItem>) {
        for item in batch {
            let inserted = self.index.insert((item.vbucket(), item.key().to_owned()));
            debug_assert!(inserted, "append() batch must be duplicate-free");
            self.mem_size += item.mem_size();
            self.list.push_back(item);
        }
        self.check_invariants();
    }

    /// Drop every pending item for one vbucket. Returns how many were
    /// removed.
    pub fn purge_vbucket(&mut self, vbucket: Vbid) -> usize {
        let before = self.list.len();
        self.list.retain(|item| item.vbucket() != vbucket);
        self.index.retain(|(vb, _)| *vb != vbucket);
        self.mem_size = self.list.iter().map(QueuedItem::mem_size).sum();
        self.check_invariants();
        before - self.list.len()
    }

    /// Empty the list and the dedup index together.
    pub fn clear(&mut self) {
        self.list.clear();
        self.index.clear();
        self.mem_size = 0;
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Bytes accounted to pending items.
    #[inline]
    #[must_use]
    pub const fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// Size of the dedup index; equals `len()` outside of a mutator.
    #[inline]
    #[must_use]
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    fn check_invariants(&self) {
        debug_assert_eq!(self.list.len(), self.index.len());
        debug_assert_eq!(
            self.mem_size,
            self.list.iter().map(QueuedItem::mem_size).sum::<usize>()
        );
    }
}
