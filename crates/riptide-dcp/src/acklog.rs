//! The ring of sent-but-unacknowledged events on an acking channel.
//!
//! When the ack protocol is enabled, every event leaving a producer is
//! recorded here with the sequence number it was sent under. A positive ack
//! drops the covered prefix; a negative ack drains the suffix back out so
//! the producer can replay it. Nothing is removed until acked or drained.
//!
//! Invariant: entries are ordered by seqno and seqnos are strictly
//! increasing.

use std::collections::VecDeque;
use std::time::Instant;

use riptide_types::QueuedItem;

use crate::response::{EventPriority, VbucketEvent};

/// What was sent: enough to reconstruct the event on replay.
///
/// Mutations keep only their queue entry (key + vbucket + op); bodies are
/// re-fetched on replay like any other send.
#[derive(Debug, Clone)]
pub enum AckedEvent {
    Mutation(QueuedItem),
    Vbucket {
        event: VbucketEvent,
        priority: EventPriority,
    },
}

/// One unacknowledged sent event.
#[derive(Debug, Clone)]
pub struct AckLogElement {
    pub seqno: u32,
    pub sent_at: Instant,
    pub event: AckedEvent,
}

/// Sequenced log of unacknowledged events.
#[derive(Debug, Default)]
pub struct AckLog {
    entries: VecDeque<AckLogElement>,
}

impl AckLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sent event. Seqnos must arrive strictly increasing.
    pub fn record(&mut self, seqno: u32, event: AckedEvent) {
        debug_assert!(
            self.entries.back().is_none_or(|last| last.seqno < seqno),
            "ack log seqnos must be strictly increasing"
        );
        self.entries.push_back(AckLogElement {
            seqno,
            sent_at: Instant::now(),
            event,
        });
    }

    /// Drop every entry with `seqno <= up_to`; returns how many were
    /// acknowledged.
    pub fn ack_through(&mut self, up_to: u32) -> usize {
        let mut dropped = 0;
        while self
            .entries
            .front()
            .is_some_and(|front| front.seqno <= up_to)
        {
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Remove and return every entry with `seqno >= from`, in original
    /// order. The caller re-queues them for replay.
    pub fn drain_from(&mut self, from: u32) -> Vec<AckLogElement> {
        let split = self.entries.partition_point(|e| e.seqno < from);
        self.entries.split_off(split).into()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the oldest unacknowledged entry was sent.
    #[must_use]
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.sent_at)
    }

    /// Seqno of the most recent entry.
    #[must_use]
    pub fn last_seqno(&self) -> Option<u32> {
        self.entries.back().map(|e| e.seqno)
    }

    /// Whether `window` in-flight events have accumulated.
    #[inline]
    #[must_use]
    pub fn is_window_full(&self, window: usize) -> bool {
        self.entries.len() >= window
    }
}
