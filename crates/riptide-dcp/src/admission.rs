//! Global admission control for disk-backed backfills.
//!
//! Backfills hold open disk cursors, so the number running (or snoozing)
//! at once is bounded process-wide. The bound scales with the engine's
//! memory quota: one backfill slot per [`DB_FILE_MEM`] bytes of the
//! quota's backfill share, clamped to `[1, MAX_ACTIVE_BACKFILLS]`.

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Estimated memory cost of one open database file cursor, in bytes.
pub const DB_FILE_MEM: usize = 10 * 1024;

/// Share of the memory quota available to backfills, in percent.
pub const BACKFILL_MEM_THRESHOLD_PERCENT: usize = 1;

/// Hard ceiling on concurrently admitted backfills.
pub const MAX_ACTIVE_BACKFILLS: usize = 4096;

#[derive(Debug)]
struct Counters {
    active: usize,
    max: usize,
}

/// Bounded counter of concurrently active (or snoozing) disk backfills.
///
/// Shared by every producer in the process.
#[derive(Debug)]
pub struct BackfillAdmission {
    counters: Mutex<Counters>,
}

impl BackfillAdmission {
    /// Create an admission counter sized for `max_data_size` bytes of
    /// memory quota.
    #[must_use]
    pub fn new(max_data_size: usize) -> Self {
        let admission = Self {
            counters: Mutex::new(Counters { active: 0, max: 1 }),
        };
        admission.update_quota(max_data_size);
        admission
    }

    /// Atomically claim a backfill slot. Returns false when every slot is
    /// taken; the caller snoozes and retries after a release.
    pub fn try_acquire(&self) -> bool {
        let mut counters = self.counters.lock();
        if counters.active < counters.max {
            counters.active += 1;
            true
        } else {
            false
        }
    }

    /// Return a slot. Underflow is logged and swallowed; a double release
    /// must not take down the engine.
    pub fn release(&self) {
        {
            let mut counters = self.counters.lock();
            if counters.active > 0 {
                counters.active -= 1;
                return;
            }
        }
        warn!(
            target: "riptide_dcp::admission",
            "backfill admission released below zero"
        );
    }

    /// Recompute the slot bound from a new memory quota. There is always
    /// at least one slot.
    pub fn update_quota(&self, max_data_size: usize) {
        let share = max_data_size as f64 * (BACKFILL_MEM_THRESHOLD_PERCENT as f64 / 100.0);
        let raw = (share / DB_FILE_MEM as f64) as usize;
        let new_max = raw.clamp(1, MAX_ACTIVE_BACKFILLS);
        self.counters.lock().max = new_max;
        debug!(
            target: "riptide_dcp::admission",
            max_active = new_max,
            "backfill admission bound updated"
        );
    }

    /// Currently admitted backfills.
    #[must_use]
    pub fn active(&self) -> usize {
        self.counters.lock().active
    }

    /// Current slot bound.
    #[must_use]
    pub fn max(&self) -> usize {
        self.counters.lock().max
    }
}
