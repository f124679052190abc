//! Stats surfacing: the sink interface and registry-wide counters.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where stats go. The engine adapts this onto the protocol's `ADD_STAT`
/// callback; tests collect into a map.
pub trait StatSink {
    fn stat(&mut self, key: &str, value: &str);
}

impl<F: FnMut(&str, &str)> StatSink for F {
    fn stat(&mut self, key: &str, value: &str) {
        self(key, value);
    }
}

/// Emit one `<prefix>:<key>` stat.
pub(crate) fn add_prefixed_stat(
    sink: &mut dyn StatSink,
    prefix: &str,
    key: &str,
    value: impl Display,
) {
    sink.stat(&format!("{prefix}:{key}"), &value.to_string());
}

/// Registry-wide lifetime counters.
#[derive(Debug, Default)]
pub struct ConnCounters {
    pub producers_created: AtomicU64,
    pub consumers_created: AtomicU64,
    pub disconnects: AtomicU64,
    pub conns_released: AtomicU64,
}

/// Point-in-time copy of [`ConnCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ConnCountersSnapshot {
    pub producers_created: u64,
    pub consumers_created: u64,
    pub disconnects: u64,
    pub conns_released: u64,
}

impl ConnCounters {
    #[must_use]
    pub fn snapshot(&self) -> ConnCountersSnapshot {
        ConnCountersSnapshot {
            producers_created: self.producers_created.load(Ordering::Relaxed),
            consumers_created: self.consumers_created.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            conns_released: self.conns_released.load(Ordering::Relaxed),
        }
    }
}
