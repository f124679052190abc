//! Per-channel state shared by producers and consumers.
//!
//! A channel is one front-end connection speaking the replication protocol.
//! [`ConnCore`] holds the lifecycle booleans every channel carries;
//! [`Connection`] is the registry's tagged handle over the two concrete
//! kinds.
//!
//! Lifecycle flags are independent:
//! - `connected`: the transport is alive.
//! - `disconnect`: teardown was requested; the channel keeps draining.
//! - `paused`: stalled until the next notification.
//! - `reserved`: the front-end still holds a reference that must be
//!   released exactly once on reap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use riptide_types::Cookie;

use crate::consumer::Consumer;
use crate::producer::Producer;
use crate::response::StreamEndReason;
use crate::stats::{StatSink, add_prefixed_stat};

/// Prefix for named channels.
pub const DCP_NAME_PREFIX: &str = "eq_dcpq:";
/// Prefix for anonymous channels.
pub const ANON_NAME_PREFIX: &str = "eq_tapq:anon_";

static CONN_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `eq_dcpq:<user-supplied>`.
#[must_use]
pub fn conn_name(user_supplied: &str) -> String {
    format!("{DCP_NAME_PREFIX}{user_supplied}")
}

/// `eq_tapq:anon_<counter>`, unique for the life of the process.
#[must_use]
pub fn anon_conn_name() -> String {
    let id = CONN_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{ANON_NAME_PREFIX}{id}")
}

/// Lifecycle state common to every channel.
#[derive(Debug)]
pub struct ConnCore {
    cookie: Cookie,
    name: String,
    created: Instant,
    expiry: Mutex<Option<Instant>>,
    connected: AtomicBool,
    disconnect: AtomicBool,
    reserved: AtomicBool,
    paused: AtomicBool,
    supports_ack: AtomicBool,
    notify_sent: AtomicBool,
    num_disconnects: AtomicU64,
}

impl ConnCore {
    /// A freshly opened channel: connected, reserved by the front-end,
    /// nothing else set.
    #[must_use]
    pub fn new(cookie: Cookie, name: String) -> Self {
        Self {
            cookie,
            name,
            created: Instant::now(),
            expiry: Mutex::new(None),
            connected: AtomicBool::new(true),
            disconnect: AtomicBool::new(false),
            reserved: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            supports_ack: AtomicBool::new(false),
            notify_sent: AtomicBool::new(false),
            num_disconnects: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn cookie(&self) -> Cookie {
        self.cookie
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flipping to disconnected counts a disconnect.
    pub fn set_connected(&self, connected: bool) {
        if !connected && self.connected.swap(connected, Ordering::AcqRel) {
            self.num_disconnects.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.connected.store(connected, Ordering::Release);
    }

    #[must_use]
    pub fn do_disconnect(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Request teardown. Idempotent.
    pub fn set_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    /// Drop the front-end reservation. Returns true only for the caller
    /// that actually released it.
    pub fn release_reservation(&self) -> bool {
        self.reserved.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    #[must_use]
    pub fn supports_ack(&self) -> bool {
        self.supports_ack.load(Ordering::Acquire)
    }

    pub fn set_supports_ack(&self, ack: bool) {
        self.supports_ack.store(ack, Ordering::Release);
    }

    /// Latch that at most one wake is outstanding. Returns true if this
    /// caller set it (and should deliver the notification).
    pub fn claim_notify(&self) -> bool {
        !self.notify_sent.swap(true, Ordering::AcqRel)
    }

    /// Re-arm notification; called when the channel steps.
    pub fn clear_notify(&self) {
        self.notify_sent.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn expiry(&self) -> Option<Instant> {
        *self.expiry.lock()
    }

    pub fn set_expiry(&self, at: Option<Instant>) {
        *self.expiry.lock() = at;
    }

    #[must_use]
    pub fn num_disconnects(&self) -> u64 {
        self.num_disconnects.load(Ordering::Relaxed)
    }

    /// The base stats every channel reports, prefixed with its name.
    pub fn add_base_stats(&self, conn_type: &str, sink: &mut dyn StatSink) {
        add_prefixed_stat(sink, &self.name, "type", conn_type);
        add_prefixed_stat(sink, &self.name, "created", self.created.elapsed().as_secs());
        add_prefixed_stat(sink, &self.name, "connected", self.is_connected());
        add_prefixed_stat(sink, &self.name, "pending_disconnect", self.do_disconnect());
        add_prefixed_stat(sink, &self.name, "supports_ack", self.supports_ack());
        let disconnects = self.num_disconnects();
        if disconnects > 0 {
            add_prefixed_stat(sink, &self.name, "disconnects", disconnects);
        }
    }
}

/// The registry's handle on one channel of either kind.
#[derive(Debug, Clone)]
pub enum Connection {
    Producer(Arc<Producer>),
    Consumer(Arc<Consumer>),
}

impl Connection {
    #[must_use]
    pub fn core(&self) -> &ConnCore {
        match self {
            Self::Producer(p) => p.core(),
            Self::Consumer(c) => c.core(),
        }
    }

    #[must_use]
    pub const fn conn_type(&self) -> &'static str {
        match self {
            Self::Producer(_) => "producer",
            Self::Consumer(_) => "consumer",
        }
    }

    #[must_use]
    pub const fn as_producer(&self) -> Option<&Arc<Producer>> {
        match self {
            Self::Producer(p) => Some(p),
            Self::Consumer(_) => None,
        }
    }

    #[must_use]
    pub const fn as_consumer(&self) -> Option<&Arc<Consumer>> {
        match self {
            Self::Producer(_) => None,
            Self::Consumer(c) => Some(c),
        }
    }

    /// Close every stream on the channel, with `reason` on the producer
    /// side.
    pub fn close_all_streams(&self, reason: StreamEndReason) {
        match self {
            Self::Producer(p) => p.close_all_streams(reason),
            Self::Consumer(c) => c.close_all_streams(),
        }
    }

    /// Clear the paused state. Returns true when the caller should deliver
    /// a front-end wake for this channel.
    pub fn notify_paused(&self) -> bool {
        match self {
            Self::Producer(p) => p.notify_paused(),
            Self::Consumer(c) => {
                let was_paused = c.core().is_paused();
                c.core().set_paused(false);
                was_paused && c.core().claim_notify()
            }
        }
    }

    pub fn add_stats(&self, sink: &mut dyn StatSink) {
        match self {
            Self::Producer(p) => p.add_stats(sink),
            Self::Consumer(c) => c.add_stats(sink),
        }
    }
}
