//! The indexed catalog of live replication channels.
//!
//! Three structures, three locking regimes:
//!
//! - `conns` (the cookie map plus the dead list) under one exclusive lock.
//! - the per-vbucket producer index, partitioned into [`VB_CONN_LOCK_NUM`]
//!   shards so the per-mutation notify path never touches the main lock.
//! - `release_lock`, serializing final reference release; only ever taken
//!   with no other registry lock held.
//!
//! Lock order, process-wide: `conns` → shard lock → per-channel locks.
//! Stream-close paths run with no registry lock held at all: closing a
//! stream can take engine-side locks that are also taken while the engine
//! calls into the registry, and nesting them under `conns` would deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use riptide_error::{EngineStatus, Result, RiptideError};
use riptide_types::{Cookie, Vbid, VbucketState};

use crate::admission::BackfillAdmission;
use crate::config::{
    DcpSettings, KEY_CONSUMER_BATCH_SIZE, KEY_CONSUMER_YIELD_LIMIT, KEY_MAX_SIZE,
    KEY_MIN_COMPRESSION_RATIO, TunableStore, ValueChangedListener,
};
use crate::conn::{Connection, anon_conn_name, conn_name};
use crate::consumer::Consumer;
use crate::filter::VBucketFilter;
use crate::host::EngineHost;
use crate::producer::{OpenFlags, Producer};
use crate::response::StreamEndReason;
use crate::stats::{ConnCounters, StatSink};

/// Number of spin shards guarding the per-vbucket index.
pub const VB_CONN_LOCK_NUM: usize = 32;

#[derive(Default)]
struct ConnStore {
    by_cookie: HashMap<Cookie, Connection>,
    dead: Vec<Connection>,
}

type VbConnShard = Mutex<HashMap<Vbid, Vec<Connection>>>;

/// The connection registry.
pub struct ConnMap {
    settings: Arc<DcpSettings>,
    host: Arc<dyn EngineHost>,
    conns: Mutex<ConnStore>,
    vb_conn_shards: Vec<VbConnShard>,
    release_lock: Mutex<()>,
    admission: Arc<BackfillAdmission>,
    min_compression_ratio: AtomicU32,
    notifier_stopped: AtomicBool,
    counters: ConnCounters,
}

impl ConnMap {
    #[must_use]
    pub fn new(settings: DcpSettings, host: Arc<dyn EngineHost>) -> Arc<Self> {
        let settings = settings.validated();
        let admission = Arc::new(BackfillAdmission::new(settings.max_data_size));
        let min_ratio = settings.min_compression_ratio;
        Arc::new(Self {
            settings: Arc::new(settings),
            host,
            conns: Mutex::new(ConnStore::default()),
            vb_conn_shards: (0..VB_CONN_LOCK_NUM).map(|_| Mutex::new(HashMap::new())).collect(),
            release_lock: Mutex::new(()),
            admission,
            min_compression_ratio: AtomicU32::new(min_ratio.to_bits()),
            notifier_stopped: AtomicBool::new(false),
            counters: ConnCounters::default(),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<DcpSettings> {
        &self.settings
    }

    #[must_use]
    pub fn admission(&self) -> &Arc<BackfillAdmission> {
        &self.admission
    }

    // -- opening channels ---------------------------------------------------

    /// Open a producer channel for `cookie`.
    ///
    /// A cookie may carry only one channel: a second open marks the first
    /// for disconnect and fails. Opening under a name another channel holds
    /// marks the older channel for disconnect; both keep draining.
    pub fn open_producer(
        &self,
        cookie: Cookie,
        name: Option<&str>,
        flags: OpenFlags,
    ) -> Result<Arc<Producer>> {
        let full_name = name.map_or_else(anon_conn_name, conn_name);
        let producer = {
            let mut conns = self.conns.lock();
            if let Some(existing) = conns.by_cookie.get(&cookie) {
                existing.core().set_disconnect();
                warn!(
                    target: "riptide_dcp::connmap",
                    cookie = %cookie,
                    "producer open failed: cookie already bound"
                );
                return Err(RiptideError::DuplicateCookie {
                    cookie: cookie.get(),
                });
            }
            let mut displaced = 0;
            for conn in conns.by_cookie.values() {
                if conn.core().name() == full_name {
                    conn.core().set_disconnect();
                    displaced += 1;
                    info!(
                        target: "riptide_dcp::connmap",
                        name = %full_name,
                        old_cookie = %conn.core().cookie(),
                        new_cookie = %cookie,
                        "disconnecting existing channel with the same name"
                    );
                }
            }
            let producer = Producer::new(
                cookie,
                full_name.clone(),
                flags,
                Arc::clone(&self.settings),
                Arc::clone(&self.admission),
            );
            if displaced > 0 {
                producer.note_reconnect();
            }
            let conn = Connection::Producer(Arc::clone(&producer));
            conns.by_cookie.insert(cookie, conn.clone());
            // A fresh producer has the admit-all filter, so it joins every
            // vbucket's notify list.
            self.index_conn(&conn, &self.admitted_vbuckets(&producer.filter()));
            producer
        };
        self.counters.producers_created.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "riptide_dcp::connmap",
            name = %full_name,
            cookie = %cookie,
            "producer connection created"
        );
        Ok(producer)
    }

    /// Open a consumer channel for `cookie`. Same cookie and name rules as
    /// [`open_producer`](Self::open_producer).
    pub fn open_consumer(&self, cookie: Cookie, name: Option<&str>) -> Result<Arc<Consumer>> {
        let full_name = name.map_or_else(anon_conn_name, conn_name);
        let consumer = {
            let mut conns = self.conns.lock();
            if let Some(existing) = conns.by_cookie.get(&cookie) {
                existing.core().set_disconnect();
                warn!(
                    target: "riptide_dcp::connmap",
                    cookie = %cookie,
                    "consumer open failed: cookie already bound"
                );
                return Err(RiptideError::DuplicateCookie {
                    cookie: cookie.get(),
                });
            }
            for conn in conns.by_cookie.values() {
                if conn.core().name() == full_name {
                    conn.core().set_disconnect();
                    info!(
                        target: "riptide_dcp::connmap",
                        name = %full_name,
                        old_cookie = %conn.core().cookie(),
                        new_cookie = %cookie,
                        "disconnecting existing channel with the same name"
                    );
                }
            }
            let consumer = Arc::new(Consumer::new(
                cookie,
                full_name.clone(),
                self.settings.consumer_yield_threshold,
                self.settings.consumer_batch_size,
            ));
            conns
                .by_cookie
                .insert(cookie, Connection::Consumer(Arc::clone(&consumer)));
            consumer
        };
        self.counters.consumers_created.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "riptide_dcp::connmap",
            name = %full_name,
            cookie = %cookie,
            "consumer connection created"
        );
        Ok(consumer)
    }

    // -- per-vbucket index --------------------------------------------------

    /// Replace a producer's vbucket filter and re-index it.
    pub fn set_vbucket_filter(&self, cookie: Cookie, vbuckets: &[Vbid]) -> Result<()> {
        let conns = self.conns.lock();
        let conn = conns
            .by_cookie
            .get(&cookie)
            .ok_or(RiptideError::UnknownConnection {
                cookie: cookie.get(),
            })?;
        let producer = conn
            .as_producer()
            .ok_or_else(|| RiptideError::internal("vbucket filter on a consumer channel"))?;

        let old = self.admitted_vbuckets(&producer.filter());
        producer.set_vbucket_filter(vbuckets);
        let new = self.admitted_vbuckets(&producer.filter());

        let removed: Vec<Vbid> = old.iter().copied().filter(|vb| !new.contains(vb)).collect();
        let added: Vec<Vbid> = new.iter().copied().filter(|vb| !old.contains(vb)).collect();
        self.unindex_conn_from(conn, &removed);
        self.index_conn(conn, &added);
        Ok(())
    }

    /// The vbuckets a filter puts a producer on the notify list for.
    fn admitted_vbuckets(&self, filter: &VBucketFilter) -> Vec<Vbid> {
        if filter.is_empty() {
            (0..self.settings.num_vbuckets).map(Vbid::new).collect()
        } else {
            filter
                .iter()
                .filter(|vb| vb.get() < self.settings.num_vbuckets)
                .collect()
        }
    }

    fn shard_for(&self, vbucket: Vbid) -> &VbConnShard {
        &self.vb_conn_shards[vbucket.get() as usize % VB_CONN_LOCK_NUM]
    }

    fn index_conn(&self, conn: &Connection, vbuckets: &[Vbid]) {
        for &vb in vbuckets {
            self.shard_for(vb)
                .lock()
                .entry(vb)
                .or_default()
                .push(conn.clone());
        }
    }

    fn unindex_conn_from(&self, conn: &Connection, vbuckets: &[Vbid]) {
        let cookie = conn.core().cookie();
        for &vb in vbuckets {
            let mut shard = self.shard_for(vb).lock();
            if let Some(list) = shard.get_mut(&vb) {
                list.retain(|c| c.core().cookie() != cookie);
                if list.is_empty() {
                    shard.remove(&vb);
                }
            }
        }
    }

    /// Sweep a channel out of every shard (reap path; the filter may have
    /// changed since it was indexed).
    fn unindex_conn(&self, conn: &Connection) {
        let cookie = conn.core().cookie();
        for shard in &self.vb_conn_shards {
            let mut shard = shard.lock();
            shard.retain(|_, list| {
                list.retain(|c| c.core().cookie() != cookie);
                !list.is_empty()
            });
        }
    }

    /// Wake every producer interested in a durable mutation on `vbucket`.
    ///
    /// This is the hot path: only the vbucket's shard lock is taken, never
    /// the main connection lock. Wakes coalesce until the channel steps.
    pub fn notify_vb_connections(&self, vbucket: Vbid, seqno: u64) {
        let to_wake: Vec<Cookie> = {
            let shard = self.shard_for(vbucket).lock();
            match shard.get(&vbucket) {
                Some(conns) => conns
                    .iter()
                    .filter_map(Connection::as_producer)
                    .filter(|p| p.notify_seqno_available(vbucket, seqno))
                    .map(|p| p.core().cookie())
                    .collect(),
                None => Vec::new(),
            }
        };
        for cookie in to_wake {
            self.host.notify_io_complete(cookie, EngineStatus::Success);
        }
    }

    /// First producer on `vbucket` that takes slow-stream corrective action
    /// wins. Shard lock only.
    pub fn handle_slow_stream(&self, vbucket: Vbid, name: &str) -> bool {
        let shard = self.shard_for(vbucket).lock();
        let Some(conns) = shard.get(&vbucket) else {
            return false;
        };
        conns
            .iter()
            .filter_map(Connection::as_producer)
            .any(|p| p.handle_slow_stream(vbucket, name))
    }

    // -- passive stream arbitration ----------------------------------------

    /// Add a passive stream to `consumer`, enforcing that at most one
    /// exists per vbucket across all consumers.
    pub fn add_passive_stream(
        &self,
        consumer: &Arc<Consumer>,
        opaque: u32,
        vbucket: Vbid,
        flags: u32,
    ) -> Result<()> {
        let conns = self.conns.lock();
        for conn in conns.by_cookie.values() {
            if let Some(other) = conn.as_consumer() {
                if other.is_stream_present(vbucket) {
                    warn!(
                        target: "riptide_dcp::connmap",
                        vbucket = vbucket.get(),
                        holder = other.core().name(),
                        "passive stream already exists for vbucket"
                    );
                    return Err(RiptideError::DuplicatePassiveStream {
                        vbucket: vbucket.get(),
                    });
                }
            }
        }
        consumer.add_stream(opaque, vbucket, flags)
    }

    // -- stream close fan-out -----------------------------------------------

    /// A vbucket changed state: producers close matching streams;
    /// consumers too when `close_inbound` is set.
    pub fn vbucket_state_changed(
        &self,
        vbucket: Vbid,
        state: VbucketState,
        close_inbound: bool,
    ) {
        let conns = self.conns.lock();
        for conn in conns.by_cookie.values() {
            match conn {
                Connection::Producer(p) => p.vbucket_state_changed(vbucket, state),
                Connection::Consumer(c) if close_inbound => {
                    c.vbucket_state_changed(vbucket, state);
                }
                Connection::Consumer(_) => {}
            }
        }
    }

    /// A vbucket rolled back: every producer stream on it ends.
    pub fn close_streams_due_to_rollback(&self, vbucket: Vbid) {
        let conns = self.conns.lock();
        for conn in conns.by_cookie.values() {
            if let Some(producer) = conn.as_producer() {
                producer.close_stream(vbucket, StreamEndReason::Rollback);
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Tear down the channel bound to `cookie`. Safe to call twice; the
    /// second call finds nothing.
    pub fn disconnect(&self, cookie: Cookie) {
        // Phase 1: unbind the cookie under the connection lock.
        let conn = { self.conns.lock().by_cookie.remove(&cookie) };
        let Some(conn) = conn else {
            debug!(
                target: "riptide_dcp::connmap",
                cookie = %cookie,
                "disconnect for unknown cookie"
            );
            return;
        };
        info!(
            target: "riptide_dcp::connmap",
            cookie = %cookie,
            name = conn.core().name(),
            "removing connection"
        );
        conn.core().set_disconnect();
        conn.core().set_connected(false);
        conn.core().set_expiry(Some(std::time::Instant::now()));

        // Phase 2: close streams with no registry lock held. Stream close
        // can take engine locks that are also held while the engine calls
        // back into this registry.
        match &conn {
            Connection::Producer(p) => p.close_all_streams(StreamEndReason::Disconnected),
            Connection::Consumer(c) => {
                c.cancel_task();
                c.close_all_streams();
            }
        }

        // Phase 3: park it on the dead list for the reaper.
        self.conns.lock().dead.push(conn);
        self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Periodic maintenance: poke stalled channels and reap dead ones.
    pub fn manage_connections(&self) {
        let now = std::time::Instant::now();
        let (release, to_notify) = {
            let mut conns = self.conns.lock();
            let release: Vec<Connection> = conns.dead.drain(..).collect();
            // A channel parked past its keep-alive is not coming back on
            // its own; force the teardown request.
            for conn in conns.by_cookie.values() {
                if conn.core().is_paused()
                    && !conn.core().do_disconnect()
                    && conn.core().expiry().is_some_and(|at| at <= now)
                {
                    warn!(
                        target: "riptide_dcp::connmap",
                        name = conn.core().name(),
                        "paused channel exceeded keep-alive; disconnecting"
                    );
                    conn.core().set_disconnect();
                }
            }
            // Every paused or disconnecting reserved channel gets poked,
            // even if a wake was already sent: this once-a-second nudge is
            // what drives idle channels to emit their keepalive noops.
            let to_notify: Vec<Connection> = conns
                .by_cookie
                .values()
                .filter(|conn| {
                    (conn.core().is_paused() || conn.core().do_disconnect())
                        && conn.core().is_reserved()
                })
                .cloned()
                .collect();
            (release, to_notify)
        };

        let _release_guard = self.release_lock.lock();
        for conn in &to_notify {
            if conn.core().is_reserved() {
                if let Some(producer) = conn.as_producer() {
                    producer.set_time_for_noop();
                }
                self.host
                    .notify_io_complete(conn.core().cookie(), EngineStatus::Success);
            }
        }
        for conn in release {
            if conn.core().release_reservation() {
                self.host.release_cookie(conn.core().cookie());
                self.counters.conns_released.fetch_add(1, Ordering::Relaxed);
            }
            self.unindex_conn(&conn);
        }
    }

    /// Synchronous full teardown; the engine is unloading.
    pub fn shutdown_all_connections(&self) {
        info!(target: "riptide_dcp::connmap", "shutting down all replication connections");
        self.notifier_stopped.store(true, Ordering::Release);
        self.manage_connections();

        // Copy the map under lock, then close streams without it: closing
        // wakes paused channels, and that path must not nest under the
        // connection lock.
        let map_copy: Vec<Connection> =
            { self.conns.lock().by_cookie.values().cloned().collect() };
        for conn in &map_copy {
            match conn {
                Connection::Producer(p) => {
                    p.close_all_streams(StreamEndReason::Disconnected);
                }
                Connection::Consumer(c) => {
                    c.cancel_task();
                    c.close_all_streams();
                }
            }
            if conn.notify_paused() {
                self.host
                    .notify_io_complete(conn.core().cookie(), EngineStatus::Success);
            }
        }

        let (live, dead) = {
            let mut conns = self.conns.lock();
            let live: Vec<Connection> = conns.by_cookie.drain().map(|(_, c)| c).collect();
            let dead: Vec<Connection> = conns.dead.drain(..).collect();
            (live, dead)
        };
        for conn in live.iter().chain(dead.iter()) {
            conn.core().set_disconnect();
            conn.core().set_connected(false);
            if conn.core().release_reservation() {
                self.host.release_cookie(conn.core().cookie());
                self.counters.conns_released.fetch_add(1, Ordering::Relaxed);
            }
        }
        for shard in &self.vb_conn_shards {
            shard.lock().clear();
        }
    }

    /// Whether the periodic notifier has been told to stop.
    #[must_use]
    pub fn is_notifier_stopped(&self) -> bool {
        self.notifier_stopped.load(Ordering::Acquire)
    }

    // -- lookups ------------------------------------------------------------

    /// The channel bound to `cookie`, if any.
    #[must_use]
    pub fn find_by_cookie(&self, cookie: Cookie) -> Option<Connection> {
        self.conns.lock().by_cookie.get(&cookie).cloned()
    }

    /// First channel with `name` that is not already going down.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<Connection> {
        let conns = self.conns.lock();
        conns
            .by_cookie
            .values()
            .find(|conn| !conn.core().do_disconnect() && conn.core().name() == name)
            .cloned()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.lock().by_cookie.len()
    }

    #[must_use]
    pub fn dead_connection_count(&self) -> usize {
        self.conns.lock().dead.len()
    }

    /// Whether any consumer holds a passive stream for `vbucket`.
    #[must_use]
    pub fn is_passive_stream_connected(&self, vbucket: Vbid) -> bool {
        let conns = self.conns.lock();
        conns
            .by_cookie
            .values()
            .filter_map(Connection::as_consumer)
            .any(|c| c.is_stream_present(vbucket))
    }

    /// Channels currently indexed for `vbucket` (diagnostics and tests).
    #[must_use]
    pub fn vb_connection_count(&self, vbucket: Vbid) -> usize {
        self.shard_for(vbucket)
            .lock()
            .get(&vbucket)
            .map_or(0, Vec::len)
    }

    // -- tunables -----------------------------------------------------------

    /// Register this registry's listeners with the configuration store.
    pub fn register_config_listeners(self: &Arc<Self>, store: &TunableStore) {
        let listener: Arc<dyn ValueChangedListener> = Arc::new(ConnMapConfigListener {
            connmap: Arc::downgrade(self),
        });
        for key in [
            KEY_CONSUMER_YIELD_LIMIT,
            KEY_CONSUMER_BATCH_SIZE,
            KEY_MIN_COMPRESSION_RATIO,
            KEY_MAX_SIZE,
        ] {
            store.add_listener(key, Arc::clone(&listener));
        }
    }

    pub fn set_min_compression_ratio(&self, ratio: f32) {
        self.min_compression_ratio
            .store(ratio.to_bits(), Ordering::Release);
    }

    #[must_use]
    pub fn min_compression_ratio(&self) -> f32 {
        f32::from_bits(self.min_compression_ratio.load(Ordering::Acquire))
    }

    fn consumer_yield_changed(&self, value: usize) {
        let conns = self.conns.lock();
        for consumer in conns.by_cookie.values().filter_map(Connection::as_consumer) {
            consumer.set_processor_yield_threshold(value);
        }
    }

    fn consumer_batch_size_changed(&self, value: usize) {
        let conns = self.conns.lock();
        for consumer in conns.by_cookie.values().filter_map(Connection::as_consumer) {
            consumer.set_process_buffered_messages_batch_size(value);
        }
    }

    // -- stats --------------------------------------------------------------

    pub fn add_stats(&self, sink: &mut dyn StatSink) {
        let (count, dead, producers, consumers) = {
            let conns = self.conns.lock();
            let producers = conns
                .by_cookie
                .values()
                .filter(|c| c.as_producer().is_some())
                .count();
            (
                conns.by_cookie.len(),
                conns.dead.len(),
                producers,
                conns.by_cookie.len() - producers,
            )
        };
        sink.stat("ep_dcp_count", &count.to_string());
        sink.stat("ep_dcp_dead_conn_count", &dead.to_string());
        sink.stat("ep_dcp_producer_count", &producers.to_string());
        sink.stat("ep_dcp_consumer_count", &consumers.to_string());
    }

    /// Per-channel stats for every live channel.
    pub fn add_conn_stats(&self, sink: &mut dyn StatSink) {
        let map_copy: Vec<Connection> =
            { self.conns.lock().by_cookie.values().cloned().collect() };
        for conn in map_copy {
            conn.add_stats(sink);
        }
    }

    #[must_use]
    pub fn counters(&self) -> &ConnCounters {
        &self.counters
    }
}

/// Routes configuration changes into the registry.
struct ConnMapConfigListener {
    connmap: Weak<ConnMap>,
}

impl ValueChangedListener for ConnMapConfigListener {
    fn size_value_changed(&self, key: &str, value: usize) {
        let Some(connmap) = self.connmap.upgrade() else {
            return;
        };
        match key {
            KEY_CONSUMER_YIELD_LIMIT => connmap.consumer_yield_changed(value),
            KEY_CONSUMER_BATCH_SIZE => connmap.consumer_batch_size_changed(value),
            KEY_MAX_SIZE => connmap.admission.update_quota(value),
            _ => {}
        }
    }

    fn float_value_changed(&self, key: &str, value: f64) {
        let Some(connmap) = self.connmap.upgrade() else {
            return;
        };
        if key == KEY_MIN_COMPRESSION_RATIO {
            connmap.set_min_compression_ratio(value as f32);
        }
    }
}

/// The periodic tick driving [`ConnMap::manage_connections`].
///
/// The engine schedules `run()` on a timer; once the registry shuts down
/// the notifier reports it is finished and the timer stops.
pub struct ConnNotifier {
    connmap: Weak<ConnMap>,
}

impl ConnNotifier {
    #[must_use]
    pub fn new(connmap: &Arc<ConnMap>) -> Arc<Self> {
        Arc::new(Self {
            connmap: Arc::downgrade(connmap),
        })
    }

    /// One tick. Returns false when the registry is gone or shut down and
    /// the timer should not fire again.
    pub fn run(&self) -> bool {
        match self.connmap.upgrade() {
            Some(connmap) if !connmap.is_notifier_stopped() => {
                connmap.manage_connections();
                true
            }
            _ => false,
        }
    }
}
