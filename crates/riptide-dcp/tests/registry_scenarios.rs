//! End-to-end scenarios against the connection registry: duplicate names
//! and cookies, passive stream arbitration, hot-path notification,
//! disconnect/reap ordering, and full shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use riptide_dcp::admission::{BACKFILL_MEM_THRESHOLD_PERCENT, DB_FILE_MEM};
use riptide_dcp::config::{
    KEY_CONSUMER_BATCH_SIZE, KEY_CONSUMER_YIELD_LIMIT, KEY_MAX_SIZE, KEY_MIN_COMPRESSION_RATIO,
};
use riptide_dcp::{
    ConnMap, ConnNotifier, DcpSettings, EngineHost, FetchOutcome, InlineDispatcher, ItemFetcher,
    OpenFlags, OutboundPayload, StepOutcome, StreamEndReason, TunableStore, VbucketEventKind,
};
use riptide_error::EngineStatus;
use riptide_types::{Cookie, Item, Vbid, VbucketState};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestHost {
    notified: Mutex<Vec<(Cookie, EngineStatus)>>,
    released: Mutex<Vec<Cookie>>,
}

impl TestHost {
    fn notified_cookies(&self) -> Vec<Cookie> {
        self.notified.lock().iter().map(|(c, _)| *c).collect()
    }

    fn released_cookies(&self) -> Vec<Cookie> {
        self.released.lock().clone()
    }
}

impl EngineHost for TestHost {
    fn notify_io_complete(&self, cookie: Cookie, status: EngineStatus) {
        self.notified.lock().push((cookie, status));
    }

    fn release_cookie(&self, cookie: Cookie) {
        self.released.lock().push(cookie);
    }

    fn vbucket_state(&self, _vbucket: Vbid) -> Option<VbucketState> {
        Some(VbucketState::Active)
    }
}

struct MapFetcher {
    resident: HashMap<String, Item>,
}

impl MapFetcher {
    fn empty() -> Arc<dyn ItemFetcher> {
        Arc::new(Self {
            resident: HashMap::new(),
        })
    }
}

impl ItemFetcher for MapFetcher {
    fn fetch(&self, key: &str, _vbucket: Vbid, _vb_version: u16) -> FetchOutcome {
        match self.resident.get(key) {
            Some(item) => FetchOutcome::Resident(item.clone()),
            None => FetchOutcome::Miss,
        }
    }
}

fn registry() -> (Arc<ConnMap>, Arc<TestHost>) {
    registry_with(DcpSettings::default())
}

fn registry_with(settings: DcpSettings) -> (Arc<ConnMap>, Arc<TestHost>) {
    let host = Arc::new(TestHost::default());
    let connmap = ConnMap::new(settings, Arc::clone(&host) as Arc<dyn EngineHost>);
    (connmap, host)
}

// ---------------------------------------------------------------------------
// S1 / S2: duplicate names and cookies
// ---------------------------------------------------------------------------

#[test]
fn duplicate_name_disconnects_the_older_channel() {
    let (connmap, _host) = registry();
    let a = connmap
        .open_producer(Cookie::new(0xA), Some("n1"), OpenFlags::default())
        .unwrap();
    let b = connmap
        .open_producer(Cookie::new(0xB), Some("n1"), OpenFlags::default())
        .unwrap();

    assert_eq!(connmap.connection_count(), 2);
    assert!(a.core().do_disconnect());
    assert!(!b.core().do_disconnect());

    // The displaced channel drains out: stream-end, then nothing.
    let fetcher = MapFetcher::empty();
    match a.step(&fetcher, &InlineDispatcher) {
        StepOutcome::Event(ev) => match ev.payload {
            OutboundPayload::Vbucket(vb_ev) => assert!(matches!(
                vb_ev.kind,
                VbucketEventKind::StreamEnd(StreamEndReason::Disconnected)
            )),
            other => panic!("expected stream end, got {other:?}"),
        },
        other => panic!("expected stream end event, got {other:?}"),
    }
    assert_eq!(a.step(&fetcher, &InlineDispatcher), StepOutcome::NothingToSend);
}

#[test]
fn duplicate_cookie_fails_and_marks_existing() {
    let (connmap, _host) = registry();
    let a = connmap
        .open_producer(Cookie::new(0xA), Some("n1"), OpenFlags::default())
        .unwrap();
    let err = connmap
        .open_producer(Cookie::new(0xA), Some("n2"), OpenFlags::default())
        .unwrap_err();

    assert_eq!(err.status(), EngineStatus::KeyEexists);
    assert!(a.core().do_disconnect());

    // The cookie still resolves to the original channel.
    let bound = connmap.find_by_cookie(Cookie::new(0xA)).unwrap();
    assert_eq!(bound.core().name(), "eq_dcpq:n1");
    assert_eq!(connmap.connection_count(), 1);
}

#[test]
fn find_by_name_skips_disconnecting_channels() {
    let (connmap, _host) = registry();
    connmap
        .open_producer(Cookie::new(0xA), Some("n1"), OpenFlags::default())
        .unwrap();
    connmap
        .open_producer(Cookie::new(0xB), Some("n1"), OpenFlags::default())
        .unwrap();

    let found = connmap.find_by_name("eq_dcpq:n1").unwrap();
    assert_eq!(found.core().cookie(), Cookie::new(0xB));
    assert!(connmap.find_by_name("eq_dcpq:absent").is_none());
}

#[test]
fn anonymous_channels_get_unique_names() {
    let (connmap, _host) = registry();
    let a = connmap
        .open_producer(Cookie::new(1), None, OpenFlags::default())
        .unwrap();
    let b = connmap
        .open_producer(Cookie::new(2), None, OpenFlags::default())
        .unwrap();
    assert_ne!(a.core().name(), b.core().name());
    assert!(a.core().name().starts_with("eq_tapq:anon_"));
}

// ---------------------------------------------------------------------------
// S3: passive stream uniqueness
// ---------------------------------------------------------------------------

#[test]
fn passive_streams_are_unique_across_consumers() {
    let (connmap, _host) = registry();
    let c1 = connmap.open_consumer(Cookie::new(1), Some("c1")).unwrap();
    let c2 = connmap.open_consumer(Cookie::new(2), Some("c2")).unwrap();

    connmap
        .add_passive_stream(&c1, 0xCAFE, Vbid::new(7), 0)
        .unwrap();
    let err = connmap
        .add_passive_stream(&c2, 0xBEEF, Vbid::new(7), 0)
        .unwrap_err();
    assert_eq!(err.status(), EngineStatus::KeyEexists);

    // Unaffected vbuckets still work, and the holder keeps its stream.
    connmap
        .add_passive_stream(&c2, 0xBEEF, Vbid::new(8), 0)
        .unwrap();
    assert!(c1.is_stream_present(Vbid::new(7)));
    assert!(!c2.is_stream_present(Vbid::new(7)));
    assert!(connmap.is_passive_stream_connected(Vbid::new(7)));
}

// ---------------------------------------------------------------------------
// S4: hot notify path
// ---------------------------------------------------------------------------

#[test]
fn notify_wakes_exactly_the_filtered_producers() {
    let (connmap, host) = registry();
    let mut on_seven = Vec::new();
    for i in 0..100u64 {
        let cookie = Cookie::new(i);
        let p = connmap
            .open_producer(cookie, Some(&format!("p{i}")), OpenFlags::default())
            .unwrap();
        connmap.set_vbucket_filter(cookie, &[Vbid::new(7)]).unwrap();
        p.core().set_paused(true);
        on_seven.push(cookie);
    }
    for i in 100..150u64 {
        let cookie = Cookie::new(i);
        let p = connmap
            .open_producer(cookie, Some(&format!("q{i}")), OpenFlags::default())
            .unwrap();
        connmap.set_vbucket_filter(cookie, &[Vbid::new(8)]).unwrap();
        p.core().set_paused(true);
    }

    assert_eq!(connmap.vb_connection_count(Vbid::new(7)), 100);
    connmap.notify_vb_connections(Vbid::new(7), 42);

    let mut woken = host.notified_cookies();
    woken.sort_by_key(|c| c.get());
    assert_eq!(woken, on_seven);

    // Wakes coalesce until the producer steps again.
    connmap.notify_vb_connections(Vbid::new(7), 43);
    assert_eq!(host.notified.lock().len(), 100);
}

#[test]
fn notify_runs_concurrently_with_registry_scans() {
    let (connmap, _host) = registry();
    for i in 0..16u64 {
        let cookie = Cookie::new(i);
        connmap
            .open_producer(cookie, Some(&format!("p{i}")), OpenFlags::default())
            .unwrap();
        connmap.set_vbucket_filter(cookie, &[Vbid::new(7)]).unwrap();
    }

    // One thread hammers paths that hold the main connection lock; the
    // other drives the shard-only notify path. Both must finish.
    let scans = {
        let connmap = Arc::clone(&connmap);
        thread::spawn(move || {
            for _ in 0..2000 {
                let _ = connmap.find_by_name("eq_dcpq:p3");
                connmap.vbucket_state_changed(Vbid::new(9), VbucketState::Active, false);
            }
        })
    };
    let notifies = {
        let connmap = Arc::clone(&connmap);
        thread::spawn(move || {
            for seq in 0..2000 {
                connmap.notify_vb_connections(Vbid::new(7), seq);
            }
        })
    };
    scans.join().unwrap();
    notifies.join().unwrap();
}

// ---------------------------------------------------------------------------
// S5: backfill admission through configuration
// ---------------------------------------------------------------------------

#[test]
fn admission_cap_follows_the_memory_quota() {
    let quota_for_three = 3 * DB_FILE_MEM * 100 / BACKFILL_MEM_THRESHOLD_PERCENT;
    let (connmap, _host) = registry_with(DcpSettings {
        max_data_size: quota_for_three,
        ..DcpSettings::default()
    });
    let admission = connmap.admission();
    assert_eq!(admission.max(), 3);

    assert!(admission.try_acquire());
    assert!(admission.try_acquire());
    assert!(admission.try_acquire());
    assert!(!admission.try_acquire());
    admission.release();
    assert!(admission.try_acquire());
}

#[test]
fn max_size_config_change_recomputes_admission() {
    let (connmap, _host) = registry();
    let store = TunableStore::new();
    connmap.register_config_listeners(&store);

    store.set_size(KEY_MAX_SIZE, 2 * DB_FILE_MEM * 100 / BACKFILL_MEM_THRESHOLD_PERCENT);
    assert_eq!(connmap.admission().max(), 2);
}

#[test]
fn consumer_tunables_propagate_to_every_consumer() {
    let (connmap, _host) = registry();
    let store = TunableStore::new();
    connmap.register_config_listeners(&store);

    let c1 = connmap.open_consumer(Cookie::new(1), Some("c1")).unwrap();
    let c2 = connmap.open_consumer(Cookie::new(2), Some("c2")).unwrap();

    store.set_size(KEY_CONSUMER_YIELD_LIMIT, 77);
    store.set_size(KEY_CONSUMER_BATCH_SIZE, 512);
    assert_eq!(c1.processor_yield_threshold(), 77);
    assert_eq!(c2.processor_yield_threshold(), 77);
    assert_eq!(c1.process_buffered_messages_batch_size(), 512);
    assert_eq!(c2.process_buffered_messages_batch_size(), 512);

    store.set_float(KEY_MIN_COMPRESSION_RATIO, 0.25);
    assert!((connmap.min_compression_ratio() - 0.25).abs() < f32::EPSILON);
}

// ---------------------------------------------------------------------------
// S6: disconnect, reap, and the notifier
// ---------------------------------------------------------------------------

#[test]
fn disconnect_then_reap_releases_exactly_once() {
    let (connmap, host) = registry();
    let cookie = Cookie::new(0xD);
    connmap
        .open_producer(cookie, Some("doomed"), OpenFlags::default())
        .unwrap();
    connmap.set_vbucket_filter(cookie, &[Vbid::new(3)]).unwrap();
    assert_eq!(connmap.vb_connection_count(Vbid::new(3)), 1);

    connmap.disconnect(cookie);
    assert_eq!(connmap.connection_count(), 0);
    assert_eq!(connmap.dead_connection_count(), 1);

    connmap.manage_connections();
    assert_eq!(connmap.dead_connection_count(), 0);
    assert_eq!(connmap.vb_connection_count(Vbid::new(3)), 0);
    assert_eq!(host.released_cookies(), vec![cookie]);

    // A second disconnect for the same cookie is a no-op.
    connmap.disconnect(cookie);
    connmap.manage_connections();
    assert_eq!(host.released_cookies(), vec![cookie]);
}

#[test]
fn manage_connections_pokes_paused_reserved_channels() {
    let (connmap, host) = registry();
    let p = connmap
        .open_producer(Cookie::new(5), Some("idle"), OpenFlags::default())
        .unwrap();
    p.core().set_paused(true);

    connmap.manage_connections();
    assert_eq!(host.notified_cookies(), vec![Cookie::new(5)]);
    // The poke also latches the keepalive noop.
    assert!(p.is_time_for_noop());

    // Pokes repeat every tick while the channel stays paused.
    connmap.manage_connections();
    assert_eq!(host.notified.lock().len(), 2);
}

#[test]
fn paused_channel_past_keep_alive_is_disconnected() {
    let (connmap, _host) = registry_with(DcpSettings {
        conn_keep_alive: std::time::Duration::ZERO,
        ..DcpSettings::default()
    });
    let p = connmap
        .open_producer(Cookie::new(1), Some("stale"), OpenFlags::default())
        .unwrap();
    let fetcher = MapFetcher::empty();
    assert_eq!(p.step(&fetcher, &InlineDispatcher), StepOutcome::NothingToSend);
    assert!(p.core().is_paused());

    connmap.manage_connections();
    assert!(p.core().do_disconnect());
}

#[test]
fn disconnect_races_with_state_changes_without_deadlock() {
    let (connmap, _host) = registry();
    for i in 0..32u64 {
        connmap
            .open_producer(Cookie::new(i), Some(&format!("r{i}")), OpenFlags::default())
            .unwrap();
    }

    let changer = {
        let connmap = Arc::clone(&connmap);
        thread::spawn(move || {
            for round in 0..200 {
                let vb = Vbid::new(round % 16);
                connmap.vbucket_state_changed(vb, VbucketState::Replica, true);
            }
        })
    };
    let disconnector = {
        let connmap = Arc::clone(&connmap);
        thread::spawn(move || {
            for i in 0..32u64 {
                connmap.disconnect(Cookie::new(i));
                connmap.manage_connections();
            }
        })
    };
    changer.join().unwrap();
    disconnector.join().unwrap();
    assert_eq!(connmap.connection_count(), 0);
}

#[test]
fn notifier_runs_until_shutdown() {
    let (connmap, _host) = registry();
    let notifier = ConnNotifier::new(&connmap);
    assert!(notifier.run());
    connmap.shutdown_all_connections();
    assert!(!notifier.run());
}

#[test]
fn registry_stats_report_counts() {
    let (connmap, _host) = registry();
    connmap
        .open_producer(Cookie::new(1), Some("p"), OpenFlags::default())
        .unwrap();
    connmap.open_consumer(Cookie::new(2), Some("c")).unwrap();
    connmap
        .open_producer(Cookie::new(3), Some("dead"), OpenFlags::default())
        .unwrap();
    connmap.disconnect(Cookie::new(3));

    let mut stats = HashMap::new();
    let mut sink = |key: &str, value: &str| {
        stats.insert(key.to_owned(), value.to_owned());
    };
    connmap.add_stats(&mut sink);
    assert_eq!(stats.get("ep_dcp_count").map(String::as_str), Some("2"));
    assert_eq!(
        stats.get("ep_dcp_dead_conn_count").map(String::as_str),
        Some("1")
    );
    assert_eq!(
        stats.get("ep_dcp_producer_count").map(String::as_str),
        Some("1")
    );
    assert_eq!(
        stats.get("ep_dcp_consumer_count").map(String::as_str),
        Some("1")
    );

    // Per-channel stats carry the name prefix.
    let mut keys = Vec::new();
    let mut conn_sink = |key: &str, _value: &str| keys.push(key.to_owned());
    connmap.add_conn_stats(&mut conn_sink);
    assert!(keys.contains(&"eq_dcpq:p:type".to_owned()));
    assert!(keys.contains(&"eq_dcpq:c:passive_streams".to_owned()));
}

// ---------------------------------------------------------------------------
// Shutdown leaves nothing behind
// ---------------------------------------------------------------------------

#[test]
fn shutdown_empties_the_registry_and_flags_every_channel() {
    let (connmap, host) = registry();
    let p = connmap
        .open_producer(Cookie::new(1), Some("p"), OpenFlags::default())
        .unwrap();
    connmap.set_vbucket_filter(Cookie::new(1), &[Vbid::new(7)]).unwrap();
    let c = connmap.open_consumer(Cookie::new(2), Some("c")).unwrap();
    connmap.add_passive_stream(&c, 1, Vbid::new(7), 0).unwrap();

    // One channel is already on the dead list when shutdown begins.
    let d = connmap
        .open_producer(Cookie::new(3), Some("d"), OpenFlags::default())
        .unwrap();
    connmap.disconnect(Cookie::new(3));

    connmap.shutdown_all_connections();

    assert_eq!(connmap.connection_count(), 0);
    assert_eq!(connmap.dead_connection_count(), 0);
    for vb in [0u16, 7, 100, 1023] {
        assert_eq!(connmap.vb_connection_count(Vbid::new(vb)), 0);
    }
    for core in [p.core(), c.core(), d.core()] {
        assert!(core.do_disconnect(), "disconnect must be set");
        assert!(!core.is_connected(), "connected must be cleared");
    }
    assert_eq!(c.stream_count(), 0);
    assert!(c.is_task_cancelled());

    let mut released = host.released_cookies();
    released.sort_by_key(|c| c.get());
    assert_eq!(
        released,
        vec![Cookie::new(1), Cookie::new(2), Cookie::new(3)]
    );
}
