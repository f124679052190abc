//! Property tests over the replication layer's structural invariants:
//! queue/index coherence, admission bounds, ack-log ordering, filter/index
//! agreement, and rollback replay fidelity.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use riptide_dcp::acklog::{AckLog, AckedEvent};
use riptide_dcp::admission::{BACKFILL_MEM_THRESHOLD_PERCENT, BackfillAdmission, DB_FILE_MEM};
use riptide_dcp::queue::EventQueue;
use riptide_dcp::{
    ConnMap, DcpSettings, EngineHost, FetchOutcome, InlineDispatcher, ItemFetcher, OpenFlags,
    OutboundPayload, StepOutcome, VBucketFilter,
};
use riptide_error::EngineStatus;
use riptide_types::{Cookie, Item, QueueOp, QueuedItem, Vbid, VbucketState};

// ---------------------------------------------------------------------------
// EventQueue coherence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum QueueOpKind {
    Push { key: u8, vb: u8 },
    Pop,
    PurgeVbucket { vb: u8 },
    Clear,
}

fn queue_op_strategy() -> impl Strategy<Value = QueueOpKind> {
    prop_oneof![
        4 => (any::<u8>(), 0u8..4).prop_map(|(key, vb)| QueueOpKind::Push { key, vb }),
        3 => Just(QueueOpKind::Pop),
        1 => (0u8..4).prop_map(|vb| QueueOpKind::PurgeVbucket { vb }),
        1 => Just(QueueOpKind::Clear),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// list length, dedup index size and memory accounting stay coherent
    /// across arbitrary mutator sequences.
    #[test]
    fn queue_list_and_index_agree(ops in proptest::collection::vec(queue_op_strategy(), 0..200)) {
        let mut queue = EventQueue::new();
        let filter = VBucketFilter::all();
        for op in ops {
            match op {
                QueueOpKind::Push { key, vb } => {
                    queue.push(QueuedItem::new(
                        format!("k{key}"),
                        Vbid::new(u16::from(vb)),
                        QueueOp::Mutation,
                    ));
                }
                QueueOpKind::Pop => {
                    queue.pop(&filter);
                }
                QueueOpKind::PurgeVbucket { vb } => {
                    queue.purge_vbucket(Vbid::new(u16::from(vb)));
                }
                QueueOpKind::Clear => queue.clear(),
            }
            prop_assert_eq!(queue.len(), queue.index_len());
            if queue.is_empty() {
                prop_assert_eq!(queue.mem_size(), 0);
            }
        }
    }

    /// A push of an already-pending `(key, vbucket)` never grows the queue.
    #[test]
    fn queue_dedup_is_total(keys in proptest::collection::vec((any::<u8>(), 0u8..4), 0..100)) {
        let mut queue = EventQueue::new();
        let mut model = std::collections::HashSet::new();
        for (key, vb) in keys {
            queue.push(QueuedItem::new(
                format!("k{key}"),
                Vbid::new(u16::from(vb)),
                QueueOp::Mutation,
            ));
            model.insert((vb, key));
            prop_assert_eq!(queue.len(), model.len());
        }
    }
}

// ---------------------------------------------------------------------------
// Backfill admission bounds
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// `active` tracks the successful acquires exactly and never exceeds
    /// `max`, for any acquire/release interleaving (including spurious
    /// releases, which are swallowed).
    #[test]
    fn admission_never_exceeds_max(
        slots in 1usize..8,
        acquires in proptest::collection::vec(any::<bool>(), 0..200),
    ) {
        let admission = BackfillAdmission::new(
            slots * DB_FILE_MEM * 100 / BACKFILL_MEM_THRESHOLD_PERCENT,
        );
        prop_assert_eq!(admission.max(), slots);
        let mut held = 0usize;
        for do_acquire in acquires {
            if do_acquire {
                if admission.try_acquire() {
                    held += 1;
                }
            } else {
                admission.release();
                held = held.saturating_sub(1);
            }
            prop_assert_eq!(admission.active(), held);
            prop_assert!(admission.active() <= admission.max());
        }
    }
}

// ---------------------------------------------------------------------------
// AckLog ordering
// ---------------------------------------------------------------------------

fn mutation_event(seq: u32) -> AckedEvent {
    AckedEvent::Mutation(QueuedItem::new(
        format!("k{seq}"),
        Vbid::new(0),
        QueueOp::Mutation,
    ))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// After `ack_through(s)` nothing at or below `s` remains, and the
    /// remainder is still strictly increasing.
    #[test]
    fn acklog_ack_drops_exactly_the_prefix(
        count in 1u32..50,
        ack_at in 0u32..60,
    ) {
        let mut log = AckLog::new();
        for seq in 1..=count {
            log.record(seq, mutation_event(seq));
        }
        log.ack_through(ack_at);
        let remaining = log.drain_from(0);
        let seqnos: Vec<u32> = remaining.iter().map(|e| e.seqno).collect();
        for window in seqnos.windows(2) {
            prop_assert!(window[0] < window[1]);
        }
        prop_assert!(seqnos.iter().all(|&s| s > ack_at));
        prop_assert_eq!(
            seqnos.len() as u32,
            count.saturating_sub(ack_at.min(count))
        );
    }

    /// `drain_from(s)` returns exactly the suffix at or above `s`, in order.
    #[test]
    fn acklog_drain_returns_ordered_suffix(
        count in 1u32..50,
        from in 0u32..60,
    ) {
        let mut log = AckLog::new();
        for seq in 1..=count {
            log.record(seq, mutation_event(seq));
        }
        let drained = log.drain_from(from);
        let expect: Vec<u32> = (1..=count).filter(|&s| s >= from).collect();
        let got: Vec<u32> = drained.iter().map(|e| e.seqno).collect();
        prop_assert_eq!(got, expect);
        prop_assert_eq!(log.len() as u32, count.min(from.saturating_sub(1)));
    }
}

// ---------------------------------------------------------------------------
// Registry: cookie bijection and filter/index agreement
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NullHost;

impl EngineHost for NullHost {
    fn notify_io_complete(&self, _cookie: Cookie, _status: EngineStatus) {}
    fn release_cookie(&self, _cookie: Cookie) {}
    fn vbucket_state(&self, _vbucket: Vbid) -> Option<VbucketState> {
        Some(VbucketState::Active)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every cookie in the registry resolves to a channel carrying that
    /// cookie, and the per-vbucket index contains a producer exactly where
    /// its filter admits.
    #[test]
    fn cookie_bijection_and_index_agreement(
        filters in proptest::collection::vec(
            proptest::collection::btree_set(0u16..32, 1..6),
            1..8,
        ),
    ) {
        let connmap = ConnMap::new(
            DcpSettings { num_vbuckets: 32, ..DcpSettings::default() },
            Arc::new(NullHost),
        );
        for (i, filter) in filters.iter().enumerate() {
            let cookie = Cookie::new(i as u64);
            connmap
                .open_producer(cookie, Some(&format!("p{i}")), OpenFlags::default())
                .unwrap();
            let vbs: Vec<Vbid> = filter.iter().map(|&v| Vbid::new(v)).collect();
            connmap.set_vbucket_filter(cookie, &vbs).unwrap();
        }

        for (i, filter) in filters.iter().enumerate() {
            let cookie = Cookie::new(i as u64);
            let conn = connmap.find_by_cookie(cookie).unwrap();
            prop_assert_eq!(conn.core().cookie(), cookie);
            let producer = conn.as_producer().unwrap();
            for vb in 0u16..32 {
                prop_assert_eq!(
                    producer.filter().admits(Vbid::new(vb)),
                    filter.contains(&vb)
                );
            }
        }
        for vb in 0u16..32 {
            let expected = filters.iter().filter(|f| f.contains(&vb)).count();
            prop_assert_eq!(connmap.vb_connection_count(Vbid::new(vb)), expected);
        }
    }
}

// ---------------------------------------------------------------------------
// Rollback replay fidelity
// ---------------------------------------------------------------------------

struct AllResident;

impl ItemFetcher for AllResident {
    fn fetch(&self, key: &str, vbucket: Vbid, _vb_version: u16) -> FetchOutcome {
        FetchOutcome::Resident(Item::new(key, vbucket, key.as_bytes().to_vec(), 1))
    }
}

fn payload_key(payload: &OutboundPayload) -> String {
    match payload {
        OutboundPayload::Mutation(item) => item.key().to_owned(),
        OutboundPayload::Deletion(qi) | OutboundPayload::Expiration(qi) => qi.key().to_owned(),
        other => panic!("unexpected payload {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After a negative ack at seqno `s`, stepping reproduces exactly the
    /// events originally sent with seqno >= `s`, in order, under the same
    /// seqnos.
    #[test]
    fn rollback_replays_the_original_sequence(
        count in 2u32..20,
        nack_offset in 0u32..20,
    ) {
        let connmap = ConnMap::new(
            DcpSettings { ack_window_size: 1000, ..DcpSettings::default() },
            Arc::new(NullHost),
        );
        let producer = connmap
            .open_producer(Cookie::new(1), Some("replay"), OpenFlags::SUPPORT_ACK)
            .unwrap();
        let fetcher: Arc<dyn ItemFetcher> = Arc::new(AllResident);

        // Drain the auto-nack negotiation event and ack it away.
        match producer.step(&fetcher, &InlineDispatcher) {
            StepOutcome::Event(ev) => {
                producer.process_ack(ev.seqno, EngineStatus::Success);
            }
            other => panic!("expected opaque event, got {other:?}"),
        }

        for i in 0..count {
            producer.enqueue(QueuedItem::new(
                format!("key{i:03}"),
                Vbid::new(0),
                QueueOp::Mutation,
            ));
        }
        let mut sent = Vec::new();
        for _ in 0..count {
            match producer.step(&fetcher, &InlineDispatcher) {
                StepOutcome::Event(ev) => sent.push((ev.seqno, payload_key(&ev.payload))),
                other => panic!("expected event, got {other:?}"),
            }
        }

        let first = sent[0].0;
        let nack_at = (first + nack_offset.min(count - 1)).min(sent.last().unwrap().0);
        producer.process_ack(nack_at, EngineStatus::Tmpfail);

        let expected: Vec<(u32, String)> = sent
            .iter()
            .filter(|(seq, _)| *seq >= nack_at)
            .cloned()
            .collect();
        let mut replayed = Vec::new();
        for _ in 0..expected.len() {
            match producer.step(&fetcher, &InlineDispatcher) {
                StepOutcome::Event(ev) => replayed.push((ev.seqno, payload_key(&ev.payload))),
                other => panic!("expected replayed event, got {other:?}"),
            }
        }
        prop_assert_eq!(replayed, expected);
    }
}

// ---------------------------------------------------------------------------
// Mixed producer/consumer registry churn
// ---------------------------------------------------------------------------

#[test]
fn churned_registry_stays_consistent() {
    let connmap = ConnMap::new(
        DcpSettings {
            num_vbuckets: 16,
            ..DcpSettings::default()
        },
        Arc::new(NullHost),
    );
    let mut live: HashMap<u64, bool> = HashMap::new();
    for round in 0u64..60 {
        match round % 4 {
            0 => {
                connmap
                    .open_producer(
                        Cookie::new(round),
                        Some(&format!("p{round}")),
                        OpenFlags::default(),
                    )
                    .unwrap();
                connmap
                    .set_vbucket_filter(Cookie::new(round), &[Vbid::new((round % 16) as u16)])
                    .unwrap();
                live.insert(round, true);
            }
            1 => {
                connmap
                    .open_consumer(Cookie::new(round), Some(&format!("c{round}")))
                    .unwrap();
                live.insert(round, true);
            }
            2 => {
                if let Some(&cookie) = live.keys().min() {
                    connmap.disconnect(Cookie::new(cookie));
                    live.remove(&cookie);
                }
            }
            _ => connmap.manage_connections(),
        }
    }
    connmap.manage_connections();
    assert_eq!(connmap.connection_count(), live.len());
    assert_eq!(connmap.dead_connection_count(), 0);
    for (cookie, _) in live {
        assert!(connmap.find_by_cookie(Cookie::new(cookie)).is_some());
    }
}
