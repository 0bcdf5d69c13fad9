//! End-to-end arbitration scenarios against a per-test arbitrator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use meld_common::{AbortCause, ArbitratorConfig, MeldError};
use meld_memory::{MemoryPool, Reclaimer, SharedArbitrator, TaskPauseToken, TestHook};

const MB: u64 = 1024 * 1024;

fn config(capacity: u64, init: u64, transfer: u64, abort_on_oom: bool) -> ArbitratorConfig {
    ArbitratorConfig {
        memory_capacity_bytes: capacity,
        memory_pool_init_capacity: init,
        memory_pool_transfer_capacity: transfer,
        arbitration_timeout_ms: 10_000,
        abort_on_oom,
    }
}

/// Spillable operator stand-in: tracks held bytes and frees them through
/// its leaf pool when reclaimed. Records whether its task was paused when
/// the reclaim ran.
struct FakeOperator {
    pool: Arc<MemoryPool>,
    held: Arc<AtomicU64>,
    paused_during_reclaim: Arc<AtomicBool>,
}

impl FakeOperator {
    fn attach(root: &Arc<MemoryPool>, name: &str, pause: &Arc<TaskPauseToken>) -> Self {
        let held = Arc::new(AtomicU64::new(0));
        let paused_during_reclaim = Arc::new(AtomicBool::new(true));
        let pool_slot: Arc<OnceLock<Weak<MemoryPool>>> = Arc::new(OnceLock::new());

        let held_for_bytes = Arc::clone(&held);
        let held_for_reclaim = Arc::clone(&held);
        let pause_for_reclaim = Arc::clone(pause);
        let paused_flag = Arc::clone(&paused_during_reclaim);
        let slot_for_reclaim = Arc::clone(&pool_slot);

        let pool = root.add_leaf_child_with_reclaimer(
            name,
            Reclaimer::operator(
                Box::new(move || held_for_bytes.load(Ordering::Acquire)),
                Box::new(move |target| {
                    if !pause_for_reclaim.pause_requested() {
                        paused_flag.store(false, Ordering::Release);
                    }
                    let pool = slot_for_reclaim
                        .get()
                        .and_then(Weak::upgrade)
                        .expect("reclaim pool alive");
                    let freed = target.min(held_for_reclaim.load(Ordering::Acquire));
                    pool.free(freed)?;
                    pool.release(freed)?;
                    held_for_reclaim.fetch_sub(freed, Ordering::AcqRel);
                    Ok(freed)
                }),
            ),
        );
        pool_slot
            .set(Arc::downgrade(&pool))
            .expect("pool slot set once");
        Self {
            pool,
            held,
            paused_during_reclaim,
        }
    }

    fn allocate(&self, bytes: u64) {
        self.pool.reserve(bytes).expect("reserve");
        self.pool.allocate(bytes).expect("allocate");
        self.held.fetch_add(bytes, Ordering::AcqRel);
    }

    fn held_bytes(&self) -> u64 {
        self.held.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RecordingHook {
    events: Mutex<Vec<String>>,
}

impl RecordingHook {
    fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }
}

impl TestHook for RecordingHook {
    fn before_reclaim(&self, pool: &str) {
        self.events
            .lock()
            .expect("events")
            .push(format!("reclaim:{pool}"));
    }

    fn before_abort(&self, pool: &str) {
        self.events
            .lock()
            .expect("events")
            .push(format!("abort:{pool}"));
    }

    fn on_grant(&self, pool: &str, granted: u64) {
        self.events
            .lock()
            .expect("events")
            .push(format!("grant:{pool}:{granted}"));
    }
}

fn assert_capacity_conserved(arbitrator: &SharedArbitrator, pools: &[&Arc<MemoryPool>]) {
    let stats = arbitrator.stats();
    let assigned: u64 = pools.iter().map(|p| p.capacity_bytes()).sum();
    assert_eq!(
        stats.free_capacity_bytes + assigned,
        stats.max_capacity_bytes,
        "free + assigned capacity must equal total"
    );
}

#[test]
fn local_grow_without_contention() {
    let arbitrator = SharedArbitrator::new(config(128 * MB, 32 * MB, 16 * MB, true));
    let root = arbitrator.add_pool("q1", u64::MAX, None);
    let leaf = root.add_leaf_child("agg");

    leaf.reserve(32 * MB).expect("within initial capacity");
    let before = arbitrator.stats();
    leaf.reserve(16 * MB).expect("local grow");
    let after = arbitrator.stats();

    assert_eq!(
        before.free_capacity_bytes - after.free_capacity_bytes,
        16 * MB
    );
    assert_eq!(
        after.local_arbitration_count,
        before.local_arbitration_count + 1
    );
    assert_eq!(
        after.global_arbitration_wait_count,
        before.global_arbitration_wait_count
    );
    assert_capacity_conserved(&arbitrator, &[&root]);
}

#[test]
fn reclaims_used_bytes_from_paused_aggregation() {
    let hook = Arc::new(RecordingHook::default());
    let arbitrator = SharedArbitrator::with_hook(
        config(256 * MB, 256 * MB, 32 * MB, true),
        Arc::clone(&hook) as Arc<dyn TestHook>,
    );

    let pause_a = TaskPauseToken::new();
    let root_a = arbitrator.add_pool("query-a", u64::MAX, Some(Arc::clone(&pause_a)));
    let agg_a = FakeOperator::attach(&root_a, "aggregation", &pause_a);
    agg_a.allocate(224 * MB);

    let root_b = arbitrator.add_pool("query-b", u64::MAX, None);
    let leaf_b = root_b.add_leaf_child("probe");
    leaf_b.reserve(200 * MB).expect("grow through reclaim");

    let stats = arbitrator.stats();
    assert!(stats.reclaimed_used_bytes >= 168 * MB);
    assert!(stats.global_arbitration_wait_count >= 1);
    assert_eq!(stats.num_task_pauses, 1);
    assert!(agg_a.paused_during_reclaim.load(Ordering::Acquire));
    assert!(!pause_a.pause_requested(), "task resumed after reclaim");
    assert!(agg_a.held_bytes() <= 224 * MB - 168 * MB);

    let events = hook.events();
    assert!(events.iter().any(|e| e == "reclaim:query-a"));
    assert!(events.iter().any(|e| e.starts_with("grant:query-b:")));
    assert_capacity_conserved(&arbitrator, &[&root_a, &root_b]);
}

#[test]
fn skips_non_reclaimable_pools() {
    let arbitrator = SharedArbitrator::new(config(128 * MB, 128 * MB, 32 * MB, false));

    let pause_a = TaskPauseToken::new();
    let root_a = arbitrator.add_pool("query-a", u64::MAX, Some(Arc::clone(&pause_a)));

    // Partial aggregation cannot spill; only the final aggregation can.
    let partial = root_a.add_leaf_child("partial-agg");
    partial.reserve(60 * MB).expect("reserve partial");
    partial.allocate(60 * MB).expect("allocate partial");
    let final_agg = FakeOperator::attach(&root_a, "final-agg", &pause_a);
    final_agg.allocate(60 * MB);

    let root_b = arbitrator.add_pool("query-b", u64::MAX, None);
    let leaf_b = root_b.add_leaf_child("probe");
    let err = leaf_b.reserve(80 * MB).expect_err("not enough reclaimable");
    assert!(matches!(err, MeldError::CapExceeded(_)));

    let stats = arbitrator.stats();
    assert_eq!(stats.num_task_pauses, 1);
    assert_eq!(stats.num_aborted, 0);
    // The non-reclaimable pool kept its memory; the reclaimable one gave
    // everything up.
    assert_eq!(partial.used_bytes(), 60 * MB);
    assert_eq!(final_agg.held_bytes(), 0);
    assert_capacity_conserved(&arbitrator, &[&root_a, &root_b]);
}

#[test]
fn exhausted_arbitration_fails_without_abort() {
    let arbitrator = SharedArbitrator::new(config(64 * MB, 64 * MB, 16 * MB, true));

    let pause = TaskPauseToken::new();
    let root = arbitrator.add_pool("query-a", u64::MAX, Some(Arc::clone(&pause)));
    let agg = FakeOperator::attach(&root, "aggregation", &pause);
    agg.allocate(40 * MB);

    let foreign = root.add_leaf_child("foreign");
    let err = foreign.reserve(40 * MB).expect_err("exceeds total");
    assert!(matches!(err, MeldError::CapExceeded(_)));

    let stats = arbitrator.stats();
    assert_eq!(stats.num_aborted, 0);
    // The requester never donates its own used bytes.
    assert_eq!(agg.held_bytes(), 40 * MB);
    assert_capacity_conserved(&arbitrator, &[&root]);
}

#[test]
fn aborts_largest_victim_as_last_resort() {
    let hook = Arc::new(RecordingHook::default());
    let arbitrator = SharedArbitrator::with_hook(
        config(64 * MB, 64 * MB, MB, true),
        Arc::clone(&hook) as Arc<dyn TestHook>,
    );

    // Non-reclaimable holder: phases A and B cannot help.
    let root_a = arbitrator.add_pool("query-a", u64::MAX, None);
    let leaf_a = root_a.add_leaf_child("holder");
    leaf_a.reserve(48 * MB).expect("reserve");
    leaf_a.allocate(48 * MB).expect("allocate");

    let root_b = arbitrator.add_pool("query-b", u64::MAX, None);
    let leaf_b = root_b.add_leaf_child("probe");
    leaf_b.reserve(48 * MB).expect("granted after abort");

    let stats = arbitrator.stats();
    assert_eq!(stats.num_aborted, 1);
    assert!(hook.events().iter().any(|e| e == "abort:query-a"));

    // Abort is fatal to the victim only.
    let err = leaf_a.allocate(MB).expect_err("victim aborted");
    assert!(matches!(
        err,
        MeldError::Aborted(AbortCause::OutOfMemory(_))
    ));
    leaf_b.allocate(48 * MB).expect("winner unaffected");
    assert_capacity_conserved(&arbitrator, &[&root_a, &root_b]);
}

#[test]
fn waiters_are_served_in_arrival_order() {
    let hook = Arc::new(RecordingHook::default());
    let arbitrator = SharedArbitrator::with_hook(
        config(64 * MB, 64 * MB, MB, false),
        Arc::clone(&hook) as Arc<dyn TestHook>,
    );

    let pause_d = TaskPauseToken::new();
    let donor_root = arbitrator.add_pool("donor", u64::MAX, Some(Arc::clone(&pause_d)));
    let donor_op = FakeOperator::attach(&donor_root, "agg", &pause_d);
    donor_op.allocate(32 * MB);

    let root_1 = arbitrator.add_pool("q1", u64::MAX, None);
    let root_2 = arbitrator.add_pool("q2", u64::MAX, None);

    let first = {
        let root = Arc::clone(&root_1);
        thread::spawn(move || {
            let leaf = root.add_leaf_child("op");
            leaf.reserve(40 * MB).expect("first waiter");
        })
    };
    // Ensure the first request is queued before the second starts.
    while arbitrator.stats().global_arbitration_wait_count == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    let second = {
        let root = Arc::clone(&root_2);
        thread::spawn(move || {
            let leaf = root.add_leaf_child("op");
            leaf.reserve(8 * MB).expect("second waiter");
        })
    };
    first.join().expect("join first");
    second.join().expect("join second");

    let grants: Vec<String> = hook
        .events()
        .into_iter()
        .filter(|e| e.starts_with("grant:"))
        .collect();
    let q1_pos = grants.iter().position(|e| e.starts_with("grant:q1"));
    let q2_pos = grants.iter().position(|e| e.starts_with("grant:q2"));
    assert!(
        q1_pos.expect("q1 granted") < q2_pos.expect("q2 granted"),
        "earlier waiter served first: {grants:?}"
    );
    assert_capacity_conserved(&arbitrator, &[&donor_root, &root_1, &root_2]);
}

#[test]
fn shrink_capacity_reclaims_idle_reservations() {
    let arbitrator = SharedArbitrator::new(config(128 * MB, 64 * MB, MB, false));
    let root_a = arbitrator.add_pool("q1", u64::MAX, None);
    let root_b = arbitrator.add_pool("q2", u64::MAX, None);
    let leaf_a = root_a.add_leaf_child("op");
    leaf_a.reserve(16 * MB).expect("reserve");

    // q1 can give back 48MB idle, q2 all 64MB.
    let freed = arbitrator.shrink_capacity(80 * MB);
    assert!(freed >= 80 * MB, "freed {freed}");
    assert_eq!(root_a.capacity_bytes(), 16 * MB);
    assert_eq!(arbitrator.stats().reclaimed_free_bytes, freed);
    assert_capacity_conserved(&arbitrator, &[&root_a, &root_b]);
}

#[test]
fn dropped_root_returns_capacity() {
    let arbitrator = SharedArbitrator::new(config(64 * MB, 32 * MB, MB, false));
    let root = arbitrator.add_pool("q1", u64::MAX, None);
    assert_eq!(arbitrator.free_capacity_bytes(), 32 * MB);
    drop(root);
    assert_eq!(arbitrator.free_capacity_bytes(), 64 * MB);
}

#[test]
fn capacity_conservation_under_random_operations() {
    let arbitrator = SharedArbitrator::new(config(96 * MB, 16 * MB, MB, false));
    let root_1 = arbitrator.add_pool("q1", u64::MAX, None);
    let root_2 = arbitrator.add_pool("q2", u64::MAX, None);
    let leaf_1 = root_1.add_leaf_child("op");
    let leaf_2 = root_2.add_leaf_child("op");

    let mut seed: u64 = 0x5DEECE66D;
    let mut next = move |bound: u64| {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        if bound == 0 { 0 } else { (seed >> 33) % bound }
    };

    for step in 0..500 {
        let leaf = if next(2) == 0 { &leaf_1 } else { &leaf_2 };
        match next(5) {
            0 => {
                // Growth may fail when the other query holds everything.
                let _ = leaf.reserve(next(8 * MB) + 1);
            }
            1 => {
                let idle = leaf.reserved_bytes() - leaf.used_bytes();
                if idle > 0 {
                    leaf.release(next(idle) + 1).expect("release");
                }
            }
            2 => {
                let idle = leaf.reserved_bytes() - leaf.used_bytes();
                if idle > 0 {
                    leaf.allocate(next(idle) + 1).expect("allocate");
                }
            }
            3 => {
                let used = leaf.used_bytes();
                if used > 0 {
                    leaf.free(next(used) + 1).expect("free");
                }
            }
            _ => {
                arbitrator.shrink_capacity(next(16 * MB));
            }
        }
        let stats_1 = root_1.stats();
        let stats_2 = root_2.stats();
        for stats in [stats_1, stats_2] {
            assert!(stats.used_bytes <= stats.reserved_bytes, "step {step}");
            assert!(stats.reserved_bytes <= stats.capacity_bytes, "step {step}");
        }
        assert_capacity_conserved(&arbitrator, &[&root_1, &root_2]);
    }
}
