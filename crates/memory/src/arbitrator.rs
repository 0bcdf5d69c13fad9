//! Process-wide shared memory arbitrator.
//!
//! One arbitrator partitions a fixed capacity across the root pools of all
//! running queries. Growth requests are served locally from free capacity
//! when possible; otherwise the requester joins a FIFO and a single
//! coordinator (elected by CAS on an in-progress flag) reclaims idle
//! capacity, spills paused donors, and as a last resort aborts a victim.
//!
//! The arbitrator is constructed explicitly and torn down by drop; tests
//! instantiate one per case.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use meld_common::{
    global_metrics, AbortCause, ArbitratorConfig, MeldError, MetricsRegistry, Result,
};
use tracing::{debug, warn};

use crate::pause::TaskPauseToken;
use crate::pool::MemoryPool;
use crate::reclaimer::ReclaimStats;

/// Rounds of reclaim phases attempted per waiter before it fails.
const GLOBAL_ARBITRATION_RETRIES: usize = 3;

const METRICS_INSTANCE: &str = "shared";

/// Deterministic injection points wired at construction.
///
/// Production code installs the no-op default; tests observe ordering (for
/// example, pause-before-reclaim) or inject delays through these.
pub trait TestHook: Send + Sync {
    /// Invoked after the donor's task is paused, before its pools reclaim.
    fn before_reclaim(&self, _pool: &str) {}
    /// Invoked before a victim pool is aborted.
    fn before_abort(&self, _pool: &str) {}
    /// Invoked when a growth request is granted.
    fn on_grant(&self, _pool: &str, _granted: u64) {}
}

struct NoopHook;

impl TestHook for NoopHook {}

/// Observable arbitrator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbitratorStats {
    /// Growth requests received (local and global).
    pub num_requests: u64,
    /// Victim queries aborted by the arbitrator.
    pub num_aborted: u64,
    /// Growth requests that failed.
    pub num_failures: u64,
    /// Capacity released from idle reservations (phase A).
    pub reclaimed_free_bytes: u64,
    /// Capacity released by spilling donors (phase B).
    pub reclaimed_used_bytes: u64,
    /// Requests that entered the global arbitration queue.
    pub global_arbitration_wait_count: u64,
    /// Requests served from free capacity alone.
    pub local_arbitration_count: u64,
    /// Task pauses performed for reclaim.
    pub num_task_pauses: u64,
    /// Total capacity managed by this arbitrator.
    pub max_capacity_bytes: u64,
    /// Capacity not currently assigned to any root.
    pub free_capacity_bytes: u64,
}

struct Participant {
    pool_id: u64,
    /// Registration sequence; the tie-break key for equal donors and the
    /// "oldest" ordering for victim selection.
    seq: u64,
    /// Growth priority; higher-priority roots are aborted later.
    priority: i32,
    pool: Weak<MemoryPool>,
    pause: Option<Arc<TaskPauseToken>>,
}

#[derive(Clone)]
struct WaitEntry {
    id: u64,
    pool_id: u64,
    request: u64,
}

struct ArbState {
    free_capacity: u64,
    participants: Vec<Participant>,
    waiters: VecDeque<WaitEntry>,
    results: HashMap<u64, Result<u64>>,
    next_waiter_id: u64,
    next_seq: u64,
}

/// Global capacity allocator. See the module docs.
pub struct SharedArbitrator {
    config: ArbitratorConfig,
    hook: Arc<dyn TestHook>,
    metrics: MetricsRegistry,
    state: Mutex<ArbState>,
    // Capacity returned by dropped roots. Kept out of `state` so a pool
    // dropped while the state lock is held cannot self-deadlock; drained
    // whenever the state lock is next taken.
    pending_releases: Mutex<Vec<(u64, u64)>>,
    wait_cv: Condvar,
    arbitration_in_progress: AtomicBool,
    num_requests: AtomicU64,
    num_aborted: AtomicU64,
    num_failures: AtomicU64,
    reclaimed_free_bytes: AtomicU64,
    reclaimed_used_bytes: AtomicU64,
    global_arbitration_wait_count: AtomicU64,
    local_arbitration_count: AtomicU64,
    num_task_pauses: AtomicU64,
}

impl std::fmt::Debug for SharedArbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("SharedArbitrator")
            .field("capacity", &self.config.memory_capacity_bytes)
            .field("free", &state.free_capacity)
            .field("participants", &state.participants.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl SharedArbitrator {
    /// Create an arbitrator with the no-op test hook.
    pub fn new(config: ArbitratorConfig) -> Arc<Self> {
        Self::with_hook(config, Arc::new(NoopHook))
    }

    /// Create an arbitrator with deterministic injection points installed.
    pub fn with_hook(config: ArbitratorConfig, hook: Arc<dyn TestHook>) -> Arc<Self> {
        let free = config.memory_capacity_bytes;
        Arc::new(Self {
            config,
            hook,
            metrics: global_metrics().clone(),
            state: Mutex::new(ArbState {
                free_capacity: free,
                participants: Vec::new(),
                waiters: VecDeque::new(),
                results: HashMap::new(),
                next_waiter_id: 1,
                next_seq: 1,
            }),
            pending_releases: Mutex::new(Vec::new()),
            wait_cv: Condvar::new(),
            arbitration_in_progress: AtomicBool::new(false),
            num_requests: AtomicU64::new(0),
            num_aborted: AtomicU64::new(0),
            num_failures: AtomicU64::new(0),
            reclaimed_free_bytes: AtomicU64::new(0),
            reclaimed_used_bytes: AtomicU64::new(0),
            global_arbitration_wait_count: AtomicU64::new(0),
            local_arbitration_count: AtomicU64::new(0),
            num_task_pauses: AtomicU64::new(0),
        })
    }

    /// Register a new root pool, granting it the configured initial
    /// capacity (clamped to its max and to free capacity). The pause token
    /// associates the query's task for phase-B reclaim.
    pub fn add_pool(
        self: &Arc<Self>,
        name: impl Into<String>,
        max_capacity: u64,
        pause: Option<Arc<TaskPauseToken>>,
    ) -> Arc<MemoryPool> {
        self.add_pool_with_priority(name, max_capacity, pause, 0)
    }

    /// Like [`SharedArbitrator::add_pool`] with an explicit growth
    /// priority; higher-priority roots are chosen as abort victims later.
    pub fn add_pool_with_priority(
        self: &Arc<Self>,
        name: impl Into<String>,
        max_capacity: u64,
        pause: Option<Arc<TaskPauseToken>>,
        priority: i32,
    ) -> Arc<MemoryPool> {
        let mut state = self.lock_state();
        let init = self
            .config
            .memory_pool_init_capacity
            .min(max_capacity)
            .min(state.free_capacity);
        let pool = MemoryPool::new_root(
            name,
            max_capacity,
            init,
            self.config.memory_pool_transfer_capacity,
            Arc::downgrade(self),
            pause.clone(),
        );
        state.free_capacity -= init;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.participants.push(Participant {
            pool_id: pool.id(),
            seq,
            priority,
            pool: Arc::downgrade(&pool),
            pause,
        });
        self.metrics
            .set_free_capacity(METRICS_INSTANCE, state.free_capacity);
        pool
    }

    /// Main entry point invoked by a root pool on reservation failure.
    /// Returns the granted bytes (>= `request`) on success.
    pub fn grow_capacity(self: &Arc<Self>, root: &Arc<MemoryPool>, request: u64) -> Result<u64> {
        if request == 0 {
            return Ok(0);
        }
        self.num_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(cause) = root.abort_cause() {
            return Err(MeldError::Aborted(cause));
        }

        {
            let mut state = self.lock_state();
            // Local path: served entirely from free capacity, without
            // touching any other query.
            if let Some(granted) = self.try_grant_locked(&mut state, root, request)? {
                self.local_arbitration_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_local_arbitration();
                self.metrics
                    .set_free_capacity(METRICS_INSTANCE, state.free_capacity);
                self.hook.on_grant(root.name(), granted);
                debug!(pool = %root.name(), request, granted, "local arbitration granted");
                return Ok(granted);
            }
        }

        self.grow_capacity_global(root, request)
    }

    fn try_grant_locked(
        &self,
        state: &mut ArbState,
        root: &Arc<MemoryPool>,
        request: u64,
    ) -> Result<Option<u64>> {
        let headroom = root
            .max_capacity_bytes()
            .saturating_sub(root.capacity_bytes());
        let candidate = round_up(request, self.config.memory_pool_transfer_capacity)
            .min(headroom)
            .min(state.free_capacity);
        if candidate < request {
            return Ok(None);
        }
        root.grow(candidate)?;
        state.free_capacity -= candidate;
        Ok(Some(candidate))
    }

    fn grow_capacity_global(self: &Arc<Self>, root: &Arc<MemoryPool>, request: u64) -> Result<u64> {
        self.global_arbitration_wait_count
            .fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.config.arbitration_timeout_ms);

        let id;
        {
            let mut state = self.lock_state();
            id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(WaitEntry {
                id,
                pool_id: root.id(),
                request,
            });
        }

        loop {
            let mut state = self.lock_state();
            if let Some(result) = state.results.remove(&id) {
                drop(state);
                self.metrics
                    .record_global_arbitration(start.elapsed().as_secs_f64());
                if result.is_err() {
                    self.num_failures.fetch_add(1, Ordering::Relaxed);
                }
                return result;
            }

            // Elect a coordinator; the flag flips under the state lock so a
            // finished coordinator's notify cannot be missed.
            if self
                .arbitration_in_progress
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                drop(state);
                self.run_global_arbitration();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                state.waiters.retain(|w| w.id != id);
                state.results.remove(&id);
                drop(state);
                self.num_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_arbitration_failure("timeout");
                return Err(MeldError::CapExceeded(format!(
                    "pool {} timed out waiting {} ms for {} bytes",
                    root.name(),
                    self.config.arbitration_timeout_ms,
                    request
                )));
            }
            let (guard, _timeout) = self
                .wait_cv
                .wait_timeout(state, deadline - now)
                .expect("arbitrator wait");
            drop(guard);
        }
    }

    /// Coordinator loop: drain the waiter FIFO in arrival order.
    fn run_global_arbitration(self: &Arc<Self>) {
        loop {
            let head = {
                let state = self.lock_state();
                state.waiters.front().cloned()
            };
            let Some(head) = head else { break };
            self.arbitrate_for(&head);
        }
        {
            let _state = self.state.lock().expect("arbitrator lock");
            self.arbitration_in_progress.store(false, Ordering::Release);
        }
        self.wait_cv.notify_all();
    }

    /// Run reclaim phases for the head waiter until granted or the retry
    /// budget is exhausted. Always resolves the head.
    fn arbitrate_for(self: &Arc<Self>, head: &WaitEntry) {
        let mut deferred: HashSet<u64> = HashSet::new();
        for _round in 0..GLOBAL_ARBITRATION_RETRIES {
            {
                let mut state = self.lock_state();
                if self.finish_if_requester_dead(&mut state, head) {
                    return;
                }
                // Phase A: reclaim idle capacity from every root, the
                // requester included.
                self.reclaim_free_locked(&mut state, StopWhen::HeadSatisfied(head));
                if self.try_grant_head_locked(&mut state, head) {
                    return;
                }
            }
            // Phase B: spill paused donors, requester excluded.
            if self.reclaim_used(head, &mut deferred) {
                return;
            }
            // Phase C: abort a victim.
            if self.config.abort_on_oom && self.abort_victim(head) {
                return;
            }
        }

        let mut state = self.lock_state();
        self.metrics.record_arbitration_failure("exhausted");
        self.finish_head(
            &mut state,
            head,
            Err(MeldError::CapExceeded(format!(
                "request for {} bytes not satisfiable after {GLOBAL_ARBITRATION_RETRIES} arbitration rounds",
                head.request
            ))),
        );
    }

    fn finish_head(&self, state: &mut ArbState, head: &WaitEntry, result: Result<u64>) {
        state.results.insert(head.id, result);
        state.waiters.retain(|w| w.id != head.id);
        self.metrics
            .set_free_capacity(METRICS_INSTANCE, state.free_capacity);
        self.wait_cv.notify_all();
    }

    fn participant_pool(state: &ArbState, pool_id: u64) -> Option<Arc<MemoryPool>> {
        state
            .participants
            .iter()
            .find(|p| p.pool_id == pool_id)
            .and_then(|p| p.pool.upgrade())
    }

    fn finish_if_requester_dead(&self, state: &mut ArbState, head: &WaitEntry) -> bool {
        match Self::participant_pool(state, head.pool_id) {
            None => {
                self.finish_head(
                    state,
                    head,
                    Err(MeldError::CapExceeded(
                        "requesting pool destroyed during arbitration".to_string(),
                    )),
                );
                true
            }
            Some(pool) => match pool.abort_cause() {
                Some(cause) => {
                    self.finish_head(state, head, Err(MeldError::Aborted(cause)));
                    true
                }
                None => false,
            },
        }
    }

    /// Grant the head waiter if free capacity now covers it.
    fn try_grant_head_locked(&self, state: &mut ArbState, head: &WaitEntry) -> bool {
        let Some(pool) = Self::participant_pool(state, head.pool_id) else {
            return false;
        };
        match self.try_grant_locked(state, &pool, head.request) {
            Ok(Some(granted)) => {
                self.hook.on_grant(pool.name(), granted);
                debug!(pool = %pool.name(), request = head.request, granted, "global arbitration granted");
                self.finish_head(state, head, Ok(granted));
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.finish_head(state, head, Err(err));
                true
            }
        }
    }

    fn head_satisfiable(&self, state: &ArbState, head: &WaitEntry) -> bool {
        let Some(pool) = Self::participant_pool(state, head.pool_id) else {
            // A dead requester needs nothing more; stop reclaiming for it.
            return true;
        };
        let headroom = pool
            .max_capacity_bytes()
            .saturating_sub(pool.capacity_bytes());
        let candidate = round_up(head.request, self.config.memory_pool_transfer_capacity)
            .min(headroom)
            .min(state.free_capacity);
        candidate >= head.request
    }

    /// Phase A: shrink roots back to their reservations, largest idle
    /// capacity first, crediting global free capacity.
    fn reclaim_free_locked(&self, state: &mut ArbState, stop: StopWhen<'_>) -> u64 {
        let mut entries: Vec<(u64, u64, Arc<MemoryPool>)> = state
            .participants
            .iter()
            .filter_map(|p| {
                let pool = p.pool.upgrade()?;
                let freeable = pool.capacity_bytes().saturating_sub(pool.reserved_bytes());
                (freeable > 0).then_some((freeable, p.seq, pool))
            })
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut total_freed = 0u64;
        for (_, _, pool) in entries {
            match stop {
                StopWhen::HeadSatisfied(head) if self.head_satisfiable(state, head) => break,
                StopWhen::FreedAtLeast(target) if total_freed >= target => break,
                _ => {}
            }
            let freed = pool.shrink_to_reserved();
            if freed == 0 {
                continue;
            }
            state.free_capacity += freed;
            total_freed += freed;
            self.reclaimed_free_bytes.fetch_add(freed, Ordering::Relaxed);
            self.metrics.record_reclaimed("free", freed);
        }
        total_freed
    }

    /// Phase B: reclaim used bytes from donors in descending reclaimable
    /// order, excluding the requester. Returns true once the head waiter is
    /// resolved.
    fn reclaim_used(self: &Arc<Self>, head: &WaitEntry, deferred: &mut HashSet<u64>) -> bool {
        struct Donor {
            pool_id: u64,
            pool: Arc<MemoryPool>,
            pause: Option<Arc<TaskPauseToken>>,
        }

        let donors: Vec<Donor> = {
            let state = self.lock_state();
            let mut candidates: Vec<(u64, u64, Donor)> = state
                .participants
                .iter()
                .filter(|p| p.pool_id != head.pool_id)
                .filter_map(|p| {
                    let pool = p.pool.upgrade()?;
                    if pool.is_aborted() {
                        return None;
                    }
                    let reclaimable = pool.reclaimable_used_bytes();
                    (reclaimable > 0).then_some((
                        reclaimable,
                        p.seq,
                        Donor {
                            pool_id: p.pool_id,
                            pool,
                            pause: p.pause.clone(),
                        },
                    ))
                })
                .collect();
            // Descending reclaimable bytes; ties go to the oldest root.
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            candidates.into_iter().map(|(_, _, d)| d).collect()
        };

        for donor in donors {
            // A donor whose drivers sit in non-suspendable sections is
            // skipped and deferred once; next round pauses it for real.
            if let Some(pause) = &donor.pause {
                if !pause.can_pause_immediately() && deferred.insert(donor.pool_id) {
                    continue;
                }
            }

            // Reclaim runs only under a held pause; a root registered
            // without a task cannot be quiesced and contributes zero.
            let Some(pause) = &donor.pause else {
                debug!(donor = %donor.pool.name(), "skipping reclaimable root without a pause token");
                continue;
            };
            self.hook.before_reclaim(donor.pool.name());
            let pause_guard = match pause.request_pause() {
                Some(guard) => {
                    self.num_task_pauses.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_task_pause(donor.pool.name());
                    guard
                }
                // Terminating task: contributes zero.
                None => continue,
            };

            let target = {
                let state = self.lock_state();
                round_up(
                    head.request.saturating_sub(state.free_capacity),
                    self.config.memory_pool_transfer_capacity,
                )
            };
            let mut stats = ReclaimStats::default();
            let spilled = donor.pool.reclaim(target, &mut stats);
            drop(pause_guard);
            debug!(
                donor = %donor.pool.name(),
                target,
                spilled,
                exec_ms = stats.reclaim_exec_time.as_millis() as u64,
                "phase B reclaim finished"
            );

            let mut state = self.lock_state();
            let freed = donor.pool.shrink_to_reserved();
            if freed > 0 {
                state.free_capacity += freed;
                self.reclaimed_used_bytes.fetch_add(freed, Ordering::Relaxed);
                self.metrics.record_reclaimed("used", freed);
            }
            if self.try_grant_head_locked(&mut state, head) {
                return true;
            }
        }
        false
    }

    /// Phase C: abort the victim with the largest used bytes (priority and
    /// age break ties), credit its capacity, and retry the head grant.
    fn abort_victim(self: &Arc<Self>, head: &WaitEntry) -> bool {
        let victim = {
            let state = self.lock_state();
            let mut candidates: Vec<(u64, i32, u64, Arc<MemoryPool>)> = state
                .participants
                .iter()
                .filter(|p| p.pool_id != head.pool_id)
                .filter_map(|p| {
                    let pool = p.pool.upgrade()?;
                    if pool.is_aborted() {
                        return None;
                    }
                    // An empty victim returns nothing; aborting it would be
                    // pure collateral damage.
                    (pool.used_bytes() > 0 || pool.capacity_bytes() > 0)
                        .then(|| (pool.used_bytes(), p.priority, p.seq, pool))
                })
                .collect();
            // Largest used first; lower priority and older roots go first.
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
            match candidates.into_iter().next() {
                Some((_, _, _, pool)) => pool,
                None => {
                    // The requester is only ever aborted when its live
                    // reservation already exceeds its max, which the pool
                    // invariants rule out; fail the request instead.
                    return false;
                }
            }
        };

        self.hook.before_abort(victim.name());
        warn!(victim = %victim.name(), request = head.request, "aborting victim to satisfy arbitration");
        victim.abort(AbortCause::OutOfMemory(format!(
            "aborted to free capacity for a {} byte request",
            head.request
        )));

        let mut state = self.lock_state();
        let freed = victim.shrink_to_reserved();
        state.free_capacity += freed;
        self.num_aborted.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_query_abort(victim.name());
        self.try_grant_head_locked(&mut state, head)
    }

    /// Bulk reclaim used for admission control: release at least `target`
    /// bytes of idle capacity process-wide. Returns the bytes freed, which
    /// may be less than the target.
    pub fn shrink_capacity(&self, target: u64) -> u64 {
        let mut state = self.lock_state();
        let freed = self.reclaim_free_locked(&mut state, StopWhen::FreedAtLeast(target));
        self.metrics
            .set_free_capacity(METRICS_INSTANCE, state.free_capacity);
        freed
    }

    /// Return a destroyed root's capacity to free capacity. Runs from pool
    /// drop, so it only queues; the credit lands at the next state lock.
    pub(crate) fn release_root(&self, pool_id: u64, capacity: u64) {
        self.pending_releases
            .lock()
            .expect("release lock")
            .push((pool_id, capacity));
        self.wait_cv.notify_all();
    }

    /// Fold queued root releases into the arbitration state.
    fn drain_releases_locked(&self, state: &mut ArbState) {
        let pending: Vec<(u64, u64)> = {
            let mut queue = self.pending_releases.lock().expect("release lock");
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }
        for (pool_id, capacity) in pending {
            state.participants.retain(|p| p.pool_id != pool_id);
            state.free_capacity += capacity;
        }
        self.metrics
            .set_free_capacity(METRICS_INSTANCE, state.free_capacity);
    }

    /// Take the state lock with queued root releases applied.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ArbState> {
        let mut state = self.state.lock().expect("arbitrator lock");
        self.drain_releases_locked(&mut state);
        state
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ArbitratorStats {
        let state = self.lock_state();
        ArbitratorStats {
            num_requests: self.num_requests.load(Ordering::Relaxed),
            num_aborted: self.num_aborted.load(Ordering::Relaxed),
            num_failures: self.num_failures.load(Ordering::Relaxed),
            reclaimed_free_bytes: self.reclaimed_free_bytes.load(Ordering::Relaxed),
            reclaimed_used_bytes: self.reclaimed_used_bytes.load(Ordering::Relaxed),
            global_arbitration_wait_count: self
                .global_arbitration_wait_count
                .load(Ordering::Relaxed),
            local_arbitration_count: self.local_arbitration_count.load(Ordering::Relaxed),
            num_task_pauses: self.num_task_pauses.load(Ordering::Relaxed),
            max_capacity_bytes: self.config.memory_capacity_bytes,
            free_capacity_bytes: state.free_capacity,
        }
    }

    /// Capacity not assigned to any root right now.
    pub fn free_capacity_bytes(&self) -> u64 {
        self.lock_state().free_capacity
    }
}

#[derive(Clone, Copy)]
enum StopWhen<'a> {
    HeadSatisfied(&'a WaitEntry),
    FreedAtLeast(u64),
}

fn round_up(value: u64, granularity: u64) -> u64 {
    let granularity = granularity.max(1);
    value.div_ceil(granularity) * granularity
}

#[cfg(test)]
mod tests {
    use super::round_up;

    #[test]
    fn round_up_aligns_to_granularity() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8), 16);
        assert_eq!(round_up(5, 0), 5);
    }
}
