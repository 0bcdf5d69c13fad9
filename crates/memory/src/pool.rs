//! Hierarchical memory pools.
//!
//! Each query owns a tree of pools: the root carries the query's capacity
//! (managed by the arbitrator), intermediate pools aggregate accounting,
//! and leaf pools perform allocations on behalf of operators. Reservation
//! accounting walks leaf-to-root under a single per-tree lock; capacity
//! changes are serialized per root through the arbitrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use meld_common::{AbortCause, MeldError, Result};
use tracing::warn;

use crate::arbitrator::SharedArbitrator;
use crate::pause::TaskPauseToken;
use crate::reclaimer::{ReclaimStats, Reclaimer};

static POOL_ID_SEQ: AtomicU64 = AtomicU64::new(1);

const RESERVE_MAX_ATTEMPTS: usize = 8;

/// Whether a pool aggregates children or backs operator allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Allocates backing memory; has no children.
    Leaf,
    /// Aggregates child accounting only.
    Aggregate,
}

/// Point-in-time accounting snapshot of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPoolStats {
    /// Bytes reserved against capacity.
    pub reserved_bytes: u64,
    /// Bytes backing live allocations.
    pub used_bytes: u64,
    /// Current capacity (root) or local ceiling (non-root).
    pub capacity_bytes: u64,
    /// Hard upper bound the arbitrator may grow to.
    pub max_capacity_bytes: u64,
}

/// Outcome of the locked reservation walk.
enum ReserveOutcome {
    Reserved,
    /// Root capacity is short by this many bytes; arbitration required.
    NeedMoreCapacity(u64),
}

/// A node in a query's memory pool tree.
pub struct MemoryPool {
    id: u64,
    name: String,
    kind: PoolKind,
    parent: Option<Weak<MemoryPool>>,
    max_capacity: u64,
    granularity: u64,
    tree_lock: Arc<Mutex<()>>,
    reserved: AtomicU64,
    used: AtomicU64,
    capacity: AtomicU64,
    aborted: Mutex<Option<AbortCause>>,
    reclaimer: Reclaimer,
    children: Mutex<Vec<Weak<MemoryPool>>>,
    // Root-only links back to the coordinator and the owning task.
    arbitrator: Option<Weak<SharedArbitrator>>,
    pause: Option<Arc<TaskPauseToken>>,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("reserved", &self.reserved_bytes())
            .field("used", &self.used_bytes())
            .field("capacity", &self.capacity_bytes())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

impl MemoryPool {
    pub(crate) fn new_root(
        name: impl Into<String>,
        max_capacity: u64,
        init_capacity: u64,
        granularity: u64,
        arbitrator: Weak<SharedArbitrator>,
        pause: Option<Arc<TaskPauseToken>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: POOL_ID_SEQ.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            kind: PoolKind::Aggregate,
            parent: None,
            max_capacity,
            granularity: granularity.max(1),
            tree_lock: Arc::new(Mutex::new(())),
            reserved: AtomicU64::new(0),
            used: AtomicU64::new(0),
            capacity: AtomicU64::new(init_capacity),
            aborted: Mutex::new(None),
            reclaimer: Reclaimer::NonReclaimable,
            children: Mutex::new(Vec::new()),
            arbitrator: Some(arbitrator),
            pause,
        })
    }

    fn new_child(self: &Arc<Self>, name: String, kind: PoolKind, reclaimer: Reclaimer) -> Arc<Self> {
        let child = Arc::new(Self {
            id: POOL_ID_SEQ.fetch_add(1, Ordering::Relaxed),
            name,
            kind,
            parent: Some(Arc::downgrade(self)),
            max_capacity: self.max_capacity,
            granularity: self.granularity,
            tree_lock: Arc::clone(&self.tree_lock),
            reserved: AtomicU64::new(0),
            used: AtomicU64::new(0),
            // Non-root pools are bounded by their max alone; the root's
            // capacity is the arbitrated limit.
            capacity: AtomicU64::new(self.max_capacity),
            aborted: Mutex::new(None),
            reclaimer,
            children: Mutex::new(Vec::new()),
            arbitrator: None,
            pause: None,
        });
        self.children
            .lock()
            .expect("children lock")
            .push(Arc::downgrade(&child));
        child
    }

    /// Add an aggregating child pool.
    pub fn add_aggregate_child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        self.new_child(name.into(), PoolKind::Aggregate, Reclaimer::NonReclaimable)
    }

    /// Add a leaf pool without reclaim capability.
    pub fn add_leaf_child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        self.new_child(name.into(), PoolKind::Leaf, Reclaimer::NonReclaimable)
    }

    /// Add a leaf pool with a spill capability wired at construction.
    pub fn add_leaf_child_with_reclaimer(
        self: &Arc<Self>,
        name: impl Into<String>,
        reclaimer: Reclaimer,
    ) -> Arc<Self> {
        self.new_child(name.into(), PoolKind::Leaf, reclaimer)
    }

    /// Stable pool identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pool name used in errors, logs, and metrics labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this pool is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether this pool backs operator allocations.
    pub fn is_leaf(&self) -> bool {
        self.kind == PoolKind::Leaf
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn max_capacity_bytes(&self) -> u64 {
        self.max_capacity
    }

    /// Grow/shrink granularity shared by the whole tree.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Pause token of the owning task, set on roots at registration.
    pub fn pause_token(&self) -> Option<&Arc<TaskPauseToken>> {
        self.pause.as_ref()
    }

    /// Accounting snapshot.
    pub fn stats(&self) -> MemoryPoolStats {
        MemoryPoolStats {
            reserved_bytes: self.reserved_bytes(),
            used_bytes: self.used_bytes(),
            capacity_bytes: self.capacity_bytes(),
            max_capacity_bytes: self.max_capacity,
        }
    }

    fn root(self: &Arc<Self>) -> Arc<MemoryPool> {
        let mut current = Arc::clone(self);
        loop {
            let parent = match &current.parent {
                Some(weak) => weak.upgrade(),
                None => return current,
            };
            match parent {
                Some(p) => current = p,
                // A detached subtree keeps working against its own top.
                None => return current,
            }
        }
    }

    /// Chain from this pool up to the root, inclusive.
    fn ancestor_chain(self: &Arc<Self>) -> Vec<Arc<MemoryPool>> {
        let mut chain = vec![Arc::clone(self)];
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.as_ref().and_then(Weak::upgrade) {
            chain.push(Arc::clone(&parent));
            current = parent;
        }
        chain
    }

    fn strong_children(&self) -> Vec<Arc<MemoryPool>> {
        self.children
            .lock()
            .expect("children lock")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// First abort cause found walking from this pool to the root.
    pub(crate) fn abort_cause(self: &Arc<Self>) -> Option<AbortCause> {
        for pool in self.ancestor_chain() {
            let cause = pool.aborted.lock().expect("abort lock");
            if let Some(cause) = cause.as_ref() {
                return Some(cause.clone());
            }
        }
        None
    }

    fn check_aborted(self: &Arc<Self>) -> Result<()> {
        match self.abort_cause() {
            Some(cause) => Err(MeldError::Aborted(cause)),
            None => Ok(()),
        }
    }

    /// Increase this pool's reservation, escalating to the arbitrator when
    /// the root capacity is insufficient.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        for _ in 0..RESERVE_MAX_ATTEMPTS {
            self.check_aborted()?;
            let need = match self.try_reserve(bytes)? {
                ReserveOutcome::Reserved => return Ok(()),
                ReserveOutcome::NeedMoreCapacity(need) => need,
            };

            let root = self.root();
            let arbitrator = root
                .arbitrator
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or_else(|| {
                    MeldError::CapExceeded(format!(
                        "pool {} has no arbitrator to grow capacity by {need} bytes",
                        root.name
                    ))
                })?;

            // The wait for capacity may pause this task; count the caller
            // as suspended so a concurrent pause of our own task resolves.
            let _suspended = root.pause.as_ref().map(TaskPauseToken::suspend);
            arbitrator.grow_capacity(&root, need)?;
        }
        Err(MeldError::CapExceeded(format!(
            "pool {} failed to reserve {bytes} bytes after repeated arbitration",
            self.name
        )))
    }

    fn try_reserve(self: &Arc<Self>, bytes: u64) -> Result<ReserveOutcome> {
        let _guard = self.tree_lock.lock().expect("tree lock");
        if let Some(cause) = self.abort_cause() {
            return Err(MeldError::Aborted(cause));
        }
        let chain = self.ancestor_chain();
        for pool in &chain {
            let new_reserved = pool.reserved_bytes() + bytes;
            if new_reserved > pool.max_capacity {
                return Err(MeldError::CapExceeded(format!(
                    "pool {} reservation of {new_reserved} bytes exceeds max capacity {}",
                    pool.name, pool.max_capacity
                )));
            }
            if pool.is_root() {
                let capacity = pool.capacity_bytes();
                if new_reserved > capacity {
                    return Ok(ReserveOutcome::NeedMoreCapacity(new_reserved - capacity));
                }
            } else if new_reserved > pool.capacity_bytes() {
                return Err(MeldError::CapExceeded(format!(
                    "pool {} reservation of {new_reserved} bytes exceeds capacity {}",
                    pool.name,
                    pool.capacity_bytes()
                )));
            }
        }
        for pool in &chain {
            pool.reserved.fetch_add(bytes, Ordering::AcqRel);
        }
        Ok(ReserveOutcome::Reserved)
    }

    /// Return reservation that is no longer needed.
    pub fn release(self: &Arc<Self>, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let _guard = self.tree_lock.lock().expect("tree lock");
        let chain = self.ancestor_chain();
        for pool in &chain {
            let reserved = pool.reserved_bytes();
            if reserved < bytes || reserved - bytes < pool.used_bytes() {
                return Err(MeldError::InvariantViolation(format!(
                    "pool {} cannot release {bytes} bytes: reserved {reserved}, used {}",
                    pool.name,
                    pool.used_bytes()
                )));
            }
        }
        for pool in &chain {
            pool.reserved.fetch_sub(bytes, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Account an allocation against the existing reservation. Only leaf
    /// pools allocate.
    pub fn allocate(self: &Arc<Self>, bytes: u64) -> Result<()> {
        if !self.is_leaf() {
            return Err(MeldError::InvariantViolation(format!(
                "allocate on non-leaf pool {}",
                self.name
            )));
        }
        if bytes == 0 {
            return Ok(());
        }
        let _guard = self.tree_lock.lock().expect("tree lock");
        if let Some(cause) = self.abort_cause() {
            return Err(MeldError::Aborted(cause));
        }
        let chain = self.ancestor_chain();
        for pool in &chain {
            let new_used = pool.used_bytes() + bytes;
            if new_used > pool.reserved_bytes() {
                return Err(MeldError::CapExceeded(format!(
                    "pool {} allocation of {bytes} bytes exceeds reservation: used {new_used}, reserved {}",
                    pool.name,
                    pool.reserved_bytes()
                )));
            }
        }
        for pool in &chain {
            pool.used.fetch_add(bytes, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Release an allocation's accounting.
    pub fn free(self: &Arc<Self>, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let _guard = self.tree_lock.lock().expect("tree lock");
        let chain = self.ancestor_chain();
        for pool in &chain {
            if pool.used_bytes() < bytes {
                return Err(MeldError::InvariantViolation(format!(
                    "pool {} cannot free {bytes} bytes: used {}",
                    pool.name,
                    pool.used_bytes()
                )));
            }
        }
        for pool in &chain {
            pool.used.fetch_sub(bytes, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Increase root capacity. Called only by the arbitrator.
    pub(crate) fn grow(&self, delta: u64) -> Result<()> {
        if !self.is_root() {
            return Err(MeldError::InvariantViolation(format!(
                "grow on non-root pool {}",
                self.name
            )));
        }
        let _guard = self.tree_lock.lock().expect("tree lock");
        let capacity = self.capacity_bytes();
        if capacity + delta > self.max_capacity {
            return Err(MeldError::InvariantViolation(format!(
                "growing pool {} by {delta} bytes exceeds max capacity {}",
                self.name, self.max_capacity
            )));
        }
        self.capacity.store(capacity + delta, Ordering::Release);
        Ok(())
    }

    /// Decrease root capacity. Called only by the arbitrator; never cuts
    /// into live reservations.
    pub(crate) fn shrink(&self, delta: u64) -> Result<()> {
        if !self.is_root() {
            return Err(MeldError::InvariantViolation(format!(
                "shrink on non-root pool {}",
                self.name
            )));
        }
        let _guard = self.tree_lock.lock().expect("tree lock");
        let capacity = self.capacity_bytes();
        if capacity < delta || capacity - delta < self.reserved_bytes() {
            return Err(MeldError::InvariantViolation(format!(
                "shrinking pool {} by {delta} bytes cuts into reservations: capacity {capacity}, reserved {}",
                self.name,
                self.reserved_bytes()
            )));
        }
        self.capacity.store(capacity - delta, Ordering::Release);
        Ok(())
    }

    /// Release all capacity not backing live reservations. Called only by
    /// the arbitrator; the compute-and-shrink runs under the tree lock so a
    /// concurrent reservation cannot be cut.
    pub(crate) fn shrink_to_reserved(&self) -> u64 {
        let _guard = self.tree_lock.lock().expect("tree lock");
        let capacity = self.capacity_bytes();
        let reserved = self.reserved_bytes();
        let freed = capacity.saturating_sub(reserved);
        if freed > 0 {
            self.capacity.store(reserved, Ordering::Release);
        }
        freed
    }

    /// Whether this pool or an ancestor was aborted.
    pub(crate) fn is_aborted(self: &Arc<Self>) -> bool {
        self.abort_cause().is_some()
    }

    /// Atomically mark the subtree aborted and drop its accounting. Later
    /// operations on the subtree fail fast with the given cause.
    pub fn abort(self: &Arc<Self>, cause: AbortCause) {
        {
            let mut aborted = self.aborted.lock().expect("abort lock");
            if aborted.is_some() {
                return;
            }
            *aborted = Some(cause);
        }
        let _guard = self.tree_lock.lock().expect("tree lock");
        let dropped_reserved = self.reserved_bytes();
        let dropped_used = self.used_bytes();
        self.zero_subtree();
        // Ancestors above the aborted subtree keep running; their sums lose
        // exactly what the subtree held.
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.as_ref().and_then(Weak::upgrade) {
            parent.reserved.fetch_sub(dropped_reserved, Ordering::AcqRel);
            parent.used.fetch_sub(dropped_used, Ordering::AcqRel);
            current = parent;
        }
    }

    fn zero_subtree(&self) {
        self.reserved.store(0, Ordering::Release);
        self.used.store(0, Ordering::Release);
        for child in self.strong_children() {
            child.zero_subtree();
        }
    }

    /// Whether any pool in the subtree advertises reclaim capability.
    pub fn can_reclaim(&self) -> bool {
        if self.reclaimer.can_reclaim() {
            return true;
        }
        self.strong_children().iter().any(|c| c.can_reclaim())
    }

    /// Best-effort reclaimable used bytes across the subtree, capped by the
    /// bytes each leaf actually has allocated.
    pub fn reclaimable_used_bytes(&self) -> u64 {
        let own = match &self.reclaimer {
            Reclaimer::NonReclaimable => 0,
            r => r.reclaimable_bytes().min(self.used_bytes()),
        };
        own + self
            .strong_children()
            .iter()
            .map(|c| c.reclaimable_used_bytes())
            .sum::<u64>()
    }

    /// Spill reclaimable leaves of the subtree until `target` bytes are
    /// released or candidates run out. Errors are confined to the failing
    /// leaf. Precondition: the owning task is paused.
    pub(crate) fn reclaim(self: &Arc<Self>, target: u64, stats: &mut ReclaimStats) -> u64 {
        let mut freed = 0u64;
        self.reclaim_walk(target, &mut freed, stats);
        freed
    }

    fn reclaim_walk(self: &Arc<Self>, target: u64, freed: &mut u64, stats: &mut ReclaimStats) {
        if *freed >= target {
            return;
        }
        if self.reclaimer.can_reclaim() {
            match self.reclaimer.reclaim(target - *freed, stats) {
                Ok(bytes) => *freed += bytes,
                Err(err) => {
                    warn!(pool = %self.name, error = %err, "reclaim failed; treating as zero progress");
                }
            }
        }
        for child in self.strong_children() {
            child.reclaim_walk(target, freed, stats);
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if let Some(arbitrator) = self.arbitrator.as_ref().and_then(Weak::upgrade) {
            arbitrator.release_root(self.id, self.capacity.load(Ordering::Acquire));
        }
        let used = self.used.load(Ordering::Acquire);
        if used != 0 {
            warn!(pool = %self.name, used, "memory pool dropped with live allocations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn root_without_arbitrator(capacity: u64) -> Arc<MemoryPool> {
        MemoryPool::new_root("root", u64::MAX, capacity, MB, Weak::new(), None)
    }

    #[test]
    fn reserve_allocate_free_roundtrip() {
        let root = root_without_arbitrator(64 * MB);
        let leaf = root.add_leaf_child("op");

        leaf.reserve(16 * MB).expect("reserve");
        leaf.allocate(10 * MB).expect("allocate");
        assert_eq!(leaf.used_bytes(), 10 * MB);
        assert_eq!(root.used_bytes(), 10 * MB);
        assert_eq!(root.reserved_bytes(), 16 * MB);

        leaf.free(10 * MB).expect("free");
        leaf.release(16 * MB).expect("release");
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(root.used_bytes(), 0);
    }

    #[test]
    fn allocate_requires_reservation() {
        let root = root_without_arbitrator(64 * MB);
        let leaf = root.add_leaf_child("op");
        let err = leaf.allocate(MB).expect_err("no reservation");
        assert!(matches!(err, MeldError::CapExceeded(_)));
    }

    #[test]
    fn only_leaves_allocate() {
        let root = root_without_arbitrator(64 * MB);
        let agg = root.add_aggregate_child("agg");
        let err = agg.allocate(MB).expect_err("aggregate allocation");
        assert!(matches!(err, MeldError::InvariantViolation(_)));
    }

    #[test]
    fn child_reservations_aggregate_through_intermediates() {
        let root = root_without_arbitrator(64 * MB);
        let agg = root.add_aggregate_child("task");
        let a = agg.add_leaf_child("a");
        let b = agg.add_leaf_child("b");

        a.reserve(8 * MB).expect("reserve a");
        b.reserve(4 * MB).expect("reserve b");
        assert_eq!(agg.reserved_bytes(), 12 * MB);
        assert_eq!(root.reserved_bytes(), 12 * MB);
        assert!(agg.reserved_bytes() <= root.reserved_bytes());
    }

    #[test]
    fn reserve_without_arbitrator_fails_on_shortfall() {
        let root = root_without_arbitrator(4 * MB);
        let leaf = root.add_leaf_child("op");
        let err = leaf.reserve(8 * MB).expect_err("no arbitrator");
        assert!(matches!(err, MeldError::CapExceeded(_)));
    }

    #[test]
    fn abort_fails_fast_and_zeroes_accounting() {
        let root = root_without_arbitrator(64 * MB);
        let leaf = root.add_leaf_child("op");
        leaf.reserve(8 * MB).expect("reserve");
        leaf.allocate(8 * MB).expect("allocate");

        root.abort(AbortCause::Terminated("test".to_string()));
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(root.used_bytes(), 0);
        assert_eq!(leaf.used_bytes(), 0);

        let err = leaf.reserve(MB).expect_err("aborted");
        assert!(matches!(
            err,
            MeldError::Aborted(AbortCause::Terminated(_))
        ));
        // Second abort keeps the original cause.
        root.abort(AbortCause::OutOfMemory("later".to_string()));
        let err = leaf.allocate(MB).expect_err("still aborted");
        assert!(matches!(
            err,
            MeldError::Aborted(AbortCause::Terminated(_))
        ));
    }

    #[test]
    fn release_underflow_is_invariant_violation() {
        let root = root_without_arbitrator(64 * MB);
        let leaf = root.add_leaf_child("op");
        let err = leaf.release(MB).expect_err("underflow");
        assert!(matches!(err, MeldError::InvariantViolation(_)));

        leaf.reserve(2 * MB).expect("reserve");
        leaf.allocate(2 * MB).expect("allocate");
        let err = leaf.release(MB).expect_err("release under used");
        assert!(matches!(err, MeldError::InvariantViolation(_)));
    }

    #[test]
    fn shrink_to_reserved_stops_at_reservations() {
        let root = root_without_arbitrator(64 * MB);
        let leaf = root.add_leaf_child("op");
        leaf.reserve(10 * MB).expect("reserve");

        assert_eq!(root.shrink_to_reserved(), 54 * MB);
        assert_eq!(root.capacity_bytes(), 10 * MB);
        assert_eq!(root.shrink_to_reserved(), 0);
    }

    #[test]
    fn reclaim_walk_skips_non_reclaimable_leaves() {
        use std::sync::atomic::AtomicU64;

        let root = root_without_arbitrator(64 * MB);
        let _plain = root.add_leaf_child("plain");
        let held = Arc::new(AtomicU64::new(8 * MB));
        let held_for_bytes = Arc::clone(&held);
        let held_for_reclaim = Arc::clone(&held);
        let reclaimable = root.add_leaf_child_with_reclaimer(
            "spillable",
            Reclaimer::operator(
                Box::new(move || held_for_bytes.load(Ordering::Acquire)),
                Box::new(move |target| {
                    let freed = target.min(held_for_reclaim.load(Ordering::Acquire));
                    held_for_reclaim.fetch_sub(freed, Ordering::AcqRel);
                    Ok(freed)
                }),
            ),
        );
        reclaimable.reserve(8 * MB).expect("reserve");
        reclaimable.allocate(8 * MB).expect("allocate");

        assert_eq!(root.reclaimable_used_bytes(), 8 * MB);
        let mut stats = ReclaimStats::default();
        let freed = root.reclaim(6 * MB, &mut stats);
        assert_eq!(freed, 6 * MB);
        assert_eq!(stats.reclaimed_bytes, 6 * MB);
        assert_eq!(stats.num_reclaims, 1);
    }

    #[test]
    fn invariants_hold_per_pool() {
        let root = root_without_arbitrator(32 * MB);
        let leaf = root.add_leaf_child("op");
        leaf.reserve(12 * MB).expect("reserve");
        leaf.allocate(5 * MB).expect("allocate");

        for pool in [&root, &leaf] {
            let stats = pool.stats();
            assert!(stats.used_bytes <= stats.reserved_bytes);
            assert!(stats.reserved_bytes <= stats.capacity_bytes);
            assert!(stats.capacity_bytes <= stats.max_capacity_bytes);
        }
    }
}
