//! Reclaim capability records attached to memory pools.
//!
//! A reclaimer advertises how much an operator could spill and performs the
//! spill on request. It is a capability record wired at pool construction,
//! not a subtype of the pool: pools without the capability are
//! [`Reclaimer::NonReclaimable`] and the arbitrator never pauses their task
//! on their behalf.

use std::time::Duration;

use meld_common::Result;

/// Outcome accounting filled in by reclaim calls.
#[derive(Debug, Default, Clone)]
pub struct ReclaimStats {
    /// Bytes actually released across all reclaim calls.
    pub reclaimed_bytes: u64,
    /// Wall time spent inside reclaim handlers.
    pub reclaim_exec_time: Duration,
    /// Number of reclaim handler invocations.
    pub num_reclaims: u64,
}

/// Best-effort upper bound of bytes a reclaim could release.
pub type ReclaimableBytesFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// Spill handler: frees at least `min(target, reclaimable_bytes())` when
/// possible, may return less, never more than currently allocated. Returns
/// the bytes released. Precondition: the owning task is paused.
pub type ReclaimFn = Box<dyn Fn(u64) -> Result<u64> + Send + Sync>;

/// Operator-provided spill hooks.
pub struct OperatorReclaim {
    reclaimable_bytes: ReclaimableBytesFn,
    reclaim: ReclaimFn,
}

impl std::fmt::Debug for OperatorReclaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorReclaim")
            .field("reclaimable_bytes", &(self.reclaimable_bytes)())
            .finish()
    }
}

/// Reclaim capability attached to a pool.
#[derive(Debug)]
pub enum Reclaimer {
    /// Pool cannot release anything under pressure.
    NonReclaimable,
    /// Leaf operator that can spill in-memory state.
    Operator(OperatorReclaim),
}

impl Reclaimer {
    /// Build an operator reclaimer from its two hooks.
    pub fn operator(reclaimable_bytes: ReclaimableBytesFn, reclaim: ReclaimFn) -> Self {
        Self::Operator(OperatorReclaim {
            reclaimable_bytes,
            reclaim,
        })
    }

    /// Whether this pool participates in used-bytes reclaim.
    pub fn can_reclaim(&self) -> bool {
        matches!(self, Self::Operator(_))
    }

    /// Best-effort upper bound of reclaimable bytes; zero when the pool is
    /// non-reclaimable.
    pub fn reclaimable_bytes(&self) -> u64 {
        match self {
            Self::NonReclaimable => 0,
            Self::Operator(op) => (op.reclaimable_bytes)(),
        }
    }

    /// Invoke the spill handler. Callers must hold the task pause and update
    /// `stats` with the outcome.
    pub(crate) fn reclaim(&self, target: u64, stats: &mut ReclaimStats) -> Result<u64> {
        match self {
            Self::NonReclaimable => Ok(0),
            Self::Operator(op) => {
                let start = std::time::Instant::now();
                let result = (op.reclaim)(target);
                stats.reclaim_exec_time += start.elapsed();
                stats.num_reclaims += 1;
                if let Ok(freed) = &result {
                    stats.reclaimed_bytes += freed;
                }
                result
            }
        }
    }
}
