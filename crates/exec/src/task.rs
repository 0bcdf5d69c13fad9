//! Task-side collaborators of the merge operator.
//!
//! A task owns the query's memory pool root and pause token, the registry
//! of local merge sources keyed by `(split group, plan node)`, and the
//! split queues feeding remote merges. The merge operator only ever talks
//! to these interfaces; scheduling and plan construction live elsewhere.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use meld_common::ids::{PlanNodeId, SplitGroupId};
use meld_memory::{MemoryPool, TaskPauseToken};

use crate::merge::source::LocalMergeSource;
use crate::operator::{continue_contract, ContinueFuture, ContinuePromise};

/// A split naming one upstream task to merge from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSplit {
    /// Identity of the producing task.
    pub remote_task_id: String,
}

/// Outcome of polling the task for a split.
#[derive(Debug)]
pub enum SplitFetch {
    /// A split is available.
    Split(RemoteSplit),
    /// The task will feed no further splits for this node.
    NoMoreSplits,
    /// No split yet; park on the future.
    Blocked(ContinueFuture),
}

#[derive(Default)]
struct SplitQueue {
    splits: VecDeque<RemoteSplit>,
    no_more: bool,
    waiters: Vec<ContinuePromise>,
}

/// Execution-task state the merge operator consumes.
pub struct Task {
    query_pool: Arc<MemoryPool>,
    pause: Arc<TaskPauseToken>,
    local_sources: Mutex<HashMap<(SplitGroupId, PlanNodeId), Vec<Arc<LocalMergeSource>>>>,
    split_queues: Mutex<HashMap<PlanNodeId, SplitQueue>>,
}

impl Task {
    pub fn new(query_pool: Arc<MemoryPool>, pause: Arc<TaskPauseToken>) -> Arc<Self> {
        Arc::new(Self {
            query_pool,
            pause,
            local_sources: Mutex::new(HashMap::new()),
            split_queues: Mutex::new(HashMap::new()),
        })
    }

    /// Root of this query's memory pool tree.
    pub fn query_pool(&self) -> &Arc<MemoryPool> {
        &self.query_pool
    }

    /// Pause token shared with the arbitrator.
    pub fn pause_token(&self) -> &Arc<TaskPauseToken> {
        &self.pause
    }

    /// Create `count` merge sources for a local merge node and hand them to
    /// both the producing pipelines and the merge driver.
    pub fn register_local_merge_sources(
        &self,
        split_group: SplitGroupId,
        node: PlanNodeId,
        count: usize,
        max_queued_bytes: u64,
    ) -> Vec<Arc<LocalMergeSource>> {
        let sources: Vec<Arc<LocalMergeSource>> = (0..count)
            .map(|_| LocalMergeSource::new(max_queued_bytes))
            .collect();
        self.local_sources
            .lock()
            .expect("local sources lock")
            .insert((split_group, node), sources.clone());
        sources
    }

    /// Sources registered for a local merge node. Empty when the task
    /// terminated before the producing pipelines registered; the merge
    /// treats that as immediately finished.
    pub fn local_merge_sources(
        &self,
        split_group: SplitGroupId,
        node: PlanNodeId,
    ) -> Vec<Arc<LocalMergeSource>> {
        self.local_sources
            .lock()
            .expect("local sources lock")
            .get(&(split_group, node))
            .cloned()
            .unwrap_or_default()
    }

    /// Feed one split to a remote merge node, waking any blocked reader.
    pub fn add_split(&self, node: PlanNodeId, split: RemoteSplit) {
        let mut queues = self.split_queues.lock().expect("split queues lock");
        let queue = queues.entry(node).or_default();
        queue.splits.push_back(split);
        for waiter in queue.waiters.drain(..) {
            waiter.complete();
        }
    }

    /// Mark a node's split feed complete.
    pub fn no_more_splits(&self, node: PlanNodeId) {
        let mut queues = self.split_queues.lock().expect("split queues lock");
        let queue = queues.entry(node).or_default();
        queue.no_more = true;
        for waiter in queue.waiters.drain(..) {
            waiter.complete();
        }
    }

    /// Poll for the next split of a node.
    pub fn split_or_future(&self, node: PlanNodeId) -> SplitFetch {
        let mut queues = self.split_queues.lock().expect("split queues lock");
        let queue = queues.entry(node).or_default();
        if let Some(split) = queue.splits.pop_front() {
            return SplitFetch::Split(split);
        }
        if queue.no_more {
            return SplitFetch::NoMoreSplits;
        }
        let (promise, future) = continue_contract();
        queue.waiters.push(promise);
        SplitFetch::Blocked(future)
    }

    /// Register a leaf pool for one exchange source in the query's tree.
    pub fn add_merge_source_pool(&self, node: PlanNodeId, source_index: usize) -> Arc<MemoryPool> {
        self.query_pool
            .add_leaf_child(format!("merge-exchange.{node}.{source_index}"))
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn test_task() -> (Arc<Task>, Arc<meld_memory::SharedArbitrator>) {
        let arbitrator = meld_memory::SharedArbitrator::new(meld_common::ArbitratorConfig {
            memory_capacity_bytes: 64 * 1024 * 1024,
            memory_pool_init_capacity: 64 * 1024 * 1024,
            memory_pool_transfer_capacity: 1024 * 1024,
            arbitration_timeout_ms: 1_000,
            abort_on_oom: false,
        });
        let pause = TaskPauseToken::new();
        let pool = arbitrator.add_pool("q1", u64::MAX, Some(Arc::clone(&pause)));
        (Task::new(pool, pause), arbitrator)
    }

    #[test]
    fn local_sources_roundtrip() {
        let (task, _arbitrator) = test_task();
        let group = SplitGroupId(0);
        let node = PlanNodeId(7);
        let registered = task.register_local_merge_sources(group, node, 3, 1024);
        assert_eq!(registered.len(), 3);
        let fetched = task.local_merge_sources(group, node);
        assert_eq!(fetched.len(), 3);
        assert!(task.local_merge_sources(group, PlanNodeId(8)).is_empty());
    }

    #[test]
    fn split_queue_blocks_then_drains() {
        let (task, _arbitrator) = test_task();
        let node = PlanNodeId(1);

        let future = match task.split_or_future(node) {
            SplitFetch::Blocked(future) => future,
            other => panic!("expected blocked, got {other:?}"),
        };
        assert!(future.clone().now_or_never().is_none());

        task.add_split(
            node,
            RemoteSplit {
                remote_task_id: "t-1".to_string(),
            },
        );
        assert!(future.now_or_never().is_some());

        match task.split_or_future(node) {
            SplitFetch::Split(split) => assert_eq!(split.remote_task_id, "t-1"),
            other => panic!("expected split, got {other:?}"),
        }

        task.no_more_splits(node);
        assert!(matches!(
            task.split_or_future(node),
            SplitFetch::NoMoreSplits
        ));
    }

    #[test]
    fn merge_source_pools_land_in_query_tree() {
        let (task, _arbitrator) = test_task();
        let pool = task.add_merge_source_pool(PlanNodeId(3), 1);
        assert!(pool.is_leaf());
        pool.reserve(1024).expect("reserve");
        pool.allocate(1024).expect("allocate");
        assert_eq!(task.query_pool().used_bytes(), 1024);
        pool.free(1024).expect("free");
        pool.release(1024).expect("release");
    }
}
