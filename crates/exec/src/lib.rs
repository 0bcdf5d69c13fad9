//! Streaming sort-merge execution for Meld.
//!
//! Architecture role:
//! - the k-way merge source operator (local and exchange variants)
//! - per-upstream merge sources with bounded queues and backpressure
//! - the loser-tree tournament ordering streams
//! - the task-side registries and split plumbing the merge consumes
//!
//! Key modules:
//! - [`merge`]
//! - [`operator`]
//! - [`task`]

/// K-way sort-merge operator and its streams.
pub mod merge;
/// Blocking contract and continue futures.
pub mod operator;
/// Task-side collaborators of the merge.
pub mod task;

pub use merge::source::{ExchangeMergeSource, LocalMergeSource, MergeSource};
pub use merge::{Merge, SortKey};
pub use operator::{
    continue_contract, BlockingReason, ContinueFuture, ContinuePromise, RuntimeStats,
    SourceOperator,
};
pub use task::{RemoteSplit, SplitFetch, Task};
