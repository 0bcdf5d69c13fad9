//! Blocking contract shared by source operators and their upstreams.
//!
//! Operators are pull-based: the driver polls `is_blocked` before each
//! `get_output` and parks on the returned continue future when the operator
//! cannot make progress. Producers complete the paired promise to wake the
//! driver.

use std::collections::HashMap;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::channel::oneshot;
use futures::future::Shared;
use futures::FutureExt;
use meld_common::Result;

/// Why an operator cannot make progress right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingReason {
    /// The operator can run.
    NotBlocked,
    /// Waiting for an upstream producer to enqueue data.
    WaitForProducer,
    /// Waiting for the task to feed more splits.
    WaitForSplit,
}

/// Future a driver parks on until a blocked operator may continue.
pub type ContinueFuture = Shared<oneshot::Receiver<()>>;

/// Completion side of a [`ContinueFuture`].
///
/// Completes on drop as well, so a torn-down producer still wakes its
/// consumers; woken drivers re-check operator state rather than trusting
/// the wake.
#[derive(Debug)]
pub struct ContinuePromise {
    tx: Option<oneshot::Sender<()>>,
}

impl ContinuePromise {
    /// Wake the paired future.
    pub fn complete(mut self) {
        self.complete_inner();
    }

    fn complete_inner(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ContinuePromise {
    fn drop(&mut self) {
        self.complete_inner();
    }
}

/// Create a promise/future pair for one blocking episode.
pub fn continue_contract() -> (ContinuePromise, ContinueFuture) {
    let (tx, rx) = oneshot::channel();
    (ContinuePromise { tx: Some(tx) }, rx.shared())
}

/// Name/value runtime stats reported by operators at close.
#[derive(Debug, Default, Clone)]
pub struct RuntimeStats {
    values: HashMap<&'static str, String>,
}

impl RuntimeStats {
    /// Record one stat, overwriting any previous value.
    pub fn add(&mut self, name: &'static str, value: impl Into<String>) {
        self.values.insert(name, value.into());
    }

    /// Look up one stat.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Whether anything was recorded.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A pipeline source operator producing record batches.
pub trait SourceOperator: Send {
    /// Stable operator name for explain/logging.
    fn name(&self) -> &'static str;

    /// Output schema for all batches emitted by this operator.
    fn schema(&self) -> SchemaRef;

    /// Polled by the driver before each [`SourceOperator::get_output`].
    /// When blocked, stores the future to park on and returns the reason.
    fn is_blocked(&mut self, future: &mut Option<ContinueFuture>) -> Result<BlockingReason>;

    /// Produce the next batch, or `None` when blocked or finished.
    fn get_output(&mut self) -> Result<Option<RecordBatch>>;

    /// Whether the operator will produce no further output.
    fn is_finished(&self) -> bool;

    /// Release resources. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Stats recorded over the operator's lifetime, final after close.
    fn runtime_stats(&self) -> RuntimeStats {
        RuntimeStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promise_completes_future() {
        let (promise, future) = continue_contract();
        assert!(future.clone().now_or_never().is_none());
        promise.complete();
        assert!(future.now_or_never().is_some());
    }

    #[test]
    fn dropped_promise_still_wakes() {
        let (promise, future) = continue_contract();
        drop(promise);
        assert!(future.now_or_never().is_some());
    }

    #[test]
    fn runtime_stats_roundtrip() {
        let mut stats = RuntimeStats::default();
        assert!(stats.is_empty());
        stats.add("shuffle_serde_kind", "arrow-ipc");
        assert_eq!(stats.get("shuffle_serde_kind"), Some("arrow-ipc"));
        assert!(stats.get("missing").is_none());
    }
}
