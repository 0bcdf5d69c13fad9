//! Merge sources: per-upstream bounded batch queues.
//!
//! A merge source sits between one sorted producer and the merge driver.
//! Producers enqueue batches and receive a backpressure future once the
//! queue holds more than its byte budget; the consumer receives a
//! `WaitForProducer` future when the queue is empty. The exchange variant
//! additionally decodes arrow-IPC pages and accounts queued bytes against
//! a leaf pool in the query's memory tree.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use meld_common::{MeldError, Result, SerdeKind};
use meld_memory::MemoryPool;

use crate::operator::{continue_contract, BlockingReason, ContinueFuture, ContinuePromise};

/// Queue budget floor applied per exchange source.
pub const MAX_QUEUED_BYTES_LOWER_LIMIT: u64 = 1 << 20;
/// Queue budget ceiling applied per exchange source.
pub const MAX_QUEUED_BYTES_UPPER_LIMIT: u64 = 32 << 20;

/// One sorted upstream feeding the merge.
pub trait MergeSource: Send + Sync {
    /// Begin producing. Called exactly once by the merge operator.
    fn start(&self);

    /// Fetch the next batch. `out` is `None` at end of stream; when
    /// blocked, `future` carries the wakeup and the reason is returned.
    fn next(
        &self,
        out: &mut Option<RecordBatch>,
        future: &mut Option<ContinueFuture>,
    ) -> Result<BlockingReason>;

    /// Stop producing and drop queued data. Idempotent.
    fn close(&self);
}

#[derive(Default)]
struct QueueState {
    batches: VecDeque<RecordBatch>,
    queued_bytes: u64,
    no_more_data: bool,
    closed: bool,
    consumer: Option<ContinuePromise>,
    producers: Vec<ContinuePromise>,
}

impl QueueState {
    fn push(&mut self, batch: RecordBatch, bytes: u64) {
        self.queued_bytes += bytes;
        self.batches.push_back(batch);
        if let Some(consumer) = self.consumer.take() {
            consumer.complete();
        }
    }

    fn backpressure(&mut self, max_queued_bytes: u64) -> Option<ContinueFuture> {
        if self.queued_bytes < max_queued_bytes {
            return None;
        }
        let (promise, future) = continue_contract();
        self.producers.push(promise);
        Some(future)
    }

    fn pop(&mut self) -> Option<(RecordBatch, u64)> {
        let batch = self.batches.pop_front()?;
        let bytes = batch_bytes(&batch);
        self.queued_bytes -= bytes;
        for producer in self.producers.drain(..) {
            producer.complete();
        }
        Some((batch, bytes))
    }

    fn finish(&mut self) {
        self.no_more_data = true;
        if let Some(consumer) = self.consumer.take() {
            consumer.complete();
        }
    }

    fn close(&mut self) -> u64 {
        self.closed = true;
        let dropped = self.queued_bytes;
        self.batches.clear();
        self.queued_bytes = 0;
        if let Some(consumer) = self.consumer.take() {
            consumer.complete();
        }
        for producer in self.producers.drain(..) {
            producer.complete();
        }
        dropped
    }
}

fn batch_bytes(batch: &RecordBatch) -> u64 {
    batch.get_array_memory_size() as u64
}

/// Merge source fed in-process by the task's producing pipelines.
pub struct LocalMergeSource {
    max_queued_bytes: u64,
    state: Mutex<QueueState>,
}

impl LocalMergeSource {
    pub fn new(max_queued_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_queued_bytes: max_queued_bytes.max(1),
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Producer side: enqueue one sorted batch. Returns a backpressure
    /// future once the queue exceeds its budget; the producer should wait
    /// on it before enqueueing more.
    pub fn enqueue(&self, batch: RecordBatch) -> Result<Option<ContinueFuture>> {
        let mut state = self.state.lock().expect("merge source lock");
        if state.closed {
            return Err(MeldError::Execution(
                "enqueue on closed merge source".to_string(),
            ));
        }
        if state.no_more_data {
            return Err(MeldError::InvariantViolation(
                "enqueue after no-more-data on merge source".to_string(),
            ));
        }
        let bytes = batch_bytes(&batch);
        state.push(batch, bytes);
        Ok(state.backpressure(self.max_queued_bytes))
    }

    /// Producer side: mark the stream complete.
    pub fn finish(&self) {
        self.state.lock().expect("merge source lock").finish();
    }

    /// Queue budget in bytes.
    pub fn max_queued_bytes(&self) -> u64 {
        self.max_queued_bytes
    }
}

impl MergeSource for LocalMergeSource {
    fn start(&self) {
        // Queue-backed sources produce eagerly; the producing pipelines are
        // driven by the task, not by this call.
    }

    fn next(
        &self,
        out: &mut Option<RecordBatch>,
        future: &mut Option<ContinueFuture>,
    ) -> Result<BlockingReason> {
        let mut state = self.state.lock().expect("merge source lock");
        if let Some((batch, _)) = state.pop() {
            *out = Some(batch);
            return Ok(BlockingReason::NotBlocked);
        }
        if state.no_more_data || state.closed {
            *out = None;
            return Ok(BlockingReason::NotBlocked);
        }
        let (promise, wait) = continue_contract();
        state.consumer = Some(promise);
        *future = Some(wait);
        Ok(BlockingReason::WaitForProducer)
    }

    fn close(&self) {
        self.state.lock().expect("merge source lock").close();
    }
}

/// Merge source fed by a remote task through serialized pages.
///
/// Queued bytes are reserved in the source's leaf pool, so a remote merge
/// with many upstreams is visible to (and bounded by) the memory
/// arbitrator.
pub struct ExchangeMergeSource {
    remote_task_id: String,
    serde_kind: SerdeKind,
    max_queued_bytes: u64,
    pool: Arc<MemoryPool>,
    state: Mutex<QueueState>,
}

impl ExchangeMergeSource {
    pub(crate) fn new(
        remote_task_id: String,
        max_queued_bytes: u64,
        pool: Arc<MemoryPool>,
        serde_kind: SerdeKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_task_id,
            serde_kind,
            max_queued_bytes: max_queued_bytes.max(1),
            pool,
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Identity of the producing task.
    pub fn remote_task_id(&self) -> &str {
        &self.remote_task_id
    }

    /// Queue budget in bytes.
    pub fn max_queued_bytes(&self) -> u64 {
        self.max_queued_bytes
    }

    /// Decode one serialized page into batches and enqueue them, charging
    /// the source's pool for the queued bytes.
    pub fn enqueue_page(&self, page: &[u8]) -> Result<Option<ContinueFuture>> {
        let batches = match self.serde_kind {
            SerdeKind::ArrowIpc => decode_ipc_page(page)?,
        };
        let total: u64 = batches.iter().map(batch_bytes).sum();
        // Pool accounting happens outside the queue lock: a reservation may
        // wait on arbitration, and the consumer must stay able to drain.
        self.pool.reserve(total)?;
        self.pool.allocate(total)?;

        let mut state = self.state.lock().expect("merge source lock");
        if state.closed {
            drop(state);
            self.pool.free(total)?;
            self.pool.release(total)?;
            return Err(MeldError::Execution(
                "page enqueued on closed exchange source".to_string(),
            ));
        }
        if state.no_more_data {
            drop(state);
            self.pool.free(total)?;
            self.pool.release(total)?;
            return Err(MeldError::InvariantViolation(
                "page enqueued after no-more-data".to_string(),
            ));
        }
        for batch in batches {
            let bytes = batch_bytes(&batch);
            state.push(batch, bytes);
        }
        Ok(state.backpressure(self.max_queued_bytes))
    }

    /// Producer side: mark the stream complete.
    pub fn finish(&self) {
        self.state.lock().expect("merge source lock").finish();
    }
}

impl MergeSource for ExchangeMergeSource {
    fn start(&self) {
        // Pages arrive from the exchange client as the remote task produces
        // them; there is nothing to kick off here.
    }

    fn next(
        &self,
        out: &mut Option<RecordBatch>,
        future: &mut Option<ContinueFuture>,
    ) -> Result<BlockingReason> {
        let popped = {
            let mut state = self.state.lock().expect("merge source lock");
            if let Some((batch, bytes)) = state.pop() {
                Some((batch, bytes))
            } else if state.no_more_data || state.closed {
                None
            } else {
                let (promise, wait) = continue_contract();
                state.consumer = Some(promise);
                *future = Some(wait);
                return Ok(BlockingReason::WaitForProducer);
            }
        };
        match popped {
            Some((batch, bytes)) => {
                self.pool.free(bytes)?;
                self.pool.release(bytes)?;
                *out = Some(batch);
                Ok(BlockingReason::NotBlocked)
            }
            None => {
                *out = None;
                Ok(BlockingReason::NotBlocked)
            }
        }
    }

    fn close(&self) {
        let dropped = self.state.lock().expect("merge source lock").close();
        if dropped > 0 {
            if let Err(err) = self.pool.free(dropped).and(self.pool.release(dropped)) {
                tracing::warn!(
                    source = %self.remote_task_id,
                    error = %err,
                    "failed to return queued bytes on close"
                );
            }
        }
    }
}

fn decode_ipc_page(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let cursor = Cursor::new(bytes.to_vec());
    let reader = arrow::ipc::reader::StreamReader::try_new(cursor, None)
        .map_err(|e| MeldError::Execution(format!("ipc reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MeldError::Execution(format!("ipc read failed: {e}")))
}

#[cfg(test)]
mod tests {
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use futures::FutureExt;

    use super::*;

    fn batch(values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
            .expect("batch")
    }

    #[test]
    fn empty_queue_blocks_until_enqueue() {
        let source = LocalMergeSource::new(1 << 20);
        let mut out = None;
        let mut future = None;
        assert_eq!(
            source.next(&mut out, &mut future).expect("next"),
            BlockingReason::WaitForProducer
        );
        let wait = future.take().expect("future");
        assert!(wait.clone().now_or_never().is_none());

        source.enqueue(batch(&[1, 2])).expect("enqueue");
        assert!(wait.now_or_never().is_some());
        assert_eq!(
            source.next(&mut out, &mut future).expect("next"),
            BlockingReason::NotBlocked
        );
        assert_eq!(out.take().expect("batch").num_rows(), 2);
    }

    #[test]
    fn finished_queue_returns_end_of_stream() {
        let source = LocalMergeSource::new(1 << 20);
        source.finish();
        let mut out = Some(batch(&[9]));
        let mut future = None;
        assert_eq!(
            source.next(&mut out, &mut future).expect("next"),
            BlockingReason::NotBlocked
        );
        assert!(out.is_none());
        assert!(source.enqueue(batch(&[1])).is_err());
    }

    #[test]
    fn producer_backpressure_releases_on_dequeue() {
        // A one-byte budget: every enqueue crosses it.
        let source = LocalMergeSource::new(1);
        let pressure = source
            .enqueue(batch(&[1]))
            .expect("enqueue")
            .expect("backpressure future");
        assert!(pressure.clone().now_or_never().is_none());

        let mut out = None;
        let mut future = None;
        source.next(&mut out, &mut future).expect("next");
        assert!(out.is_some());
        assert!(pressure.now_or_never().is_some());
    }

    #[test]
    fn close_is_idempotent_and_fails_enqueue() {
        let source = LocalMergeSource::new(1 << 20);
        source.enqueue(batch(&[1])).expect("enqueue");
        source.close();
        source.close();
        assert!(source.enqueue(batch(&[2])).is_err());
        let mut out = Some(batch(&[9]));
        let mut future = None;
        assert_eq!(
            source.next(&mut out, &mut future).expect("next"),
            BlockingReason::NotBlocked
        );
        assert!(out.is_none());
    }
}
