//! Per-source cursor over sorted batches and the output assembler.
//!
//! A `SourceStream` exposes one upstream as a row cursor: the merge claims
//! the cursor's current row into an output slot, advances it, and the
//! stream defers the actual copy. Claimed rows are flushed in contiguous
//! runs into the `OutputAssembler`, which pins the source batch and
//! materializes the finished output batch with one columnar interleave per
//! column. A stream MUST flush before its batch is replaced; `pop`
//! enforces that with a checked error.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::interleave;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows};
use arrow_schema::SchemaRef;
use meld_common::{MeldError, Result};

use crate::merge::loser_tree::MergeStream;
use crate::merge::source::MergeSource;
use crate::operator::{BlockingReason, ContinueFuture};

/// Cursor over one sorted upstream.
pub(crate) struct SourceStream {
    source: Arc<dyn MergeSource>,
    converter: Arc<RowConverter>,
    key_columns: Vec<usize>,
    batch: Option<RecordBatch>,
    /// Row-encoded sort keys of the current batch; rebuilt whenever the
    /// batch is replaced so they never refer to a stale batch.
    key_rows: Option<Rows>,
    current_row: usize,
    at_end: bool,
    need_data: bool,
    /// Output slots claimed from the current batch, in claim order. Claim
    /// order equals source-row order, so a flush copies the contiguous run
    /// starting at `first_source_row`.
    claimed_slots: Vec<usize>,
    first_source_row: usize,
}

impl SourceStream {
    pub(crate) fn new(
        source: Arc<dyn MergeSource>,
        converter: Arc<RowConverter>,
        key_columns: Vec<usize>,
    ) -> Self {
        Self {
            source,
            converter,
            key_columns,
            batch: None,
            key_rows: None,
            current_row: 0,
            at_end: false,
            need_data: true,
            claimed_slots: Vec::new(),
            first_source_row: 0,
        }
    }

    /// Fetch the first/next batch if one is pending. Returns true when a
    /// blocking future was enqueued.
    pub(crate) fn is_blocked(&mut self, futures: &mut Vec<ContinueFuture>) -> Result<bool> {
        if self.need_data {
            self.fetch_more_data(futures)
        } else {
            Ok(false)
        }
    }

    /// Claim the current row for output slot `slot`. Returns true when the
    /// claimed row is the batch's last: the caller must flush before the
    /// next `pop` replaces the batch.
    pub(crate) fn set_output_row(&mut self, slot: usize) -> bool {
        self.claimed_slots.push(slot);
        match &self.batch {
            Some(batch) => self.current_row + 1 == batch.num_rows(),
            None => false,
        }
    }

    /// Advance past the current row. Crossing the batch boundary triggers
    /// the next fetch; returns true when that fetch enqueued a blocking
    /// future.
    pub(crate) fn pop(&mut self, futures: &mut Vec<ContinueFuture>) -> Result<bool> {
        let batch_rows = self
            .batch
            .as_ref()
            .map(RecordBatch::num_rows)
            .ok_or_else(|| {
                MeldError::InvariantViolation("pop on a stream without a batch".to_string())
            })?;
        self.current_row += 1;
        if self.current_row == batch_rows {
            if !self.claimed_slots.is_empty() {
                return Err(MeldError::InvariantViolation(
                    "batch replaced with claimed rows not copied out".to_string(),
                ));
            }
            return self.fetch_more_data(futures);
        }
        Ok(false)
    }

    /// Copy all claimed rows of the current batch into the assembler as one
    /// contiguous run, then clear the claim record.
    pub(crate) fn copy_to_output(&mut self, output: &mut OutputAssembler) -> Result<()> {
        if self.claimed_slots.is_empty() {
            return Ok(());
        }
        let batch = self.batch.clone().ok_or_else(|| {
            MeldError::InvariantViolation("copy_to_output without a batch".to_string())
        })?;
        let batch_rows = batch.num_rows();
        let claimed = self.claimed_slots.len();
        let pinned = output.pin(batch);
        for (offset, slot) in self.claimed_slots.drain(..).enumerate() {
            output.set(slot, pinned, self.first_source_row + offset)?;
        }
        self.first_source_row += claimed;
        if self.first_source_row >= batch_rows {
            self.first_source_row = 0;
        }
        Ok(())
    }

    fn fetch_more_data(&mut self, futures: &mut Vec<ContinueFuture>) -> Result<bool> {
        let mut data = None;
        let mut future = None;
        let reason = self.source.next(&mut data, &mut future)?;
        if reason != BlockingReason::NotBlocked {
            self.need_data = true;
            let future = future.ok_or_else(|| {
                MeldError::InvariantViolation(
                    "blocked source returned no continue future".to_string(),
                )
            })?;
            futures.push(future);
            return Ok(true);
        }

        self.need_data = false;
        self.current_row = 0;
        self.first_source_row = 0;
        match data {
            Some(batch) if batch.num_rows() > 0 => {
                let keys: Vec<ArrayRef> = self
                    .key_columns
                    .iter()
                    .map(|&column| Arc::clone(batch.column(column)))
                    .collect();
                let rows = self
                    .converter
                    .convert_columns(&keys)
                    .map_err(|e| MeldError::Execution(format!("sort key encoding failed: {e}")))?;
                self.key_rows = Some(rows);
                self.batch = Some(batch);
            }
            _ => {
                self.at_end = true;
                self.batch = None;
                self.key_rows = None;
            }
        }
        Ok(false)
    }
}

impl MergeStream for SourceStream {
    fn has_data(&self) -> bool {
        !self.at_end && !self.need_data && self.batch.is_some()
    }

    fn lt(&self, other: &Self) -> bool {
        match (&self.key_rows, &other.key_rows) {
            (Some(mine), Some(theirs)) => {
                mine.row(self.current_row) < theirs.row(other.current_row)
            }
            // Compared only between streams with data; anything else sorts
            // after.
            _ => false,
        }
    }
}

/// Fixed-capacity output batch under assembly.
///
/// Slots are claimed in global sort order; flushes record `(pinned batch,
/// source row)` per slot, and `finish` interleaves each column once.
pub(crate) struct OutputAssembler {
    schema: SchemaRef,
    capacity: usize,
    slots: Vec<(usize, usize)>,
    pinned: Vec<RecordBatch>,
}

const UNSET: usize = usize::MAX;

impl OutputAssembler {
    pub(crate) fn new(schema: SchemaRef, capacity: usize) -> Self {
        Self {
            schema,
            capacity,
            slots: vec![(UNSET, 0); capacity],
            pinned: Vec::new(),
        }
    }

    /// Keep a source batch alive until the output batch is finished.
    fn pin(&mut self, batch: RecordBatch) -> usize {
        self.pinned.push(batch);
        self.pinned.len() - 1
    }

    fn set(&mut self, slot: usize, pinned: usize, row: usize) -> Result<()> {
        if slot >= self.capacity {
            return Err(MeldError::InvariantViolation(format!(
                "output slot {slot} out of bounds for capacity {}",
                self.capacity
            )));
        }
        self.slots[slot] = (pinned, row);
        Ok(())
    }

    /// Materialize the first `len` slots into a record batch and reset for
    /// the next one.
    pub(crate) fn finish(&mut self, len: usize) -> Result<RecordBatch> {
        if len == 0 || len > self.capacity {
            return Err(MeldError::InvariantViolation(format!(
                "cannot finish an output batch of {len} rows (capacity {})",
                self.capacity
            )));
        }
        let indices = &self.slots[..len];
        if indices.iter().any(|(batch, _)| *batch == UNSET) {
            return Err(MeldError::InvariantViolation(
                "output batch finished with unfilled slots".to_string(),
            ));
        }

        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for column in 0..self.schema.fields().len() {
            let arrays: Vec<&dyn arrow::array::Array> = self
                .pinned
                .iter()
                .map(|batch| batch.column(column).as_ref())
                .collect();
            let assembled = interleave(&arrays, indices)
                .map_err(|e| MeldError::Execution(format!("output interleave failed: {e}")))?;
            columns.push(assembled);
        }
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), columns)
            .map_err(|e| MeldError::Execution(format!("output batch assembly failed: {e}")))?;

        self.pinned.clear();
        for slot in &mut self.slots[..len] {
            *slot = (UNSET, 0);
        }
        Ok(batch)
    }
}
