//! K-way streaming sort-merge source operator.
//!
//! The merge pulls from several sorted upstreams, orders rows through a
//! loser tree, and emits fixed-size output batches. It honors lazy pull
//! semantics end to end: sources are resolved and started on the first
//! `is_blocked`, a blocked upstream surfaces its continue future to the
//! driver, and row copies are deferred into contiguous per-source runs.
//!
//! Two variants share the core: `LocalMerge` reads sources registered on
//! the task by the producing pipelines, `MergeExchange` builds one
//! exchange source per remote task id fed through the task's split queue.

pub mod loser_tree;
pub mod source;
mod stream;

use std::sync::Arc;

use arrow::compute::SortOptions;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use arrow_schema::SchemaRef;
use meld_common::ids::{DriverId, PlanNodeId, SplitGroupId};
use meld_common::{
    global_metrics, CompressionKind, MeldError, MergeConfig, MetricsRegistry, Result, SerdeKind,
};

use crate::merge::loser_tree::TreeOfLosers;
use crate::merge::source::{
    ExchangeMergeSource, MergeSource, MAX_QUEUED_BYTES_LOWER_LIMIT, MAX_QUEUED_BYTES_UPPER_LIMIT,
};
use crate::merge::stream::{OutputAssembler, SourceStream};
use crate::operator::{BlockingReason, ContinueFuture, RuntimeStats, SourceOperator};
use crate::task::{SplitFetch, Task};

/// One sort key: an output column and its ordering flags.
#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    /// Column index in the merge output schema.
    pub column: usize,
    /// Ascending/descending and null placement.
    pub options: SortOptions,
}

impl SortKey {
    pub fn new(column: usize, options: SortOptions) -> Self {
        Self { column, options }
    }

    /// Ascending, nulls last.
    pub fn ascending(column: usize) -> Self {
        Self {
            column,
            options: SortOptions {
                descending: false,
                nulls_first: false,
            },
        }
    }
}

enum MergeKind {
    Local {
        task: Arc<Task>,
        split_group: SplitGroupId,
        node: PlanNodeId,
        resolved: bool,
    },
    Exchange {
        task: Arc<Task>,
        node: PlanNodeId,
        driver: DriverId,
        no_more_splits: bool,
        remote_task_ids: Vec<String>,
        exchange_sources: Vec<Arc<ExchangeMergeSource>>,
        serde_kind: SerdeKind,
        compression_kind: CompressionKind,
        max_merge_buffer_bytes: u64,
    },
}

/// The merge operator. Construct through [`Merge::local`] or
/// [`Merge::exchange`].
pub struct Merge {
    operator_name: &'static str,
    schema: SchemaRef,
    sort_keys: Vec<SortKey>,
    output_batch_rows: usize,
    converter: Arc<RowConverter>,
    kind: MergeKind,
    sources: Vec<Arc<dyn MergeSource>>,
    num_started_sources: usize,
    tree: Option<TreeOfLosers<SourceStream>>,
    output: Option<OutputAssembler>,
    output_size: usize,
    source_blocking_futures: Vec<ContinueFuture>,
    finished: bool,
    closed: bool,
    runtime_stats: RuntimeStats,
    metrics: MetricsRegistry,
}

impl std::fmt::Debug for Merge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merge")
            .field("operator_name", &self.operator_name)
            .finish()
    }
}

impl Merge {
    /// Merge over sources registered on the task by producing pipelines.
    /// Runs single-threaded: only driver 0 may construct it.
    pub fn local(
        task: Arc<Task>,
        split_group: SplitGroupId,
        node: PlanNodeId,
        driver: DriverId,
        schema: SchemaRef,
        sort_keys: Vec<SortKey>,
        config: &MergeConfig,
    ) -> Result<Self> {
        if driver.0 != 0 {
            return Err(MeldError::InvariantViolation(
                "local merge must run on driver 0".to_string(),
            ));
        }
        Self::new_inner(
            "LocalMerge",
            schema,
            sort_keys,
            config.output_batch_rows,
            MergeKind::Local {
                task,
                split_group,
                node,
                resolved: false,
            },
        )
    }

    /// Merge over remote task outputs fed through the task's split queue.
    /// On drivers other than 0 the operator resolves to no sources and
    /// finishes immediately; one operator per task merges pages.
    pub fn exchange(
        task: Arc<Task>,
        node: PlanNodeId,
        driver: DriverId,
        schema: SchemaRef,
        sort_keys: Vec<SortKey>,
        config: &MergeConfig,
    ) -> Result<Self> {
        Self::new_inner(
            "MergeExchange",
            schema,
            sort_keys,
            config.output_batch_rows,
            MergeKind::Exchange {
                task,
                node,
                driver,
                no_more_splits: false,
                remote_task_ids: Vec::new(),
                exchange_sources: Vec::new(),
                serde_kind: config.serde_kind,
                compression_kind: config.compression_kind,
                max_merge_buffer_bytes: config.max_merge_buffer_bytes,
            },
        )
    }

    fn new_inner(
        operator_name: &'static str,
        schema: SchemaRef,
        sort_keys: Vec<SortKey>,
        output_batch_rows: usize,
        kind: MergeKind,
    ) -> Result<Self> {
        if sort_keys.is_empty() {
            return Err(MeldError::InvariantViolation(
                "merge requires at least one sort key".to_string(),
            ));
        }
        if output_batch_rows == 0 {
            return Err(MeldError::InvariantViolation(
                "merge output batch size must be positive".to_string(),
            ));
        }
        let mut fields = Vec::with_capacity(sort_keys.len());
        for key in &sort_keys {
            let field = schema.fields().get(key.column).ok_or_else(|| {
                MeldError::InvariantViolation(format!(
                    "sort key column {} out of range for merge schema",
                    key.column
                ))
            })?;
            fields.push(SortField::new_with_options(
                field.data_type().clone(),
                key.options,
            ));
        }
        let converter = RowConverter::new(fields)
            .map_err(|e| MeldError::Execution(format!("sort key converter failed: {e}")))?;

        Ok(Self {
            operator_name,
            schema,
            sort_keys,
            output_batch_rows,
            converter: Arc::new(converter),
            kind,
            sources: Vec::new(),
            num_started_sources: 0,
            tree: None,
            output: None,
            output_size: 0,
            source_blocking_futures: Vec::new(),
            finished: false,
            closed: false,
            runtime_stats: RuntimeStats::default(),
            metrics: global_metrics().clone(),
        })
    }

    /// Exchange sources built from splits; empty for the local variant and
    /// before split resolution completes.
    pub fn exchange_sources(&self) -> &[Arc<ExchangeMergeSource>] {
        match &self.kind {
            MergeKind::Exchange {
                exchange_sources, ..
            } => exchange_sources,
            MergeKind::Local { .. } => &[],
        }
    }

    /// Resolve the source set. Local: fetch the task's registered sources
    /// once. Exchange: drain splits until the no-more-splits marker, then
    /// build one budgeted source per remote task id.
    fn add_merge_sources(&mut self, future: &mut Option<ContinueFuture>) -> Result<BlockingReason> {
        let Merge { kind, sources, .. } = self;
        match kind {
            MergeKind::Local {
                task,
                split_group,
                node,
                resolved,
            } => {
                if !*resolved {
                    for local in task.local_merge_sources(*split_group, *node) {
                        sources.push(local as Arc<dyn MergeSource>);
                    }
                    *resolved = true;
                }
                Ok(BlockingReason::NotBlocked)
            }
            MergeKind::Exchange {
                task,
                node,
                driver,
                no_more_splits,
                remote_task_ids,
                exchange_sources,
                serde_kind,
                max_merge_buffer_bytes,
                ..
            } => {
                if driver.0 != 0 || *no_more_splits {
                    return Ok(BlockingReason::NotBlocked);
                }
                loop {
                    match task.split_or_future(*node) {
                        SplitFetch::Split(split) => {
                            remote_task_ids.push(split.remote_task_id);
                        }
                        SplitFetch::Blocked(wait) => {
                            *future = Some(wait);
                            return Ok(BlockingReason::WaitForSplit);
                        }
                        SplitFetch::NoMoreSplits => {
                            if !remote_task_ids.is_empty() {
                                let per_source = (*max_merge_buffer_bytes
                                    / remote_task_ids.len() as u64)
                                    .clamp(MAX_QUEUED_BYTES_LOWER_LIMIT, MAX_QUEUED_BYTES_UPPER_LIMIT);
                                for (index, task_id) in remote_task_ids.iter().enumerate() {
                                    let pool = task.add_merge_source_pool(*node, index);
                                    let exchange = ExchangeMergeSource::new(
                                        task_id.clone(),
                                        per_source,
                                        pool,
                                        *serde_kind,
                                    );
                                    exchange_sources.push(Arc::clone(&exchange));
                                    sources.push(exchange as Arc<dyn MergeSource>);
                                }
                            }
                            *no_more_splits = true;
                            return Ok(BlockingReason::NotBlocked);
                        }
                    }
                }
            }
        }
    }

    fn start_sources(&mut self) -> Result<()> {
        if self.num_started_sources >= self.sources.len() {
            return Ok(());
        }
        if self.num_started_sources != 0 {
            return Err(MeldError::InvariantViolation(
                "merge sources partially started".to_string(),
            ));
        }
        for source in &self.sources {
            source.start();
        }
        self.num_started_sources = self.sources.len();
        Ok(())
    }

    fn initialize_tree(&mut self) {
        let key_columns: Vec<usize> = self.sort_keys.iter().map(|k| k.column).collect();
        let streams: Vec<SourceStream> = self
            .sources
            .iter()
            .map(|source| {
                SourceStream::new(
                    Arc::clone(source),
                    Arc::clone(&self.converter),
                    key_columns.clone(),
                )
            })
            .collect();
        self.tree = Some(TreeOfLosers::new(streams));
    }

    fn merge_output(&mut self) -> Result<Option<RecordBatch>> {
        let operator_name = self.operator_name;
        let metrics = self.metrics.clone();
        let Merge {
            tree,
            output,
            output_size,
            source_blocking_futures,
            schema,
            output_batch_rows,
            finished,
            ..
        } = self;
        let tree = tree.as_mut().ok_or_else(|| {
            MeldError::InvariantViolation("merge tree not initialized".to_string())
        })?;
        let output = output
            .get_or_insert_with(|| OutputAssembler::new(Arc::clone(schema), *output_batch_rows));

        loop {
            let Some(winner) = tree.next() else {
                *finished = true;
                // Streams flush as their batches end; this sweep is a
                // no-op unless a stream still holds claims.
                for stream in tree.streams_mut() {
                    stream.copy_to_output(output)?;
                }
                if *output_size == 0 {
                    return Ok(None);
                }
                let rows = std::mem::take(output_size);
                let batch = output.finish(rows)?;
                metrics.record_merge_output(operator_name, batch.num_rows() as u64, 1);
                return Ok(Some(batch));
            };

            let slot = *output_size;
            let stream = tree.stream_mut(winner);
            if stream.set_output_row(slot) {
                // The claimed row is the batch's last: copy the run out
                // before pop replaces the batch.
                stream.copy_to_output(output)?;
            }
            *output_size += 1;
            stream.pop(source_blocking_futures)?;

            if *output_size == *output_batch_rows {
                for stream in tree.streams_mut() {
                    stream.copy_to_output(output)?;
                }
                let rows = std::mem::take(output_size);
                let batch = output.finish(rows)?;
                metrics.record_merge_output(operator_name, batch.num_rows() as u64, 1);
                return Ok(Some(batch));
            }

            if !source_blocking_futures.is_empty() {
                return Ok(None);
            }
        }
    }
}

impl SourceOperator for Merge {
    fn name(&self) -> &'static str {
        self.operator_name
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn is_blocked(&mut self, future: &mut Option<ContinueFuture>) -> Result<BlockingReason> {
        if self.finished {
            return Ok(BlockingReason::NotBlocked);
        }
        let reason = self.add_merge_sources(future)?;
        if reason != BlockingReason::NotBlocked {
            return Ok(reason);
        }

        // The task might terminate early and leave no sources; the merge
        // then simply finishes.
        if self.sources.is_empty() {
            self.finished = true;
            return Ok(BlockingReason::NotBlocked);
        }

        self.start_sources()?;
        if self.tree.is_none() && self.sources.len() > 1 {
            self.initialize_tree();
        }

        let Merge {
            tree,
            source_blocking_futures,
            ..
        } = self;
        if source_blocking_futures.is_empty() {
            if let Some(tree) = tree.as_mut() {
                for stream in tree.streams_mut() {
                    stream.is_blocked(source_blocking_futures)?;
                }
            }
        }
        if let Some(wait) = self.source_blocking_futures.pop() {
            self.metrics.record_merge_blocked(self.operator_name);
            *future = Some(wait);
            return Ok(BlockingReason::WaitForProducer);
        }
        Ok(BlockingReason::NotBlocked)
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        if self.finished {
            return Ok(None);
        }
        if self.num_started_sources != self.sources.len() {
            return Err(MeldError::InvariantViolation(
                "get_output before sources were started".to_string(),
            ));
        }

        // No merging is needed with a single source; batches pass through.
        if self.sources.len() == 1 {
            let mut data = None;
            let mut wait = None;
            let reason = self.sources[0].next(&mut data, &mut wait)?;
            if reason != BlockingReason::NotBlocked {
                let wait = wait.ok_or_else(|| {
                    MeldError::InvariantViolation(
                        "blocked source returned no continue future".to_string(),
                    )
                })?;
                self.source_blocking_futures.push(wait);
                self.metrics.record_merge_blocked(self.operator_name);
                return Ok(None);
            }
            return match data {
                Some(batch) => {
                    self.metrics.record_merge_output(
                        self.operator_name,
                        batch.num_rows() as u64,
                        1,
                    );
                    Ok(Some(batch))
                }
                None => {
                    self.finished = true;
                    Ok(None)
                }
            };
        }

        self.merge_output()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for source in &self.sources {
            source.close();
        }
        let Merge {
            kind,
            runtime_stats,
            ..
        } = self;
        if let MergeKind::Exchange {
            serde_kind,
            compression_kind,
            ..
        } = kind
        {
            runtime_stats.add("shuffle_serde_kind", serde_kind.as_str());
            runtime_stats.add("shuffle_compression_kind", compression_kind.as_str());
        }
        Ok(())
    }

    fn runtime_stats(&self) -> RuntimeStats {
        self.runtime_stats.clone()
    }
}
