use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Process-wide metrics for arbitration and merge execution.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    arbitration_requests: CounterVec,
    arbitration_failures: CounterVec,
    arbitration_wait_seconds: HistogramVec,
    reclaimed_bytes: CounterVec,
    task_pauses: CounterVec,
    query_aborts: CounterVec,
    free_capacity_bytes: GaugeVec,
    merge_rows_out: CounterVec,
    merge_batches_out: CounterVec,
    merge_blocked_waits: CounterVec,
}

impl MetricsRegistry {
    /// Create an empty registry with all metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record a capacity growth served from global free capacity alone.
    pub fn record_local_arbitration(&self) {
        self.inner
            .arbitration_requests
            .with_label_values(&["local"])
            .inc();
    }

    /// Record a capacity growth that entered the global arbitration queue.
    pub fn record_global_arbitration(&self, wait_secs: f64) {
        self.inner
            .arbitration_requests
            .with_label_values(&["global"])
            .inc();
        self.inner
            .arbitration_wait_seconds
            .with_label_values(&["global"])
            .observe(wait_secs.max(0.0));
    }

    /// Record an arbitration request failure by reason.
    pub fn record_arbitration_failure(&self, reason: &str) {
        self.inner
            .arbitration_failures
            .with_label_values(&[reason])
            .inc();
    }

    /// Record bytes reclaimed, either "free" (idle capacity) or "used"
    /// (spilled operator state).
    pub fn record_reclaimed(&self, kind: &str, bytes: u64) {
        self.inner
            .reclaimed_bytes
            .with_label_values(&[kind])
            .inc_by(bytes as f64);
    }

    /// Record a task pause performed on behalf of a reclaim.
    pub fn record_task_pause(&self, pool: &str) {
        self.inner.task_pauses.with_label_values(&[pool]).inc();
    }

    /// Record an arbitrator-initiated abort of a victim query.
    pub fn record_query_abort(&self, pool: &str) {
        self.inner.query_aborts.with_label_values(&[pool]).inc();
    }

    /// Publish current free capacity for one arbitrator instance.
    pub fn set_free_capacity(&self, instance: &str, bytes: u64) {
        self.inner
            .free_capacity_bytes
            .with_label_values(&[instance])
            .set(bytes as f64);
    }

    /// Record rows/batches emitted by a merge operator.
    pub fn record_merge_output(&self, operator: &str, rows: u64, batches: u64) {
        self.inner
            .merge_rows_out
            .with_label_values(&[operator])
            .inc_by(rows as f64);
        self.inner
            .merge_batches_out
            .with_label_values(&[operator])
            .inc_by(batches as f64);
    }

    /// Record a merge wait on an upstream producer.
    pub fn record_merge_blocked(&self, operator: &str) {
        self.inner
            .merge_blocked_waits
            .with_label_values(&[operator])
            .inc();
    }

    /// Render all families in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let arbitration_requests = counter_vec(
            &registry,
            "meld_arbitration_requests_total",
            "Capacity growth requests by arbitration kind",
            &["kind"],
        );
        let arbitration_failures = counter_vec(
            &registry,
            "meld_arbitration_failures_total",
            "Failed capacity growth requests by reason",
            &["reason"],
        );
        let arbitration_wait_seconds = histogram_vec(
            &registry,
            "meld_arbitration_wait_seconds",
            "Time spent waiting for capacity",
            &["kind"],
        );
        let reclaimed_bytes = counter_vec(
            &registry,
            "meld_reclaimed_bytes_total",
            "Bytes reclaimed from participating pools",
            &["kind"],
        );
        let task_pauses = counter_vec(
            &registry,
            "meld_task_pauses_total",
            "Task pauses requested for reclaim",
            &["pool"],
        );
        let query_aborts = counter_vec(
            &registry,
            "meld_query_aborts_total",
            "Arbitrator-initiated query aborts",
            &["pool"],
        );
        let free_capacity_bytes = gauge_vec(
            &registry,
            "meld_free_capacity_bytes",
            "Unassigned arbitrator capacity",
            &["instance"],
        );
        let merge_rows_out = counter_vec(
            &registry,
            "meld_merge_rows_out_total",
            "Rows emitted by merge operators",
            &["operator"],
        );
        let merge_batches_out = counter_vec(
            &registry,
            "meld_merge_batches_out_total",
            "Batches emitted by merge operators",
            &["operator"],
        );
        let merge_blocked_waits = counter_vec(
            &registry,
            "meld_merge_blocked_waits_total",
            "Merge waits on upstream producers",
            &["operator"],
        );

        Self {
            registry,
            arbitration_requests,
            arbitration_failures,
            arbitration_wait_seconds,
            reclaimed_bytes,
            task_pauses,
            query_aborts,
            free_capacity_bytes,
            merge_rows_out,
            merge_batches_out,
            merge_blocked_waits,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry used when no explicit registry is wired.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_local_arbitration();
        m.record_merge_output("LocalMerge", 100, 2);
        let text = m.render_prometheus();
        assert!(text.contains("meld_arbitration_requests_total"));
        assert!(text.contains("LocalMerge"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_local_arbitration();
        m.record_global_arbitration(0.02);
        m.record_arbitration_failure("timeout");
        m.record_reclaimed("free", 1024);
        m.record_reclaimed("used", 4096);
        m.record_task_pause("query-1");
        m.record_query_abort("query-2");
        m.set_free_capacity("default", 1 << 20);
        m.record_merge_output("MergeExchange", 10, 1);
        m.record_merge_blocked("MergeExchange");
        let text = m.render_prometheus();

        assert!(text.contains("meld_arbitration_requests_total"));
        assert!(text.contains("meld_arbitration_failures_total"));
        assert!(text.contains("meld_arbitration_wait_seconds"));
        assert!(text.contains("meld_reclaimed_bytes_total"));
        assert!(text.contains("meld_task_pauses_total"));
        assert!(text.contains("meld_query_aborts_total"));
        assert!(text.contains("meld_free_capacity_bytes"));
        assert!(text.contains("meld_merge_rows_out_total"));
        assert!(text.contains("meld_merge_batches_out_total"));
        assert!(text.contains("meld_merge_blocked_waits_total"));
    }
}
