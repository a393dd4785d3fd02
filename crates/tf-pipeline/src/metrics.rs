use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_gauge(&self, name: &str, value: f64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// In-memory metrics collector with atomic counters.
/// Thread-safe for concurrent pipeline operations.
pub struct PipelineMetrics {
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_aborted: AtomicU64,
    pub no_progress_stops: AtomicU64,
    pub llm_exhausted_count: AtomicU64,
    pub total_iterations: AtomicU64,
    pub mutation_runs_skipped: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("runs_started", &self.runs_started)
            .field("runs_completed", &self.runs_completed)
            .field("runs_aborted", &self.runs_aborted)
            .field("no_progress_stops", &self.no_progress_stops)
            .field("llm_exhausted_count", &self.llm_exhausted_count)
            .field("total_iterations", &self.total_iterations)
            .field("mutation_runs_skipped", &self.mutation_runs_skipped)
            .finish()
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_aborted: AtomicU64::new(0),
            no_progress_stops: AtomicU64::new(0),
            llm_exhausted_count: AtomicU64::new(0),
            total_iterations: AtomicU64::new(0),
            mutation_runs_skipped: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    pub fn record_run_started(&self) {
        let val = self.runs_started.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("tf.pipeline.runs_started", val);
        }
    }

    pub fn record_run_completed(&self, iterations: u32) {
        let val = self.runs_completed.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_iterations
            .fetch_add(u64::from(iterations), Ordering::Relaxed);
        if let Some(backend) = &self.backend {
            backend.record_counter("tf.pipeline.runs_completed", val);
            backend.record_histogram("tf.pipeline.iterations", f64::from(iterations));
        }
    }

    pub fn record_run_aborted(&self) {
        let val = self.runs_aborted.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("tf.pipeline.runs_aborted", val);
        }
    }

    pub fn record_no_progress_stop(&self) {
        let val = self.no_progress_stops.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("tf.pipeline.no_progress_stops", val);
        }
    }

    pub fn record_llm_exhausted(&self) {
        let val = self.llm_exhausted_count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("tf.pipeline.llm_exhausted", val);
        }
    }

    pub fn record_mutation_skipped(&self) {
        let val = self.mutation_runs_skipped.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("tf.pipeline.mutation_runs_skipped", val);
        }
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_aborted: self.runs_aborted.load(Ordering::Relaxed),
            no_progress_stops: self.no_progress_stops.load(Ordering::Relaxed),
            llm_exhausted_count: self.llm_exhausted_count.load(Ordering::Relaxed),
            total_iterations: self.total_iterations.load(Ordering::Relaxed),
            mutation_runs_skipped: self.mutation_runs_skipped.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of pipeline metrics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_aborted: u64,
    pub no_progress_stops: u64,
    pub llm_exhausted_count: u64,
    pub total_iterations: u64,
    pub mutation_runs_skipped: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_gauge(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "gauge", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "histogram", "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_start_at_zero() {
        let metrics = PipelineMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.runs_started, 0);
        assert_eq!(snap.runs_completed, 0);
        assert_eq!(snap.runs_aborted, 0);
    }

    #[test]
    fn counters_increment_correctly() {
        let metrics = PipelineMetrics::new();
        metrics.record_run_started();
        metrics.record_run_started();
        metrics.record_run_completed(3);
        metrics.record_run_aborted();
        metrics.record_no_progress_stop();

        let snap = metrics.snapshot();
        assert_eq!(snap.runs_started, 2);
        assert_eq!(snap.runs_completed, 1);
        assert_eq!(snap.runs_aborted, 1);
        assert_eq!(snap.no_progress_stops, 1);
        assert_eq!(snap.total_iterations, 3);
    }

    #[test]
    fn llm_exhausted_counter() {
        let metrics = PipelineMetrics::new();
        metrics.record_llm_exhausted();
        metrics.record_llm_exhausted();
        assert_eq!(metrics.snapshot().llm_exhausted_count, 2);
    }

    #[test]
    fn with_logging_backend() {
        let backend = Arc::new(LoggingMetricsBackend);
        let metrics = PipelineMetrics::with_backend(backend);
        metrics.record_run_started();
        assert_eq!(metrics.snapshot().runs_started, 1);
    }

    #[test]
    fn mutation_skipped_counter() {
        let metrics = PipelineMetrics::new();
        metrics.record_mutation_skipped();
        assert_eq!(metrics.snapshot().mutation_runs_skipped, 1);
    }

    #[test]
    fn concurrent_increments() {
        let metrics = Arc::new(PipelineMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.record_run_started();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.snapshot().runs_started, 1000);
    }
}
