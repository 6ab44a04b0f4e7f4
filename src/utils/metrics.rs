use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Counters for one scheduler or fetcher process
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Tasks materialized from rules
    pub rules_imported: usize,

    /// Rules moved to ADDED
    pub rules_marked: usize,

    /// Dispatch cycles run
    pub dispatch_cycles: usize,

    /// Tasks assigned to a fetcher batch
    pub tasks_dispatched: usize,

    /// Dispatched tasks the fetchers confirmed
    pub tasks_admitted: usize,

    /// Pushes that failed outright
    pub push_failures: usize,

    /// Completion reports applied
    pub reports_applied: usize,

    /// Completion reports refused (bad input or write failure)
    pub reports_rejected: usize,

    /// Packs accepted by the intake endpoint
    pub intake_accepted: usize,

    /// Packs dropped by the intake endpoint
    pub intake_rejected: usize,

    /// Packs waiting in the intake queue
    pub queue_depth: usize,

    /// Successful page fetches
    pub pages_fetched: usize,

    /// Failed page fetches
    pub fetch_failures: usize,

    /// Fetched pages that could not be stored
    pub store_failures: usize,

    /// Completion reports that did not reach the scheduler
    pub report_failures: usize,

    /// Total time spent fetching, in milliseconds
    pub fetch_time_ms: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            rules_imported: 0,
            rules_marked: 0,
            dispatch_cycles: 0,
            tasks_dispatched: 0,
            tasks_admitted: 0,
            push_failures: 0,
            reports_applied: 0,
            reports_rejected: 0,
            intake_accepted: 0,
            intake_rejected: 0,
            queue_depth: 0,
            pages_fetched: 0,
            fetch_failures: 0,
            store_failures: 0,
            report_failures: 0,
            fetch_time_ms: 0,
        }
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    /// Record one rule-import cycle
    pub async fn record_import(&self, imported: usize, marked: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.rules_imported += imported;
        metrics.rules_marked += marked;
    }

    /// Record one dispatch cycle
    pub async fn record_dispatch(&self, dispatched: usize, admitted: usize, push_failures: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.dispatch_cycles += 1;
        metrics.tasks_dispatched += dispatched;
        metrics.tasks_admitted += admitted;
        metrics.push_failures += push_failures;
    }

    /// Record a completion report
    pub async fn record_report(&self, applied: bool) {
        let mut metrics = self.metrics.lock().await;
        if applied {
            metrics.reports_applied += 1;
        } else {
            metrics.reports_rejected += 1;
        }
    }

    /// Record one intake call and the queue depth after it
    pub async fn record_intake(&self, accepted: usize, rejected: usize, queue_depth: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.intake_accepted += accepted;
        metrics.intake_rejected += rejected;
        metrics.queue_depth = queue_depth;
    }

    /// Update the observed queue depth
    pub async fn set_queue_depth(&self, queue_depth: usize) {
        self.metrics.lock().await.queue_depth = queue_depth;
    }

    /// Record a page fetch
    pub async fn record_fetch(&self, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        if success {
            metrics.pages_fetched += 1;
        } else {
            metrics.fetch_failures += 1;
        }
        metrics.fetch_time_ms += duration_ms;
    }

    pub async fn record_store_failure(&self) {
        self.metrics.lock().await.store_failures += 1;
    }

    pub async fn record_report_failure(&self) {
        self.metrics.lock().await.report_failures += 1;
    }

    /// Start timing a request
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    /// Start time of the request
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let collector = MetricsCollector::new();

        collector.record_dispatch(5, 3, 1).await;
        collector.record_dispatch(2, 2, 0).await;
        collector.record_report(true).await;
        collector.record_report(false).await;
        collector.record_intake(3, 2, 7).await;
        collector.record_fetch(true, 120).await;
        collector.record_fetch(false, 30).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.dispatch_cycles, 2);
        assert_eq!(metrics.tasks_dispatched, 7);
        assert_eq!(metrics.tasks_admitted, 5);
        assert_eq!(metrics.push_failures, 1);
        assert_eq!(metrics.reports_applied, 1);
        assert_eq!(metrics.reports_rejected, 1);
        assert_eq!(metrics.queue_depth, 7);
        assert_eq!(metrics.pages_fetched, 1);
        assert_eq!(metrics.fetch_failures, 1);
        assert_eq!(metrics.fetch_time_ms, 150);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let collector = MetricsCollector::new();
        let clone = collector.clone();

        clone.record_store_failure().await;
        collector.set_queue_depth(4).await;

        let metrics = clone.get_metrics().await;
        assert_eq!(metrics.store_failures, 1);
        assert_eq!(metrics.queue_depth, 4);
    }
}
