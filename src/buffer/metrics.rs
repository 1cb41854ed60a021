use prometheus::{Histogram, HistogramOpts, HistogramTimer, IntCounterVec, Opts, Registry};

/// Drop reason label values reported through [`BufferMetrics::inc_drops`].
pub const DROP_REASON_AGE: &str = "age_expired";
pub const DROP_REASON_HEAP: &str = "heap_limit_exceeded";

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Latency histograms and the drop counter for one buffer instance.
///
/// Metrics are created unregistered; callers expose them by registering into
/// their own `prometheus::Registry`. There is no default-registry fallback.
#[derive(Clone)]
pub struct BufferMetrics {
    insert_duration: Histogram,
    get_duration: Histogram,
    drain_duration: Histogram,
    drop_count: IntCounterVec,
}

impl BufferMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let histogram = |name: &str, help: &str| {
            Histogram::with_opts(HistogramOpts::new(name, help).buckets(DURATION_BUCKETS.to_vec()))
        };

        Ok(Self {
            insert_duration: histogram(
                "agent_buffer_insert_duration_seconds",
                "Histogram of buffer insert() duration in seconds",
            )?,
            get_duration: histogram(
                "agent_buffer_get_duration_seconds",
                "Histogram of buffer get() duration in seconds",
            )?,
            drain_duration: histogram(
                "agent_buffer_drain_duration_seconds",
                "Histogram of buffer drain() duration in seconds",
            )?,
            drop_count: IntCounterVec::new(
                Opts::new(
                    "agent_metrics_drop_total_count",
                    "The total number of metrics dropped",
                ),
                &["reason"],
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.insert_duration.clone()))?;
        registry.register(Box::new(self.get_duration.clone()))?;
        registry.register(Box::new(self.drain_duration.clone()))?;
        registry.register(Box::new(self.drop_count.clone()))?;
        Ok(())
    }

    pub(crate) fn insert_timer(&self) -> HistogramTimer {
        self.insert_duration.start_timer()
    }

    pub(crate) fn get_timer(&self) -> HistogramTimer {
        self.get_duration.start_timer()
    }

    pub(crate) fn drain_timer(&self) -> HistogramTimer {
        self.drain_duration.start_timer()
    }

    pub(crate) fn inc_drops(&self, reason: &str, count: u64) {
        self.drop_count.with_label_values(&[reason]).inc_by(count);
    }

    /// Current drop count for a reason label. Mainly for tests and health
    /// reporting; external observers scrape the registry instead.
    pub fn dropped(&self, reason: &str) -> u64 {
        self.drop_count.with_label_values(&[reason]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_collectors() {
        let metrics = BufferMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        metrics.inc_drops(DROP_REASON_AGE, 3);
        drop(metrics.insert_timer());

        let encoded = prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(encoded.contains("agent_buffer_insert_duration_seconds"));
        assert!(encoded.contains("agent_buffer_get_duration_seconds"));
        assert!(encoded.contains("agent_buffer_drain_duration_seconds"));
        assert!(encoded.contains("agent_metrics_drop_total_count"));
    }

    #[test]
    fn drop_counter_is_labeled_by_reason() {
        let metrics = BufferMetrics::new().unwrap();
        metrics.inc_drops(DROP_REASON_AGE, 2);
        metrics.inc_drops(DROP_REASON_HEAP, 5);

        assert_eq!(metrics.dropped(DROP_REASON_AGE), 2);
        assert_eq!(metrics.dropped(DROP_REASON_HEAP), 5);
    }
}
