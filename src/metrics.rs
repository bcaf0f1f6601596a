use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-buffer metrics for observability and testing
///
/// Each stream buffer instance has its own set of metrics, so multiple
/// buffers in one process stay independent and tests can validate counts
/// in isolation.
pub struct BufferMetrics {
    // Allocation path
    pub segment_request: Counter,
    pub segment_request_retry: Counter,

    // Standby cache
    pub standby_hit: Counter,
    pub standby_insert: Counter,
    pub standby_evict: Counter,
    pub standby_duplicate: Counter,
    pub standby_flush: Counter,

    // Writer close path
    pub segment_submit: Counter,
    pub segment_submit_empty: Counter,

    // Release paths
    pub segment_free: Counter,
    pub segment_purge: Counter,

    // Failures
    pub cookie_failure: Counter,
    pub encode_failure: Counter,
    pub decode_failure: Counter,

    // Current state gauges
    pub segments_free: Gauge,
    pub segments_standby: Gauge,
}

impl BufferMetrics {
    pub fn new() -> Self {
        Self {
            segment_request: Counter::new(),
            segment_request_retry: Counter::new(),
            standby_hit: Counter::new(),
            standby_insert: Counter::new(),
            standby_evict: Counter::new(),
            standby_duplicate: Counter::new(),
            standby_flush: Counter::new(),
            segment_submit: Counter::new(),
            segment_submit_empty: Counter::new(),
            segment_free: Counter::new(),
            segment_purge: Counter::new(),
            cookie_failure: Counter::new(),
            encode_failure: Counter::new(),
            decode_failure: Counter::new(),
            segments_free: Gauge::new(),
            segments_standby: Gauge::new(),
        }
    }
}

impl Default for BufferMetrics {
    fn default() -> Self {
        Self::new()
    }
}
