/// Counter and timer emission.
///
/// The proxy reports operational metrics through this seam; deployments
/// plug in their own sink, tests read back the in-memory one. Emitters
/// must be safe for concurrent use from every serve task.
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A counter/timer sink.
pub trait Stats: Send + Sync {
    /// Add `delta` to the named counter.
    fn bump(&self, name: &str, delta: u64);

    /// Record one observation of the named timer.
    fn record(&self, name: &str, elapsed: Duration);
}

/// Start a timer against `stats`. The observation is emitted only when
/// [`Timer::stop`] is called; abandoning the timer on an error path
/// records nothing.
pub fn start_timer(stats: &Arc<dyn Stats>, name: &'static str) -> Timer {
    Timer {
        stats: Arc::clone(stats),
        name,
        start: Instant::now(),
    }
}

/// An in-flight timer observation.
pub struct Timer {
    stats: Arc<dyn Stats>,
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn stop(self) {
        self.stats.record(self.name, self.start.elapsed());
    }
}

/// Discards everything. The default sink.
pub struct NoopStats;

impl Stats for NoopStats {
    fn bump(&self, _name: &str, _delta: u64) {}
    fn record(&self, _name: &str, _elapsed: Duration) {}
}

/// Prepends a fixed prefix to every metric name before delegating.
pub struct PrefixedStats {
    prefix: String,
    inner: Arc<dyn Stats>,
}

impl PrefixedStats {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Stats>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl Stats for PrefixedStats {
    fn bump(&self, name: &str, delta: u64) {
        self.inner.bump(&format!("{}{}", self.prefix, name), delta);
    }

    fn record(&self, name: &str, elapsed: Duration) {
        self.inner
            .record(&format!("{}{}", self.prefix, name), elapsed);
    }
}

/// Accumulates counters and timings in memory. Used by the test suite and
/// handy for scraping from an embedding process.
#[derive(Default)]
pub struct MemoryStats {
    counters: Mutex<FnvHashMap<String, u64>>,
    timings: Mutex<FnvHashMap<String, Vec<Duration>>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never bumped.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Number of observations recorded for a timer.
    pub fn timing_count(&self, name: &str) -> usize {
        self.timings
            .lock()
            .unwrap()
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Stats for MemoryStats {
    fn bump(&self, name: &str, delta: u64) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += delta;
    }

    fn record(&self, name: &str, elapsed: Duration) {
        self.timings
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(elapsed);
    }
}
