//! Global atomic counters for berth.
//!
//! Counters are bumped at the call site and emitted together by
//! [`Metrics::flush`], typically once at the end of a CLI command.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    stages_built: AtomicU64,
    stages_cached: AtomicU64,
    stages_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    services_ready: AtomicU64,
    services_failed: AtomicU64,
    probe_attempts: AtomicU64,
    artifacts_pushed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, metric: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric, "counter incremented");
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            stages_built: AtomicU64::new(0),
            stages_cached: AtomicU64::new(0),
            stages_failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            services_ready: AtomicU64::new(0),
            services_failed: AtomicU64::new(0),
            probe_attempts: AtomicU64::new(0),
            artifacts_pushed: AtomicU64::new(0),
        }
    }

    pub fn inc_stages_built(&self) {
        bump(&self.stages_built, "stages_built");
    }

    pub fn inc_stages_cached(&self) {
        bump(&self.stages_cached, "stages_cached");
    }

    /// Failed or cancelled stages.
    pub fn inc_stages_failed(&self) {
        bump(&self.stages_failed, "stages_failed");
    }

    pub fn inc_cache_hits(&self) {
        bump(&self.cache_hits, "cache_hits");
    }

    pub fn inc_cache_misses(&self) {
        bump(&self.cache_misses, "cache_misses");
    }

    pub fn inc_services_ready(&self) {
        bump(&self.services_ready, "services_ready");
    }

    pub fn inc_services_failed(&self) {
        bump(&self.services_failed, "services_failed");
    }

    pub fn inc_probe_attempts(&self) {
        bump(&self.probe_attempts, "probe_attempts");
    }

    pub fn inc_artifacts_pushed(&self) {
        bump(&self.artifacts_pushed, "artifacts_pushed");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            stages_built = self.stages_built(),
            stages_cached = self.stages_cached(),
            stages_failed = self.stages_failed(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            services_ready = self.services_ready(),
            services_failed = self.services_failed(),
            probe_attempts = self.probe_attempts(),
            artifacts_pushed = self.artifacts_pushed(),
        );
    }

    pub fn stages_built(&self) -> u64 {
        self.stages_built.load(Ordering::Relaxed)
    }

    pub fn stages_cached(&self) -> u64 {
        self.stages_cached.load(Ordering::Relaxed)
    }

    pub fn stages_failed(&self) -> u64 {
        self.stages_failed.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn services_ready(&self) -> u64 {
        self.services_ready.load(Ordering::Relaxed)
    }

    pub fn services_failed(&self) -> u64 {
        self.services_failed.load(Ordering::Relaxed)
    }

    pub fn probe_attempts(&self) -> u64 {
        self.probe_attempts.load(Ordering::Relaxed)
    }

    pub fn artifacts_pushed(&self) -> u64 {
        self.artifacts_pushed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.stages_built,
            &self.stages_cached,
            &self.stages_failed,
            &self.cache_hits,
            &self.cache_misses,
            &self.services_ready,
            &self.services_failed,
            &self.probe_attempts,
            &self.artifacts_pushed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_stages_built();
        m.inc_stages_built();
        m.inc_stages_cached();
        m.inc_probe_attempts();
        m.inc_cache_misses();
        assert_eq!(m.stages_built(), 2);
        assert_eq!(m.stages_cached(), 1);
        assert_eq!(m.probe_attempts(), 1);
        assert_eq!(m.cache_misses(), 1);
        assert_eq!(m.cache_hits(), 0);
        assert_eq!(m.services_ready(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_stages_failed();
        m.inc_services_failed();
        m.inc_artifacts_pushed();
        m.reset();
        assert_eq!(m.stages_failed(), 0);
        assert_eq!(m.services_failed(), 0);
        assert_eq!(m.artifacts_pushed(), 0);
    }
}
