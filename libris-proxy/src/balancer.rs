//! Backend registry and round-robin selection.
//!
//! Health is a small hysteresis machine: two consecutive probe successes
//! mark a backend healthy, two consecutive failures (or one failed
//! forward) mark it unhealthy. Backends start unhealthy until proven,
//! so the proxy never routes to an instance that has not answered a
//! probe yet.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Consecutive probe successes required to mark a backend healthy.
const HEALTHY_AFTER: u32 = 2;
/// Consecutive probe failures required to mark a backend unhealthy.
const UNHEALTHY_AFTER: u32 = 2;

#[derive(Debug)]
struct ProbeState {
    healthy: bool,
    consecutive_up: u32,
    consecutive_down: u32,
}

/// One API instance addressable by the proxy.
pub struct Backend {
    pub url: String,
    state: Mutex<ProbeState>,
    forwarded: AtomicU64,
    errors: AtomicU64,
}

/// Per-backend counters exposed under `/proxy/stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendStats {
    pub url: String,
    pub healthy: bool,
    pub forwarded: u64,
    pub errors: u64,
}

impl Backend {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        Self {
            url,
            state: Mutex::new(ProbeState {
                healthy: false,
                consecutive_up: 0,
                consecutive_down: 0,
            }),
            forwarded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().unwrap().healthy
    }

    /// Record a successful probe. Returns the new state when it flipped.
    pub fn record_probe_success(&self) -> Option<bool> {
        let mut state = self.state.lock().unwrap();
        state.consecutive_down = 0;
        state.consecutive_up = state.consecutive_up.saturating_add(1);
        if !state.healthy && state.consecutive_up >= HEALTHY_AFTER {
            state.healthy = true;
            return Some(true);
        }
        None
    }

    /// Record a failed probe. Returns the new state when it flipped.
    pub fn record_probe_failure(&self) -> Option<bool> {
        let mut state = self.state.lock().unwrap();
        state.consecutive_up = 0;
        state.consecutive_down = state.consecutive_down.saturating_add(1);
        if state.healthy && state.consecutive_down >= UNHEALTHY_AFTER {
            state.healthy = false;
            return Some(false);
        }
        None
    }

    /// A forward attempt could not reach the backend: take it out of
    /// rotation immediately rather than waiting for the prober.
    pub fn mark_unreachable(&self) {
        let mut state = self.state.lock().unwrap();
        state.healthy = false;
        state.consecutive_up = 0;
        state.consecutive_down = UNHEALTHY_AFTER;
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            url: self.url.clone(),
            healthy: self.is_healthy(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// All configured backends plus the round-robin cursor.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    next: AtomicUsize,
}

impl BackendPool {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            backends: urls.into_iter().map(|url| Arc::new(Backend::new(url))).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Next healthy backend in round-robin order. The cursor advances
    /// once per scanned slot, so two healthy backends split traffic
    /// within one request of each other.
    pub fn pick(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % len;
            let backend = &self.backends[index];
            if backend.is_healthy() {
                return Some(Arc::clone(backend));
            }
        }
        None
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy()).count()
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        self.backends.iter().map(|b| b.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(urls: &[&str]) -> BackendPool {
        BackendPool::new(urls.iter().map(|u| u.to_string()))
    }

    fn force_healthy(backend: &Backend) {
        backend.record_probe_success();
        backend.record_probe_success();
    }

    #[test]
    fn backends_start_unhealthy() {
        let pool = pool(&["http://127.0.0.1:8080", "http://127.0.0.1:8081"]);
        assert_eq!(pool.healthy_count(), 0);
        assert!(pool.pick().is_none());
    }

    #[test]
    fn two_successes_required_to_become_healthy() {
        let backend = Backend::new("http://127.0.0.1:8080");
        assert!(backend.record_probe_success().is_none());
        assert!(!backend.is_healthy());
        assert_eq!(backend.record_probe_success(), Some(true));
        assert!(backend.is_healthy());
        // Further successes do not re-flip.
        assert!(backend.record_probe_success().is_none());
    }

    #[test]
    fn two_failures_required_to_become_unhealthy() {
        let backend = Backend::new("http://127.0.0.1:8080");
        force_healthy(&backend);

        assert!(backend.record_probe_failure().is_none());
        assert!(backend.is_healthy());
        assert_eq!(backend.record_probe_failure(), Some(false));
        assert!(!backend.is_healthy());
    }

    #[test]
    fn one_failure_between_successes_does_not_flip() {
        let backend = Backend::new("http://127.0.0.1:8080");
        force_healthy(&backend);

        backend.record_probe_failure();
        backend.record_probe_success();
        backend.record_probe_failure();
        assert!(backend.is_healthy());
    }

    #[test]
    fn round_robin_alternates_between_healthy_backends() {
        let pool = pool(&["http://a", "http://b"]);
        for backend in pool.backends() {
            force_healthy(backend);
        }

        let mut counts = std::collections::HashMap::new();
        for _ in 0..10 {
            let backend = pool.pick().unwrap();
            *counts.entry(backend.url.clone()).or_insert(0u32) += 1;
        }
        assert_eq!(counts["http://a"], 5);
        assert_eq!(counts["http://b"], 5);
    }

    #[test]
    fn unhealthy_backend_is_skipped() {
        let pool = pool(&["http://a", "http://b"]);
        for backend in pool.backends() {
            force_healthy(backend);
        }
        pool.backends()[0].mark_unreachable();

        for _ in 0..6 {
            assert_eq!(pool.pick().unwrap().url, "http://b");
        }
    }

    #[test]
    fn mark_unreachable_requires_two_probes_to_recover() {
        let backend = Backend::new("http://a");
        force_healthy(&backend);
        backend.mark_unreachable();
        assert!(!backend.is_healthy());

        assert!(backend.record_probe_success().is_none());
        assert_eq!(backend.record_probe_success(), Some(true));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let backend = Backend::new("http://127.0.0.1:8080/");
        assert_eq!(backend.url, "http://127.0.0.1:8080");
    }
}
