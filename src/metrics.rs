//! Lightweight in-memory metrics for queries and model RPC.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct Counters {
    queries_total: AtomicU64,
    queries_failed: AtomicU64,
    query_timeouts: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
    rpc_attempts: AtomicU64,
    rpc_failed_attempts: AtomicU64,
    rpc_invocations: AtomicU64,
    rpc_timeouts: AtomicU64,
}

static COUNTERS: OnceLock<Counters> = OnceLock::new();

fn counters() -> &'static Counters {
    COUNTERS.get_or_init(Counters::default)
}

pub fn record_query(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let counters = counters();
    counters.queries_total.fetch_add(1, Ordering::Relaxed);
    if !success {
        counters.queries_failed.fetch_add(1, Ordering::Relaxed);
    }
    counters
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);

    let mut current = counters.duration_max_ms.load(Ordering::Relaxed);
    while duration_ms > current {
        match counters.duration_max_ms.compare_exchange(
            current,
            duration_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

pub fn record_query_timeout() {
    counters().query_timeouts.fetch_add(1, Ordering::Relaxed);
}

/// One liveness attempt while establishing a model RPC connection.
pub fn record_rpc_attempt(success: bool) {
    let counters = counters();
    counters.rpc_attempts.fetch_add(1, Ordering::Relaxed);
    if !success {
        counters.rpc_failed_attempts.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_rpc_invocation() {
    counters().rpc_invocations.fetch_add(1, Ordering::Relaxed);
}

pub fn record_rpc_timeout() {
    counters().rpc_timeouts.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub queries_failed: u64,
    pub query_timeouts: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
    pub rpc_attempts: u64,
    pub rpc_failed_attempts: u64,
    pub rpc_invocations: u64,
    pub rpc_timeouts: u64,
}

pub fn snapshot() -> MetricsSnapshot {
    let counters = counters();
    let total = counters.queries_total.load(Ordering::Relaxed);
    let duration_total = counters.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = counters.duration_max_ms.load(Ordering::Relaxed);

    let avg_ms = if total > 0 {
        Some(duration_total as f64 / total as f64)
    } else {
        None
    };

    MetricsSnapshot {
        queries_total: total,
        queries_failed: counters.queries_failed.load(Ordering::Relaxed),
        query_timeouts: counters.query_timeouts.load(Ordering::Relaxed),
        avg_ms,
        max_ms: if max_ms > 0 { Some(max_ms) } else { None },
        rpc_attempts: counters.rpc_attempts.load(Ordering::Relaxed),
        rpc_failed_attempts: counters.rpc_failed_attempts.load(Ordering::Relaxed),
        rpc_invocations: counters.rpc_invocations.load(Ordering::Relaxed),
        rpc_timeouts: counters.rpc_timeouts.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_counters_move_by_deltas() {
        // other tests record concurrently, so compare deltas
        let initial = snapshot();

        record_query(100.0, true);
        let s1 = snapshot();
        assert!(s1.queries_total >= initial.queries_total + 1);

        record_query(50.0, false);
        let s2 = snapshot();
        assert!(s2.queries_failed >= initial.queries_failed + 1);

        record_query_timeout();
        assert!(snapshot().query_timeouts >= initial.query_timeouts + 1);

        record_query(99999.0, true);
        assert!(snapshot().max_ms.unwrap() >= 99999);
    }

    #[test]
    fn rpc_counters_move_by_deltas() {
        let initial = snapshot();
        record_rpc_attempt(false);
        record_rpc_attempt(true);
        record_rpc_invocation();
        record_rpc_timeout();

        let after = snapshot();
        assert!(after.rpc_attempts >= initial.rpc_attempts + 2);
        assert!(after.rpc_failed_attempts >= initial.rpc_failed_attempts + 1);
        assert!(after.rpc_invocations >= initial.rpc_invocations + 1);
        assert!(after.rpc_timeouts >= initial.rpc_timeouts + 1);
    }
}
