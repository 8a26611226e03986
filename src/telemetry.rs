//! Per-thread operation counters and latency histograms.
//!
//! Counters are sharded per registered thread and written with relaxed
//! atomics on the hot path; aggregation only happens when a report is
//! asked for. Latency histograms (100 ns buckets) are allocated lazily per
//! (thread, coroutine) the first time that coroutine records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use log::info;

use crate::config::{LATENCY_WINDOWS, MAX_APP_THREAD, MAX_CORO_NUM};
use crate::node::MAX_NODE_TYPE_NUM;

/// Why a traversal step had to retry. `FirstTry` counts loop entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RetryReason {
    FirstTry = 0,
    CasNull,
    InvalidLeaf,
    CasLeaf,
    InvalidNode,
    SplitHeader,
    FindNext,
    CasEmpty,
    InsertBehindEmpty,
    InsertBehindTryNext,
    SwitchRetry,
    SwitchFindTarget,
}

pub const MAX_RETRY_REASON: usize = 12;

/// Hot-path counters of one client thread.
#[derive(Default)]
pub struct ThreadCounters {
    /// Cache hit/miss ratios accumulated in millionths per operation.
    pub cache_hit_micros: AtomicU64,
    pub cache_miss_micros: AtomicU64,
    pub lock_fail: AtomicU64,
    pub try_write_op: AtomicU64,
    pub write_handover_num: AtomicU64,
    pub try_read_op: AtomicU64,
    pub read_handover_num: AtomicU64,
    pub try_read_leaf: AtomicU64,
    pub read_leaf_retry: AtomicU64,
    pub leaf_cache_invalid: AtomicU64,
    pub try_read_node: AtomicU64,
    pub read_node_repair: AtomicU64,
    pub read_node_type: [AtomicU64; MAX_NODE_TYPE_NUM],
    pub retry_cnt: [AtomicU64; MAX_RETRY_REASON],
}

impl ThreadCounters {
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self, reason: RetryReason) {
        self.retry_cnt[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_access(&self, hit: f64) {
        self.cache_hit_micros
            .fetch_add((hit * 1e6) as u64, Ordering::Relaxed);
        self.cache_miss_micros
            .fetch_add(((1.0 - hit) * 1e6) as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.cache_hit_micros.store(0, Ordering::Relaxed);
        self.cache_miss_micros.store(0, Ordering::Relaxed);
        self.lock_fail.store(0, Ordering::Relaxed);
        self.try_write_op.store(0, Ordering::Relaxed);
        self.write_handover_num.store(0, Ordering::Relaxed);
        self.try_read_op.store(0, Ordering::Relaxed);
        self.read_handover_num.store(0, Ordering::Relaxed);
        self.try_read_leaf.store(0, Ordering::Relaxed);
        self.read_leaf_retry.store(0, Ordering::Relaxed);
        self.leaf_cache_invalid.store(0, Ordering::Relaxed);
        self.try_read_node.store(0, Ordering::Relaxed);
        self.read_node_repair.store(0, Ordering::Relaxed);
        for c in &self.read_node_type {
            c.store(0, Ordering::Relaxed);
        }
        for c in &self.retry_cnt {
            c.store(0, Ordering::Relaxed);
        }
    }
}

type Histogram = Box<[AtomicU64]>;

/// Process-wide telemetry, owned by the tree handle.
pub struct Telemetry {
    threads: Box<[ThreadCounters]>,
    latency: Box<[OnceLock<Histogram>]>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            threads: (0..MAX_APP_THREAD).map(|_| ThreadCounters::default()).collect(),
            latency: (0..MAX_APP_THREAD * MAX_CORO_NUM)
                .map(|_| OnceLock::new())
                .collect(),
        }
    }

    pub fn thread(&self, tid: u16) -> &ThreadCounters {
        &self.threads[tid as usize % self.threads.len()]
    }

    pub fn record_latency(&self, tid: u16, coro_id: u16, elapsed: Duration) {
        let slot = tid as usize % MAX_APP_THREAD * MAX_CORO_NUM + coro_id as usize % MAX_CORO_NUM;
        let hist = self.latency[slot].get_or_init(|| {
            (0..LATENCY_WINDOWS).map(|_| AtomicU64::new(0)).collect()
        });
        let bucket = ((elapsed.as_nanos() / 100) as usize).min(LATENCY_WINDOWS - 1);
        hist[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter and every allocated histogram.
    pub fn reset(&self) {
        for t in self.threads.iter() {
            t.reset();
        }
        for slot in self.latency.iter() {
            if let Some(hist) = slot.get() {
                for b in hist.iter() {
                    b.store(0, Ordering::Relaxed);
                }
            }
        }
    }

    fn sum(&self, f: impl Fn(&ThreadCounters) -> &AtomicU64) -> u64 {
        self.threads.iter().map(|t| f(t).load(Ordering::Relaxed)).sum()
    }

    fn latency_percentile(&self, q: f64) -> Option<Duration> {
        let hists: Vec<&Histogram> = self.latency.iter().filter_map(|s| s.get()).collect();
        let total: u64 = hists
            .iter()
            .map(|h| h.iter().map(|b| b.load(Ordering::Relaxed)).sum::<u64>())
            .sum();
        if total == 0 {
            return None;
        }
        let target = (total as f64 * q).ceil() as u64;
        let mut seen = 0u64;
        for bucket in 0..LATENCY_WINDOWS {
            for h in &hists {
                seen += h[bucket].load(Ordering::Relaxed);
            }
            if seen >= target {
                return Some(Duration::from_nanos(bucket as u64 * 100));
            }
        }
        None
    }

    /// Aggregate view over all threads.
    pub fn summary(&self) -> TreeStats {
        let hits = self.sum(|t| &t.cache_hit_micros);
        let misses = self.sum(|t| &t.cache_miss_micros);
        let mut retry_cnt = [0u64; MAX_RETRY_REASON];
        for (i, slot) in retry_cnt.iter_mut().enumerate() {
            *slot = self.sum(|t| &t.retry_cnt[i]);
        }
        TreeStats {
            cache_hit_ratio: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            lock_fail: self.sum(|t| &t.lock_fail),
            try_write_op: self.sum(|t| &t.try_write_op),
            write_handover_num: self.sum(|t| &t.write_handover_num),
            try_read_op: self.sum(|t| &t.try_read_op),
            read_handover_num: self.sum(|t| &t.read_handover_num),
            try_read_leaf: self.sum(|t| &t.try_read_leaf),
            read_leaf_retry: self.sum(|t| &t.read_leaf_retry),
            leaf_cache_invalid: self.sum(|t| &t.leaf_cache_invalid),
            try_read_node: self.sum(|t| &t.try_read_node),
            read_node_repair: self.sum(|t| &t.read_node_repair),
            retry_cnt,
            latency_p50: self.latency_percentile(0.50),
            latency_p99: self.latency_percentile(0.99),
            latency_p999: self.latency_percentile(0.999),
        }
    }

    pub fn log_report(&self) {
        let s = self.summary();
        info!(
            "cache_hit={:.3} lock_fail={} write({} ops, {} handed over) read({} ops, {} handed over)",
            s.cache_hit_ratio,
            s.lock_fail,
            s.try_write_op,
            s.write_handover_num,
            s.try_read_op,
            s.read_handover_num,
        );
        info!(
            "leaf reads={} retries={} cache_invalid={} node reads={} repairs={}",
            s.try_read_leaf, s.read_leaf_retry, s.leaf_cache_invalid, s.try_read_node,
            s.read_node_repair,
        );
        if let (Some(p50), Some(p99)) = (s.latency_p50, s.latency_p99) {
            info!("latency p50={:?} p99={:?} p999={:?}", p50, p99, s.latency_p999);
        }
    }
}

/// Aggregated statistics returned by `Tree::statistics`.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeStats {
    pub cache_hit_ratio: f64,
    pub lock_fail: u64,
    pub try_write_op: u64,
    pub write_handover_num: u64,
    pub try_read_op: u64,
    pub read_handover_num: u64,
    pub try_read_leaf: u64,
    pub read_leaf_retry: u64,
    pub leaf_cache_invalid: u64,
    pub try_read_node: u64,
    pub read_node_repair: u64,
    pub retry_cnt: [u64; MAX_RETRY_REASON],
    pub latency_p50: Option<Duration>,
    pub latency_p99: Option<Duration>,
    pub latency_p999: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_shard_by_thread() {
        let t = Telemetry::new();
        t.thread(0).bump(&t.thread(0).try_read_op);
        t.thread(1).bump(&t.thread(1).try_read_op);
        t.thread(1).bump(&t.thread(1).try_read_op);
        assert_eq!(t.thread(0).try_read_op.load(Ordering::Relaxed), 1);
        assert_eq!(t.thread(1).try_read_op.load(Ordering::Relaxed), 2);
        assert_eq!(t.summary().try_read_op, 3);
    }

    #[test]
    fn cache_ratio_accumulates_fractions() {
        let t = Telemetry::new();
        t.thread(0).cache_access(1.0);
        t.thread(0).cache_access(0.5);
        let ratio = t.summary().cache_hit_ratio;
        assert!((ratio - 0.75).abs() < 1e-6);
    }

    #[test]
    fn latency_percentiles_walk_buckets() {
        let t = Telemetry::new();
        for _ in 0..99 {
            t.record_latency(0, 0, Duration::from_nanos(500));
        }
        t.record_latency(0, 0, Duration::from_micros(100));
        let s = t.summary();
        assert_eq!(s.latency_p50, Some(Duration::from_nanos(500)));
        assert_eq!(s.latency_p99, Some(Duration::from_nanos(500)));
        assert!(s.latency_p999 >= Some(Duration::from_micros(100)));
    }

    #[test]
    fn reset_zeroes_everything() {
        let t = Telemetry::new();
        t.thread(0).retry(RetryReason::CasNull);
        t.record_latency(0, 0, Duration::from_nanos(100));
        t.reset();
        let s = t.summary();
        assert_eq!(s.retry_cnt[RetryReason::CasNull as usize], 0);
        assert_eq!(s.latency_p50, None);
    }
}
