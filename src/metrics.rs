//! Per-queue counters.
//!
//! Counters are plain atomics shared by every worker and the manager. Gauges
//! (pending, reserved, dead) are not tracked here: they come from the driver
//! at snapshot time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::storage::DriverStats;

#[derive(Debug, Default)]
struct QueueCounters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of one queue's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Counters for every queue seen so far
#[derive(Debug, Default)]
pub struct QueueMetrics {
    queues: RwLock<HashMap<String, Arc<QueueCounters>>>,
}

impl QueueMetrics {
    /// Create an empty metrics registry
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, queue: &str) -> Arc<QueueCounters> {
        if let Ok(queues) = self.queues.read() {
            if let Some(counters) = queues.get(queue) {
                return counters.clone();
            }
        }

        let mut queues = self.queues.write().unwrap_or_else(|p| p.into_inner());
        queues.entry(queue.to_string()).or_default().clone()
    }

    /// A job was accepted by a driver
    pub fn record_dispatched(&self, queue: &str) {
        self.counters(queue).dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// A handler completed
    pub fn record_succeeded(&self, queue: &str) {
        self.counters(queue).succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Middleware short-circuited a job as a duplicate
    pub fn record_skipped(&self, queue: &str) {
        self.counters(queue).skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// An execution failed (retried or not)
    pub fn record_failed(&self, queue: &str) {
        self.counters(queue).failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed job was released for another attempt
    pub fn record_retried(&self, queue: &str) {
        self.counters(queue).retried.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was moved to the dead-letter queue
    pub fn record_dead_lettered(&self, queue: &str) {
        self.counters(queue).dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters for `queue` (zero if never seen)
    pub fn snapshot(&self, queue: &str) -> CounterSnapshot {
        let queues = self.queues.read().unwrap_or_else(|p| p.into_inner());
        match queues.get(queue) {
            Some(c) => CounterSnapshot {
                dispatched: c.dispatched.load(Ordering::Relaxed),
                succeeded: c.succeeded.load(Ordering::Relaxed),
                skipped: c.skipped.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
                retried: c.retried.load(Ordering::Relaxed),
                dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            },
            None => CounterSnapshot::default(),
        }
    }

    /// Names of every queue with recorded activity
    pub fn queues(&self) -> Vec<String> {
        let queues = self.queues.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Stats for one queue as reported to monitoring and CLI callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub driver: String,
    pub queue: String,
    pub pending: usize,
    pub reserved: usize,
    pub dead_letter_count: usize,
    pub succeeded_total: u64,
    pub failed_total: u64,
}

impl StatsSnapshot {
    /// Combine driver gauges with counters
    pub fn new(
        driver: impl Into<String>,
        queue: impl Into<String>,
        stats: DriverStats,
        counters: CounterSnapshot,
    ) -> Self {
        Self {
            driver: driver.into(),
            queue: queue.into(),
            pending: stats.pending,
            reserved: stats.reserved,
            dead_letter_count: stats.dead_letter_count,
            succeeded_total: counters.succeeded,
            failed_total: counters.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_queue() {
        let metrics = QueueMetrics::new();
        metrics.record_dispatched("mail");
        metrics.record_dispatched("mail");
        metrics.record_succeeded("mail");
        metrics.record_failed("reports");
        metrics.record_dead_lettered("reports");

        let mail = metrics.snapshot("mail");
        assert_eq!(mail.dispatched, 2);
        assert_eq!(mail.succeeded, 1);
        assert_eq!(mail.failed, 0);

        let reports = metrics.snapshot("reports");
        assert_eq!(reports.failed, 1);
        assert_eq!(reports.dead_lettered, 1);

        assert_eq!(metrics.snapshot("unknown"), CounterSnapshot::default());
        assert_eq!(metrics.queues(), vec!["mail", "reports"]);
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(QueueMetrics::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_succeeded("default");
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(metrics.snapshot("default").succeeded, 8000);
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let snapshot = StatsSnapshot::new(
            "memory",
            "default",
            DriverStats {
                pending: 2,
                reserved: 1,
                dead_letter_count: 0,
            },
            CounterSnapshot {
                succeeded: 5,
                failed: 1,
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["driver"], "memory");
        assert_eq!(json["pending"], 2);
        assert_eq!(json["succeeded_total"], 5);
        assert_eq!(json["failed_total"], 1);
    }
}
