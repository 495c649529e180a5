//! System monitoring: uptime and the metrics snapshot served by
//! `GET /metrics`.

use crate::models::TaskStatus;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Counters the handlers bump as requests pass through
pub struct SystemMonitor {
    start_time: Instant,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn record_request(&self, failed: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn request_counts(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.failed_requests.load(Ordering::Relaxed),
        )
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time system metrics, assembled by the metrics handler
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub queued_tasks: usize,
    pub active_locks: usize,
    pub sessions: HashMap<&'static str, usize>,
    pub registered_agents: usize,
    pub events_dropped: u64,
}

/// Task status counts for session-level reporting
pub fn count_by_status(statuses: impl Iterator<Item = TaskStatus>) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for status in statuses {
        *counts.entry(status.to_string()).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_counters_accumulate() {
        let monitor = SystemMonitor::new();
        monitor.record_request(false);
        monitor.record_request(true);
        monitor.record_request(false);
        assert_eq!(monitor.request_counts(), (3, 1));
        assert!(monitor.uptime_seconds() >= 0.0);
    }

    #[test]
    fn status_counting_groups_by_tag() {
        let counts = count_by_status(
            [
                TaskStatus::Queued,
                TaskStatus::Queued,
                TaskStatus::InProgress,
            ]
            .into_iter(),
        );
        assert_eq!(counts.get("queued"), Some(&2));
        assert_eq!(counts.get("in-progress"), Some(&1));
    }
}
