//! Replication progress metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated as commands are dispatched, observed, and timed out.
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    replication_cmds_sent: AtomicU64,
    replication_cmds_completed: AtomicU64,
    replication_cmds_timeout: AtomicU64,
    replication_bytes_total: AtomicU64,
    replication_bytes_completed: AtomicU64,
    deletion_cmds_sent: AtomicU64,
    deletion_cmds_completed: AtomicU64,
    deletion_cmds_timeout: AtomicU64,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_replication_cmds_sent(&self) {
        self.replication_cmds_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_replication_cmds_completed(&self) {
        self.replication_cmds_completed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_replication_cmds_timeout(&self) {
        self.replication_cmds_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_replication_bytes_total(&self, bytes: u64) {
        self.replication_bytes_total
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn incr_replication_bytes_completed(&self, bytes: u64) {
        self.replication_bytes_completed
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn incr_deletion_cmds_sent(&self) {
        self.deletion_cmds_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_deletion_cmds_completed(&self) {
        self.deletion_cmds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_deletion_cmds_timeout(&self) {
        self.deletion_cmds_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReplicationMetricsSnapshot {
        ReplicationMetricsSnapshot {
            replication_cmds_sent: self.replication_cmds_sent.load(Ordering::Relaxed),
            replication_cmds_completed: self.replication_cmds_completed.load(Ordering::Relaxed),
            replication_cmds_timeout: self.replication_cmds_timeout.load(Ordering::Relaxed),
            replication_bytes_total: self.replication_bytes_total.load(Ordering::Relaxed),
            replication_bytes_completed: self
                .replication_bytes_completed
                .load(Ordering::Relaxed),
            deletion_cmds_sent: self.deletion_cmds_sent.load(Ordering::Relaxed),
            deletion_cmds_completed: self.deletion_cmds_completed.load(Ordering::Relaxed),
            deletion_cmds_timeout: self.deletion_cmds_timeout.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the replication counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationMetricsSnapshot {
    pub replication_cmds_sent: u64,
    pub replication_cmds_completed: u64,
    pub replication_cmds_timeout: u64,
    pub replication_bytes_total: u64,
    pub replication_bytes_completed: u64,
    pub deletion_cmds_sent: u64,
    pub deletion_cmds_completed: u64,
    pub deletion_cmds_timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = ReplicationMetrics::new();
        metrics.incr_replication_cmds_sent();
        metrics.incr_replication_cmds_sent();
        metrics.incr_replication_bytes_total(1024);
        metrics.incr_deletion_cmds_timeout();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.replication_cmds_sent, 2);
        assert_eq!(snapshot.replication_bytes_total, 1024);
        assert_eq!(snapshot.deletion_cmds_timeout, 1);
        assert_eq!(snapshot.replication_cmds_completed, 0);
    }
}
