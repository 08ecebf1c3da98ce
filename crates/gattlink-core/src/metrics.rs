//! Connection and operation metrics.
//!
//! Counters are lock-free and updated by the state machine as operations
//! complete; [`ConnectionMetrics::summary`] takes a serializable snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::operation::OperationKind;

/// Snapshot of the metrics for one operation kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub avg_duration_ms: Option<f64>,
}

/// Thread-safe counters for one operation kind.
#[derive(Debug)]
pub struct AtomicOperationMetrics {
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl Default for AtomicOperationMetrics {
    fn default() -> Self {
        Self {
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            min_duration_ms: AtomicU64::new(u64::MAX),
            max_duration_ms: AtomicU64::new(0),
        }
    }
}

impl AtomicOperationMetrics {
    pub fn record(&self, success: bool, duration: Duration) {
        let ms = duration.as_millis() as u64;
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_duration_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OperationMetrics {
        let success_count = self.success_count.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let count = success_count + failure_count;
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);

        if count == 0 {
            return OperationMetrics::default();
        }

        OperationMetrics {
            count,
            success_count,
            failure_count,
            total_duration_ms,
            min_duration_ms: Some(self.min_duration_ms.load(Ordering::Relaxed)),
            max_duration_ms: Some(self.max_duration_ms.load(Ordering::Relaxed)),
            avg_duration_ms: Some(total_duration_ms as f64 / count as f64),
        }
    }
}

/// Metrics for one connection.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    operations: [AtomicOperationMetrics; OperationKind::ALL.len()],
    connect_attempts: AtomicU64,
    reconnect_attempts: AtomicU64,
    link_losses: AtomicU64,
    discoveries: AtomicU64,
    cache_hits: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    ready_since: Mutex<Option<Instant>>,
}

fn slot(kind: OperationKind) -> usize {
    OperationKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_default()
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the completion of one operation.
    pub fn record_operation(&self, kind: OperationKind, success: bool, duration: Duration) {
        self.operations[slot(kind)].record(success, duration);
    }

    pub fn operation(&self, kind: OperationKind) -> OperationMetrics {
        self.operations[slot(kind)].snapshot()
    }

    pub fn record_connect_attempt(&self, reconnect: bool) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if reconnect {
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_link_loss(&self) {
        self.link_losses.fetch_add(1, Ordering::Relaxed);
        *self.ready_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Record a transition to ready, and whether discovery ran to get there.
    pub fn record_ready(&self, discovered: bool) {
        if discovered {
            self.discoveries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        *self.ready_since.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn record_bytes_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Time since the connection last became ready.
    pub fn uptime(&self) -> Option<Duration> {
        self.ready_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed())
    }

    pub fn summary(&self) -> ConnectionMetricsSummary {
        ConnectionMetricsSummary {
            uptime_ms: self.uptime().map(|d| d.as_millis() as u64),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            link_losses: self.link_losses.load(Ordering::Relaxed),
            discoveries: self.discoveries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            operations: OperationKind::ALL
                .iter()
                .map(|kind| (*kind, self.operation(*kind)))
                .filter(|(_, m)| m.count > 0)
                .collect(),
        }
    }
}

/// Serializable summary of connection metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetricsSummary {
    pub uptime_ms: Option<u64>,
    pub connect_attempts: u64,
    pub reconnect_attempts: u64,
    pub link_losses: u64,
    /// Ready transitions that ran attribute discovery.
    pub discoveries: u64,
    /// Ready transitions served from the catalog cache.
    pub cache_hits: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Per-kind metrics, only for kinds that ran at least once.
    pub operations: BTreeMap<OperationKind, OperationMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_metrics() {
        let metrics = AtomicOperationMetrics::default();
        assert_eq!(metrics.snapshot(), OperationMetrics::default());

        metrics.record(true, Duration::from_millis(100));
        metrics.record(false, Duration::from_millis(300));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.min_duration_ms, Some(100));
        assert_eq!(snapshot.max_duration_ms, Some(300));
        assert_eq!(snapshot.avg_duration_ms, Some(200.0));
    }

    #[test]
    fn test_connection_summary() {
        let metrics = ConnectionMetrics::new();
        metrics.record_connect_attempt(false);
        metrics.record_connect_attempt(true);
        metrics.record_ready(true);
        metrics.record_operation(OperationKind::ReadCharacteristic, true, Duration::from_millis(5));
        metrics.record_bytes_read(2);

        let summary = metrics.summary();
        assert_eq!(summary.connect_attempts, 2);
        assert_eq!(summary.reconnect_attempts, 1);
        assert_eq!(summary.discoveries, 1);
        assert_eq!(summary.bytes_read, 2);
        assert!(summary.uptime_ms.is_some());
        assert_eq!(summary.operations.len(), 1);
        assert_eq!(summary.operations[&OperationKind::ReadCharacteristic].count, 1);

        metrics.record_link_loss();
        assert!(metrics.uptime().is_none());
    }
}
