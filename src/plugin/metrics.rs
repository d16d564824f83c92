//! Per-key execution telemetry

use serde::{Deserialize, Serialize};

/// Performance record for one engine key
///
/// Only [`PerformanceMetrics::record`] mutates a record; readers get clones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Total number of completed calls
    pub call_count: u64,

    /// Number of successful calls
    pub success_count: u64,

    /// Number of failed or cancelled calls
    pub failure_count: u64,

    /// Cumulative execution time in milliseconds
    pub total_execution_ms: u64,

    /// Minimum execution time in milliseconds
    pub min_execution_ms: Option<u64>,

    /// Maximum execution time in milliseconds
    pub max_execution_ms: Option<u64>,

    /// Estimated memory held by the engine in bytes
    pub estimated_memory_bytes: u64,

    /// Timestamp of the last call (Unix milliseconds)
    pub last_call_timestamp: Option<i64>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call
    pub fn record(&mut self, execution_ms: u64, success: bool, estimated_memory_bytes: u64) {
        self.call_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }

        self.total_execution_ms = self.total_execution_ms.saturating_add(execution_ms);
        self.min_execution_ms = Some(
            self.min_execution_ms
                .map(|min| min.min(execution_ms))
                .unwrap_or(execution_ms),
        );
        self.max_execution_ms = Some(
            self.max_execution_ms
                .map(|max| max.max(execution_ms))
                .unwrap_or(execution_ms),
        );
        self.estimated_memory_bytes = estimated_memory_bytes;
        self.last_call_timestamp = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Average execution time in milliseconds
    pub fn average_execution_ms(&self) -> Option<f64> {
        if self.call_count == 0 {
            None
        } else {
            Some(self.total_execution_ms as f64 / self.call_count as f64)
        }
    }

    /// Success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            (self.success_count as f64 / self.call_count as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let mut metrics = PerformanceMetrics::new();
        assert_eq!(metrics.average_execution_ms(), None);

        metrics.record(100, true, 1024);
        metrics.record(50, false, 2048);
        metrics.record(150, true, 2048);

        assert_eq!(metrics.call_count, 3);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.total_execution_ms, 300);
        assert_eq!(metrics.min_execution_ms, Some(50));
        assert_eq!(metrics.max_execution_ms, Some(150));
        assert_eq!(metrics.average_execution_ms(), Some(100.0));
        assert_eq!(metrics.estimated_memory_bytes, 2048);
        assert!((metrics.success_rate() - 66.666).abs() < 0.01);
        assert!(metrics.last_call_timestamp.is_some());
    }
}
