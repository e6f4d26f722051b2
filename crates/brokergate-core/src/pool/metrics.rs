//! Per-worker and pool-wide counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::status::WorkerStatus;

/// Smoothing factor for the per-worker response time average
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Counters for one worker; reset only when the worker is replaced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub total_tasks: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Exponentially weighted average, milliseconds
    pub average_response_time: f64,
    pub uptime_seconds: f64,
}

impl ProcessMetrics {
    pub(crate) fn record(&mut self, success: bool, duration: Duration) {
        let millis = duration.as_secs_f64() * 1000.0;
        self.average_response_time = if self.total_tasks == 0 {
            millis
        } else {
            RESPONSE_TIME_ALPHA * millis + (1.0 - RESPONSE_TIME_ALPHA) * self.average_response_time
        };
        self.total_tasks += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }

    /// Percentage of successful tasks; 100 before the first task
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 100.0;
        }
        self.success_count as f64 / self.total_tasks as f64 * 100.0
    }

    pub fn error_rate(&self) -> f64 {
        100.0 - self.success_rate()
    }

    pub fn summary(&self) -> ProcessMetricsSummary {
        ProcessMetricsSummary {
            total_tasks: self.total_tasks,
            success_rate: self.success_rate(),
            error_rate: self.error_rate(),
            average_response_time: self.average_response_time,
            uptime_seconds: self.uptime_seconds,
        }
    }
}

/// Entry of `get_process_metrics`, keyed by process id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetricsSummary {
    pub total_tasks: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_response_time: f64,
    pub uptime_seconds: f64,
}

/// Number of workers in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub starting: usize,
    pub ready: usize,
    pub busy: usize,
    pub error: usize,
    pub stopping: usize,
    pub stopped: usize,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: WorkerStatus) {
        match status {
            WorkerStatus::Starting => self.starting += 1,
            WorkerStatus::Ready => self.ready += 1,
            WorkerStatus::Busy => self.busy += 1,
            WorkerStatus::Error => self.error += 1,
            WorkerStatus::Stopping => self.stopping += 1,
            WorkerStatus::Stopped => self.stopped += 1,
        }
    }

    pub fn live(&self) -> usize {
        self.starting + self.ready + self.busy + self.error
    }
}

/// Pool-wide view returned by `get_system_metrics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub active_workers: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Percentage; 100 before the first request
    pub success_rate: f64,
    pub workers_by_status: StatusCounts,
    pub timeouts: u64,
    pub capacity_rejections: u64,
    pub restarts: u64,
    pub restarts_exhausted: u64,
    pub evictions: u64,
    pub workers_created: u64,
}

/// Monotonic pool counters, shared by foreground calls and background loops
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub timeouts: AtomicU64,
    pub capacity_rejections: AtomicU64,
    pub restarts: AtomicU64,
    pub restarts_exhausted: AtomicU64,
    pub evictions: AtomicU64,
    pub workers_created: AtomicU64,
}

impl PoolCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_workers: usize, workers_by_status: StatusCounts) -> SystemMetrics {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let success_rate = if total == 0 {
            100.0
        } else {
            (total - failed.min(total)) as f64 / total as f64 * 100.0
        };
        SystemMetrics {
            active_workers,
            total_requests: total,
            failed_requests: failed,
            success_rate,
            workers_by_status,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            restarts_exhausted: self.restarts_exhausted.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            workers_created: self.workers_created.load(Ordering::Relaxed),
        }
    }
}
