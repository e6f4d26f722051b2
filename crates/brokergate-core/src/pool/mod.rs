//! Process pool: one isolated worker per account
//!
//! This module provides:
//! - [`ProcessPoolManager`] - worker lifecycle, FIFO dispatch, health checks, scaling
//! - [`WorkerHandle`] - host-side handle of one worker
//! - [`WorkerLauncher`] - how workers are started ([`ProcessLauncher`], [`InProcessLauncher`])
//! - [`RestartPolicy`] / [`UnresponsivePolicy`] - recovery tuning
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ProcessPoolManager                        │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ Event loop  │  │ Health loop  │  │  Scale loop          │  │
//! │  │ (crashes)   │  │   (30s)      │  │  (60s, idle evict)   │  │
//! │  └──────┬──────┘  └──────┬───────┘  └──────────┬───────────┘  │
//! │         └────────────────┼─────────────────────┘              │
//! │                          ▼                                    │
//! │       per-account lock ─► entry map ─► capacity semaphore     │
//! │                          │                                    │
//! │   ┌──────────────────────┼──────────────────────────┐         │
//! │   ▼                      ▼                          ▼         │
//! │ WorkerHandle A      WorkerHandle B     ...     WorkerHandle N │
//! │ [queue]→dispatcher  [queue]→dispatcher                        │
//! └───┼──────────────────────┼────────────────────────────────────┘
//!     ▼ JSON lines           ▼
//!  worker process A     worker process B
//! ```

mod handle;
mod launcher;
mod manager;
mod metrics;
mod restart;
mod startup;
mod status;

pub use handle::WorkerHandle;
pub use launcher::{
    BoxReader, BoxWriter, InProcessLauncher, ProcessLauncher, WorkerChannel, WorkerChild,
    WorkerLauncher, WORKER_BIN_ENV,
};
pub use manager::{AccountHealth, PoolStatus, ProcessPoolManager, TaskTicket};
pub use metrics::{ProcessMetrics, ProcessMetricsSummary, StatusCounts, SystemMetrics};
pub use restart::{RestartPolicy, UnresponsivePolicy};
pub use status::{WorkerProcess, WorkerStatus};
