//! Worker lifecycle states and status snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::metrics::ProcessMetrics;

/// Lifecycle state of a worker
///
/// ```text
///   Starting ──► Ready ◄──► Busy
///      ▲           │         │
///      │           ▼         ▼
///      └──────── Error ──► Stopping ──► Stopped
/// ```
///
/// Any non-terminal state may fall into `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Error,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    /// Starting, Ready, Busy and Error count against the one-worker-per-account rule
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting | WorkerStatus::Ready | WorkerStatus::Busy | WorkerStatus::Error
        )
    }

    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (Starting, Ready) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready | Busy | Error, Stopping) => true,
            (Stopping, Stopped) => true,
            (Error, Starting) => true,
            (Starting | Ready | Busy, Error) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub process_id: Uuid,
    pub account_id: Uuid,
    pub account_number: String,
    /// OS pid reported by the worker during the handshake
    pub pid: u32,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_task_id: Option<Uuid>,
    /// Tasks accepted but not yet finished, including the one in flight
    pub queued_tasks: usize,
    /// Automatic restarts that led to this worker
    pub restarts: u32,
    pub metrics: ProcessMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerStatus::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Starting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(Error.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Error.can_transition_to(Starting));
        assert!(Busy.can_transition_to(Error));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!Starting.can_transition_to(Busy));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Error));
        assert!(!Ready.can_transition_to(Starting));
    }

    #[test]
    fn test_live_states() {
        let live: Vec<_> = [Starting, Ready, Busy, Error, Stopping, Stopped]
            .into_iter()
            .filter(|s| s.is_live())
            .collect();
        assert_eq!(live, vec![Starting, Ready, Busy, Error]);
    }

    #[test]
    fn test_serialization() {
        assert_eq!(serde_json::to_string(&Busy).unwrap(), "\"busy\"");
    }
}
