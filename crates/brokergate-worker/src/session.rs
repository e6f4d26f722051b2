//! Per-process session state shared with every handler.

use brokergate_protocol::{AccountSummary, WorkerInit};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Authenticated session bound to one account
///
/// Built from the `init` frame once credentials have been checked. The
/// private key is not retained here; handlers only see the API id.
#[derive(Debug)]
pub struct SessionContext {
    pub process_id: Uuid,
    pub account: AccountSummary,
    pub api_id: String,
    pub has_access_token: bool,
    pub started_at: DateTime<Utc>,
    tasks_completed: AtomicU64,
    sequence: AtomicU64,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl SessionContext {
    pub fn from_init(init: &WorkerInit) -> Self {
        Self {
            process_id: init.process_id,
            account: init.account.clone(),
            api_id: init.credentials.id.clone(),
            has_access_token: init.credentials.access_token.is_some(),
            started_at: Utc::now(),
            tasks_completed: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            last_heartbeat: Mutex::new(None),
        }
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn task_completed(&self) -> u64 {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Monotonic stamp, starting at 1, in execution order
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.lock()
    }

    pub(crate) fn mark_heartbeat(&self, at: DateTime<Utc>) {
        *self.last_heartbeat.lock() = Some(at);
    }
}
