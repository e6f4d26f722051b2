// Process pool manager
//
// Decision: Each account's entry is guarded by its own async lock; the entry map itself sits
//           behind a short synchronous lock that is never held across an await
// Decision: Capacity is a semaphore; a worker's permit lives in its pool entry
// Decision: Background loops go through the same locks as foreground calls
// Decision: Exhausted restarts leave a Stopped entry behind until restart_process/remove_process

use brokergate_protocol::{Task, TaskRequest, TaskResult};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handle::{HaltReason, PoolEvent, WorkerHandle};
use super::launcher::WorkerLauncher;
use super::metrics::{PoolCounters, ProcessMetricsSummary, StatusCounts, SystemMetrics};
use super::startup::launch_worker;
use super::status::{WorkerProcess, WorkerStatus};
use crate::config::{CapacityPolicy, PoolConfig};
use crate::error::{PoolError, PoolResult};
use crate::store::AccountStore;
use crate::vault::CredentialVault;

/// How often a capacity waiter looks for an idle worker to reclaim
const RECLAIM_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often `stop()` checks whether queues have drained
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle of the manager itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Constructed; serves requests, background loops not running
    Idle,
    Running,
    /// `stop()` in progress; new tasks are refused
    Draining,
    Stopped,
}

/// One row of `health_check_all_accounts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountHealth {
    pub account_id: Uuid,
    pub account_number: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PoolEntry {
    handle: Arc<WorkerHandle>,
    /// `None` once the entry no longer counts against `max_workers`
    permit: Option<OwnedSemaphorePermit>,
}

enum Slot {
    Live(Arc<WorkerHandle>),
    Restarting,
    Failed(Arc<WorkerHandle>),
    Unavailable,
    Vacant,
}

struct PoolInner {
    config: PoolConfig,
    store: Arc<dyn AccountStore>,
    vault: Arc<dyn CredentialVault>,
    launcher: Arc<dyn WorkerLauncher>,
    entries: RwLock<HashMap<Uuid, PoolEntry>>,
    account_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    capacity: Arc<Semaphore>,
    waiters: AtomicUsize,
    restart_attempts: DashMap<Uuid, u32>,
    restarts_pending: DashSet<Uuid>,
    counters: PoolCounters,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PoolEvent>>>,
    status: RwLock<PoolStatus>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns one isolated worker per account
///
/// ```text
///   execute_task(account) ──► account lock ──► entry? ──no──► capacity permit
///                                 │              │                 │
///                                 │             yes           launch + handshake
///                                 ▼              ▼                 ▼
///                            bounded queue ◄─ WorkerHandle ◄───── insert
///                                 │
///                                 ▼
///                          dispatcher ──► worker (process or task)
/// ```
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ProcessPoolManager {
    inner: Arc<PoolInner>,
}

/// A queued task; await [`TaskTicket::wait`] for its result
pub struct TaskTicket {
    task_id: Uuid,
    timeout: Duration,
    rx: oneshot::Receiver<PoolResult<TaskResult>>,
    handle: Arc<WorkerHandle>,
    pool: Arc<PoolInner>,
}

impl TaskTicket {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Worker the task was queued on
    pub fn process_id(&self) -> Uuid {
        self.handle.process_id()
    }

    /// Wait up to the task's timeout; the task itself is not cancelled on timeout
    pub async fn wait(self) -> PoolResult<TaskResult> {
        let outcome = match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.handle.failure()),
            Err(_) => Err(PoolError::TaskTimeout {
                task_id: self.task_id,
                timeout: self.timeout,
            }),
        };
        self.pool.task_finished(&self.handle, &outcome);
        outcome
    }
}

impl ProcessPoolManager {
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn AccountStore>,
        vault: Arc<dyn CredentialVault>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let capacity = Arc::new(Semaphore::new(config.max_workers));

        info!(
            max_workers = config.max_workers,
            target_workers = config.target_workers,
            min_workers = config.min_workers,
            launcher = launcher.kind(),
            "Process pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                store,
                vault,
                launcher,
                entries: RwLock::new(HashMap::new()),
                account_locks: DashMap::new(),
                capacity,
                waiters: AtomicUsize::new(0),
                restart_attempts: DashMap::new(),
                restarts_pending: DashSet::new(),
                counters: PoolCounters::default(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                status: RwLock::new(PoolStatus::Idle),
                shutdown_tx,
                loops: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        *self.inner.status.read()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the crash-event, health-check and auto-scale loops
    #[instrument(skip(self))]
    pub async fn start(&self) -> PoolResult<()> {
        {
            let mut status = self.inner.status.write();
            match *status {
                PoolStatus::Idle => *status = PoolStatus::Running,
                PoolStatus::Running => return Err(PoolError::AlreadyRunning),
                PoolStatus::Draining | PoolStatus::Stopped => return Err(PoolError::ShuttingDown),
            }
        }

        let mut loops = Vec::with_capacity(3);
        if let Some(events) = self.inner.events_rx.lock().take() {
            loops.push(self.inner.spawn_event_loop(events));
        }
        loops.push(self.inner.spawn_health_loop());
        loops.push(self.inner.spawn_scale_loop());
        *self.inner.loops.lock() = loops;

        info!(
            health_check_interval = ?self.inner.config.health_check_interval,
            scale_interval = ?self.inner.config.scale_interval,
            "Process pool started"
        );
        Ok(())
    }

    /// Refuse new tasks, drain queues up to `drain_timeout`, then stop every worker
    #[instrument(skip(self))]
    pub async fn stop(&self) -> PoolResult<()> {
        {
            let mut status = self.inner.status.write();
            match *status {
                PoolStatus::Stopped | PoolStatus::Draining => return Ok(()),
                _ => *status = PoolStatus::Draining,
            }
        }
        info!("Stopping process pool");
        let _ = self.inner.shutdown_tx.send(true);

        let loops: Vec<_> = self.inner.loops.lock().drain(..).collect();
        for handle in loops {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Background loop did not exit in time");
            }
        }

        let deadline = Instant::now() + self.inner.config.drain_timeout;
        let mut drained = true;
        loop {
            let pending: usize = self
                .inner
                .handles()
                .iter()
                .map(|h| h.queued_tasks())
                .sum();
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(pending, "Drain timeout reached, stopping workers with tasks outstanding");
                drained = false;
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let accounts: Vec<Uuid> = self.inner.entries.read().keys().copied().collect();
        join_all(accounts.into_iter().map(|account_id| {
            let inner = Arc::clone(&self.inner);
            async move {
                let lock = inner.account_lock(account_id);
                let _guard = lock.lock().await;
                let entry = inner.entries.write().remove(&account_id);
                if let Some(entry) = entry {
                    entry
                        .handle
                        .terminate(inner.config.shutdown_grace, HaltReason::Shutdown)
                        .await;
                }
            }
        }))
        .await;

        self.inner.capacity.close();
        *self.inner.status.write() = PoolStatus::Stopped;
        info!("Process pool stopped");

        if drained {
            Ok(())
        } else {
            Err(PoolError::ShutdownTimeout)
        }
    }

    // =========================================================================
    // Workers and tasks
    // =========================================================================

    /// The account's live worker, creating one if there is none
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn get_or_create_process(&self, account_id: Uuid) -> PoolResult<Arc<WorkerHandle>> {
        self.inner.ensure_accepting()?;
        let lock = self.inner.account_lock(account_id);
        let _guard = lock.lock().await;
        self.inner.get_or_create_locked(account_id).await
    }

    /// Validate and queue a task behind the account's earlier tasks
    #[instrument(skip(self, request), fields(account_id = %request.account_id, method = %request.method))]
    pub async fn submit_task(&self, request: TaskRequest) -> PoolResult<TaskTicket> {
        let task = request.into_task(self.inner.config.max_task_timeout)?;
        PoolCounters::bump(&self.inner.counters.total_requests);
        match self.inner.enqueue(task).await {
            Ok(ticket) => Ok(ticket),
            Err(e) => {
                PoolCounters::bump(&self.inner.counters.failed_requests);
                debug!(error = %e, "Task not queued");
                Err(e)
            }
        }
    }

    /// Run a method on the account's worker and wait for its result
    pub async fn execute_task(
        &self,
        account_id: Uuid,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> PoolResult<TaskResult> {
        let request = TaskRequest::new(account_id, method)
            .with_args(args)
            .with_kwargs(kwargs)
            .with_timeout(timeout);
        self.execute(request).await
    }

    pub async fn execute(&self, request: TaskRequest) -> PoolResult<TaskResult> {
        self.submit_task(request).await?.wait().await
    }

    /// Replace the account's worker; queued tasks fail with `Aborted`
    ///
    /// Returns whether the replacement reached Ready.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn restart_process(&self, account_id: Uuid) -> PoolResult<bool> {
        self.inner.ensure_accepting()?;
        let lock = self.inner.account_lock(account_id);
        let _guard = lock.lock().await;
        self.inner.restart_attempts.remove(&account_id);

        let current = self.inner.current(account_id);
        let Some(current) = current else {
            return match self.inner.get_or_create_locked(account_id).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Manual restart could not start a worker");
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        };

        let old_process = current.process_id();
        current
            .terminate(self.inner.config.shutdown_grace, HaltReason::Restarted)
            .await;

        match self.inner.replace_worker(account_id, 0).await {
            Ok(handle) => {
                PoolCounters::bump(&self.inner.counters.restarts);
                info!(%old_process, new_process = %handle.process_id(), "Worker restarted manually");
                Ok(true)
            }
            Err(e) => {
                self.inner.release_permit(account_id);
                warn!(error = %e, "Manual restart failed, worker left stopped");
                Ok(false)
            }
        }
    }

    /// Stop and forget the account's worker
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn remove_process(&self, account_id: Uuid) -> bool {
        let lock = self.inner.account_lock(account_id);
        let _guard = lock.lock().await;
        self.inner.restart_attempts.remove(&account_id);
        let entry = self.inner.entries.write().remove(&account_id);
        match entry {
            Some(entry) => {
                entry
                    .handle
                    .terminate(self.inner.config.shutdown_grace, HaltReason::Removed)
                    .await;
                info!(process_id = %entry.handle.process_id(), "Worker removed");
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Health and scaling
    // =========================================================================

    /// Probe every live worker; failures are marked Error and restarted
    ///
    /// Returns the number of workers flagged by this sweep.
    pub async fn health_check_all(&self) -> usize {
        self.inner.health_check_all().await
    }

    /// Evict idle workers beyond `target_workers`; returns the number evicted
    pub async fn auto_scale(&self) -> usize {
        self.inner.auto_scale().await
    }

    /// Run `health_check` on every active account concurrently
    #[instrument(skip(self))]
    pub async fn health_check_all_accounts(&self) -> PoolResult<Vec<AccountHealth>> {
        let accounts = self.inner.store.list_active_accounts().await?;
        let probe_timeout = self.inner.config.health_probe_timeout;

        let probes = accounts.into_iter().map(|account| async move {
            let probe = self.execute_task(
                account.id,
                "health_check",
                Vec::new(),
                Map::new(),
                probe_timeout,
            );
            let error = match tokio::time::timeout(probe_timeout, probe).await {
                Ok(Ok(result)) if result.success => None,
                Ok(Ok(result)) => Some(result.error.unwrap_or_else(|| "health check failed".into())),
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("health check timed out after {:?}", probe_timeout)),
            };
            AccountHealth {
                account_id: account.id,
                account_number: account.account_number,
                healthy: error.is_none(),
                error,
            }
        });

        Ok(join_all(probes).await)
    }

    // =========================================================================
    // Status and metrics
    // =========================================================================

    pub fn get_process_status(&self, account_id: Uuid) -> Option<WorkerProcess> {
        self.inner.current(account_id).map(|h| h.snapshot())
    }

    /// Every entry, ordered by account id
    pub fn get_all_process_status(&self) -> Vec<WorkerProcess> {
        let mut all: Vec<WorkerProcess> = self.inner.handles().iter().map(|h| h.snapshot()).collect();
        all.sort_by_key(|p| p.account_id);
        all
    }

    pub fn get_system_metrics(&self) -> SystemMetrics {
        let mut counts = StatusCounts::default();
        for handle in self.inner.handles() {
            counts.add(handle.status());
        }
        self.inner.counters.snapshot(counts.live(), counts)
    }

    /// Per-worker metrics keyed by process id
    pub fn get_process_metrics(&self) -> HashMap<Uuid, ProcessMetricsSummary> {
        self.inner
            .handles()
            .iter()
            .map(|h| (h.process_id(), h.metrics().summary()))
            .collect()
    }

    /// Workers counting against `max_workers`
    pub fn active_workers(&self) -> usize {
        self.inner.config.max_workers - self.inner.capacity.available_permits()
    }
}

impl PoolInner {
    fn ensure_accepting(&self) -> PoolResult<()> {
        match *self.status.read() {
            PoolStatus::Idle | PoolStatus::Running => Ok(()),
            PoolStatus::Draining | PoolStatus::Stopped => Err(PoolError::ShuttingDown),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn account_lock(&self, account_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.account_locks.entry(account_id).or_default().value())
    }

    fn current(&self, account_id: Uuid) -> Option<Arc<WorkerHandle>> {
        self.entries
            .read()
            .get(&account_id)
            .map(|e| Arc::clone(&e.handle))
    }

    fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.entries
            .read()
            .values()
            .map(|e| Arc::clone(&e.handle))
            .collect()
    }

    fn release_permit(&self, account_id: Uuid) {
        let permit = self
            .entries
            .write()
            .get_mut(&account_id)
            .and_then(|e| e.permit.take());
        drop(permit);
    }

    /// Caller holds the account lock
    fn classify(&self, account_id: Uuid) -> Slot {
        let Some(handle) = self.current(account_id) else {
            return Slot::Vacant;
        };
        match handle.status() {
            WorkerStatus::Ready | WorkerStatus::Busy => Slot::Live(handle),
            _ if self.restarts_pending.contains(&account_id) => Slot::Restarting,
            WorkerStatus::Error | WorkerStatus::Starting => Slot::Failed(handle),
            WorkerStatus::Stopping | WorkerStatus::Stopped => Slot::Unavailable,
        }
    }

    /// Caller holds the account lock
    async fn get_or_create_locked(self: &Arc<Self>, account_id: Uuid) -> PoolResult<Arc<WorkerHandle>> {
        match self.classify(account_id) {
            Slot::Live(handle) => return Ok(handle),
            Slot::Restarting => return Err(PoolError::WorkerRestarting(account_id)),
            Slot::Failed(handle) => {
                self.schedule_restart(account_id, handle.process_id());
                return Err(PoolError::WorkerRestarting(account_id));
            }
            Slot::Unavailable => return Err(PoolError::WorkerUnavailable(account_id)),
            Slot::Vacant => {}
        }

        let account = self
            .store
            .get_account_by_id(account_id)
            .await?
            .ok_or(PoolError::AccountNotFound(account_id))?;
        if !account.is_active() {
            return Err(PoolError::AccountInactive(account_id));
        }

        let permit = self.acquire_capacity(account_id).await?;
        let handle = self.start_worker(&account, 0).await?;
        self.entries.write().insert(
            account_id,
            PoolEntry {
                handle: Arc::clone(&handle),
                permit: Some(permit),
            },
        );
        Ok(handle)
    }

    async fn enqueue(self: &Arc<Self>, task: Task) -> PoolResult<TaskTicket> {
        self.ensure_accepting()?;
        let account_id = task.account_id;
        let task_id = task.task_id;
        let timeout = task.timeout;

        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;
        let handle = self.get_or_create_locked(account_id).await?;
        let rx = handle.enqueue(task)?;

        Ok(TaskTicket {
            task_id,
            timeout,
            rx,
            handle,
            pool: Arc::clone(self),
        })
    }

    async fn start_worker(
        &self,
        account: &brokergate_protocol::AccountHandle,
        restarts: u32,
    ) -> PoolResult<Arc<WorkerHandle>> {
        let session = launch_worker(
            account,
            self.vault.as_ref(),
            self.launcher.as_ref(),
            &self.config,
        )
        .await?;
        PoolCounters::bump(&self.counters.workers_created);
        Ok(WorkerHandle::spawn(
            session,
            self.config.queue_depth,
            self.config.dispatch_grace,
            restarts,
            self.events_tx.clone(),
        ))
    }

    /// Start a fresh worker in place of the current (already stopped) one.
    /// Caller holds the account lock.
    async fn replace_worker(self: &Arc<Self>, account_id: Uuid, restarts: u32) -> PoolResult<Arc<WorkerHandle>> {
        let account = self
            .store
            .get_account_by_id(account_id)
            .await?
            .ok_or(PoolError::AccountNotFound(account_id))?;
        if !account.is_active() {
            return Err(PoolError::AccountInactive(account_id));
        }

        let has_permit = self
            .entries
            .read()
            .get(&account_id)
            .is_some_and(|e| e.permit.is_some());
        let new_permit = if has_permit {
            None
        } else {
            Some(self.acquire_capacity(account_id).await?)
        };

        let handle = self.start_worker(&account, restarts).await?;
        let mut entries = self.entries.write();
        let entry = entries.entry(account_id).or_insert_with(|| PoolEntry {
            handle: Arc::clone(&handle),
            permit: None,
        });
        entry.handle = Arc::clone(&handle);
        if new_permit.is_some() {
            entry.permit = new_permit;
        }
        Ok(handle)
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    async fn acquire_capacity(self: &Arc<Self>, requester: Uuid) -> PoolResult<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.capacity).try_acquire_owned() {
            return Ok(permit);
        }
        if let Some(permit) = self.reclaim_idle(requester).await {
            return Ok(permit);
        }

        match &self.config.capacity_policy {
            CapacityPolicy::Reject => Err(self.capacity_rejected()),
            CapacityPolicy::Wait {
                max_waiters,
                timeout,
            } => {
                let Some(_waiter) = WaiterGuard::enter(&self.waiters, *max_waiters) else {
                    return Err(self.capacity_rejected());
                };
                let deadline = Instant::now() + *timeout;
                loop {
                    tokio::select! {
                        permit = Arc::clone(&self.capacity).acquire_owned() => {
                            return permit.map_err(|_| PoolError::ShuttingDown);
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(self.capacity_rejected());
                        }
                        _ = tokio::time::sleep(RECLAIM_POLL_INTERVAL) => {}
                    }
                    if let Some(permit) = self.reclaim_idle(requester).await {
                        return Ok(permit);
                    }
                }
            }
        }
    }

    fn capacity_rejected(&self) -> PoolError {
        PoolCounters::bump(&self.counters.capacity_rejections);
        warn!(max_workers = self.config.max_workers, "Pool at capacity");
        PoolError::CapacityExceeded {
            max_workers: self.config.max_workers,
        }
    }

    /// Evict the longest-idle worker of another account and hand over its slot
    async fn reclaim_idle(&self, requester: Uuid) -> Option<OwnedSemaphorePermit> {
        let after = self.config.reclaim_idle_after?;
        let now = Instant::now();
        let mut candidates: Vec<(Duration, Uuid, Arc<WorkerHandle>)> = self
            .entries
            .read()
            .iter()
            .filter(|(id, e)| **id != requester && e.permit.is_some())
            .filter_map(|(id, e)| {
                e.handle
                    .idle_for(now)
                    .filter(|idle| *idle >= after)
                    .map(|idle| (idle, *id, Arc::clone(&e.handle)))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, account_id, handle) in candidates {
            let lock = self.account_lock(account_id);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            if let Some(permit) = self.evict_locked(account_id, &handle, after).await {
                info!(
                    evicted_account = %account_id,
                    %requester,
                    "Reclaimed idle worker slot"
                );
                return Some(permit);
            }
        }
        None
    }

    /// Remove an idle worker; caller holds its account lock
    async fn evict_locked(
        &self,
        account_id: Uuid,
        handle: &Arc<WorkerHandle>,
        min_idle: Duration,
    ) -> Option<OwnedSemaphorePermit> {
        let still_idle = handle
            .idle_for(Instant::now())
            .is_some_and(|idle| idle >= min_idle);
        if !still_idle {
            return None;
        }
        let entry = {
            let mut entries = self.entries.write();
            match entries.get(&account_id) {
                Some(e) if e.handle.process_id() == handle.process_id() => entries.remove(&account_id),
                _ => None,
            }
        };
        let mut entry = entry?;
        handle
            .terminate(self.config.shutdown_grace, HaltReason::Evicted)
            .await;
        self.restart_attempts.remove(&account_id);
        PoolCounters::bump(&self.counters.evictions);
        entry.permit.take()
    }

    // =========================================================================
    // Restarts
    // =========================================================================

    fn schedule_restart(self: &Arc<Self>, account_id: Uuid, failed_process: Uuid) {
        if self.is_shutting_down() || !self.restarts_pending.insert(account_id) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.restart_loop(account_id, failed_process).await;
            inner.restarts_pending.remove(&account_id);
        });
    }

    async fn restart_loop(self: &Arc<Self>, account_id: Uuid, failed_process: Uuid) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let attempt = {
                let mut attempts = self.restart_attempts.entry(account_id).or_insert(0);
                *attempts += 1;
                *attempts
            };

            if !self.config.restart.has_attempts_remaining(attempt - 1) {
                self.quarantine(account_id, failed_process, attempt - 1).await;
                return;
            }

            let delay = self.config.restart.delay_for_attempt(attempt);
            info!(%account_id, attempt, ?delay, "Scheduling worker restart");
            if self.is_shutting_down() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }

            let lock = self.account_lock(account_id);
            let _guard = lock.lock().await;
            if self.is_shutting_down() {
                return;
            }
            match self.current(account_id) {
                Some(current) if current.process_id() == failed_process => {
                    current
                        .terminate(self.config.shutdown_grace, HaltReason::Restarted)
                        .await;
                }
                // replaced or removed meanwhile
                _ => return,
            }

            match self.replace_worker(account_id, attempt).await {
                Ok(handle) => {
                    PoolCounters::bump(&self.counters.restarts);
                    info!(
                        %account_id,
                        attempt,
                        process_id = %handle.process_id(),
                        "Worker restarted"
                    );
                    return;
                }
                Err(e @ (PoolError::AccountNotFound(_) | PoolError::AccountInactive(_))) => {
                    warn!(%account_id, error = %e, "Account no longer eligible, dropping worker");
                    self.entries.write().remove(&account_id);
                    return;
                }
                Err(e) => {
                    warn!(%account_id, attempt, error = %e, "Worker restart failed");
                }
            }
        }
    }

    /// Leave the worker stopped after the restart budget is spent
    async fn quarantine(&self, account_id: Uuid, failed_process: Uuid, attempts: u32) {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;
        let Some(current) = self.current(account_id) else {
            return;
        };
        if current.process_id() != failed_process {
            return;
        }
        current
            .terminate(self.config.shutdown_grace, HaltReason::Restarted)
            .await;
        self.release_permit(account_id);
        PoolCounters::bump(&self.counters.restarts_exhausted);
        error!(
            %account_id,
            attempts,
            "Restart attempts exhausted, worker left stopped until restarted manually"
        );
    }

    // =========================================================================
    // Task outcomes
    // =========================================================================

    fn task_finished(self: &Arc<Self>, handle: &Arc<WorkerHandle>, outcome: &PoolResult<TaskResult>) {
        let account_id = handle.account_id();
        match outcome {
            Ok(result) => {
                self.restart_attempts.remove(&account_id);
                if !result.success {
                    PoolCounters::bump(&self.counters.failed_requests);
                }
            }
            Err(PoolError::TaskTimeout { task_id, timeout }) => {
                PoolCounters::bump(&self.counters.failed_requests);
                PoolCounters::bump(&self.counters.timeouts);
                warn!(%account_id, %task_id, ?timeout, "Task timed out");
                if handle.record_timeout(&self.config.unresponsive) && handle.is_live() {
                    warn!(
                        %account_id,
                        process_id = %handle.process_id(),
                        threshold = self.config.unresponsive.timeout_threshold,
                        "Repeated timeouts, treating worker as unresponsive"
                    );
                    handle.mark_error(HaltReason::Unresponsive);
                    self.schedule_restart(account_id, handle.process_id());
                }
            }
            Err(e) => {
                PoolCounters::bump(&self.counters.failed_requests);
                debug!(%account_id, error = %e, "Task failed");
            }
        }
    }

    // =========================================================================
    // Background work
    // =========================================================================

    async fn health_check_all(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let mut flagged = 0;
        for handle in self.handles() {
            let account_id = handle.account_id();
            let lock = self.account_lock(account_id);
            let _guard = lock.lock().await;
            match self.current(account_id) {
                Some(current) if current.process_id() == handle.process_id() => {}
                _ => continue,
            }

            match handle.status() {
                WorkerStatus::Ready | WorkerStatus::Busy => {
                    let reason = if !handle.is_child_alive() {
                        Some(HaltReason::Crashed)
                    } else if handle.silent_for(now) > self.config.heartbeat_timeout {
                        Some(HaltReason::Unresponsive)
                    } else {
                        None
                    };
                    if let Some(reason) = reason {
                        warn!(
                            %account_id,
                            process_id = %handle.process_id(),
                            reason = reason.as_str(),
                            "Health check failed"
                        );
                        handle.mark_error(reason);
                        self.schedule_restart(account_id, handle.process_id());
                        flagged += 1;
                    }
                }
                WorkerStatus::Error => {
                    if !self.restarts_pending.contains(&account_id) {
                        self.schedule_restart(account_id, handle.process_id());
                        flagged += 1;
                    }
                }
                _ => {}
            }
        }
        if flagged > 0 {
            info!(flagged, "Health check sweep finished");
        }
        flagged
    }

    async fn auto_scale(&self) -> usize {
        let floor = self.config.target_workers.max(self.config.min_workers);
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();

        let (live, mut idle) = {
            let entries = self.entries.read();
            let live = entries.values().filter(|e| e.handle.is_live()).count();
            let idle: Vec<(Duration, Uuid, Arc<WorkerHandle>)> = entries
                .iter()
                .filter_map(|(id, e)| {
                    e.handle
                        .idle_for(now)
                        .filter(|idle| *idle >= idle_timeout)
                        .map(|idle| (idle, *id, Arc::clone(&e.handle)))
                })
                .collect();
            (live, idle)
        };
        if live <= floor || idle.is_empty() {
            return 0;
        }

        idle.sort_by(|a, b| b.0.cmp(&a.0));
        let mut excess = live - floor;
        let mut evicted = 0;
        for (_, account_id, handle) in idle {
            if excess == 0 {
                break;
            }
            let lock = self.account_lock(account_id);
            let _guard = lock.lock().await;
            if self.evict_locked(account_id, &handle, idle_timeout).await.is_some() {
                info!(%account_id, process_id = %handle.process_id(), "Evicted idle worker");
                excess -= 1;
                evicted += 1;
            }
        }
        evicted
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<PoolEvent>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(PoolEvent::WorkerExited { account_id, process_id }) => {
                            inner.schedule_restart(account_id, process_id);
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        debug!("Event loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.health_check_all().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Health loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_scale_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.scale_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.auto_scale().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Scale loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

/// Counts a capacity waiter for as long as it is alive
struct WaiterGuard<'a> {
    waiters: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    fn enter(waiters: &'a AtomicUsize, max_waiters: usize) -> Option<Self> {
        let previous = waiters.fetch_add(1, Ordering::AcqRel);
        if previous >= max_waiters {
            waiters.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self { waiters })
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}
