// Host-side worker handle and its dispatcher task
//
// Decision: One dispatcher task per worker owns both pipe ends; callers only touch a bounded queue
// Decision: At most one request is outstanding at the worker, which gives per-account FIFO
// Decision: Every exit path fails the in-flight and queued tasks with a typed error

use brokergate_protocol::{
    FrameReader, FrameWriter, HostFrame, Task, TaskResult, WorkerFrame, WorkerRequest,
    WorkerResponse,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::launcher::{BoxReader, BoxWriter, WorkerChild};
use super::metrics::ProcessMetrics;
use super::restart::{TimeoutWindow, UnresponsivePolicy};
use super::status::{WorkerProcess, WorkerStatus};
use crate::error::{PoolError, PoolResult};

/// Upper bound for writing the shutdown frame to a worker
const SHUTDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type TaskReply = oneshot::Sender<PoolResult<TaskResult>>;

/// Notifications from dispatchers to the pool
#[derive(Debug, Clone, Copy)]
pub(crate) enum PoolEvent {
    /// The worker closed its pipe without being asked to
    WorkerExited { account_id: Uuid, process_id: Uuid },
}

/// Why a worker stopped taking tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HaltReason {
    Restarted,
    Crashed,
    Unresponsive,
    Evicted,
    Removed,
    Shutdown,
}

impl HaltReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            HaltReason::Restarted => "restarted",
            HaltReason::Crashed => "crashed",
            HaltReason::Unresponsive => "unresponsive",
            HaltReason::Evicted => "evicted",
            HaltReason::Removed => "removed",
            HaltReason::Shutdown => "stopped",
        }
    }

    /// Error handed to tasks that were waiting on the halted worker
    pub(crate) fn error_for(&self, account_id: Uuid) -> PoolError {
        match self {
            HaltReason::Crashed => PoolError::WorkerCrashed { account_id },
            HaltReason::Unresponsive => PoolError::WorkerUnresponsive { account_id },
            other => PoolError::Aborted {
                account_id,
                reason: other.as_str(),
            },
        }
    }
}

struct QueuedTask {
    task: Task,
    reply: TaskReply,
}

struct WorkerState {
    status: WorkerStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    last_seen: Instant,
    last_activity: Instant,
    current_task_id: Option<Uuid>,
    metrics: ProcessMetrics,
    timeouts: TimeoutWindow,
}

/// State shared between a handle and its dispatcher
struct WorkerShared {
    process_id: Uuid,
    account_id: Uuid,
    account_number: String,
    pid: u32,
    created_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<WorkerState>,
    halt: Mutex<Option<HaltReason>>,
    cancel: CancellationToken,
    /// Accepted tasks not yet finished, including the one in flight
    pending: AtomicUsize,
}

impl WorkerShared {
    fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    /// Apply a lifecycle transition, ignoring ones the state machine forbids
    fn transition(&self, next: WorkerStatus) -> bool {
        let mut state = self.state.lock();
        if state.status == next {
            return false;
        }
        if !state.status.can_transition_to(next) {
            trace!(
                process_id = %self.process_id,
                from = %state.status,
                to = %next,
                "Ignoring invalid status transition"
            );
            return false;
        }
        debug!(process_id = %self.process_id, from = %state.status, to = %next, "Worker status changed");
        state.status = next;
        true
    }

    /// Record the first halt reason and wake the dispatcher; true if this call set it
    fn halt(&self, reason: HaltReason) -> bool {
        let newly_set = {
            let mut halt = self.halt.lock();
            if halt.is_none() {
                *halt = Some(reason);
                true
            } else {
                false
            }
        };
        self.cancel.cancel();
        newly_set
    }

    fn halt_reason(&self) -> Option<HaltReason> {
        *self.halt.lock()
    }

    fn touch(&self) {
        self.state.lock().last_seen = Instant::now();
    }

    fn record_heartbeat(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.last_heartbeat = Some(at);
        state.last_seen = Instant::now();
    }

    fn begin_task(&self, task_id: Uuid) {
        let mut state = self.state.lock();
        state.current_task_id = Some(task_id);
        if state.status == WorkerStatus::Ready {
            state.status = WorkerStatus::Busy;
        }
    }

    fn finish_task(&self, success: Option<(bool, Duration)>) {
        {
            let mut state = self.state.lock();
            if let Some((success, duration)) = success {
                state.metrics.record(success, duration);
            }
            state.current_task_id = None;
            state.last_activity = Instant::now();
            if state.status == WorkerStatus::Busy {
                state.status = WorkerStatus::Ready;
            }
        }
        self.task_dropped();
    }

    fn task_dropped(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Everything the startup handshake produces for a ready worker
pub(crate) struct LiveSession {
    pub process_id: Uuid,
    pub account_id: Uuid,
    pub account_number: String,
    pub pid: u32,
    pub frames: FrameReader<BoxReader>,
    pub out: FrameWriter<BoxWriter>,
    pub child: WorkerChild,
}

/// Handle to one running worker
///
/// Cloned as `Arc<WorkerHandle>`; dropping the last handle detaches the
/// dispatcher, which then fails whatever is still queued.
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    queue: mpsc::Sender<QueuedTask>,
    queue_depth: usize,
    restarts: u32,
    child: tokio::sync::Mutex<WorkerChild>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Start the dispatcher for a worker that completed its handshake
    pub(crate) fn spawn(
        session: LiveSession,
        queue_depth: usize,
        dispatch_grace: Duration,
        restarts: u32,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let shared = Arc::new(WorkerShared {
            process_id: session.process_id,
            account_id: session.account_id,
            account_number: session.account_number,
            pid: session.pid,
            created_at: Utc::now(),
            started: now,
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Starting,
                last_heartbeat: None,
                last_seen: now,
                last_activity: now,
                current_task_id: None,
                metrics: ProcessMetrics::default(),
                timeouts: TimeoutWindow::default(),
            }),
            halt: Mutex::new(None),
            cancel: CancellationToken::new(),
            pending: AtomicUsize::new(0),
        });
        shared.transition(WorkerStatus::Ready);

        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            frames: session.frames,
            out: session.out,
            queue: rx,
            events,
            dispatch_grace,
            in_flight: None,
        };
        let join = tokio::spawn(dispatcher.run());

        Arc::new(Self {
            shared,
            queue: tx,
            queue_depth,
            restarts,
            child: tokio::sync::Mutex::new(session.child),
            dispatcher: Mutex::new(Some(join)),
        })
    }

    pub fn process_id(&self) -> Uuid {
        self.shared.process_id
    }

    pub fn account_id(&self) -> Uuid {
        self.shared.account_id
    }

    /// OS pid reported by the worker
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }

    pub fn is_live(&self) -> bool {
        self.status().is_live()
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn metrics(&self) -> ProcessMetrics {
        let mut metrics = self.shared.state.lock().metrics.clone();
        metrics.uptime_seconds = self.shared.started.elapsed().as_secs_f64();
        metrics
    }

    pub fn snapshot(&self) -> WorkerProcess {
        let (status, last_heartbeat, current_task_id) = {
            let state = self.shared.state.lock();
            (state.status, state.last_heartbeat, state.current_task_id)
        };
        WorkerProcess {
            process_id: self.shared.process_id,
            account_id: self.shared.account_id,
            account_number: self.shared.account_number.clone(),
            pid: self.shared.pid,
            status,
            created_at: self.shared.created_at,
            last_heartbeat,
            current_task_id,
            queued_tasks: self.queued_tasks(),
            restarts: self.restarts,
            metrics: self.metrics(),
        }
    }

    /// Queue a task behind everything already accepted for this account
    pub(crate) fn enqueue(&self, task: Task) -> PoolResult<oneshot::Receiver<PoolResult<TaskResult>>> {
        let account_id = self.shared.account_id;
        if let Some(reason) = self.shared.halt_reason() {
            return Err(reason.error_for(account_id));
        }
        match self.status() {
            WorkerStatus::Ready | WorkerStatus::Busy => {}
            WorkerStatus::Error => return Err(PoolError::WorkerRestarting(account_id)),
            _ => {
                return Err(PoolError::Aborted {
                    account_id,
                    reason: HaltReason::Shutdown.as_str(),
                })
            }
        }

        let (reply, rx) = oneshot::channel();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        match self.queue.try_send(QueuedTask { task, reply }) {
            Ok(()) => Ok(rx),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.task_dropped();
                Err(PoolError::QueueFull {
                    account_id,
                    depth: self.queue_depth,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.task_dropped();
                Err(self
                    .shared
                    .halt_reason()
                    .unwrap_or(HaltReason::Crashed)
                    .error_for(account_id))
            }
        }
    }

    /// Error for a task whose reply channel was dropped
    pub(crate) fn failure(&self) -> PoolError {
        self.shared
            .halt_reason()
            .unwrap_or(HaltReason::Crashed)
            .error_for(self.shared.account_id)
    }

    /// Count a caller-side timeout; true once the worker should be treated as unresponsive
    pub(crate) fn record_timeout(&self, policy: &UnresponsivePolicy) -> bool {
        self.shared
            .state
            .lock()
            .timeouts
            .record(Instant::now(), policy)
    }

    /// Time since the worker last wrote any frame
    pub(crate) fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.shared.state.lock().last_seen)
    }

    /// Idle time of a Ready worker with nothing queued
    pub(crate) fn idle_for(&self, now: Instant) -> Option<Duration> {
        let state = self.shared.state.lock();
        if state.status != WorkerStatus::Ready || self.queued_tasks() > 0 {
            return None;
        }
        Some(now.saturating_duration_since(state.last_activity))
    }

    /// Liveness of the underlying process or task; a handle being reaped counts as alive
    pub(crate) fn is_child_alive(&self) -> bool {
        match self.child.try_lock() {
            Ok(mut child) => child.is_alive(),
            Err(_) => true,
        }
    }

    /// Stop accepting work and fail outstanding tasks, without waiting
    pub(crate) fn halt(&self, reason: HaltReason) {
        if self.shared.halt(reason) {
            info!(
                process_id = %self.shared.process_id,
                account_id = %self.shared.account_id,
                reason = reason.as_str(),
                "Halting worker"
            );
        }
    }

    /// Mark the worker failed; it stays in the pool until replaced
    pub(crate) fn mark_error(&self, reason: HaltReason) {
        self.shared.transition(WorkerStatus::Error);
        self.halt(reason);
    }

    /// Graceful stop: shutdown frame, `grace` to exit, then kill
    pub(crate) async fn terminate(&self, grace: Duration, reason: HaltReason) {
        self.halt(reason);
        if self.status() == WorkerStatus::Starting {
            self.shared.transition(WorkerStatus::Error);
        }
        self.shared.transition(WorkerStatus::Stopping);

        let dispatcher = self.dispatcher.lock().take();
        if let Some(mut join) = dispatcher {
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!(process_id = %self.shared.process_id, "Dispatcher did not stop in time");
                join.abort();
            }
        }

        self.child.lock().await.reap(grace).await;
        if self.shared.transition(WorkerStatus::Stopped) {
            info!(
                process_id = %self.shared.process_id,
                account_id = %self.shared.account_id,
                reason = reason.as_str(),
                "Worker stopped"
            );
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("process_id", &self.shared.process_id)
            .field("account_id", &self.shared.account_id)
            .field("pid", &self.shared.pid)
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

struct InFlight {
    task_id: Uuid,
    timeout: Duration,
    reply: TaskReply,
    started: Instant,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Halted,
    Closed,
    Detached,
}

struct Dispatcher {
    shared: Arc<WorkerShared>,
    frames: FrameReader<BoxReader>,
    out: FrameWriter<BoxWriter>,
    queue: mpsc::Receiver<QueuedTask>,
    events: mpsc::UnboundedSender<PoolEvent>,
    dispatch_grace: Duration,
    in_flight: Option<InFlight>,
}

impl Dispatcher {
    async fn run(mut self) {
        let exit = loop {
            let deadline = self.in_flight.as_ref().map(|f| f.deadline);

            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => break Exit::Halted,

                frame = self.frames.next::<WorkerFrame>() => match frame {
                    Ok(Some(frame)) => self.on_frame(frame),
                    Ok(None) => break Exit::Closed,
                    Err(e) => {
                        warn!(process_id = %self.shared.process_id, error = %e, "Unreadable frame from worker");
                        break Exit::Closed;
                    }
                },

                queued = self.queue.recv(), if self.in_flight.is_none() => match queued {
                    Some(queued) => {
                        if let Err(e) = self.dispatch(queued).await {
                            warn!(process_id = %self.shared.process_id, error = %e, "Failed to write request to worker");
                            break Exit::Closed;
                        }
                    }
                    None => break Exit::Detached,
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.abandon_in_flight();
                }
            }
        };

        self.finish(exit).await;
    }

    fn on_frame(&mut self, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Heartbeat { tasks_completed, at } => {
                trace!(process_id = %self.shared.process_id, tasks_completed, "Heartbeat");
                self.shared.record_heartbeat(at);
            }
            WorkerFrame::Response(response) => {
                self.shared.touch();
                self.on_response(response);
            }
            other => {
                debug!(process_id = %self.shared.process_id, frame = ?other, "Ignoring unexpected worker frame");
            }
        }
    }

    fn on_response(&mut self, response: WorkerResponse) {
        let in_flight = match self.in_flight.take() {
            Some(f) if f.task_id == response.task_id => f,
            other => {
                self.in_flight = other;
                debug!(
                    process_id = %self.shared.process_id,
                    task_id = %response.task_id,
                    "Discarding late response"
                );
                return;
            }
        };

        let duration = in_flight.started.elapsed();
        let result = if response.is_ok() {
            TaskResult::ok(
                response.task_id,
                response.payload.unwrap_or(Value::Null),
                duration,
            )
        } else {
            TaskResult::failed(
                response.task_id,
                response.describe_error().unwrap_or_default(),
                duration,
            )
        };
        self.shared.finish_task(Some((result.success, duration)));
        let _ = in_flight.reply.send(Ok(result));
    }

    async fn dispatch(&mut self, queued: QueuedTask) -> Result<(), brokergate_protocol::ProtocolError> {
        let QueuedTask { task, reply } = queued;
        if reply.is_closed() {
            debug!(task_id = %task.task_id, "Skipping task abandoned before dispatch");
            self.shared.task_dropped();
            return Ok(());
        }

        let now = Instant::now();
        self.shared.begin_task(task.task_id);
        self.in_flight = Some(InFlight {
            task_id: task.task_id,
            timeout: task.timeout,
            reply,
            started: now,
            deadline: now + task.timeout + self.dispatch_grace,
        });
        // worker-side deadline matches the point where the dispatcher gives up
        let mut request = WorkerRequest::from(&task);
        request.timeout = task.timeout + self.dispatch_grace;
        trace!(task_id = %task.task_id, method = %task.method, "Dispatching task");
        self.out.send(&HostFrame::Request(request)).await
    }

    /// The worker kept a task past its timeout plus grace; stop waiting for it
    fn abandon_in_flight(&mut self) {
        if let Some(f) = self.in_flight.take() {
            warn!(
                process_id = %self.shared.process_id,
                task_id = %f.task_id,
                "Worker did not answer in time, moving to the next task"
            );
            self.shared
                .finish_task(Some((false, f.started.elapsed())));
            let _ = f.reply.send(Err(PoolError::TaskTimeout {
                task_id: f.task_id,
                timeout: f.timeout,
            }));
        }
    }

    async fn finish(mut self, exit: Exit) {
        let crashed = exit == Exit::Closed && self.shared.halt(HaltReason::Crashed);
        if exit == Exit::Detached {
            self.shared.halt(HaltReason::Removed);
        }
        let reason = self.shared.halt_reason().unwrap_or(HaltReason::Crashed);
        let account_id = self.shared.account_id;

        if crashed {
            self.shared.transition(WorkerStatus::Error);
            warn!(
                process_id = %self.shared.process_id,
                %account_id,
                "Worker closed its pipe unexpectedly"
            );
        }

        let mut failed = 0usize;
        if let Some(f) = self.in_flight.take() {
            self.shared.task_dropped();
            let _ = f.reply.send(Err(reason.error_for(account_id)));
            failed += 1;
        }
        self.queue.close();
        while let Ok(queued) = self.queue.try_recv() {
            self.shared.task_dropped();
            let _ = queued.reply.send(Err(reason.error_for(account_id)));
            failed += 1;
        }
        if failed > 0 {
            info!(
                process_id = %self.shared.process_id,
                %account_id,
                failed,
                reason = reason.as_str(),
                "Failed outstanding tasks"
            );
        }

        if exit != Exit::Closed {
            let goodbye = async {
                self.out.send(&HostFrame::Shutdown).await?;
                self.out.close().await
            };
            if let Ok(Err(e)) = tokio::time::timeout(SHUTDOWN_WRITE_TIMEOUT, goodbye).await {
                debug!(process_id = %self.shared.process_id, error = %e, "Shutdown frame not delivered");
            }
        }

        if crashed {
            let _ = self.events.send(PoolEvent::WorkerExited {
                account_id,
                process_id: self.shared.process_id,
            });
        }
    }
}
