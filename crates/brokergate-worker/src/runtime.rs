// Worker session loop
//
// Decision: Requests run one at a time in arrival order; extra requests wait in a local queue
// Decision: Heartbeats keep flowing while a handler is running
// Decision: A fatal handler error ends the session without a response so the host observes EOF

use brokergate_protocol::{
    FrameReader, FrameWriter, HostFrame, WorkerFrame, WorkerInit, WorkerRequest, WorkerResponse,
};
use chrono::Utc;
use futures::future::OptionFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{HandlerError, WorkerError};
use crate::registry::{Invocation, MethodRegistry, RegistryFactory};
use crate::session::SessionContext;

/// Lower bound for the heartbeat interval requested by the host
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

type Running = Pin<Box<dyn Future<Output = (Uuid, Result<Value, HandlerError>)> + Send>>;

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Host sent `shutdown`
    Shutdown,
    /// Host closed its end of the pipe
    HostClosed,
    /// A handler asked to terminate the session
    Fatal(String),
}

/// Run one worker session over a byte pipe
///
/// Waits for `init`, opens the session, answers `ready`, then executes
/// requests sequentially until the host shuts the session down.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    factory: Arc<dyn RegistryFactory>,
) -> Result<SessionEnd, WorkerError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut frames = FrameReader::new(reader);
    let mut out = FrameWriter::new(writer);

    let init = match frames.next::<HostFrame>().await? {
        Some(HostFrame::Init(init)) => init,
        Some(_) => {
            return Err(WorkerError::Handshake(
                "first frame must be init".to_string(),
            ))
        }
        None => return Ok(SessionEnd::HostClosed),
    };

    let (session, registry) = match open_session(&init, factory.as_ref()) {
        Ok(opened) => opened,
        Err(reason) => {
            error!(process_id = %init.process_id, error = %reason, "Worker startup failed");
            out.send(&WorkerFrame::StartupFailed {
                error: reason.clone(),
            })
            .await?;
            return Err(WorkerError::Startup(reason));
        }
    };

    out.send(&WorkerFrame::Ready {
        process_id: session.process_id,
        pid: std::process::id(),
    })
    .await?;

    info!(
        process_id = %session.process_id,
        account_id = %session.account.account_id,
        account_number = %session.account.account_number,
        environment = %session.account.environment,
        methods = registry.len(),
        "Worker session ready"
    );

    let registry = Arc::new(registry);
    let mut ticker = tokio::time::interval(init.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut pending: VecDeque<WorkerRequest> = VecDeque::new();
    let mut running: Option<Running> = None;

    loop {
        if running.is_none() {
            if let Some(request) = pending.pop_front() {
                running = Some(start_request(&registry, &session, request));
            }
        }

        tokio::select! {
            Some((task_id, result)) = OptionFuture::from(running.as_mut()), if running.is_some() => {
                running = None;
                let completed = session.task_completed();
                let response = match result {
                    Ok(payload) => WorkerResponse::ok(task_id, payload),
                    Err(HandlerError::Fatal(reason)) => {
                        warn!(%task_id, reason = %reason, "Handler requested session termination");
                        return Ok(SessionEnd::Fatal(reason));
                    }
                    Err(e) => {
                        debug!(%task_id, error = %e, "Handler returned error");
                        let kind = e.kind().unwrap_or(brokergate_protocol::ErrorKind::Internal);
                        WorkerResponse::error(task_id, kind, e.to_string())
                    }
                };
                debug!(%task_id, completed, ok = response.is_ok(), "Request finished");
                out.send(&WorkerFrame::Response(response)).await?;
            }

            frame = frames.next::<HostFrame>() => {
                match frame? {
                    Some(HostFrame::Request(request)) => {
                        debug!(task_id = %request.task_id, method = %request.method, "Request received");
                        pending.push_back(request);
                    }
                    Some(HostFrame::Shutdown) => {
                        info!(process_id = %session.process_id, "Shutdown requested by host");
                        return Ok(SessionEnd::Shutdown);
                    }
                    Some(HostFrame::Init(_)) => {
                        warn!(process_id = %session.process_id, "Ignoring duplicate init frame");
                    }
                    None => {
                        info!(process_id = %session.process_id, "Host closed the session");
                        return Ok(SessionEnd::HostClosed);
                    }
                }
            }

            _ = ticker.tick() => {
                let at = Utc::now();
                session.mark_heartbeat(at);
                out.send(&WorkerFrame::Heartbeat {
                    tasks_completed: session.tasks_completed(),
                    at,
                })
                .await?;
            }
        }
    }
}

fn open_session(
    init: &WorkerInit,
    factory: &dyn RegistryFactory,
) -> Result<(Arc<SessionContext>, MethodRegistry), String> {
    if !init.credentials.is_complete() {
        return Err(format!(
            "missing credentials for account {}: api id and private key are required",
            init.account.account_number
        ));
    }
    let session = Arc::new(SessionContext::from_init(init));
    let registry = factory.build(&session).map_err(|e| e.to_string())?;
    Ok((session, registry))
}

fn start_request(
    registry: &Arc<MethodRegistry>,
    session: &Arc<SessionContext>,
    request: WorkerRequest,
) -> Running {
    let task_id = request.task_id;
    let timeout = request.timeout;
    let handler = registry.dispatch(
        &request.method,
        Invocation {
            session: Arc::clone(session),
            args: request.args,
            kwargs: request.kwargs,
        },
    );
    Box::pin(async move {
        let result = match tokio::time::timeout(timeout, handler).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(timeout)),
        };
        (task_id, result)
    })
}
