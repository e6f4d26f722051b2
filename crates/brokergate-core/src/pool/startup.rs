//! Worker startup handshake
//!
//! ```text
//!   host                                   worker
//!    │ ── launch (process or task) ───────► │
//!    │ ── init {account, credentials} ────► │  validate credentials,
//!    │                                      │  build method registry
//!    │ ◄─────────── ready {pid} ─────────── │
//!    │ ◄──── or startup_failed {error} ──── │
//! ```
//!
//! Anything other than `ready` within `startup_timeout` tears the worker
//! down and surfaces `StartupFailed`.

use brokergate_protocol::{
    AccountHandle, FrameReader, FrameWriter, HostFrame, WorkerFrame, WorkerInit,
};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handle::LiveSession;
use super::launcher::{BoxReader, WorkerChannel, WorkerLauncher};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::vault::CredentialVault;

/// Launch a worker for `account` and wait until it reports ready
pub(crate) async fn launch_worker(
    account: &AccountHandle,
    vault: &dyn CredentialVault,
    launcher: &dyn WorkerLauncher,
    config: &PoolConfig,
) -> PoolResult<LiveSession> {
    let credentials = vault.decrypt_credentials(account).await?;
    let WorkerChannel {
        reader,
        writer,
        mut child,
    } = launcher.launch(account)?;

    let process_id = Uuid::now_v7();
    let mut frames = FrameReader::new(reader);
    let mut out = FrameWriter::new(writer);

    let handshake = async {
        out.send(&HostFrame::Init(WorkerInit {
            process_id,
            account: account.summary(),
            credentials,
            heartbeat_interval: config.heartbeat_interval,
        }))
        .await
        .map_err(|e| format!("failed to send init: {}", e))?;
        wait_ready(&mut frames, process_id).await
    };

    let outcome = match tokio::time::timeout(config.startup_timeout, handshake).await {
        Ok(outcome) => outcome,
        Err(_) => Err(format!(
            "worker not ready within {:?}",
            config.startup_timeout
        )),
    };

    match outcome {
        Ok(pid) => {
            info!(
                %process_id,
                account_id = %account.id,
                account_number = %account.account_number,
                pid,
                launcher = launcher.kind(),
                "Worker ready"
            );
            Ok(LiveSession {
                process_id,
                account_id: account.id,
                account_number: account.account_number.clone(),
                pid,
                frames,
                out,
                child,
            })
        }
        Err(reason) => {
            warn!(account_id = %account.id, reason = %reason, "Worker startup failed");
            drop(out);
            drop(frames);
            child.reap(Duration::ZERO).await;
            Err(PoolError::StartupFailed {
                account_id: account.id,
                reason,
            })
        }
    }
}

async fn wait_ready(frames: &mut FrameReader<BoxReader>, process_id: Uuid) -> Result<u32, String> {
    loop {
        match frames.next::<WorkerFrame>().await {
            Ok(Some(WorkerFrame::Ready { process_id: id, pid })) if id == process_id => {
                return Ok(pid)
            }
            Ok(Some(WorkerFrame::Ready { process_id: id, .. })) => {
                return Err(format!("worker answered for process {}, expected {}", id, process_id))
            }
            Ok(Some(WorkerFrame::StartupFailed { error })) => return Err(error),
            Ok(Some(other)) => debug!(frame = ?other, "Ignoring frame before ready"),
            Ok(None) => return Err("worker exited during startup".to_string()),
            Err(e) => return Err(format!("unreadable startup frame: {}", e)),
        }
    }
}
