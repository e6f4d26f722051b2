// Integration tests for the process pool with in-process workers
//
// Workers run the real serve loop on tokio tasks over duplex pipes, so
// lifecycle, FIFO dispatch, restarts and capacity behave as with OS processes.

use brokergate_core::{
    CapacityPolicy, InMemoryAccountStore, InProcessLauncher, PoolConfig, PoolError,
    ProcessPoolManager, RestartPolicy, StaticCredentialVault, UnresponsivePolicy, WorkerStatus,
};
use brokergate_protocol::{AccountHandle, AccountStatus, Credentials, Environment, TaskRequest};
use brokergate_worker::StandardHandlers;
use futures::future::join_all;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Fixtures
// =============================================================================

struct Fixture {
    pool: ProcessPoolManager,
    store: Arc<InMemoryAccountStore>,
    accounts: Vec<Uuid>,
}

fn fast_config() -> PoolConfig {
    PoolConfig::default()
        .with_max_workers(8)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_secs(5))
        .with_startup_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_millis(500))
        .with_drain_timeout(Duration::from_secs(2))
        .with_restart_policy(
            RestartPolicy::exponential()
                .with_initial_interval(Duration::from_millis(20))
                .with_jitter(0.0),
        )
}

fn fixture(accounts: usize, config: PoolConfig) -> Fixture {
    let store = Arc::new(InMemoryAccountStore::new());
    let vault = Arc::new(StaticCredentialVault::new());
    let mut ids = Vec::new();
    for i in 0..accounts {
        let account = AccountHandle::new(format!("U{}", 1000 + i), Environment::Sandbox);
        vault.insert(account.id, Credentials::new(format!("api-{}", i), "private-key"));
        ids.push(account.id);
        store.upsert(account).unwrap();
    }
    ids.sort();

    let launcher = InProcessLauncher::new(Arc::new(StandardHandlers::new().with_diagnostics(true)));
    let pool = ProcessPoolManager::new(config, store.clone(), vault, Arc::new(launcher)).unwrap();
    Fixture {
        pool,
        store,
        accounts: ids,
    }
}

async fn echo(pool: &ProcessPoolManager, account_id: Uuid) -> Result<u64, PoolError> {
    let result = pool
        .execute_task(account_id, "diag.echo", vec![], Map::new(), Duration::from_secs(5))
        .await?;
    assert!(result.success, "echo failed: {:?}", result.error);
    Ok(result.data.unwrap()["sequence"].as_u64().unwrap())
}

fn sleep_request(account_id: Uuid, millis: u64, timeout: Duration) -> TaskRequest {
    TaskRequest::new(account_id, "diag.sleep")
        .with_kwarg("millis", millis)
        .with_timeout(timeout)
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

// =============================================================================
// Lifecycle and dispatch
// =============================================================================

#[tokio::test]
async fn test_health_check_creates_worker_lazily() {
    let fx = fixture(1, fast_config());
    let account = fx.accounts[0];
    assert!(fx.pool.get_process_status(account).is_none());

    let result = fx
        .pool
        .execute_task(account, "health_check", vec![], Map::new(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.data.as_ref().unwrap()["account_id"], json!(account));

    let status = fx.pool.get_process_status(account).unwrap();
    assert_eq!(status.status, WorkerStatus::Ready);
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.metrics.total_tasks, 1);
}

#[tokio::test]
async fn test_concurrent_get_or_create_yields_one_worker() {
    let fx = fixture(1, fast_config());
    let account = fx.accounts[0];

    let handles = join_all((0..8).map(|_| fx.pool.get_or_create_process(account))).await;
    let ids: HashSet<Uuid> = handles
        .into_iter()
        .map(|h| h.unwrap().process_id())
        .collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(fx.pool.get_system_metrics().workers_created, 1);
}

#[tokio::test]
async fn test_one_live_entry_per_account() {
    let fx = fixture(3, fast_config());
    let calls = fx
        .accounts
        .iter()
        .flat_map(|id| std::iter::repeat(*id).take(4))
        .map(|id| echo(&fx.pool, id));
    for outcome in join_all(calls).await {
        outcome.unwrap();
    }

    let all = fx.pool.get_all_process_status();
    assert_eq!(all.len(), 3);
    let live: HashSet<Uuid> = all
        .iter()
        .filter(|p| p.status.is_live())
        .map(|p| p.account_id)
        .collect();
    assert_eq!(live.len(), all.len());
}

#[tokio::test]
async fn test_tasks_for_one_account_run_in_submission_order() {
    let fx = fixture(1, fast_config());
    let account = fx.accounts[0];

    let mut tickets = Vec::new();
    for i in 0..10 {
        let request = TaskRequest::new(account, "diag.echo")
            .with_arg(i)
            .with_timeout(Duration::from_secs(5));
        tickets.push(fx.pool.submit_task(request).await.unwrap());
    }

    let results = join_all(tickets.into_iter().map(|t| t.wait())).await;
    let stamps: Vec<u64> = results
        .into_iter()
        .map(|r| r.unwrap().data.unwrap()["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(stamps, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_handler_errors_are_results_not_pool_errors() {
    let fx = fixture(1, fast_config());
    let account = fx.accounts[0];

    let result = fx
        .pool
        .execute(
            TaskRequest::new(account, "diag.fail")
                .with_kwarg("message", "nope")
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("nope"));

    let unknown = fx
        .pool
        .execute(TaskRequest::new(account, "quote.no_such_method").with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(!unknown.success);

    let metrics = fx.pool.get_system_metrics();
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.failed_requests, 2);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_queueing() {
    let fx = fixture(1, fast_config());
    let account = fx.accounts[0];

    let err = fx
        .pool
        .execute(TaskRequest::new(account, "bad..method"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Validation(_)));

    let err = fx
        .pool
        .execute(TaskRequest::new(account, "diag.echo").with_timeout(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Validation(_)));
    assert!(fx.pool.get_process_status(account).is_none());
}

#[tokio::test]
async fn test_unknown_and_inactive_accounts() {
    let fx = fixture(1, fast_config());
    let missing = Uuid::now_v7();
    assert!(matches!(
        fx.pool.get_or_create_process(missing).await,
        Err(PoolError::AccountNotFound(_))
    ));

    fx.store
        .set_status(fx.accounts[0], AccountStatus::Inactive)
        .unwrap();
    assert!(matches!(
        fx.pool.get_or_create_process(fx.accounts[0]).await,
        Err(PoolError::AccountInactive(_))
    ));
}

#[tokio::test]
async fn test_queue_depth_is_bounded() {
    let fx = fixture(1, fast_config().with_queue_depth(1));
    let account = fx.accounts[0];

    let first = fx
        .pool
        .submit_task(sleep_request(account, 300, Duration::from_secs(5)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = fx
        .pool
        .submit_task(sleep_request(account, 10, Duration::from_secs(5)))
        .await
        .unwrap();
    let err = fx
        .pool
        .submit_task(sleep_request(account, 10, Duration::from_secs(5)))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PoolError::QueueFull { depth: 1, .. }));
    assert!(first.wait().await.unwrap().success);
    assert!(second.wait().await.unwrap().success);
}

// =============================================================================
// Restarts and failures
// =============================================================================

#[tokio::test]
async fn test_restart_replaces_worker_and_aborts_queue() {
    let fx = fixture(1, fast_config());
    let account = fx.accounts[0];
    echo(&fx.pool, account).await.unwrap();
    let before = fx.pool.get_process_status(account).unwrap().process_id;

    let in_flight = fx
        .pool
        .submit_task(sleep_request(account, 2_000, Duration::from_secs(5)))
        .await
        .unwrap();
    let mut queued = Vec::new();
    for _ in 0..3 {
        let request = TaskRequest::new(account, "diag.echo").with_timeout(Duration::from_secs(5));
        queued.push(fx.pool.submit_task(request).await.unwrap());
    }

    assert!(fx.pool.restart_process(account).await.unwrap());
    let after = fx.pool.get_process_status(account).unwrap();
    assert_ne!(after.process_id, before);
    assert_eq!(after.status, WorkerStatus::Ready);

    assert!(matches!(
        in_flight.wait().await,
        Err(PoolError::Aborted { reason: "restarted", .. })
    ));
    for ticket in queued {
        assert!(matches!(
            ticket.wait().await,
            Err(PoolError::Aborted { reason: "restarted", .. })
        ));
    }

    assert_eq!(echo(&fx.pool, account).await.unwrap(), 1);
    assert_eq!(fx.pool.get_system_metrics().restarts, 1);
}

#[tokio::test]
async fn test_crashed_worker_is_restarted() {
    let fx = fixture(1, fast_config());
    fx.pool.start().await.unwrap();
    let account = fx.accounts[0];
    echo(&fx.pool, account).await.unwrap();
    let before = fx.pool.get_process_status(account).unwrap().process_id;

    let err = fx
        .pool
        .execute(TaskRequest::new(account, "diag.crash").with_timeout(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::WorkerCrashed { .. }));
    assert!(err.is_retryable());

    let pool = fx.pool.clone();
    wait_for("replacement worker", move || {
        pool.get_process_status(account)
            .is_some_and(|p| p.process_id != before && p.status == WorkerStatus::Ready)
    })
    .await;

    let status = fx.pool.get_process_status(account).unwrap();
    assert_eq!(status.restarts, 1);
    assert_eq!(echo(&fx.pool, account).await.unwrap(), 1);
    fx.pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_restarts_leave_account_unavailable() {
    let fx = fixture(1, fast_config().with_restart_policy(RestartPolicy::disabled()));
    fx.pool.start().await.unwrap();
    let account = fx.accounts[0];
    echo(&fx.pool, account).await.unwrap();

    let _ = fx
        .pool
        .execute(TaskRequest::new(account, "diag.crash").with_timeout(Duration::from_secs(5)))
        .await;

    let pool = fx.pool.clone();
    wait_for("quarantine", move || {
        pool.get_process_status(account)
            .is_some_and(|p| p.status == WorkerStatus::Stopped)
    })
    .await;
    assert!(matches!(
        echo(&fx.pool, account).await,
        Err(PoolError::WorkerUnavailable(_))
    ));
    assert_eq!(fx.pool.get_system_metrics().restarts_exhausted, 1);
    assert_eq!(fx.pool.active_workers(), 0);

    // manual restart brings it back
    assert!(fx.pool.restart_process(account).await.unwrap());
    assert_eq!(echo(&fx.pool, account).await.unwrap(), 1);
    fx.pool.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_repeated_timeouts_mark_worker_unresponsive() {
    let config = fast_config()
        .with_dispatch_grace(Duration::from_secs(30))
        .with_unresponsive_policy(UnresponsivePolicy::new(2, Duration::from_secs(60)))
        .with_restart_policy(RestartPolicy::exponential().with_initial_interval(Duration::from_secs(30)));
    let fx = fixture(1, config);
    let account = fx.accounts[0];
    fx.pool.get_or_create_process(account).await.unwrap();

    let first = fx
        .pool
        .submit_task(sleep_request(account, 1_000, Duration::from_millis(100)))
        .await
        .unwrap();
    let second = fx
        .pool
        .submit_task(sleep_request(account, 1_000, Duration::from_millis(100)))
        .await
        .unwrap();
    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert!(matches!(a, Err(PoolError::TaskTimeout { .. })));
    assert!(matches!(b, Err(PoolError::TaskTimeout { .. })));

    let status = fx.pool.get_process_status(account).unwrap();
    assert_eq!(status.status, WorkerStatus::Error);
    assert!(matches!(
        echo(&fx.pool, account).await,
        Err(PoolError::WorkerRestarting(_))
    ));

    let metrics = fx.pool.get_system_metrics();
    assert_eq!(metrics.timeouts, 2);
    assert_eq!(metrics.workers_by_status.error, 1);
}

// =============================================================================
// Capacity and scaling
// =============================================================================

#[tokio::test]
async fn test_capacity_reject_is_deterministic() {
    let config = fast_config()
        .with_max_workers(1)
        .with_capacity_policy(CapacityPolicy::Reject)
        .with_reclaim_idle_after(None);
    let fx = fixture(2, config);

    let outcomes = join_all(fx.accounts.iter().map(|id| echo(&fx.pool, *id))).await;
    let rejected = outcomes
        .iter()
        .filter(|o| matches!(o, Err(PoolError::CapacityExceeded { max_workers: 1 })))
        .count();
    assert_eq!(rejected, 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert_eq!(fx.pool.get_system_metrics().capacity_rejections, 1);
}

#[tokio::test]
async fn test_capacity_wait_reclaims_idle_worker() {
    let config = fast_config()
        .with_max_workers(1)
        .with_capacity_policy(CapacityPolicy::Wait {
            max_waiters: 4,
            timeout: Duration::from_secs(5),
        })
        .with_reclaim_idle_after(Some(Duration::ZERO));
    let fx = fixture(2, config);
    let (a, b) = (fx.accounts[0], fx.accounts[1]);

    let busy = fx
        .pool
        .submit_task(sleep_request(a, 200, Duration::from_secs(5)))
        .await
        .unwrap();
    let (first, second) = tokio::join!(busy.wait(), echo(&fx.pool, b));
    assert!(first.unwrap().success);
    assert_eq!(second.unwrap(), 1);

    assert!(fx.pool.get_process_status(a).is_none());
    assert!(fx.pool.get_process_status(b).is_some());
    let metrics = fx.pool.get_system_metrics();
    assert_eq!(metrics.evictions, 1);
    assert_eq!(metrics.capacity_rejections, 0);
}

#[tokio::test]
async fn test_auto_scale_evicts_idle_workers() {
    let config = fast_config().with_idle_timeout(Duration::from_millis(500));
    let fx = fixture(2, config);
    for id in &fx.accounts {
        echo(&fx.pool, *id).await.unwrap();
    }
    assert_eq!(fx.pool.auto_scale().await, 0);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(fx.pool.auto_scale().await, 2);
    assert!(fx.pool.get_all_process_status().is_empty());
    assert_eq!(fx.pool.active_workers(), 0);
    assert_eq!(fx.pool.get_system_metrics().evictions, 2);
}

#[tokio::test]
async fn test_auto_scale_keeps_target_workers() {
    let config = fast_config()
        .with_target_workers(1)
        .with_idle_timeout(Duration::from_millis(10));
    let fx = fixture(3, config);
    for id in &fx.accounts {
        echo(&fx.pool, *id).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fx.pool.auto_scale().await, 2);
    assert_eq!(fx.pool.get_all_process_status().len(), 1);
}

// =============================================================================
// Metrics, health and shutdown
// =============================================================================

#[tokio::test]
async fn test_metrics_surface() {
    let fx = fixture(2, fast_config());
    for _ in 0..3 {
        echo(&fx.pool, fx.accounts[0]).await.unwrap();
    }
    echo(&fx.pool, fx.accounts[1]).await.unwrap();

    let system = fx.pool.get_system_metrics();
    assert_eq!(system.active_workers, 2);
    assert_eq!(system.total_requests, 4);
    assert_eq!(system.failed_requests, 0);
    assert_eq!(system.success_rate, 100.0);
    assert_eq!(system.workers_by_status.ready, 2);

    let per_process = fx.pool.get_process_metrics();
    assert_eq!(per_process.len(), 2);
    let first = fx.pool.get_process_status(fx.accounts[0]).unwrap();
    let summary = &per_process[&first.process_id];
    assert_eq!(summary.total_tasks, 3);
    assert_eq!(summary.success_rate, 100.0);
}

#[tokio::test]
async fn test_health_check_all_accounts() {
    let fx = fixture(2, fast_config());
    fx.store
        .set_status(fx.accounts[1], AccountStatus::Suspended)
        .unwrap();

    let report = fx.pool.health_check_all_accounts().await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].account_id, fx.accounts[0]);
    assert!(report[0].healthy);
    assert!(report[0].error.is_none());
    assert_eq!(fx.pool.health_check_all().await, 0);
}

#[tokio::test]
async fn test_remove_process() {
    let fx = fixture(1, fast_config());
    let account = fx.accounts[0];
    echo(&fx.pool, account).await.unwrap();

    assert!(fx.pool.remove_process(account).await);
    assert!(!fx.pool.remove_process(account).await);
    assert!(fx.pool.get_process_status(account).is_none());
    assert_eq!(fx.pool.active_workers(), 0);
}

#[tokio::test]
async fn test_stop_drains_and_refuses_new_work() {
    let fx = fixture(1, fast_config());
    fx.pool.start().await.unwrap();
    assert!(matches!(fx.pool.start().await, Err(PoolError::AlreadyRunning)));
    let account = fx.accounts[0];

    let ticket = fx
        .pool
        .submit_task(sleep_request(account, 100, Duration::from_secs(5)))
        .await
        .unwrap();
    let (stopped, result) = tokio::join!(fx.pool.stop(), ticket.wait());
    stopped.unwrap();
    assert!(result.unwrap().success);

    assert!(matches!(
        echo(&fx.pool, account).await,
        Err(PoolError::ShuttingDown)
    ));
    assert!(fx.pool.get_all_process_status().is_empty());
}
