// Gateway configuration
// Decision: Plain structs with Default + with_* builders; from_env() for deployment overrides
// Decision: Durations serialize as milliseconds
// Decision: Capacity policy is explicit (reject or bounded wait), never implicit

use brokergate_protocol::duration_millis;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::PoolError;
use crate::pool::{RestartPolicy, UnresponsivePolicy};
use crate::router::LoadBalanceStrategy;

// =============================================================================
// Capacity policy
// =============================================================================

/// What `get_or_create_process` does when the pool is at `max_workers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Fail immediately with `CapacityExceeded`
    Reject,
    /// Wait for a slot, bounded in both waiters and time
    Wait {
        max_waiters: usize,
        #[serde(with = "duration_millis")]
        timeout: Duration,
    },
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        CapacityPolicy::Reject
    }
}

// =============================================================================
// Pool configuration
// =============================================================================

/// Configuration for the process pool manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle eviction never goes below this many workers
    pub min_workers: usize,

    /// Hard cap on live workers
    pub max_workers: usize,

    /// Idle workers beyond this count are evicted
    pub target_workers: usize,

    pub capacity_policy: CapacityPolicy,

    /// Idle workers older than this may be reclaimed for another account
    /// when the pool is full; `None` disables reclamation
    #[serde(default, with = "option_duration_millis")]
    pub reclaim_idle_after: Option<Duration>,

    /// Pending tasks allowed per account
    pub queue_depth: usize,

    /// Interval at which workers emit heartbeats
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Missing heartbeats for this long marks a worker Error
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    #[serde(with = "duration_millis")]
    pub scale_interval: Duration,

    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    /// Deadline for the ready handshake
    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,

    /// Wait after `shutdown` before killing a worker
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// Wait for queued tasks during `stop()`
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,

    /// Extra time a dispatcher waits past a task's timeout before moving on
    #[serde(with = "duration_millis")]
    pub dispatch_grace: Duration,

    /// Upper bound for a single task timeout
    #[serde(with = "duration_millis")]
    pub max_task_timeout: Duration,

    /// Timeout for `health_check` probes in `health_check_all_accounts`
    #[serde(with = "duration_millis")]
    pub health_probe_timeout: Duration,

    pub restart: RestartPolicy,

    pub unresponsive: UnresponsivePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            min_workers: 0,
            max_workers: cpus,
            target_workers: 0,
            capacity_policy: CapacityPolicy::Reject,
            reclaim_idle_after: Some(Duration::from_secs(60)),
            queue_depth: 64,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            scale_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(1800),
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            dispatch_grace: Duration::from_secs(5),
            max_task_timeout: Duration::from_secs(3600),
            health_probe_timeout: Duration::from_secs(10),
            restart: RestartPolicy::default(),
            unresponsive: UnresponsivePolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `BROKERGATE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let capacity_policy = match std::env::var("BROKERGATE_CAPACITY_POLICY")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            Ok("wait") => CapacityPolicy::Wait {
                max_waiters: env_parse("BROKERGATE_CAPACITY_MAX_WAITERS").unwrap_or(16),
                timeout: env_millis("BROKERGATE_CAPACITY_WAIT_MS")
                    .unwrap_or(Duration::from_secs(30)),
            },
            _ => defaults.capacity_policy.clone(),
        };

        Self {
            min_workers: env_parse("BROKERGATE_MIN_WORKERS").unwrap_or(defaults.min_workers),
            max_workers: env_parse("BROKERGATE_MAX_WORKERS").unwrap_or(defaults.max_workers),
            target_workers: env_parse("BROKERGATE_TARGET_WORKERS")
                .unwrap_or(defaults.target_workers),
            capacity_policy,
            queue_depth: env_parse("BROKERGATE_QUEUE_DEPTH").unwrap_or(defaults.queue_depth),
            heartbeat_interval: env_millis("BROKERGATE_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_timeout: env_millis("BROKERGATE_HEARTBEAT_TIMEOUT_MS")
                .unwrap_or(defaults.heartbeat_timeout),
            idle_timeout: env_parse::<u64>("BROKERGATE_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            restart: RestartPolicy {
                max_attempts: env_parse("BROKERGATE_MAX_RESTART_ATTEMPTS")
                    .unwrap_or(defaults.restart.max_attempts),
                ..defaults.restart.clone()
            },
            ..defaults
        }
    }

    pub fn with_min_workers(mut self, n: usize) -> Self {
        self.min_workers = n;
        self
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn with_target_workers(mut self, n: usize) -> Self {
        self.target_workers = n;
        self
    }

    pub fn with_capacity_policy(mut self, policy: CapacityPolicy) -> Self {
        self.capacity_policy = policy;
        self
    }

    pub fn with_reclaim_idle_after(mut self, after: Option<Duration>) -> Self {
        self.reclaim_idle_after = after;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_scale_interval(mut self, interval: Duration) -> Self {
        self.scale_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_dispatch_grace(mut self, grace: Duration) -> Self {
        self.dispatch_grace = grace;
        self
    }

    pub fn with_max_task_timeout(mut self, timeout: Duration) -> Self {
        self.max_task_timeout = timeout;
        self
    }

    pub fn with_health_probe_timeout(mut self, timeout: Duration) -> Self {
        self.health_probe_timeout = timeout;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn with_unresponsive_policy(mut self, policy: UnresponsivePolicy) -> Self {
        self.unresponsive = policy;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.target_workers || self.target_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "expected min_workers ({}) <= target_workers ({}) <= max_workers ({})",
                self.min_workers, self.target_workers, self.max_workers
            )));
        }
        if self.queue_depth == 0 {
            return Err(PoolError::InvalidConfig(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(PoolError::InvalidConfig(
                "heartbeat_timeout must exceed a non-zero heartbeat_interval".to_string(),
            ));
        }
        if let CapacityPolicy::Wait { max_waiters, timeout } = &self.capacity_policy {
            if *max_waiters == 0 || timeout.is_zero() {
                return Err(PoolError::InvalidConfig(
                    "wait policy needs max_waiters > 0 and a non-zero timeout".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Router configuration
// =============================================================================

/// Configuration for the account router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Smoothing factor for response-time EWMA
    pub ewma_alpha: f64,

    /// Window for the rolling usage counter
    #[serde(with = "duration_millis")]
    pub usage_window: Duration,

    /// Accounts at or above this error count cannot trade
    pub trading_error_threshold: u32,

    /// Accounts at or above this error count are not routed to at all
    pub data_error_threshold: u32,

    pub default_strategy: LoadBalanceStrategy,
    pub data_strategy: LoadBalanceStrategy,
    pub trading_strategy: LoadBalanceStrategy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            usage_window: Duration::from_secs(300),
            trading_error_threshold: 5,
            data_error_threshold: 10,
            default_strategy: LoadBalanceStrategy::LeastUsed,
            data_strategy: LoadBalanceStrategy::RoundRobin,
            trading_strategy: LoadBalanceStrategy::LeastUsed,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ewma_alpha: env_parse("BROKERGATE_ROUTER_EWMA_ALPHA").unwrap_or(defaults.ewma_alpha),
            usage_window: env_parse::<u64>("BROKERGATE_ROUTER_USAGE_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.usage_window),
            default_strategy: env_parse("BROKERGATE_ROUTER_STRATEGY")
                .unwrap_or(defaults.default_strategy),
            ..defaults
        }
    }

    pub fn with_ewma_alpha(mut self, alpha: f64) -> Self {
        self.ewma_alpha = alpha.clamp(0.01, 1.0);
        self
    }

    pub fn with_usage_window(mut self, window: Duration) -> Self {
        self.usage_window = window;
        self
    }

    pub fn with_error_thresholds(mut self, trading: u32, data: u32) -> Self {
        self.trading_error_threshold = trading;
        self.data_error_threshold = data;
        self
    }

    pub fn with_default_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_data_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.data_strategy = strategy;
        self
    }

    pub fn with_trading_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.trading_strategy = strategy;
        self
    }
}

// =============================================================================
// Failover configuration
// =============================================================================

/// Configuration for the failover gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Accounts tried per operation, including the first
    pub max_attempts: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl FailoverConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_parse("BROKERGATE_FAILOVER_ATTEMPTS")
                .unwrap_or(Self::default().max_attempts),
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Serde support for `Option<Duration>` as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
