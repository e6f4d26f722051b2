//! Restart backoff and unresponsiveness detection

use std::collections::VecDeque;
use std::time::Duration;

use brokergate_protocol::duration_millis;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Backoff policy for automatic worker restarts
///
/// # Example
///
/// ```
/// use brokergate_core::RestartPolicy;
/// use std::time::Duration;
///
/// let policy = RestartPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartPolicy {
    /// Automatic restarts allowed before the worker is left stopped
    pub max_attempts: u32,

    /// Delay before the first restart
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any restart delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RestartPolicy {
    /// Exponential backoff: 3 attempts, 1s initial, 60s cap, 2x, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Never restart automatically
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before restart attempt `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(attempt as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jitter_range = capped * self.jitter;
        let jittered = if jitter_range > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Repeated task timeouts within `window` mark a worker unresponsive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnresponsivePolicy {
    /// Timeouts within the window that trigger a restart
    pub timeout_threshold: u32,

    /// Sliding window length
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for UnresponsivePolicy {
    fn default() -> Self {
        Self {
            timeout_threshold: 3,
            window: Duration::from_secs(60),
        }
    }
}

impl UnresponsivePolicy {
    pub fn new(timeout_threshold: u32, window: Duration) -> Self {
        Self {
            timeout_threshold,
            window,
        }
    }
}

/// Sliding window of recent timeouts for one worker
#[derive(Debug, Default)]
pub(crate) struct TimeoutWindow {
    hits: VecDeque<Instant>,
}

impl TimeoutWindow {
    /// Record a timeout at `now`; true once the threshold is reached
    pub(crate) fn record(&mut self, now: Instant, policy: &UnresponsivePolicy) -> bool {
        self.hits.push_back(now);
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) > policy.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        policy.timeout_threshold > 0 && self.hits.len() as u32 >= policy.timeout_threshold
    }

    pub(crate) fn len(&self) -> usize {
        self.hits.len()
    }
}
