//! Per-account usage and latency history kept by the router.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Rolling usage window plus a response-time EWMA
#[derive(Debug, Default)]
pub(crate) struct AccountStats {
    uses: VecDeque<Instant>,
    ewma_ms: Option<f64>,
    samples: u64,
}

impl AccountStats {
    pub fn record_use(&mut self, now: Instant, window: Duration) {
        self.prune(now, window);
        self.uses.push_back(now);
    }

    /// Selections within `window` of `now`
    pub fn usage(&self, now: Instant, window: Duration) -> usize {
        self.uses
            .iter()
            .rev()
            .take_while(|at| now.saturating_duration_since(**at) <= window)
            .count()
    }

    /// Fold a sample into the EWMA; the first sample seeds it
    pub fn record_response(&mut self, duration_ms: f64, alpha: f64) {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            return;
        }
        self.ewma_ms = Some(match self.ewma_ms {
            Some(current) => alpha * duration_ms + (1.0 - alpha) * current,
            None => duration_ms,
        });
        self.samples += 1;
    }

    pub fn average_response_ms(&self) -> Option<f64> {
        self.ewma_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.uses.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.uses.pop_front();
            } else {
                break;
            }
        }
    }
}
