//! Built-in handler sets.
//!
//! ```text
//! system.health_check        session identity and liveness
//! quote.* / trade.*          paper brokerage backend
//! diag.*                     opt-in diagnostics (echo, sleep, fail, crash)
//! ```

mod diagnostics;
mod paper;
mod system;

use std::sync::Arc;

use crate::error::RegistryError;
use crate::registry::{MethodRegistry, RegistryFactory};
use crate::session::SessionContext;

pub use diagnostics::register_diagnostics;
pub use paper::{register_paper_brokerage, PaperLedger, DEFAULT_STARTING_CASH};
pub use system::register_system;

/// Registry factory used by the worker binary and in-process workers
#[derive(Debug, Clone)]
pub struct StandardHandlers {
    pub diagnostics: bool,
    pub starting_cash: f64,
}

impl Default for StandardHandlers {
    fn default() -> Self {
        Self {
            diagnostics: false,
            starting_cash: DEFAULT_STARTING_CASH,
        }
    }
}

impl StandardHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    pub fn with_starting_cash(mut self, cash: f64) -> Self {
        self.starting_cash = cash;
        self
    }

    /// Read `BROKERGATE_WORKER_DIAGNOSTICS` and `BROKERGATE_PAPER_CASH`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            diagnostics: std::env::var("BROKERGATE_WORKER_DIAGNOSTICS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.diagnostics),
            starting_cash: std::env::var("BROKERGATE_PAPER_CASH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.starting_cash),
        }
    }
}

impl RegistryFactory for StandardHandlers {
    fn build(&self, session: &Arc<SessionContext>) -> Result<MethodRegistry, RegistryError> {
        if !self.starting_cash.is_finite() || self.starting_cash < 0.0 {
            return Err(RegistryError::Setup(format!(
                "starting cash must be a non-negative number, got {}",
                self.starting_cash
            )));
        }
        let mut registry = MethodRegistry::new();
        register_system(&mut registry)?;
        register_paper_brokerage(&mut registry, PaperLedger::new(session, self.starting_cash))?;
        if self.diagnostics {
            register_diagnostics(&mut registry)?;
        }
        Ok(registry)
    }
}
