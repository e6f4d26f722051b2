// Diagnostic handlers, only registered when explicitly enabled
//
// diag.echo returns a per-session sequence stamp so callers can observe
// execution order; diag.crash drops the session without a response.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{HandlerError, RegistryError};
use crate::registry::MethodRegistry;

const NAMESPACE: &str = "diag";

#[derive(Debug, Deserialize)]
struct SleepParams {
    millis: u64,
}

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default = "default_failure")]
    message: String,
}

fn default_failure() -> String {
    "diagnostic failure".to_string()
}

pub fn register_diagnostics(registry: &mut MethodRegistry) -> Result<(), RegistryError> {
    registry.register(NAMESPACE, "echo", |call| async move {
        Ok(json!({
            "sequence": call.session.next_sequence(),
            "args": call.args,
            "kwargs": call.kwargs,
        }))
    })?;

    registry.register_typed(NAMESPACE, "sleep", |session, params: SleepParams| async move {
        tokio::time::sleep(Duration::from_millis(params.millis)).await;
        Ok::<_, HandlerError>(json!({
            "slept_ms": params.millis,
            "sequence": session.next_sequence(),
        }))
    })?;

    registry.register_typed(NAMESPACE, "fail", |_session, params: FailParams| async move {
        Err::<serde_json::Value, _>(HandlerError::internal(params.message))
    })?;

    registry.register(NAMESPACE, "crash", |_call| async move {
        Err(HandlerError::Fatal("crash requested".to_string()))
    })?;

    Ok(())
}
