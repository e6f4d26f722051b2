use serde_json::json;

use crate::error::RegistryError;
use crate::registry::MethodRegistry;

/// Register `health_check`
pub fn register_system(registry: &mut MethodRegistry) -> Result<(), RegistryError> {
    registry.register(brokergate_protocol::SYSTEM_NAMESPACE, "health_check", |call| async move {
        let session = &call.session;
        Ok(json!({
            "process_id": session.process_id,
            "account_id": session.account.account_id,
            "account_number": session.account.account_number,
            "environment": session.account.environment,
            "server_url": session.account.environment.server_url(),
            "is_initialized": true,
            "task_count": session.tasks_completed(),
            "last_heartbeat": session.last_heartbeat(),
            "started_at": session.started_at,
        }))
    })
}
