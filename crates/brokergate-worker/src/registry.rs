// Method registry
//
// Decision: Dispatch is an explicit (namespace, action) -> handler map, never string reflection
// Decision: Names are validated and duplicates rejected when handlers are registered
// Decision: Typed handlers decode kwargs into a serde struct before they run

use brokergate_protocol::MethodName;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{HandlerError, RegistryError};
use crate::session::SessionContext;

/// Result produced by a handler
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed handler future
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Handler function type
pub type Handler = Arc<dyn Fn(Invocation) -> HandlerFuture + Send + Sync>;

/// Arguments of one call, with the session it runs in
#[derive(Debug, Clone)]
pub struct Invocation {
    pub session: Arc<SessionContext>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Invocation {
    /// Decode the keyword arguments into `T`
    pub fn kwargs_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.kwargs.clone()))
            .map_err(|e| HandlerError::invalid(e.to_string()))
    }

    /// Decode positional argument `index` into `T`
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self
            .args
            .get(index)
            .cloned()
            .ok_or_else(|| HandlerError::invalid(format!("missing positional argument {}", index)))?;
        serde_json::from_value(value).map_err(|e| HandlerError::invalid(e.to_string()))
    }
}

/// Registry of handlers available in a worker session
///
/// # Example
///
/// ```ignore
/// let mut registry = MethodRegistry::new();
/// registry.register("quote", "get_market_status", |call| async move {
///     Ok(json!({"status": "trading", "market": call.session.account.environment}))
/// })?;
/// ```
#[derive(Default, Clone)]
pub struct MethodRegistry {
    handlers: HashMap<MethodName, Handler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler taking the raw invocation
    pub fn register<F, Fut>(
        &mut self,
        namespace: &str,
        action: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = MethodName::new(namespace, action)?;
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        let handler: Handler = Arc::new(move |call| -> HandlerFuture { Box::pin(handler(call)) });
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Register a handler whose kwargs decode into `P` and whose output serializes
    pub fn register_typed<P, R, F, Fut>(
        &mut self,
        namespace: &str,
        action: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<SessionContext>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(namespace, action, move |call: Invocation| {
            let handler = Arc::clone(&handler);
            async move {
                let params: P = call.kwargs_as()?;
                let output = handler(call.session, params).await?;
                serde_json::to_value(output).map_err(|e| HandlerError::internal(e.to_string()))
            }
        })
    }

    pub fn contains(&self, method: &MethodName) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().map(|m| m.to_string()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Start the handler for `method`
    pub fn dispatch(&self, method: &MethodName, call: Invocation) -> HandlerFuture {
        match self.handlers.get(method) {
            Some(handler) => handler(call),
            None => {
                let method = method.to_string();
                Box::pin(async move { Err(HandlerError::UnknownMethod(method)) })
            }
        }
    }
}

/// Builds the registry for a freshly initialised session
pub trait RegistryFactory: Send + Sync {
    fn build(&self, session: &Arc<SessionContext>) -> Result<MethodRegistry, RegistryError>;
}

impl<F> RegistryFactory for F
where
    F: Fn(&Arc<SessionContext>) -> Result<MethodRegistry, RegistryError> + Send + Sync,
{
    fn build(&self, session: &Arc<SessionContext>) -> Result<MethodRegistry, RegistryError> {
        self(session)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use brokergate_protocol::{AccountSummary, Credentials, Environment, WorkerInit};
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use uuid::Uuid;

    pub(crate) fn test_session() -> Arc<SessionContext> {
        let init = WorkerInit {
            process_id: Uuid::now_v7(),
            account: AccountSummary {
                account_id: Uuid::now_v7(),
                account_number: "U1234".to_string(),
                environment: Environment::Sandbox,
                market_permissions: BTreeSet::new(),
            },
            credentials: Credentials::new("api-1", "key"),
            heartbeat_interval: Duration::from_secs(10),
        };
        Arc::new(SessionContext::from_init(&init))
    }

    fn call(kwargs: Value) -> Invocation {
        Invocation {
            session: test_session(),
            args: vec![],
            kwargs: kwargs.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_rejects_invalid_names_and_duplicates() {
        let mut registry = MethodRegistry::new();
        assert!(matches!(
            registry.register("Quote", "get", |_| async { Ok(json!(null)) }),
            Err(RegistryError::InvalidName(_))
        ));

        registry
            .register("quote", "get", |_| async { Ok(json!(null)) })
            .unwrap();
        assert!(matches!(
            registry.register("quote", "get", |_| async { Ok(json!(null)) }),
            Err(RegistryError::Duplicate(_))
        ));
        assert_eq!(registry.methods(), vec!["quote.get".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = MethodRegistry::new();
        let method = MethodName::parse("trade.nope").unwrap();
        let result = registry.dispatch(&method, call(json!({}))).await;
        assert_eq!(
            result,
            Err(HandlerError::UnknownMethod("trade.nope".to_string()))
        );
    }

    #[derive(Deserialize)]
    struct Double {
        value: i64,
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_kwargs() {
        let mut registry = MethodRegistry::new();
        registry
            .register_typed("math", "double", |_session, params: Double| async move {
                Ok::<_, HandlerError>(params.value * 2)
            })
            .unwrap();

        let method = MethodName::parse("math.double").unwrap();
        let ok = registry.dispatch(&method, call(json!({"value": 21}))).await;
        assert_eq!(ok, Ok(json!(42)));

        let bad = registry.dispatch(&method, call(json!({"value": "x"}))).await;
        assert!(matches!(bad, Err(HandlerError::InvalidArguments(_))));
    }
}
