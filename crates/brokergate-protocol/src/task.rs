// Task submission shapes
//
// Decision: Method names are parsed once at submission into (namespace, action)
// Decision: A bare name such as `health_check` lives in the `system` namespace

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::duration_millis;
use crate::error::ProtocolError;
use crate::operation::OperationClass;

/// Namespace used for methods given without a dot
pub const SYSTEM_NAMESPACE: &str = "system";

/// Namespace of the brokerage account and order methods
pub const TRADE_NAMESPACE: &str = "trade";

/// `trade` actions that change orders at the brokerage
const ORDER_ENTRY_ACTIONS: [&str; 3] = ["place_order", "modify_order", "cancel_order"];

/// Default timeout applied when a request does not set one
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// A validated `namespace.action` method name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodName {
    namespace: String,
    action: String,
}

impl MethodName {
    pub fn new(namespace: &str, action: &str) -> Result<Self, ProtocolError> {
        validate_segment(namespace)?;
        validate_segment(action)?;
        Ok(Self {
            namespace: namespace.to_string(),
            action: action.to_string(),
        })
    }

    /// Parse `quote.get_market_status` or a bare `health_check`
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let raw = raw.trim();
        match raw.split_once('.') {
            Some((namespace, action)) => Self::new(namespace, action),
            None => Self::new(SYSTEM_NAMESPACE, raw),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Operation class a caller must route under to invoke this method
    ///
    /// Order entry needs a trading operation; other `trade` methods read
    /// account state and may not ride on a data operation.
    pub fn required_class(&self) -> Option<OperationClass> {
        if self.namespace != TRADE_NAMESPACE {
            return None;
        }
        if ORDER_ENTRY_ACTIONS.contains(&self.action.as_str()) {
            Some(OperationClass::Trading)
        } else {
            Some(OperationClass::Account)
        }
    }
}

fn validate_segment(segment: &str) -> Result<(), ProtocolError> {
    if segment.is_empty() {
        return Err(ProtocolError::InvalidMethod(
            "method segments must not be empty".to_string(),
        ));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ProtocolError::InvalidMethod(format!(
            "'{}' may only contain lowercase letters, digits and underscores",
            segment
        )));
    }
    Ok(())
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == SYSTEM_NAMESPACE {
            write!(f, "{}", self.action)
        } else {
            write!(f, "{}.{}", self.namespace, self.action)
        }
    }
}

impl Serialize for MethodName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MethodName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        MethodName::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Caller-facing request to run a method on an account's worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub account_id: Uuid,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(with = "duration_millis", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_TASK_TIMEOUT
}

impl TaskRequest {
    pub fn new(account_id: Uuid, method: impl Into<String>) -> Self {
        Self {
            account_id,
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate the request and turn it into a queued task
    pub fn into_task(self, max_timeout: Duration) -> Result<Task, ProtocolError> {
        let method = MethodName::parse(&self.method)?;
        if self.timeout.is_zero() {
            return Err(ProtocolError::InvalidTimeout(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.timeout > max_timeout {
            return Err(ProtocolError::InvalidTimeout(format!(
                "timeout {:?} exceeds the maximum of {:?}",
                self.timeout, max_timeout
            )));
        }
        Ok(Task {
            task_id: Uuid::now_v7(),
            account_id: self.account_id,
            method,
            args: self.args,
            kwargs: self.kwargs,
            timeout: self.timeout,
        })
    }
}

/// A validated unit of work bound to one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub account_id: Uuid,
    pub method: MethodName,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

/// Outcome of a task as seen by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
}

impl TaskResult {
    pub fn ok(task_id: Uuid, data: Value, duration: Duration) -> Self {
        Self {
            task_id,
            success: true,
            data: Some(data),
            error: None,
            duration_ms: duration.as_micros() as f64 / 1000.0,
        }
    }

    pub fn failed(task_id: Uuid, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id,
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms: duration.as_micros() as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_namespaced_method() {
        let method = MethodName::parse("quote.get_market_status").unwrap();
        assert_eq!(method.namespace(), "quote");
        assert_eq!(method.action(), "get_market_status");
        assert_eq!(method.to_string(), "quote.get_market_status");
    }

    #[test]
    fn test_parse_bare_method() {
        let method = MethodName::parse("health_check").unwrap();
        assert_eq!(method.namespace(), SYSTEM_NAMESPACE);
        assert_eq!(method.to_string(), "health_check");
    }

    #[test]
    fn test_rejects_malformed_methods() {
        assert!(MethodName::parse("").is_err());
        assert!(MethodName::parse("quote.").is_err());
        assert!(MethodName::parse(".get").is_err());
        assert!(MethodName::parse("quote.get.status").is_err());
        assert!(MethodName::parse("Quote.Get").is_err());
    }

    #[test]
    fn test_required_class_of_trade_methods() {
        let class = |raw: &str| MethodName::parse(raw).unwrap().required_class();
        assert_eq!(class("trade.place_order"), Some(OperationClass::Trading));
        assert_eq!(class("trade.cancel_order"), Some(OperationClass::Trading));
        assert_eq!(class("trade.get_positions"), Some(OperationClass::Account));
        assert_eq!(class("quote.get_quote"), None);
        assert_eq!(class("health_check"), None);
    }

    #[test]
    fn test_into_task_validates_timeout() {
        let account_id = Uuid::now_v7();
        let max = Duration::from_secs(60);

        let zero = TaskRequest::new(account_id, "health_check").with_timeout(Duration::ZERO);
        assert!(matches!(
            zero.into_task(max),
            Err(ProtocolError::InvalidTimeout(_))
        ));

        let too_long =
            TaskRequest::new(account_id, "health_check").with_timeout(Duration::from_secs(61));
        assert!(too_long.into_task(max).is_err());

        let task = TaskRequest::new(account_id, "quote.get_quote")
            .with_kwarg("symbol", "AAPL")
            .with_timeout(Duration::from_secs(5))
            .into_task(max)
            .unwrap();
        assert_eq!(task.account_id, account_id);
        assert_eq!(task.kwargs["symbol"], json!("AAPL"));
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let account_id = Uuid::now_v7();
        let request: TaskRequest = serde_json::from_value(json!({
            "account_id": account_id,
            "method": "trade.get_positions",
        }))
        .unwrap();
        assert!(request.args.is_empty());
        assert_eq!(request.timeout, DEFAULT_TASK_TIMEOUT);
    }

    #[test]
    fn test_failed_result_omits_data() {
        let result = TaskResult::failed(Uuid::now_v7(), "boom", Duration::from_millis(12));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(false));
        assert!(value.get("data").is_none());
        assert_eq!(value["duration_ms"], json!(12.0));
    }
}
