//! Tool invocation wrapping: argument adaptation, timeout racing, one
//! enum-violation retry, and per-tool metrics.
//!
//! Every transport's client is adapted once, at connection time, to the
//! single `ToolInvoker` capability; nothing downstream probes for candidate
//! call methods. Failures that a model will see next are converted into
//! structured `{error: ...}` values instead of being thrown further.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use serde_json::{Value, json};

use crate::error::{GatewayError, GatewayResult};
use crate::mcp::connection::{McpClient, ToolDefinition};
use crate::metrics::ToolMetrics;
use crate::schema::{coerce_args, describe_params};

/// The one call capability every tool client exposes.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, args: Value) -> GatewayResult<Value>;
}

/// Adapter from a live MCP client to the call capability.
pub struct McpInvoker {
    client: Arc<McpClient>,
}

impl McpInvoker {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolInvoker for McpInvoker {
    async fn invoke(&self, name: &str, args: Value) -> GatewayResult<Value> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(GatewayError::Validation(format!(
                    "tool arguments must be an object, got {}",
                    other
                )));
            }
        };

        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(name.to_string()),
                arguments,
            })
            .await
            .map_err(|e| classify_call_error(&e.to_string()))?;

        serde_json::to_value(&result)
            .map_err(|e| GatewayError::Internal(format!("serialize tool result: {}", e)))
    }
}

fn classify_call_error(message: &str) -> GatewayError {
    let lowered = message.to_lowercase();
    if lowered.contains("invalid params") || lowered.contains("-32602") {
        GatewayError::Validation(message.to_string())
    } else if lowered.contains("not found") || lowered.contains("-32601") {
        GatewayError::ToolNotFound(message.to_string())
    } else {
        GatewayError::Proxy(message.to_string())
    }
}

/// How a wrapped call finished. Timeouts are tracked apart from errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Success,
    Timeout,
    Error,
}

/// The value is always addressable by the calling script or model: failures
/// arrive as `{"error": message}`, never as an unhandled fault.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub value: Value,
    pub status: InvocationStatus,
}

/// Wraps raw tool calls with adaptation, a deadline and metrics.
pub struct InvocationWrapper {
    metrics: Arc<ToolMetrics>,
    default_timeout: Duration,
    substitute_first_enum: bool,
}

impl InvocationWrapper {
    pub fn new(
        metrics: Arc<ToolMetrics>,
        default_timeout: Duration,
        substitute_first_enum: bool,
    ) -> Self {
        Self {
            metrics,
            default_timeout,
            substitute_first_enum,
        }
    }

    /// Call `tool` through `invoker` with enforced timeout and at most one
    /// retry on an enum-violation failure.
    pub async fn call(
        &self,
        server_key: &str,
        tool: &ToolDefinition,
        invoker: &dyn ToolInvoker,
        args: Value,
        timeout_override: Option<Duration>,
    ) -> InvocationOutcome {
        let metric_key = format!("{}:{}", server_key, tool.name);
        let deadline = timeout_override.unwrap_or(self.default_timeout);
        let original_args = args.clone();

        let mut adapted = args;
        adapt_arguments(&mut adapted, &tool.schema, self.substitute_first_enum);
        coerce_args(&mut adapted, &tool.schema);

        let started = Instant::now();
        let first = tokio::time::timeout(deadline, invoker.invoke(&tool.name, adapted)).await;

        match first {
            Err(_) => {
                self.metrics.record_timeout(&metric_key, started.elapsed());
                InvocationOutcome {
                    value: json!({
                        "error": format!(
                            "'{}' timed out after {}s",
                            tool.name,
                            deadline.as_secs()
                        )
                    }),
                    status: InvocationStatus::Timeout,
                }
            }
            Ok(Ok(value)) => {
                self.metrics.record_success(&metric_key, started.elapsed());
                InvocationOutcome {
                    value,
                    status: InvocationStatus::Success,
                }
            }
            Ok(Err(e)) if e.is_enum_violation() => {
                // Exactly one retry, with defaults substituted for the
                // empty-string enum fields that usually caused this. The
                // substitution runs before re-adaptation so empty non-enum
                // fields dropped on the first attempt stay dropped.
                let mut retry_args = original_args;
                substitute_enum_defaults(&mut retry_args, &tool.schema);
                adapt_arguments(&mut retry_args, &tool.schema, self.substitute_first_enum);
                coerce_args(&mut retry_args, &tool.schema);

                let retried =
                    tokio::time::timeout(deadline, invoker.invoke(&tool.name, retry_args)).await;
                match retried {
                    Ok(Ok(value)) => {
                        // A retried success is still a success.
                        self.metrics.record_success(&metric_key, started.elapsed());
                        InvocationOutcome {
                            value,
                            status: InvocationStatus::Success,
                        }
                    }
                    Ok(Err(retry_err)) => {
                        self.metrics.record_error(&metric_key, started.elapsed());
                        InvocationOutcome {
                            value: json!({"error": retry_err.to_string()}),
                            status: InvocationStatus::Error,
                        }
                    }
                    Err(_) => {
                        self.metrics.record_timeout(&metric_key, started.elapsed());
                        InvocationOutcome {
                            value: json!({
                                "error": format!(
                                    "'{}' timed out after {}s",
                                    tool.name,
                                    deadline.as_secs()
                                )
                            }),
                            status: InvocationStatus::Timeout,
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                self.metrics.record_error(&metric_key, started.elapsed());
                InvocationOutcome {
                    value: json!({"error": e.to_string()}),
                    status: InvocationStatus::Error,
                }
            }
        }
    }
}

/// Pre-call adaptation of empty-string argument values, a common model
/// failure mode for unset fields:
/// - required and enumerated → first enumerated value (when the policy knob
///   allows substitution; the first value is a heuristic default, not a
///   verified-safe choice);
/// - anything else → the field is dropped.
pub fn adapt_arguments(args: &mut Value, schema: &Value, substitute_first_enum: bool) {
    let Some(map) = args.as_object_mut() else {
        return;
    };
    let params = describe_params(schema);

    let empty_keys: Vec<String> = map
        .iter()
        .filter(|(_, v)| v.as_str().is_some_and(str::is_empty))
        .map(|(k, _)| k.clone())
        .collect();

    for key in empty_keys {
        let param = params.iter().find(|p| p.name == key);
        let substitute = substitute_first_enum
            && param.is_some_and(|p| p.required && p.enum_values.is_some());
        if substitute {
            let first = param
                .and_then(|p| p.enum_values.as_ref())
                .and_then(|values| values.first())
                .cloned();
            if let Some(value) = first {
                map.insert(key, value);
                continue;
            }
        }
        map.remove(&key);
    }
}

/// Retry-path substitution: empty-string values for enumerated parameters
/// get the parameter's default, else its first enumerated value.
fn substitute_enum_defaults(args: &mut Value, schema: &Value) {
    let Some(map) = args.as_object_mut() else {
        return;
    };
    let params = describe_params(schema);

    for param in params.iter().filter(|p| p.enum_values.is_some()) {
        let is_empty = map
            .get(&param.name)
            .and_then(Value::as_str)
            .is_some_and(str::is_empty);
        if !is_empty {
            continue;
        }
        let replacement = param
            .default
            .clone()
            .or_else(|| param.enum_values.as_ref().and_then(|v| v.first().cloned()));
        match replacement {
            Some(value) => {
                map.insert(param.name.clone(), value);
            }
            None => {
                map.remove(&param.name);
            }
        }
    }
}
