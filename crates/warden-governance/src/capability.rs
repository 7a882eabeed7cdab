use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_core::{Operation, Result, SideEffectClass, WardenError};

/// Static description of an operation the interpreter may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub operation: Operation,
    pub description: String,
    pub required_params: Vec<String>,
    pub side_effect: SideEffectClass,
    /// Policy category consulted for mutating invocations.
    pub category: String,
    pub enabled: bool,
}

impl CapabilityDescriptor {
    pub fn new(operation: Operation, side_effect: SideEffectClass, category: impl Into<String>) -> Self {
        Self {
            operation,
            description: String::new(),
            required_params: Vec::new(),
            side_effect,
            category: category.into(),
            enabled: true,
        }
    }

    pub fn requires(mut self, params: &[&str]) -> Self {
        self.required_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_mutating(&self) -> bool {
        self.side_effect == SideEffectClass::Mutate
    }
}

/// Where a handler is being invoked from.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub workflow: String,
    pub step: String,
    pub step_index: usize,
    /// The run's input, for handlers that read from it.
    pub input: Value,
}

/// A handler's result. Failures stay local to the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Implemented by anything that performs an operation.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn handle(&self, params: &Value, ctx: &StepContext) -> HandlerOutcome;
}

struct Entry {
    descriptor: CapabilityDescriptor,
    handler: Arc<dyn CapabilityHandler>,
}

/// The closed set of invocable operations. An operation without a
/// registered, enabled entry cannot run.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<Operation, Entry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers that need no store: notify, log_message,
    /// wait and branch.
    pub fn with_builtins(max_wait: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(
            CapabilityDescriptor::new(Operation::Notify, SideEffectClass::Read, "communication")
                .requires(&["message"])
                .describe("Emit a notification to the operator"),
            Arc::new(NotifyHandler),
        );
        registry.register(
            CapabilityDescriptor::new(Operation::LogMessage, SideEffectClass::Read, "logging")
                .requires(&["message"])
                .describe("Write a message to the log"),
            Arc::new(LogMessageHandler),
        );
        registry.register(
            CapabilityDescriptor::new(Operation::Wait, SideEffectClass::Read, "control")
                .requires(&["seconds"])
                .describe("Pause the run"),
            Arc::new(WaitHandler { max_wait }),
        );
        registry.register(
            CapabilityDescriptor::new(Operation::Branch, SideEffectClass::Read, "control")
                .requires(&["condition"])
                .describe("Evaluate a condition; on false, skip forward to `skip_to`"),
            Arc::new(BranchHandler),
        );
        registry
    }

    /// Register (or replace) the handler for an operation.
    pub fn register(&mut self, descriptor: CapabilityDescriptor, handler: Arc<dyn CapabilityHandler>) {
        debug!(operation = %descriptor.operation, "capability registered");
        self.entries.insert(descriptor.operation, Entry { descriptor, handler });
    }

    pub fn set_enabled(&mut self, operation: Operation, enabled: bool) -> bool {
        match self.entries.get_mut(&operation) {
            Some(entry) => {
                entry.descriptor.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Look up an enabled operation.
    pub fn resolve(&self, operation: Operation) -> Result<(&CapabilityDescriptor, Arc<dyn CapabilityHandler>)> {
        match self.entries.get(&operation) {
            Some(entry) if entry.descriptor.enabled => {
                Ok((&entry.descriptor, Arc::clone(&entry.handler)))
            }
            _ => Err(WardenError::UnknownCapability(operation.to_string())),
        }
    }

    /// Every required param must be present and non-null.
    pub fn check_params(descriptor: &CapabilityDescriptor, params: &Value) -> Result<()> {
        let missing: Vec<&str> = descriptor
            .required_params
            .iter()
            .filter(|p| params.get(p.as_str()).is_none_or(Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(WardenError::InvalidParams {
                operation: descriptor.operation.to_string(),
                reason: format!("missing required params: {}", missing.join(", ")),
            })
        }
    }

    pub fn descriptors(&self) -> Vec<&CapabilityDescriptor> {
        self.entries.values().map(|e| &e.descriptor).collect()
    }
}

// ── Built-in handlers ──────────────────────────────────────────

struct NotifyHandler;

#[async_trait]
impl CapabilityHandler for NotifyHandler {
    async fn handle(&self, params: &Value, ctx: &StepContext) -> HandlerOutcome {
        let Some(message) = params.get("message").and_then(|m| m.as_str()) else {
            return HandlerOutcome::failure("message must be a string");
        };
        let recipient = params.get("recipient").and_then(|r| r.as_str()).unwrap_or("operator");
        info!(run_id = %ctx.run_id, recipient, message, "notification");
        HandlerOutcome::success(json!({ "delivered": true, "recipient": recipient }))
    }
}

struct LogMessageHandler;

#[async_trait]
impl CapabilityHandler for LogMessageHandler {
    async fn handle(&self, params: &Value, ctx: &StepContext) -> HandlerOutcome {
        let Some(message) = params.get("message").and_then(|m| m.as_str()) else {
            return HandlerOutcome::failure("message must be a string");
        };
        let level = params.get("level").and_then(|l| l.as_str()).unwrap_or("info");
        match level {
            "error" => error!(run_id = %ctx.run_id, step = %ctx.step, "{message}"),
            "warn" => warn!(run_id = %ctx.run_id, step = %ctx.step, "{message}"),
            "debug" => debug!(run_id = %ctx.run_id, step = %ctx.step, "{message}"),
            _ => info!(run_id = %ctx.run_id, step = %ctx.step, "{message}"),
        }
        HandlerOutcome::success(json!({ "logged": true, "level": level }))
    }
}

struct WaitHandler {
    max_wait: Duration,
}

#[async_trait]
impl CapabilityHandler for WaitHandler {
    async fn handle(&self, params: &Value, _ctx: &StepContext) -> HandlerOutcome {
        let Some(secs) = params.get("seconds").and_then(|s| s.as_f64()) else {
            return HandlerOutcome::failure("seconds must be a number");
        };
        if secs < 0.0 {
            return HandlerOutcome::failure("seconds must not be negative");
        }
        let wait = Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_wait)
            .min(self.max_wait);
        tokio::time::sleep(wait).await;
        HandlerOutcome::success(json!({ "waited_ms": wait.as_millis() as u64 }))
    }
}

/// Conditions are either a JSON boolean or
/// `{"input": "<key>", "equals": <value>}` compared against the run input.
struct BranchHandler;

#[async_trait]
impl CapabilityHandler for BranchHandler {
    async fn handle(&self, params: &Value, ctx: &StepContext) -> HandlerOutcome {
        let condition = &params["condition"];
        let result = match condition {
            Value::Bool(b) => *b,
            Value::Object(obj) => {
                let Some(key) = obj.get("input").and_then(|k| k.as_str()) else {
                    return HandlerOutcome::failure("condition object needs an 'input' key");
                };
                let actual = ctx.input.get(key).unwrap_or(&Value::Null);
                match obj.get("equals") {
                    Some(expected) => actual == expected,
                    None => !actual.is_null() && actual != &Value::Bool(false),
                }
            }
            other => return HandlerOutcome::failure(format!("unsupported condition: {other}")),
        };
        HandlerOutcome::success(json!({ "result": result }))
    }
}
