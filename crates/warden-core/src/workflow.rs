use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, WardenError};

/// The closed set of operation kinds a workflow step may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Notify,
    LogMessage,
    Query,
    UpdatePreference,
    CreateRecord,
    Wait,
    Branch,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Self::Notify,
        Self::LogMessage,
        Self::Query,
        Self::UpdatePreference,
        Self::CreateRecord,
        Self::Wait,
        Self::Branch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::LogMessage => "log_message",
            Self::Query => "query",
            Self::UpdatePreference => "update_preference",
            Self::CreateRecord => "create_record",
            Self::Wait => "wait",
            Self::Branch => "branch",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| WardenError::UnknownCapability(s.to_string()))
    }
}

/// Whether a capability changes state outside the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    Read,
    Mutate,
}

/// What the interpreter does when a step's handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Abort,
    Skip,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub operation: Operation,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl Step {
    pub fn new(name: impl Into<String>, operation: Operation, params: Value) -> Self {
        Self {
            name: name.into(),
            operation,
            params,
            on_failure: OnFailure::Abort,
        }
    }

    pub fn on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    /// String parameter lookup.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// A named, ordered list of steps. Order is fixed at definition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
            enabled: true,
        }
    }

    /// Parse a JSON definition. Operation names outside the closed set are
    /// reported as `UnknownCapability` rather than a generic parse error.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        if let Some(steps) = value.get("steps").and_then(|s| s.as_array()) {
            for step in steps {
                if let Some(op) = step.get("operation").and_then(|o| o.as_str()) {
                    Operation::from_str(op)?;
                }
            }
        }
        let def: WorkflowDefinition = serde_json::from_value(value)?;
        if def.name.trim().is_empty() {
            return Err(WardenError::InvalidParams {
                operation: "workflow".into(),
                reason: "name must not be empty".into(),
            });
        }
        Ok(def)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Executed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// Set when policy allowed the step with a warning.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Failed {
        error: String,
    },
    Skipped {
        reason: String,
    },
    Denied {
        reason: String,
        rules: Vec<Uuid>,
    },
    AwaitingApproval {
        proposal_id: Uuid,
        reason: String,
    },
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "executed",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
            Self::Denied { .. } => "denied",
            Self::AwaitingApproval { .. } => "awaiting_approval",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub step: String,
    pub operation: Operation,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// Why a run ended in `aborted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    UnknownCapability { step: String, operation: String },
    InvalidParams { step: String, detail: String },
    PolicyDenied { step: String, detail: String, rules: Vec<Uuid> },
    StepFailed { step: String, error: String },
    ApprovalRejected { step: String, proposal_id: Uuid },
    ApprovalReverted { step: String, proposal_id: Uuid },
    Cancelled { completed_steps: usize },
    DefinitionDisabled { definition: String },
}

impl AbortReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCapability { .. } => "unknown_capability",
            Self::InvalidParams { .. } => "invalid_params",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::StepFailed { .. } => "step_execution_failure",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::ApprovalReverted { .. } => "approval_reverted",
            Self::Cancelled { .. } => "cancelled",
            Self::DefinitionDisabled { .. } => "definition_disabled",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCapability { step, operation } => {
                write!(f, "unknown_capability: step '{step}' names '{operation}'")
            }
            Self::InvalidParams { step, detail } => write!(f, "invalid_params: step '{step}': {detail}"),
            Self::PolicyDenied { step, detail, .. } => write!(f, "policy_denied: step '{step}': {detail}"),
            Self::StepFailed { step, error } => write!(f, "step '{step}' failed: {error}"),
            Self::ApprovalRejected { step, proposal_id } => {
                write!(f, "approval_rejected: step '{step}' (proposal {proposal_id})")
            }
            Self::ApprovalReverted { step, proposal_id } => {
                write!(f, "approval_reverted: step '{step}' (proposal {proposal_id})")
            }
            Self::Cancelled { completed_steps } => {
                write!(f, "cancelled after {completed_steps} step(s)")
            }
            Self::DefinitionDisabled { definition } => {
                write!(f, "workflow '{definition}' is disabled")
            }
        }
    }
}

/// One execution of a workflow definition.
///
/// A run suspended on an approval keeps `status = running` with
/// `suspended_on` set; it advances again only by re-invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition: String,
    #[serde(default)]
    pub input: Value,
    pub status: RunStatus,
    pub step_results: Vec<StepResult>,
    /// Index of the next step to execute.
    pub next_step: usize,
    #[serde(default)]
    pub suspended_on: Option<Uuid>,
    #[serde(default)]
    pub abort_reason: Option<AbortReason>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Bumped by every successful save; the store only accepts a save built
    /// on the version it holds.
    #[serde(default)]
    pub version: u64,
    /// Set while a driver is executing steps. A run whose lease is still
    /// live cannot be resumed elsewhere.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(definition: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition: definition.into(),
            input,
            status: RunStatus::Running,
            step_results: Vec::new(),
            next_step: 0,
            suspended_on: None,
            abort_reason: None,
            started_at: Utc::now(),
            ended_at: None,
            version: 0,
            lease_expires_at: None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::Running && self.suspended_on.is_some()
    }

    /// Whether some driver currently holds the run.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|t| t > now)
    }

    /// Move to a terminal status. Terminal runs never change status again.
    pub fn finish(&mut self, status: RunStatus, reason: Option<AbortReason>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(WardenError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.abort_reason = reason;
        self.suspended_on = None;
        self.lease_expires_at = None;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Names of steps whose handler actually ran.
    pub fn executed_steps(&self) -> Vec<&str> {
        self.step_results
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Executed { .. }))
            .map(|r| r.step.as_str())
            .collect()
    }
}
