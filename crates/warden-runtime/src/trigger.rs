//! Upstream triggers and the typed commands they become.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use warden_core::{AdvanceReport, Result, Tier, WardenError, WorkflowRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Workflow,
    PipelineAdvance,
    Resume,
}

/// One line of trigger input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: String,
    pub kind: TriggerKind,
    /// Workflow name, tier, or run id depending on `kind`.
    pub target_ref: String,
    #[serde(default)]
    pub payload: Value,
}

impl Trigger {
    pub fn new(trigger_id: impl Into<String>, kind: TriggerKind, target_ref: impl Into<String>) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            kind,
            target_ref: target_ref.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Each trigger maps to exactly one command.
    pub fn into_command(self) -> Result<Command> {
        let target = self.target_ref.trim();
        if target.is_empty() {
            return Err(WardenError::InvalidParams {
                operation: "trigger".into(),
                reason: format!("trigger {} has an empty target_ref", self.trigger_id),
            });
        }
        Ok(match self.kind {
            TriggerKind::Workflow => Command::RunWorkflow {
                definition: target.to_string(),
                input: self.payload,
            },
            TriggerKind::PipelineAdvance => Command::AdvanceTier {
                tier: target.parse()?,
            },
            TriggerKind::Resume => Command::ResumeRun {
                run_id: target.parse().map_err(|_| WardenError::InvalidParams {
                    operation: "trigger".into(),
                    reason: format!("'{target}' is not a run id"),
                })?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RunWorkflow { definition: String, input: Value },
    AdvanceTier { tier: Tier },
    ResumeRun { run_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Run { run: WorkflowRun },
    Advance { report: AdvanceReport },
}

/// What `serve` writes back for each trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerReport {
    pub trigger_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TriggerOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TriggerReport {
    pub fn from_result(trigger_id: String, result: Result<TriggerOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                trigger_id,
                ok: true,
                outcome: Some(outcome),
                error_code: None,
                error: None,
            },
            Err(e) => Self {
                trigger_id,
                ok: false,
                outcome: None,
                error_code: Some(e.code().to_string()),
                error: Some(e.to_string()),
            },
        }
    }
}
