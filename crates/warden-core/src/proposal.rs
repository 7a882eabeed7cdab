use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::action::ActionDescriptor;
use crate::error::{Result, WardenError};
use crate::policy::NewBoundaryRule;
use crate::workflow::WorkflowDefinition;

/// Lifecycle state of a proposal.
///
/// ```text
/// proposed ──► approved ──► applied ──► reverted
///     │
///     └──────► rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Approved,
    Rejected,
    Applied,
    Reverted,
}

impl ProposalStatus {
    pub const ALL: [ProposalStatus; 5] = [
        Self::Proposed,
        Self::Approved,
        Self::Rejected,
        Self::Applied,
        Self::Reverted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
            Self::Reverted => "reverted",
        }
    }

    /// The only legal edges of the state machine.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Approved)
                | (Self::Proposed, Self::Rejected)
                | (Self::Approved, Self::Applied)
                | (Self::Applied, Self::Reverted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Reverted)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| WardenError::Store(format!("unknown proposal status '{s}'")))
    }
}

/// The change a proposal would make once applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposedChange {
    AddBoundaryRule {
        rule: NewBoundaryRule,
    },
    DeactivateBoundaryRule {
        rule_id: Uuid,
    },
    UpsertWorkflow {
        definition: WorkflowDefinition,
    },
    SetPreference {
        category: String,
        key: String,
        value: Value,
        confidence: f64,
    },
    /// Human sign-off for a single suspended workflow step.
    StepApproval {
        run_id: Uuid,
        step_index: usize,
        step: String,
        action: ActionDescriptor,
    },
}

impl ProposedChange {
    pub fn kind(&self) -> ProposalKind {
        match self {
            Self::AddBoundaryRule { .. } => ProposalKind::AddBoundaryRule,
            Self::DeactivateBoundaryRule { .. } => ProposalKind::DeactivateBoundaryRule,
            Self::UpsertWorkflow { .. } => ProposalKind::UpsertWorkflow,
            Self::SetPreference { .. } => ProposalKind::SetPreference,
            Self::StepApproval { .. } => ProposalKind::StepApproval,
        }
    }

    /// Whether applying this change alters the boundary rule set.
    pub fn touches_boundaries(&self) -> bool {
        matches!(
            self,
            Self::AddBoundaryRule { .. } | Self::DeactivateBoundaryRule { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    AddBoundaryRule,
    DeactivateBoundaryRule,
    UpsertWorkflow,
    SetPreference,
    StepApproval,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddBoundaryRule => "add_boundary_rule",
            Self::DeactivateBoundaryRule => "deactivate_boundary_rule",
            Self::UpsertWorkflow => "upsert_workflow",
            Self::SetPreference => "set_preference",
            Self::StepApproval => "step_approval",
        }
    }

    /// Policy category consulted when the agent wants to apply this kind
    /// without a human in the loop.
    pub fn evolution_category(&self) -> String {
        format!("evolution_{}", self.as_str())
    }
}

impl fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who raised the proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    Human,
    Agent,
    Workflow,
    Pipeline,
}

impl ProposalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
            Self::Workflow => "workflow",
            Self::Pipeline => "pipeline",
        }
    }
}

impl FromStr for ProposalSource {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            "workflow" => Ok(Self::Workflow),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(WardenError::Store(format!("unknown proposal source '{other}'"))),
        }
    }
}

/// Input for raising a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProposal {
    pub change: ProposedChange,
    pub description: String,
    pub source: ProposalSource,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl NewProposal {
    pub fn new(change: ProposedChange, source: ProposalSource) -> Self {
        Self {
            change,
            description: String::new(),
            source,
            confidence: 1.0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn into_proposal(self, created_at: DateTime<Utc>) -> Proposal {
        Proposal {
            id: Uuid::new_v4(),
            kind: self.change.kind(),
            change: self.change,
            description: self.description,
            source: self.source,
            confidence: self.confidence,
            status: ProposalStatus::Proposed,
            decided_by: None,
            decided_at: None,
            notes: None,
            applied_at: None,
            reverted_at: None,
            created_at,
        }
    }
}

/// A candidate change awaiting (or past) human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub kind: ProposalKind,
    pub change: ProposedChange,
    pub description: String,
    pub source: ProposalSource,
    pub confidence: f64,
    pub status: ProposalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub reverted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A human's verdict on a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub proposal_id: Uuid,
    pub approved: bool,
    pub decided_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl HumanDecision {
    pub fn approve(proposal_id: Uuid, decided_by: impl Into<String>) -> Self {
        Self {
            proposal_id,
            approved: true,
            decided_by: decided_by.into(),
            notes: None,
        }
    }

    pub fn reject(proposal_id: Uuid, decided_by: impl Into<String>) -> Self {
        Self {
            proposal_id,
            approved: false,
            decided_by: decided_by.into(),
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn target_status(&self) -> ProposalStatus {
        if self.approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        }
    }
}

/// Counts by status plus the share of decided proposals that were approved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalStats {
    pub total: usize,
    pub proposed: usize,
    pub approved: usize,
    pub rejected: usize,
    pub applied: usize,
    pub reverted: usize,
    pub approval_rate: f64,
}

impl ProposalStats {
    /// Build from `(status, count)` pairs.
    pub fn from_counts(counts: impl IntoIterator<Item = (ProposalStatus, usize)>) -> Self {
        let mut stats = Self::default();
        for (status, n) in counts {
            match status {
                ProposalStatus::Proposed => stats.proposed += n,
                ProposalStatus::Approved => stats.approved += n,
                ProposalStatus::Rejected => stats.rejected += n,
                ProposalStatus::Applied => stats.applied += n,
                ProposalStatus::Reverted => stats.reverted += n,
            }
            stats.total += n;
        }
        // Applied and reverted proposals were approved first.
        let approved_ever = stats.approved + stats.applied + stats.reverted;
        let decided = approved_ever + stats.rejected;
        stats.approval_rate = if decided == 0 {
            0.0
        } else {
            approved_ever as f64 / decided as f64
        };
        stats
    }
}
