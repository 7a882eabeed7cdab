use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WardenError};

/// What an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSubject {
    PolicyDecision,
    WorkflowRun,
    Proposal,
    Pipeline,
    Rule,
}

impl AuditSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyDecision => "policy_decision",
            Self::WorkflowRun => "workflow_run",
            Self::Proposal => "proposal",
            Self::Pipeline => "pipeline",
            Self::Rule => "rule",
        }
    }
}

impl fmt::Display for AuditSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditSubject {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "policy_decision" => Ok(Self::PolicyDecision),
            "workflow_run" => Ok(Self::WorkflowRun),
            "proposal" => Ok(Self::Proposal),
            "pipeline" => Ok(Self::Pipeline),
            "rule" => Ok(Self::Rule),
            other => Err(WardenError::Store(format!("unknown audit subject '{other}'"))),
        }
    }
}

/// An audit entry before it is stamped and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub subject_kind: AuditSubject,
    pub subject_id: String,
    pub event: String,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(
        subject_kind: AuditSubject,
        subject_id: impl ToString,
        event: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            subject_kind,
            subject_id: subject_id.to_string(),
            event: event.into(),
            details,
        }
    }
}

/// A persisted, checksummed audit entry. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub subject_kind: AuditSubject,
    pub subject_id: String,
    pub event: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

impl AuditRecord {
    /// BLAKE3 over `timestamp:subject_kind:subject_id:event:details`.
    pub fn compute_checksum(
        timestamp: &str,
        subject_kind: AuditSubject,
        subject_id: &str,
        event: &str,
        details: &str,
    ) -> String {
        let input = format!("{timestamp}:{subject_kind}:{subject_id}:{event}:{details}");
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }

    /// Recompute the checksum from the stored fields.
    pub fn verify(&self) -> bool {
        let expected = Self::compute_checksum(
            &self.timestamp.to_rfc3339(),
            self.subject_kind,
            &self.subject_id,
            &self.event,
            &self.details.to_string(),
        );
        expected == self.checksum
    }
}
