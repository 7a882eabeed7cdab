//! Persistence seams. Every component receives its store explicitly; the
//! SQLite implementation lives in `warden-store`.
//!
//! The traits are synchronous. Async callers either hold the lock briefly
//! or move the call onto a blocking worker (the policy evaluator does the
//! latter so it can bound the read with a timeout).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::RecordId;
use crate::audit::{AuditEntry, AuditRecord};
use crate::error::Result;
use crate::policy::BoundaryRule;
use crate::proposal::{Proposal, ProposalStatus};
use crate::record::{Record, Tier, TierArtifact, TierOutput};
use crate::workflow::{WorkflowDefinition, WorkflowRun};

pub trait PolicyStore: Send + Sync {
    /// Active rules whose category is `category` or `all`. Expiry is left to
    /// the caller, which knows the evaluation instant.
    fn active_rules(&self, category: &str) -> Result<Vec<BoundaryRule>>;

    /// Insert-or-ignore by rule id. Returns whether a row was written.
    fn insert_rule(&self, rule: &BoundaryRule) -> Result<bool>;

    /// Flip the `active` flag. Returns whether the row changed.
    fn set_rule_active(&self, id: Uuid, active: bool) -> Result<bool>;

    fn get_rule(&self, id: Uuid) -> Result<Option<BoundaryRule>>;

    fn list_rules(&self, include_inactive: bool) -> Result<Vec<BoundaryRule>>;
}

pub trait WorkflowStore: Send + Sync {
    fn upsert_definition(&self, definition: &WorkflowDefinition) -> Result<()>;

    fn get_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>>;

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Persist the run, compare-and-set on `run.version`.
    ///
    /// A run at version 0 is inserted. Otherwise the stored row must still be
    /// `running` at the same version. On success `run.version` is bumped; on
    /// a lost race it is left alone and `StaleRun` is returned.
    fn save_run(&self, run: &mut WorkflowRun) -> Result<()>;

    fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRun>>;

    /// Most recently started first.
    fn list_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>>;
}

/// What applying a proposal did to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ApplyOutcome {
    RuleAdded { rule_id: Uuid, inserted: bool },
    RuleDeactivated { rule_id: Uuid, changed: bool },
    WorkflowUpserted { name: String },
    PreferenceSet { category: String, key: String },
    /// Step approvals write nothing; application only consumes them.
    StepApprovalConsumed { run_id: Uuid, step_index: usize },
}

pub trait ProposalStore: Send + Sync {
    fn insert_proposal(&self, proposal: &Proposal) -> Result<()>;

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>>;

    /// Oldest first. `None` lists every status.
    fn list_proposals(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>>;

    /// Compare-and-set the decision. Returns `false` if the proposal was not
    /// in `from` any more.
    fn record_decision(
        &self,
        id: Uuid,
        from: ProposalStatus,
        to: ProposalStatus,
        decided_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Apply an approved proposal in a single transaction: write the
    /// application row (unique per proposal), move the status to `applied`
    /// and perform the target-side effect.
    ///
    /// Fails with `AlreadyApplied` if an application row exists and with
    /// `NotApproved` if the proposal is in any other status.
    fn apply_approved(&self, id: Uuid, at: DateTime<Utc>) -> Result<ApplyOutcome>;

    /// Move `applied → reverted`, undoing rule changes in the same
    /// transaction. Returns `false` if the proposal was not applied.
    fn revert_applied(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    fn proposal_counts(&self) -> Result<Vec<(ProposalStatus, usize)>>;
}

/// A learned preference, written by `set_preference` proposals and the
/// `update_preference` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub category: String,
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

pub trait PreferenceStore: Send + Sync {
    /// Upsert by `(category, key)`.
    fn set_preference(
        &self,
        category: &str,
        key: &str,
        value: &Value,
        confidence: f64,
        source: &str,
    ) -> Result<()>;

    fn get_preference(&self, category: &str, key: &str) -> Result<Option<Preference>>;

    fn list_preferences(&self, category: Option<&str>) -> Result<Vec<Preference>>;
}

/// A structured record created by the `create_record` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub kind: String,
    pub name: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

pub trait EntityStore: Send + Sync {
    fn create_entity(&self, kind: &str, name: &str, data: &Value) -> Result<Entity>;

    /// Entities of `kind`, optionally filtered by a case-insensitive name
    /// substring. Newest first.
    fn query_entities(&self, kind: &str, name_contains: Option<&str>, limit: usize)
    -> Result<Vec<Entity>>;
}

/// Result of committing one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactCommit {
    pub output_id: i64,
    /// False when the output key already existed.
    pub output_written: bool,
    pub records_flagged: usize,
    pub proposal_ids: Vec<Uuid>,
}

pub trait PipelineStore: Send + Sync {
    /// Tier 1: collect a raw record.
    fn insert_record(&self, payload: &Value, source: &str) -> Result<RecordId>;

    fn get_record(&self, id: RecordId) -> Result<Option<Record>>;

    /// Lease up to `limit` records whose flag for `tier` is unset and which
    /// carry no live claim. Records are returned in id order.
    fn claim_batch(
        &self,
        tier: Tier,
        limit: usize,
        lease_secs: i64,
        token: &str,
    ) -> Result<Vec<Record>>;

    /// Persist one artifact in its own transaction: insert the output keyed
    /// by its `output_key` (ignoring a duplicate), set the tier flag for its
    /// sources and store carried proposals. Any source not held by `token`
    /// yields `StaleClaim` and nothing is written.
    fn commit_artifact(
        &self,
        tier: Tier,
        token: &str,
        artifact: &TierArtifact,
        proposals: &[Proposal],
    ) -> Result<ArtifactCommit>;

    /// Drop every claim held by `token` for `tier`.
    fn release_claims(&self, tier: Tier, token: &str) -> Result<usize>;

    /// Write an output row without touching flags or claims. Returns false
    /// if the key already existed.
    fn insert_tier_output(&self, tier: Tier, artifact: &TierArtifact) -> Result<bool>;

    fn tier_outputs(&self, tier: Tier) -> Result<Vec<TierOutput>>;

    /// Records whose flag for `tier` is still unset.
    fn pending_count(&self, tier: Tier) -> Result<usize>;
}

pub trait AuditLog: Send + Sync {
    /// Stamp, checksum and append.
    fn append(&self, entry: AuditEntry) -> Result<AuditRecord>;

    /// Oldest first.
    fn for_subject(&self, subject_id: &str) -> Result<Vec<AuditRecord>>;

    /// Newest first.
    fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>>;
}
