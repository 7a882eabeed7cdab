//! # warden-core
//!
//! Core types, store traits, and primitives for the Warden policy-governed
//! action system. This crate defines the shared vocabulary used by every other
//! crate in the workspace: boundary rules and decisions, workflow definitions
//! and runs, proposals, pipeline records, and the append-only audit trail.

pub mod action;
pub mod audit;
pub mod error;
pub mod event;
pub mod policy;
pub mod proposal;
pub mod record;
pub mod store;
pub mod workflow;

pub use action::{ActionDescriptor, Fingerprint};
pub use audit::{AuditEntry, AuditRecord, AuditSubject};
pub use error::{Result, WardenError};
pub use event::{Event, EventBus};
pub use policy::{BoundaryRule, Effect, NewBoundaryRule, PolicyDecision, Predicate, RuleMatch, RuleType};
pub use proposal::{
    HumanDecision, NewProposal, Proposal, ProposalKind, ProposalSource, ProposalStats,
    ProposalStatus, ProposedChange,
};
pub use record::{AdvanceReport, Record, StageFlags, Tier, TierArtifact, TierOutput};
pub use store::{
    ApplyOutcome, ArtifactCommit, AuditLog, Entity, EntityStore, PipelineStore, PolicyStore,
    Preference, PreferenceStore, ProposalStore, WorkflowStore,
};
pub use workflow::{
    AbortReason, OnFailure, Operation, RunStatus, SideEffectClass, Step, StepOutcome, StepResult,
    WorkflowDefinition, WorkflowRun,
};

/// Unique identifier for a boundary rule.
pub type RuleId = uuid::Uuid;

/// Unique identifier for a workflow run.
pub type RunId = uuid::Uuid;

/// Unique identifier for a proposal.
pub type ProposalId = uuid::Uuid;

/// Pipeline records use the store's integer row id.
pub type RecordId = i64;
