use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the entire Warden system.
#[derive(Error, Debug)]
pub enum WardenError {
    // ── Policy errors ──────────────────────────────────────────
    #[error("policy store unavailable: {0}")]
    PolicyUnavailable(String),

    #[error("invalid action descriptor: {0}")]
    InvalidAction(String),

    // ── Workflow errors ────────────────────────────────────────
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("invalid params for {operation}: {reason}")]
    InvalidParams { operation: String, reason: String },

    #[error("step execution failed: {step}: {reason}")]
    StepExecution { step: String, reason: String },

    #[error("workflow run {0} is being driven elsewhere")]
    RunInProgress(Uuid),

    #[error("workflow run {0} changed since it was loaded")]
    StaleRun(Uuid),

    // ── Lifecycle errors ───────────────────────────────────────
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("proposal {id} is not approved (status: {status})")]
    NotApproved { id: Uuid, status: String },

    #[error("proposal {0} was already applied")]
    AlreadyApplied(Uuid),

    // ── Pipeline errors ────────────────────────────────────────
    #[error("stale claim on record {record_id} for tier {tier}")]
    StaleClaim { record_id: i64, tier: String },

    #[error("no processor registered for tier {0}")]
    NoProcessor(String),

    // ── Storage errors ─────────────────────────────────────────
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("store error: {0}")]
    Store(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl WardenError {
    /// Stable machine-readable code, surfaced to callers and written to the audit log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PolicyUnavailable(_) => "policy_unavailable",
            Self::InvalidAction(_) => "invalid_action",
            Self::UnknownCapability(_) => "unknown_capability",
            Self::InvalidParams { .. } => "invalid_params",
            Self::StepExecution { .. } => "step_execution_failure",
            Self::RunInProgress(_) => "run_in_progress",
            Self::StaleRun(_) => "stale_run",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotApproved { .. } => "not_approved",
            Self::AlreadyApplied(_) => "already_applied",
            Self::StaleClaim { .. } => "stale_claim",
            Self::NoProcessor(_) => "no_processor",
            Self::NotFound { .. } => "not_found",
            Self::Store(_) => "store_error",
            Self::Config(_) | Self::ConfigValidation { .. } => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "internal_error",
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
