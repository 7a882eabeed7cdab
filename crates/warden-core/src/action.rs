use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Result, WardenError};

/// An action the agent wants to take, described for policy evaluation.
///
/// Constructed per evaluation call and never persisted on its own; decisions
/// and proposals embed a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// What is being done, e.g. "create_record", "pay_invoice".
    pub kind: String,
    /// Policy category, e.g. "financial", "communication".
    pub category: String,
    /// What the action operates on (an address, a record name, a path).
    #[serde(default)]
    pub target: String,
    /// Action parameters as supplied by the caller.
    #[serde(default)]
    pub payload: Value,
    /// Who asked for it ("workflow:<name>", "pipeline", a user id).
    #[serde(default)]
    pub requested_by: String,
}

/// Stable hash of an action's defining fields, used as the decision cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ActionDescriptor {
    pub fn new(kind: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            category: category.into(),
            target: String::new(),
            payload: Value::Null,
            requested_by: String::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn requested_by(mut self, who: impl Into<String>) -> Self {
        self.requested_by = who.into();
        self
    }

    /// Reject descriptors the evaluator cannot reason about.
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(WardenError::InvalidAction("kind must not be empty".into()));
        }
        if self.category.trim().is_empty() {
            return Err(WardenError::InvalidAction("category must not be empty".into()));
        }
        Ok(())
    }

    /// BLAKE3 over the canonical JSON encoding of every field.
    ///
    /// `serde_json::Value` objects are backed by a sorted map, so two payloads
    /// with the same keys in a different insertion order hash identically.
    pub fn fingerprint(&self) -> Fingerprint {
        let canonical = serde_json::json!([
            self.kind,
            self.category,
            self.target,
            self.payload,
            self.requested_by,
        ]);
        let hash = blake3::hash(canonical.to_string().as_bytes());
        Fingerprint(hash.to_hex().to_string())
    }
}
