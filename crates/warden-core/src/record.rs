use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::RecordId;
use crate::error::{Result, WardenError};
use crate::proposal::NewProposal;

/// A processing tier after collection. Collection itself (tier 1) is the
/// act of inserting a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Patterns,
    Synthesis,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Self::Patterns, Self::Synthesis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patterns => "patterns",
            Self::Synthesis => "synthesis",
        }
    }

    /// Position in the pipeline, counting collection as 1.
    pub fn number(&self) -> u8 {
        match self {
            Self::Patterns => 2,
            Self::Synthesis => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "patterns" | "2" => Ok(Self::Patterns),
            "synthesis" | "3" => Ok(Self::Synthesis),
            other => Err(WardenError::InvalidParams {
                operation: "pipeline".into(),
                reason: format!("unknown tier '{other}' (expected patterns or synthesis)"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    pub patterns_done: bool,
    pub synthesis_done: bool,
}

impl StageFlags {
    pub fn is_done(&self, tier: Tier) -> bool {
        match tier {
            Tier::Patterns => self.patterns_done,
            Tier::Synthesis => self.synthesis_done,
        }
    }
}

/// A raw input collected by tier 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub payload: Value,
    pub source: String,
    pub stage_flags: StageFlags,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// The `category` field of the payload, if present.
    pub fn category(&self) -> Option<&str> {
        self.payload.get("category").and_then(|c| c.as_str())
    }
}

/// What a tier processor hands back for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierArtifact {
    /// Records this artifact incorporates. Only these get flagged.
    pub sources: Vec<RecordId>,
    pub content: Value,
    /// Proposals raised by this artifact, committed with it.
    #[serde(default)]
    pub proposals: Vec<NewProposal>,
}

impl TierArtifact {
    pub fn new(sources: Vec<RecordId>, content: Value) -> Self {
        Self {
            sources,
            content,
            proposals: Vec::new(),
        }
    }

    pub fn with_proposal(mut self, proposal: NewProposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Sources in ascending order without duplicates.
    pub fn sorted_sources(&self) -> Vec<RecordId> {
        let mut sources = self.sources.clone();
        sources.sort_unstable();
        sources.dedup();
        sources
    }

    /// BLAKE3 over the tier name and the sorted source ids, so a retried
    /// tier maps the same inputs to the same key.
    pub fn output_key(&self, tier: Tier) -> String {
        let ids: Vec<String> = self.sorted_sources().iter().map(|id| id.to_string()).collect();
        let material = format!("{}|{}", tier.as_str(), ids.join(","));
        blake3::hash(material.as_bytes()).to_hex().to_string()
    }
}

/// A persisted tier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierOutput {
    pub id: i64,
    pub tier: Tier,
    pub output_key: String,
    pub sources: Vec<RecordId>,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// Summary of one `advance(tier)` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceReport {
    pub tier: Tier,
    pub claimed: usize,
    pub artifacts_written: usize,
    /// Artifacts whose output already existed from an earlier attempt.
    pub artifacts_deduplicated: usize,
    pub records_flagged: usize,
    pub stale_artifacts: usize,
    pub proposals_raised: usize,
    pub released: usize,
}

impl AdvanceReport {
    pub fn empty(tier: Tier) -> Self {
        Self {
            tier,
            claimed: 0,
            artifacts_written: 0,
            artifacts_deduplicated: 0,
            records_flagged: 0,
            stale_artifacts: 0,
            proposals_raised: 0,
            released: 0,
        }
    }
}
