use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;
use warden_core::{
    NewProposal, ProposalSource, ProposedChange, Record, RecordId, Result, Tier, TierArtifact,
};

use crate::coordinator::TierProcessor;

const UNCATEGORIZED: &str = "uncategorized";

/// Batches smaller than this never raise a preference proposal.
const MIN_DIGEST_RECORDS: usize = 3;

fn category_of(record: &Record) -> String {
    record.category().unwrap_or(UNCATEGORIZED).to_string()
}

/// Patterns tier: one artifact per payload category in the batch.
///
/// Only object payloads take part; anything else is left unflagged.
#[derive(Debug, Default, Clone)]
pub struct CategoryClusterProcessor;

#[async_trait]
impl TierProcessor for CategoryClusterProcessor {
    fn tier(&self) -> Tier {
        Tier::Patterns
    }

    async fn process(&self, records: &[Record]) -> Result<Vec<TierArtifact>> {
        let mut clusters: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
        for record in records {
            if !record.payload.is_object() {
                debug!(record_id = record.id, "non-object payload left for later");
                continue;
            }
            clusters.entry(category_of(record)).or_default().push(record);
        }

        Ok(clusters
            .into_iter()
            .map(|(category, members)| {
                let sources: Vec<RecordId> = members.iter().map(|r| r.id).collect();
                let mut by_source: BTreeMap<&str, usize> = BTreeMap::new();
                for r in &members {
                    *by_source.entry(r.source.as_str()).or_default() += 1;
                }
                let content = json!({
                    "category": category,
                    "count": members.len(),
                    "by_source": by_source,
                    "first_seen": members.iter().map(|r| r.created_at).min(),
                    "last_seen": members.iter().map(|r| r.created_at).max(),
                });
                TierArtifact::new(sources, content)
            })
            .collect())
    }
}

/// Synthesis tier: one digest per batch. When a single category makes up
/// at least `dominance_ratio` of the batch, the digest carries a
/// `set_preference` proposal naming it.
#[derive(Debug, Clone)]
pub struct DigestProcessor {
    dominance_ratio: f64,
}

impl DigestProcessor {
    pub fn new(dominance_ratio: f64) -> Self {
        Self {
            dominance_ratio: dominance_ratio.clamp(0.0, 1.0),
        }
    }
}

impl Default for DigestProcessor {
    fn default() -> Self {
        Self::new(0.6)
    }
}

#[async_trait]
impl TierProcessor for DigestProcessor {
    fn tier(&self) -> Tier {
        Tier::Synthesis
    }

    async fn process(&self, records: &[Record]) -> Result<Vec<TierArtifact>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in records {
            *counts.entry(category_of(record)).or_default() += 1;
        }
        let total = records.len();
        // Ties go to the alphabetically first category.
        let (top, top_count) = counts
            .iter()
            .fold(None::<(&String, usize)>, |best, (cat, &n)| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((cat, n)),
            })
            .map(|(c, n)| (c.clone(), n))
            .unwrap_or_else(|| (UNCATEGORIZED.to_string(), 0));
        let share = top_count as f64 / total as f64;

        let sources: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        let content = json!({
            "record_count": total,
            "categories": counts,
            "dominant": { "category": top, "share": share },
            "range": { "first": sources.first(), "last": sources.last() },
        });
        let mut artifact = TierArtifact::new(sources, content);

        if total >= MIN_DIGEST_RECORDS && top != UNCATEGORIZED && share >= self.dominance_ratio {
            debug!(category = %top, share, "dominant category in digest");
            artifact = artifact.with_proposal(
                NewProposal::new(
                    ProposedChange::SetPreference {
                        category: "focus".into(),
                        key: "dominant_category".into(),
                        value: Value::String(top.clone()),
                        confidence: share,
                    },
                    ProposalSource::Pipeline,
                )
                .with_description(format!(
                    "'{top}' made up {top_count} of {total} synthesized records"
                ))
                .with_confidence(share),
            );
        }
        Ok(vec![artifact])
    }
}
