use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::{
    AdvanceReport, AuditEntry, AuditLog, AuditSubject, Event, EventBus, PipelineStore, Proposal,
    Record, RecordId, Result, Tier, TierArtifact, WardenError,
};
use warden_governance::ProposalManager;

/// Produces artifacts for one tier from a leased batch.
///
/// An artifact's `sources` are the records it incorporates; records that
/// appear in no artifact stay pending for a later advance.
#[async_trait]
pub trait TierProcessor: Send + Sync {
    fn tier(&self) -> Tier;

    async fn process(&self, records: &[Record]) -> Result<Vec<TierArtifact>>;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub lease_secs: i64,
    pub processor_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease_secs: 300,
            processor_timeout: Duration::from_secs(120),
        }
    }
}

pub struct PipelineCoordinator {
    store: Arc<dyn PipelineStore>,
    proposals: Arc<ProposalManager>,
    audit: Arc<dyn AuditLog>,
    events: EventBus,
    processors: HashMap<Tier, Arc<dyn TierProcessor>>,
    settings: PipelineSettings,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        proposals: Arc<ProposalManager>,
        audit: Arc<dyn AuditLog>,
        events: EventBus,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            proposals,
            audit,
            events,
            processors: HashMap::new(),
            settings,
        }
    }

    /// Install the processor for its tier, replacing any earlier one.
    pub fn register(&mut self, processor: Arc<dyn TierProcessor>) {
        let tier = processor.tier();
        debug!(tier = %tier, "tier processor registered");
        self.processors.insert(tier, processor);
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Tier 1: collect a raw record.
    pub fn ingest(&self, payload: Value, source: &str) -> Result<RecordId> {
        if source.trim().is_empty() {
            return Err(WardenError::InvalidParams {
                operation: "ingest".into(),
                reason: "source must not be empty".into(),
            });
        }
        let id = self.store.insert_record(&payload, source)?;
        debug!(record_id = id, source, "record ingested");
        self.events.publish(Event::RecordIngested { record_id: id });
        Ok(id)
    }

    pub fn pending(&self, tier: Tier) -> Result<usize> {
        self.store.pending_count(tier)
    }

    /// Run one batch of `tier`.
    ///
    /// Artifacts are committed one transaction each. An artifact whose lease
    /// was lost is rolled back and counted as stale; the rest still commit.
    /// A processor error or timeout releases the whole batch and is returned.
    pub async fn advance(&self, tier: Tier) -> Result<AdvanceReport> {
        let processor = self
            .processors
            .get(&tier)
            .cloned()
            .ok_or_else(|| WardenError::NoProcessor(tier.to_string()))?;

        let token = Uuid::new_v4().to_string();
        let records = self
            .store
            .claim_batch(tier, self.settings.batch_size, self.settings.lease_secs, &token)?;
        let mut report = AdvanceReport::empty(tier);
        report.claimed = records.len();
        if records.is_empty() {
            debug!(tier = %tier, "nothing pending");
            return Ok(report);
        }
        info!(tier = %tier, claimed = records.len(), "tier batch claimed");

        let artifacts = match tokio::time::timeout(self.settings.processor_timeout, processor.process(&records)).await {
            Ok(Ok(artifacts)) => artifacts,
            Ok(Err(e)) => {
                self.abandon(tier, &token, &e.to_string())?;
                return Err(e);
            }
            Err(_) => {
                let reason = format!(
                    "processor timed out after {}s",
                    self.settings.processor_timeout.as_secs_f64()
                );
                self.abandon(tier, &token, &reason)?;
                return Err(WardenError::StepExecution {
                    step: format!("{tier} processor"),
                    reason,
                });
            }
        };

        for artifact in artifacts {
            if artifact.sources.is_empty() {
                warn!(tier = %tier, "processor returned an artifact without sources, ignoring");
                continue;
            }
            let proposals: Vec<Proposal> = artifact
                .proposals
                .iter()
                .cloned()
                .map(|p| p.into_proposal(Utc::now()))
                .collect();

            match self.store.commit_artifact(tier, &token, &artifact, &proposals) {
                Ok(commit) => {
                    if commit.output_written {
                        report.artifacts_written += 1;
                    } else {
                        report.artifacts_deduplicated += 1;
                        debug!(tier = %tier, output_id = commit.output_id, "output already present, flags only");
                    }
                    report.records_flagged += commit.records_flagged;
                    report.proposals_raised += proposals.len();
                    for proposal in &proposals {
                        self.proposals.announce_created(proposal);
                    }
                }
                Err(WardenError::StaleClaim { record_id, .. }) => {
                    warn!(tier = %tier, record_id, "lease lost before commit, artifact rolled back");
                    report.stale_artifacts += 1;
                }
                Err(e) => {
                    self.abandon(tier, &token, &e.to_string())?;
                    return Err(e);
                }
            }
        }

        report.released = self.store.release_claims(tier, &token)?;
        info!(
            tier = %tier,
            written = report.artifacts_written,
            deduplicated = report.artifacts_deduplicated,
            flagged = report.records_flagged,
            stale = report.stale_artifacts,
            released = report.released,
            "tier advanced"
        );
        self.record(tier, "advanced", json!(report));
        self.events.publish(Event::TierAdvanced {
            tier,
            artifacts: report.artifacts_written + report.artifacts_deduplicated,
            records_flagged: report.records_flagged,
        });
        Ok(report)
    }

    fn abandon(&self, tier: Tier, token: &str, error: &str) -> Result<()> {
        let released = self.store.release_claims(tier, token)?;
        warn!(tier = %tier, released, error, "tier advance failed, claims released");
        self.record(tier, "failed", json!({ "error": error, "released": released }));
        Ok(())
    }

    fn record(&self, tier: Tier, event: &str, details: Value) {
        if let Err(e) = self
            .audit
            .append(AuditEntry::new(AuditSubject::Pipeline, tier.as_str(), event, details))
        {
            warn!(tier = %tier, error = %e, "failed to audit pipeline advance");
        }
    }
}
