use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use warden_core::{
    ApplyOutcome, AuditEntry, AuditLog, AuditSubject, Event, EventBus, HumanDecision, NewProposal,
    Proposal, ProposalStats, ProposalStatus, ProposalStore, Result, WardenError,
};

/// Drives proposals through `proposed → approved|rejected → applied →
/// reverted`. Application is at-most-once; the store enforces it inside the
/// transaction that performs the side effect.
pub struct ProposalManager {
    store: Arc<dyn ProposalStore>,
    audit: Arc<dyn AuditLog>,
    events: EventBus,
}

impl ProposalManager {
    pub fn new(store: Arc<dyn ProposalStore>, audit: Arc<dyn AuditLog>, events: EventBus) -> Self {
        Self { store, audit, events }
    }

    /// Raise a new proposal in status `proposed`.
    pub fn propose(&self, new: NewProposal) -> Result<Proposal> {
        let proposal = new.into_proposal(Utc::now());
        self.store.insert_proposal(&proposal)?;
        info!(
            proposal_id = %proposal.id,
            kind = %proposal.kind,
            source = proposal.source.as_str(),
            "proposal created"
        );
        self.announce_created(&proposal);
        Ok(proposal)
    }

    /// Record audit and events for a proposal persisted elsewhere (pipeline
    /// artifacts store theirs inside the artifact transaction).
    pub fn announce_created(&self, proposal: &Proposal) {
        self.record(
            proposal.id,
            "proposed",
            json!({
                "kind": proposal.kind,
                "source": proposal.source,
                "confidence": proposal.confidence,
                "description": proposal.description,
            }),
        );
        self.events.publish(Event::ProposalCreated {
            proposal_id: proposal.id,
            kind: proposal.kind,
        });
    }

    /// Apply a human decision: `proposed → approved` or `proposed → rejected`.
    pub fn decide(&self, decision: &HumanDecision) -> Result<Proposal> {
        let id = decision.proposal_id;
        let current = self.get(id)?;
        let target = decision.target_status();
        if !current.status.can_transition_to(target) {
            return Err(invalid(id, current.status, target));
        }

        let now = Utc::now();
        let moved = self.store.record_decision(
            id,
            ProposalStatus::Proposed,
            target,
            &decision.decided_by,
            decision.notes.as_deref(),
            now,
        )?;
        if !moved {
            // Someone else decided first.
            let latest = self.get(id)?;
            return Err(invalid(id, latest.status, target));
        }

        info!(proposal_id = %id, status = %target, decided_by = %decision.decided_by, "proposal decided");
        self.record(
            id,
            target.as_str(),
            json!({ "decided_by": decision.decided_by, "notes": decision.notes }),
        );
        let updated = self.get(id)?;
        self.publish_transition(&updated);
        Ok(updated)
    }

    /// `approved → applied`, performing the side effect exactly once.
    pub fn apply(&self, id: Uuid) -> Result<(Proposal, ApplyOutcome)> {
        let outcome = match self.store.apply_approved(id, Utc::now()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(proposal_id = %id, error = %e, "proposal application refused");
                return Err(e);
            }
        };
        info!(proposal_id = %id, outcome = ?outcome, "proposal applied");
        self.record(id, "applied", json!({ "outcome": outcome }));
        let updated = self.get(id)?;
        self.publish_transition(&updated);
        Ok((updated, outcome))
    }

    /// `applied → reverted`. Rule changes are undone; other targets are
    /// rolled back by hand.
    pub fn revert(&self, id: Uuid) -> Result<Proposal> {
        let current = self.get(id)?;
        if current.status != ProposalStatus::Applied {
            return Err(invalid(id, current.status, ProposalStatus::Reverted));
        }
        if !self.store.revert_applied(id, Utc::now())? {
            let latest = self.get(id)?;
            return Err(invalid(id, latest.status, ProposalStatus::Reverted));
        }
        info!(proposal_id = %id, kind = %current.kind, "proposal reverted");
        self.record(
            id,
            "reverted",
            json!({ "target_rolled_back": current.change.touches_boundaries() }),
        );
        let updated = self.get(id)?;
        self.publish_transition(&updated);
        Ok(updated)
    }

    pub fn get(&self, id: Uuid) -> Result<Proposal> {
        self.store
            .get_proposal(id)?
            .ok_or_else(|| WardenError::not_found("proposal", id))
    }

    pub fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>> {
        self.store.list_proposals(status)
    }

    pub fn stats(&self) -> Result<ProposalStats> {
        Ok(ProposalStats::from_counts(self.store.proposal_counts()?))
    }

    fn publish_transition(&self, proposal: &Proposal) {
        self.events.publish(Event::ProposalTransitioned {
            proposal_id: proposal.id,
            kind: proposal.kind,
            status: proposal.status,
        });
    }

    fn record(&self, id: Uuid, event: &str, details: serde_json::Value) {
        if let Err(e) = self
            .audit
            .append(AuditEntry::new(AuditSubject::Proposal, id, event, details))
        {
            warn!(proposal_id = %id, error = %e, "failed to audit proposal transition");
        }
    }
}

fn invalid(id: Uuid, from: ProposalStatus, to: ProposalStatus) -> WardenError {
    WardenError::InvalidTransition {
        id,
        from: from.to_string(),
        to: to.to_string(),
    }
}
