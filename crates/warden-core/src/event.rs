use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::policy::Effect;
use crate::proposal::{ProposalKind, ProposalStatus};
use crate::record::Tier;
use crate::workflow::RunStatus;

/// Events flowing through the system, mirrored from the audit trail for
/// in-process subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    // ── Policy ─────────────────────────────────────────────────
    PolicyDecided {
        decision_id: Uuid,
        category: String,
        effect: Effect,
    },
    PolicyUnavailable {
        category: String,
        error: String,
    },
    PolicyCacheCleared,

    // ── Workflow runs ──────────────────────────────────────────
    RunStarted {
        run_id: Uuid,
        definition: String,
    },
    StepCompleted {
        run_id: Uuid,
        step: String,
        outcome: String,
    },
    RunSuspended {
        run_id: Uuid,
        proposal_id: Uuid,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },

    // ── Proposals ──────────────────────────────────────────────
    ProposalCreated {
        proposal_id: Uuid,
        kind: ProposalKind,
    },
    ProposalTransitioned {
        proposal_id: Uuid,
        kind: ProposalKind,
        status: ProposalStatus,
    },

    // ── Pipeline ───────────────────────────────────────────────
    RecordIngested {
        record_id: i64,
    },
    TierAdvanced {
        tier: Tier,
        artifacts: usize,
        records_flagged: usize,
    },

    // ── System ─────────────────────────────────────────────────
    ConfigReloaded {
        timestamp: DateTime<Utc>,
    },
    Shutdown,
}

/// A broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
