use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_config::WardenConfig;
use warden_core::{
    ActionDescriptor, AdvanceReport, ApplyOutcome, AuditEntry, AuditLog, AuditSubject, BoundaryRule,
    Effect, Event, EventBus, HumanDecision, NewBoundaryRule, NewProposal, PolicyStore, Proposal,
    ProposalKind, ProposalSource, ProposalStatus, ProposedChange, RecordId, Result, Tier,
    WardenError, WorkflowDefinition, WorkflowRun, WorkflowStore,
};
use warden_governance::{
    EvaluatorSettings, InterpreterSettings, PolicyEvaluator, ProposalManager, WorkflowInterpreter,
};
use warden_pipeline::{CategoryClusterProcessor, DigestProcessor, PipelineCoordinator, PipelineSettings};
use warden_store::SqliteStore;

use crate::handlers::store_backed_registry;
use crate::trigger::{Command, Trigger, TriggerOutcome};

/// Result of a rule create/deactivate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum RuleAuthoring {
    /// `policy.direct_authoring` is on; the rule set changed immediately.
    Direct { rule: BoundaryRule },
    /// The change awaits a human decision.
    Proposed { proposal: Proposal },
}

/// Result of [`Warden::submit_change`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub proposal: Proposal,
    pub effect: Effect,
    pub reason: String,
    /// Present when an explicit allow rule let the change apply at once.
    pub applied: Option<ApplyOutcome>,
}

/// A run executing in this process; deregistered when dropped.
struct Registration<'a> {
    running: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
    token: CancellationToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.run_id);
    }
}

/// The assembled system: one store, one evaluator, one proposal manager,
/// the interpreter and the pipeline, all sharing an event bus.
pub struct Warden {
    config: WardenConfig,
    store: SqliteStore,
    events: EventBus,
    evaluator: Arc<PolicyEvaluator>,
    proposals: Arc<ProposalManager>,
    interpreter: Arc<WorkflowInterpreter>,
    pipeline: Arc<PipelineCoordinator>,
    /// Runs executing in this process, for cooperative cancel.
    running: DashMap<Uuid, CancellationToken>,
}

impl Warden {
    /// Open the configured database and assemble the components.
    pub fn open(config: WardenConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.store.db_path)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: WardenConfig, store: SqliteStore) -> Result<Self> {
        let events = EventBus::default();
        let shared = Arc::new(store.clone());

        let evaluator = Arc::new(PolicyEvaluator::new(
            shared.clone(),
            shared.clone(),
            events.clone(),
            EvaluatorSettings {
                cache_ttl_secs: config.policy.cache_ttl_secs,
                evaluation_timeout: Duration::from_millis(config.policy.evaluation_timeout_ms),
                default_effect: config.policy.default_effect,
            },
        ));
        let proposals = Arc::new(ProposalManager::new(shared.clone(), shared.clone(), events.clone()));

        let registry = store_backed_registry(
            shared.clone(),
            shared.clone(),
            Duration::from_secs(config.workflow.max_wait_secs),
        );
        let interpreter = Arc::new(WorkflowInterpreter::new(
            Arc::new(registry),
            Arc::clone(&evaluator),
            Arc::clone(&proposals),
            shared.clone(),
            shared.clone(),
            events.clone(),
            InterpreterSettings {
                max_retries: config.workflow.max_retries,
                handler_timeout: Duration::from_secs(config.workflow.handler_timeout_secs),
            },
        ));

        let mut pipeline = PipelineCoordinator::new(
            shared.clone(),
            Arc::clone(&proposals),
            shared,
            events.clone(),
            PipelineSettings {
                batch_size: config.pipeline.batch_size,
                lease_secs: config.pipeline.lease_secs,
                processor_timeout: Duration::from_secs(config.pipeline.processor_timeout_secs),
            },
        );
        pipeline.register(Arc::new(CategoryClusterProcessor));
        pipeline.register(Arc::new(DigestProcessor::new(config.pipeline.dominance_ratio)));

        let warden = Self {
            config,
            store,
            events,
            evaluator,
            proposals,
            interpreter,
            pipeline: Arc::new(pipeline),
            running: DashMap::new(),
        };

        if let Some(dir) = warden.config.workflow.definitions_dir.clone() {
            let loaded = warden.load_definitions(&dir)?;
            info!(dir = %dir.display(), loaded, "workflow definitions loaded");
        }
        Ok(warden)
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn evaluator(&self) -> &Arc<PolicyEvaluator> {
        &self.evaluator
    }

    pub fn proposals(&self) -> &Arc<ProposalManager> {
        &self.proposals
    }

    pub fn interpreter(&self) -> &Arc<WorkflowInterpreter> {
        &self.interpreter
    }

    pub fn pipeline(&self) -> &Arc<PipelineCoordinator> {
        &self.pipeline
    }

    /// Pick up settings that can change without a restart.
    pub fn apply_reloaded(&self, config: &WardenConfig) {
        if config.policy.cache_ttl_secs != self.evaluator.cache_ttl_secs() {
            self.evaluator.set_cache_ttl(config.policy.cache_ttl_secs);
        }
        self.events.publish(Event::ConfigReloaded {
            timestamp: chrono::Utc::now(),
        });
    }

    /// Clear the decision cache whenever a boundary-rule proposal is applied
    /// or reverted. Must be called inside a Tokio runtime.
    pub fn spawn_cache_invalidator(&self) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let evaluator = Arc::clone(&self.evaluator);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::ProposalTransitioned {
                        proposal_id,
                        kind: ProposalKind::AddBoundaryRule | ProposalKind::DeactivateBoundaryRule,
                        status: ProposalStatus::Applied | ProposalStatus::Reverted,
                    }) => {
                        debug!(proposal_id = %proposal_id, "boundary rules changed");
                        evaluator.clear_cache();
                    }
                    Ok(Event::Shutdown) => return,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Missed events may have been rule changes.
                        warn!(missed = n, "event subscriber lagged, clearing policy cache");
                        evaluator.clear_cache();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    // ── Triggers ───────────────────────────────────────────────

    pub async fn dispatch(&self, trigger: Trigger) -> Result<TriggerOutcome> {
        info!(
            trigger_id = %trigger.trigger_id,
            kind = ?trigger.kind,
            target = %trigger.target_ref,
            "trigger received"
        );
        let command = trigger.into_command()?;
        self.execute(command).await
    }

    pub async fn execute(&self, command: Command) -> Result<TriggerOutcome> {
        match command {
            Command::RunWorkflow { definition, input } => Ok(TriggerOutcome::Run {
                run: self.run_workflow(&definition, input).await?,
            }),
            Command::ResumeRun { run_id } => Ok(TriggerOutcome::Run {
                run: self.resume(run_id).await?,
            }),
            Command::AdvanceTier { tier } => Ok(TriggerOutcome::Advance {
                report: self.advance(tier).await?,
            }),
        }
    }

    // ── Workflows ──────────────────────────────────────────────

    /// Validate and store a definition written by a human.
    pub fn define_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.interpreter.validate(definition)?;
        self.store.upsert_definition(definition)?;
        info!(workflow = %definition.name, steps = definition.steps.len(), "workflow defined");
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> Result<WorkflowDefinition> {
        self.store
            .get_definition(name)?
            .ok_or_else(|| WardenError::not_found("workflow", name))
    }

    pub fn run_record(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| WardenError::not_found("workflow run", run_id))
    }

    pub async fn run_workflow(&self, name: &str, input: Value) -> Result<WorkflowRun> {
        let definition = self.workflow(name)?;
        let run = WorkflowRun::new(&definition.name, input);
        let registration = self.register(run.id)?;
        self.interpreter
            .execute(&definition, run, registration.token.clone())
            .await
    }

    /// Resume a run. Refused while the run is executing in this process.
    pub async fn resume(&self, run_id: Uuid) -> Result<WorkflowRun> {
        let registration = self.register(run_id)?;
        self.interpreter
            .resume_with_cancel(run_id, registration.token.clone())
            .await
    }

    fn register(&self, run_id: Uuid) -> Result<Registration<'_>> {
        let token = CancellationToken::new();
        match self.running.entry(run_id) {
            Entry::Occupied(_) => Err(WardenError::RunInProgress(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(Registration {
                    running: &self.running,
                    run_id,
                    token,
                })
            }
        }
    }

    /// Cancel a run. A run executing here stops before its next step and
    /// `None` is returned; any other non-terminal run is aborted in place.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        if let Some(token) = self.running.get(&run_id) {
            info!(run_id = %run_id, "cancellation requested");
            token.cancel();
            return Ok(None);
        }
        self.interpreter.cancel(run_id).map(Some)
    }

    pub fn running_runs(&self) -> Vec<Uuid> {
        self.running.iter().map(|e| *e.key()).collect()
    }

    /// Load every `*.json` definition in `dir`. Files that fail to parse or
    /// validate are skipped with a warning.
    pub fn load_definitions(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(WardenError::from)
                .and_then(|raw| WorkflowDefinition::from_json(&raw));
            match parsed.and_then(|def| self.define_workflow(&def)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping workflow definition"),
            }
        }
        Ok(loaded)
    }

    // ── Policy authoring ───────────────────────────────────────

    pub fn author_rule(&self, rule: NewBoundaryRule, author: &str) -> Result<RuleAuthoring> {
        rule.validate()?;
        if !self.config.policy.direct_authoring {
            let description = format!(
                "{author}: {} rule on '{}' => {}",
                rule.rule_type, rule.category, rule.effect
            );
            let proposal = self.proposals.propose(
                NewProposal::new(ProposedChange::AddBoundaryRule { rule }, ProposalSource::Human)
                    .with_description(description),
            )?;
            return Ok(RuleAuthoring::Proposed { proposal });
        }

        let rule = rule.into_rule(chrono::Utc::now());
        self.store.insert_rule(&rule)?;
        self.evaluator.clear_cache();
        info!(rule_id = %rule.id, category = %rule.category, effect = %rule.effect, author, "rule created directly");
        self.audit_rule(rule.id, "created", json!({ "author": author, "rule": rule }));
        Ok(RuleAuthoring::Direct { rule })
    }

    pub fn deactivate_rule(&self, rule_id: Uuid, author: &str) -> Result<RuleAuthoring> {
        let existing = self
            .store
            .get_rule(rule_id)?
            .ok_or_else(|| WardenError::not_found("rule", rule_id))?;
        if !self.config.policy.direct_authoring {
            let proposal = self.proposals.propose(
                NewProposal::new(ProposedChange::DeactivateBoundaryRule { rule_id }, ProposalSource::Human)
                    .with_description(format!("{author}: deactivate rule on '{}'", existing.category)),
            )?;
            return Ok(RuleAuthoring::Proposed { proposal });
        }

        self.store.set_rule_active(rule_id, false)?;
        self.evaluator.clear_cache();
        info!(rule_id = %rule_id, author, "rule deactivated directly");
        self.audit_rule(rule_id, "deactivated", json!({ "author": author }));
        let rule = self
            .store
            .get_rule(rule_id)?
            .ok_or_else(|| WardenError::not_found("rule", rule_id))?;
        Ok(RuleAuthoring::Direct { rule })
    }

    fn audit_rule(&self, rule_id: Uuid, event: &str, details: Value) {
        if let Err(e) = self
            .store
            .append(AuditEntry::new(AuditSubject::Rule, rule_id, event, details))
        {
            warn!(rule_id = %rule_id, error = %e, "failed to audit rule change");
        }
    }

    // ── Proposals ──────────────────────────────────────────────

    /// Raise a self-change and let policy decide whether it needs a human.
    ///
    /// The change is evaluated as an `apply_proposal` action in category
    /// `evolution_<kind>`. Only an allow decision from a matching rule
    /// approves and applies it on the spot; anything else leaves it
    /// `proposed`.
    pub async fn submit_change(&self, new: NewProposal) -> Result<SubmitOutcome> {
        if matches!(new.change, ProposedChange::StepApproval { .. }) {
            return Err(WardenError::InvalidParams {
                operation: "submit_change".into(),
                reason: "step approvals are raised by the workflow interpreter".into(),
            });
        }
        let proposal = self.proposals.propose(new)?;
        let action = ActionDescriptor::new("apply_proposal", proposal.kind.evolution_category())
            .with_target(proposal.id.to_string())
            .with_payload(serde_json::to_value(&proposal.change)?)
            .requested_by(proposal.source.as_str());
        let decision = self.evaluator.evaluate(&action).await?;

        let auto_rule = match (decision.effect, decision.decisive_rule) {
            (Effect::Allow, Some(rule_id)) => rule_id,
            _ => {
                info!(
                    proposal_id = %proposal.id,
                    effect = %decision.effect,
                    "change awaits human decision"
                );
                return Ok(SubmitOutcome {
                    proposal,
                    effect: decision.effect,
                    reason: decision.reason,
                    applied: None,
                });
            }
        };

        self.proposals.decide(
            &HumanDecision::approve(proposal.id, format!("policy:{auto_rule}")).with_notes(decision.reason.clone()),
        )?;
        let (proposal, outcome) = self.proposals.apply(proposal.id)?;
        info!(proposal_id = %proposal.id, rule_id = %auto_rule, "change auto-applied by policy");
        Ok(SubmitOutcome {
            proposal,
            effect: decision.effect,
            reason: decision.reason,
            applied: Some(outcome),
        })
    }

    pub fn decide(&self, decision: &HumanDecision) -> Result<Proposal> {
        self.proposals.decide(decision)
    }

    /// Apply an approved proposal. Step approvals are consumed by resuming
    /// their run instead.
    pub fn apply_proposal(&self, id: Uuid) -> Result<(Proposal, ApplyOutcome)> {
        let proposal = self.proposals.get(id)?;
        if let ProposedChange::StepApproval { run_id, .. } = proposal.change {
            return Err(WardenError::InvalidParams {
                operation: "apply".into(),
                reason: format!("step approval is consumed by resuming run {run_id}"),
            });
        }
        self.proposals.apply(id)
    }

    pub fn revert_proposal(&self, id: Uuid) -> Result<Proposal> {
        self.proposals.revert(id)
    }

    // ── Pipeline ───────────────────────────────────────────────

    pub fn ingest(&self, payload: Value, source: &str) -> Result<RecordId> {
        self.pipeline.ingest(payload, source)
    }

    pub async fn advance(&self, tier: Tier) -> Result<AdvanceReport> {
        self.pipeline.advance(tier).await
    }
}
