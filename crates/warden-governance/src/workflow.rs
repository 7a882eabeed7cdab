use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::{
    AbortReason, ActionDescriptor, AuditEntry, AuditLog, AuditSubject, Effect, Event, EventBus,
    NewProposal, OnFailure, Operation, Proposal, ProposalSource, ProposalStatus, ProposedChange,
    Result, RunStatus, Step, StepOutcome, StepResult, WardenError, WorkflowDefinition,
    WorkflowRun, WorkflowStore,
};

use crate::capability::{CapabilityDescriptor, CapabilityRegistry, HandlerOutcome, StepContext};
use crate::policy::PolicyEvaluator;
use crate::proposal::ProposalManager;

/// Reload-and-retry budget for a cancel racing a driver's saves.
const CANCEL_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct InterpreterSettings {
    /// Extra attempts for steps with `on_failure = retry`.
    pub max_retries: u32,
    pub handler_timeout: Duration,
}

impl InterpreterSettings {
    /// How long a driver holds a run between saves: every attempt of the
    /// slowest step plus headroom for policy evaluation.
    pub fn lease(&self) -> Duration {
        self.handler_timeout
            .saturating_mul(self.max_retries.saturating_add(1))
            .saturating_add(Duration::from_secs(60))
    }
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

/// Executes workflow definitions step by step.
///
/// Mutating steps are evaluated against boundary policy first. A
/// `require_approval` decision turns the step into a `step_approval`
/// proposal and suspends the run; it continues only through [`resume`].
///
/// A run has one driver at a time. Within a process the interpreter keeps
/// the set of runs it is driving; across processes every save is a
/// compare-and-set on the run version and a driver holds a lease between
/// saves.
///
/// [`resume`]: WorkflowInterpreter::resume
pub struct WorkflowInterpreter {
    registry: Arc<CapabilityRegistry>,
    evaluator: Arc<PolicyEvaluator>,
    proposals: Arc<ProposalManager>,
    store: Arc<dyn WorkflowStore>,
    audit: Arc<dyn AuditLog>,
    events: EventBus,
    settings: InterpreterSettings,
    active: DashMap<Uuid, ()>,
}

/// What the step loop should do after a step.
enum Flow {
    Next(usize),
    Suspend,
    Abort(AbortReason),
}

/// Marks a run as driven by this interpreter until dropped.
struct ActiveRun<'a> {
    active: &'a DashMap<Uuid, ()>,
    run_id: Uuid,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

impl WorkflowInterpreter {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        evaluator: Arc<PolicyEvaluator>,
        proposals: Arc<ProposalManager>,
        store: Arc<dyn WorkflowStore>,
        audit: Arc<dyn AuditLog>,
        events: EventBus,
        settings: InterpreterSettings,
    ) -> Self {
        Self {
            registry,
            evaluator,
            proposals,
            store,
            audit,
            events,
            settings,
            active: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Whether this interpreter is executing steps of `run_id` right now.
    pub fn is_driving(&self, run_id: Uuid) -> bool {
        self.active.contains_key(&run_id)
    }

    /// Dry run: every step must name an enabled capability with its required
    /// params, and every `skip_to` must name a later step.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        for (index, step) in definition.steps.iter().enumerate() {
            let (descriptor, _) = self.registry.resolve(step.operation)?;
            CapabilityRegistry::check_params(descriptor, &step.params)?;
            if let Some(target) = step.param_str("skip_to") {
                match definition.step_index(target) {
                    Some(t) if t > index => {}
                    _ => {
                        return Err(WardenError::InvalidParams {
                            operation: step.operation.to_string(),
                            reason: format!("step '{}': skip_to '{target}' is not a later step", step.name),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn run(&self, definition: &WorkflowDefinition, input: Value) -> Result<WorkflowRun> {
        self.run_with_cancel(definition, input, CancellationToken::new()).await
    }

    /// Start a new run. The token is checked before every step; steps
    /// already recorded survive a cancel.
    pub async fn run_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun> {
        self.execute(definition, WorkflowRun::new(&definition.name, input), cancel)
            .await
    }

    /// Start a run the caller has already created, so its id can be
    /// registered before the first step executes.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        mut run: WorkflowRun,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun> {
        let _active = self.acquire(run.id)?;
        if run.status != RunStatus::Running || !run.step_results.is_empty() || run.version != 0 {
            return Err(WardenError::InvalidTransition {
                id: run.id,
                from: run.status.to_string(),
                to: RunStatus::Running.to_string(),
            });
        }
        info!(run_id = %run.id, workflow = %definition.name, steps = definition.steps.len(), "workflow run started");
        self.checkpoint(&mut run, true)?;
        self.record(run.id, "started", json!({ "workflow": definition.name }));
        self.events.publish(Event::RunStarted {
            run_id: run.id,
            definition: definition.name.clone(),
        });

        if !definition.enabled {
            let reason = AbortReason::DefinitionDisabled {
                definition: definition.name.clone(),
            };
            let aborted = self.abort(&mut run, reason);
            self.settle(&mut run, aborted)?;
            return Ok(run);
        }

        self.drive(definition, &mut run, &cancel, None).await?;
        Ok(run)
    }

    pub async fn resume(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.resume_with_cancel(run_id, CancellationToken::new()).await
    }

    /// Continue a suspended run once its approval is decided.
    ///
    /// `proposed` leaves the run untouched, `rejected` and `reverted` abort
    /// it, and `approved` is consumed by applying the proposal before the
    /// step runs. An approval already applied for this very step counts as
    /// consumed. A run that is `running` without a suspension and without a
    /// live lease (its driver died) continues from its next step.
    pub async fn resume_with_cancel(&self, run_id: Uuid, cancel: CancellationToken) -> Result<WorkflowRun> {
        let _active = self.acquire(run_id)?;
        let mut run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| WardenError::not_found("workflow run", run_id))?;
        if run.status.is_terminal() {
            return Err(WardenError::InvalidTransition {
                id: run_id,
                from: run.status.to_string(),
                to: RunStatus::Running.to_string(),
            });
        }
        if run.is_leased(Utc::now()) {
            debug!(run_id = %run_id, "run is leased by another driver");
            return Err(WardenError::RunInProgress(run_id));
        }
        let definition = self
            .store
            .get_definition(&run.definition)?
            .ok_or_else(|| WardenError::not_found("workflow", &run.definition))?;

        let mut approved_step = None;
        if let Some(proposal_id) = run.suspended_on {
            let proposal = self.proposals.get(proposal_id)?;
            let step_name = definition
                .steps
                .get(run.next_step)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            match proposal.status {
                ProposalStatus::Proposed => {
                    debug!(run_id = %run_id, proposal_id = %proposal_id, "approval still pending");
                    return Ok(run);
                }
                ProposalStatus::Rejected | ProposalStatus::Reverted => {
                    info!(run_id = %run_id, proposal_id = %proposal_id, status = %proposal.status, "step approval withdrawn");
                    let reason = if proposal.status == ProposalStatus::Rejected {
                        AbortReason::ApprovalRejected {
                            step: step_name,
                            proposal_id,
                        }
                    } else {
                        AbortReason::ApprovalReverted {
                            step: step_name,
                            proposal_id,
                        }
                    };
                    let aborted = self.abort(&mut run, reason);
                    self.settle(&mut run, aborted)?;
                    return Ok(run);
                }
                ProposalStatus::Applied if approves_next_step(&proposal, &run) => {
                    // A previous resume consumed it and stopped before saving.
                    info!(run_id = %run_id, proposal_id = %proposal_id, "step approval already consumed");
                    self.checkpoint(&mut run, true)?;
                }
                ProposalStatus::Applied => return Err(WardenError::AlreadyApplied(proposal_id)),
                ProposalStatus::Approved => {
                    // Claim first; a concurrent resume loses the version race
                    // before it can consume the approval.
                    self.checkpoint(&mut run, true)?;
                    self.proposals.apply(proposal_id)?;
                }
            }
            run.suspended_on = None;
            approved_step = Some(run.next_step);
            self.record(run.id, "resumed", json!({ "proposal_id": proposal_id }));
        } else {
            self.checkpoint(&mut run, true)?;
            self.record(run.id, "resumed", json!({ "next_step": run.next_step }));
        }

        self.drive(&definition, &mut run, &cancel, approved_step).await?;
        Ok(run)
    }

    /// Abort a stored run from outside its driver, typically one suspended
    /// on an approval. A driver still executing loses its next save and
    /// stops.
    pub fn cancel(&self, run_id: Uuid) -> Result<WorkflowRun> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut run = self
                .store
                .get_run(run_id)?
                .ok_or_else(|| WardenError::not_found("workflow run", run_id))?;
            let completed_steps = run.step_results.len();
            match self.abort(&mut run, AbortReason::Cancelled { completed_steps }) {
                Ok(()) => return Ok(run),
                Err(WardenError::StaleRun(_)) => {
                    debug!(run_id = %run_id, "run saved during cancel, reloading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(WardenError::StaleRun(run_id))
    }

    fn acquire(&self, run_id: Uuid) -> Result<ActiveRun<'_>> {
        match self.active.entry(run_id) {
            Entry::Occupied(_) => Err(WardenError::RunInProgress(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ActiveRun {
                    active: &self.active,
                    run_id,
                })
            }
        }
    }

    /// Save the run. While steps are being executed the save also renews
    /// the lease; a suspended or finished run holds none.
    fn checkpoint(&self, run: &mut WorkflowRun, hold_lease: bool) -> Result<()> {
        run.lease_expires_at = (hold_lease && run.status == RunStatus::Running)
            .then(|| lease_deadline(Utc::now(), self.settings.lease()));
        self.store.save_run(run)
    }

    /// A lost save race is fine if the winner ended the run: report its
    /// outcome instead. Anything else still fails.
    fn settle(&self, run: &mut WorkflowRun, result: Result<()>) -> Result<()> {
        match result {
            Err(WardenError::StaleRun(_)) => self.adopt_stored(run),
            other => other,
        }
    }

    fn adopt_stored(&self, run: &mut WorkflowRun) -> Result<()> {
        let stored = self
            .store
            .get_run(run.id)?
            .ok_or_else(|| WardenError::not_found("workflow run", run.id))?;
        if !stored.status.is_terminal() {
            return Err(WardenError::StaleRun(run.id));
        }
        info!(run_id = %run.id, status = %stored.status, "run ended by another writer, stopping");
        *run = stored;
        Ok(())
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
        approved_step: Option<usize>,
    ) -> Result<()> {
        let driven = self.drive_steps(definition, run, cancel, approved_step).await;
        self.settle(run, driven)
    }

    async fn drive_steps(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
        approved_step: Option<usize>,
    ) -> Result<()> {
        while run.next_step < definition.steps.len() {
            if cancel.is_cancelled() {
                info!(run_id = %run.id, completed = run.step_results.len(), "workflow run cancelled");
                let completed_steps = run.step_results.len();
                return self.abort(run, AbortReason::Cancelled { completed_steps });
            }
            if self
                .store
                .get_run(run.id)?
                .is_some_and(|stored| stored.version != run.version)
            {
                return Err(WardenError::StaleRun(run.id));
            }

            let index = run.next_step;
            let step = &definition.steps[index];
            match self
                .execute_step(definition, run, index, step, approved_step == Some(index))
                .await?
            {
                Flow::Next(next) => {
                    run.next_step = next;
                    self.checkpoint(run, true)?;
                }
                Flow::Suspend => return Ok(()),
                Flow::Abort(reason) => return self.abort(run, reason),
            }
        }

        run.finish(RunStatus::Completed, None)?;
        self.checkpoint(run, false)?;
        info!(run_id = %run.id, steps = run.step_results.len(), "workflow run completed");
        self.record(run.id, "completed", json!({ "steps": run.step_results.len() }));
        self.events.publish(Event::RunFinished {
            run_id: run.id,
            status: RunStatus::Completed,
        });
        Ok(())
    }

    async fn execute_step(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        index: usize,
        step: &Step,
        pre_approved: bool,
    ) -> Result<Flow> {
        let (descriptor, handler) = match self.registry.resolve(step.operation) {
            Ok(found) => found,
            Err(_) => {
                return Ok(Flow::Abort(AbortReason::UnknownCapability {
                    step: step.name.clone(),
                    operation: step.operation.to_string(),
                }));
            }
        };
        if let Err(e) = CapabilityRegistry::check_params(descriptor, &step.params) {
            let detail = match e {
                WardenError::InvalidParams { reason, .. } => reason,
                other => other.to_string(),
            };
            return Ok(Flow::Abort(AbortReason::InvalidParams {
                step: step.name.clone(),
                detail,
            }));
        }

        let mut warning = None;
        if descriptor.is_mutating() {
            let action = step_action(definition, step, descriptor);
            let decision = self.evaluator.evaluate(&action).await?;
            match decision.effect {
                Effect::Deny => {
                    let rules = decision.rule_ids();
                    warn!(run_id = %run.id, step = %step.name, reason = %decision.reason, "step denied by policy");
                    self.push_result(
                        run,
                        index,
                        step,
                        StepOutcome::Denied {
                            reason: decision.reason.clone(),
                            rules: rules.clone(),
                        },
                        0,
                    );
                    return Ok(Flow::Abort(AbortReason::PolicyDenied {
                        step: step.name.clone(),
                        detail: decision.reason,
                        rules,
                    }));
                }
                Effect::RequireApproval if !pre_approved => {
                    self.suspend(definition, run, index, step, action, decision.reason)?;
                    return Ok(Flow::Suspend);
                }
                Effect::Warn => warning = Some(decision.reason),
                Effect::RequireApproval | Effect::Allow => {}
            }
        }

        let ctx = StepContext {
            run_id: run.id,
            workflow: definition.name.clone(),
            step: step.name.clone(),
            step_index: index,
            input: run.input.clone(),
        };

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(
                self.settings.handler_timeout,
                handler.handle(&step.params, &ctx),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => HandlerOutcome::failure(format!(
                    "handler timed out after {}s",
                    self.settings.handler_timeout.as_secs_f64()
                )),
            };
            if outcome.ok {
                break outcome;
            }
            let error = outcome.error.clone().unwrap_or_else(|| "handler failed".into());
            if step.on_failure == OnFailure::Retry && attempts <= self.settings.max_retries {
                warn!(run_id = %run.id, step = %step.name, attempt = attempts, error = %error, "step failed, retrying");
                continue;
            }

            warn!(run_id = %run.id, step = %step.name, attempts, error = %error, "step failed");
            self.push_result(run, index, step, StepOutcome::Failed { error: error.clone() }, attempts);
            return Ok(match step.on_failure {
                OnFailure::Skip => Flow::Next(index + 1),
                OnFailure::Abort | OnFailure::Retry => Flow::Abort(AbortReason::StepFailed {
                    step: step.name.clone(),
                    error,
                }),
            });
        };

        let branch_taken = step.operation == Operation::Branch
            && outcome
                .data
                .as_ref()
                .and_then(|d| d.get("result"))
                .and_then(|r| r.as_bool())
                == Some(false);

        self.push_result(
            run,
            index,
            step,
            StepOutcome::Executed {
                data: outcome.data,
                warning,
            },
            attempts,
        );

        if branch_taken && let Some(target_name) = step.param_str("skip_to") {
            let Some(target) = definition.step_index(target_name).filter(|t| *t > index) else {
                return Ok(Flow::Abort(AbortReason::InvalidParams {
                    step: step.name.clone(),
                    detail: format!("skip_to '{target_name}' is not a later step"),
                }));
            };
            for skipped in index + 1..target {
                let s = &definition.steps[skipped];
                self.push_result(
                    run,
                    skipped,
                    s,
                    StepOutcome::Skipped {
                        reason: format!("branch '{}' skipped to '{target_name}'", step.name),
                    },
                    0,
                );
            }
            return Ok(Flow::Next(target));
        }

        Ok(Flow::Next(index + 1))
    }

    fn suspend(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        index: usize,
        step: &Step,
        action: ActionDescriptor,
        reason: String,
    ) -> Result<()> {
        let proposal = self.proposals.propose(
            NewProposal::new(
                ProposedChange::StepApproval {
                    run_id: run.id,
                    step_index: index,
                    step: step.name.clone(),
                    action,
                },
                ProposalSource::Workflow,
            )
            .with_description(format!(
                "approve step '{}' ({}) of workflow '{}'",
                step.name, step.operation, definition.name
            )),
        )?;

        self.push_result(
            run,
            index,
            step,
            StepOutcome::AwaitingApproval {
                proposal_id: proposal.id,
                reason,
            },
            0,
        );
        run.suspended_on = Some(proposal.id);
        self.checkpoint(run, false)?;

        info!(run_id = %run.id, step = %step.name, proposal_id = %proposal.id, "workflow run suspended for approval");
        self.record(
            run.id,
            "suspended",
            json!({ "step": step.name, "proposal_id": proposal.id }),
        );
        self.events.publish(Event::RunSuspended {
            run_id: run.id,
            proposal_id: proposal.id,
        });
        Ok(())
    }

    fn abort(&self, run: &mut WorkflowRun, reason: AbortReason) -> Result<()> {
        let text = reason.to_string();
        let details = json!({ "code": reason.code(), "reason": text });
        run.finish(RunStatus::Aborted, Some(reason))?;
        self.checkpoint(run, false)?;
        warn!(run_id = %run.id, reason = %text, "workflow run aborted");
        self.record(run.id, "aborted", details);
        self.events.publish(Event::RunFinished {
            run_id: run.id,
            status: RunStatus::Aborted,
        });
        Ok(())
    }

    fn push_result(&self, run: &mut WorkflowRun, index: usize, step: &Step, outcome: StepOutcome, attempts: u32) {
        self.events.publish(Event::StepCompleted {
            run_id: run.id,
            step: step.name.clone(),
            outcome: outcome.label().to_string(),
        });
        run.step_results.push(StepResult {
            index,
            step: step.name.clone(),
            operation: step.operation,
            outcome,
            attempts,
            timestamp: Utc::now(),
        });
    }

    fn record(&self, run_id: Uuid, event: &str, details: Value) {
        if let Err(e) = self
            .audit
            .append(AuditEntry::new(AuditSubject::WorkflowRun, run_id, event, details))
        {
            warn!(run_id = %run_id, error = %e, "failed to audit workflow run");
        }
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// An applied `step_approval` raised for the step this run is parked on.
fn approves_next_step(proposal: &Proposal, run: &WorkflowRun) -> bool {
    matches!(
        proposal.change,
        ProposedChange::StepApproval { run_id, step_index, .. }
            if run_id == run.id && step_index == run.next_step
    )
}

/// The action a mutating step would take, as presented to policy.
fn step_action(definition: &WorkflowDefinition, step: &Step, descriptor: &CapabilityDescriptor) -> ActionDescriptor {
    let target = step.param_str("target").unwrap_or(&step.name).to_string();
    ActionDescriptor::new(step.operation.as_str(), descriptor.category.clone())
        .with_target(target)
        .with_payload(step.params.clone())
        .requested_by(format!("workflow:{}", definition.name))
}
