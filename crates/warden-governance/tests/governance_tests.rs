#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use warden_core::*;
    use warden_governance::*;
    use warden_store::SqliteStore;

    struct Harness {
        store: SqliteStore,
        events: EventBus,
        evaluator: Arc<PolicyEvaluator>,
        proposals: Arc<ProposalManager>,
    }

    fn harness() -> Harness {
        let store = SqliteStore::open_in_memory().unwrap();
        let events = EventBus::default();
        let evaluator = Arc::new(PolicyEvaluator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            events.clone(),
            EvaluatorSettings::default(),
        ));
        let proposals = Arc::new(ProposalManager::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            events.clone(),
        ));
        Harness {
            store,
            events,
            evaluator,
            proposals,
        }
    }

    fn add_rule(h: &Harness, rule_type: RuleType, category: &str, effect: Effect) -> BoundaryRule {
        let rule = NewBoundaryRule::new(rule_type, category, effect).into_rule(Utc::now());
        h.store.insert_rule(&rule).unwrap();
        h.evaluator.clear_cache();
        rule
    }

    // ── Test handlers ──────────────────────────────────────────

    #[derive(Clone, Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CapabilityHandler for Counting {
        async fn handle(&self, _params: &Value, _ctx: &StepContext) -> HandlerOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            HandlerOutcome::success(json!({ "calls": n }))
        }
    }

    /// Fails until it has been called `fail_times` times.
    struct Flaky {
        fail_times: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityHandler for Flaky {
        async fn handle(&self, _params: &Value, _ctx: &StepContext) -> HandlerOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                HandlerOutcome::failure(format!("transient failure {n}"))
            } else {
                HandlerOutcome::success(json!({}))
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl CapabilityHandler for Slow {
        async fn handle(&self, _params: &Value, _ctx: &StepContext) -> HandlerOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            HandlerOutcome::success(json!({}))
        }
    }

    /// Counts calls and takes `delay` to finish each.
    #[derive(Clone)]
    struct Delayed {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Delayed {
        fn new(delay: Duration) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                delay,
            }
        }
    }

    #[async_trait]
    impl CapabilityHandler for Delayed {
        async fn handle(&self, _params: &Value, _ctx: &StepContext) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            HandlerOutcome::success(json!({}))
        }
    }

    struct CancelOnCall(CancellationToken);

    #[async_trait]
    impl CapabilityHandler for CancelOnCall {
        async fn handle(&self, _params: &Value, _ctx: &StepContext) -> HandlerOutcome {
            self.0.cancel();
            HandlerOutcome::success(json!({}))
        }
    }

    fn registry_with(create: Arc<dyn CapabilityHandler>) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::with_builtins(Duration::from_millis(10));
        registry.register(
            CapabilityDescriptor::new(Operation::CreateRecord, SideEffectClass::Mutate, "records")
                .requires(&["name"]),
            create,
        );
        registry
    }

    fn interpreter(h: &Harness, registry: CapabilityRegistry, settings: InterpreterSettings) -> WorkflowInterpreter {
        WorkflowInterpreter::new(
            Arc::new(registry),
            Arc::clone(&h.evaluator),
            Arc::clone(&h.proposals),
            Arc::new(h.store.clone()),
            Arc::new(h.store.clone()),
            h.events.clone(),
            settings,
        )
    }

    fn notify_then_create() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "intake",
            vec![
                Step::new("notify", Operation::Notify, json!({"message": "starting"})),
                Step::new("create", Operation::CreateRecord, json!({"name": "invoice-7"})),
            ],
        )
    }

    fn labels(run: &WorkflowRun) -> Vec<(String, &'static str)> {
        run.step_results
            .iter()
            .map(|r| (r.step.clone(), r.outcome.label()))
            .collect()
    }

    // ── Policy evaluation ──────────────────────────────────────

    mod policy {
        use super::*;

        struct FailingStore;

        impl PolicyStore for FailingStore {
            fn active_rules(&self, _category: &str) -> Result<Vec<BoundaryRule>> {
                Err(WardenError::Store("disk on fire".into()))
            }
            fn insert_rule(&self, _rule: &BoundaryRule) -> Result<bool> {
                Ok(false)
            }
            fn set_rule_active(&self, _id: Uuid, _active: bool) -> Result<bool> {
                Ok(false)
            }
            fn get_rule(&self, _id: Uuid) -> Result<Option<BoundaryRule>> {
                Ok(None)
            }
            fn list_rules(&self, _include_inactive: bool) -> Result<Vec<BoundaryRule>> {
                Ok(Vec::new())
            }
        }

        struct SlowStore;

        impl PolicyStore for SlowStore {
            fn active_rules(&self, _category: &str) -> Result<Vec<BoundaryRule>> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Vec::new())
            }
            fn insert_rule(&self, _rule: &BoundaryRule) -> Result<bool> {
                Ok(false)
            }
            fn set_rule_active(&self, _id: Uuid, _active: bool) -> Result<bool> {
                Ok(false)
            }
            fn get_rule(&self, _id: Uuid) -> Result<Option<BoundaryRule>> {
                Ok(None)
            }
            fn list_rules(&self, _include_inactive: bool) -> Result<Vec<BoundaryRule>> {
                Ok(Vec::new())
            }
        }

        /// Clears the evaluator's cache from inside a rule read, the way a
        /// rule change landing mid-evaluation would.
        #[derive(Default)]
        struct ClearingStore {
            evaluator: std::sync::OnceLock<std::sync::Weak<PolicyEvaluator>>,
        }

        impl PolicyStore for ClearingStore {
            fn active_rules(&self, _category: &str) -> Result<Vec<BoundaryRule>> {
                if let Some(evaluator) = self.evaluator.get().and_then(|w| w.upgrade()) {
                    evaluator.clear_cache();
                }
                Ok(Vec::new())
            }
            fn insert_rule(&self, _rule: &BoundaryRule) -> Result<bool> {
                Ok(false)
            }
            fn set_rule_active(&self, _id: Uuid, _active: bool) -> Result<bool> {
                Ok(false)
            }
            fn get_rule(&self, _id: Uuid) -> Result<Option<BoundaryRule>> {
                Ok(None)
            }
            fn list_rules(&self, _include_inactive: bool) -> Result<Vec<BoundaryRule>> {
                Ok(Vec::new())
            }
        }

        fn evaluator_over(store: Arc<dyn PolicyStore>, timeout: Duration) -> PolicyEvaluator {
            let audit = SqliteStore::open_in_memory().unwrap();
            PolicyEvaluator::new(
                store,
                Arc::new(audit),
                EventBus::default(),
                EvaluatorSettings {
                    evaluation_timeout: timeout,
                    ..EvaluatorSettings::default()
                },
            )
        }

        #[tokio::test]
        async fn test_hard_deny_on_financial_names_rule() {
            let h = harness();
            let rule = add_rule(&h, RuleType::Hard, "financial", Effect::Deny);
            add_rule(&h, RuleType::Soft, "financial", Effect::Allow);

            let decision = h
                .evaluator
                .evaluate(&ActionDescriptor::new("pay_invoice", "financial").with_target("acme"))
                .await
                .unwrap();
            assert_eq!(decision.effect, Effect::Deny);
            assert_eq!(decision.decisive_rule, Some(rule.id));
            assert!(decision.rule_ids().contains(&rule.id));
            assert!(decision.reason.contains(&rule.id.to_string()));
        }

        #[tokio::test]
        async fn test_no_rule_defaults_to_require_approval() {
            let h = harness();
            let decision = h
                .evaluator
                .evaluate(&ActionDescriptor::new("send", "communication"))
                .await
                .unwrap();
            assert_eq!(decision.effect, Effect::RequireApproval);
        }

        #[tokio::test]
        async fn test_rules_for_all_categories_apply() {
            let h = harness();
            add_rule(&h, RuleType::Hard, "all", Effect::Deny);
            let decision = h
                .evaluator
                .evaluate(&ActionDescriptor::new("anything", "calendar"))
                .await
                .unwrap();
            assert!(decision.is_denied());
        }

        #[tokio::test]
        async fn test_decision_read_before_clear_is_not_cached() {
            let store = Arc::new(ClearingStore::default());
            let evaluator = Arc::new(evaluator_over(store.clone(), Duration::from_secs(2)));
            store.evaluator.set(Arc::downgrade(&evaluator)).unwrap();
            let action = ActionDescriptor::new("send", "email");

            let first = evaluator.evaluate(&action).await.unwrap();
            assert_eq!(first.effect, Effect::RequireApproval);
            assert_eq!(evaluator.cached_decisions(), 0);

            let second = evaluator.evaluate(&action).await.unwrap();
            assert_ne!(first.id, second.id);
        }

        #[tokio::test]
        async fn test_cache_until_cleared() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "email", Effect::Allow);
            let action = ActionDescriptor::new("send", "email");

            let first = h.evaluator.evaluate(&action).await.unwrap();
            let second = h.evaluator.evaluate(&action).await.unwrap();
            assert_eq!(first.id, second.id);
            assert_eq!(h.evaluator.cached_decisions(), 1);

            // New rule is invisible until the cache is cleared.
            let deny = NewBoundaryRule::new(RuleType::Hard, "email", Effect::Deny).into_rule(Utc::now());
            h.store.insert_rule(&deny).unwrap();
            assert_eq!(h.evaluator.evaluate(&action).await.unwrap().effect, Effect::Allow);

            h.evaluator.clear_cache();
            assert_eq!(h.evaluator.evaluate(&action).await.unwrap().effect, Effect::Deny);
        }

        #[tokio::test]
        async fn test_zero_ttl_is_not_cached() {
            let h = harness();
            h.evaluator.set_cache_ttl(0);
            let action = ActionDescriptor::new("send", "email");
            let first = h.evaluator.evaluate(&action).await.unwrap();
            let second = h.evaluator.evaluate(&action).await.unwrap();
            assert_ne!(first.id, second.id);
            assert_eq!(h.evaluator.cached_decisions(), 0);
        }

        #[tokio::test]
        async fn test_expired_rule_ignored() {
            let h = harness();
            let mut new = NewBoundaryRule::new(RuleType::Hard, "financial", Effect::Deny);
            new.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
            h.store.insert_rule(&new.into_rule(Utc::now())).unwrap();
            add_rule(&h, RuleType::Soft, "financial", Effect::Allow);

            let decision = h
                .evaluator
                .evaluate(&ActionDescriptor::new("pay", "financial"))
                .await
                .unwrap();
            assert_eq!(decision.effect, Effect::Allow);
        }

        #[tokio::test]
        async fn test_store_failure_fails_closed_uncached() {
            let evaluator = evaluator_over(Arc::new(FailingStore), Duration::from_secs(1));
            let decision = evaluator
                .evaluate(&ActionDescriptor::new("pay", "financial"))
                .await
                .unwrap();
            assert_eq!(decision.effect, Effect::Deny);
            assert!(decision.reason.starts_with("policy_unavailable"));
            assert_eq!(evaluator.cached_decisions(), 0);
        }

        #[tokio::test]
        async fn test_slow_store_times_out_closed() {
            let evaluator = evaluator_over(Arc::new(SlowStore), Duration::from_millis(20));
            let decision = evaluator
                .evaluate(&ActionDescriptor::new("pay", "financial"))
                .await
                .unwrap();
            assert!(decision.is_denied());
            assert!(decision.reason.contains("timed out"));
        }

        #[tokio::test]
        async fn test_invalid_action_rejected() {
            let h = harness();
            let err = h
                .evaluator
                .evaluate(&ActionDescriptor::new("", "financial"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "invalid_action");
        }

        #[tokio::test]
        async fn test_decisions_are_audited() {
            let h = harness();
            let decision = h
                .evaluator
                .evaluate(&ActionDescriptor::new("send", "email"))
                .await
                .unwrap();
            let trail = h.store.for_subject(&decision.id.to_string()).unwrap();
            assert_eq!(trail.len(), 1);
            assert_eq!(trail[0].subject_kind, AuditSubject::PolicyDecision);
            assert_eq!(trail[0].event, "require_approval");
        }
    }

    // ── Workflow interpreter ───────────────────────────────────

    mod workflow {
        use super::*;

        #[tokio::test]
        async fn test_require_approval_suspends_then_resumes() {
            let h = harness();
            let create = Counting::default();
            let interp = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let def = notify_then_create();
            h.store.upsert_definition(&def).unwrap();

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Running);
            assert!(run.is_suspended());
            assert_eq!(run.executed_steps(), vec!["notify"]);
            assert_eq!(create.calls.load(Ordering::SeqCst), 0);

            let proposal_id = run.suspended_on.unwrap();
            let proposal = h.proposals.get(proposal_id).unwrap();
            assert_eq!(proposal.kind, ProposalKind::StepApproval);
            assert_eq!(proposal.status, ProposalStatus::Proposed);

            // Still pending: nothing changes.
            let pending = interp.resume(run.id).await.unwrap();
            assert_eq!(pending.step_results.len(), 2);
            assert!(pending.is_suspended());

            h.proposals
                .decide(&HumanDecision::approve(proposal_id, "alice"))
                .unwrap();
            let done = interp.resume(run.id).await.unwrap();
            assert_eq!(done.status, RunStatus::Completed);
            assert_eq!(done.executed_steps(), vec!["notify", "create"]);
            assert_eq!(create.calls.load(Ordering::SeqCst), 1);
            assert_eq!(h.proposals.get(proposal_id).unwrap().status, ProposalStatus::Applied);

            // Terminal runs cannot be resumed.
            assert!(interp.resume(run.id).await.is_err());
        }

        #[tokio::test]
        async fn test_rejected_approval_aborts() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = notify_then_create();
            h.store.upsert_definition(&def).unwrap();

            let run = interp.run(&def, json!({})).await.unwrap();
            let proposal_id = run.suspended_on.unwrap();
            h.proposals
                .decide(&HumanDecision::reject(proposal_id, "alice").with_notes("not today"))
                .unwrap();

            let aborted = interp.resume(run.id).await.unwrap();
            assert_eq!(aborted.status, RunStatus::Aborted);
            assert_eq!(aborted.abort_reason.as_ref().unwrap().code(), "approval_rejected");
        }

        #[tokio::test]
        async fn test_deny_after_approval_still_aborts() {
            let h = harness();
            let create = Counting::default();
            let interp = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let def = notify_then_create();
            h.store.upsert_definition(&def).unwrap();

            let run = interp.run(&def, json!({})).await.unwrap();
            let proposal_id = run.suspended_on.unwrap();
            h.proposals
                .decide(&HumanDecision::approve(proposal_id, "alice"))
                .unwrap();
            add_rule(&h, RuleType::Hard, "records", Effect::Deny);

            let resumed = interp.resume(run.id).await.unwrap();
            assert_eq!(resumed.status, RunStatus::Aborted);
            assert_eq!(resumed.abort_reason.as_ref().unwrap().code(), "policy_denied");
            assert_eq!(create.calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_deny_aborts_with_prefix_of_executed_steps() {
            let h = harness();
            let rule = add_rule(&h, RuleType::Hard, "records", Effect::Deny);
            let create = Counting::default();
            let interp = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "deny",
                vec![
                    Step::new("one", Operation::LogMessage, json!({"message": "a"})),
                    Step::new("two", Operation::CreateRecord, json!({"name": "x"})),
                    Step::new("three", Operation::Notify, json!({"message": "never"})),
                ],
            );

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.executed_steps(), vec!["one"]);
            match run.abort_reason.as_ref().unwrap() {
                AbortReason::PolicyDenied { rules, .. } => assert_eq!(rules, &vec![rule.id]),
                other => panic!("unexpected abort: {other:?}"),
            }
            assert_eq!(labels(&run), vec![("one".into(), "executed"), ("two".into(), "denied")]);
            assert_eq!(create.calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_allow_and_warn_proceed() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "records", Effect::Warn);
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());

            let run = interp.run(&notify_then_create(), json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            match &run.step_results[1].outcome {
                StepOutcome::Executed { warning, .. } => assert!(warning.is_some()),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_retry_until_success() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "records", Effect::Allow);
            let flaky = Arc::new(Flaky {
                fail_times: 2,
                calls: AtomicUsize::new(0),
            });
            let interp = interpreter(&h, registry_with(flaky), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "retry",
                vec![Step::new("create", Operation::CreateRecord, json!({"name": "x"})).on_failure(OnFailure::Retry)],
            );

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(run.step_results[0].attempts, 3);
        }

        #[tokio::test]
        async fn test_retry_exhaustion_aborts() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "records", Effect::Allow);
            let flaky = Arc::new(Flaky {
                fail_times: 100,
                calls: AtomicUsize::new(0),
            });
            let settings = InterpreterSettings {
                max_retries: 2,
                ..InterpreterSettings::default()
            };
            let interp = interpreter(&h, registry_with(flaky), settings);
            let def = WorkflowDefinition::new(
                "retry",
                vec![Step::new("create", Operation::CreateRecord, json!({"name": "x"})).on_failure(OnFailure::Retry)],
            );

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.step_results[0].attempts, 3);
            assert_eq!(run.abort_reason.as_ref().unwrap().code(), "step_execution_failure");
        }

        #[tokio::test]
        async fn test_skip_continues_after_failure() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "records", Effect::Allow);
            let flaky = Arc::new(Flaky {
                fail_times: 1,
                calls: AtomicUsize::new(0),
            });
            let interp = interpreter(&h, registry_with(flaky), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "skip",
                vec![
                    Step::new("create", Operation::CreateRecord, json!({"name": "x"})).on_failure(OnFailure::Skip),
                    Step::new("after", Operation::Notify, json!({"message": "still here"})),
                ],
            );

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(labels(&run), vec![("create".into(), "failed"), ("after".into(), "executed")]);
        }

        #[tokio::test]
        async fn test_handler_timeout_is_failure() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "records", Effect::Allow);
            let settings = InterpreterSettings {
                handler_timeout: Duration::from_millis(20),
                ..InterpreterSettings::default()
            };
            let interp = interpreter(&h, registry_with(Arc::new(Slow)), settings);
            let def = WorkflowDefinition::new(
                "slow",
                vec![Step::new("create", Operation::CreateRecord, json!({"name": "x"}))],
            );

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Aborted);
            match &run.step_results[0].outcome {
                StepOutcome::Failed { error } => assert!(error.contains("timed out")),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_branch_skips_forward() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "branchy",
                vec![
                    Step::new(
                        "check",
                        Operation::Branch,
                        json!({"condition": {"input": "urgent", "equals": true}, "skip_to": "done"}),
                    ),
                    Step::new("page", Operation::Notify, json!({"message": "urgent!"})),
                    Step::new("log", Operation::LogMessage, json!({"message": "paged"})),
                    Step::new("done", Operation::LogMessage, json!({"message": "finished"})),
                ],
            );
            interp.validate(&def).unwrap();

            let calm = interp.run(&def, json!({"urgent": false})).await.unwrap();
            assert_eq!(calm.status, RunStatus::Completed);
            assert_eq!(
                labels(&calm),
                vec![
                    ("check".into(), "executed"),
                    ("page".into(), "skipped"),
                    ("log".into(), "skipped"),
                    ("done".into(), "executed"),
                ]
            );

            let urgent = interp.run(&def, json!({"urgent": true})).await.unwrap();
            assert_eq!(urgent.executed_steps(), vec!["check", "page", "log", "done"]);
        }

        #[tokio::test]
        async fn test_oversized_wait_is_capped() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "nap",
                vec![Step::new("nap", Operation::Wait, json!({"seconds": 1e30}))],
            );

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            match &run.step_results[0].outcome {
                StepOutcome::Executed { data, .. } => {
                    assert_eq!(data.as_ref().unwrap()["waited_ms"], 10);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_unregistered_operation_aborts() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "lookup",
                vec![Step::new("find", Operation::Query, json!({"kind": "contact"}))],
            );
            assert_eq!(interp.validate(&def).unwrap_err().code(), "unknown_capability");

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.abort_reason.as_ref().unwrap().code(), "unknown_capability");
            assert!(run.step_results.is_empty());
        }

        #[tokio::test]
        async fn test_missing_params_abort() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = WorkflowDefinition::new("bad", vec![Step::new("say", Operation::Notify, json!({}))]);

            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.abort_reason.as_ref().unwrap().code(), "invalid_params");
        }

        #[tokio::test]
        async fn test_validate_rejects_backward_skip() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "loop",
                vec![
                    Step::new("start", Operation::LogMessage, json!({"message": "a"})),
                    Step::new("check", Operation::Branch, json!({"condition": false, "skip_to": "start"})),
                ],
            );
            assert_eq!(interp.validate(&def).unwrap_err().code(), "invalid_params");
        }

        #[tokio::test]
        async fn test_cancel_keeps_completed_steps() {
            let h = harness();
            let token = CancellationToken::new();
            let mut registry = registry_with(Arc::new(Counting::default()));
            registry.register(
                CapabilityDescriptor::new(Operation::Query, SideEffectClass::Read, "records"),
                Arc::new(CancelOnCall(token.clone())),
            );
            let interp = interpreter(&h, registry, InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "cancel",
                vec![
                    Step::new("first", Operation::Query, json!({})),
                    Step::new("second", Operation::Notify, json!({"message": "unreached"})),
                ],
            );

            let run = interp.run_with_cancel(&def, json!({}), token).await.unwrap();
            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.executed_steps(), vec!["first"]);
            assert_eq!(
                run.abort_reason,
                Some(AbortReason::Cancelled { completed_steps: 1 })
            );
            let stored = h.store.get_run(run.id).unwrap().unwrap();
            assert_eq!(stored.step_results.len(), 1);
        }

        #[tokio::test]
        async fn test_identical_inputs_identical_outcomes() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = notify_then_create();

            let a = interp.run(&def, json!({"x": 1})).await.unwrap();
            let b = interp.run(&def, json!({"x": 1})).await.unwrap();
            assert_eq!(labels(&a), labels(&b));
            assert_eq!(a.status, b.status);
        }

        #[tokio::test]
        async fn test_disabled_definition_aborts() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let mut def = notify_then_create();
            def.enabled = false;
            let run = interp.run(&def, json!({})).await.unwrap();
            assert_eq!(run.abort_reason.as_ref().unwrap().code(), "definition_disabled");
        }

        #[tokio::test]
        async fn test_run_lifecycle_audited() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let run = interp.run(&notify_then_create(), json!({})).await.unwrap();
            let events: Vec<String> = h
                .store
                .for_subject(&run.id.to_string())
                .unwrap()
                .into_iter()
                .map(|r| r.event)
                .collect();
            assert_eq!(events, vec!["started", "suspended"]);
        }
    }

    mod cancellation {
        use super::*;

        #[tokio::test]
        async fn test_cancel_suspended_run() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = notify_then_create();
            h.store.upsert_definition(&def).unwrap();
            let run = interp.run(&def, json!({})).await.unwrap();
            assert!(run.is_suspended());

            let cancelled = interp.cancel(run.id).unwrap();
            assert_eq!(cancelled.status, RunStatus::Aborted);
            assert!(cancelled.suspended_on.is_none());
            assert_eq!(
                cancelled.abort_reason,
                Some(AbortReason::Cancelled { completed_steps: 2 })
            );
            assert_eq!(interp.resume(run.id).await.unwrap_err().code(), "invalid_transition");
            assert_eq!(interp.cancel(run.id).unwrap_err().code(), "invalid_transition");
        }

        #[tokio::test]
        async fn test_cancel_during_step_is_not_overwritten() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "records", Effect::Allow);
            let create = Delayed::new(Duration::from_millis(300));
            let interp = Arc::new(interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default()));
            let def = WorkflowDefinition::new(
                "slow",
                vec![
                    Step::new("create", Operation::CreateRecord, json!({"name": "x"})),
                    Step::new("after", Operation::Notify, json!({"message": "unreached"})),
                ],
            );
            let prepared = WorkflowRun::new(&def.name, json!({}));
            let id = prepared.id;
            let driver = {
                let interp = Arc::clone(&interp);
                tokio::spawn(async move { interp.execute(&def, prepared, CancellationToken::new()).await })
            };

            tokio::time::sleep(Duration::from_millis(100)).await;
            let cancelled = interp.cancel(id).unwrap();
            assert_eq!(cancelled.status, RunStatus::Aborted);

            let finished = driver.await.unwrap().unwrap();
            assert_eq!(finished.status, RunStatus::Aborted);
            assert_eq!(finished.abort_reason.as_ref().unwrap().code(), "cancelled");
            assert_eq!(create.calls.load(Ordering::SeqCst), 1);

            let stored = h.store.get_run(id).unwrap().unwrap();
            assert_eq!(stored.status, RunStatus::Aborted);
            assert!(stored.executed_steps().is_empty());
        }

        #[tokio::test]
        async fn test_execute_uses_callers_run() {
            let h = harness();
            let interp = interpreter(&h, registry_with(Arc::new(Counting::default())), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "hello",
                vec![Step::new("say", Operation::Notify, json!({"message": "hi"}))],
            );
            let prepared = WorkflowRun::new(&def.name, json!({}));
            let id = prepared.id;
            let run = interp.execute(&def, prepared, CancellationToken::new()).await.unwrap();
            assert_eq!(run.id, id);
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(h.store.get_run(id).unwrap().unwrap().status, RunStatus::Completed);
        }
    }

    // ── One driver per run ─────────────────────────────────────

    mod single_driver {
        use super::*;

        fn slow_create() -> WorkflowDefinition {
            WorkflowDefinition::new(
                "slow",
                vec![Step::new("create", Operation::CreateRecord, json!({"name": "x"}))],
            )
        }

        #[tokio::test]
        async fn test_resume_refused_while_step_executes() {
            let h = harness();
            add_rule(&h, RuleType::Soft, "records", Effect::Allow);
            let create = Delayed::new(Duration::from_millis(300));
            let interp = Arc::new(interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default()));
            let def = slow_create();
            h.store.upsert_definition(&def).unwrap();
            let prepared = WorkflowRun::new(&def.name, json!({}));
            let id = prepared.id;
            let driver = {
                let interp = Arc::clone(&interp);
                let def = def.clone();
                tokio::spawn(async move { interp.execute(&def, prepared, CancellationToken::new()).await })
            };

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(interp.is_driving(id));
            assert_eq!(interp.resume(id).await.unwrap_err().code(), "run_in_progress");

            // Another process sharing the store sees the lease.
            let elsewhere = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            assert_eq!(elsewhere.resume(id).await.unwrap_err().code(), "run_in_progress");

            let run = driver.await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert!(!interp.is_driving(id));
            assert_eq!(create.calls.load(Ordering::SeqCst), 1);
            let stored = h.store.get_run(id).unwrap().unwrap();
            assert_eq!(stored.executed_steps(), vec!["create"]);
        }

        #[tokio::test]
        async fn test_concurrent_resumes_consume_approval_once() {
            let h = harness();
            let create = Delayed::new(Duration::from_millis(200));
            let first = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let second = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let def = notify_then_create();
            h.store.upsert_definition(&def).unwrap();

            let run = first.run(&def, json!({})).await.unwrap();
            let proposal_id = run.suspended_on.unwrap();
            h.proposals
                .decide(&HumanDecision::approve(proposal_id, "alice"))
                .unwrap();

            let (a, b) = tokio::join!(first.resume(run.id), second.resume(run.id));
            let (done, refused) = match (a, b) {
                (Ok(done), Err(e)) | (Err(e), Ok(done)) => (done, e),
                (a, b) => panic!("expected exactly one resume to win: {a:?} / {b:?}"),
            };
            assert_eq!(done.status, RunStatus::Completed);
            assert!(matches!(refused.code(), "run_in_progress" | "stale_run"));
            assert_eq!(create.calls.load(Ordering::SeqCst), 1);
            assert_eq!(h.proposals.get(proposal_id).unwrap().status, ProposalStatus::Applied);
        }

        #[tokio::test]
        async fn test_resume_after_approval_already_consumed() {
            let h = harness();
            let create = Counting::default();
            let interp = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let def = notify_then_create();
            h.store.upsert_definition(&def).unwrap();

            let run = interp.run(&def, json!({})).await.unwrap();
            let proposal_id = run.suspended_on.unwrap();
            h.proposals
                .decide(&HumanDecision::approve(proposal_id, "alice"))
                .unwrap();
            // Consumed, but the run was never saved past the suspension.
            h.proposals.apply(proposal_id).unwrap();

            let done = interp.resume(run.id).await.unwrap();
            assert_eq!(done.status, RunStatus::Completed);
            assert_eq!(done.executed_steps(), vec!["notify", "create"]);
            assert_eq!(create.calls.load(Ordering::SeqCst), 1);
            assert_eq!(interp.resume(run.id).await.unwrap_err().code(), "invalid_transition");
        }

        #[tokio::test]
        async fn test_reverted_approval_aborts() {
            let h = harness();
            let create = Counting::default();
            let interp = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let def = notify_then_create();
            h.store.upsert_definition(&def).unwrap();

            let run = interp.run(&def, json!({})).await.unwrap();
            let proposal_id = run.suspended_on.unwrap();
            h.proposals
                .decide(&HumanDecision::approve(proposal_id, "alice"))
                .unwrap();
            h.proposals.apply(proposal_id).unwrap();
            h.proposals.revert(proposal_id).unwrap();

            let aborted = interp.resume(run.id).await.unwrap();
            assert_eq!(aborted.status, RunStatus::Aborted);
            assert_eq!(aborted.abort_reason.as_ref().unwrap().code(), "approval_reverted");
            assert_eq!(create.calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_interrupted_run_resumes_once_lease_expires() {
            let h = harness();
            let create = Counting::default();
            let interp = interpreter(&h, registry_with(Arc::new(create.clone())), InterpreterSettings::default());
            let def = WorkflowDefinition::new(
                "logs",
                vec![
                    Step::new("one", Operation::LogMessage, json!({"message": "a"})),
                    Step::new("two", Operation::LogMessage, json!({"message": "b"})),
                ],
            );
            h.store.upsert_definition(&def).unwrap();

            // A driver that died after saving step one, lease still live.
            let mut run = WorkflowRun::new(&def.name, json!({}));
            run.next_step = 1;
            run.lease_expires_at = Some(Utc::now() + chrono::Duration::seconds(60));
            h.store.save_run(&mut run).unwrap();
            assert_eq!(interp.resume(run.id).await.unwrap_err().code(), "run_in_progress");

            run.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
            h.store.save_run(&mut run).unwrap();
            let done = interp.resume(run.id).await.unwrap();
            assert_eq!(done.status, RunStatus::Completed);
            assert_eq!(done.executed_steps(), vec!["two"]);
            assert!(done.lease_expires_at.is_none());
        }
    }

    // ── Proposal lifecycle ─────────────────────────────────────

    mod proposals {
        use super::*;

        fn rule_proposal(h: &Harness) -> (Proposal, NewBoundaryRule) {
            let rule = NewBoundaryRule::new(RuleType::Hard, "financial", Effect::Deny)
                .with_description("no payments");
            let p = h
                .proposals
                .propose(NewProposal::new(
                    ProposedChange::AddBoundaryRule { rule: rule.clone() },
                    ProposalSource::Agent,
                ))
                .unwrap();
            (p, rule)
        }

        #[test]
        fn test_applied_unreachable_without_approval() {
            let h = harness();
            let (p, _) = rule_proposal(&h);
            assert_eq!(h.proposals.apply(p.id).unwrap_err().code(), "not_approved");

            h.proposals.decide(&HumanDecision::reject(p.id, "alice")).unwrap();
            assert_eq!(h.proposals.apply(p.id).unwrap_err().code(), "not_approved");
            assert_eq!(h.proposals.revert(p.id).unwrap_err().code(), "invalid_transition");
            assert_eq!(h.proposals.get(p.id).unwrap().status, ProposalStatus::Rejected);
        }

        #[test]
        fn test_decide_only_from_proposed() {
            let h = harness();
            let (p, _) = rule_proposal(&h);
            let approved = h.proposals.decide(&HumanDecision::approve(p.id, "alice")).unwrap();
            assert_eq!(approved.decided_by.as_deref(), Some("alice"));
            assert!(approved.decided_at.is_some());

            let err = h.proposals.decide(&HumanDecision::reject(p.id, "bob")).unwrap_err();
            assert_eq!(err.code(), "invalid_transition");
        }

        #[test]
        fn test_concurrent_apply_single_side_effect() {
            let h = harness();
            let (p, rule) = rule_proposal(&h);
            h.proposals.decide(&HumanDecision::approve(p.id, "alice")).unwrap();

            let results: Vec<Result<(Proposal, ApplyOutcome)>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..8)
                    .map(|_| scope.spawn(|| h.proposals.apply(p.id)))
                    .collect();
                handles.into_iter().map(|t| t.join().unwrap()).collect()
            });

            let successes = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(successes, 1);
            for r in results.iter().filter_map(|r| r.as_ref().err()) {
                assert_eq!(r.code(), "already_applied");
            }
            let applied = h.proposals.get(p.id).unwrap();
            assert_eq!(applied.status, ProposalStatus::Applied);
            assert!(applied.applied_at.is_some());
            assert_eq!(h.store.list_rules(true).unwrap().len(), 1);
            assert!(h.store.get_rule(rule.id).unwrap().unwrap().active);
        }

        #[test]
        fn test_revert_reactivates_deactivated_rule() {
            let h = harness();
            let existing = add_rule(&h, RuleType::Soft, "email", Effect::Warn);
            let p = h
                .proposals
                .propose(NewProposal::new(
                    ProposedChange::DeactivateBoundaryRule { rule_id: existing.id },
                    ProposalSource::Human,
                ))
                .unwrap();
            h.proposals.decide(&HumanDecision::approve(p.id, "alice")).unwrap();
            let (_, outcome) = h.proposals.apply(p.id).unwrap();
            assert_eq!(
                outcome,
                ApplyOutcome::RuleDeactivated {
                    rule_id: existing.id,
                    changed: true
                }
            );
            assert!(!h.store.get_rule(existing.id).unwrap().unwrap().active);

            let reverted = h.proposals.revert(p.id).unwrap();
            assert_eq!(reverted.status, ProposalStatus::Reverted);
            assert!(reverted.reverted_at.is_some());
            assert!(h.store.get_rule(existing.id).unwrap().unwrap().active);
        }

        #[test]
        fn test_upsert_workflow_application() {
            let h = harness();
            let def = notify_then_create();
            let p = h
                .proposals
                .propose(NewProposal::new(
                    ProposedChange::UpsertWorkflow { definition: def.clone() },
                    ProposalSource::Agent,
                ))
                .unwrap();
            h.proposals.decide(&HumanDecision::approve(p.id, "alice")).unwrap();
            h.proposals.apply(p.id).unwrap();
            assert_eq!(h.store.get_definition("intake").unwrap(), Some(def));
        }

        #[test]
        fn test_stats_and_audit_trail() {
            let h = harness();
            let (a, _) = rule_proposal(&h);
            let (b, _) = rule_proposal(&h);
            rule_proposal(&h);
            h.proposals.decide(&HumanDecision::approve(a.id, "alice")).unwrap();
            h.proposals.apply(a.id).unwrap();
            h.proposals.decide(&HumanDecision::reject(b.id, "alice")).unwrap();

            let stats = h.proposals.stats().unwrap();
            assert_eq!(stats.total, 3);
            assert_eq!(stats.applied, 1);
            assert_eq!(stats.rejected, 1);
            assert_eq!(stats.proposed, 1);
            assert!((stats.approval_rate - 0.5).abs() < f64::EPSILON);

            let events: Vec<String> = h
                .store
                .for_subject(&a.id.to_string())
                .unwrap()
                .into_iter()
                .map(|r| r.event)
                .collect();
            assert_eq!(events, vec!["proposed", "approved", "applied"]);
            assert_eq!(h.proposals.list(Some(ProposalStatus::Proposed)).unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_transition_events_published() {
            let h = harness();
            let mut rx = h.events.subscribe();
            let (p, _) = rule_proposal(&h);
            h.proposals.decide(&HumanDecision::approve(p.id, "alice")).unwrap();

            match rx.recv().await.unwrap() {
                Event::ProposalCreated { proposal_id, .. } => assert_eq!(proposal_id, p.id),
                other => panic!("unexpected event: {other:?}"),
            }
            match rx.recv().await.unwrap() {
                Event::ProposalTransitioned { status, .. } => assert_eq!(status, ProposalStatus::Approved),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
