#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use warden_core::*;
    use warden_store::SqliteStore;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    // ── Boundary rules ─────────────────────────────────────────

    mod rules {
        use super::*;

        #[test]
        fn test_active_rules_include_all_category() {
            let s = store();
            let financial = NewBoundaryRule::new(RuleType::Hard, "financial", Effect::Deny)
                .into_rule(Utc::now());
            let global = NewBoundaryRule::new(RuleType::Soft, "all", Effect::Warn).into_rule(Utc::now());
            let other = NewBoundaryRule::new(RuleType::Soft, "communication", Effect::Allow)
                .into_rule(Utc::now());
            for r in [&financial, &global, &other] {
                assert!(s.insert_rule(r).unwrap());
            }

            let active = s.active_rules("financial").unwrap();
            let ids: Vec<_> = active.iter().map(|r| r.id).collect();
            assert_eq!(active.len(), 2);
            assert!(ids.contains(&financial.id));
            assert!(ids.contains(&global.id));
        }

        #[test]
        fn test_insert_is_idempotent_by_id() {
            let s = store();
            let rule = NewBoundaryRule::new(RuleType::Hard, "financial", Effect::Deny)
                .with_predicate(Predicate::KindIs { kind: "pay".into() })
                .into_rule(Utc::now());
            assert!(s.insert_rule(&rule).unwrap());
            assert!(!s.insert_rule(&rule).unwrap());
            let loaded = s.get_rule(rule.id).unwrap().unwrap();
            assert_eq!(loaded.predicate, rule.predicate);
            assert_eq!(loaded.effect, Effect::Deny);
        }

        #[test]
        fn test_deactivated_rules_are_kept() {
            let s = store();
            let rule = NewBoundaryRule::new(RuleType::Soft, "email", Effect::Warn).into_rule(Utc::now());
            s.insert_rule(&rule).unwrap();
            assert!(s.set_rule_active(rule.id, false).unwrap());
            assert!(!s.set_rule_active(rule.id, false).unwrap());
            assert!(s.active_rules("email").unwrap().is_empty());
            assert_eq!(s.list_rules(true).unwrap().len(), 1);
            assert!(s.list_rules(false).unwrap().is_empty());
        }
    }

    // ── Proposals ──────────────────────────────────────────────

    mod proposals {
        use super::*;

        fn add_rule_proposal(s: &SqliteStore) -> (Proposal, NewBoundaryRule) {
            let rule = NewBoundaryRule::new(RuleType::Hard, "financial", Effect::Deny);
            let p = NewProposal::new(
                ProposedChange::AddBoundaryRule { rule: rule.clone() },
                ProposalSource::Human,
            )
            .into_proposal(Utc::now());
            s.insert_proposal(&p).unwrap();
            (p, rule)
        }

        #[test]
        fn test_apply_requires_approval() {
            let s = store();
            let (p, _) = add_rule_proposal(&s);
            let err = s.apply_approved(p.id, Utc::now()).unwrap_err();
            assert_eq!(err.code(), "not_approved");
        }

        #[test]
        fn test_apply_once_then_already_applied() {
            let s = store();
            let (p, rule) = add_rule_proposal(&s);
            assert!(
                s.record_decision(p.id, ProposalStatus::Proposed, ProposalStatus::Approved, "alice", None, Utc::now())
                    .unwrap()
            );

            let outcome = s.apply_approved(p.id, Utc::now()).unwrap();
            assert_eq!(
                outcome,
                ApplyOutcome::RuleAdded {
                    rule_id: rule.id,
                    inserted: true
                }
            );
            let err = s.apply_approved(p.id, Utc::now()).unwrap_err();
            assert_eq!(err.code(), "already_applied");

            let loaded = s.get_proposal(p.id).unwrap().unwrap();
            assert_eq!(loaded.status, ProposalStatus::Applied);
            assert!(loaded.applied_at.is_some());
            assert_eq!(loaded.decided_by.as_deref(), Some("alice"));
            assert_eq!(s.active_rules("financial").unwrap().len(), 1);
        }

        #[test]
        fn test_decision_is_compare_and_set() {
            let s = store();
            let (p, _) = add_rule_proposal(&s);
            assert!(
                s.record_decision(p.id, ProposalStatus::Proposed, ProposalStatus::Rejected, "bob", Some("no"), Utc::now())
                    .unwrap()
            );
            assert!(
                !s.record_decision(p.id, ProposalStatus::Proposed, ProposalStatus::Approved, "eve", None, Utc::now())
                    .unwrap()
            );
            assert_eq!(s.get_proposal(p.id).unwrap().unwrap().status, ProposalStatus::Rejected);
        }

        #[test]
        fn test_revert_deactivates_added_rule() {
            let s = store();
            let (p, rule) = add_rule_proposal(&s);
            s.record_decision(p.id, ProposalStatus::Proposed, ProposalStatus::Approved, "alice", None, Utc::now())
                .unwrap();
            s.apply_approved(p.id, Utc::now()).unwrap();

            assert!(s.revert_applied(p.id, Utc::now()).unwrap());
            assert!(!s.revert_applied(p.id, Utc::now()).unwrap());
            assert!(!s.get_rule(rule.id).unwrap().unwrap().active);
            assert_eq!(s.get_proposal(p.id).unwrap().unwrap().status, ProposalStatus::Reverted);
        }

        #[test]
        fn test_set_preference_application() {
            let s = store();
            let p = NewProposal::new(
                ProposedChange::SetPreference {
                    category: "digest".into(),
                    key: "focus".into(),
                    value: json!("finance"),
                    confidence: 0.8,
                },
                ProposalSource::Pipeline,
            )
            .into_proposal(Utc::now());
            s.insert_proposal(&p).unwrap();
            s.record_decision(p.id, ProposalStatus::Proposed, ProposalStatus::Approved, "alice", None, Utc::now())
                .unwrap();
            s.apply_approved(p.id, Utc::now()).unwrap();

            let pref = s.get_preference("digest", "focus").unwrap().unwrap();
            assert_eq!(pref.value, json!("finance"));
            assert_eq!(pref.source, format!("proposal:{}", p.id));
        }

        #[test]
        fn test_counts_by_status() {
            let s = store();
            add_rule_proposal(&s);
            add_rule_proposal(&s);
            let counts = s.proposal_counts().unwrap();
            assert_eq!(counts, vec![(ProposalStatus::Proposed, 2)]);
            assert_eq!(s.list_proposals(Some(ProposalStatus::Approved)).unwrap().len(), 0);
            assert_eq!(s.list_proposals(None).unwrap().len(), 2);
        }
    }

    // ── Pipeline ───────────────────────────────────────────────

    mod pipeline {
        use super::*;

        #[test]
        fn test_claims_exclude_leased_records() {
            let s = store();
            for i in 0..3 {
                s.insert_record(&json!({"n": i}), "test").unwrap();
            }
            let first = s.claim_batch(Tier::Patterns, 2, 300, "a").unwrap();
            let second = s.claim_batch(Tier::Patterns, 10, 300, "b").unwrap();
            assert_eq!(first.len(), 2);
            assert_eq!(second.len(), 1);
            assert_eq!(second[0].id, 3);
            // Another tier sees every record.
            assert_eq!(s.claim_batch(Tier::Synthesis, 10, 300, "c").unwrap().len(), 3);
        }

        #[test]
        fn test_commit_flags_only_sources() {
            let s = store();
            let a = s.insert_record(&json!({"category": "x"}), "test").unwrap();
            let b = s.insert_record(&json!({"category": "y"}), "test").unwrap();
            let claimed = s.claim_batch(Tier::Patterns, 10, 300, "t").unwrap();
            assert_eq!(claimed.len(), 2);

            let artifact = TierArtifact::new(vec![a], json!({"category": "x"}));
            let commit = s.commit_artifact(Tier::Patterns, "t", &artifact, &[]).unwrap();
            assert!(commit.output_written);
            assert_eq!(commit.records_flagged, 1);

            assert!(s.get_record(a).unwrap().unwrap().stage_flags.patterns_done);
            let untouched = s.get_record(b).unwrap().unwrap();
            assert!(!untouched.stage_flags.patterns_done);
            assert!(!untouched.stage_flags.synthesis_done);
        }

        #[test]
        fn test_commit_with_foreign_token_is_stale() {
            let s = store();
            let id = s.insert_record(&json!({}), "test").unwrap();
            s.claim_batch(Tier::Patterns, 10, 300, "owner").unwrap();

            let artifact = TierArtifact::new(vec![id], json!({}));
            let err = s.commit_artifact(Tier::Patterns, "intruder", &artifact, &[]).unwrap_err();
            assert_eq!(err.code(), "stale_claim");
            assert!(s.tier_outputs(Tier::Patterns).unwrap().is_empty());
            assert!(!s.get_record(id).unwrap().unwrap().stage_flags.patterns_done);
        }

        #[test]
        fn test_expired_lease_is_stale() {
            let s = store();
            let id = s.insert_record(&json!({}), "test").unwrap();
            s.claim_batch(Tier::Patterns, 10, -1, "slow").unwrap();

            let artifact = TierArtifact::new(vec![id], json!({}));
            let err = s.commit_artifact(Tier::Patterns, "slow", &artifact, &[]).unwrap_err();
            assert_eq!(err.code(), "stale_claim");
        }

        #[test]
        fn test_duplicate_output_key_ignored() {
            let s = store();
            let id = s.insert_record(&json!({}), "test").unwrap();
            let artifact = TierArtifact::new(vec![id], json!({"v": 1}));
            assert!(s.insert_tier_output(Tier::Patterns, &artifact).unwrap());

            s.claim_batch(Tier::Patterns, 10, 300, "t").unwrap();
            let commit = s.commit_artifact(Tier::Patterns, "t", &artifact, &[]).unwrap();
            assert!(!commit.output_written);
            assert_eq!(commit.records_flagged, 1);
            assert_eq!(s.tier_outputs(Tier::Patterns).unwrap().len(), 1);
        }

        #[test]
        fn test_release_claims() {
            let s = store();
            s.insert_record(&json!({}), "test").unwrap();
            s.claim_batch(Tier::Patterns, 10, 300, "t").unwrap();
            assert_eq!(s.release_claims(Tier::Patterns, "t").unwrap(), 1);
            assert_eq!(s.claim_batch(Tier::Patterns, 10, 300, "u").unwrap().len(), 1);
            assert_eq!(s.pending_count(Tier::Patterns).unwrap(), 1);
        }
    }

    // ── Audit log ──────────────────────────────────────────────

    mod audit {
        use super::*;

        #[test]
        fn test_append_and_verify() {
            let s = store();
            let rec = s
                .append(AuditEntry::new(
                    AuditSubject::Proposal,
                    "p-1",
                    "approved",
                    json!({"by": "alice", "score": 0.5}),
                ))
                .unwrap();
            assert!(rec.verify());

            let loaded = s.for_subject("p-1").unwrap();
            assert_eq!(loaded.len(), 1);
            assert!(loaded[0].verify());
            assert_eq!(loaded[0].event, "approved");
        }

        #[test]
        fn test_recent_newest_first() {
            let s = store();
            for event in ["one", "two", "three"] {
                s.append(AuditEntry::new(AuditSubject::Pipeline, "patterns", event, json!({})))
                    .unwrap();
            }
            let recent = s.recent(2).unwrap();
            assert_eq!(recent[0].event, "three");
            assert_eq!(recent[1].event, "two");
        }
    }

    // ── Workflows and entities ─────────────────────────────────

    mod workflows {
        use super::*;

        #[test]
        fn test_run_state_round_trip() {
            let s = store();
            let def = WorkflowDefinition::new(
                "greet",
                vec![Step::new("hello", Operation::Notify, json!({"message": "hi"}))],
            );
            s.upsert_definition(&def).unwrap();
            assert_eq!(s.get_definition("greet").unwrap(), Some(def));

            let mut run = WorkflowRun::new("greet", json!({}));
            run.next_step = 1;
            s.save_run(&mut run).unwrap();
            run.finish(RunStatus::Completed, None).unwrap();
            s.save_run(&mut run).unwrap();
            assert_eq!(run.version, 2);

            let loaded = s.get_run(run.id).unwrap().unwrap();
            assert_eq!(loaded.status, RunStatus::Completed);
            assert_eq!(loaded.version, 2);
            assert_eq!(s.list_runs(10).unwrap().len(), 1);
        }

        #[test]
        fn test_save_from_stale_copy_is_refused() {
            let s = store();
            let mut run = WorkflowRun::new("greet", json!({}));
            s.save_run(&mut run).unwrap();

            let mut first = s.get_run(run.id).unwrap().unwrap();
            let mut second = s.get_run(run.id).unwrap().unwrap();
            first.next_step = 1;
            s.save_run(&mut first).unwrap();

            second.next_step = 5;
            let err = s.save_run(&mut second).unwrap_err();
            assert_eq!(err.code(), "stale_run");
            assert_eq!(second.version, 1);
            assert_eq!(s.get_run(run.id).unwrap().unwrap().next_step, 1);

            // A fresh insert of an existing id is a lost race too.
            let mut dup = WorkflowRun::new("greet", json!({}));
            dup.id = run.id;
            assert_eq!(s.save_run(&mut dup).unwrap_err().code(), "stale_run");
        }

        #[test]
        fn test_terminal_run_is_never_rewritten() {
            let s = store();
            let mut run = WorkflowRun::new("greet", json!({}));
            s.save_run(&mut run).unwrap();

            let mut executor = s.get_run(run.id).unwrap().unwrap();
            let mut canceller = s.get_run(run.id).unwrap().unwrap();
            canceller
                .finish(RunStatus::Aborted, Some(AbortReason::Cancelled { completed_steps: 0 }))
                .unwrap();
            s.save_run(&mut canceller).unwrap();

            executor.finish(RunStatus::Completed, None).unwrap();
            assert_eq!(s.save_run(&mut executor).unwrap_err().code(), "stale_run");

            // Even at the current version, a terminal row stays put.
            let mut latest = s.get_run(run.id).unwrap().unwrap();
            latest.status = RunStatus::Running;
            assert_eq!(s.save_run(&mut latest).unwrap_err().code(), "stale_run");
            assert_eq!(s.get_run(run.id).unwrap().unwrap().status, RunStatus::Aborted);
        }

        #[test]
        fn test_entity_query_by_name() {
            let s = store();
            s.create_entity("contact", "Alice Smith", &json!({"email": "a@x"})).unwrap();
            s.create_entity("contact", "Bob", &json!({})).unwrap();
            s.create_entity("note", "alice note", &json!({})).unwrap();

            let hits = s.query_entities("contact", Some("alice"), 10).unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].name, "Alice Smith");
            assert_eq!(s.query_entities("contact", None, 10).unwrap().len(), 2);
        }

        #[test]
        fn test_open_on_disk() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("warden.db");
            let s = SqliteStore::open(&path).unwrap();
            s.insert_record(&json!({}), "disk").unwrap();
            drop(s);
            let reopened = SqliteStore::open(&path).unwrap();
            assert_eq!(reopened.pending_count(Tier::Patterns).unwrap(), 1);
        }
    }
}
