use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::{
    ActionDescriptor, AuditEntry, AuditLog, AuditSubject, BoundaryRule, Effect, Event, EventBus,
    Fingerprint, PolicyDecision, PolicyStore, Result, RuleMatch,
};

/// Tunables for the evaluator, normally taken from `[policy]` in config.
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub cache_ttl_secs: u64,
    pub evaluation_timeout: Duration,
    /// Effect when no rule matches.
    pub default_effect: Effect,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            evaluation_timeout: Duration::from_millis(2000),
            default_effect: Effect::RequireApproval,
        }
    }
}

/// Turns action descriptors into decisions.
///
/// Rules are read on a blocking worker under a timeout; a failed or slow read
/// yields a `deny` that is never cached. Fresh decisions are cached by
/// fingerprint for the configured TTL and appended to the audit log.
pub struct PolicyEvaluator {
    store: Arc<dyn PolicyStore>,
    audit: Arc<dyn AuditLog>,
    events: EventBus,
    cache: DashMap<Fingerprint, PolicyDecision>,
    /// Bumped by every clear; a decision built from rules read under an
    /// older generation is not cached.
    generation: AtomicU64,
    ttl_secs: AtomicU64,
    timeout: Duration,
    default_effect: Effect,
}

impl PolicyEvaluator {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        audit: Arc<dyn AuditLog>,
        events: EventBus,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            store,
            audit,
            events,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
            ttl_secs: AtomicU64::new(settings.cache_ttl_secs),
            timeout: settings.evaluation_timeout,
            default_effect: settings.default_effect,
        }
    }

    pub fn evaluation_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cache_ttl_secs(&self) -> u64 {
        self.ttl_secs.load(Ordering::Relaxed)
    }

    /// Change the TTL for decisions made from now on.
    pub fn set_cache_ttl(&self, secs: u64) {
        self.ttl_secs.store(secs, Ordering::Relaxed);
        info!(ttl_secs = secs, "policy cache ttl updated");
    }

    /// Drop every cached decision so a rule change takes effect immediately.
    pub fn clear_cache(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = self.cache.len();
        self.cache.clear();
        debug!(dropped, "policy cache cleared");
        self.events.publish(Event::PolicyCacheCleared);
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }

    pub async fn evaluate(&self, action: &ActionDescriptor) -> Result<PolicyDecision> {
        action.validate()?;
        let fingerprint = action.fingerprint();
        let now = Utc::now();

        if let Some(hit) = self.cache_lookup(&fingerprint, now) {
            debug!(fingerprint = %fingerprint, effect = %hit.effect, "policy cache hit");
            return Ok(hit);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let rules = match self.load_rules(&action.category).await {
            Ok(rules) => rules,
            Err(detail) => {
                warn!(category = %action.category, error = %detail, "policy store unavailable, failing closed");
                let decision = PolicyDecision::unavailable(fingerprint, &action.category, &detail);
                self.events.publish(Event::PolicyUnavailable {
                    category: action.category.clone(),
                    error: detail,
                });
                self.record(action, &decision);
                return Ok(decision);
            }
        };

        let decision = resolve(
            &rules,
            action,
            fingerprint.clone(),
            now,
            self.default_effect,
            self.cache_ttl_secs(),
        );

        info!(
            kind = %action.kind,
            category = %action.category,
            effect = %decision.effect,
            matched = decision.matched_rules.len(),
            "policy decision"
        );

        if decision.ttl_secs > 0 {
            self.cache_insert(generation, fingerprint, &decision);
        }
        self.events.publish(Event::PolicyDecided {
            decision_id: decision.id,
            category: decision.category.clone(),
            effect: decision.effect,
        });
        self.record(action, &decision);
        Ok(decision)
    }

    /// Insert unless a clear happened since the rules were read. The check
    /// runs under the entry's shard lock, which `clear` also takes.
    fn cache_insert(&self, generation: u64, fingerprint: Fingerprint, decision: &PolicyDecision) {
        let entry = self.cache.entry(fingerprint);
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(decision_id = %decision.id, "rules changed during evaluation, not caching");
            return;
        }
        entry.insert(decision.clone());
    }

    fn cache_lookup(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<PolicyDecision> {
        let hit = self.cache.get(fingerprint).map(|d| d.clone())?;
        if hit.is_expired(now) {
            self.cache.remove_if(fingerprint, |_, d| d.is_expired(now));
            return None;
        }
        Some(hit)
    }

    /// Read live rules for `category` off the async executor, bounded by the
    /// evaluation timeout. The error string explains why rules are missing.
    async fn load_rules(&self, category: &str) -> std::result::Result<Vec<BoundaryRule>, String> {
        let store = Arc::clone(&self.store);
        let category = category.to_string();
        let read = tokio::task::spawn_blocking(move || store.active_rules(&category));

        match tokio::time::timeout(self.timeout, read).await {
            Ok(Ok(Ok(rules))) => Ok(rules),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join)) => Err(format!("rule read aborted: {join}")),
            Err(_) => Err(format!("rule read timed out after {}ms", self.timeout.as_millis())),
        }
    }

    fn record(&self, action: &ActionDescriptor, decision: &PolicyDecision) {
        let entry = AuditEntry::new(
            AuditSubject::PolicyDecision,
            decision.id,
            decision.effect.as_str(),
            json!({
                "fingerprint": decision.action_fingerprint,
                "kind": action.kind,
                "category": decision.category,
                "target": action.target,
                "requested_by": action.requested_by,
                "rules": decision.rule_ids(),
                "decisive_rule": decision.decisive_rule,
                "reason": decision.reason,
            }),
        );
        if let Err(e) = self.audit.append(entry) {
            warn!(decision_id = %decision.id, error = %e, "failed to audit policy decision");
        }
    }
}

/// Resolve a decision from candidate rules.
///
/// Only rules that apply to the action at `now` take part. The highest rule
/// tier with any match decides (hard > contextual > soft); within that tier
/// the most severe effect wins. No match falls back to `default_effect`.
pub fn resolve(
    rules: &[BoundaryRule],
    action: &ActionDescriptor,
    fingerprint: Fingerprint,
    now: DateTime<Utc>,
    default_effect: Effect,
    ttl_secs: u64,
) -> PolicyDecision {
    let mut matched: Vec<&BoundaryRule> = rules.iter().filter(|r| r.applies_to(action, now)).collect();
    matched.sort_by(|a, b| {
        b.rule_type
            .precedence()
            .cmp(&a.rule_type.precedence())
            .then(b.effect.cmp(&a.effect))
            .then(a.created_at.cmp(&b.created_at))
    });

    let (effect, decisive_rule, reason) = match matched.first() {
        Some(rule) => {
            let mut reason = format!(
                "{} rule {} on '{}' => {}",
                rule.rule_type, rule.id, rule.category, rule.effect
            );
            if !rule.description.is_empty() {
                reason.push_str(": ");
                reason.push_str(&rule.description);
            }
            (rule.effect, Some(rule.id), reason)
        }
        None => (
            default_effect,
            None,
            format!("no rule matched category '{}'; default {}", action.category, default_effect),
        ),
    };

    PolicyDecision {
        id: Uuid::new_v4(),
        action_fingerprint: fingerprint,
        category: action.category.clone(),
        effect,
        matched_rules: matched.into_iter().map(RuleMatch::from).collect(),
        decisive_rule,
        reason,
        decided_at: now,
        ttl_secs,
    }
}
