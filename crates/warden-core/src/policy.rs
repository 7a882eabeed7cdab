use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use crate::action::{ActionDescriptor, Fingerprint};
use crate::error::{Result, WardenError};

/// Reason attached to fail-closed decisions.
pub const POLICY_UNAVAILABLE: &str = "policy_unavailable";

/// Category that matches every action category.
pub const ALL_CATEGORIES: &str = "all";

/// How binding a boundary rule is.
///
/// Precedence when rules of several types match: hard > contextual > soft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Hard,
    Soft,
    Contextual,
}

impl RuleType {
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Hard => 3,
            Self::Contextual => 2,
            Self::Soft => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
            Self::Contextual => "contextual",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hard" => Ok(Self::Hard),
            "soft" => Ok(Self::Soft),
            "contextual" => Ok(Self::Contextual),
            other => Err(WardenError::InvalidAction(format!("unknown rule type '{other}'"))),
        }
    }
}

/// What a rule (or a decision) does to an action.
///
/// Variant order is severity order: `Allow < Warn < RequireApproval < Deny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Warn,
    RequireApproval,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::RequireApproval => "require_approval",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(Self::Allow),
            "warn" => Ok(Self::Warn),
            "require_approval" => Ok(Self::RequireApproval),
            "deny" => Ok(Self::Deny),
            other => Err(WardenError::InvalidAction(format!("unknown effect '{other}'"))),
        }
    }
}

/// The matching condition of a boundary rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Every action in the rule's category.
    #[default]
    Always,
    KindIs { kind: String },
    /// Regex over the action target (case-insensitive).
    TargetMatches { pattern: String },
    PayloadEquals { key: String, value: Value },
    RequestedBy { requester: String },
    /// UTC hour window `[start, end)`; wraps past midnight when `start > end`.
    HourBetween { start: u32, end: u32 },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { inner: Box<Predicate> },
}

impl Predicate {
    pub fn matches(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> bool {
        match self {
            Self::Always => true,
            Self::KindIs { kind } => action.kind == *kind,
            Self::TargetMatches { pattern } => match case_insensitive(pattern) {
                Ok(re) => re.is_match(&action.target),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid target pattern, rule skipped");
                    false
                }
            },
            Self::PayloadEquals { key, value } => action.payload.get(key) == Some(value),
            Self::RequestedBy { requester } => action.requested_by == *requester,
            Self::HourBetween { start, end } => {
                let hour = now.hour();
                if start <= end {
                    hour >= *start && hour < *end
                } else {
                    hour >= *start || hour < *end
                }
            }
            Self::All { of } => of.iter().all(|p| p.matches(action, now)),
            Self::Any { of } => of.iter().any(|p| p.matches(action, now)),
            Self::Not { inner } => !inner.matches(action, now),
        }
    }

    /// Reject predicates that could never evaluate correctly.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::TargetMatches { pattern } => case_insensitive(pattern)
                .map(|_| ())
                .map_err(|e| WardenError::InvalidAction(format!("bad target pattern: {e}"))),
            Self::HourBetween { start, end } if *start > 23 || *end > 24 => Err(
                WardenError::InvalidAction(format!("hour window {start}-{end} out of range")),
            ),
            Self::All { of } | Self::Any { of } => of.iter().try_for_each(Predicate::validate),
            Self::Not { inner } => inner.validate(),
            _ => Ok(()),
        }
    }
}

fn case_insensitive(pattern: &str) -> std::result::Result<regex::Regex, regex::Error> {
    regex::RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// A policy statement restricting or permitting a category of action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryRule {
    pub id: Uuid,
    pub rule_type: RuleType,
    pub category: String,
    #[serde(default)]
    pub predicate: Predicate,
    pub effect: Effect,
    #[serde(default)]
    pub description: String,
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BoundaryRule {
    /// Active and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|exp| exp > now)
    }

    pub fn covers_category(&self, category: &str) -> bool {
        self.category == category || self.category == ALL_CATEGORIES
    }

    /// Whether this rule participates in the decision for `action`.
    pub fn applies_to(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> bool {
        self.is_live(now)
            && self.covers_category(&action.category)
            && self.predicate.matches(action, now)
    }
}

/// Authoring input for a rule. The id is fixed up front so that applying the
/// same authoring proposal twice targets the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBoundaryRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub rule_type: RuleType,
    pub category: String,
    #[serde(default)]
    pub predicate: Predicate,
    pub effect: Effect,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewBoundaryRule {
    pub fn new(rule_type: RuleType, category: impl Into<String>, effect: Effect) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_type,
            category: category.into(),
            predicate: Predicate::Always,
            effect,
            description: String::new(),
            expires_at: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.category.trim().is_empty() {
            return Err(WardenError::InvalidAction("rule category must not be empty".into()));
        }
        self.predicate.validate()
    }

    pub fn into_rule(self, created_at: DateTime<Utc>) -> BoundaryRule {
        BoundaryRule {
            id: self.id,
            rule_type: self.rule_type,
            category: self.category,
            predicate: self.predicate,
            effect: self.effect,
            description: self.description,
            active: true,
            expires_at: self.expires_at,
            created_at,
        }
    }
}

/// A rule that matched during evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: Uuid,
    pub rule_type: RuleType,
    pub category: String,
    pub effect: Effect,
    pub description: String,
}

impl From<&BoundaryRule> for RuleMatch {
    fn from(rule: &BoundaryRule) -> Self {
        Self {
            rule_id: rule.id,
            rule_type: rule.rule_type,
            category: rule.category.clone(),
            effect: rule.effect,
            description: rule.description.clone(),
        }
    }
}

/// The evaluator's verdict for one action fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub id: Uuid,
    pub action_fingerprint: Fingerprint,
    pub category: String,
    pub effect: Effect,
    pub matched_rules: Vec<RuleMatch>,
    /// The rule whose effect became the decision, if any rule matched.
    pub decisive_rule: Option<Uuid>,
    /// Human-readable cause: the decisive rule and category, or a fixed code
    /// such as `policy_unavailable`.
    pub reason: String,
    pub decided_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl PolicyDecision {
    /// A TTL too large to represent never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.decided_at.checked_add_signed(ttl))
            .is_some_and(|expiry| now >= expiry)
    }

    pub fn is_denied(&self) -> bool {
        self.effect == Effect::Deny
    }

    /// Decision issued when the policy store cannot be consulted.
    pub fn unavailable(fingerprint: Fingerprint, category: &str, detail: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_fingerprint: fingerprint,
            category: category.to_string(),
            effect: Effect::Deny,
            matched_rules: Vec::new(),
            decisive_rule: None,
            reason: format!("{POLICY_UNAVAILABLE}: {detail}"),
            decided_at: Utc::now(),
            ttl_secs: 0,
        }
    }

    pub fn rule_ids(&self) -> Vec<Uuid> {
        self.matched_rules.iter().map(|m| m.rule_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_decision_expiry_with_huge_ttl() {
        let mut decision = PolicyDecision::unavailable(Fingerprint("f".into()), "financial", "test");
        decision.ttl_secs = 60;
        assert!(!decision.is_expired(decision.decided_at));
        assert!(decision.is_expired(decision.decided_at + chrono::Duration::seconds(60)));

        decision.ttl_secs = u64::MAX;
        assert!(!decision.is_expired(decision.decided_at + chrono::Duration::days(365)));
    }

    #[test]
    fn test_effect_severity_order() {
        assert!(Effect::Deny > Effect::RequireApproval);
        assert!(Effect::RequireApproval > Effect::Warn);
        assert!(Effect::Warn > Effect::Allow);
    }

    #[test]
    fn test_hour_window_wraps_midnight() {
        let p = Predicate::HourBetween { start: 22, end: 6 };
        let action = ActionDescriptor::new("send", "communication");
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(p.matches(&action, late));
        assert!(!p.matches(&action, noon));
    }

    #[test]
    fn test_composite_predicates() {
        let p = Predicate::All {
            of: vec![
                Predicate::KindIs { kind: "send".into() },
                Predicate::Not {
                    inner: Box::new(Predicate::PayloadEquals {
                        key: "vip".into(),
                        value: json!(true),
                    }),
                },
            ],
        };
        let plain = ActionDescriptor::new("send", "email").with_payload(json!({"vip": false}));
        let vip = ActionDescriptor::new("send", "email").with_payload(json!({"vip": true}));
        assert!(p.matches(&plain, Utc::now()));
        assert!(!p.matches(&vip, Utc::now()));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_authoring() {
        let rule = NewBoundaryRule::new(RuleType::Soft, "email", Effect::Warn)
            .with_predicate(Predicate::TargetMatches { pattern: "(".into() });
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_expired_rule_is_not_live() {
        let mut rule = NewBoundaryRule::new(RuleType::Hard, "financial", Effect::Deny)
            .into_rule(Utc::now());
        assert!(rule.is_live(Utc::now()));
        rule.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(!rule.is_live(Utc::now()));
    }
}
