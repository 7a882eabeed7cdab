use console::style;

use warden_config::WardenConfig;
use warden_core::{
    ActionDescriptor, Effect, NewBoundaryRule, PolicyStore, Predicate, Result, RuleType, WardenError,
};
use warden_runtime::RuleAuthoring;

use super::{RuleAction, open_warden, operator, parse_id, parse_json_arg, print_json};

pub(super) fn cmd_rules(config: &WardenConfig, action: RuleAction) -> Result<()> {
    let warden = open_warden(config)?;
    match action {
        RuleAction::List { all, json } => {
            let rules = warden.store().list_rules(all)?;
            if json {
                return print_json(&rules);
            }
            if rules.is_empty() {
                println!("No rules. Unmatched actions get '{}'.", config.policy.default_effect);
                return Ok(());
            }
            for rule in &rules {
                let effect = match rule.effect {
                    Effect::Deny => style(rule.effect.as_str()).red(),
                    Effect::RequireApproval => style(rule.effect.as_str()).yellow(),
                    Effect::Warn => style(rule.effect.as_str()).magenta(),
                    Effect::Allow => style(rule.effect.as_str()).green(),
                };
                let state = if rule.active { "" } else { " (inactive)" };
                println!(
                    "{}  {:<10} {:<20} {:<16} {}{}",
                    style(rule.id).dim(),
                    rule.rule_type.as_str(),
                    rule.category,
                    effect,
                    rule.description,
                    style(state).dim(),
                );
            }
            Ok(())
        }
        RuleAction::Add {
            rule_type,
            category,
            effect,
            predicate,
            description,
            expires,
        } => {
            let rule_type: RuleType = rule_type.parse()?;
            let effect: Effect = effect.parse()?;
            let mut rule = NewBoundaryRule::new(rule_type, category, effect).with_description(description);
            if let Some(raw) = predicate {
                let predicate: Predicate = serde_json::from_value(parse_json_arg(&raw)?)?;
                rule = rule.with_predicate(predicate);
            }
            if let Some(raw) = expires {
                let at = chrono::DateTime::parse_from_rfc3339(&raw).map_err(|e| WardenError::InvalidParams {
                    operation: "rules add".into(),
                    reason: format!("invalid --expires '{raw}': {e}"),
                })?;
                rule.expires_at = Some(at.with_timezone(&chrono::Utc));
            }
            report_authoring(warden.author_rule(rule, &operator(None))?)
        }
        RuleAction::Deactivate { id } => {
            let id = parse_id(&id, "rules deactivate")?;
            report_authoring(warden.deactivate_rule(id, &operator(None))?)
        }
    }
}

fn report_authoring(result: RuleAuthoring) -> Result<()> {
    match result {
        RuleAuthoring::Direct { rule } => {
            let verb = if rule.active { "Created" } else { "Deactivated" };
            println!("{} {verb} rule {}", style("✓").green(), rule.id);
        }
        RuleAuthoring::Proposed { proposal } => {
            println!("{} Proposed as {}", style("?").yellow(), proposal.id);
            println!("   Approve with: warden proposals approve {}", proposal.id);
            println!("   Then apply:   warden proposals apply {}", proposal.id);
        }
    }
    Ok(())
}

pub(super) async fn cmd_eval(
    config: &WardenConfig,
    kind: String,
    category: String,
    target: String,
    payload: Option<String>,
    requested_by: String,
) -> Result<()> {
    let warden = open_warden(config)?;
    let mut action = ActionDescriptor::new(kind, category)
        .with_target(target)
        .requested_by(requested_by);
    if let Some(raw) = payload {
        action = action.with_payload(parse_json_arg(&raw)?);
    }

    let decision = warden.evaluator().evaluate(&action).await?;
    let effect = match decision.effect {
        Effect::Deny => style(decision.effect.as_str()).red().bold(),
        Effect::RequireApproval => style(decision.effect.as_str()).yellow().bold(),
        Effect::Warn => style(decision.effect.as_str()).magenta().bold(),
        Effect::Allow => style(decision.effect.as_str()).green().bold(),
    };
    println!("{effect}  {}", decision.reason);
    for m in &decision.matched_rules {
        println!(
            "   {} {} {} => {}",
            style(m.rule_id).dim(),
            m.rule_type,
            m.category,
            m.effect
        );
    }
    println!("{}", style(format!("decision {}", decision.id)).dim());
    Ok(())
}
