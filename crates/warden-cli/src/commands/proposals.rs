use console::style;

use warden_config::WardenConfig;
use warden_core::{HumanDecision, Proposal, ProposalStatus, Result};

use super::{ProposalAction, open_warden, operator, parse_id, print_json, truncate_output};

pub(super) fn cmd_proposals(config: &WardenConfig, action: ProposalAction) -> Result<()> {
    let warden = open_warden(config)?;
    match action {
        ProposalAction::List { status, json } => {
            let status: Option<ProposalStatus> = status.map(|s| s.parse()).transpose()?;
            let proposals = warden.proposals().list(status)?;
            if json {
                return print_json(&proposals);
            }
            if proposals.is_empty() {
                println!("No proposals.");
            }
            for p in &proposals {
                println!(
                    "{}  {:<10} {:<26} {:<9} {}",
                    style(p.id).dim(),
                    status_label(p.status),
                    p.kind.as_str(),
                    p.source.as_str(),
                    truncate_output(&p.description, 60)
                );
            }
            Ok(())
        }
        ProposalAction::Show { id } => {
            let proposal = warden.proposals().get(parse_id(&id, "proposals show")?)?;
            print_json(&proposal)
        }
        ProposalAction::Approve { id, by, notes } => {
            let mut decision = HumanDecision::approve(parse_id(&id, "proposals approve")?, operator(by));
            if let Some(notes) = notes {
                decision = decision.with_notes(notes);
            }
            report(&warden.decide(&decision)?);
            Ok(())
        }
        ProposalAction::Reject { id, by, notes } => {
            let mut decision = HumanDecision::reject(parse_id(&id, "proposals reject")?, operator(by));
            if let Some(notes) = notes {
                decision = decision.with_notes(notes);
            }
            report(&warden.decide(&decision)?);
            Ok(())
        }
        ProposalAction::Apply { id } => {
            let (proposal, outcome) = warden.apply_proposal(parse_id(&id, "proposals apply")?)?;
            report(&proposal);
            println!("   {}", serde_json::to_string(&outcome)?);
            Ok(())
        }
        ProposalAction::Revert { id } => {
            report(&warden.revert_proposal(parse_id(&id, "proposals revert")?)?);
            Ok(())
        }
        ProposalAction::Stats => {
            let stats = warden.proposals().stats()?;
            println!("{}", style("Proposals").bold());
            println!("   total     {}", stats.total);
            println!("   proposed  {}", stats.proposed);
            println!("   approved  {}", stats.approved);
            println!("   rejected  {}", stats.rejected);
            println!("   applied   {}", stats.applied);
            println!("   reverted  {}", stats.reverted);
            println!("   approval rate {:.0}%", stats.approval_rate * 100.0);
            Ok(())
        }
    }
}

fn status_label(status: ProposalStatus) -> console::StyledObject<&'static str> {
    match status {
        ProposalStatus::Proposed => style(status.as_str()).yellow(),
        ProposalStatus::Approved => style(status.as_str()).cyan(),
        ProposalStatus::Rejected => style(status.as_str()).red(),
        ProposalStatus::Applied => style(status.as_str()).green(),
        ProposalStatus::Reverted => style(status.as_str()).dim(),
    }
}

fn report(proposal: &Proposal) {
    println!(
        "{} {} is now {}",
        style("✓").green(),
        proposal.id,
        status_label(proposal.status)
    );
}
