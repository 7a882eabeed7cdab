use console::style;
use serde_json::Value;
use std::path::Path;

use warden_config::WardenConfig;
use warden_core::{Result, RunStatus, StepOutcome, WorkflowDefinition, WorkflowRun, WorkflowStore};
use warden_runtime::Warden;

use super::{WorkflowAction, open_warden, parse_id, parse_json_arg, print_json, truncate_output};

pub(super) async fn cmd_workflow(config: &WardenConfig, action: WorkflowAction) -> Result<()> {
    let warden = open_warden(config)?;
    match action {
        WorkflowAction::Define { file } => {
            let definition = read_definition(&file)?;
            warden.define_workflow(&definition)?;
            println!(
                "{} Defined '{}' ({} steps)",
                style("✓").green(),
                definition.name,
                definition.steps.len()
            );
            Ok(())
        }
        WorkflowAction::Validate { file } => {
            let definition = read_definition(&file)?;
            warden.interpreter().validate(&definition)?;
            println!("{} '{}' is valid", style("✓").green(), definition.name);
            for (i, step) in definition.steps.iter().enumerate() {
                println!("   {i:>2}. {:<20} {}", step.name, step.operation);
            }
            Ok(())
        }
        WorkflowAction::List { runs, limit } => {
            if runs {
                for run in warden.store().list_runs(limit)? {
                    println!(
                        "{}  {:<20} {:<10} {}",
                        style(run.id).dim(),
                        run.definition,
                        status_label(&run),
                        style(run.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
                    );
                }
                return Ok(());
            }
            let definitions = warden.store().list_definitions()?;
            if definitions.is_empty() {
                println!("No workflows defined.");
            }
            for def in definitions {
                let state = if def.enabled { "" } else { " (disabled)" };
                println!(
                    "{:<24} {:>2} steps  {}{}",
                    def.name,
                    def.steps.len(),
                    def.description,
                    style(state).dim()
                );
            }
            Ok(())
        }
        WorkflowAction::Run { name, input } => {
            let input = match input {
                Some(raw) => parse_json_arg(&raw)?,
                None => Value::Null,
            };
            let run = warden.run_workflow(&name, input).await?;
            print_run(&warden, &run);
            Ok(())
        }
        WorkflowAction::Resume { run_id } => {
            let run = warden.resume(parse_id(&run_id, "workflow resume")?).await?;
            print_run(&warden, &run);
            Ok(())
        }
        WorkflowAction::Show { run_id, json } => {
            let run = warden.run_record(parse_id(&run_id, "workflow show")?)?;
            if json {
                return print_json(&run);
            }
            print_run(&warden, &run);
            Ok(())
        }
        WorkflowAction::Cancel { run_id } => {
            let run_id = parse_id(&run_id, "workflow cancel")?;
            match warden.cancel_run(run_id)? {
                Some(run) => print_run(&warden, &run),
                None => println!("Cancellation requested for {run_id}"),
            }
            Ok(())
        }
    }
}

fn read_definition(path: &Path) -> Result<WorkflowDefinition> {
    WorkflowDefinition::from_json(&std::fs::read_to_string(path)?)
}

fn status_label(run: &WorkflowRun) -> console::StyledObject<&'static str> {
    match run.status {
        RunStatus::Completed => style("completed").green(),
        RunStatus::Aborted => style("aborted").red(),
        RunStatus::Running if run.is_suspended() => style("suspended").yellow(),
        RunStatus::Running => style("running").cyan(),
    }
}

fn print_run(warden: &Warden, run: &WorkflowRun) {
    println!("{} {} ({})", style("Run").bold(), run.id, run.definition);
    println!("   Status: {}", status_label(run));
    for result in &run.step_results {
        let label = match &result.outcome {
            StepOutcome::Executed { warning: Some(_), .. } => style("executed*").magenta(),
            StepOutcome::Executed { .. } => style("executed").green(),
            StepOutcome::Failed { .. } | StepOutcome::Denied { .. } => style(result.outcome.label()).red(),
            StepOutcome::Skipped { .. } => style("skipped").dim(),
            StepOutcome::AwaitingApproval { .. } => style("awaiting").yellow(),
        };
        let detail = match &result.outcome {
            StepOutcome::Executed { data, warning } => warning
                .clone()
                .or_else(|| data.as_ref().map(|d| d.to_string()))
                .unwrap_or_default(),
            StepOutcome::Failed { error } => error.clone(),
            StepOutcome::Skipped { reason } | StepOutcome::Denied { reason, .. } => reason.clone(),
            StepOutcome::AwaitingApproval { reason, .. } => reason.clone(),
        };
        println!(
            "   {:>2}. {:<20} {:<10} {}",
            result.index,
            result.step,
            label,
            style(truncate_output(&detail, 80)).dim()
        );
    }
    if let Some(reason) = &run.abort_reason {
        println!("   Reason: {}", style(reason).red());
    }
    if let Some(proposal_id) = run.suspended_on {
        let pending = warden
            .proposals()
            .get(proposal_id)
            .map(|p| p.description)
            .unwrap_or_default();
        println!("   Waiting on proposal {proposal_id} {}", style(pending).dim());
        println!("   Decide with: warden proposals approve|reject {proposal_id}");
        println!("   Then:        warden workflow resume {}", run.id);
    }
}
