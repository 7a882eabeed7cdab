use console::style;

use warden_config::WardenConfig;
use warden_core::{Result, Tier};

use super::{PipelineAction, RecordAction, open_warden, parse_json_arg};

pub(super) fn cmd_records(config: &WardenConfig, action: RecordAction) -> Result<()> {
    let warden = open_warden(config)?;
    match action {
        RecordAction::Add { payload, source } => {
            let id = warden.ingest(parse_json_arg(&payload)?, &source)?;
            println!("{} Record {id} collected", style("✓").green());
            Ok(())
        }
    }
}

pub(super) async fn cmd_pipeline(config: &WardenConfig, action: PipelineAction) -> Result<()> {
    let warden = open_warden(config)?;
    match action {
        PipelineAction::Advance { tier } => {
            let tier: Tier = tier.parse()?;
            let report = warden.advance(tier).await?;
            println!("{} {} (tier {})", style("Advanced").bold(), tier, tier.number());
            println!("   claimed       {}", report.claimed);
            println!("   written       {}", report.artifacts_written);
            println!("   deduplicated  {}", report.artifacts_deduplicated);
            println!("   flagged       {}", report.records_flagged);
            if report.stale_artifacts > 0 {
                println!("   stale         {}", style(report.stale_artifacts).yellow());
            }
            if report.proposals_raised > 0 {
                println!(
                    "   proposals     {}  (see 'warden proposals list --status proposed')",
                    style(report.proposals_raised).yellow()
                );
            }
            Ok(())
        }
        PipelineAction::Status => {
            for tier in Tier::ALL {
                println!("{:<10} {} pending", tier.as_str(), warden.pipeline().pending(tier)?);
            }
            Ok(())
        }
    }
}
