use console::style;
use std::path::PathBuf;

use warden_config::ConfigLoader;
use warden_core::Result;

pub(super) fn cmd_init(explicit: Option<PathBuf>, local: bool) -> Result<()> {
    let config_path = if local {
        std::env::current_dir()?.join("warden.toml")
    } else {
        ConfigLoader::resolve_path(explicit.as_deref())
    };

    if !ConfigLoader::write_default(&config_path)? {
        println!("{} {} already exists", style("!").yellow(), config_path.display());
        println!("   Edit it directly or run 'warden config' to see the effective settings.");
        return Ok(());
    }

    println!("{} Created {}", style("✓").green(), config_path.display());
    println!();
    println!("Defaults:");
    println!("   Unmatched actions require approval (policy.default_effect)");
    println!("   Rule changes go through proposals (policy.direct_authoring = false)");
    println!();
    println!("Next steps:");
    println!("   warden rules add --type hard --category financial --effect deny");
    println!("   warden workflow define my-workflow.json");
    println!("   warden serve < triggers.jsonl");
    Ok(())
}
