use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use uuid::Uuid;

use warden_config::{ConfigLoader, WardenConfig, WarningSeverity};
use warden_core::{AuditLog, AuditSubject, Result, WardenError};
use warden_runtime::Warden;

mod pipeline;
mod proposals;
mod rules;
mod serve;
mod setup;
mod workflow;

/// Warden — policy-governed actions with human-approved self-change
#[derive(Parser)]
#[command(name = "warden", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to warden.toml config file
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default warden.toml
    Init {
        /// Create in the current directory instead of ~/.warden/
        #[arg(long)]
        local: bool,
    },
    /// Show current configuration and validation findings
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage boundary rules
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Evaluate an action against the active rules
    Eval {
        /// Action kind (e.g. transfer, create_record)
        kind: String,
        /// Action category (e.g. financial, records)
        #[arg(long)]
        category: String,
        #[arg(long, default_value = "")]
        target: String,
        /// JSON payload, or @path to read it from a file
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value = "cli")]
        requested_by: String,
    },
    /// Define, run and inspect workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Review proposed changes
    Proposals {
        #[command(subcommand)]
        action: ProposalAction,
    },
    /// Insert raw records into the pipeline
    Records {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Advance pipeline tiers
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },
    /// Show the audit trail for one subject
    Audit {
        /// Run id, proposal id, decision id, rule id or tier
        subject_id: String,
        /// Recompute and check each entry's checksum
        #[arg(long)]
        verify: bool,
    },
    /// Show recent audit log entries
    Logs {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        /// Filter by subject kind (policy_decision, workflow_run, proposal, pipeline, rule)
        #[arg(short = 'k', long)]
        kind: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Dispatch JSON-lines triggers from stdin and fire scheduled advances
    Serve {
        /// Seconds between schedule checks
        #[arg(long, default_value = "30")]
        check_interval: u64,
        /// Ignore [[pipeline.schedules]]
        #[arg(long)]
        no_schedules: bool,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// List rules
    List {
        /// Include inactive rules
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Author a rule (proposed unless policy.direct_authoring is on)
    Add {
        /// hard, soft or contextual
        #[arg(long = "type")]
        rule_type: String,
        /// Category, or "all"
        #[arg(long)]
        category: String,
        /// allow, warn, require_approval or deny
        #[arg(long)]
        effect: String,
        /// Predicate as JSON, e.g. '{"type":"kind_is","kind":"transfer"}'
        #[arg(long)]
        predicate: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// RFC 3339 expiry
        #[arg(long)]
        expires: Option<String>,
    },
    /// Deactivate a rule
    Deactivate { id: String },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Store a definition from a JSON file
    Define { file: PathBuf },
    /// Check a definition file without storing it
    Validate { file: PathBuf },
    /// List definitions, or recent runs with --runs
    List {
        #[arg(long)]
        runs: bool,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Start a run
    Run {
        name: String,
        /// JSON input, or @path to read it from a file
        #[arg(long)]
        input: Option<String>,
    },
    /// Continue a run suspended on an approval
    Resume { run_id: String },
    /// Show a run and its step results
    Show {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Abort a run that has not finished
    Cancel { run_id: String },
}

#[derive(Subcommand)]
enum ProposalAction {
    /// List proposals
    List {
        /// proposed, approved, rejected, applied or reverted
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show one proposal
    Show { id: String },
    /// Approve a proposal
    Approve {
        id: String,
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a proposal
    Reject {
        id: String,
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Apply an approved proposal
    Apply { id: String },
    /// Revert an applied proposal
    Revert { id: String },
    /// Counts by status and approval rate
    Stats,
}

#[derive(Subcommand)]
enum RecordAction {
    /// Insert a record; the payload is JSON or @path
    Add {
        payload: String,
        #[arg(long)]
        source: String,
    },
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Run one batch of a tier (patterns or synthesis)
    Advance { tier: String },
    /// Pending record counts per tier
    Status,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Init and completions work without a readable config.
        match self.command {
            Commands::Init { local } => return setup::cmd_init(self.config, local),
            Commands::Completions { shell } => return Self::cmd_completions(shell),
            _ => {}
        }

        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config; RUST_LOG wins over all.
        let log_level = if self.verbose {
            "debug".to_string()
        } else if self.quiet {
            "error".to_string()
        } else {
            self.log_level.clone().unwrap_or_else(|| config.logging.level.clone())
        };
        init_tracing(&config, &log_level)?;

        match self.command {
            Commands::Init { .. } | Commands::Completions { .. } => Ok(()),
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Rules { action } => rules::cmd_rules(&config, action),
            Commands::Eval {
                kind,
                category,
                target,
                payload,
                requested_by,
            } => rules::cmd_eval(&config, kind, category, target, payload, requested_by).await,
            Commands::Workflow { action } => workflow::cmd_workflow(&config, action).await,
            Commands::Proposals { action } => proposals::cmd_proposals(&config, action),
            Commands::Records { action } => pipeline::cmd_records(&config, action),
            Commands::Pipeline { action } => pipeline::cmd_pipeline(&config, action).await,
            Commands::Audit { subject_id, verify } => Self::cmd_audit(&config, &subject_id, verify),
            Commands::Logs { limit, kind, json } => Self::cmd_logs(&config, limit, kind, json),
            Commands::Serve {
                check_interval,
                no_schedules,
            } => serve::cmd_serve(config_loader, check_interval, no_schedules).await,
        }
    }

    fn cmd_config(config: &WardenConfig, json: bool) -> Result<()> {
        if json {
            print_json(config)?;
        } else {
            println!("{}", config.to_toml().map_err(WardenError::Config)?);
        }

        // Load already rejected hard errors.
        let warnings = config.validate().map_err(WardenError::Config)?;
        for w in &warnings {
            let line = w.to_string();
            match w.severity {
                WarningSeverity::Error => eprintln!("{}", style(line).red()),
                WarningSeverity::Warning => eprintln!("{}", style(line).yellow()),
                WarningSeverity::Info => eprintln!("{}", style(line).dim()),
            }
        }
        Ok(())
    }

    fn cmd_audit(config: &WardenConfig, subject_id: &str, verify: bool) -> Result<()> {
        let warden = open_warden(config)?;
        let entries = warden.store().for_subject(subject_id)?;
        if entries.is_empty() {
            println!("No audit entries for {subject_id}.");
            return Ok(());
        }

        println!("{} ({} entries)", style("Audit trail").bold(), entries.len());
        let mut tampered = 0;
        for entry in &entries {
            let mark = if !verify {
                String::new()
            } else if entry.verify() {
                format!(" {}", style("ok").green())
            } else {
                tampered += 1;
                format!(" {}", style("CHECKSUM MISMATCH").red().bold())
            };
            println!(
                "{}  {}  {}{mark}",
                style(entry.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
                style(&entry.event).cyan(),
                truncate_output(&entry.details.to_string(), 100),
            );
        }
        if tampered > 0 {
            return Err(WardenError::Store(format!(
                "{tampered} audit entr{} failed verification",
                if tampered == 1 { "y" } else { "ies" }
            )));
        }
        Ok(())
    }

    fn cmd_logs(config: &WardenConfig, limit: usize, kind: Option<String>, json: bool) -> Result<()> {
        let warden = open_warden(config)?;
        let kind: Option<AuditSubject> = kind.map(|k| k.parse()).transpose()?;
        let entries: Vec<_> = warden
            .store()
            .recent(limit)?
            .into_iter()
            .filter(|e| kind.is_none_or(|k| e.subject_kind == k))
            .collect();

        if json {
            return print_json(&entries);
        }
        if entries.is_empty() {
            println!("No audit log entries.");
            return Ok(());
        }

        println!("{} ({} entries)", style("Audit Log").bold(), entries.len());
        println!("{}", "-".repeat(80));
        for entry in &entries {
            let event = match entry.event.as_str() {
                e if e.contains("denied") || e == "aborted" || e == "failed" => style(e).red(),
                e if e.contains("suspended") || e == "proposed" => style(e).yellow(),
                e if e == "applied" || e == "completed" => style(e).green(),
                e => style(e).cyan(),
            };
            println!(
                "{}  {:<16} {}  {}",
                style(entry.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
                entry.subject_kind.as_str(),
                event,
                entry.subject_id,
            );
        }
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "warden", &mut std::io::stdout());
        Ok(())
    }
}

/// Logs go to stderr (stdout carries command output and serve reports)
/// or to `logging.file` when set.
fn init_tracing(config: &WardenConfig, level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (writer, ansi) = match &config.logging.file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(std::sync::Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);
    match config.logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
    Ok(())
}

pub(crate) fn open_warden(config: &WardenConfig) -> Result<Warden> {
    Warden::open(config.clone())
}

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.trim().parse().map_err(|_| WardenError::InvalidParams {
        operation: what.to_string(),
        reason: format!("'{raw}' is not a valid id"),
    })
}

/// Inline JSON, or `@path` to read it from a file.
pub(crate) fn parse_json_arg(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => raw.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Who is deciding, for `--by` defaults.
pub(crate) fn operator(explicit: Option<String>) -> String {
    let non_empty = |s: &String| !s.trim().is_empty();
    explicit
        .filter(non_empty)
        .or_else(|| std::env::var("USER").ok().filter(non_empty))
        .unwrap_or_else(|| "operator".to_string())
}

/// Truncate a string to `max` characters, appending "..." if truncated.
pub(crate) fn truncate_output(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    }
}
