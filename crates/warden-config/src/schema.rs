use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use warden_core::{Effect, Tier};

/// Root configuration, mapped from `warden.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub store: StoreConfig,
    pub policy: PolicyConfig,
    pub workflow: WorkflowConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// `~/.warden`, or `./.warden` without a home directory.
pub fn warden_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. `:memory:` keeps everything in process.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: warden_home().join("warden.db"),
        }
    }
}

// ── Policy ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// How long a decision is served from cache. 0 disables caching.
    pub cache_ttl_secs: u64,
    /// Upper bound on reading rules from the store.
    pub evaluation_timeout_ms: u64,
    /// Effect when no rule matches an action.
    pub default_effect: Effect,
    /// Apply rule changes directly instead of raising proposals.
    pub direct_authoring: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            evaluation_timeout_ms: 2000,
            default_effect: Effect::RequireApproval,
            direct_authoring: false,
        }
    }
}

// ── Workflow ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Extra attempts for steps with `on_failure = "retry"`.
    pub max_retries: u32,
    pub handler_timeout_secs: u64,
    /// Cap on a single `wait` step.
    pub max_wait_secs: u64,
    /// Directory of `*.json` definitions loaded at startup.
    pub definitions_dir: Option<PathBuf>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            handler_timeout_secs: 30,
            max_wait_secs: 60,
            definitions_dir: None,
        }
    }
}

// ── Pipeline ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Records leased per advance.
    pub batch_size: usize,
    pub lease_secs: i64,
    pub processor_timeout_secs: u64,
    /// Share of a synthesis batch one category needs before a preference
    /// proposal is raised.
    pub dominance_ratio: f64,
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease_secs: 300,
            processor_timeout_secs: 120,
            dominance_ratio: 0.6,
            schedules: Vec::new(),
        }
    }
}

/// A cron-driven `advance(tier)` fired by `warden serve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub tier: Tier,
    /// Six- or seven-field cron expression (seconds first).
    pub cron: String,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
    /// Log file path (None = stderr only).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "note",
        };
        write!(f, "{label}: {}: {}", self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {h}")?;
        }
        Ok(())
    }
}

impl WardenConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Store ───
        if self.store.db_path.as_os_str().is_empty() {
            warnings.push(ConfigWarning {
                field: "store.db_path".into(),
                message: "database path is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. '~/.warden/warden.db' or ':memory:'".into()),
            });
        }

        // ── Policy ───
        if self.policy.evaluation_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "policy.evaluation_timeout_ms".into(),
                message: "timeout is 0, every evaluation would fail closed".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 2000".into()),
            });
        }
        if self.policy.cache_ttl_secs == 0 {
            warnings.push(ConfigWarning {
                field: "policy.cache_ttl_secs".into(),
                message: "decision cache disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }
        match self.policy.default_effect {
            Effect::Allow => warnings.push(ConfigWarning {
                field: "policy.default_effect".into(),
                message: "unmatched actions run without approval".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Prefer 'require_approval' with explicit allow rules".into()),
            }),
            Effect::Deny => warnings.push(ConfigWarning {
                field: "policy.default_effect".into(),
                message: "unmatched mutating steps are always denied".into(),
                severity: WarningSeverity::Info,
                hint: None,
            }),
            Effect::Warn | Effect::RequireApproval => {}
        }
        if self.policy.direct_authoring {
            warnings.push(ConfigWarning {
                field: "policy.direct_authoring".into(),
                message: "rule changes bypass the proposal lifecycle".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Leave false so every rule change is approved by a human".into()),
            });
        }

        // ── Workflow ───
        if self.workflow.handler_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "workflow.handler_timeout_secs".into(),
                message: "timeout is 0, every step would time out".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 30".into()),
            });
        }
        if self.workflow.max_retries > 10 {
            warnings.push(ConfigWarning {
                field: "workflow.max_retries".into(),
                message: format!("{} retries per step is very high", self.workflow.max_retries),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if let Some(dir) = &self.workflow.definitions_dir
            && !dir.is_dir()
        {
            warnings.push(ConfigWarning {
                field: "workflow.definitions_dir".into(),
                message: format!("{} is not a directory", dir.display()),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Pipeline ───
        if self.pipeline.batch_size == 0 {
            warnings.push(ConfigWarning {
                field: "pipeline.batch_size".into(),
                message: "batch size is 0, advances would never claim records".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 100".into()),
            });
        }
        if self.pipeline.lease_secs <= 0 {
            warnings.push(ConfigWarning {
                field: "pipeline.lease_secs".into(),
                message: "lease must be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("Use a lease longer than processor_timeout_secs".into()),
            });
        } else if (self.pipeline.lease_secs as u64) < self.pipeline.processor_timeout_secs {
            warnings.push(ConfigWarning {
                field: "pipeline.lease_secs".into(),
                message: "lease is shorter than the processor timeout; slow batches will go stale".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if !(self.pipeline.dominance_ratio > 0.0 && self.pipeline.dominance_ratio <= 1.0) {
            warnings.push(ConfigWarning {
                field: "pipeline.dominance_ratio".into(),
                message: format!("{} is outside (0, 1]", self.pipeline.dominance_ratio),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 0.6".into()),
            });
        }
        for (i, schedule) in self.pipeline.schedules.iter().enumerate() {
            if let Err(e) = cron::Schedule::from_str(&schedule.cron) {
                warnings.push(ConfigWarning {
                    field: format!("pipeline.schedules[{i}].cron"),
                    message: format!("invalid cron expression '{}': {e}", schedule.cron),
                    severity: WarningSeverity::Error,
                    hint: Some("Seconds come first, e.g. '0 */15 * * * *'".into()),
                });
            }
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }

    /// Render as TOML, as written by `warden init`.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }
}
