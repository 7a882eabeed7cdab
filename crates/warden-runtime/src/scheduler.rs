//! # Pipeline schedules
//!
//! Recurring cron entries that fire `pipeline_advance` triggers. Fired
//! triggers go through the same dispatcher as triggers read from input.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_config::PipelineConfig;
use warden_core::{Result, Tier, WardenError};

use crate::trigger::{Trigger, TriggerKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAdvance {
    pub id: Uuid,
    pub label: String,
    pub tier: Tier,
    pub expression: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub fire_count: u64,
    pub last_fired: Option<DateTime<Utc>>,
}

impl ScheduledAdvance {
    /// Whether a scheduled time fell between the last firing (or creation)
    /// and `now`.
    fn is_due(&self, schedule: &Schedule, now: DateTime<Utc>) -> bool {
        let since = self.last_fired.unwrap_or(self.created_at);
        schedule.after(&since).next().is_some_and(|next| next <= now)
    }
}

pub struct PipelineScheduler {
    tasks: Arc<TokioMutex<HashMap<Uuid, ScheduledAdvance>>>,
    trigger_tx: mpsc::Sender<Trigger>,
    check_interval: Duration,
}

impl PipelineScheduler {
    /// Create a scheduler. Returns it with the receiver for fired triggers.
    pub fn new(check_interval: Duration) -> (Self, mpsc::Receiver<Trigger>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        let scheduler = Self {
            tasks: Arc::new(TokioMutex::new(HashMap::new())),
            trigger_tx,
            check_interval,
        };
        (scheduler, trigger_rx)
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tasks: Arc::clone(&self.tasks),
        }
    }

    /// Register every `[[pipeline.schedules]]` entry. Invalid entries are
    /// skipped with a warning.
    pub async fn load_from_config(&self, config: &PipelineConfig) -> usize {
        let handle = self.handle();
        let mut loaded = 0;
        for (i, entry) in config.schedules.iter().enumerate() {
            let label = format!("{}#{i}", entry.tier);
            match handle.add(entry.tier, &entry.cron, label).await {
                Ok(id) => {
                    info!(task_id = %id, tier = %entry.tier, cron = %entry.cron, "loaded pipeline schedule");
                    loaded += 1;
                }
                Err(e) => warn!(error = %e, cron = %entry.cron, "failed to load pipeline schedule"),
            }
        }
        loaded
    }

    /// Triggers for every entry due at `now`. Advances the entries'
    /// bookkeeping; a broken expression deactivates its entry.
    pub async fn collect_due(&self, now: DateTime<Utc>) -> Vec<Trigger> {
        let mut tasks = self.tasks.lock().await;
        let mut due = Vec::new();
        for task in tasks.values_mut().filter(|t| t.active) {
            let schedule = match Schedule::from_str(&task.expression) {
                Ok(s) => s,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "invalid cron expression, deactivating");
                    task.active = false;
                    continue;
                }
            };
            if !task.is_due(&schedule, now) {
                continue;
            }
            task.fire_count += 1;
            task.last_fired = Some(now);
            debug!(task_id = %task.id, tier = %task.tier, fire_count = task.fire_count, "schedule firing");
            due.push(Trigger::new(
                format!("cron:{}:{}", task.label, task.fire_count),
                TriggerKind::PipelineAdvance,
                task.tier.as_str(),
            ));
        }
        due
    }

    /// Check for due entries every `check_interval` until cancelled or the
    /// receiver is dropped.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.check_interval.as_secs_f64(), "pipeline scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("pipeline scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(self.check_interval) => {}
            }
            for trigger in self.collect_due(Utc::now()).await {
                if self.trigger_tx.send(trigger).await.is_err() {
                    warn!("trigger channel closed, scheduler shutting down");
                    return;
                }
            }
        }
    }
}

/// A clone-able handle for managing schedules from other tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    tasks: Arc<TokioMutex<HashMap<Uuid, ScheduledAdvance>>>,
}

impl SchedulerHandle {
    /// Add a recurring advance. An active entry with the same label is
    /// returned instead of creating a duplicate.
    pub async fn add(&self, tier: Tier, cron_expr: &str, label: impl Into<String>) -> Result<Uuid> {
        Schedule::from_str(cron_expr)
            .map_err(|e| WardenError::Config(format!("invalid cron expression '{cron_expr}': {e}")))?;
        let label = label.into();

        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.values().find(|t| t.active && t.label == label) {
            info!(task_id = %existing.id, label = %label, "schedule already exists, skipping");
            return Ok(existing.id);
        }

        let task = ScheduledAdvance {
            id: Uuid::new_v4(),
            label,
            tier,
            expression: cron_expr.to_string(),
            created_at: Utc::now(),
            active: true,
            fire_count: 0,
            last_fired: None,
        };
        let id = task.id;
        tasks.insert(id, task);
        info!(task_id = %id, tier = %tier, cron = cron_expr, "scheduled pipeline advance");
        Ok(id)
    }

    pub async fn remove(&self, task_id: Uuid) -> bool {
        self.tasks.lock().await.remove(&task_id).is_some()
    }

    pub async fn list(&self) -> Vec<ScheduledAdvance> {
        let mut all: Vec<ScheduledAdvance> = self.tasks.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.label.cmp(&b.label));
        all
    }
}
