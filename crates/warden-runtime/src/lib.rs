//! # warden-runtime
//!
//! Wires the governed components together from a [`WardenConfig`].
//!
//! ```text
//!   triggers (stdin, cron)          human decisions (CLI)
//!            │                               │
//!            ▼                               ▼
//!   ┌─────────────────┐   step_approval  ┌────────────────┐
//!   │   Dispatcher    │ ───────────────▶ │   Proposals    │
//!   └───┬─────────┬───┘                  └───────┬────────┘
//!       │         │                              │ apply
//!       ▼         ▼                              ▼
//!  Interpreter  Pipeline ── set_preference ──▶  Store
//!       │
//!       ▼
//!   Evaluator ◀── cache cleared when boundary proposals apply
//! ```
//!
//! [`WardenConfig`]: warden_config::WardenConfig

pub mod handlers;
pub mod scheduler;
pub mod serve;
pub mod trigger;
pub mod warden;

pub use handlers::store_backed_registry;
pub use scheduler::{PipelineScheduler, ScheduledAdvance, SchedulerHandle};
pub use serve::{ServeSummary, serve};
pub use trigger::{Command, Trigger, TriggerKind, TriggerOutcome, TriggerReport};
pub use warden::{RuleAuthoring, SubmitOutcome, Warden};
