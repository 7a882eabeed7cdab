//! # warden-cli
//!
//! Command-line interface for Warden.
//!
//! ## Commands
//!
//! - `warden init` — Write a default `warden.toml`
//! - `warden rules` — List, author and deactivate boundary rules
//! - `warden eval` — Evaluate an action against the current rules
//! - `warden workflow` — Define, run, resume and cancel workflows
//! - `warden proposals` — Review and apply proposed changes
//! - `warden records` / `warden pipeline` — Feed and advance the pipeline
//! - `warden audit` / `warden logs` — Inspect the audit trail
//! - `warden serve` — Dispatch JSON-lines triggers from stdin

pub mod commands;

pub use commands::Cli;
