//! # warden-store
//!
//! SQLite implementation of every store trait in `warden-core`. One
//! connection behind a mutex, WAL journaling, schema created on open.
//!
//! Multi-row invariants (proposal application, artifact commits, claim
//! leases) are enforced inside single transactions here rather than by the
//! callers.

mod audit;
mod pipeline;
mod preferences;
mod proposals;
mod rules;
pub mod store;
mod workflows;

pub use store::SqliteStore;
