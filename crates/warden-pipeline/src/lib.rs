//! # warden-pipeline
//!
//! Moves collected records through the `patterns` and `synthesis` tiers.
//! Each advance leases a batch, hands it to the tier's processor and commits
//! every returned artifact on its own, so a crash between commits leaves
//! only the uncommitted records to be picked up again.

pub mod coordinator;
pub mod processors;

pub use coordinator::{PipelineCoordinator, PipelineSettings, TierProcessor};
pub use processors::{CategoryClusterProcessor, DigestProcessor};
