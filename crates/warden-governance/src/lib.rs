//! # warden-governance
//!
//! The policy-governed half of Warden: the boundary evaluator consulted
//! before any mutating action, the closed capability registry, the workflow
//! interpreter that executes only allow-listed operations, and the proposal
//! lifecycle through which every self-change passes.

pub mod capability;
pub mod policy;
pub mod proposal;
pub mod workflow;

pub use capability::{
    CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, HandlerOutcome, StepContext,
};
pub use policy::{EvaluatorSettings, PolicyEvaluator};
pub use proposal::ProposalManager;
pub use workflow::{InterpreterSettings, WorkflowInterpreter};
