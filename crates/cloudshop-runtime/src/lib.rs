//! Runtime — turns an order into provisioned resources.
//!
//! Resolves template placeholders against user input and parent outputs,
//! orders resources by their dependency graph and drives each one through
//! the job ledger and its creation capability.

pub mod capability;
pub mod graph;
pub mod orchestrator;
pub mod resolver;
pub mod types;

pub use capability::{Capability, CapabilityRequest, HttpCapability};
pub use graph::Dag;
pub use orchestrator::Orchestrator;
pub use resolver::{resolve, Resolution};
pub use types::*;
