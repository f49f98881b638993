//! Plan Orchestration Library
//!
//! This library provides the core functionality for the planpilot
//! controller: the Plan and ControlNode custom resources, the per-node
//! signalling layer, and the plan state machine that drives a declarative
//! update plan across a fleet.
//! Tests are included in the module files (e.g., controller/plans.rs).

pub mod checks;
pub mod controller;
pub mod crd;
pub mod delegate;
pub mod discovery;
pub mod error;
pub mod index;
pub mod provider;
pub mod signal;

pub use error::{Error, Result};
