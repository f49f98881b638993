//! # Controller
//!
//! The plan reconciliation engine:
//!
//! - `backoff`: Fibonacci requeue backoff for transient errors
//! - `plans`: the Plan state machine reconciler

pub mod backoff;
pub mod plans;

pub use plans::{
    error_policy, reconcile, ApiLister, ClusterApiLister, KubePlanApi, PlanApi, PlanContext,
};
