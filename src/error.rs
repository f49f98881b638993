//! # Error Types
//!
//! Crate-wide error taxonomy for the plan orchestration engine.
//!
//! Errors fall into two families, and the reconciler treats them differently:
//!
//! - **Transient** errors (API failures, optimistic-concurrency conflicts,
//!   unresolved discovery) are retried internally or cause a requeue. They
//!   never mark a `Plan` as failed by themselves.
//! - **Semantic** errors (unknown command kind, incompatible target version,
//!   missing delegate) are surfaced in the `Plan` status for the operator and
//!   are terminal for the affected plan.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying Kubernetes API error.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// An optimistic-concurrency write kept conflicting until the retry
    /// budget ran out. Transient; the reconcile is requeued.
    #[error("write conflict persisted after {attempts} attempts on {object}")]
    Conflict { object: String, attempts: u32 },

    /// No delegate registered for a node role. Indicates a wiring bug.
    #[error("no delegate registered for role '{0}'")]
    MissingDelegate(String),

    /// A plan command carries a kind tag with no registered provider.
    #[error("no provider registered for command '{0}'")]
    UnknownCommand(String),

    /// A provider was registered twice under the same command id.
    #[error("provider already registered for command '{0}'")]
    DuplicateProvider(String),

    /// Index registration failed at startup. Fatal: lookups against an
    /// unregistered index would silently return incomplete results.
    #[error("unable to register indexer '{field}' on '{kind}'")]
    IndexRegistration { kind: String, field: String },

    /// Signal payload could not be serialized or parsed.
    #[error("signal payload codec error: {0}")]
    SignalCodec(#[from] serde_json::Error),

    /// A version string could not be parsed.
    #[error("invalid version '{0}', expected format like 'v1.31.2'")]
    InvalidVersion(String),

    /// The requested target version removes an API that is still in use
    /// without a viable replacement. Blocks the plan; operator must act.
    #[error(
        "version '{target}' removes '{group}/{version} {kind}' (removed in {removed_in}) which is still in use"
    )]
    IncompatibleVersion {
        target: String,
        group: String,
        version: String,
        kind: String,
        removed_in: String,
    },
}

impl Error {
    /// Whether the reconciler should retry rather than record a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Conflict { .. })
    }
}
