//! # Custom Resource Definitions
//!
//! The two CRDs the orchestrator owns, plus the command/status types that
//! hang off them:
//!
//! - [`Plan`]: the cluster-scoped, declarative description of one
//!   fleet-wide maintenance operation. Operators write the spec; only the
//!   controller writes the status sub-resource.
//! - [`ControlNode`]: the signal object for controller-role machines.
//!   Worker-role machines reuse the native `Node` object instead; both carry
//!   their signal payload in an annotation (see [`crate::signal`]).
//!
//! # Example
//!
//! ```yaml
//! apiVersion: planpilot.io/v1beta1
//! kind: Plan
//! metadata:
//!   name: autopilot
//! spec:
//!   id: "2026-02-rollout"
//!   commands:
//!     - binaryUpdate:
//!         version: v1.31.2
//!         platforms:
//!           linux-amd64:
//!             url: https://artifacts.example.com/v1.31.2/node-amd64
//!             sha256: "deadbeef..."
//!         targets:
//!           controllers:
//!             discovery:
//!               static:
//!                 nodes: [controller0, controller1]
//!           workers:
//!             discovery:
//!               selector:
//!                 labels: "planpilot.io/pool=default"
//! ```

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all planpilot resources.
pub const API_GROUP: &str = "planpilot.io";

/// Conventional name of the single active plan per cluster. The controller
/// only drives this object; signal-object changes requeue it by name.
pub const DEFAULT_PLAN_NAME: &str = "autopilot";

/// Plan custom resource: the desired fleet-wide update.
///
/// Cluster-scoped. The `id` is assigned by the operator and immutable for
/// the lifetime of the plan; it is stamped into every signal object so that
/// stale signals from an earlier plan are never mistaken for progress.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Plan",
    group = "planpilot.io",
    version = "v1beta1",
    status = "PlanStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}, {"name":"Id", "type":"string", "jsonPath":".spec.id"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Unique plan identifier, immutable once assigned.
    pub id: String,
    /// Operator-supplied creation timestamp (informational).
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Ordered sequence of commands; executed and aggregated in order.
    #[serde(default)]
    pub commands: Vec<PlanCommand>,
}

/// One command within a plan: a tagged variant over the registered command
/// kinds. Adding a kind means adding a variant here and a provider in
/// [`crate::provider`]; the reconciler core never branches on the kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PlanCommand {
    /// Update the node binary to a new version.
    BinaryUpdate(PlanCommandBinaryUpdate),
    /// Distribute a new airgap image bundle to worker nodes.
    AirgapUpdate(PlanCommandAirgapUpdate),
}

impl PlanCommand {
    /// Stable tag used to route this command to its provider.
    pub fn command_id(&self) -> &'static str {
        match self {
            PlanCommand::BinaryUpdate(_) => "BinaryUpdate",
            PlanCommand::AirgapUpdate(_) => "AirgapUpdate",
        }
    }

    /// Target version carried by the command, if the kind has one.
    pub fn version(&self) -> Option<&str> {
        match self {
            PlanCommand::BinaryUpdate(cmd) => Some(&cmd.version),
            PlanCommand::AirgapUpdate(cmd) => Some(&cmd.version),
        }
    }
}

/// Parameters for a binary update command.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandBinaryUpdate {
    /// Version to update to, e.g. `v1.31.2`.
    pub version: String,
    /// Artifact per platform identifier (`os-arch`, e.g. `linux-amd64`).
    /// A node whose platform has no entry here is an incompatible target.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlanResourceUrl>,
    /// Which nodes to drive, per role.
    pub targets: PlanCommandTargets,
}

/// Parameters for an airgap bundle update command. Bundles only make sense
/// on workers, so there is no controller target.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandAirgapUpdate {
    /// Bundle version, e.g. `v1.31.2`.
    pub version: String,
    /// Bundle artifact per platform identifier.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlanResourceUrl>,
    /// Worker nodes to distribute the bundle to.
    pub workers: PlanCommandTarget,
}

/// Downloadable artifact reference.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanResourceUrl {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Per-role targets of a command.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandTargets {
    #[serde(default)]
    pub controllers: Option<PlanCommandTarget>,
    #[serde(default)]
    pub workers: Option<PlanCommandTarget>,
}

/// Target selection for one role.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandTarget {
    pub discovery: PlanCommandTargetDiscovery,
}

/// How the concrete node set is determined: an explicit node list, or a
/// label/field selector evaluated against the role's signal objects.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PlanCommandTargetDiscovery {
    Static {
        #[serde(default)]
        nodes: Vec<String>,
    },
    Selector {
        #[serde(default)]
        labels: Option<String>,
        #[serde(default)]
        fields: Option<String>,
    },
}

/// Plan status sub-resource, written exclusively by the controller.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Overall plan state.
    #[serde(default)]
    pub state: PlanState,
    /// Per-command progress, index-aligned with `spec.commands`.
    #[serde(default)]
    pub commands: Vec<PlanCommandStatus>,
}

/// States of the plan state machine.
///
/// `NewPlan → SchedulableWait → Schedulable → InProgress` and then one of
/// the terminal states. Terminal plans are retained for audit, never
/// deleted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum PlanState {
    /// Just created, not yet discovered.
    #[default]
    NewPlan,
    /// Discovery in progress; waiting for every command to fully resolve.
    SchedulableWait,
    /// Targets resolved; instructions being written to signal objects.
    Schedulable,
    /// Waiting on per-node completion reports.
    InProgress,
    /// Every eligible target reported success. Terminal.
    Completed,
    /// A target failed, or a pre-flight check blocked the plan. Terminal.
    Errored,
    /// One or more targets were incompatible or could never be resolved,
    /// so the plan could not cover its full target set. Terminal.
    IncompleteTargets,
}

impl PlanState {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanState::Completed | PlanState::Errored | PlanState::IncompleteTargets
        )
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanState::NewPlan => "NewPlan",
            PlanState::SchedulableWait => "SchedulableWait",
            PlanState::Schedulable => "Schedulable",
            PlanState::InProgress => "InProgress",
            PlanState::Completed => "Completed",
            PlanState::Errored => "Errored",
            PlanState::IncompleteTargets => "IncompleteTargets",
        };
        f.write_str(s)
    }
}

/// Progress of a single command.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandStatus {
    /// Index of the command in `spec.commands`.
    pub id: u32,
    /// Command-level state, advanced in plan order.
    #[serde(default)]
    pub state: PlanState,
    /// Human-readable detail when the command blocked or errored.
    #[serde(default)]
    pub description: Option<String>,
    /// Per-controller-node target statuses.
    #[serde(default)]
    pub controllers: Vec<PlanCommandTargetStatus>,
    /// Per-worker-node target statuses.
    #[serde(default)]
    pub workers: Vec<PlanCommandTargetStatus>,
}

impl PlanCommandStatus {
    pub fn new(id: u32, state: PlanState) -> Self {
        PlanCommandStatus {
            id,
            state,
            ..PlanCommandStatus::default()
        }
    }

    /// All target statuses across both roles.
    pub fn all_targets(&self) -> impl Iterator<Item = &PlanCommandTargetStatus> {
        self.controllers.iter().chain(self.workers.iter())
    }

    pub fn all_targets_mut(&mut self) -> impl Iterator<Item = &mut PlanCommandTargetStatus> {
        self.controllers.iter_mut().chain(self.workers.iter_mut())
    }
}

/// Per-node, per-command record. Created during discovery, mutated only by
/// the controller as it ingests signal reports.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandTargetStatus {
    /// Node name.
    pub name: String,
    /// Current target state.
    pub state: PlanCommandTargetState,
    /// When the controller last touched this record.
    #[serde(default)]
    pub last_updated_timestamp: Option<String>,
    /// Resource version of the signal object at the last observed report,
    /// used to skip re-reading unchanged signals.
    #[serde(default)]
    pub last_observed_version: Option<String>,
    /// Last reported signal state, kept to enforce forward-only ordering.
    #[serde(default)]
    pub signal_state: Option<crate::signal::SignalState>,
}

impl PlanCommandTargetStatus {
    pub fn new(name: impl Into<String>, state: PlanCommandTargetState) -> Self {
        PlanCommandTargetStatus {
            name: name.into(),
            state,
            last_updated_timestamp: None,
            last_observed_version: None,
            signal_state: None,
        }
    }
}

/// States of one target node within a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PlanCommandTargetState {
    /// Discovered and eligible; instruction not yet written.
    SignalPending,
    /// Instruction durably written to the signal object.
    SignalSent,
    /// Node reported successful completion. Terminal.
    SignalCompleted,
    /// Node reported failure. Terminal.
    SignalFailed,
    /// Named or selected node does not exist. Excluded from completion
    /// accounting.
    SignalMissingNode,
    /// Node exists but no artifact matches its platform. Excluded from
    /// completion accounting.
    SignalMissingPlatform,
}

impl PlanCommandTargetState {
    /// Whether this target still counts towards "all targets completed".
    /// Missing/incompatible targets are recorded but excluded.
    pub fn is_eligible(self) -> bool {
        !matches!(
            self,
            PlanCommandTargetState::SignalMissingNode
                | PlanCommandTargetState::SignalMissingPlatform
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanCommandTargetState::SignalCompleted
                | PlanCommandTargetState::SignalFailed
                | PlanCommandTargetState::SignalMissingNode
                | PlanCommandTargetState::SignalMissingPlatform
        )
    }
}

/// ControlNode custom resource: the signal object for a controller-role
/// machine. The node-local agent creates it at join time and keeps the
/// status half current; the controller writes instructions into the signal
/// annotation.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "ControlNode",
    group = "planpilot.io",
    version = "v1beta1",
    status = "ControlNodeStatus",
    shortname = "ctrlnode"
)]
#[serde(rename_all = "camelCase")]
pub struct ControlNodeSpec {
    /// Hostname as reported by the node agent, when it differs from the
    /// object name.
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Platform and version facts reported by the controller-node agent.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlNodeStatus {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}
