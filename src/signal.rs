//! # Signal Payloads
//!
//! The asynchronous mailbox between the controller and each node. Nodes are
//! frequently unreachable from the control plane (NAT, firewalls, ephemeral
//! addresses), so instructions are never pushed: the controller writes the
//! instruction half of a per-node signal object, the node-local agent pulls
//! it, acts, and writes the report half back.
//!
//! The payload rides in a single JSON-valued annotation so that the same
//! logical contract works on both backing kinds, the `ControlNode` CRD for
//! controller-role machines and the native `Node` object for workers. Both
//! halves live in one object, so every write is an optimistic-concurrency
//! (resourceVersion-conditioned) update; see [`crate::delegate`].

use chrono::{SecondsFormat, Utc};
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crd::{Plan, DEFAULT_PLAN_NAME};
use crate::error::Result;

/// Annotation key carrying the signal payload on both backing kinds.
pub const SIGNAL_ANNOTATION: &str = "planpilot.io/signal-data";

/// Full signal payload: instruction half written by the controller, report
/// half (`status`) written by the node agent.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalData {
    /// Plan this signal belongs to. A report carrying a different plan id
    /// is from an earlier plan and must be ignored.
    pub plan_id: String,
    /// Index of the instructed command within the plan. A node only ever
    /// holds one instruction, so a report is progress only for the command
    /// that wrote it; reports stamped with another index are stale.
    pub command_index: u32,
    /// RFC 3339 timestamp at which the instruction was written.
    pub created: String,
    /// The instruction itself.
    pub command: SignalCommand,
    /// The node's report, absent until the agent first acknowledges.
    #[serde(default)]
    pub status: Option<SignalStatus>,
}

impl SignalData {
    pub fn new(plan_id: impl Into<String>, command_index: u32, command: SignalCommand) -> Self {
        SignalData {
            plan_id: plan_id.into(),
            command_index,
            created: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            command,
            status: None,
        }
    }
}

/// Instruction payload, tagged by command kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalCommand {
    BinaryUpdate(SignalUpdate),
    AirgapUpdate(SignalUpdate),
}

/// What to download and apply.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalUpdate {
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Report half of the signal, written only by the node agent.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalStatus {
    pub state: SignalState,
    pub timestamp: String,
}

impl SignalStatus {
    pub fn new(state: SignalState) -> Self {
        SignalStatus {
            state,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Node-reported progress states, in their only legal order:
///
/// `Idle → Acknowledged → Downloading → Applying → Completed | Failed`
///
/// Signals are carried over a level-triggered watch, so the controller may
/// observe states out of order or not at all. Any report that does not move
/// strictly forward relative to the last recorded state is stale or a
/// conflicting write, and is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SignalState {
    Idle,
    Acknowledged,
    Downloading,
    Applying,
    Completed,
    Failed,
}

impl SignalState {
    /// Position in the forward ordering. `Completed` and `Failed` share a
    /// rank: both are terminal outcomes of `Applying`.
    pub fn rank(self) -> u8 {
        match self {
            SignalState::Idle => 0,
            SignalState::Acknowledged => 1,
            SignalState::Downloading => 2,
            SignalState::Applying => 3,
            SignalState::Completed | SignalState::Failed => 4,
        }
    }

    /// Whether a transition from `prev` (if any) to `self` moves forward.
    /// Equal ranks are not forward: re-observing the same state is a no-op.
    pub fn is_forward_of(self, prev: Option<SignalState>) -> bool {
        match prev {
            None => true,
            Some(prev) => self.rank() > prev.rank(),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SignalState::Completed | SignalState::Failed)
    }
}

/// Parse the signal payload out of an annotation map. `Ok(None)` when the
/// annotation is absent; an unparsable payload is an error, not silence.
pub fn read(annotations: &BTreeMap<String, String>) -> Result<Option<SignalData>> {
    match annotations.get(SIGNAL_ANNOTATION) {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

/// Serialize the signal payload into an annotation map, replacing any
/// previous payload.
pub fn write(annotations: &mut BTreeMap<String, String>, data: &SignalData) -> Result<()> {
    annotations.insert(SIGNAL_ANNOTATION.to_string(), serde_json::to_string(data)?);
    Ok(())
}

/// Resolve an instruction write against what the object already carries.
///
/// The controller owns only the instruction half; the node's report half
/// must survive a re-write of an unchanged instruction. When the object
/// already holds the same instruction for the same plan and command, the
/// existing payload is kept whole, report and creation time included. A
/// genuinely new instruction replaces everything and the report starts
/// over.
pub fn merged_for_write(existing: Option<SignalData>, next: &SignalData) -> SignalData {
    match existing {
        Some(old)
            if old.plan_id == next.plan_id
                && old.command_index == next.command_index
                && old.command == next.command =>
        {
            old
        }
        _ => next.clone(),
    }
}

/// Map a changed signal-bearing object back to the plan it should requeue.
///
/// Exactly one plan is active per cluster, under a conventional name, so
/// every signal change requeues that plan. Objects without a signal
/// annotation are of no interest.
pub fn plan_ref_for<K>(obj: &K) -> Option<ObjectRef<Plan>>
where
    K: Resource,
{
    obj.meta()
        .annotations
        .as_ref()
        .filter(|annotations| annotations.contains_key(SIGNAL_ANNOTATION))
        .map(|_| ObjectRef::new(DEFAULT_PLAN_NAME))
}
