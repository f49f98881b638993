//! # Delegates
//!
//! Role polymorphism over the two signal-object backings. Controller-role
//! machines signal through the `ControlNode` CRD; worker-role machines
//! signal through the native `Node` object. Everything above this module is
//! role-agnostic: it sees a [`SignalDelegate`] and a [`NodeSnapshot`] and
//! never branches on the role string. Adding a role means adding a delegate
//! implementation here and nothing anywhere else.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::ControlNode;
use crate::error::{Error, Result};
use crate::index::{FieldIndex, IndexRegistry, CONTROL_NODE_BY_NAME, NODE_BY_NAME};
use crate::signal::{self, SignalData};

/// Bounded retry budget for optimistic-concurrency signal writes.
const SIGNAL_WRITE_ATTEMPTS: u32 = 5;

/// The two node roles a plan can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeRole {
    Controller,
    Worker,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Controller => "controller",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "controller" => Ok(NodeRole::Controller),
            "worker" => Ok(NodeRole::Worker),
            other => Err(format!("unknown node role '{other}'")),
        }
    }
}

/// OS/architecture pair a node runs on, matched against the platform keys
/// of an update command (`linux-amd64`, `linux-arm64`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Platform {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The `os-arch` identifier used as a platform map key.
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

/// Role-agnostic snapshot of a signal object, as read at one instant.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub name: String,
    pub resource_version: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub platform: Option<Platform>,
}

impl NodeSnapshot {
    /// The signal payload carried by this snapshot, if any.
    pub fn signal(&self) -> Result<Option<SignalData>> {
        signal::read(&self.annotations)
    }
}

/// Accessor abstraction over one role's signal objects.
///
/// Implementations translate between the role's backing kind and the
/// role-agnostic snapshot/signal contract. `write_signal` must be an
/// optimistic-concurrency write: read, mutate, conditional replace, retried
/// with a fresh read on conflict within a bounded budget.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignalDelegate: Send + Sync {
    /// Role this delegate serves.
    fn role(&self) -> NodeRole;

    /// Snapshot one node by name. `Ok(None)` when it does not exist.
    async fn get_node(&self, name: &str) -> Result<Option<NodeSnapshot>>;

    /// Names of all nodes of this role matching the given selectors.
    /// Returned sorted so repeated discovery is deterministic.
    async fn list_node_names<'a>(
        &self,
        labels: Option<&'a str>,
        fields: Option<&'a str>,
    ) -> Result<Vec<String>>;

    /// Durably write the instruction half of a node's signal object. Must
    /// not clobber the node's report half: a re-write of an unchanged
    /// instruction keeps whatever report the node already filed (see
    /// [`signal::merged_for_write`]).
    async fn write_signal(&self, name: &str, data: &SignalData) -> Result<()>;
}

/// Map from role to delegate. The single seam that keeps the rest of the
/// engine role-agnostic.
pub type DelegateMap = BTreeMap<NodeRole, Arc<dyn SignalDelegate>>;

#[cfg(test)]
impl fmt::Debug for dyn SignalDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalDelegate")
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

/// Build the production delegate map over a kube client, using the
/// registry's by-name indexes to short-circuit existence checks.
pub fn delegate_map(client: &Client, registry: &IndexRegistry) -> DelegateMap {
    let mut map: DelegateMap = BTreeMap::new();
    map.insert(
        NodeRole::Controller,
        Arc::new(ControlNodeDelegate {
            api: Api::all(client.clone()),
            name_index: registry.index(CONTROL_NODE_BY_NAME),
        }),
    );
    map.insert(
        NodeRole::Worker,
        Arc::new(WorkerNodeDelegate {
            api: Api::all(client.clone()),
            name_index: registry.index(NODE_BY_NAME),
        }),
    );
    map
}

/// Look a role up in the map, as an error rather than a panic: a command
/// targeting a role with no delegate is a wiring bug surfaced at reconcile
/// time.
pub fn delegate_for(map: &DelegateMap, role: NodeRole) -> Result<Arc<dyn SignalDelegate>> {
    map.get(&role)
        .map(Arc::clone)
        .ok_or_else(|| Error::MissingDelegate(role.to_string()))
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 409)
}

/// Delegate over the `ControlNode` CRD.
pub struct ControlNodeDelegate {
    api: Api<ControlNode>,
    name_index: Option<Arc<FieldIndex>>,
}

impl fmt::Debug for ControlNodeDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlNodeDelegate").finish_non_exhaustive()
    }
}

impl ControlNodeDelegate {
    fn snapshot(node: &ControlNode) -> NodeSnapshot {
        let platform = node.status.as_ref().and_then(|status| {
            match (status.os.as_deref(), status.arch.as_deref()) {
                (Some(os), Some(arch)) => Some(Platform::new(os, arch)),
                _ => None,
            }
        });
        NodeSnapshot {
            name: node.name_any(),
            resource_version: node.metadata.resource_version.clone(),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            platform,
        }
    }
}

#[async_trait]
impl SignalDelegate for ControlNodeDelegate {
    fn role(&self) -> NodeRole {
        NodeRole::Controller
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeSnapshot>> {
        // A synced by-name index turns the common not-found case into a
        // local lookup instead of an API round trip.
        if let Some(index) = &self.name_index {
            if index.is_ready() && index.get(name).is_empty() {
                return Ok(None);
            }
        }
        Ok(self.api.get_opt(name).await?.map(|n| Self::snapshot(&n)))
    }

    async fn list_node_names<'a>(
        &self,
        labels: Option<&'a str>,
        fields: Option<&'a str>,
    ) -> Result<Vec<String>> {
        let mut params = ListParams::default();
        if let Some(labels) = labels {
            params = params.labels(labels);
        }
        if let Some(fields) = fields {
            params = params.fields(fields);
        }
        let mut names: Vec<String> = self
            .api
            .list(&params)
            .await?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn write_signal(&self, name: &str, data: &SignalData) -> Result<()> {
        for attempt in 1..=SIGNAL_WRITE_ATTEMPTS {
            let mut node = self.api.get(name).await?;
            let annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
            // Merge against the fresh read so a report the node raced in
            // ahead of us survives, then write conditionally.
            let merged = signal::merged_for_write(signal::read(annotations)?, data);
            signal::write(annotations, &merged)?;

            match self.api.replace(name, &PostParams::default(), &node).await {
                Ok(_) => return Ok(()),
                Err(err) if is_conflict(&err) => {
                    debug!(node = name, attempt, "signal write conflicted, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::Conflict {
            object: format!("controlnode/{name}"),
            attempts: SIGNAL_WRITE_ATTEMPTS,
        })
    }
}

/// Delegate over the native `Node` object.
pub struct WorkerNodeDelegate {
    api: Api<Node>,
    name_index: Option<Arc<FieldIndex>>,
}

impl fmt::Debug for WorkerNodeDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerNodeDelegate").finish_non_exhaustive()
    }
}

impl WorkerNodeDelegate {
    fn snapshot(node: &Node) -> NodeSnapshot {
        let platform = node
            .status
            .as_ref()
            .and_then(|status| status.node_info.as_ref())
            .map(|info| Platform::new(&info.operating_system, &info.architecture));
        NodeSnapshot {
            name: node.name_any(),
            resource_version: node.metadata.resource_version.clone(),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            platform,
        }
    }
}

#[async_trait]
impl SignalDelegate for WorkerNodeDelegate {
    fn role(&self) -> NodeRole {
        NodeRole::Worker
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeSnapshot>> {
        if let Some(index) = &self.name_index {
            if index.is_ready() && index.get(name).is_empty() {
                return Ok(None);
            }
        }
        Ok(self.api.get_opt(name).await?.map(|n| Self::snapshot(&n)))
    }

    async fn list_node_names<'a>(
        &self,
        labels: Option<&'a str>,
        fields: Option<&'a str>,
    ) -> Result<Vec<String>> {
        let mut params = ListParams::default();
        if let Some(labels) = labels {
            params = params.labels(labels);
        }
        if let Some(fields) = fields {
            params = params.fields(fields);
        }
        let mut names: Vec<String> = self
            .api
            .list(&params)
            .await?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn write_signal(&self, name: &str, data: &SignalData) -> Result<()> {
        for attempt in 1..=SIGNAL_WRITE_ATTEMPTS {
            let mut node = self.api.get(name).await?;
            let annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
            let merged = signal::merged_for_write(signal::read(annotations)?, data);
            signal::write(annotations, &merged)?;

            match self.api.replace(name, &PostParams::default(), &node).await {
                Ok(_) => return Ok(()),
                Err(err) if is_conflict(&err) => {
                    debug!(node = name, attempt, "signal write conflicted, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::Conflict {
            object: format!("node/{name}"),
            attempts: SIGNAL_WRITE_ATTEMPTS,
        })
    }
}
