//! Provider for the `BinaryUpdate` command: rolls a new node binary out to
//! controller and worker nodes. Controllers and workers are resolved
//! through their own delegates but share all orchestration logic.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::debug;

use crate::crd::{PlanCommand, PlanCommandBinaryUpdate, PlanCommandStatus};
use crate::delegate::{delegate_for, DelegateMap, NodeRole};
use crate::discovery::discover_nodes;
use crate::error::{Error, Result};
use crate::provider::{
    excluded_set, ingest_target_reports, signal_pending_targets, PlanCommandProvider,
};
use crate::signal::SignalCommand;

const COMMAND_ID: &str = "BinaryUpdate";

/// Orchestrates binary updates across both node roles.
pub struct BinaryUpdateProvider {
    delegates: DelegateMap,
    excluded_from_plans: BTreeSet<String>,
}

impl BinaryUpdateProvider {
    pub fn new(delegates: DelegateMap, exclude_from_plans: &[String]) -> Self {
        BinaryUpdateProvider {
            delegates,
            excluded_from_plans: excluded_set(exclude_from_plans),
        }
    }

    fn command<'a>(&self, command: &'a PlanCommand) -> Result<&'a PlanCommandBinaryUpdate> {
        match command {
            PlanCommand::BinaryUpdate(cmd) => Ok(cmd),
            other => Err(Error::UnknownCommand(other.command_id().to_string())),
        }
    }
}

#[async_trait]
impl PlanCommandProvider for BinaryUpdateProvider {
    fn command_id(&self) -> &'static str {
        COMMAND_ID
    }

    async fn populate(
        &self,
        plan_id: &str,
        command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<bool> {
        let update = self.command(command)?;
        let mut all_resolved = true;

        if let Some(target) = &update.targets.controllers {
            let delegate = delegate_for(&self.delegates, NodeRole::Controller)?;
            let discovered = discover_nodes(
                target,
                delegate.as_ref(),
                &self.excluded_from_plans,
                Some(&update.platforms),
            )
            .await?;
            all_resolved &= discovered.all_resolved;
            status.controllers = discovered.statuses;
        } else {
            status.controllers.clear();
        }

        if let Some(target) = &update.targets.workers {
            let delegate = delegate_for(&self.delegates, NodeRole::Worker)?;
            let discovered = discover_nodes(
                target,
                delegate.as_ref(),
                &self.excluded_from_plans,
                Some(&update.platforms),
            )
            .await?;
            all_resolved &= discovered.all_resolved;
            status.workers = discovered.statuses;
        } else {
            status.workers.clear();
        }

        debug!(
            plan = plan_id,
            controllers = status.controllers.len(),
            workers = status.workers.len(),
            all_resolved,
            "binary update discovery"
        );
        Ok(all_resolved)
    }

    async fn send_signals(
        &self,
        plan_id: &str,
        command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<bool> {
        let update = self.command(command)?;
        let mut all_sent = true;

        // Controllers are signalled before workers: the control plane must
        // finish its own update before it starts moving the fleet.
        if !status.controllers.is_empty() {
            let delegate = delegate_for(&self.delegates, NodeRole::Controller)?;
            all_sent &= signal_pending_targets(
                delegate.as_ref(),
                plan_id,
                status.id,
                &update.version,
                &update.platforms,
                &SignalCommand::BinaryUpdate,
                &mut status.controllers,
            )
            .await?;
        }

        if !status.workers.is_empty() {
            let delegate = delegate_for(&self.delegates, NodeRole::Worker)?;
            all_sent &= signal_pending_targets(
                delegate.as_ref(),
                plan_id,
                status.id,
                &update.version,
                &update.platforms,
                &SignalCommand::BinaryUpdate,
                &mut status.workers,
            )
            .await?;
        }

        Ok(all_sent)
    }

    async fn ingest_reports(
        &self,
        plan_id: &str,
        _command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<()> {
        if !status.controllers.is_empty() {
            let delegate = delegate_for(&self.delegates, NodeRole::Controller)?;
            ingest_target_reports(delegate.as_ref(), plan_id, status.id, &mut status.controllers)
                .await?;
        }
        if !status.workers.is_empty() {
            let delegate = delegate_for(&self.delegates, NodeRole::Worker)?;
            ingest_target_reports(delegate.as_ref(), plan_id, status.id, &mut status.workers)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        PlanCommandTarget, PlanCommandTargetDiscovery, PlanCommandTargetState, PlanCommandTargets,
        PlanResourceUrl, PlanState,
    };
    use crate::delegate::{MockSignalDelegate, NodeSnapshot, Platform};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn update_command(controllers: &[&str], workers: &[&str]) -> PlanCommand {
        let mut platforms = BTreeMap::new();
        platforms.insert(
            "linux-amd64".to_string(),
            PlanResourceUrl {
                url: "https://artifacts.example.com/v1.31.2/node-amd64".to_string(),
                sha256: Some("abc".to_string()),
            },
        );
        let target = |nodes: &[&str]| -> Option<PlanCommandTarget> {
            if nodes.is_empty() {
                return None;
            }
            Some(PlanCommandTarget {
                discovery: PlanCommandTargetDiscovery::Static {
                    nodes: nodes.iter().map(ToString::to_string).collect(),
                },
            })
        };
        PlanCommand::BinaryUpdate(PlanCommandBinaryUpdate {
            version: "v1.31.2".to_string(),
            platforms,
            targets: PlanCommandTargets {
                controllers: target(controllers),
                workers: target(workers),
            },
        })
    }

    fn amd64_snapshot(name: &str) -> NodeSnapshot {
        NodeSnapshot {
            name: name.to_string(),
            resource_version: Some("1".to_string()),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            platform: Some(Platform::new("linux", "amd64")),
        }
    }

    fn worker_only_delegates(delegate: MockSignalDelegate) -> DelegateMap {
        let mut map: DelegateMap = BTreeMap::new();
        map.insert(NodeRole::Worker, Arc::new(delegate));
        map
    }

    #[tokio::test]
    async fn populate_discovers_both_roles() {
        let mut controller_delegate = MockSignalDelegate::new();
        controller_delegate
            .expect_get_node()
            .returning(|name| Ok(Some(amd64_snapshot(name))));
        let mut worker_delegate = MockSignalDelegate::new();
        worker_delegate.expect_get_node().returning(|_| Ok(None));

        let mut delegates: DelegateMap = BTreeMap::new();
        delegates.insert(NodeRole::Controller, Arc::new(controller_delegate));
        delegates.insert(NodeRole::Worker, Arc::new(worker_delegate));

        let provider = BinaryUpdateProvider::new(delegates, &[]);
        let command = update_command(&["controller0"], &["worker0"]);
        let mut status = PlanCommandStatus::new(0, PlanState::SchedulableWait);

        let resolved = provider
            .populate("plan-1", &command, &mut status)
            .await
            .expect("populate");
        assert!(resolved);
        assert_eq!(status.controllers.len(), 1);
        assert_eq!(
            status.controllers[0].state,
            PlanCommandTargetState::SignalPending
        );
        assert_eq!(status.workers.len(), 1);
        assert_eq!(
            status.workers[0].state,
            PlanCommandTargetState::SignalMissingNode
        );
    }

    #[tokio::test]
    async fn send_signals_moves_pending_targets_to_sent() {
        let mut delegate = MockSignalDelegate::new();
        delegate.expect_role().return_const(NodeRole::Worker);
        delegate
            .expect_get_node()
            .returning(|name| Ok(Some(amd64_snapshot(name))));
        delegate
            .expect_write_signal()
            .times(1)
            .withf(|name, data| {
                name == "worker0" && data.plan_id == "plan-1" && data.command_index == 0
            })
            .returning(|_, _| Ok(()));

        let provider = BinaryUpdateProvider::new(worker_only_delegates(delegate), &[]);
        let command = update_command(&[], &["worker0"]);
        let mut status = PlanCommandStatus::new(0, PlanState::Schedulable);
        status.workers = vec![crate::crd::PlanCommandTargetStatus::new(
            "worker0",
            PlanCommandTargetState::SignalPending,
        )];

        let all_sent = provider
            .send_signals("plan-1", &command, &mut status)
            .await
            .expect("send");
        assert!(all_sent);
        assert_eq!(status.workers[0].state, PlanCommandTargetState::SignalSent);
        assert!(status.workers[0].last_updated_timestamp.is_some());
    }

    #[tokio::test]
    async fn wrong_command_variant_is_rejected() {
        let provider = BinaryUpdateProvider::new(BTreeMap::new(), &[]);
        let command = PlanCommand::AirgapUpdate(crate::crd::PlanCommandAirgapUpdate {
            version: "v1.31.2".to_string(),
            platforms: BTreeMap::new(),
            workers: PlanCommandTarget {
                discovery: PlanCommandTargetDiscovery::Static { nodes: Vec::new() },
            },
        });
        let mut status = PlanCommandStatus::default();
        let err = provider
            .populate("plan-1", &command, &mut status)
            .await
            .expect_err("variant mismatch");
        assert!(matches!(err, Error::UnknownCommand(_)));
    }
}
