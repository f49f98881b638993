//! Provider for the `AirgapUpdate` command: distributes a new airgap image
//! bundle. Bundles only matter on machines that run workloads, so this
//! provider targets worker nodes exclusively; the platform filter matters
//! more here than for binary updates because bundles are per-architecture.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::debug;

use crate::crd::{PlanCommand, PlanCommandAirgapUpdate, PlanCommandStatus};
use crate::delegate::{delegate_for, DelegateMap, NodeRole};
use crate::discovery::discover_nodes;
use crate::error::{Error, Result};
use crate::provider::{
    excluded_set, ingest_target_reports, signal_pending_targets, PlanCommandProvider,
};
use crate::signal::SignalCommand;

const COMMAND_ID: &str = "AirgapUpdate";

/// Orchestrates airgap bundle distribution to worker nodes.
pub struct AirgapUpdateProvider {
    delegates: DelegateMap,
    excluded_from_plans: BTreeSet<String>,
}

impl AirgapUpdateProvider {
    pub fn new(delegates: DelegateMap, exclude_from_plans: &[String]) -> Self {
        AirgapUpdateProvider {
            delegates,
            excluded_from_plans: excluded_set(exclude_from_plans),
        }
    }

    fn command<'a>(&self, command: &'a PlanCommand) -> Result<&'a PlanCommandAirgapUpdate> {
        match command {
            PlanCommand::AirgapUpdate(cmd) => Ok(cmd),
            other => Err(Error::UnknownCommand(other.command_id().to_string())),
        }
    }
}

#[async_trait]
impl PlanCommandProvider for AirgapUpdateProvider {
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
        let delegate = delegate_for(&self.delegates, NodeRole::Worker)?;

        let discovered = discover_nodes(
            &update.workers,
            delegate.as_ref(),
            &self.excluded_from_plans,
            Some(&update.platforms),
        )
        .await?;

        debug!(
            plan = plan_id,
            workers = discovered.statuses.len(),
            all_resolved = discovered.all_resolved,
            "airgap update discovery"
        );
        status.controllers.clear();
        status.workers = discovered.statuses;
        Ok(discovered.all_resolved)
    }

    async fn send_signals(
        &self,
        plan_id: &str,
        command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<bool> {
        let update = self.command(command)?;
        let delegate = delegate_for(&self.delegates, NodeRole::Worker)?;

        signal_pending_targets(
            delegate.as_ref(),
            plan_id,
            status.id,
            &update.version,
            &update.platforms,
            &SignalCommand::AirgapUpdate,
            &mut status.workers,
        )
        .await
    }

    async fn ingest_reports(
        &self,
        plan_id: &str,
        _command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<()> {
        let delegate = delegate_for(&self.delegates, NodeRole::Worker)?;
        ingest_target_reports(delegate.as_ref(), plan_id, status.id, &mut status.workers).await
    }
}
