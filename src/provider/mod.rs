//! # Command Providers
//!
//! Pluggable handlers for the registered command kinds, keyed by a stable
//! string tag. A provider is pure orchestration: it determines who must
//! perform an update (discovery), writes the per-node instructions, and
//! interprets reported signal state transitions. It never performs the
//! node-level work itself.
//!
//! Adding a command kind means implementing [`PlanCommandProvider`] and
//! registering it; the reconciler core loop is untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::crd::{
    PlanCommand, PlanCommandStatus, PlanCommandTargetState, PlanCommandTargetStatus,
    PlanResourceUrl,
};
use crate::delegate::SignalDelegate;
use crate::error::{Error, Result};
use crate::signal::{SignalCommand, SignalData, SignalUpdate};

pub mod airgapupdate;
pub mod binaryupdate;

pub use airgapupdate::AirgapUpdateProvider;
pub use binaryupdate::BinaryUpdateProvider;

/// One command kind's orchestration logic.
#[async_trait]
pub trait PlanCommandProvider: Send + Sync {
    /// Stable tag routing a command to this provider.
    fn command_id(&self) -> &'static str;

    /// Discovery: resolve the command's target spec into per-node statuses,
    /// written into `status`. Returns whether every candidate was
    /// conclusively checked; the reconciler repeats this until it is.
    async fn populate(
        &self,
        plan_id: &str,
        command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<bool>;

    /// Write the instruction into each pending target's signal object.
    /// Returns whether every eligible target has been signalled.
    async fn send_signals(
        &self,
        plan_id: &str,
        command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<bool>;

    /// Ingest node reports for signalled targets, moving target states
    /// forward only. Reports out of forward order are stale writes and are
    /// ignored.
    async fn ingest_reports(
        &self,
        plan_id: &str,
        command: &PlanCommand,
        status: &mut PlanCommandStatus,
    ) -> Result<()>;
}

#[cfg(test)]
impl fmt::Debug for dyn PlanCommandProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanCommandProvider")
            .field("command_id", &self.command_id())
            .finish_non_exhaustive()
    }
}

/// Fixed registry of providers, keyed by command id.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<&'static str, Arc<dyn PlanCommandProvider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("commands", &self.command_ids())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    /// Register a provider. Double registration of a command id is a
    /// wiring bug and an error.
    pub fn register(&mut self, provider: Arc<dyn PlanCommandProvider>) -> Result<()> {
        let id = provider.command_id();
        if self.providers.insert(id, provider).is_some() {
            return Err(Error::DuplicateProvider(id.to_string()));
        }
        Ok(())
    }

    /// Resolve a command to its provider.
    pub fn get(&self, command: &PlanCommand) -> Result<Arc<dyn PlanCommandProvider>> {
        self.providers
            .get(command.command_id())
            .map(Arc::clone)
            .ok_or_else(|| Error::UnknownCommand(command.command_id().to_string()))
    }

    pub fn command_ids(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }
}

/// Build the exclusion set a provider is constructed with.
pub(crate) fn excluded_set(excluded: &[String]) -> BTreeSet<String> {
    excluded.iter().cloned().collect()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write the instruction into every `SignalPending` target of one role.
///
/// The artifact is chosen per node platform, so each node is re-read just
/// before signalling; a node that vanished since discovery is recorded as
/// missing rather than signalled into the void. Returns true when no
/// pending targets remain afterwards.
pub(crate) async fn signal_pending_targets(
    delegate: &dyn SignalDelegate,
    plan_id: &str,
    command_index: u32,
    version: &str,
    platforms: &BTreeMap<String, PlanResourceUrl>,
    make_command: &(dyn Fn(SignalUpdate) -> SignalCommand + Sync),
    targets: &mut [PlanCommandTargetStatus],
) -> Result<bool> {
    for target in targets.iter_mut() {
        if target.state != PlanCommandTargetState::SignalPending {
            continue;
        }

        let Some(snapshot) = delegate.get_node(&target.name).await? else {
            warn!(
                node = target.name.as_str(),
                "target vanished between discovery and signalling"
            );
            target.state = PlanCommandTargetState::SignalMissingNode;
            target.last_updated_timestamp = Some(now_rfc3339());
            continue;
        };

        let artifact = snapshot
            .platform
            .as_ref()
            .and_then(|platform| platforms.get(&platform.identifier()));
        let Some(artifact) = artifact else {
            // Discovery vouched for the platform, but the node changed.
            target.state = PlanCommandTargetState::SignalMissingPlatform;
            target.last_updated_timestamp = Some(now_rfc3339());
            continue;
        };

        let data = SignalData::new(
            plan_id,
            command_index,
            make_command(SignalUpdate {
                version: version.to_string(),
                url: artifact.url.clone(),
                sha256: artifact.sha256.clone(),
            }),
        );
        delegate.write_signal(&target.name, &data).await?;

        info!(
            node = target.name.as_str(),
            role = %delegate.role(),
            version,
            "instruction signalled"
        );
        target.state = PlanCommandTargetState::SignalSent;
        target.last_updated_timestamp = Some(now_rfc3339());
    }

    Ok(targets
        .iter()
        .all(|t| t.state != PlanCommandTargetState::SignalPending))
}

/// Ingest node reports for every `SignalSent` target of one role.
///
/// A report is accepted only when it belongs to this plan and this command
/// and moves the target's signal state strictly forward; anything else is
/// a stale or conflicting write. Terminal reports flip the target state.
pub(crate) async fn ingest_target_reports(
    delegate: &dyn SignalDelegate,
    plan_id: &str,
    command_index: u32,
    targets: &mut [PlanCommandTargetStatus],
) -> Result<()> {
    for target in targets.iter_mut() {
        if target.state != PlanCommandTargetState::SignalSent {
            continue;
        }

        let Some(snapshot) = delegate.get_node(&target.name).await? else {
            warn!(node = target.name.as_str(), "signalled target vanished");
            continue;
        };

        // Unchanged signal object since the last ingest; nothing new.
        if snapshot.resource_version.is_some()
            && snapshot.resource_version == target.last_observed_version
        {
            continue;
        }

        let Some(data) = snapshot.signal()? else {
            continue;
        };
        if data.plan_id != plan_id {
            debug!(
                node = target.name.as_str(),
                theirs = data.plan_id.as_str(),
                "signal belongs to another plan, ignoring"
            );
            continue;
        }
        if data.command_index != command_index {
            debug!(
                node = target.name.as_str(),
                theirs = data.command_index,
                ours = command_index,
                "signal belongs to another command of this plan, ignoring"
            );
            continue;
        }
        let Some(report) = data.status else {
            continue;
        };

        if !report.state.is_forward_of(target.signal_state) {
            debug!(
                node = target.name.as_str(),
                reported = ?report.state,
                recorded = ?target.signal_state,
                "report does not move forward, treating as stale"
            );
            continue;
        }

        target.signal_state = Some(report.state);
        target.last_observed_version = snapshot.resource_version.clone();
        target.last_updated_timestamp = Some(now_rfc3339());

        match report.state {
            crate::signal::SignalState::Completed => {
                info!(node = target.name.as_str(), "target completed");
                target.state = PlanCommandTargetState::SignalCompleted;
            }
            crate::signal::SignalState::Failed => {
                warn!(node = target.name.as_str(), "target reported failure");
                target.state = PlanCommandTargetState::SignalFailed;
            }
            _ => {}
        }
    }

    Ok(())
}
