//! # Plan Reconciler
//!
//! The top-level state machine that turns a declarative [`Plan`] into
//! per-node signals and tracks their completion:
//!
//! `NewPlan → SchedulableWait → Schedulable → InProgress → Completed`
//! (or `Errored` / `IncompleteTargets`).
//!
//! Reconciliation is level-triggered: each pass recomputes the plan's
//! status from the latest observed snapshot instead of diffing against
//! remembered history, so a missed notification is compensated for by the
//! next resync. Repeating a pass against an unchanged world writes
//! nothing: every handler produces the same status it produced before,
//! and identical statuses are not patched.
//!
//! Status writes go through the status sub-resource with optimistic
//! concurrency: on conflict the write is retried against a fresh read,
//! bounded by a small budget, and budget exhaustion surfaces as a
//! transient error (requeue), never as plan failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::checks;
use crate::controller::backoff::FibonacciBackoff;
use crate::crd::{
    Plan, PlanCommandStatus, PlanCommandTargetState, PlanState, PlanStatus, DEFAULT_PLAN_NAME,
};
use crate::error::{Error, Result};
use crate::index::{IndexRegistry, PLAN_BY_ID};
use crate::provider::ProviderRegistry;

/// Retry budget for optimistic-concurrency status writes.
const STATUS_WRITE_ATTEMPTS: u32 = 5;

/// How soon to look again while the plan is still moving.
const ACTIVE_REQUEUE: Duration = Duration::from_secs(20);

/// Access to Plan objects, as a seam so the state machine can be driven
/// against fakes in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlanApi: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Plan>>;

    /// Write the status sub-resource, retrying conflicts against a fresh
    /// read within a bounded budget.
    async fn patch_status(&self, name: &str, status: &PlanStatus) -> Result<()>;
}

/// Production [`PlanApi`] over a kube client.
#[derive(Clone)]
pub struct KubePlanApi {
    api: Api<Plan>,
}

impl std::fmt::Debug for KubePlanApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePlanApi").finish_non_exhaustive()
    }
}

impl KubePlanApi {
    pub fn new(client: &Client) -> Self {
        KubePlanApi {
            api: Api::all(client.clone()),
        }
    }
}

#[async_trait]
impl PlanApi for KubePlanApi {
    async fn get(&self, name: &str) -> Result<Option<Plan>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn patch_status(&self, name: &str, status: &PlanStatus) -> Result<()> {
        for attempt in 1..=STATUS_WRITE_ATTEMPTS {
            let mut plan = self.api.get_status(name).await?;
            plan.status = Some(status.clone());

            let body = serde_json::to_vec(&plan)?;
            match self
                .api
                .replace_status(name, &PostParams::default(), body)
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                    debug!(plan = name, attempt, "status write conflicted, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::Conflict {
            object: format!("plan/{name}"),
            attempts: STATUS_WRITE_ATTEMPTS,
        })
    }
}

/// Supplies the API group/version/kinds currently served by the cluster,
/// for the pre-flight compatibility check.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiLister: Send + Sync {
    async fn in_use_gvks(&self) -> Result<Vec<GroupVersionKind>>;
}

/// Production [`ApiLister`] over kube API discovery.
#[derive(Clone)]
pub struct ClusterApiLister {
    client: Client,
}

impl std::fmt::Debug for ClusterApiLister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterApiLister").finish_non_exhaustive()
    }
}

impl ClusterApiLister {
    pub fn new(client: &Client) -> Self {
        ClusterApiLister {
            client: client.clone(),
        }
    }
}

#[async_trait]
impl ApiLister for ClusterApiLister {
    async fn in_use_gvks(&self) -> Result<Vec<GroupVersionKind>> {
        let discovery = kube::Discovery::new(self.client.clone()).run().await?;
        let mut gvks = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (resource, _capabilities) in group.versioned_resources(version) {
                    gvks.push(GroupVersionKind::gvk(
                        &resource.group,
                        &resource.version,
                        &resource.kind,
                    ));
                }
            }
        }
        Ok(gvks)
    }
}

/// Shared state handed to every reconcile.
pub struct PlanContext {
    pub plans: Arc<dyn PlanApi>,
    pub providers: ProviderRegistry,
    pub api_lister: Arc<dyn ApiLister>,
    pub index: Arc<IndexRegistry>,
    /// Requeue interval while the plan is non-terminal.
    pub requeue_interval: Duration,
    /// Per-plan backoff for transient errors; reset on success.
    pub backoffs: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl std::fmt::Debug for PlanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanContext")
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl PlanContext {
    pub fn new(
        plans: Arc<dyn PlanApi>,
        providers: ProviderRegistry,
        api_lister: Arc<dyn ApiLister>,
        index: Arc<IndexRegistry>,
    ) -> Self {
        PlanContext {
            plans,
            providers,
            api_lister,
            index,
            requeue_interval: ACTIVE_REQUEUE,
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    fn reset_backoff(&self, plan: &str) {
        self.backoffs
            .lock()
            .expect("backoff lock poisoned")
            .remove(plan);
    }

    fn next_backoff(&self, plan: &str) -> Duration {
        self.backoffs
            .lock()
            .expect("backoff lock poisoned")
            .entry(plan.to_string())
            .or_default()
            .next_backoff()
    }
}

/// One reconcile pass over a plan.
pub async fn reconcile(plan: Arc<Plan>, ctx: Arc<PlanContext>) -> Result<Action> {
    let name = plan.name_any();

    // Exactly one plan is active per cluster, under the conventional name.
    // Anything else is surfaced in logs and left alone rather than raced.
    if name != DEFAULT_PLAN_NAME {
        warn!(
            plan = name.as_str(),
            expected = DEFAULT_PLAN_NAME,
            "ignoring plan: only the conventional singleton is driven"
        );
        return Ok(Action::await_change());
    }

    let current = plan.status.clone().unwrap_or_default();
    if current.state.is_terminal() {
        ctx.reset_backoff(&name);
        return Ok(Action::await_change());
    }

    // Plan ids are unique and immutable; two plans sharing an id means a
    // copied manifest, and driving either would corrupt signal routing.
    if let Some(index) = ctx.index.index(PLAN_BY_ID) {
        let holders = index.get(&plan.spec.id);
        if holders.iter().any(|holder| holder != &name) {
            let mut status = current.clone();
            status.state = PlanState::Errored;
            error!(
                plan = name.as_str(),
                id = plan.spec.id.as_str(),
                ?holders,
                "plan id is claimed by more than one plan"
            );
            if status != current {
                ctx.plans.patch_status(&name, &status).await?;
            }
            return Ok(Action::await_change());
        }
    }

    debug!(plan = name.as_str(), state = %current.state, "reconciling");

    let next = match current.state {
        PlanState::NewPlan => new_plan(&plan, &ctx).await?,
        PlanState::SchedulableWait => schedulable_wait(&plan, &ctx).await?,
        PlanState::Schedulable => schedulable(&plan, &current, &ctx).await?,
        PlanState::InProgress => in_progress(&plan, &current, &ctx).await?,
        // Terminal states were handled above.
        PlanState::Completed | PlanState::Errored | PlanState::IncompleteTargets => None,
    };

    let mut effective = current;
    if let Some(next) = next {
        if next != effective {
            if next.state == effective.state {
                debug!(plan = name.as_str(), state = %next.state, "plan status refreshed");
            } else {
                info!(
                    plan = name.as_str(),
                    from = %effective.state,
                    to = %next.state,
                    "plan state transition"
                );
            }
            ctx.plans.patch_status(&name, &next).await?;
            effective = next;
        }
    }

    ctx.reset_backoff(&name);
    if effective.state.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ctx.requeue_interval))
    }
}

/// Requeue with growing backoff on transient failure.
pub fn error_policy(plan: Arc<Plan>, err: &Error, ctx: Arc<PlanContext>) -> Action {
    let name = plan.name_any();
    let delay = ctx.next_backoff(&name);
    error!(
        plan = name.as_str(),
        error = %err,
        transient = err.is_transient(),
        ?delay,
        "reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

/// `NewPlan`: run the pre-flight compatibility check, then hand the plan to
/// discovery. A plan with zero commands has nothing to drive and completes
/// without ever touching a signal object.
async fn new_plan(plan: &Plan, ctx: &PlanContext) -> Result<Option<PlanStatus>> {
    if plan.spec.commands.is_empty() {
        info!(plan = plan.name_any().as_str(), "plan has no commands, completing");
        return Ok(Some(PlanStatus {
            state: PlanState::Completed,
            commands: Vec::new(),
        }));
    }

    let in_use = ctx.api_lister.in_use_gvks().await?;
    for (idx, command) in plan.spec.commands.iter().enumerate() {
        let Some(version) = command.version() else {
            continue;
        };
        match checks::check_version(version, &in_use) {
            Ok(()) => {}
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                // Version bump would break a resource still in use. Blocked;
                // needs operator intervention, not a retry.
                warn!(
                    plan = plan.name_any().as_str(),
                    command = command.command_id(),
                    error = %err,
                    "pre-flight compatibility check blocked the plan"
                );
                let commands = plan
                    .spec
                    .commands
                    .iter()
                    .enumerate()
                    .map(|(i, _)| {
                        let mut status = PlanCommandStatus::new(i as u32, PlanState::NewPlan);
                        if i == idx {
                            status.state = PlanState::Errored;
                            status.description = Some(err.to_string());
                        }
                        status
                    })
                    .collect();
                return Ok(Some(PlanStatus {
                    state: PlanState::Errored,
                    commands,
                }));
            }
        }
    }

    let commands = (0..plan.spec.commands.len())
        .map(|i| PlanCommandStatus::new(i as u32, PlanState::SchedulableWait))
        .collect();
    Ok(Some(PlanStatus {
        state: PlanState::SchedulableWait,
        commands,
    }))
}

/// `SchedulableWait`: repeat discovery, in command order, until every
/// command's target set is conclusively resolved. Discovery is recomputed
/// from scratch each pass; the node set may have changed under us.
async fn schedulable_wait(plan: &Plan, ctx: &PlanContext) -> Result<Option<PlanStatus>> {
    let mut commands = Vec::with_capacity(plan.spec.commands.len());
    let mut all_resolved = true;

    for (idx, command) in plan.spec.commands.iter().enumerate() {
        let provider = ctx.providers.get(command)?;
        let mut status = PlanCommandStatus::new(idx as u32, PlanState::SchedulableWait);
        all_resolved &= provider
            .populate(&plan.spec.id, command, &mut status)
            .await?;
        commands.push(status);
    }

    let state = if all_resolved {
        for status in &mut commands {
            status.state = PlanState::Schedulable;
        }
        PlanState::Schedulable
    } else {
        PlanState::SchedulableWait
    };

    Ok(Some(PlanStatus { state, commands }))
}

/// `Schedulable`: write the active command's instructions. Commands run
/// strictly in plan order: a node holds at most one instruction at a time,
/// so command N is signalled only after command N-1 has reached a terminal
/// state. A write conflict inside a delegate surfaces as a transient error
/// and requeues; the phase never regresses.
async fn schedulable(plan: &Plan, current: &PlanStatus, ctx: &PlanContext) -> Result<Option<PlanStatus>> {
    let mut commands = current.commands.clone();
    if commands.len() != plan.spec.commands.len() {
        // Status list no longer lines up with the spec; rediscover.
        warn!(plan = plan.name_any().as_str(), "command statuses out of step, rediscovering");
        return schedulable_wait(plan, ctx).await;
    }

    let all_sent = signal_next_command(plan, &mut commands, ctx).await?;
    let state = if all_sent {
        PlanState::InProgress
    } else {
        PlanState::Schedulable
    };

    Ok(Some(PlanStatus { state, commands }))
}

/// `InProgress`: drive the active command and aggregate. Reports are
/// ingested for the command whose instruction the fleet currently holds;
/// once it reaches a terminal state the next command in line is signalled.
/// Forward-only report ordering is enforced by the providers.
async fn in_progress(plan: &Plan, current: &PlanStatus, ctx: &PlanContext) -> Result<Option<PlanStatus>> {
    let mut commands = current.commands.clone();
    if commands.len() != plan.spec.commands.len() {
        warn!(plan = plan.name_any().as_str(), "command statuses out of step, rediscovering");
        return schedulable_wait(plan, ctx).await;
    }

    if let Some(idx) = active_command(&commands) {
        let command = &plan.spec.commands[idx];
        let provider = ctx.providers.get(command)?;
        let status = &mut commands[idx];
        if status.state == PlanState::InProgress {
            provider
                .ingest_reports(&plan.spec.id, command, status)
                .await?;
            status.state = aggregate_targets(status);
        } else {
            // Predecessor finished since the last pass; this command's turn.
            if provider.send_signals(&plan.spec.id, command, status).await? {
                status.state = PlanState::InProgress;
            }
        }
    }

    let state = aggregate_commands(&commands);
    Ok(Some(PlanStatus { state, commands }))
}

/// Index of the first command not yet terminal, the only one being driven.
fn active_command(commands: &[PlanCommandStatus]) -> Option<usize> {
    commands.iter().position(|c| !c.state.is_terminal())
}

/// Signal the active command's pending targets. Returns whether that
/// command has nothing left to signal (vacuously true when every command
/// is already terminal).
async fn signal_next_command(
    plan: &Plan,
    commands: &mut [PlanCommandStatus],
    ctx: &PlanContext,
) -> Result<bool> {
    let Some(idx) = active_command(commands) else {
        return Ok(true);
    };
    let command = &plan.spec.commands[idx];
    let provider = ctx.providers.get(command)?;
    let status = &mut commands[idx];
    let all_sent = provider.send_signals(&plan.spec.id, command, status).await?;
    if all_sent {
        status.state = PlanState::InProgress;
    }
    Ok(all_sent)
}

/// Aggregate one command's target statuses into a command state.
///
/// Missing/incompatible targets are recorded but excluded from completion
/// accounting; a command that excluded any target, or resolved to no
/// eligible target at all, finishes as `IncompleteTargets` rather than
/// pretending full coverage.
fn aggregate_targets(status: &PlanCommandStatus) -> PlanState {
    let mut eligible = 0usize;
    let mut completed = 0usize;
    let mut excluded = 0usize;

    for target in status.all_targets() {
        match target.state {
            PlanCommandTargetState::SignalFailed => return PlanState::Errored,
            PlanCommandTargetState::SignalMissingNode
            | PlanCommandTargetState::SignalMissingPlatform => excluded += 1,
            PlanCommandTargetState::SignalCompleted => {
                eligible += 1;
                completed += 1;
            }
            PlanCommandTargetState::SignalPending | PlanCommandTargetState::SignalSent => {
                eligible += 1;
            }
        }
    }

    if completed < eligible {
        PlanState::InProgress
    } else if eligible == 0 || excluded > 0 {
        PlanState::IncompleteTargets
    } else {
        PlanState::Completed
    }
}

/// Aggregate the per-command states into the plan state.
fn aggregate_commands(commands: &[PlanCommandStatus]) -> PlanState {
    if commands.iter().any(|c| c.state == PlanState::Errored) {
        PlanState::Errored
    } else if commands.iter().any(|c| !c.state.is_terminal()) {
        PlanState::InProgress
    } else if commands
        .iter()
        .any(|c| c.state == PlanState::IncompleteTargets)
    {
        PlanState::IncompleteTargets
    } else {
        PlanState::Completed
    }
}
