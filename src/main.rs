//! # Planpilot Controller
//!
//! A Kubernetes controller that drives declarative update plans across a
//! fleet of nodes.
//!
//! ## Overview
//!
//! This controller provides unattended fleet updates by:
//!
//! 1. **Watching Plan resources** - A cluster-scoped `Plan` describes the
//!    version to roll out, the artifacts per platform, and which nodes to
//!    target per role
//! 2. **Pre-flight checking** - The target version is checked against a
//!    table of removed Kubernetes APIs before anything is scheduled
//! 3. **Discovering targets** - Static node lists and label/field selectors
//!    are resolved into concrete per-node statuses
//! 4. **Signalling nodes** - Each target receives its instruction through a
//!    signal annotation on its signal object (`ControlNode` for
//!    controllers, the native `Node` for workers), which node agents poll
//! 5. **Aggregating reports** - Node progress reports are folded back into
//!    the plan status until the plan completes, errors, or finishes with
//!    incomplete target coverage
//!
//! ## Usage
//!
//! See the [README.md](../README.md) for detailed usage instructions and examples.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use planpilot::controller::{error_policy, reconcile, ClusterApiLister, KubePlanApi, PlanContext};
use planpilot::crd::{ControlNode, Plan};
use planpilot::delegate;
use planpilot::index::{
    register_indexers, IndexKey, IndexRegistry, IndexScope, CONTROL_NODE_BY_NAME, NODE_BY_NAME,
    PLAN_BY_ID,
};
use planpilot::provider::{
    airgapupdate::AirgapUpdateProvider, binaryupdate::BinaryUpdateProvider, ProviderRegistry,
};
use planpilot::signal;

#[derive(Debug, Parser)]
#[command(name = "planpilot", version, about = "Fleet update plan controller")]
struct Args {
    /// Role of this instance. Controller instances drive plans; worker
    /// instances only maintain their local indexes.
    #[arg(long, default_value = "controller")]
    scope: IndexScope,

    /// Node names that must never be selected as plan targets. Repeatable.
    #[arg(long = "exclude-from-plans", value_name = "NODE")]
    exclude_from_plans: Vec<String>,

    /// Seconds between reconcile passes while a plan is non-terminal.
    #[arg(long, default_value_t = 20)]
    resync_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planpilot=info".into()),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_DATETIME"),
        git = env!("BUILD_GIT_HASH"),
        scope = %args.scope,
        "Starting planpilot controller"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create a Kubernetes client")?;

    let registry = Arc::new(register_indexers(args.scope).context("Failed to install indexes")?);
    spawn_index_maintenance(&client, &registry);

    if args.scope == IndexScope::Worker {
        // Worker instances have no plan to drive; they keep their node
        // index warm for the local agent and wait for shutdown.
        info!("worker scope, not running the plan controller");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Controller stopped");
        return Ok(());
    }

    let delegates = delegate::delegate_map(&client, &registry);

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(BinaryUpdateProvider::new(
        delegates.clone(),
        &args.exclude_from_plans,
    )))?;
    providers.register(Arc::new(AirgapUpdateProvider::new(
        delegates.clone(),
        &args.exclude_from_plans,
    )))?;
    info!(commands = ?providers.command_ids(), "registered command providers");

    let context = Arc::new(
        PlanContext::new(
            Arc::new(KubePlanApi::new(&client)),
            providers,
            Arc::new(ClusterApiLister::new(&client)),
            registry,
        )
        .with_requeue_interval(std::time::Duration::from_secs(args.resync_interval)),
    );

    let plans: Api<Plan> = Api::all(client.clone());
    let control_nodes: Api<ControlNode> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    // Signal objects carry the node reports; any change to one requeues
    // the plan so reports are ingested promptly rather than on resync.
    Controller::new(plans, watcher::Config::default())
        .watches(control_nodes, watcher::Config::default(), |node| {
            signal::plan_ref_for(&node)
        })
        .watches(nodes, watcher::Config::default(), |node| {
            signal::plan_ref_for(&node)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(plan = %obj, "reconciled"),
                Err(err) => warn!(error = %err, "reconcile stream error"),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

/// Spawn one watch task per installed index. Each task feeds object
/// changes into its index and marks it ready once the initial listing
/// completes.
fn spawn_index_maintenance(client: &Client, registry: &Arc<IndexRegistry>) {
    if registry.index(PLAN_BY_ID).is_some() {
        let api: Api<Plan> = Api::all(client.clone());
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            maintain_index(api, PLAN_BY_ID, registry.clone(), move |reg, event| match event {
                IndexEvent::Apply(plan) => reg.apply_plan(&plan),
                IndexEvent::Delete(name) => reg.delete_plan(&name),
            })
            .await;
        });
    }

    if registry.index(CONTROL_NODE_BY_NAME).is_some() {
        let api: Api<ControlNode> = Api::all(client.clone());
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            maintain_index(api, CONTROL_NODE_BY_NAME, registry.clone(), move |reg, event| {
                match event {
                    IndexEvent::Apply(node) => reg.apply_control_node(&node),
                    IndexEvent::Delete(name) => reg.delete_control_node(&name),
                }
            })
            .await;
        });
    }

    if registry.index(NODE_BY_NAME).is_some() {
        let api: Api<Node> = Api::all(client.clone());
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            maintain_index(api, NODE_BY_NAME, registry.clone(), move |reg, event| match event {
                IndexEvent::Apply(node) => reg.apply_node(&node),
                IndexEvent::Delete(name) => reg.delete_node(&name),
            })
            .await;
        });
    }
}

enum IndexEvent<K> {
    Apply(K),
    Delete(String),
}

async fn maintain_index<K, F>(api: Api<K>, key: IndexKey, registry: Arc<IndexRegistry>, apply: F)
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    K::DynamicType: Default,
    F: Fn(&IndexRegistry, IndexEvent<K>),
{
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                apply(&registry, IndexEvent::Apply(obj));
            }
            Ok(watcher::Event::Delete(obj)) => {
                apply(&registry, IndexEvent::Delete(obj.name_any()));
            }
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitDone) => {
                if let Some(index) = registry.index(key) {
                    index.mark_ready();
                }
                debug!(kind = key.kind, field = key.field, "index ready");
            }
            Err(err) => {
                // The watcher restarts itself; readiness is preserved since
                // the index was already populated once.
                error!(kind = key.kind, error = %err, "index watch error");
            }
        }
    }
}
