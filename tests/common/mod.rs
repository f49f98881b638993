//! Shared in-memory fixtures for driving the plan state machine without a
//! cluster: a fake signal store with optimistic-concurrency semantics, an
//! in-memory plan API, and a fixed API lister.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;

use planpilot::controller::{reconcile, ApiLister, PlanApi, PlanContext};
use planpilot::crd::{
    Plan, PlanCommand, PlanSpec, PlanState, PlanStatus, DEFAULT_PLAN_NAME,
};
use planpilot::delegate::{DelegateMap, NodeRole, NodeSnapshot, Platform, SignalDelegate};
use planpilot::index::{register_indexers, IndexRegistry, IndexScope};
use planpilot::provider::{
    airgapupdate::AirgapUpdateProvider, binaryupdate::BinaryUpdateProvider, ProviderRegistry,
};
use planpilot::signal::{self, SignalData, SignalState, SignalStatus};
use planpilot::{Error, Result};

/// Retry budget of the fake delegate's conditional writes, mirroring the
/// production delegates.
pub const WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
struct FakeNodeRecord {
    role: NodeRole,
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    platform: Option<Platform>,
    resource_version: u64,
}

impl FakeNodeRecord {
    fn apply_report(&mut self, state: SignalState) {
        let mut data = signal::read(&self.annotations)
            .expect("signal deserializes")
            .expect("signal present");
        data.status = Some(SignalStatus::new(state));
        signal::write(&mut self.annotations, &data).expect("signal serializes");
        self.resource_version += 1;
    }
}

#[derive(Default)]
struct StoreInner {
    nodes: BTreeMap<String, FakeNodeRecord>,
    /// Agent reports queued to land between a writer's read and its
    /// conditional write, so that write conflicts like it would against a
    /// real apiserver.
    racing_reports: BTreeMap<String, Vec<SignalState>>,
    /// Per-node count of conditional writes to reject outright, a stand-in
    /// for a contender that keeps winning.
    forced_conflicts: BTreeMap<String, u32>,
}

/// Node objects of both roles, keyed by name. Writes are conditional on
/// the resource version observed at read time and bump it on success, like
/// the real apiserver.
#[derive(Clone, Default)]
pub struct FakeSignalStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl FakeSignalStore {
    pub fn new() -> Self {
        FakeSignalStore::default()
    }

    pub fn add_node(&self, name: &str, role: NodeRole, os: &str, arch: &str) {
        self.add_labeled_node(name, role, os, arch, &[]);
    }

    pub fn add_labeled_node(
        &self,
        name: &str,
        role: NodeRole,
        os: &str,
        arch: &str,
        labels: &[(&str, &str)],
    ) {
        let record = FakeNodeRecord {
            role,
            annotations: BTreeMap::new(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            platform: Some(Platform::new(os, arch)),
            resource_version: 1,
        };
        self.inner
            .lock()
            .expect("store lock")
            .nodes
            .insert(name.to_string(), record);
    }

    /// The signal payload currently on a node, if any.
    pub fn signal_for(&self, name: &str) -> Option<SignalData> {
        let inner = self.inner.lock().expect("store lock");
        let record = inner.nodes.get(name)?;
        signal::read(&record.annotations).expect("signal deserializes")
    }

    /// Act as the node agent: write the report half of the signal object.
    pub fn report(&self, name: &str, state: SignalState) {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .nodes
            .get_mut(name)
            .expect("node exists")
            .apply_report(state);
    }

    /// Queue an agent report that lands between the next writer's read and
    /// its conditional write, making that write conflict.
    pub fn race_report_on_write(&self, name: &str, state: SignalState) {
        self.inner
            .lock()
            .expect("store lock")
            .racing_reports
            .entry(name.to_string())
            .or_default()
            .push(state);
    }

    /// Reject the next `count` conditional writes to a node, bumping the
    /// resource version each time as a winning contender would.
    pub fn conflict_writes(&self, name: &str, count: u32) {
        self.inner
            .lock()
            .expect("store lock")
            .forced_conflicts
            .insert(name.to_string(), count);
    }

    pub fn remove_node(&self, name: &str) {
        self.inner.lock().expect("store lock").nodes.remove(name);
    }

    fn versioned_annotations(&self, name: &str) -> Option<(BTreeMap<String, String>, u64)> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .nodes
            .get(name)
            .map(|record| (record.annotations.clone(), record.resource_version))
    }

    /// Replace a node's annotations if nobody wrote since `expected` was
    /// observed. Returns false on conflict; the writer must re-read.
    fn compare_and_write(
        &self,
        name: &str,
        expected: u64,
        annotations: BTreeMap<String, String>,
    ) -> bool {
        let mut inner = self.inner.lock().expect("store lock");

        let racing = inner.racing_reports.get_mut(name).and_then(|queued| {
            if queued.is_empty() {
                None
            } else {
                Some(queued.remove(0))
            }
        });
        if let Some(state) = racing {
            inner
                .nodes
                .get_mut(name)
                .expect("node exists")
                .apply_report(state);
        }

        let forced = inner.forced_conflicts.get_mut(name).is_some_and(|remaining| {
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        });
        if forced {
            inner.nodes.get_mut(name).expect("node exists").resource_version += 1;
            return false;
        }

        let Some(record) = inner.nodes.get_mut(name) else {
            return false;
        };
        if record.resource_version != expected {
            return false;
        }
        record.annotations = annotations;
        record.resource_version += 1;
        true
    }
}

/// Delegate over the fake store, restricted to one role.
pub struct FakeDelegate {
    role: NodeRole,
    store: FakeSignalStore,
}

impl FakeDelegate {
    pub fn new(role: NodeRole, store: FakeSignalStore) -> Self {
        FakeDelegate { role, store }
    }
}

#[async_trait]
impl SignalDelegate for FakeDelegate {
    fn role(&self) -> NodeRole {
        self.role
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeSnapshot>> {
        let inner = self.store.inner.lock().expect("store lock");
        Ok(inner
            .nodes
            .get(name)
            .filter(|record| record.role == self.role)
            .map(|record| NodeSnapshot {
                name: name.to_string(),
                resource_version: Some(record.resource_version.to_string()),
                annotations: record.annotations.clone(),
                labels: record.labels.clone(),
                platform: record.platform.clone(),
            }))
    }

    async fn list_node_names<'a>(
        &self,
        labels: Option<&'a str>,
        _fields: Option<&'a str>,
    ) -> Result<Vec<String>> {
        // Equality selectors only ("k=v,k2=v2"), which is all the tests use.
        let wanted: Vec<(&str, &str)> = labels
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.split_once('='))
            .collect();

        let inner = self.store.inner.lock().expect("store lock");
        Ok(inner
            .nodes
            .iter()
            .filter(|(_, record)| record.role == self.role)
            .filter(|(_, record)| {
                wanted
                    .iter()
                    .all(|(k, v)| record.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn write_signal(&self, name: &str, data: &SignalData) -> Result<()> {
        for _ in 0..WRITE_ATTEMPTS {
            let (mut annotations, version) = self
                .store
                .versioned_annotations(name)
                .expect("signalled node exists");
            let merged = signal::merged_for_write(signal::read(&annotations)?, data);
            signal::write(&mut annotations, &merged)?;
            if self.store.compare_and_write(name, version, annotations) {
                return Ok(());
            }
        }
        Err(Error::Conflict {
            object: format!("{}/{name}", self.role),
            attempts: WRITE_ATTEMPTS,
        })
    }
}

/// Plan API over a single in-memory plan.
#[derive(Clone)]
pub struct MemoryPlanApi {
    plan: Arc<Mutex<Plan>>,
}

impl MemoryPlanApi {
    pub fn new(plan: Plan) -> Self {
        MemoryPlanApi {
            plan: Arc::new(Mutex::new(plan)),
        }
    }

    pub fn plan(&self) -> Plan {
        self.plan.lock().expect("plan lock").clone()
    }

    pub fn status(&self) -> PlanStatus {
        self.plan().status.unwrap_or_default()
    }

    pub fn state(&self) -> PlanState {
        self.status().state
    }
}

#[async_trait]
impl PlanApi for MemoryPlanApi {
    async fn get(&self, name: &str) -> Result<Option<Plan>> {
        let plan = self.plan();
        Ok((plan.metadata.name.as_deref() == Some(name)).then_some(plan))
    }

    async fn patch_status(&self, _name: &str, status: &PlanStatus) -> Result<()> {
        self.plan.lock().expect("plan lock").status = Some(status.clone());
        Ok(())
    }
}

/// API lister returning a fixed, pre-canned set of served GVKs.
pub struct StaticApiLister {
    gvks: Vec<GroupVersionKind>,
}

impl StaticApiLister {
    pub fn empty() -> Self {
        StaticApiLister { gvks: Vec::new() }
    }

    pub fn serving(gvks: Vec<GroupVersionKind>) -> Self {
        StaticApiLister { gvks }
    }
}

#[async_trait]
impl ApiLister for StaticApiLister {
    async fn in_use_gvks(&self) -> Result<Vec<GroupVersionKind>> {
        Ok(self.gvks.clone())
    }
}

pub fn plan_named(name: &str, id: &str, commands: Vec<PlanCommand>) -> Plan {
    Plan::new(
        name,
        PlanSpec {
            id: id.to_string(),
            timestamp: Some("now".to_string()),
            commands,
        },
    )
}

pub fn plan_with(commands: Vec<PlanCommand>) -> Plan {
    plan_named(DEFAULT_PLAN_NAME, "plan-001", commands)
}

/// Fully wired context over the fake store.
pub fn harness(
    store: &FakeSignalStore,
    plans: MemoryPlanApi,
    lister: StaticApiLister,
) -> (Arc<PlanContext>, Arc<IndexRegistry>) {
    let registry = Arc::new(register_indexers(IndexScope::Controller).expect("indexes install"));

    let mut delegates: DelegateMap = BTreeMap::new();
    delegates.insert(
        NodeRole::Controller,
        Arc::new(FakeDelegate::new(NodeRole::Controller, store.clone())),
    );
    delegates.insert(
        NodeRole::Worker,
        Arc::new(FakeDelegate::new(NodeRole::Worker, store.clone())),
    );

    let mut providers = ProviderRegistry::new();
    providers
        .register(Arc::new(BinaryUpdateProvider::new(delegates.clone(), &[])))
        .expect("binary provider registers");
    providers
        .register(Arc::new(AirgapUpdateProvider::new(delegates, &[])))
        .expect("airgap provider registers");

    let context = Arc::new(PlanContext::new(
        Arc::new(plans),
        providers,
        Arc::new(lister),
        Arc::clone(&registry),
    ));
    (context, registry)
}

/// One reconcile pass against the stored plan.
pub async fn step(ctx: &Arc<PlanContext>, plans: &MemoryPlanApi) -> Action {
    reconcile(Arc::new(plans.plan()), Arc::clone(ctx))
        .await
        .expect("reconcile succeeds")
}

/// Reconcile until the plan reaches `target` or the pass budget runs out.
pub async fn drive_to(
    ctx: &Arc<PlanContext>,
    plans: &MemoryPlanApi,
    target: PlanState,
    max_passes: usize,
) {
    for _ in 0..max_passes {
        if plans.state() == target {
            return;
        }
        step(ctx, plans).await;
    }
    assert_eq!(plans.state(), target, "plan never reached {target}");
}
