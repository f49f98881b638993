//! # Signal Store Indexer
//!
//! Named field indexes over the watched object stores, so that later
//! lookups by plan id or by node name are sublinear instead of
//! full-collection scans.
//!
//! Which indexes get installed depends on the scope the hosting process
//! runs in: a worker-scope process never handles `ControlNode` objects and
//! should not pay the maintenance cost of controller-only indexes.
//! Registration failure is fatal at startup: a lookup against an index
//! that silently failed to register would return incomplete results.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::crd::{ControlNode, Plan};
use crate::error::{Error, Result};

/// Scope the hosting process runs in, supplied at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexScope {
    Controller,
    Worker,
}

impl IndexScope {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexScope::Controller => "controller",
            IndexScope::Worker => "worker",
        }
    }
}

impl fmt::Display for IndexScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "controller" => Ok(IndexScope::Controller),
            "worker" => Ok(IndexScope::Worker),
            other => Err(format!("unknown scope '{other}', expected 'controller' or 'worker'")),
        }
    }
}

/// Identity of one registered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    pub kind: &'static str,
    pub field: &'static str,
}

/// Plans looked up by their immutable spec id.
pub const PLAN_BY_ID: IndexKey = IndexKey {
    kind: "Plan",
    field: "spec.id",
};

/// Controller-role signal objects by node name. Controller scope only.
pub const CONTROL_NODE_BY_NAME: IndexKey = IndexKey {
    kind: "ControlNode",
    field: "metadata.name",
};

/// Worker nodes by name.
pub const NODE_BY_NAME: IndexKey = IndexKey {
    kind: "Node",
    field: "metadata.name",
};

#[derive(Default)]
struct FieldIndexInner {
    /// index key -> object names carrying that key
    forward: BTreeMap<String, BTreeSet<String>>,
    /// object name -> keys it was last indexed under
    reverse: HashMap<String, Vec<String>>,
    /// True once the backing watch finished its initial listing. Until
    /// then an empty lookup result proves nothing.
    ready: bool,
}

/// One maintained field index. Writers are the watch-maintenance tasks;
/// readers are delegates and the reconciler.
#[derive(Default)]
pub struct FieldIndex {
    inner: RwLock<FieldIndexInner>,
}

impl fmt::Debug for FieldIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldIndex").finish_non_exhaustive()
    }
}

impl FieldIndex {
    /// Record (or re-record) the keys an object is indexed under.
    pub fn apply(&self, object: &str, keys: Vec<String>) {
        let mut inner = self.inner.write().expect("index lock poisoned");
        if let Some(old_keys) = inner.reverse.remove(object) {
            for key in old_keys {
                if let Some(names) = inner.forward.get_mut(&key) {
                    names.remove(object);
                    if names.is_empty() {
                        inner.forward.remove(&key);
                    }
                }
            }
        }
        for key in &keys {
            inner
                .forward
                .entry(key.clone())
                .or_default()
                .insert(object.to_string());
        }
        inner.reverse.insert(object.to_string(), keys);
    }

    /// Drop an object from the index.
    pub fn delete(&self, object: &str) {
        let mut inner = self.inner.write().expect("index lock poisoned");
        if let Some(old_keys) = inner.reverse.remove(object) {
            for key in old_keys {
                if let Some(names) = inner.forward.get_mut(&key) {
                    names.remove(object);
                    if names.is_empty() {
                        inner.forward.remove(&key);
                    }
                }
            }
        }
    }

    /// Object names indexed under `key`. O(log n).
    pub fn get(&self, key: &str) -> Vec<String> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .forward
            .get(key)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark the initial listing as complete.
    pub fn mark_ready(&self) {
        self.inner.write().expect("index lock poisoned").ready = true;
    }

    /// Whether a negative lookup can be trusted.
    pub fn is_ready(&self) -> bool {
        self.inner.read().expect("index lock poisoned").ready
    }
}

/// The set of indexes installed for a scope.
#[derive(Debug)]
pub struct IndexRegistry {
    scope: IndexScope,
    indexes: BTreeMap<IndexKey, Arc<FieldIndex>>,
}

impl IndexRegistry {
    pub fn scope(&self) -> IndexScope {
        self.scope
    }

    /// The index registered under `key`, if the scope installed it.
    pub fn index(&self, key: IndexKey) -> Option<Arc<FieldIndex>> {
        self.indexes.get(&key).map(Arc::clone)
    }

    /// Identities of every installed index.
    pub fn registered(&self) -> BTreeSet<IndexKey> {
        self.indexes.keys().copied().collect()
    }

    fn register(&mut self, key: IndexKey) -> Result<()> {
        if self
            .indexes
            .insert(key, Arc::new(FieldIndex::default()))
            .is_some()
        {
            return Err(Error::IndexRegistration {
                kind: key.kind.to_string(),
                field: key.field.to_string(),
            });
        }
        Ok(())
    }

    /// Feed a plan change into the plan-by-id index.
    pub fn apply_plan(&self, plan: &Plan) {
        if let Some(index) = self.indexes.get(&PLAN_BY_ID) {
            index.apply(&plan.name_any(), vec![plan.spec.id.clone()]);
        }
    }

    pub fn delete_plan(&self, name: &str) {
        if let Some(index) = self.indexes.get(&PLAN_BY_ID) {
            index.delete(name);
        }
    }

    pub fn apply_control_node(&self, node: &ControlNode) {
        if let Some(index) = self.indexes.get(&CONTROL_NODE_BY_NAME) {
            let name = node.name_any();
            index.apply(&name, vec![name.clone()]);
        }
    }

    pub fn delete_control_node(&self, name: &str) {
        if let Some(index) = self.indexes.get(&CONTROL_NODE_BY_NAME) {
            index.delete(name);
        }
    }

    pub fn apply_node(&self, node: &Node) {
        if let Some(index) = self.indexes.get(&NODE_BY_NAME) {
            let name = node.name_any();
            index.apply(&name, vec![name.clone()]);
        }
    }

    pub fn delete_node(&self, name: &str) {
        if let Some(index) = self.indexes.get(&NODE_BY_NAME) {
            index.delete(name);
        }
    }
}

/// Install the index set for `scope`.
pub fn register_indexers(scope: IndexScope) -> Result<IndexRegistry> {
    // (index, scope it is restricted to; None = both scopes)
    let specs: [(IndexKey, Option<IndexScope>); 3] = [
        (PLAN_BY_ID, None),
        (CONTROL_NODE_BY_NAME, Some(IndexScope::Controller)),
        (NODE_BY_NAME, None),
    ];

    let mut registry = IndexRegistry {
        scope,
        indexes: BTreeMap::new(),
    };

    for (key, restricted_to) in specs {
        // Worker instances never look up controller signal objects.
        if scope == IndexScope::Worker && restricted_to == Some(IndexScope::Controller) {
            continue;
        }
        registry.register(key)?;
    }

    Ok(registry)
}
