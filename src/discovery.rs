//! # Discovery
//!
//! Resolves a command's target selector into concrete, existence- and
//! platform-checked node targets. Every named or selected candidate ends in
//! exactly one recorded status (resolved, missing, or incompatible) or is
//! removed up front by the exclusion list. Nothing is silently dropped.
//!
//! Resolution is split in two: the async half gathers candidate lookups
//! through a [`SignalDelegate`], and [`resolve_candidates`] turns those
//! lookups into statuses as a pure function. Re-running discovery against
//! an unchanged node set yields an identical status list, which is what
//! lets the reconciler recompute from scratch on every pass.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::crd::{
    PlanCommandTarget, PlanCommandTargetDiscovery, PlanCommandTargetState,
    PlanCommandTargetStatus, PlanResourceUrl,
};
use crate::delegate::{NodeSnapshot, SignalDelegate};
use crate::error::Result;

/// Outcome of looking one candidate up.
#[derive(Debug, Clone)]
pub enum CandidateLookup {
    /// The node exists; snapshot attached.
    Found(NodeSnapshot),
    /// The node conclusively does not exist.
    NotFound,
    /// The lookup failed transiently; existence is unknown.
    Failed(String),
}

/// One candidate implied by the target spec.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub lookup: CandidateLookup,
}

/// Result of discovery for one role of one command.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredTargets {
    /// One entry per non-excluded candidate.
    pub statuses: Vec<PlanCommandTargetStatus>,
    /// False while any candidate could not be conclusively checked. The
    /// reconciler must not schedule until this is true, or it would race
    /// ahead with a partial target set.
    pub all_resolved: bool,
}

/// Pure resolution of candidate lookups into target statuses.
///
/// Platform rules: a found node whose platform has an artifact entry (or no
/// platform constraint applies) is pending; a node without a matching
/// artifact, or whose platform is unknown, is an incompatible target and is
/// recorded as such rather than dropped.
pub fn resolve_candidates(
    candidates: &[Candidate],
    platforms: Option<&BTreeMap<String, PlanResourceUrl>>,
) -> DiscoveredTargets {
    let mut statuses = Vec::with_capacity(candidates.len());
    let mut all_resolved = true;

    for candidate in candidates {
        let state = match &candidate.lookup {
            CandidateLookup::Found(snapshot) => match platforms {
                None => PlanCommandTargetState::SignalPending,
                Some(platforms) => match &snapshot.platform {
                    Some(platform) if platforms.contains_key(&platform.identifier()) => {
                        PlanCommandTargetState::SignalPending
                    }
                    _ => {
                        debug!(
                            node = candidate.name.as_str(),
                            platform = ?snapshot.platform,
                            "no artifact for node platform, marking incompatible"
                        );
                        PlanCommandTargetState::SignalMissingPlatform
                    }
                },
            },
            CandidateLookup::NotFound => PlanCommandTargetState::SignalMissingNode,
            CandidateLookup::Failed(reason) => {
                warn!(
                    node = candidate.name.as_str(),
                    reason = reason.as_str(),
                    "candidate lookup inconclusive, discovery unresolved"
                );
                all_resolved = false;
                PlanCommandTargetState::SignalPending
            }
        };
        statuses.push(PlanCommandTargetStatus::new(candidate.name.clone(), state));
    }

    DiscoveredTargets {
        statuses,
        all_resolved,
    }
}

/// Resolve a target spec through a delegate.
///
/// Exclusions are applied before any existence check and produce no status
/// entry at all: an excluded node is simply not a candidate. A transient
/// failure listing selector matches leaves discovery unresolved with no
/// statuses rather than guessing at a partial candidate set.
pub async fn discover_nodes(
    target: &PlanCommandTarget,
    delegate: &dyn SignalDelegate,
    excluded: &BTreeSet<String>,
    platforms: Option<&BTreeMap<String, PlanResourceUrl>>,
) -> Result<DiscoveredTargets> {
    let names = match &target.discovery {
        PlanCommandTargetDiscovery::Static { nodes } => {
            let mut seen = BTreeSet::new();
            nodes
                .iter()
                .filter(|name| seen.insert(name.as_str()))
                .cloned()
                .collect()
        }
        PlanCommandTargetDiscovery::Selector { labels, fields } => {
            match delegate
                .list_node_names(labels.as_deref(), fields.as_deref())
                .await
            {
                Ok(names) => names,
                Err(err) => {
                    warn!(
                        role = %delegate.role(),
                        error = %err,
                        "selector listing failed, discovery unresolved"
                    );
                    return Ok(DiscoveredTargets {
                        statuses: Vec::new(),
                        all_resolved: false,
                    });
                }
            }
        }
    };

    let mut candidates = Vec::with_capacity(names.len());
    for name in names {
        if excluded.contains(&name) {
            debug!(node = name.as_str(), "excluded from all plans, skipping");
            continue;
        }
        let lookup = match delegate.get_node(&name).await {
            Ok(Some(snapshot)) => CandidateLookup::Found(snapshot),
            Ok(None) => CandidateLookup::NotFound,
            Err(err) => CandidateLookup::Failed(err.to_string()),
        };
        candidates.push(Candidate { name, lookup });
    }

    Ok(resolve_candidates(&candidates, platforms))
}
