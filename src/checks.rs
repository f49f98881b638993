//! # Compatibility Checks
//!
//! Pre-flight compatibility checking for version bumps: a static table of
//! API resource kinds that Kubernetes has removed or renamed, and the logic
//! that refuses to schedule an upgrade which would remove support for a
//! resource the cluster still serves.
//!
//! The table is compiled in, sorted by `(group, version, kind)` and looked
//! up with a binary search. Sortedness and uniqueness are build-time
//! invariants enforced by tests, not runtime logic: anyone adding an entry
//! must keep the array sorted or the test suite fails.

use crate::error::{Error, Result};
use kube::core::GroupVersionKind;

/// One removed or renamed API resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedApi {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    /// Kubernetes version in which this group/version/kind stops being
    /// served.
    pub removed_in: &'static str,
    /// A version of the same group/kind that is still served, or empty when
    /// the kind is gone entirely.
    pub replacement: &'static str,
}

/// Sorted array of removed APIs. Keep sorted by (group, version, kind).
const REMOVED_GVKS: &[RemovedApi] = &[
    RemovedApi {
        group: "flowcontrol.apiserver.k8s.io",
        version: "v1beta2",
        kind: "FlowSchema",
        removed_in: "v1.29.0",
        replacement: "v1beta3",
    },
    RemovedApi {
        group: "flowcontrol.apiserver.k8s.io",
        version: "v1beta2",
        kind: "PriorityLevelConfiguration",
        removed_in: "v1.29.0",
        replacement: "v1",
    },
    RemovedApi {
        group: "flowcontrol.apiserver.k8s.io",
        version: "v1beta3",
        kind: "FlowSchema",
        removed_in: "v1.32.0",
        replacement: "v1",
    },
    RemovedApi {
        group: "flowcontrol.apiserver.k8s.io",
        version: "v1beta3",
        kind: "PriorityLevelConfiguration",
        removed_in: "v1.32.0",
        replacement: "v1",
    },
    // Test entry; no real cluster serves this group.
    RemovedApi {
        group: "planpilot.example.com",
        version: "v1beta1",
        kind: "RemovedCRD",
        removed_in: "v99.99.99",
        replacement: "",
    },
];

/// If `candidate` is a known-removed API, returns the Kubernetes version in
/// which it was removed and the still-served replacement version for the
/// group/kind (empty when there is none).
pub fn removed_in_version(candidate: &GroupVersionKind) -> Option<(&'static str, &'static str)> {
    REMOVED_GVKS
        .binary_search_by(|entry| {
            entry
                .group
                .cmp(candidate.group.as_str())
                .then_with(|| entry.version.cmp(candidate.version.as_str()))
                .then_with(|| entry.kind.cmp(candidate.kind.as_str()))
        })
        .ok()
        .map(|idx| (REMOVED_GVKS[idx].removed_in, REMOVED_GVKS[idx].replacement))
}

/// Pre-flight gate for a version bump.
///
/// For every API group/version/kind still in use on the cluster, refuses
/// the bump when the target version is at or beyond the version in which
/// that API stops being served. Having a replacement version does not help:
/// the in-use resources are still written against the removed version and
/// would silently break. Returns the first violation.
pub fn check_version(target: &str, in_use: &[GroupVersionKind]) -> Result<()> {
    let target_version = KubernetesVersion::parse(target)?;

    for gvk in in_use {
        let Some((removed_in, _replacement)) = removed_in_version(gvk) else {
            // Also covers resources already on a surviving apiVersion:
            // the table only keys the removed versions.
            continue;
        };
        if target_version >= KubernetesVersion::parse(removed_in)? {
            return Err(Error::IncompatibleVersion {
                target: target.to_string(),
                group: gvk.group.clone(),
                version: gvk.version.clone(),
                kind: gvk.kind.clone(),
                removed_in: removed_in.to_string(),
            });
        }
    }

    Ok(())
}

/// A parsed `vMAJOR.MINOR.PATCH` Kubernetes version. Build-metadata
/// suffixes (`v1.31.2+planpilot.0`) are ignored for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubernetesVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl KubernetesVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let stripped = raw
            .split('+')
            .next()
            .unwrap_or(raw)
            .trim_start_matches('v');

        let mut numbers = [0u64; 3];
        let mut count = 0;
        for part in stripped.split('.') {
            if count == numbers.len() {
                return Err(Error::InvalidVersion(raw.to_string()));
            }
            numbers[count] = part
                .parse::<u64>()
                .map_err(|_| Error::InvalidVersion(raw.to_string()))?;
            count += 1;
        }
        // Major and minor are required; patch defaults to zero.
        if count < 2 {
            return Err(Error::InvalidVersion(raw.to_string()));
        }

        Ok(KubernetesVersion {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
        })
    }
}
