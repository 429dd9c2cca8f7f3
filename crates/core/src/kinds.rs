//! Kind metadata: apply ordering tiers, scope and passthrough kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A tracked `(apiVersion, kind)` pair, e.g. `apps/v1` + `Deployment`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindRef {
    pub api_version: String,
    pub kind: String,
}

impl KindRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// Split `apiVersion` into `(group, version)`; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Parse `v1/ConfigMap` or `apps/v1/Deployment`.
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Some(Self::new(*version, *kind)),
            [group, version, kind] => Some(Self::new(format!("{}/{}", group, version), *kind)),
            _ => None,
        }
    }
}

impl fmt::Display for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.api_version, self.kind) }
}

/// Tier assigned to kinds nobody listed; custom resources usually depend on everything else.
pub const UNKNOWN_TIER: u8 = 9;

/// Fixed partial order by kind: prerequisites get lower tiers and are applied first.
pub fn apply_tier(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" | "ClusterRole" | "Role" | "PriorityClass" | "StorageClass" => 2,
        "ClusterRoleBinding" | "RoleBinding" => 3,
        "Secret" | "SealedSecret" | "ConfigMap" | "PersistentVolume" | "PersistentVolumeClaim" | "LimitRange"
        | "ResourceQuota" => 4,
        "Service" | "Endpoints" | "EndpointSlice" => 5,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Pod" | "Job" | "CronJob" => 7,
        "Ingress" | "HorizontalPodAutoscaler" | "PodDisruptionBudget" | "NetworkPolicy" => 8,
        _ => UNKNOWN_TIER,
    }
}

/// Cluster-scoped built-in kinds; namespace substitution skips them.
pub fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "CustomResourceDefinition"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "PersistentVolume"
            | "StorageClass"
            | "PriorityClass"
            | "Node"
    )
}

/// Kinds whose payload is an encrypted blob produced outside the controller.
/// Never inspected, patched field-by-field or logged.
pub fn is_passthrough(kind: &str) -> bool {
    matches!(kind, "SealedSecret" | "EncryptedSecret" | "SopsSecret")
}
