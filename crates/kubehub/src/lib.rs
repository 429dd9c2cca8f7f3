//! Keel kubehub: observe, apply and delete resources on a destination cluster.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use keel_core::{Destination, KeelError, KindRef, ResourceDecl, ResourceId, TRACKING_LABEL};
use serde_json::Value as Json;
use thiserror::Error;
use tokio::sync::mpsc;

mod cluster;
mod memory;

pub use cluster::{KubeLiveState, FIELD_MANAGER};
pub use memory::MemoryCluster;

/// Failures talking to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// Transport failure, 5xx or throttling; worth retrying.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// Credentials rejected or RBAC denied; retrying will not help.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The server refused one object (validation, immutable field, unknown kind).
    #[error("rejected {id}: {message}")]
    Rejected { id: ResourceId, message: String },
}

impl From<ClusterError> for KeelError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Unreachable(m) => KeelError::Unreachable { message: m },
            ClusterError::Forbidden(m) => KeelError::Forbidden { message: m },
            ClusterError::Rejected { id, message } => KeelError::ApplyFailure { resource: id.to_string(), message },
        }
    }
}

/// Which live resources to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserveQuery {
    pub kinds: Vec<KindRef>,
    /// Single `key=value` label requirement.
    pub selector: Option<(String, String)>,
}

impl ObserveQuery {
    /// Resources of `kinds` carrying the tracking label of `app`.
    pub fn tracked(kinds: Vec<KindRef>, app: &str) -> Self {
        Self { kinds, selector: Some((TRACKING_LABEL.to_string(), app.to_string())) }
    }

    pub fn selector_string(&self) -> Option<String> { self.selector.as_ref().map(|(k, v)| format!("{}={}", k, v)) }

    pub fn matches_labels(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        match &self.selector {
            Some((k, v)) => labels.get(k) == Some(v),
            None => true,
        }
    }
}

/// A destination's live state. Implementations hold no authoritative copy for the controller;
/// every pass observes afresh.
#[async_trait]
pub trait LiveState: Send + Sync {
    /// Current state of the selected resources, normalized.
    async fn observe(&self, dest: &Destination, query: &ObserveQuery) -> Result<Vec<ResourceDecl>, ClusterError>;
    /// Create or update one resource.
    async fn apply(&self, dest: &Destination, decl: &ResourceDecl) -> Result<(), ClusterError>;
    /// Delete one resource; deleting a missing resource succeeds.
    async fn delete(&self, dest: &Destination, id: &ResourceId) -> Result<(), ClusterError>;
    /// Stream identities of resources changed on the live side into `tx` until it closes.
    async fn watch(&self, _dest: &Destination, _query: &ObserveQuery, _tx: mpsc::Sender<ResourceId>) -> Result<(), ClusterError> { Ok(()) }
}

const NOISY_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

const NOISY_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration", "deployment.kubernetes.io/revision"];

/// Drop server-generated fields so live objects compare against declarations.
pub fn normalize(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in NOISY_METADATA { meta.remove(*k); }
        let empty = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(ann) => {
                for k in NOISY_ANNOTATIONS { ann.remove(*k); }
                ann.is_empty()
            }
            None => false,
        };
        if empty { meta.remove("annotations"); }
    }
    // status is owned by the server
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Normalize and convert a live object into a declaration.
pub fn observed(v: Json, origin: &str) -> Result<ResourceDecl, ClusterError> {
    ResourceDecl::from_object(&normalize(v), origin).map_err(|e| ClusterError::Unreachable(format!("unreadable object from {}: {}", origin, e)))
}
