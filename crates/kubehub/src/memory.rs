//! In-process cluster with fault injection. Backs tests and `--simulate` runs.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{is_cluster_scoped, Destination, ResourceDecl, ResourceId};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;

use crate::{observed, ClusterError, LiveState, ObserveQuery};

type Key = (String, ResourceId);

struct Watcher {
    endpoint: String,
    query: ObserveQuery,
    tx: mpsc::Sender<ResourceId>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Json>,
    observe_failures: VecDeque<ClusterError>,
    forbidden: Option<String>,
    rejected: HashSet<ResourceId>,
    stuck: HashSet<ResourceId>,
    apply_delay: Option<Duration>,
    watchers: Vec<Watcher>,
}

/// Live state held in memory, keyed by destination endpoint.
///
/// Applies add the fields a real API server would (uid, resourceVersion, managedFields, status
/// and a few defaults), so observation exercises normalization and desired-subset comparison.
/// Only edits made through [`MemoryCluster::edit`], [`MemoryCluster::insert`] and
/// [`MemoryCluster::remove`] are reported to watchers.
#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
    version: AtomicU64,
    observes: AtomicU64,
    applies: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not wedge every other caller
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn key(dest_endpoint: &str, dest_ns: &str, id: &ResourceId) -> Key {
        let mut id = id.clone();
        if id.namespace.is_none() && !is_cluster_scoped(&id.kind) { id.namespace = Some(dest_ns.to_string()); }
        (dest_endpoint.to_string(), id)
    }

    fn server_object(&self, decl: &ResourceDecl, id: &ResourceId) -> Json {
        let v = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let mut obj = decl.to_object();
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            if let Some(ns) = &id.namespace { meta.insert("namespace".into(), Json::String(ns.clone())); }
            meta.insert("uid".into(), Json::String(format!("00000000-0000-0000-0000-{:012}", v)));
            meta.insert("resourceVersion".into(), Json::String(v.to_string()));
            meta.insert("generation".into(), json!(1));
            meta.insert("creationTimestamp".into(), Json::String("2024-01-01T00:00:00Z".into()));
            meta.insert("managedFields".into(), json!([{ "manager": crate::FIELD_MANAGER, "operation": "Apply" }]));
        }
        if let Some(map) = obj.as_object_mut() {
            map.insert("status".into(), json!({ "observedGeneration": 1 }));
            if decl.kind() == "Deployment" {
                if let Some(spec) = map.get_mut("spec").and_then(|s| s.as_object_mut()) {
                    spec.entry("progressDeadlineSeconds").or_insert(json!(600));
                    spec.entry("revisionHistoryLimit").or_insert(json!(10));
                }
            }
        }
        obj
    }

    fn notify(inner: &mut Inner, endpoint: &str, id: &ResourceId, labels: &BTreeMap<String, String>) {
        inner.watchers.retain(|w| !w.tx.is_closed());
        for w in &inner.watchers {
            if w.endpoint != endpoint || !w.query.matches_labels(labels) { continue; }
            if !w.query.kinds.is_empty() && !w.query.kinds.iter().any(|k| k.kind == id.kind) { continue; }
            let _ = w.tx.try_send(id.clone());
        }
    }

    /// Seed or overwrite an object out of band, as another actor on the cluster would.
    pub fn insert(&self, dest: &Destination, decl: &ResourceDecl) {
        let key = Self::key(&dest.endpoint, &dest.namespace, &decl.id);
        let obj = self.server_object(decl, &key.1);
        let mut inner = self.lock();
        inner.objects.insert(key.clone(), obj);
        Self::notify(&mut inner, &dest.endpoint, &key.1, &decl.labels);
    }

    /// Mutate a live object out of band. Returns false when it does not exist.
    pub fn edit(&self, dest: &Destination, id: &ResourceId, f: impl FnOnce(&mut Json)) -> bool {
        let key = Self::key(&dest.endpoint, &dest.namespace, id);
        let mut inner = self.lock();
        let Some(obj) = inner.objects.get_mut(&key) else { return false };
        f(obj);
        let labels = ResourceDecl::from_object(obj, "memory").map(|d| d.labels).unwrap_or_default();
        Self::notify(&mut inner, &dest.endpoint, &key.1, &labels);
        true
    }

    /// Delete a live object out of band.
    pub fn remove(&self, dest: &Destination, id: &ResourceId) -> bool {
        let key = Self::key(&dest.endpoint, &dest.namespace, id);
        let mut inner = self.lock();
        let Some(obj) = inner.objects.remove(&key) else { return false };
        let labels = ResourceDecl::from_object(&obj, "memory").map(|d| d.labels).unwrap_or_default();
        Self::notify(&mut inner, &dest.endpoint, &key.1, &labels);
        true
    }

    /// Raw stored object, server fields included.
    pub fn get(&self, dest: &Destination, id: &ResourceId) -> Option<Json> {
        self.lock().objects.get(&Self::key(&dest.endpoint, &dest.namespace, id)).cloned()
    }

    pub fn len(&self, dest: &Destination) -> usize {
        self.lock().objects.keys().filter(|(e, _)| e == &dest.endpoint).count()
    }

    pub fn is_empty(&self, dest: &Destination) -> bool { self.len(dest) == 0 }

    /// Fail the next `n` observations with `err`.
    pub fn fail_observe(&self, n: usize, err: ClusterError) {
        let mut inner = self.lock();
        for _ in 0..n { inner.observe_failures.push_back(err.clone()); }
    }

    /// Deny every call with `Forbidden` until cleared.
    pub fn set_forbidden(&self, message: Option<&str>) { self.lock().forbidden = message.map(|s| s.to_string()); }

    /// Reject applies of `id` as invalid.
    pub fn reject(&self, id: ResourceId) { self.lock().rejected.insert(id); }

    /// Accept applies of `id` without ever persisting them.
    pub fn stick(&self, id: ResourceId) { self.lock().stuck.insert(id); }

    /// Delay every apply by `d`.
    pub fn set_apply_delay(&self, d: Option<Duration>) { self.lock().apply_delay = d; }

    pub fn observe_calls(&self) -> u64 { self.observes.load(Ordering::Relaxed) }
    pub fn apply_calls(&self) -> u64 { self.applies.load(Ordering::Relaxed) }
    pub fn delete_calls(&self) -> u64 { self.deletes.load(Ordering::Relaxed) }
}

#[async_trait]
impl LiveState for MemoryCluster {
    async fn observe(&self, dest: &Destination, query: &ObserveQuery) -> Result<Vec<ResourceDecl>, ClusterError> {
        self.observes.fetch_add(1, Ordering::Relaxed);
        let objects: Vec<Json> = {
            let mut inner = self.lock();
            if let Some(m) = &inner.forbidden { return Err(ClusterError::Forbidden(m.clone())); }
            if let Some(e) = inner.observe_failures.pop_front() { return Err(e); }
            inner
                .objects
                .iter()
                .filter(|((e, id), obj)| {
                    e == &dest.endpoint
                        && query.kinds.iter().any(|k| k.kind == id.kind && obj.get("apiVersion").and_then(|v| v.as_str()) == Some(k.api_version.as_str()))
                })
                .map(|(_, obj)| obj.clone())
                .collect()
        };
        let mut out = Vec::with_capacity(objects.len());
        for obj in objects {
            let decl = observed(obj, &dest.endpoint)?;
            if query.matches_labels(&decl.labels) { out.push(decl); }
        }
        Ok(out)
    }

    async fn apply(&self, dest: &Destination, decl: &ResourceDecl) -> Result<(), ClusterError> {
        self.applies.fetch_add(1, Ordering::Relaxed);
        let delay = {
            let inner = self.lock();
            if let Some(m) = &inner.forbidden { return Err(ClusterError::Forbidden(m.clone())); }
            inner.apply_delay
        };
        if let Some(d) = delay { tokio::time::sleep(d).await; }
        let key = Self::key(&dest.endpoint, &dest.namespace, &decl.id);
        let obj = self.server_object(decl, &key.1);
        let mut inner = self.lock();
        if inner.rejected.contains(&decl.id) {
            return Err(ClusterError::Rejected { id: decl.id.clone(), message: "admission webhook denied the request".into() });
        }
        if inner.stuck.contains(&decl.id) { return Ok(()); }
        inner.objects.insert(key, obj);
        Ok(())
    }

    async fn delete(&self, dest: &Destination, id: &ResourceId) -> Result<(), ClusterError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        if let Some(m) = &inner.forbidden { return Err(ClusterError::Forbidden(m.clone())); }
        inner.objects.remove(&Self::key(&dest.endpoint, &dest.namespace, id));
        Ok(())
    }

    async fn watch(&self, dest: &Destination, query: &ObserveQuery, tx: mpsc::Sender<ResourceId>) -> Result<(), ClusterError> {
        self.lock().watchers.push(Watcher { endpoint: dest.endpoint.clone(), query: query.clone(), tx });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::KindRef;

    fn dest() -> Destination { Destination { endpoint: "mem://test".into(), namespace: "web".into() } }

    fn cm(name: &str, app: &str) -> ResourceDecl {
        let mut d = ResourceDecl::from_object(&json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name }, "data": { "k": "v" } }), "test").unwrap();
        d.labels.insert(keel_core::TRACKING_LABEL.to_string(), app.to_string());
        d
    }

    #[tokio::test]
    async fn apply_then_observe_normalizes_server_fields() {
        let c = MemoryCluster::new();
        c.apply(&dest(), &cm("a", "web")).await.unwrap();
        let raw = c.get(&dest(), &ResourceId::new("ConfigMap", Some("web"), "a")).unwrap();
        assert!(raw["metadata"].get("uid").is_some());
        let q = ObserveQuery::tracked(vec![KindRef::new("v1", "ConfigMap")], "web");
        let live = c.observe(&dest(), &q).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, ResourceId::new("ConfigMap", Some("web"), "a"));
        assert!(live[0].body.get("status").is_none());
    }

    #[tokio::test]
    async fn selector_scopes_observation() {
        let c = MemoryCluster::new();
        c.insert(&dest(), &cm("mine", "web"));
        c.insert(&dest(), &cm("theirs", "billing"));
        let q = ObserveQuery::tracked(vec![KindRef::new("v1", "ConfigMap")], "web");
        let live = c.observe(&dest(), &q).await.unwrap();
        assert_eq!(live.iter().map(|d| d.name()).collect::<Vec<_>>(), vec!["mine"]);
    }

    #[tokio::test]
    async fn injected_faults_surface() {
        let c = MemoryCluster::new();
        let q = ObserveQuery::tracked(vec![KindRef::new("v1", "ConfigMap")], "web");
        c.fail_observe(1, ClusterError::Unreachable("connection refused".into()));
        assert!(matches!(c.observe(&dest(), &q).await, Err(ClusterError::Unreachable(_))));
        assert!(c.observe(&dest(), &q).await.is_ok());
        c.reject(ResourceId::new("ConfigMap", None, "bad"));
        assert!(matches!(c.apply(&dest(), &cm("bad", "web")).await, Err(ClusterError::Rejected { .. })));
        c.set_forbidden(Some("rbac"));
        assert!(matches!(c.delete(&dest(), &ResourceId::new("ConfigMap", None, "x")).await, Err(ClusterError::Forbidden(_))));
        assert_eq!(c.observe_calls(), 2);
    }

    #[tokio::test]
    async fn out_of_band_edits_reach_watchers() {
        let c = MemoryCluster::new();
        c.apply(&dest(), &cm("a", "web")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        c.watch(&dest(), &ObserveQuery::tracked(vec![KindRef::new("v1", "ConfigMap")], "web"), tx).await.unwrap();
        assert!(c.edit(&dest(), &ResourceId::new("ConfigMap", None, "a"), |o| o["data"]["k"] = json!("edited")));
        assert_eq!(rx.recv().await, Some(ResourceId::new("ConfigMap", Some("web"), "a")));
    }
}
