//! Kubernetes backend: dynamic objects resolved through discovery, server-side apply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use keel_core::{is_cluster_scoped, Destination, KindRef, ResourceDecl, ResourceId};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client, Config,
};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{observed, ClusterError, LiveState, ObserveQuery};

/// Field manager recorded on every server-side apply.
pub const FIELD_MANAGER: &str = "keel";

/// Endpoints that mean "whatever kubeconfig or the in-cluster environment says".
const INFERRED_ENDPOINTS: &[&str] = &["", "default", "in-cluster", "kubeconfig"];

#[derive(Clone)]
struct Conn {
    client: Client,
    discovery: Arc<Discovery>,
}

/// [`LiveState`] over real clusters. Clients and discovery are cached per endpoint.
#[derive(Default)]
pub struct KubeLiveState {
    conns: Mutex<HashMap<String, Conn>>,
}

impl KubeLiveState {
    pub fn new() -> Self { Self::default() }

    async fn conn(&self, endpoint: &str) -> Result<Conn, ClusterError> {
        let mut conns = self.conns.lock().await;
        if let Some(c) = conns.get(endpoint) { return Ok(c.clone()); }
        let t0 = Instant::now();
        let client = connect(endpoint).await.map_err(|e| ClusterError::Unreachable(format!("{:#}", e)))?;
        let discovery = Discovery::new(client.clone()).run().await.map_err(|e| classify(e, None))?;
        info!(endpoint = %endpoint, took_ms = %t0.elapsed().as_millis(), "kube: connected");
        let conn = Conn { client, discovery: Arc::new(discovery) };
        conns.insert(endpoint.to_string(), conn.clone());
        Ok(conn)
    }

    /// Drop a cached connection so the next call reconnects and rediscovers (new CRDs, rotated
    /// credentials).
    pub async fn invalidate(&self, endpoint: &str) { self.conns.lock().await.remove(endpoint); }
}

async fn connect(endpoint: &str) -> anyhow::Result<Client> {
    let mut cfg = Config::infer().await.context("inferring kube config")?;
    if !INFERRED_ENDPOINTS.contains(&endpoint) {
        cfg.cluster_url = endpoint.parse().with_context(|| format!("parsing endpoint {}", endpoint))?;
    }
    Client::try_from(cfg).context("building kube client")
}

fn gvk_of(k: &KindRef) -> GroupVersionKind {
    let (group, version) = k.group_version();
    GroupVersionKind::gvk(group, version, &k.kind)
}

fn resolve(conn: &Conn, k: &KindRef) -> Option<(ApiResource, bool)> {
    conn.discovery.resolve_gvk(&gvk_of(k)).map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
}

/// Map a kube error onto the cluster taxonomy. `id` is set for single-object writes, where a
/// 4xx means the object itself was refused.
fn classify(err: kube::Error, id: Option<&ResourceId>) -> ClusterError {
    match &err {
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => ClusterError::Forbidden(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => ClusterError::Unreachable(format!("{} ({})", ae.message, ae.code)),
        kube::Error::Api(ae) => match id {
            Some(id) => ClusterError::Rejected { id: id.clone(), message: format!("{} ({})", ae.message, ae.code) },
            None => ClusterError::Unreachable(format!("{} ({})", ae.message, ae.code)),
        },
        _ => ClusterError::Unreachable(err.to_string()),
    }
}

fn is_not_found(err: &kube::Error) -> bool { matches!(err, kube::Error::Api(ae) if ae.code == 404) }

fn api_for(conn: &Conn, ar: &ApiResource, namespaced: bool, ns: Option<&str>) -> Api<DynamicObject> {
    match (namespaced, ns) {
        (true, Some(ns)) => Api::namespaced_with(conn.client.clone(), ns, ar),
        _ => Api::all_with(conn.client.clone(), ar),
    }
}

fn target_namespace<'a>(dest: &'a Destination, id: &'a ResourceId) -> Option<&'a str> {
    if is_cluster_scoped(&id.kind) { return None; }
    Some(id.namespace.as_deref().unwrap_or(dest.namespace.as_str()))
}

fn to_json(obj: &DynamicObject, ar: &ApiResource) -> Result<serde_json::Value, ClusterError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClusterError::Unreachable(format!("serializing DynamicObject: {}", e)))?;
    // list items come back without type metadata
    if let Some(map) = raw.as_object_mut() {
        map.insert("apiVersion".into(), serde_json::Value::String(ar.api_version.clone()));
        map.insert("kind".into(), serde_json::Value::String(ar.kind.clone()));
    }
    Ok(raw)
}

#[async_trait]
impl LiveState for KubeLiveState {
    async fn observe(&self, dest: &Destination, query: &ObserveQuery) -> Result<Vec<ResourceDecl>, ClusterError> {
        let t0 = Instant::now();
        let conn = self.conn(&dest.endpoint).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = query.selector_string() { lp = lp.labels(&sel); }
        let mut out = Vec::new();
        for k in &query.kinds {
            let Some((ar, _)) = resolve(&conn, k) else {
                debug!(kind = %k, "kube: kind not served; skipping");
                continue;
            };
            let api: Api<DynamicObject> = Api::all_with(conn.client.clone(), &ar);
            let list = match api.list(&lp).await {
                Ok(l) => l,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(classify(e, None)),
            };
            for obj in &list.items {
                out.push(observed(to_json(obj, &ar)?, &dest.endpoint)?);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        histogram!("observe_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(endpoint = %dest.endpoint, kinds = query.kinds.len(), items = out.len(), took_ms = %t0.elapsed().as_millis(), "kube: observe ok");
        Ok(out)
    }

    async fn apply(&self, dest: &Destination, decl: &ResourceDecl) -> Result<(), ClusterError> {
        let conn = self.conn(&dest.endpoint).await?;
        let kind = KindRef::new(decl.api_version.clone(), decl.kind());
        let (ar, namespaced) = resolve(&conn, &kind)
            .ok_or_else(|| ClusterError::Rejected { id: decl.id.clone(), message: format!("{} is not served by {}", kind, dest.endpoint) })?;
        let ns = if namespaced { target_namespace(dest, &decl.id) } else { None };
        let mut obj = decl.to_object();
        if let (Some(ns), Some(meta)) = (ns, obj.get_mut("metadata").and_then(|m| m.as_object_mut())) {
            meta.insert("namespace".into(), serde_json::Value::String(ns.to_string()));
        }
        let api = api_for(&conn, &ar, namespaced, ns);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(decl.name(), &pp, &Patch::Apply(&obj)).await.map_err(|e| classify(e, Some(&decl.id)))?;
        counter!("kube_apply_total", 1u64);
        Ok(())
    }

    async fn delete(&self, dest: &Destination, id: &ResourceId) -> Result<(), ClusterError> {
        let conn = self.conn(&dest.endpoint).await?;
        let candidates: Vec<(ApiResource, bool)> = conn
            .discovery
            .groups()
            .flat_map(|g| g.recommended_resources())
            .filter(|(ar, _)| ar.kind == id.kind)
            .map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
            .collect();
        let Some((ar, namespaced)) = candidates.into_iter().next() else {
            return Err(ClusterError::Rejected { id: id.clone(), message: "kind not served".into() });
        };
        let api = api_for(&conn, &ar, namespaced, if namespaced { target_namespace(dest, id) } else { None });
        match api.delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(classify(e, Some(id))),
        }
        counter!("kube_delete_total", 1u64);
        Ok(())
    }

    async fn watch(&self, dest: &Destination, query: &ObserveQuery, tx: mpsc::Sender<ResourceId>) -> Result<(), ClusterError> {
        let conn = self.conn(&dest.endpoint).await?;
        let mut cfg = watcher::Config::default();
        if let Some(sel) = query.selector_string() { cfg = cfg.labels(&sel); }
        for k in &query.kinds {
            let Some((ar, _)) = resolve(&conn, k) else { continue };
            let api: Api<DynamicObject> = Api::all_with(conn.client.clone(), &ar);
            let tx = tx.clone();
            let cfg = cfg.clone();
            let kind = ar.kind.clone();
            tokio::spawn(async move {
                let stream = watcher::watcher(api, cfg).default_backoff();
                futures::pin_mut!(stream);
                info!(kind = %kind, "kube: watch started");
                while let Some(ev) = stream.next().await {
                    let objs = match ev {
                        Ok(watcher::Event::Applied(o)) | Ok(watcher::Event::Deleted(o)) => vec![o],
                        Ok(watcher::Event::Restarted(list)) => list,
                        Err(e) => {
                            warn!(kind = %kind, error = %e, "kube: watch error");
                            continue;
                        }
                    };
                    for o in objs {
                        let Some(name) = o.metadata.name.clone() else { continue };
                        let id = ResourceId::new(kind.clone(), o.metadata.namespace.as_deref(), name);
                        if tx.send(id).await.is_err() {
                            debug!(kind = %kind, "kube: watch receiver closed");
                            return;
                        }
                    }
                }
                warn!(kind = %kind, "kube: watch stream ended");
            });
        }
        Ok(())
    }
}
