//! Layer evaluation: sibling union, own resources, patches, substitutions, and the rendered set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use keel_core::{canonical_bytes, fingerprint, is_cluster_scoped, is_passthrough, sort_keys, KeelError, KeelResult, KindRef, ResourceDecl, ResourceId};
use serde::Serialize;
use serde_json::{Map, Value as Json};

use crate::layer::{LayerFile, PatchSpec};
use crate::merge::{apply_op, changes, first_conflict, is_delete_marker, merge3, strategic_merge, OpError};

/// Where a declaration first appeared: the declaring layer and its identity there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Provenance {
    pub layer: PathBuf,
    pub id: ResourceId,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tracked {
    pub provenance: Provenance,
    /// Object exactly as declared; the shared origin of a three-way merge.
    pub origin: Json,
    pub object: Json,
}

impl Tracked {
    pub fn declared(layer: &Path, object: Json) -> KeelResult<Self> {
        let id = ResourceDecl::from_object(&object, &layer.display().to_string())?.id;
        Ok(Self { provenance: Provenance { layer: layer.to_path_buf(), id }, origin: object.clone(), object })
    }

    fn original_name(&self) -> &str { &self.provenance.id.name }
}

/// Evaluated state of a layer, keyed by current identity.
pub(crate) type LayerState = BTreeMap<ResourceId, Tracked>;

fn current_id(t: &Tracked, origin: &str) -> KeelResult<ResourceId> {
    Ok(ResourceDecl::from_object(&t.object, origin)?.id)
}

fn duplicate(id: &ResourceId, a: &Provenance, b: &Provenance) -> KeelError {
    KeelError::DuplicateIdentity {
        resource: id.to_string(),
        message: format!("declared by {} and {}", a.layer.display(), b.layer.display()),
    }
}

/// Evaluate one layer over the states of its includes.
///
/// `name` is the layer's display name for error messages; `own` are the objects its resource
/// files declare, in file order.
pub(crate) fn apply_layer(dir: &Path, name: &str, layer: &LayerFile, inputs: Vec<LayerState>, own: Vec<Json>) -> KeelResult<LayerState> {
    let mut state = union_siblings(inputs)?;
    add_own(dir, &mut state, own)?;
    apply_patches(name, &mut state, &layer.patches)?;
    transform(layer, &mut state);
    rekey(state, name)
}

/// Union of sibling include states. A resource reached through two siblings from the same
/// declaration is three-way merged against its origin.
fn union_siblings(inputs: Vec<LayerState>) -> KeelResult<LayerState> {
    let mut out = LayerState::new();
    for input in inputs {
        for (id, t) in input {
            match out.get_mut(&id) {
                None => { out.insert(id, t); }
                Some(existing) if existing.provenance == t.provenance => {
                    if existing.object == t.object { continue; }
                    existing.object = merge3(&t.origin, &existing.object, &t.object).map_err(|path| KeelError::PatchConflict {
                        resource: id.to_string(),
                        path,
                        message: "sibling bases modify the same field differently".into(),
                    })?;
                }
                Some(existing) => return Err(duplicate(&id, &existing.provenance, &t.provenance)),
            }
        }
    }
    Ok(out)
}

fn add_own(dir: &Path, state: &mut LayerState, own: Vec<Json>) -> KeelResult<()> {
    let mut seen = BTreeSet::new();
    for obj in own {
        let t = Tracked::declared(dir, obj)?;
        if !seen.insert(t.provenance.id.clone()) {
            return Err(duplicate(&t.provenance.id, &t.provenance, &t.provenance));
        }
        // A layer applied again on top of itself re-declares the same resources.
        state.retain(|_, e| e.provenance != t.provenance);
        let id = t.provenance.id.clone();
        if let Some(existing) = state.get(&id) {
            return Err(duplicate(&id, &existing.provenance, &t.provenance));
        }
        state.insert(id, t);
    }
    Ok(())
}

/// Result of one patch on one object: `None` when the patch deletes the resource.
fn patch_object(origin: &str, id: &ResourceId, obj: &Json, spec: &PatchSpec) -> KeelResult<Option<Json>> {
    if is_passthrough(&id.kind) && touches_body(spec) {
        return Err(KeelError::malformed(origin, format!("{} is an opaque passthrough kind; only metadata may be patched", id)));
    }
    let mut out = obj.clone();
    if let Some(m) = &spec.merge {
        if is_delete_marker(m) { return Ok(None); }
        if !m.is_object() {
            return Err(KeelError::malformed(origin, format!("merge patch for {} must be a mapping", id)));
        }
        strategic_merge(&mut out, m);
    }
    for op in &spec.ops {
        apply_op(&mut out, op).map_err(|e| match e {
            OpError::Missing(p) => KeelError::missing(origin, format!("{} {}", id, p)),
            OpError::Invalid(m) => KeelError::malformed(origin, m),
        })?;
    }
    Ok(Some(out))
}

fn touches_body(spec: &PatchSpec) -> bool {
    let merge_body = spec.merge.as_ref().and_then(|m| m.as_object()).map(|m| m.keys().any(|k| k != "metadata")).unwrap_or(false);
    let ops_body = spec.ops.iter().any(|op| !op.path().starts_with("/metadata/"));
    merge_body || ops_body
}

/// Patches apply in declaration order. Two patches of one layer that disagree on a field of the
/// same resource (judged against the pre-layer object) are a conflict.
fn apply_patches(name: &str, state: &mut LayerState, patches: &[PatchSpec]) -> KeelResult<()> {
    if patches.is_empty() { return Ok(()); }
    let pre = state.clone();
    let mut effects: BTreeMap<ResourceId, Vec<(usize, Option<crate::merge::ChangeSet>)>> = BTreeMap::new();
    for (i, spec) in patches.iter().enumerate() {
        if spec.is_noop() { continue; }
        let targets: Vec<&ResourceId> = pre.iter().filter(|(_, t)| {
            ResourceDecl::from_object(&t.object, name).map(|d| spec.target.matches(&d, t.original_name())).unwrap_or(false)
        }).map(|(id, _)| id).collect();
        if targets.is_empty() {
            return Err(KeelError::missing(name, format!("patch target {}", spec.target)));
        }
        for id in targets {
            let before = &pre[id].object;
            let after = patch_object(name, id, before, spec)?;
            effects.entry(id.clone()).or_default().push((i, after.map(|a| changes(before, &a))));
        }
    }
    for (id, list) in &effects {
        for (x, (_, a)) in list.iter().enumerate() {
            for (_, b) in &list[x + 1..] {
                let path = match (a, b) {
                    (Some(a), Some(b)) => first_conflict(a, b),
                    (None, Some(c)) | (Some(c), None) if !c.is_empty() => Some(String::new()),
                    _ => None,
                };
                if let Some(path) = path {
                    return Err(KeelError::PatchConflict {
                        resource: id.to_string(),
                        path: if path.is_empty() { "/".into() } else { path },
                        message: format!("patches in {} disagree", name),
                    });
                }
            }
        }
    }
    for (id, list) in effects {
        for (i, _) in list {
            let Some(t) = state.get_mut(&id) else { break };
            match patch_object(name, &id, &t.object, &patches[i])? {
                Some(obj) => t.object = obj,
                None => { state.remove(&id); }
            }
        }
    }
    Ok(())
}

fn transform(layer: &LayerFile, state: &mut LayerState) {
    let prefix = layer.name_prefix.as_deref().unwrap_or("");
    let suffix = layer.name_suffix.as_deref().unwrap_or("");
    if layer.namespace.is_none() && prefix.is_empty() && suffix.is_empty() && layer.common_labels.is_empty() { return; }
    for t in state.values_mut() {
        let kind = t.object.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
        let Some(meta) = t.object.get_mut("metadata").and_then(|m| m.as_object_mut()) else { continue };
        if let Some(ns) = &layer.namespace {
            if !is_cluster_scoped(&kind) { meta.insert("namespace".into(), Json::String(ns.clone())); }
        }
        if let Some(Json::String(n)) = meta.get_mut("name") {
            if !prefix.is_empty() && !n.starts_with(prefix) { *n = format!("{}{}", prefix, n); }
            if !suffix.is_empty() && !n.ends_with(suffix) { n.push_str(suffix); }
        }
        if !layer.common_labels.is_empty() {
            let labels = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
            if !labels.is_object() { *labels = Json::Object(Map::new()); }
            if let Some(l) = labels.as_object_mut() {
                for (k, v) in &layer.common_labels { l.insert(k.clone(), Json::String(v.clone())); }
            }
        }
    }
}

fn rekey(state: LayerState, name: &str) -> KeelResult<LayerState> {
    let mut out = LayerState::new();
    for (_, t) in state {
        let id = current_id(&t, name)?;
        if let Some(existing) = out.get(&id) {
            return Err(duplicate(&id, &existing.provenance, &t.provenance));
        }
        out.insert(id, t);
    }
    Ok(out)
}

/// The rendered desired state of one application: sorted by identity, with a fingerprint over
/// its canonical serialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedSet {
    resources: Vec<ResourceDecl>,
    fingerprint: u64,
}

impl RenderedSet {
    pub fn new(mut resources: Vec<ResourceDecl>) -> Self {
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        let fingerprint = fingerprint(&canonical_bytes(&resources));
        Self { resources, fingerprint }
    }

    pub(crate) fn from_state(state: LayerState, origin: &str) -> KeelResult<Self> {
        let decls = state.values().map(|t| ResourceDecl::from_object(&t.object, origin)).collect::<KeelResult<Vec<_>>>()?;
        Ok(Self::new(decls))
    }

    pub fn resources(&self) -> &[ResourceDecl] { &self.resources }
    pub fn into_resources(self) -> Vec<ResourceDecl> { self.resources }
    pub fn len(&self) -> usize { self.resources.len() }
    pub fn is_empty(&self) -> bool { self.resources.is_empty() }
    pub fn fingerprint(&self) -> u64 { self.fingerprint }
    pub fn fingerprint_hex(&self) -> String { format!("{:016x}", self.fingerprint) }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDecl> {
        self.resources.binary_search_by(|d| d.id.cmp(id)).ok().map(|i| &self.resources[i])
    }

    pub fn canonical_bytes(&self) -> Vec<u8> { canonical_bytes(&self.resources) }

    /// Distinct kinds present, sorted.
    pub fn kinds(&self) -> Vec<KindRef> {
        let set: BTreeSet<KindRef> = self.resources.iter().map(|d| KindRef::new(d.api_version.clone(), d.kind())).collect();
        set.into_iter().collect()
    }

    /// Multi-document YAML stream in canonical order with sorted keys.
    pub fn to_yaml(&self) -> String {
        let mut out = String::new();
        for d in &self.resources {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&sort_keys(&d.to_object())).unwrap_or_default());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::TargetSelector;
    use serde_json::json;

    fn deploy(name: &str, replicas: i64) -> Json {
        json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": name }, "spec": { "replicas": replicas, "template": { "spec": { "containers": [ { "name": name, "image": "img:1" } ] } } } })
    }

    fn target(kind: &str, name: &str) -> TargetSelector {
        TargetSelector { kind: Some(kind.into()), name: Some(name.into()), ..Default::default() }
    }

    #[test]
    fn same_layer_patches_conflict() {
        let base = apply_layer(Path::new("base"), "base", &LayerFile::default(), vec![], vec![deploy("api", 1)]).unwrap();
        let layer = LayerFile {
            patches: vec![
                PatchSpec { target: target("Deployment", "api"), merge: Some(json!({ "spec": { "replicas": 2 } })), ops: vec![] },
                PatchSpec { target: target("Deployment", "api"), merge: Some(json!({ "spec": { "replicas": 4 } })), ops: vec![] },
            ],
            ..Default::default()
        };
        let err = apply_layer(Path::new("o"), "o", &layer, vec![base], vec![]).unwrap_err();
        assert!(matches!(err, KeelError::PatchConflict { ref path, .. } if path == "/spec/replicas"), "err={}", err);
    }

    #[test]
    fn agreeing_patches_compose() {
        let base = apply_layer(Path::new("base"), "base", &LayerFile::default(), vec![], vec![deploy("api", 1)]).unwrap();
        let layer = LayerFile {
            patches: vec![
                PatchSpec { target: target("Deployment", "api"), merge: Some(json!({ "spec": { "replicas": 2 } })), ops: vec![] },
                PatchSpec { target: target("Deployment", "api"), merge: Some(json!({ "metadata": { "annotations": { "a": "b" } } })), ops: vec![] },
            ],
            ..Default::default()
        };
        let out = apply_layer(Path::new("o"), "o", &layer, vec![base], vec![]).unwrap();
        let obj = &out.values().next().unwrap().object;
        assert_eq!(obj["spec"]["replicas"], 2);
        assert_eq!(obj["metadata"]["annotations"]["a"], "b");
    }

    #[test]
    fn delete_patch_removes_resource() {
        let base = apply_layer(Path::new("base"), "base", &LayerFile::default(), vec![], vec![deploy("api", 1), deploy("worker", 1)]).unwrap();
        let layer = LayerFile {
            patches: vec![PatchSpec { target: target("Deployment", "worker"), merge: Some(json!({ "$patch": "delete" })), ops: vec![] }],
            ..Default::default()
        };
        let out = apply_layer(Path::new("o"), "o", &layer, vec![base], vec![]).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn independent_declarations_collide() {
        let a = apply_layer(Path::new("a"), "a", &LayerFile::default(), vec![], vec![deploy("api", 1)]).unwrap();
        let b = apply_layer(Path::new("b"), "b", &LayerFile::default(), vec![], vec![deploy("api", 1)]).unwrap();
        let err = apply_layer(Path::new("top"), "top", &LayerFile::default(), vec![a, b], vec![]).unwrap_err();
        assert!(matches!(err, KeelError::DuplicateIdentity { .. }), "err={}", err);
    }

    #[test]
    fn renamed_set_is_sorted_and_fingerprinted() {
        let layer = LayerFile { name_prefix: Some("prod-".into()), namespace: Some("prod".into()), ..Default::default() };
        let ns = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "prod" } });
        let st = apply_layer(Path::new("o"), "o", &layer, vec![], vec![deploy("api", 1), ns]).unwrap();
        let set = RenderedSet::from_state(st, "o").unwrap();
        assert_eq!(set.resources()[0].id, ResourceId::new("Deployment", Some("prod"), "prod-api"));
        // cluster-scoped kinds keep no namespace
        assert_eq!(set.resources()[1].id, ResourceId::new("Namespace", None, "prod-prod"));
        assert_eq!(set.fingerprint_hex().len(), 16);
        assert!(set.get(&ResourceId::new("Deployment", Some("prod"), "prod-api")).is_some());
    }
}
