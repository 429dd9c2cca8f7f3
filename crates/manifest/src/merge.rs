//! Patch primitives: strategic merge, pointer ops, change sets and three-way merge.
//!
//! Every primitive here is idempotent: applying the same patch twice leaves the document as
//! applying it once. Operations that could not honor that (inserting or removing by array
//! index) are rejected instead.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Keys that identify elements of object lists, tried in order. The first key present on every
/// patch element wins.
pub const MERGE_KEYS: &[&str] = &["name", "containerPort", "port", "mountPath", "devicePath", "key", "ip"];

const DIRECTIVE: &str = "$patch";

fn directive(v: &Json) -> Option<&str> {
    v.as_object().and_then(|m| m.get(DIRECTIVE)).and_then(|d| d.as_str())
}

/// `{"$patch": "delete"}` marks the addressed object (or keyed list element) for deletion.
pub fn is_delete_marker(v: &Json) -> bool { directive(v) == Some("delete") }

/// Strategic merge of `patch` into `target`.
///
/// Objects merge recursively, scalars override, `null` deletes, keyed object lists merge by key
/// (append-with-dedup), other lists are replaced. `$patch: replace` swaps the object wholesale.
pub fn strategic_merge(target: &mut Json, patch: &Json) {
    let Json::Object(pm) = patch else {
        *target = patch.clone();
        return;
    };
    if directive(patch) == Some("replace") {
        *target = strip_directives(patch);
        return;
    }
    let Some(tm) = target.as_object_mut() else {
        *target = strip_directives(patch);
        return;
    };
    for (k, pv) in pm {
        if k == DIRECTIVE { continue; }
        if pv.is_null() || is_delete_marker(pv) {
            tm.remove(k);
            continue;
        }
        match tm.get_mut(k) {
            Some(tv) => merge_value(tv, pv),
            None => { tm.insert(k.clone(), strip_directives(pv)); }
        }
    }
}

fn merge_value(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(_) => strategic_merge(target, patch),
        Json::Array(items) => merge_list(target, items),
        other => *target = other.clone(),
    }
}

fn merge_key(items: &[Json]) -> Option<&'static str> {
    if items.is_empty() || !items.iter().all(|i| i.is_object()) { return None; }
    MERGE_KEYS.iter().copied().find(|k| {
        items.iter().all(|i| matches!(i.get(*k), Some(Json::String(_)) | Some(Json::Number(_)) | Some(Json::Bool(_))))
    })
}

fn merge_list(target: &mut Json, patch: &[Json]) {
    let Some(key) = merge_key(patch) else {
        *target = strip_directives(&Json::Array(patch.to_vec()));
        return;
    };
    let Some(items) = target.as_array_mut() else {
        *target = strip_directives(&Json::Array(patch.to_vec()));
        return;
    };
    for pe in patch {
        let kv = pe.get(key);
        let pos = items.iter().position(|te| te.get(key) == kv);
        if is_delete_marker(pe) {
            if let Some(i) = pos { items.remove(i); }
            continue;
        }
        match pos {
            Some(i) => strategic_merge(&mut items[i], pe),
            None => items.push(strip_directives(pe)),
        }
    }
}

/// Drop directives and `null` deletion markers from content that is inserted fresh.
pub fn strip_directives(v: &Json) -> Json {
    match v {
        Json::Object(m) => Json::Object(
            m.iter()
                .filter(|(k, v)| k.as_str() != DIRECTIVE && !v.is_null() && !is_delete_marker(v))
                .map(|(k, v)| (k.clone(), strip_directives(v)))
                .collect(),
        ),
        Json::Array(a) => Json::Array(a.iter().filter(|e| !is_delete_marker(e)).map(strip_directives).collect()),
        other => other.clone(),
    }
}

/// JSON-patch-like operation addressed by a JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Set an object field, or append to a list with a trailing `-` (skipped when an equal
    /// element is already present).
    Add { path: String, value: Json },
    /// Overwrite an existing value; the path must exist.
    Replace { path: String, value: Json },
    /// Remove an object field; removing a missing field is a no-op.
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// The addressed location does not exist.
    Missing(String),
    /// The operation itself is not acceptable.
    Invalid(String),
}

pub fn parse_pointer(path: &str) -> Result<Vec<String>, OpError> {
    if path.is_empty() {
        return Err(OpError::Invalid("empty path addresses the whole document".into()));
    }
    let rest = path.strip_prefix('/').ok_or_else(|| OpError::Invalid(format!("{}: pointer must start with '/'", path)))?;
    Ok(rest.split('/').map(|t| t.replace("~1", "/").replace("~0", "~")).collect())
}

fn child_mut<'a>(v: &'a mut Json, tok: &str) -> Option<&'a mut Json> {
    match v {
        Json::Object(m) => m.get_mut(tok),
        Json::Array(a) => tok.parse::<usize>().ok().and_then(move |i| a.get_mut(i)),
        _ => None,
    }
}

fn walk_mut<'a>(doc: &'a mut Json, toks: &[String]) -> Option<&'a mut Json> {
    let mut cur = doc;
    for t in toks { cur = child_mut(cur, t)?; }
    Some(cur)
}

pub fn apply_op(doc: &mut Json, op: &PatchOp) -> Result<(), OpError> {
    let toks = parse_pointer(op.path())?;
    let (last, parents) = match toks.split_last() {
        Some(x) => x,
        None => return Err(OpError::Invalid("empty pointer".into())),
    };
    match op {
        PatchOp::Add { path, value } => {
            let parent = walk_mut(doc, parents).ok_or_else(|| OpError::Missing(path.clone()))?;
            match parent {
                Json::Object(m) => {
                    m.insert(last.clone(), value.clone());
                    Ok(())
                }
                Json::Array(a) if last == "-" => {
                    if !a.contains(value) { a.push(value.clone()); }
                    Ok(())
                }
                Json::Array(_) => Err(OpError::Invalid(format!("{}: add by array index is not idempotent; append with '-'", path))),
                _ => Err(OpError::Missing(path.clone())),
            }
        }
        PatchOp::Replace { path, value } => {
            let slot = walk_mut(doc, &toks).ok_or_else(|| OpError::Missing(path.clone()))?;
            *slot = value.clone();
            Ok(())
        }
        PatchOp::Remove { path } => match walk_mut(doc, parents) {
            None => Ok(()),
            Some(Json::Object(m)) => {
                m.remove(last);
                Ok(())
            }
            Some(Json::Array(_)) => Err(OpError::Invalid(format!("{}: remove by array index is not idempotent; use a keyed merge with $patch: delete", path))),
            Some(_) => Ok(()),
        },
    }
}

/// Leaf-level changes between two documents: pointer -> new value, or `None` for a deletion.
/// Lists are compared as leaves.
pub type ChangeSet = BTreeMap<String, Option<Json>>;

pub fn changes(before: &Json, after: &Json) -> ChangeSet {
    let mut out = ChangeSet::new();
    walk_changes("", before, after, &mut out);
    out
}

fn join(prefix: &str, key: &str) -> String {
    format!("{}/{}", prefix, key.replace('~', "~0").replace('/', "~1"))
}

fn walk_changes(prefix: &str, before: &Json, after: &Json, out: &mut ChangeSet) {
    match (before, after) {
        (Json::Object(bm), Json::Object(am)) => {
            for (k, av) in am {
                let p = join(prefix, k);
                match bm.get(k) {
                    Some(bv) if bv == av => {}
                    Some(bv) => walk_changes(&p, bv, av, out),
                    None => added(&p, av, out),
                }
            }
            for k in bm.keys() {
                if !am.contains_key(k) { out.insert(join(prefix, k), None); }
            }
        }
        (b, a) => {
            if b != a { out.insert(prefix.to_string(), Some(a.clone())); }
        }
    }
}

fn added(path: &str, v: &Json, out: &mut ChangeSet) {
    match v {
        Json::Object(m) if !m.is_empty() => {
            for (k, vv) in m { added(&join(path, k), vv, out); }
        }
        _ => { out.insert(path.to_string(), Some(v.clone())); }
    }
}

fn is_ancestor(p: &str, q: &str) -> bool {
    q.len() > p.len() && q.starts_with(p) && q.as_bytes()[p.len()] == b'/'
}

/// First path where two change sets disagree: same field set to different outcomes, or a field
/// changed in one and an ancestor of it changed in the other.
pub fn first_conflict(a: &ChangeSet, b: &ChangeSet) -> Option<String> {
    for (pa, va) in a {
        for (pb, vb) in b {
            if pa == pb {
                if va != vb { return Some(pa.clone()); }
            } else if is_ancestor(pa, pb) {
                return Some(pa.clone());
            } else if is_ancestor(pb, pa) {
                return Some(pb.clone());
            }
        }
    }
    None
}

pub fn apply_changes(doc: &mut Json, cs: &ChangeSet) {
    for (path, v) in cs {
        match v {
            Some(v) => set_pointer(doc, path, v.clone()),
            None => remove_pointer(doc, path),
        }
    }
}

fn tokens(path: &str) -> Vec<String> {
    path.strip_prefix('/').unwrap_or(path).split('/').map(|t| t.replace("~1", "/").replace("~0", "~")).collect()
}

// Change-set paths never descend into lists, so every intermediate is an object.
fn set_pointer(doc: &mut Json, path: &str, v: Json) {
    if path.is_empty() {
        *doc = v;
        return;
    }
    let toks = tokens(path);
    let mut cur = doc;
    for t in &toks[..toks.len() - 1] {
        if !cur.is_object() { *cur = Json::Object(Map::new()); }
        let Json::Object(m) = cur else { return };
        cur = m.entry(t.clone()).or_insert_with(|| Json::Object(Map::new()));
    }
    if !cur.is_object() { *cur = Json::Object(Map::new()); }
    if let (Json::Object(m), Some(last)) = (cur, toks.last()) {
        m.insert(last.clone(), v);
    }
}

fn remove_pointer(doc: &mut Json, path: &str) {
    let toks = tokens(path);
    let Some((last, parents)) = toks.split_last() else { return };
    if let Some(Json::Object(m)) = walk_mut(doc, parents) {
        m.remove(last);
    }
}

/// Three-way merge of two descendants of `origin`. Returns the conflicting path on failure.
pub fn merge3(origin: &Json, a: &Json, b: &Json) -> Result<Json, String> {
    let ca = changes(origin, a);
    let cb = changes(origin, b);
    if let Some(path) = first_conflict(&ca, &cb) { return Err(path); }
    let mut out = origin.clone();
    apply_changes(&mut out, &ca);
    apply_changes(&mut out, &cb);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_override_and_null_deletes() {
        let mut t = json!({ "spec": { "replicas": 1, "paused": true } });
        strategic_merge(&mut t, &json!({ "spec": { "replicas": 3, "paused": null } }));
        assert_eq!(t, json!({ "spec": { "replicas": 3 } }));
    }

    #[test]
    fn keyed_lists_merge_and_dedup() {
        let mut t = json!({ "containers": [ { "name": "api", "image": "api:1" }, { "name": "sidecar", "image": "envoy" } ] });
        let p = json!({ "containers": [ { "name": "api", "image": "api:2" }, { "name": "metrics", "image": "exporter" } ] });
        strategic_merge(&mut t, &p);
        strategic_merge(&mut t, &p);
        assert_eq!(t["containers"].as_array().unwrap().len(), 3);
        assert_eq!(t["containers"][0]["image"], "api:2");
        assert_eq!(t["containers"][2]["name"], "metrics");
    }

    #[test]
    fn delete_marker_removes_keyed_element() {
        let mut t = json!({ "env": [ { "name": "A", "value": "1" }, { "name": "B", "value": "2" } ] });
        strategic_merge(&mut t, &json!({ "env": [ { "name": "A", "$patch": "delete" } ] }));
        assert_eq!(t, json!({ "env": [ { "name": "B", "value": "2" } ] }));
    }

    #[test]
    fn unkeyed_lists_replace() {
        let mut t = json!({ "args": ["--a", "--b"] });
        strategic_merge(&mut t, &json!({ "args": ["--c"] }));
        assert_eq!(t, json!({ "args": ["--c"] }));
    }

    #[test]
    fn replace_directive_swaps_object() {
        let mut t = json!({ "resources": { "limits": { "cpu": "1" }, "requests": { "cpu": "1" } } });
        strategic_merge(&mut t, &json!({ "resources": { "$patch": "replace", "limits": { "cpu": "2" } } }));
        assert_eq!(t, json!({ "resources": { "limits": { "cpu": "2" } } }));
    }

    #[test]
    fn pointer_ops_are_idempotent() {
        let mut t = json!({ "spec": { "ports": [80] } });
        let ops = vec![
            PatchOp::Add { path: "/spec/ports/-".into(), value: json!(443) },
            PatchOp::Replace { path: "/spec/ports/0".into(), value: json!(8080) },
            PatchOp::Remove { path: "/spec/missing".into() },
        ];
        for _ in 0..2 {
            for op in &ops { apply_op(&mut t, op).unwrap(); }
        }
        assert_eq!(t, json!({ "spec": { "ports": [8080, 443] } }));
    }

    #[test]
    fn pointer_errors() {
        let mut t = json!({ "spec": {} });
        assert_eq!(apply_op(&mut t, &PatchOp::Replace { path: "/spec/replicas".into(), value: json!(2) }), Err(OpError::Missing("/spec/replicas".into())));
        let mut l = json!({ "a": [1, 2] });
        assert!(matches!(apply_op(&mut l, &PatchOp::Remove { path: "/a/0".into() }), Err(OpError::Invalid(_))));
        assert!(matches!(apply_op(&mut l, &PatchOp::Add { path: "a".into(), value: json!(1) }), Err(OpError::Invalid(_))));
    }

    #[test]
    fn escaped_pointer_tokens() {
        let mut t = json!({ "metadata": { "annotations": {} } });
        apply_op(&mut t, &PatchOp::Add { path: "/metadata/annotations/example.com~1owner".into(), value: json!("team-a") }).unwrap();
        assert_eq!(t["metadata"]["annotations"]["example.com/owner"], "team-a");
        let cs = changes(&json!({}), &t);
        assert!(cs.contains_key("/metadata/annotations/example.com~1owner"));
    }

    #[test]
    fn merge3_unions_disjoint_changes() {
        let origin = json!({ "spec": { "replicas": 1, "template": { "image": "a" } } });
        let a = json!({ "spec": { "replicas": 2, "template": { "image": "a" } } });
        let b = json!({ "spec": { "replicas": 1, "template": { "image": "b" } }, "extra": { "x": 1 } });
        let m = merge3(&origin, &a, &b).unwrap();
        assert_eq!(m, json!({ "spec": { "replicas": 2, "template": { "image": "b" } }, "extra": { "x": 1 } }));
    }

    #[test]
    fn merge3_detects_conflicts() {
        let origin = json!({ "spec": { "replicas": 1 } });
        let a = json!({ "spec": { "replicas": 2 } });
        let b = json!({ "spec": { "replicas": 5 } });
        assert_eq!(merge3(&origin, &a, &b), Err("/spec/replicas".to_string()));
        // same outcome on both sides is not a conflict
        assert!(merge3(&origin, &a, &a).is_ok());
        // a field against its deleted ancestor
        let c = json!({});
        assert_eq!(merge3(&origin, &a, &c), Err("/spec".to_string()));
    }
}
