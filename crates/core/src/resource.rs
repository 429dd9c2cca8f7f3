//! Resource declarations and their identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{KeelError, KeelResult};

/// Identity of a declaration: `(kind, namespace, name)`. Cluster-scoped kinds carry no namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A single declared (or observed) resource.
///
/// `body` holds every top-level field except `apiVersion`, `kind` and `metadata`; it is
/// treated as opaque structured data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub api_version: String,
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Map<String, Json>,
}

impl ResourceDecl {
    /// Build a declaration from a full object (`apiVersion`, `kind`, `metadata`, ...).
    /// `origin` names the file or endpoint the object came from, for error messages.
    pub fn from_object(obj: &Json, origin: &str) -> KeelResult<Self> {
        let map = obj.as_object().ok_or_else(|| KeelError::malformed(origin, "document is not a mapping"))?;
        let api_version = map.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| KeelError::malformed(origin, "missing apiVersion"))?;
        let kind = map.get("kind").and_then(|v| v.as_str()).ok_or_else(|| KeelError::malformed(origin, "missing kind"))?;
        let meta = map.get("metadata").and_then(|m| m.as_object());
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KeelError::malformed(origin, format!("{} missing metadata.name", kind)))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let labels = string_map(meta.and_then(|m| m.get("labels")), origin, "labels")?;
        let annotations = string_map(meta.and_then(|m| m.get("annotations")), origin, "annotations")?;
        let body = map
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "apiVersion" | "kind" | "metadata"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self { api_version: api_version.to_string(), id: ResourceId::new(kind, namespace, name), labels, annotations, body })
    }

    /// Reassemble the full object form.
    pub fn to_object(&self) -> Json {
        let mut meta = Map::new();
        meta.insert("name".into(), Json::String(self.id.name.clone()));
        if let Some(ns) = &self.id.namespace { meta.insert("namespace".into(), Json::String(ns.clone())); }
        if !self.labels.is_empty() {
            meta.insert("labels".into(), Json::Object(self.labels.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect()));
        }
        if !self.annotations.is_empty() {
            meta.insert("annotations".into(), Json::Object(self.annotations.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect()));
        }
        let mut obj = self.body.clone();
        obj.insert("apiVersion".into(), Json::String(self.api_version.clone()));
        obj.insert("kind".into(), Json::String(self.id.kind.clone()));
        obj.insert("metadata".into(), Json::Object(meta));
        Json::Object(obj)
    }

    pub fn kind(&self) -> &str { &self.id.kind }
    pub fn name(&self) -> &str { &self.id.name }
    pub fn namespace(&self) -> Option<&str> { self.id.namespace.as_deref() }
}

fn string_map(v: Option<&Json>, origin: &str, field: &str) -> KeelResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    match v {
        None | Some(Json::Null) => {}
        Some(Json::Object(m)) => {
            for (k, v) in m {
                let s = match v {
                    Json::String(s) => s.clone(),
                    Json::Bool(_) | Json::Number(_) => v.to_string(),
                    _ => return Err(KeelError::malformed(origin, format!("metadata.{}.{} must be a string", field, k))),
                };
                out.insert(k.clone(), s);
            }
        }
        Some(_) => return Err(KeelError::malformed(origin, format!("metadata.{} must be a mapping", field))),
    }
    Ok(out)
}

/// Canonical serialization of a declaration set: sorted by identity, object keys sorted.
pub fn canonical_bytes(decls: &[ResourceDecl]) -> Vec<u8> {
    let mut sorted: Vec<&ResourceDecl> = decls.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let objects: Vec<Json> = sorted.iter().map(|d| sort_keys(&d.to_object())).collect();
    serde_json::to_vec(&objects).unwrap_or_default()
}

/// Rebuild a value with object keys inserted in sorted order, independent of map ordering features.
pub fn sort_keys(v: &Json) -> Json {
    match v {
        Json::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys { out.insert(k.clone(), sort_keys(&m[k.as_str()])); }
            Json::Object(out)
        }
        Json::Array(a) => Json::Array(a.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_round_trip_keeps_identity_and_body() {
        let obj = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "api", "namespace": "prod", "labels": { "app": "api", "tier": 2 } },
            "spec": { "replicas": 1 }
        });
        let d = ResourceDecl::from_object(&obj, "base/deploy.yaml").unwrap();
        assert_eq!(d.id, ResourceId::new("Deployment", Some("prod"), "api"));
        assert_eq!(d.labels.get("tier").map(|s| s.as_str()), Some("2"));
        assert_eq!(d.body.get("spec"), Some(&serde_json::json!({ "replicas": 1 })));
        let back = d.to_object();
        assert_eq!(back["metadata"]["namespace"], "prod");
        assert_eq!(back["spec"]["replicas"], 1);
    }

    #[test]
    fn missing_fields_are_malformed() {
        let e = ResourceDecl::from_object(&serde_json::json!({ "kind": "ConfigMap" }), "x.yaml").unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"), "e={}", e);
        let e = ResourceDecl::from_object(&serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} }), "x.yaml").unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "e={}", e);
    }

    #[test]
    fn display_includes_namespace_when_present() {
        assert_eq!(ResourceId::new("ConfigMap", Some("ns"), "cfg").to_string(), "ConfigMap/ns/cfg");
        assert_eq!(ResourceId::new("Namespace", None, "ns").to_string(), "Namespace/ns");
    }
}
