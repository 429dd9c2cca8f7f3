//! `layer.yaml`: what a layer declares and how its patches select resources.

use std::collections::BTreeMap;
use std::path::Path;

use keel_core::{KeelError, KeelResult, ResourceDecl};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::merge::PatchOp;

pub const LAYER_FILES: &[&str] = &["layer.yaml", "layer.yml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerFile {
    /// Resource files, relative to the layer. `None` means every YAML file in the directory.
    #[serde(default)]
    pub resources: Option<Vec<String>>,
    #[serde(default)]
    pub bases: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub name_suffix: Option<String>,
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

impl LayerFile {
    /// Read the layer descriptor of `dir`, or an empty descriptor when it has none.
    pub fn read(dir: &Path, max_bytes: usize) -> KeelResult<Self> {
        for name in LAYER_FILES {
            let path = dir.join(name);
            if !path.is_file() { continue; }
            let origin = path.display().to_string();
            let text = crate::read_capped(&path, max_bytes)?;
            if text.trim().is_empty() { return Ok(Self::default()); }
            return serde_yaml::from_str(&text).map_err(|e| KeelError::malformed(origin, e.to_string()));
        }
        Ok(Self::default())
    }

    pub fn is_empty(&self) -> bool { self == &Self::default() }
}

/// One patch: a target selector plus a strategic merge document and/or pointer ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSpec {
    pub target: TargetSelector,
    #[serde(default)]
    pub merge: Option<Json>,
    #[serde(default)]
    pub ops: Vec<PatchOp>,
}

impl PatchSpec {
    pub fn is_noop(&self) -> bool { self.merge.is_none() && self.ops.is_empty() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// `k=v` pairs separated by commas; every pair must match.
    #[serde(default)]
    pub label_selector: Option<String>,
}

impl TargetSelector {
    /// `original_name` is the name before any prefix or suffix was applied.
    pub fn matches(&self, decl: &ResourceDecl, original_name: &str) -> bool {
        if let Some(k) = &self.kind { if k != decl.kind() { return false; } }
        if let Some(n) = &self.name { if n != decl.name() && n != original_name { return false; } }
        if let Some(ns) = &self.namespace { if Some(ns.as_str()) != decl.namespace() { return false; } }
        if let Some(sel) = &self.label_selector {
            for pair in sel.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                if decl.labels.get(k.trim()).map(|s| s.as_str()) != Some(v.trim()) { return false; }
            }
        }
        true
    }
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(k) = &self.kind { parts.push(format!("kind={}", k)); }
        if let Some(n) = &self.name { parts.push(format!("name={}", n)); }
        if let Some(ns) = &self.namespace { parts.push(format!("namespace={}", ns)); }
        if let Some(l) = &self.label_selector { parts.push(format!("labels={}", l)); }
        if parts.is_empty() { f.write_str("*") } else { f.write_str(&parts.join(",")) }
    }
}
