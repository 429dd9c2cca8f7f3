//! Application descriptors (`keel.io/v1` `Application`), from a file or a directory of files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use keel_core::{Application, Destination, KeelError, KeelResult, KindRef, Source, SyncPolicy};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::loader::ManifestLoader;

pub const APP_API_VERSION: &str = "keel.io/v1";
pub const APP_KIND: &str = "Application";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppSpec {
    source: Source,
    destination: Destination,
    #[serde(default)]
    sync_policy: SyncPolicy,
    #[serde(default)]
    tracked_kinds: Vec<KindRef>,
}

/// Load every application declared under `path`. Directories are walked recursively in name
/// order; relative source locations resolve against the declaring file's directory.
pub fn load_applications(path: &Path) -> KeelResult<Vec<Application>> {
    let loader = ManifestLoader::new();
    let files: Vec<std::path::PathBuf> = if path.is_dir() {
        walkdir::WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")))
            .collect()
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        return Err(KeelError::missing("applications", path.display().to_string()));
    };
    let mut apps = Vec::new();
    let mut names = BTreeSet::new();
    for f in files {
        let origin = f.display().to_string();
        let docs = loader.parse_file(&f)?;
        let dir = f.parent().unwrap_or_else(|| Path::new("."));
        for app in parse_applications(&docs, &origin, dir)? {
            if !names.insert(app.name.clone()) {
                return Err(KeelError::DuplicateIdentity { resource: format!("Application/{}", app.name), message: format!("declared again in {}", origin) });
            }
            apps.push(app);
        }
    }
    debug!(path = %path.display(), count = apps.len(), "apps: loaded");
    Ok(apps)
}

/// Convert parsed documents into applications; documents of other kinds are skipped.
pub fn parse_applications(docs: &[Json], origin: &str, base_dir: &Path) -> KeelResult<Vec<Application>> {
    let mut out = Vec::new();
    for doc in docs {
        if doc.get("kind").and_then(|k| k.as_str()) != Some(APP_KIND) { continue; }
        let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
        if api_version != APP_API_VERSION {
            return Err(KeelError::malformed(origin, format!("unsupported Application apiVersion {:?}", api_version)));
        }
        let meta = doc.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|n| n.as_str()).unwrap_or_default().to_string();
        let labels: BTreeMap<String, String> = match meta.and_then(|m| m.get("labels")) {
            None | Some(Json::Null) => BTreeMap::new(),
            Some(l) => serde_json::from_value(l.clone()).map_err(|e| KeelError::malformed(origin, format!("{}: labels: {}", name, e)))?,
        };
        let spec = doc.get("spec").cloned().ok_or_else(|| KeelError::malformed(origin, format!("{}: missing spec", name)))?;
        let mut spec: AppSpec = serde_json::from_value(spec).map_err(|e| KeelError::malformed(origin, format!("{}: {}", name, e)))?;
        if spec.sync_policy.retry_limit == 0 { spec.sync_policy.retry_limit = 1; }
        if !spec.source.location.contains("://") && Path::new(&spec.source.location).is_relative() {
            spec.source.location = base_dir.join(&spec.source.location).display().to_string();
        }
        out.push(Application { name, source: spec.source, destination: spec.destination, sync_policy: spec.sync_policy, tracked_kinds: spec.tracked_kinds, labels });
    }
    Ok(out)
}
