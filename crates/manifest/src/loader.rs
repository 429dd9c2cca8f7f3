//! Include-graph evaluation and resource file parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use keel_core::{KeelError, KeelResult, ResourceDecl, Source};
use metrics::histogram;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::layer::{LayerFile, LAYER_FILES};
use crate::render::{apply_layer, LayerState, RenderedSet};
use crate::{json_node_budget_exceeded, max_yaml_bytes, max_yaml_nodes, read_capped};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark { Grey, Black }

/// Loads a base layer plus an overlay sequence into a [`RenderedSet`].
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    max_bytes: usize,
    max_nodes: usize,
}

impl Default for ManifestLoader {
    fn default() -> Self { Self::new() }
}

impl ManifestLoader {
    /// Limits from `KEEL_MAX_YAML_BYTES` / `KEEL_MAX_YAML_NODES`.
    pub fn new() -> Self { Self { max_bytes: max_yaml_bytes(), max_nodes: max_yaml_nodes() } }

    pub fn with_limits(max_bytes: usize, max_nodes: usize) -> Self { Self { max_bytes, max_nodes } }

    /// Render `base` with `overlays` applied on top, in order.
    pub fn load(&self, base: &Path, overlays: &[PathBuf]) -> KeelResult<RenderedSet> {
        let t0 = Instant::now();
        let root = base.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut eval = Evaluator { loader: self, root: canonical_or(&root), marks: HashMap::new(), memo: HashMap::new(), stack: Vec::new() };
        let base_dir = resolve_dir(Path::new(""), base, "overlay sequence")?;
        let mut state = eval.eval(&base_dir)?;
        let mut chain = vec![base_dir];
        for o in overlays {
            let dir = resolve_dir(Path::new(""), o, "overlay sequence")?;
            state = eval.eval_overlay(&dir, state, &chain)?;
            chain.push(dir);
        }
        let set = RenderedSet::from_state(state, &base.display().to_string())?;
        histogram!("render_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(base = %base.display(), overlays = overlays.len(), resources = set.len(), fingerprint = %set.fingerprint_hex(), took_ms = %t0.elapsed().as_millis(), "render: ok");
        Ok(set)
    }

    /// Render an application source checked out at `root`.
    pub fn load_source(&self, root: &Path, source: &Source) -> KeelResult<RenderedSet> {
        let base = root.join(&source.path);
        let overlays: Vec<PathBuf> = source.overlays.iter().map(|o| root.join(o)).collect();
        self.load(&base, &overlays)
    }

    /// Parse every document of one resource file. Empty documents are skipped and `kind: List`
    /// documents are flattened into their items.
    pub fn parse_file(&self, path: &Path) -> KeelResult<Vec<Json>> {
        let origin = path.display().to_string();
        let text = read_capped(path, self.max_bytes)?;
        self.parse_documents(&text, &origin)
    }

    pub fn parse_documents(&self, text: &str, origin: &str) -> KeelResult<Vec<Json>> {
        let mut out = Vec::new();
        for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
            let val = serde_yaml::Value::deserialize(doc).map_err(|e| KeelError::malformed(origin, format!("document {}: {}", i, e)))?;
            if val.is_null() { continue; }
            let json = serde_json::to_value(val).map_err(|e| KeelError::malformed(origin, format!("document {}: {}", i, e)))?;
            if json_node_budget_exceeded(&json, self.max_nodes) {
                return Err(KeelError::malformed(origin, format!("document {} too complex (>{} nodes)", i, self.max_nodes)));
            }
            if json.get("kind").and_then(|k| k.as_str()) == Some("List") {
                let items = json.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
                out.extend(items.into_iter().filter(|i| !i.is_null()));
            } else {
                out.push(json);
            }
        }
        for obj in &out { ResourceDecl::from_object(obj, origin)?; }
        Ok(out)
    }

    fn resource_files(&self, dir: &Path, layer: &LayerFile) -> KeelResult<Vec<PathBuf>> {
        if let Some(list) = &layer.resources {
            let mut files = Vec::with_capacity(list.len());
            for r in list {
                let p = dir.join(r);
                if p.is_dir() {
                    return Err(KeelError::malformed(dir.display().to_string(), format!("resource {} is a directory; list it under bases", r)));
                }
                if !p.is_file() {
                    return Err(KeelError::missing(dir.display().to_string(), r.clone()));
                }
                files.push(p);
            }
            return Ok(files);
        }
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_resource_file(p))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn is_resource_file(p: &Path) -> bool {
    let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name.starts_with('.') || LAYER_FILES.contains(&name) { return false; }
    matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

fn canonical_or(p: &Path) -> PathBuf { p.canonicalize().unwrap_or_else(|_| p.to_path_buf()) }

fn resolve_dir(from: &Path, rel: &Path, origin: &str) -> KeelResult<PathBuf> {
    let p = from.join(rel);
    match p.canonicalize() {
        Ok(c) if c.is_dir() => Ok(c),
        _ => Err(KeelError::missing(origin, rel.display().to_string())),
    }
}

struct Evaluator<'a> {
    loader: &'a ManifestLoader,
    root: PathBuf,
    marks: HashMap<PathBuf, Mark>,
    memo: HashMap<PathBuf, LayerState>,
    stack: Vec<PathBuf>,
}

impl<'a> Evaluator<'a> {
    fn display(&self, p: &Path) -> String {
        p.strip_prefix(&self.root).map(|r| r.display().to_string()).unwrap_or_else(|_| p.display().to_string())
    }

    fn enter(&mut self, dir: &Path) -> KeelResult<()> {
        if self.marks.get(dir) == Some(&Mark::Grey) {
            let start = self.stack.iter().position(|p| p == dir).unwrap_or(0);
            let mut cycle: Vec<String> = self.stack[start..].iter().map(|p| self.display(p)).collect();
            cycle.push(self.display(dir));
            return Err(KeelError::CyclicInclude { cycle });
        }
        self.marks.insert(dir.to_path_buf(), Mark::Grey);
        self.stack.push(dir.to_path_buf());
        Ok(())
    }

    fn leave(&mut self, dir: &Path) {
        self.stack.pop();
        self.marks.insert(dir.to_path_buf(), Mark::Black);
    }

    /// Depth-first evaluation of a layer and its includes. Shared layers evaluate once.
    fn eval(&mut self, dir: &Path) -> KeelResult<LayerState> {
        if let Some(done) = self.memo.get(dir) { return Ok(done.clone()); }
        self.enter(dir)?;
        let name = self.display(dir);
        let layer = LayerFile::read(dir, self.loader.max_bytes)?;
        let mut inputs = Vec::with_capacity(layer.bases.len());
        for b in &layer.bases {
            let inc = resolve_dir(dir, Path::new(b), &name)?;
            inputs.push(self.eval(&inc)?);
        }
        let state = self.render(dir, &name, &layer, inputs)?;
        self.leave(dir);
        self.memo.insert(dir.to_path_buf(), state.clone());
        Ok(state)
    }

    /// An overlay applies on top of the accumulated chain. Its includes that are already in the
    /// chain are satisfied by it; the rest evaluate as siblings.
    fn eval_overlay(&mut self, dir: &Path, acc: LayerState, chain: &[PathBuf]) -> KeelResult<LayerState> {
        self.enter(dir)?;
        let name = self.display(dir);
        let layer = LayerFile::read(dir, self.loader.max_bytes)?;
        let mut inputs = vec![acc];
        for b in &layer.bases {
            let inc = resolve_dir(dir, Path::new(b), &name)?;
            if chain.contains(&inc) { continue; }
            inputs.push(self.eval(&inc)?);
        }
        let state = self.render(dir, &name, &layer, inputs)?;
        // Not memoized: the same overlay may appear again later in the sequence.
        self.stack.pop();
        self.marks.remove(dir);
        Ok(state)
    }

    fn render(&self, dir: &Path, name: &str, layer: &LayerFile, inputs: Vec<LayerState>) -> KeelResult<LayerState> {
        let mut own = Vec::new();
        for f in self.loader.resource_files(dir, layer)? {
            own.extend(self.loader.parse_file(&f)?);
        }
        debug!(layer = %name, includes = inputs.len(), own = own.len(), patches = layer.patches.len(), "render: layer");
        apply_layer(dir, name, layer, inputs, own)
    }
}
