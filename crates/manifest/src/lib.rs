//! Keel manifest: layered configuration loading and desired-state rendering.

#![forbid(unsafe_code)]

use std::path::Path;

use keel_core::{KeelError, KeelResult};
use serde_json::Value as Json;

pub mod apps;
pub mod layer;
pub mod loader;
pub mod merge;
pub mod render;

pub use apps::{load_applications, parse_applications};
pub use layer::{LayerFile, PatchSpec, TargetSelector};
pub use loader::ManifestLoader;
pub use merge::{apply_op, strategic_merge, PatchOp};
pub use render::RenderedSet;

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_048_576) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // running counter; bail as soon as the budget is spent
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

fn read_capped(path: &Path, max_bytes: usize) -> KeelResult<String> {
    let origin = path.display().to_string();
    let meta = std::fs::metadata(path).map_err(|e| KeelError::missing(&origin, e.to_string()))?;
    if meta.len() as usize > max_bytes {
        return Err(KeelError::malformed(origin, format!("file too large (>{} bytes)", max_bytes)));
    }
    std::fs::read_to_string(path).map_err(|e| KeelError::malformed(origin, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_budget_counts_nested_values() {
        let v = serde_json::json!({ "a": [1, 2, 3], "b": { "c": true } });
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(json_node_budget_exceeded(&v, 4));
    }
}
