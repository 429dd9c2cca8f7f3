//! Source resolution: turn an application's source into a rendered desired state and the
//! revision it was rendered from.

use std::path::PathBuf;
use std::time::Duration;

use keel_core::{Application, KeelError, KeelResult};
use keel_manifest::{ManifestLoader, RenderedSet};

#[derive(Debug, Clone)]
pub struct Resolved {
    /// `<requested revision>@<content fingerprint>`; changes whenever the rendered output does.
    pub revision: String,
    pub rendered: RenderedSet,
}

/// Blocking: implementations read files (or shell out to a VCS) and render.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, app: &Application) -> KeelResult<Resolved>;
}

/// Treats `source.location` as an already checked-out directory.
#[derive(Default)]
pub struct LocalSource {
    loader: ManifestLoader,
}

impl LocalSource {
    pub fn new() -> Self { Self { loader: ManifestLoader::new() } }

    pub fn with_loader(loader: ManifestLoader) -> Self { Self { loader } }
}

impl SourceResolver for LocalSource {
    fn resolve(&self, app: &Application) -> KeelResult<Resolved> {
        let root = PathBuf::from(&app.source.location);
        if !root.is_dir() {
            return Err(KeelError::missing(format!("application {}", app.name), format!("source location {}", root.display())));
        }
        let rendered = self.loader.load_source(&root, &app.source)?;
        Ok(Resolved { revision: format!("{}@{}", app.source.revision, rendered.fingerprint_hex()), rendered })
    }
}

/// Poll period for source changes, `KEEL_SOURCE_POLL_SECS` (default 30).
pub fn poll_interval() -> Duration {
    Duration::from_secs(std::env::var("KEEL_SOURCE_POLL_SECS").ok().and_then(|s| s.parse().ok()).filter(|n: &u64| *n > 0).unwrap_or(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Destination, Source, SyncPolicy};

    fn app(location: &str) -> Application {
        Application {
            name: "web".into(),
            source: Source { location: location.into(), revision: "main".into(), path: "base".into(), overlays: vec![] },
            destination: Destination { endpoint: "mem://a".into(), namespace: "web".into() },
            sync_policy: SyncPolicy::default(),
            tracked_kinds: vec![],
            labels: Default::default(),
        }
    }

    #[test]
    fn revision_tracks_content() {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let root = std::env::temp_dir().join(format!("keel-source-{}", nanos));
        std::fs::create_dir_all(root.join("base")).unwrap();
        let cm = |v: &str| format!("apiVersion: v1\nkind: ConfigMap\nmetadata: {{ name: c }}\ndata: {{ k: {} }}\n", v);
        std::fs::write(root.join("base/cm.yaml"), cm("one")).unwrap();
        let src = LocalSource::new();
        let a = app(&root.display().to_string());
        let r1 = src.resolve(&a).unwrap();
        assert!(r1.revision.starts_with("main@"));
        assert_eq!(src.resolve(&a).unwrap().revision, r1.revision);
        std::fs::write(root.join("base/cm.yaml"), cm("two")).unwrap();
        assert_ne!(src.resolve(&a).unwrap().revision, r1.revision);
    }

    #[test]
    fn missing_location_is_a_missing_reference() {
        let err = LocalSource::new().resolve(&app("/nonexistent/keel/repo")).unwrap_err();
        assert!(matches!(err, KeelError::MissingReference { .. }));
    }
}
