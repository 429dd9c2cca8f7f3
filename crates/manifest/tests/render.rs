use std::fs;
use std::path::{Path, PathBuf};

use keel_core::{KeelError, ResourceId};
use keel_manifest::{load_applications, ManifestLoader};

fn tmp_root(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let p = std::env::temp_dir().join(format!("keel-manifest-{}-{}", tag, nanos));
    fs::create_dir_all(&p).unwrap();
    p
}

fn write(root: &Path, rel: &str, text: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, text).unwrap();
}

const DEPLOY: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: api
  labels: { app: api }
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: api
          image: api:1.0
          ports: [{ containerPort: 8080 }]
"#;

const SERVICE_AND_CONFIG: &str = r#"
apiVersion: v1
kind: Service
metadata: { name: api }
spec:
  ports: [{ port: 80, targetPort: 8080 }]
---
apiVersion: v1
kind: ConfigMap
metadata: { name: api-config }
data: { LOG_LEVEL: info }
"#;

fn base_tree(tag: &str) -> PathBuf {
    let root = tmp_root(tag);
    write(&root, "base/deployment.yaml", DEPLOY);
    write(&root, "base/service.yaml", SERVICE_AND_CONFIG);
    write(
        &root,
        "overlays/production/layer.yaml",
        r#"
bases: [../../base]
namespace: production
commonLabels: { env: production }
patches:
  - target: { kind: Deployment, name: api }
    merge: { spec: { replicas: 3 } }
"#,
    );
    root
}

#[test]
fn production_overlay_scales_single_api_deployment() {
    let root = base_tree("prod");
    let set = ManifestLoader::new().load(&root.join("base"), &[root.join("overlays/production")]).unwrap();
    let deployments: Vec<_> = set.resources().iter().filter(|d| d.kind() == "Deployment").collect();
    assert_eq!(deployments.len(), 1);
    let api = deployments[0];
    assert_eq!(api.id, ResourceId::new("Deployment", Some("production"), "api"));
    assert_eq!(api.body["spec"]["replicas"], 3);
    assert_eq!(api.labels.get("env").map(|s| s.as_str()), Some("production"));
    assert_eq!(set.len(), 3);
}

#[test]
fn overlay_alone_includes_its_base() {
    let root = base_tree("alone");
    let loader = ManifestLoader::new();
    let chained = loader.load(&root.join("base"), &[root.join("overlays/production")]).unwrap();
    let alone = loader.load(&root.join("overlays/production"), &[]).unwrap();
    assert_eq!(chained.canonical_bytes(), alone.canonical_bytes());
}

#[test]
fn rendering_is_byte_identical() {
    let root = base_tree("determinism");
    let loader = ManifestLoader::new();
    let a = loader.load(&root.join("base"), &[root.join("overlays/production")]).unwrap();
    let b = loader.load(&root.join("base"), &[root.join("overlays/production")]).unwrap();
    assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    assert_eq!(a.to_yaml(), b.to_yaml());
    assert_eq!(a.fingerprint(), b.fingerprint());

    // the same content in a fresh tree renders to the same bytes
    let other = base_tree("determinism-copy");
    let c = loader.load(&other.join("base"), &[other.join("overlays/production")]).unwrap();
    assert_eq!(a.canonical_bytes(), c.canonical_bytes());
}

#[test]
fn overlay_applied_twice_equals_once() {
    let root = base_tree("idem");
    write(
        &root,
        "overlays/staging/layer.yaml",
        r#"
resources: [flags.yaml]
namePrefix: stg-
patches:
  - target: { kind: Deployment, name: api }
    merge:
      spec:
        template:
          spec:
            containers:
              - name: api
                image: api:2.0
              - name: proxy
                image: envoy:1
  - target: { kind: Service, name: api }
    ops:
      - { op: add, path: /spec/ports/-, value: { port: 443, targetPort: 8443 } }
      - { op: remove, path: /spec/clusterIP }
"#,
    );
    write(&root, "overlays/staging/flags.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: flags }\ndata: { beta: \"true\" }\n");
    let loader = ManifestLoader::new();
    let o = root.join("overlays/staging");
    let once = loader.load(&root.join("base"), &[o.clone()]).unwrap();
    let twice = loader.load(&root.join("base"), &[o.clone(), o]).unwrap();
    assert_eq!(once.canonical_bytes(), twice.canonical_bytes());

    let api = once.get(&ResourceId::new("Deployment", None, "stg-api")).unwrap();
    let containers = api.body["spec"]["template"]["spec"]["containers"].as_array().unwrap();
    assert_eq!(containers.len(), 2);
    assert_eq!(containers[0]["image"], "api:2.0");
    assert_eq!(containers[0]["ports"][0]["containerPort"], 8080);
    let svc = once.get(&ResourceId::new("Service", None, "stg-api")).unwrap();
    assert_eq!(svc.body["spec"]["ports"].as_array().unwrap().len(), 2);
    assert!(once.get(&ResourceId::new("ConfigMap", None, "stg-flags")).is_some());
}

#[test]
fn missing_patch_target_is_missing_reference() {
    let root = base_tree("missing-target");
    write(&root, "overlays/bad/layer.yaml", "patches:\n  - target: { kind: Deployment, name: nope }\n    merge: { spec: { replicas: 2 } }\n");
    let err = ManifestLoader::new().load(&root.join("base"), &[root.join("overlays/bad")]).unwrap_err();
    assert!(matches!(err, KeelError::MissingReference { .. }), "err={}", err);
}

#[test]
fn missing_include_is_missing_reference() {
    let root = tmp_root("missing-base");
    write(&root, "app/layer.yaml", "bases: [../nowhere]\n");
    let err = ManifestLoader::new().load(&root.join("app"), &[]).unwrap_err();
    assert!(matches!(err, KeelError::MissingReference { ref reference, .. } if reference.contains("nowhere")), "err={}", err);
    let err = ManifestLoader::new().load(&root.join("not-a-layer"), &[]).unwrap_err();
    assert!(matches!(err, KeelError::MissingReference { .. }), "err={}", err);
}

#[test]
fn include_cycle_is_named() {
    let root = tmp_root("cycle");
    write(&root, "a/layer.yaml", "bases: [../b]\n");
    write(&root, "b/layer.yaml", "bases: [../c]\n");
    write(&root, "c/layer.yaml", "bases: [../a]\n");
    let err = ManifestLoader::new().load(&root.join("a"), &[]).unwrap_err();
    match err {
        KeelError::CyclicInclude { cycle } => assert_eq!(cycle, vec!["a", "b", "c", "a"]),
        other => panic!("unexpected: {}", other),
    }
}

fn diamond(tag: &str, right_patch: &str) -> PathBuf {
    let root = tmp_root(tag);
    write(&root, "shared/deployment.yaml", DEPLOY);
    write(&root, "left/layer.yaml", "bases: [../shared]\npatches:\n  - target: { kind: Deployment, name: api }\n    merge: { spec: { replicas: 2 } }\n");
    write(&root, "right/layer.yaml", &format!("bases: [../shared]\npatches:\n  - target: {{ kind: Deployment, name: api }}\n    merge: {}\n", right_patch));
    write(&root, "top/layer.yaml", "bases: [../left, ../right]\n");
    root
}

#[test]
fn diamond_merges_disjoint_changes() {
    let root = diamond("diamond-ok", "{ metadata: { annotations: { owner: right } } }");
    let set = ManifestLoader::new().load(&root.join("top"), &[]).unwrap();
    assert_eq!(set.len(), 1);
    let api = &set.resources()[0];
    assert_eq!(api.body["spec"]["replicas"], 2);
    assert_eq!(api.annotations.get("owner").map(|s| s.as_str()), Some("right"));
}

#[test]
fn diamond_with_diverging_field_conflicts() {
    let root = diamond("diamond-conflict", "{ spec: { replicas: 5 } }");
    let err = ManifestLoader::new().load(&root.join("top"), &[]).unwrap_err();
    assert!(matches!(err, KeelError::PatchConflict { ref path, .. } if path == "/spec/replicas"), "err={}", err);
}

#[test]
fn same_identity_from_two_files_is_duplicate() {
    let root = tmp_root("dup");
    write(&root, "base/a.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: cfg }\n");
    write(&root, "base/b.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: cfg }\ndata: { x: y }\n");
    let err = ManifestLoader::new().load(&root.join("base"), &[]).unwrap_err();
    assert!(matches!(err, KeelError::DuplicateIdentity { .. }), "err={}", err);
}

#[test]
fn unknown_kinds_and_sealed_secrets_pass_through() {
    let root = tmp_root("passthrough");
    write(&root, "base/widget.yaml", "apiVersion: example.com/v1alpha1\nkind: Widget\nmetadata: { name: w }\nspec: { gizmo: { size: 3 } }\nextra: [1, 2]\n");
    write(&root, "base/sealed.yaml", "apiVersion: bitnami.com/v1alpha1\nkind: SealedSecret\nmetadata: { name: db }\nspec: { encryptedData: { password: AgBy8hQ== } }\n");
    write(&root, "prod/layer.yaml", "bases: [../base]\nnamespace: prod\n");
    let set = ManifestLoader::new().load(&root.join("base"), &[root.join("prod")]).unwrap();
    let w = set.get(&ResourceId::new("Widget", Some("prod"), "w")).unwrap();
    assert_eq!(w.body["spec"]["gizmo"]["size"], 3);
    assert_eq!(w.body["extra"], serde_json::json!([1, 2]));
    let s = set.get(&ResourceId::new("SealedSecret", Some("prod"), "db")).unwrap();
    assert_eq!(s.body["spec"]["encryptedData"]["password"], "AgBy8hQ==");

    write(&root, "bad/layer.yaml", "patches:\n  - target: { kind: SealedSecret, name: db }\n    merge: { spec: { encryptedData: { password: x } } }\n");
    let err = ManifestLoader::new().load(&root.join("base"), &[root.join("bad")]).unwrap_err();
    assert!(matches!(err, KeelError::MalformedInput { .. }), "err={}", err);
}

#[test]
fn malformed_documents_are_rejected() {
    let root = tmp_root("malformed");
    write(&root, "yaml/bad.yaml", "apiVersion: v1\nkind: [unterminated\n");
    let err = ManifestLoader::new().load(&root.join("yaml"), &[]).unwrap_err();
    assert!(matches!(err, KeelError::MalformedInput { .. }), "err={}", err);

    write(&root, "nokind/cm.yaml", "apiVersion: v1\nmetadata: { name: x }\n");
    let err = ManifestLoader::new().load(&root.join("nokind"), &[]).unwrap_err();
    assert!(err.to_string().contains("missing kind"), "err={}", err);

    write(&root, "big/cm.yaml", SERVICE_AND_CONFIG);
    let err = ManifestLoader::with_limits(64, 100_000).load(&root.join("big"), &[]).unwrap_err();
    assert!(err.to_string().contains("too large"), "err={}", err);
}

#[test]
fn deletion_markers_and_replace_ops() {
    let root = base_tree("markers");
    write(
        &root,
        "overlays/trim/layer.yaml",
        r#"
patches:
  - target: { kind: ConfigMap, name: api-config }
    merge: { $patch: delete }
  - target: { kind: Deployment, name: api }
    merge: { metadata: { labels: { app: null } } }
  - target: { kind: Deployment, name: api }
    ops: [{ op: replace, path: /spec/template/spec/containers/0/image, value: "api:1.1" }]
"#,
    );
    let set = ManifestLoader::new().load(&root.join("base"), &[root.join("overlays/trim")]).unwrap();
    assert!(set.get(&ResourceId::new("ConfigMap", None, "api-config")).is_none());
    let api = set.get(&ResourceId::new("Deployment", None, "api")).unwrap();
    assert!(api.labels.is_empty());
    assert_eq!(api.body["spec"]["template"]["spec"]["containers"][0]["image"], "api:1.1");
}

#[test]
fn applications_load_from_directory() {
    let root = base_tree("apps");
    write(
        &root,
        "apps/web.yaml",
        "apiVersion: keel.io/v1\nkind: Application\nmetadata: { name: web }\nspec:\n  source: { location: .., path: base, overlays: [overlays/production] }\n  destination: { endpoint: \"mem://prod\", namespace: production }\n",
    );
    write(
        &root,
        "apps/nested/jobs.yaml",
        "apiVersion: keel.io/v1\nkind: Application\nmetadata: { name: jobs }\nspec:\n  source: { location: .., path: base }\n  destination: { endpoint: \"mem://prod\", namespace: jobs }\n  syncPolicy: { automated: true, backoffBase: 1s }\n",
    );
    let apps = load_applications(&root.join("apps")).unwrap();
    let names: Vec<&str> = apps.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["jobs", "web"]);
    let web = &apps[1];
    let set = ManifestLoader::new().load_source(Path::new(&web.source.location), &web.source).unwrap();
    assert_eq!(set.len(), 3);

    write(&root, "apps/dupe.yaml", "apiVersion: keel.io/v1\nkind: Application\nmetadata: { name: web }\nspec:\n  source: { location: .., path: base }\n  destination: { endpoint: \"mem://prod\", namespace: x }\n");
    let err = load_applications(&root.join("apps")).unwrap_err();
    assert!(matches!(err, KeelError::DuplicateIdentity { .. }), "err={}", err);
}
