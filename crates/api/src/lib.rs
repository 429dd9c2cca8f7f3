//! Keel public API façade (in-process).
//!
//! Frontends (the CLI today) depend on the [`KeelApi`] trait and its types only; the
//! implementation here calls the registry, controller and history store directly.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use keel_core::SyncCode;
use keel_persist::HistoryEntry;
use keel_store::ApplicationRecord;
use keel_sync::{Controller, SyncError, SyncReport};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// API errors; each maps to a distinct process exit code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("sync_in_progress: {0}")]
    SyncInProgress(String),
    #[error("policy_violation: {0}")]
    PolicyViolation(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ApiError::Internal(_) => 1,
            ApiError::Validation(_) => 2,
            ApiError::NotFound(_) => 3,
            ApiError::SyncInProgress(_) => 4,
            ApiError::PolicyViolation(_) => 5,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotFound(n) => ApiError::NotFound(format!("application {}", n)),
            SyncError::InProgress(n) => ApiError::SyncInProgress(format!("application {} is already syncing", n)),
            SyncError::Locked(n) => ApiError::PolicyViolation(format!("application {} is locked; manual sync is not allowed", n)),
            SyncError::Config(k) => ApiError::Validation(k.to_string()),
            SyncError::Internal(m) => ApiError::Internal(m),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub dry_run: bool,
}

/// Which applications to list. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub name: Option<Regex>,
    pub labels: BTreeMap<String, String>,
    pub code: Option<SyncCode>,
}

impl ListFilter {
    /// Build from CLI-style inputs: a name regex, `key=value` label pairs and a sync code.
    pub fn parse(name: Option<&str>, labels: &[String], code: Option<&str>) -> ApiResult<Self> {
        let name = name.map(Regex::new).transpose().map_err(|e| ApiError::Validation(format!("name filter: {}", e)))?;
        let mut map = BTreeMap::new();
        for l in labels {
            let (k, v) = l.split_once('=').ok_or_else(|| ApiError::Validation(format!("label filter {} is not key=value", l)))?;
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
        let code = code.map(|c| c.parse::<SyncCode>()).transpose().map_err(ApiError::Validation)?;
        Ok(Self { name, labels: map, code })
    }

    pub fn matches(&self, rec: &ApplicationRecord) -> bool {
        if let Some(re) = &self.name {
            if !re.is_match(rec.name()) { return false; }
        }
        if let Some(code) = self.code {
            if rec.code() != code { return false; }
        }
        self.labels.iter().all(|(k, v)| rec.app.labels.get(k) == Some(v))
    }
}

/// One row of an application listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub name: String,
    pub phase: String,
    pub code: SyncCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub endpoint: String,
    pub namespace: String,
    pub automated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&ApplicationRecord> for AppSummary {
    fn from(r: &ApplicationRecord) -> Self {
        Self {
            name: r.name().to_string(),
            phase: r.status.phase().to_string(),
            code: r.code(),
            revision: r.status.sync.revision().map(|s| s.to_string()),
            endpoint: r.app.destination.endpoint.clone(),
            namespace: r.app.destination.namespace.clone(),
            automated: r.app.sync_policy.automated,
            last_error: r.status.last_error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Control surface of a Keel controller.
#[async_trait::async_trait]
pub trait KeelApi: Send + Sync {
    /// Current record (definition, sync status, last error, running operation).
    async fn get_status(&self, app: &str) -> ApiResult<ApplicationRecord>;

    /// Compare desired with live now and record the result; applies nothing.
    async fn refresh(&self, app: &str) -> ApiResult<ApplicationRecord>;

    /// Manual sync. Fails with `SyncInProgress` while another sync of `app` runs and with
    /// `PolicyViolation` when the application is locked.
    async fn trigger_sync(&self, app: &str, req: SyncRequest) -> ApiResult<SyncReport>;

    async fn list_applications(&self, filter: ListFilter) -> ApiResult<Vec<AppSummary>>;

    /// Finished syncs, newest first.
    async fn history(&self, app: &str, limit: Option<usize>) -> ApiResult<Vec<HistoryEntry>>;
}

/// In-process implementation over a [`Controller`].
pub struct InProcApi {
    ctl: Controller,
}

impl InProcApi {
    pub fn new(ctl: Controller) -> Self { Self { ctl } }

    fn record(&self, app: &str) -> ApiResult<ApplicationRecord> {
        self.ctl.registry().get(app).map_err(|_| ApiError::NotFound(format!("application {}", app)))
    }
}

#[async_trait::async_trait]
impl KeelApi for InProcApi {
    async fn get_status(&self, app: &str) -> ApiResult<ApplicationRecord> {
        let rec = self.record(app)?;
        info!(app = %app, phase = %rec.status.phase(), "api: get_status ok");
        Ok(rec)
    }

    async fn refresh(&self, app: &str) -> ApiResult<ApplicationRecord> {
        let t0 = Instant::now();
        match self.ctl.refresh(app).await {
            Ok(_) => {}
            // the render error is recorded on the application; report the record
            Err(SyncError::Config(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let rec = self.record(app)?;
        info!(app = %app, code = %rec.code(), took_ms = %t0.elapsed().as_millis(), "api: refresh ok");
        Ok(rec)
    }

    async fn trigger_sync(&self, app: &str, req: SyncRequest) -> ApiResult<SyncReport> {
        let t0 = Instant::now();
        info!(app = %app, dry_run = req.dry_run, "api: sync start");
        let report = self.ctl.sync(app, req.dry_run).await.map_err(ApiError::from)?;
        info!(app = %app, code = %report.status.code(), summary = %report.summary, took_ms = %t0.elapsed().as_millis(), "api: sync ok");
        Ok(report)
    }

    async fn list_applications(&self, filter: ListFilter) -> ApiResult<Vec<AppSummary>> {
        let snap = self.ctl.registry().snapshot();
        let out: Vec<AppSummary> = snap.apps.values().filter(|r| filter.matches(r)).map(|r| AppSummary::from(r.as_ref())).collect();
        info!(count = out.len(), epoch = snap.epoch, "api: list ok");
        Ok(out)
    }

    async fn history(&self, app: &str, limit: Option<usize>) -> ApiResult<Vec<HistoryEntry>> {
        self.record(app)?;
        let t0 = Instant::now();
        let store = Arc::clone(self.ctl.history());
        let name = app.to_string();
        let rows = tokio::task::spawn_blocking(move || store.recent(&name, limit))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
        info!(app = %app, rows = rows.len(), took_ms = %t0.elapsed().as_millis(), "api: history ok");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Application, Destination, Source, SyncPolicy};
    use keel_kubehub::{LiveState, MemoryCluster};
    use keel_persist::MemoryHistory;
    use keel_store::Registry;
    use keel_sync::{ControllerConfig, LocalSource};

    fn app(name: &str, root: &std::path::Path, policy: SyncPolicy, team: &str) -> Application {
        Application {
            name: name.into(),
            source: Source { location: root.display().to_string(), revision: "HEAD".into(), path: "base".into(), overlays: vec![] },
            destination: Destination { endpoint: "mem://api".into(), namespace: name.into() },
            sync_policy: policy,
            tracked_kinds: vec![],
            labels: [("team".to_string(), team.to_string())].into_iter().collect(),
        }
    }

    fn api() -> InProcApi {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let root = std::env::temp_dir().join(format!("keel-api-{}", nanos));
        std::fs::create_dir_all(root.join("base")).unwrap();
        std::fs::write(root.join("base/cm.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: c }\ndata: { k: v }\n").unwrap();
        let registry = Arc::new(Registry::new());
        registry.register(app("web", &root, SyncPolicy::default(), "frontend")).unwrap();
        registry.register(app("billing", &root, SyncPolicy { locked: true, ..SyncPolicy::default() }, "payments")).unwrap();
        let live: Arc<dyn LiveState> = Arc::new(MemoryCluster::new());
        let mut cfg = ControllerConfig::default();
        cfg.qps = 0.0;
        let ctl = Controller::new(registry, live, Arc::new(LocalSource::new()), Arc::new(MemoryHistory::new()), cfg);
        InProcApi::new(ctl)
    }

    #[tokio::test]
    async fn errors_have_distinct_exit_codes() {
        let a = api();
        let missing = a.get_status("nope").await.unwrap_err();
        assert!(matches!(missing, ApiError::NotFound(_)));
        let locked = a.trigger_sync("billing", SyncRequest::default()).await.unwrap_err();
        assert!(matches!(locked, ApiError::PolicyViolation(_)));
        let codes: std::collections::BTreeSet<i32> = [
            missing,
            locked,
            ApiError::SyncInProgress("x".into()),
            ApiError::Validation("x".into()),
            ApiError::Internal("x".into()),
        ]
        .iter()
        .map(|e| e.exit_code())
        .collect();
        assert_eq!(codes.len(), 5);
    }

    #[tokio::test]
    async fn sync_then_history_and_status() {
        let a = api();
        let r = a.trigger_sync("web", SyncRequest { dry_run: false }).await.unwrap();
        assert_eq!(r.status.code(), SyncCode::Synced);
        assert_eq!(a.get_status("web").await.unwrap().code(), SyncCode::Synced);
        let h = a.history("web", Some(5)).await.unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].code, "Synced");
        assert!(matches!(a.history("nope", None).await, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_by_name_label_and_code() {
        let a = api();
        let all = a.list_applications(ListFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["billing", "web"]);

        let f = ListFilter::parse(Some("^w"), &[], None).unwrap();
        assert_eq!(a.list_applications(f).await.unwrap().len(), 1);
        let f = ListFilter::parse(None, &["team=payments".to_string()], None).unwrap();
        assert_eq!(a.list_applications(f).await.unwrap()[0].name, "billing");

        a.refresh("web").await.unwrap();
        let f = ListFilter::parse(None, &[], Some("outofsync")).unwrap();
        assert_eq!(a.list_applications(f).await.unwrap().iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["web"]);

        assert!(matches!(ListFilter::parse(Some("("), &[], None), Err(ApiError::Validation(_))));
        assert!(matches!(ListFilter::parse(None, &["team".to_string()], None), Err(ApiError::Validation(_))));
    }
}
