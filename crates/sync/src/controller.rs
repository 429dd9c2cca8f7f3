//! The reconciliation controller: one worker per application, a bounded pool of concurrent
//! passes, and a per-application lock shared by manual and automated syncs.
//!
//! A pass renders desired state, observes the destination (retrying transient failures with
//! capped backoff), diffs, and, when the pass is a sync, applies the plan in dependency order
//! and checks convergence before recording status and history.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use keel_apply::{plan, qualify_namespaces, DiffSummary, ExecConfig, Executor, SyncPhase, Throttle};
use keel_core::{now_ts, Application, KeelError, KindRef, ResourceDecl, ResourceId, SyncStatus, TRACKING_LABEL};
use keel_kubehub::{LiveState, ObserveQuery};
use keel_persist::{maybe_compress, HistoryEntry, HistoryStore};
use keel_store::Registry;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::policy::{attempts, backoff, decide, Decision, Trigger};
use crate::source::{poll_interval, Resolved, SourceResolver};
use crate::trigger::TriggerQueue;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Concurrent passes across all applications.
    pub workers: usize,
    pub resync: Duration,
    pub source_poll: Duration,
    pub queue_cap: usize,
    /// Per-endpoint client rate; `<= 0` disables throttling.
    pub qps: f64,
    pub burst: u32,
    pub exec: ExecConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync: Duration::from_secs(180),
            source_poll: Duration::from_secs(30),
            queue_cap: 64,
            qps: 20.0,
            burst: 40,
            exec: ExecConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: std::env::var("KEEL_WORKERS").ok().and_then(|s| s.parse().ok()).filter(|n: &usize| *n > 0).unwrap_or(d.workers),
            resync: std::env::var("KEEL_RESYNC_SECS").ok().and_then(|s| s.parse().ok()).filter(|n: &u64| *n > 0).map(Duration::from_secs).unwrap_or(d.resync),
            source_poll: poll_interval(),
            queue_cap: std::env::var("KEEL_TRIGGER_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.queue_cap),
            qps: std::env::var("KEEL_QPS").ok().and_then(|s| s.parse::<f64>().ok()).filter(|q| q.is_finite() && *q >= 0.0).unwrap_or(d.qps),
            burst: std::env::var("KEEL_BURST").ok().and_then(|s| s.parse().ok()).unwrap_or(d.burst),
            exec: ExecConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("application {0} not found")]
    NotFound(String),
    #[error("application {0} already has a sync in progress")]
    InProgress(String),
    #[error("application {0} is locked; manual sync rejected")]
    Locked(String),
    /// Rendering failed; the previous status is kept and the error recorded beside it.
    #[error(transparent)]
    Config(KeelError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of one pass, as returned to a manual caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub app: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    pub dry_run: bool,
    pub summary: DiffSummary,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassKind {
    Refresh,
    Sync { manual: bool, dry_run: bool },
}

/// The in-flight sync of one application. `revision` is unset while the pass is still
/// rendering; a source change seen in that window is kept in `seen` and settled once the
/// rendered revision is known.
struct Running {
    revision: Option<String>,
    seen: Option<String>,
    cancel: CancellationToken,
}

/// Clears [`AppState::running`] when the pass ends, whichever way it ends.
struct RunningSlot<'a>(&'a AppState);

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) { *guard(&self.0.running) = None; }
}

/// Everything the controller keeps per application between passes. None of it is an
/// authoritative copy of the cluster.
struct AppState {
    lock: tokio::sync::Mutex<()>,
    queue: TriggerQueue,
    phase: Mutex<SyncPhase>,
    running: Mutex<Option<Running>>,
    last_revision: Mutex<Option<String>>,
    known_kinds: Mutex<BTreeSet<KindRef>>,
    watched: Mutex<BTreeSet<KindRef>>,
    drift_tx: Mutex<Option<mpsc::Sender<ResourceId>>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

impl AppState {
    fn new(phase: SyncPhase, queue_cap: usize) -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            queue: TriggerQueue::new(queue_cap),
            phase: Mutex::new(phase),
            running: Mutex::new(None),
            last_revision: Mutex::new(None),
            known_kinds: Mutex::new(BTreeSet::new()),
            watched: Mutex::new(BTreeSet::new()),
            drift_tx: Mutex::new(None),
        }
    }

    /// Kinds to observe: everything desired now, everything desired before (so pruning still
    /// sees kinds that were dropped entirely) and the explicitly tracked ones.
    fn remember_kinds(&self, desired: &[ResourceDecl], tracked: &[KindRef]) -> Vec<KindRef> {
        let mut known = guard(&self.known_kinds);
        known.extend(desired.iter().map(|d| KindRef::new(d.api_version.clone(), d.kind())));
        known.extend(tracked.iter().cloned());
        known.iter().cloned().collect()
    }
}

struct Inner {
    registry: Arc<Registry>,
    live: Arc<dyn LiveState>,
    sources: Arc<dyn SourceResolver>,
    history: Arc<dyn HistoryStore>,
    cfg: ControllerConfig,
    throttle: Throttle,
    permits: Semaphore,
    apps: Mutex<FxHashMap<String, Arc<AppState>>>,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        registry: Arc<Registry>,
        live: Arc<dyn LiveState>,
        sources: Arc<dyn SourceResolver>,
        history: Arc<dyn HistoryStore>,
        cfg: ControllerConfig,
    ) -> Self {
        let throttle = Throttle::new(cfg.qps, cfg.burst);
        let permits = Semaphore::new(cfg.workers.max(1));
        Self { inner: Arc::new(Inner { registry, live, sources, history, cfg, throttle, permits, apps: Mutex::new(FxHashMap::default()) }) }
    }

    pub fn registry(&self) -> &Arc<Registry> { &self.inner.registry }

    pub fn history(&self) -> &Arc<dyn HistoryStore> { &self.inner.history }

    /// Manual sync. Rejected on a locked application (dry runs excepted) and while another
    /// sync of the same application holds its lock.
    pub async fn sync(&self, name: &str, dry_run: bool) -> Result<SyncReport, SyncError> {
        let rec = self.inner.registry.get(name).map_err(|_| SyncError::NotFound(name.to_string()))?;
        if rec.app.sync_policy.locked && !dry_run {
            counter!("sync_rejected_locked_total", 1u64);
            return Err(SyncError::Locked(name.to_string()));
        }
        let st = self.inner.state(name)?;
        let _held = st.lock.try_lock().map_err(|_| SyncError::InProgress(name.to_string()))?;
        self.inner.pass(name, &st, PassKind::Sync { manual: true, dry_run }).await
    }

    /// Compare now and record status; applies nothing.
    pub async fn refresh(&self, name: &str) -> Result<SyncReport, SyncError> {
        let st = self.inner.state(name)?;
        let _held = st.lock.lock().await;
        self.inner.pass(name, &st, PassKind::Refresh).await
    }

    /// Queue a trigger for the application's worker. A source change to a revision other than
    /// the one being applied cancels the in-flight pass; the newer pass runs next.
    pub fn notify(&self, name: &str, t: Trigger) -> Result<(), SyncError> {
        let st = self.inner.state(name)?;
        self.inner.enqueue(name, &st, t);
        Ok(())
    }

    /// Run workers for every registered application, and the source poller, until `shutdown`.
    /// Applications registered later get a worker as they appear.
    pub async fn run(&self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        let mut started: BTreeSet<String> = BTreeSet::new();
        let mut epochs = self.inner.registry.subscribe();
        let mut poll = tokio::time::interval(self.inner.cfg.source_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        info!(apps = self.inner.registry.names().len(), workers = self.inner.cfg.workers, resync_s = self.inner.cfg.resync.as_secs(), "controller: started");
        loop {
            let names = self.inner.registry.names();
            started.retain(|n| names.contains(n));
            for name in names {
                if !started.insert(name.clone()) { continue; }
                let st = match self.inner.state(&name) {
                    Ok(st) => st,
                    Err(_) => continue,
                };
                tracker.spawn(Arc::clone(&self.inner).worker(name, st, shutdown.clone()));
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = epochs.changed() => if changed.is_err() { break },
                _ = poll.tick() => self.inner.poll_sources().await,
            }
        }
        tracker.close();
        tracker.wait().await;
        info!("controller: stopped");
    }
}

impl Inner {
    fn state(&self, name: &str) -> Result<Arc<AppState>, SyncError> {
        let rec = self.registry.get(name).map_err(|_| SyncError::NotFound(name.to_string()))?;
        let mut apps = guard(&self.apps);
        let st = apps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AppState::new(SyncPhase::from_code(rec.code()), self.cfg.queue_cap)));
        Ok(Arc::clone(st))
    }

    fn forget(&self, name: &str, st: &Arc<AppState>) {
        let mut apps = guard(&self.apps);
        if apps.get(name).map(|cur| Arc::ptr_eq(cur, st)).unwrap_or(false) { apps.remove(name); }
    }

    fn enqueue(&self, name: &str, st: &AppState, t: Trigger) {
        if let Trigger::SourceChange(rev) = &t {
            if let Some(r) = guard(&st.running).as_mut() {
                match &r.revision {
                    Some(cur) if cur != rev && !r.cancel.is_cancelled() => {
                        info!(app = %name, from = %cur, to = %rev, "sync: superseding in-flight pass");
                        counter!("sync_superseded_total", 1u64);
                        r.cancel.cancel();
                    }
                    Some(_) => {}
                    None => r.seen = Some(rev.clone()),
                }
            }
        }
        st.queue.push(t);
    }

    fn advance(&self, name: &str, st: &AppState, to: SyncPhase) {
        let mut phase = guard(&st.phase);
        match phase.transition(to) {
            Ok(next) => *phase = next,
            Err(e) => {
                counter!("sync_illegal_transition_total", 1u64);
                warn!(app = %name, error = %e, "sync: transition rejected");
            }
        }
    }

    async fn worker(self: Arc<Self>, name: String, st: Arc<AppState>, shutdown: CancellationToken) {
        let (tx, mut drift_rx) = mpsc::channel::<ResourceId>(256);
        *guard(&st.drift_tx) = Some(tx);
        let mut tick = tokio::time::interval(self.cfg.resync);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(app = %name, "sync: worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => st.queue.push(Trigger::Interval),
                Some(id) = drift_rx.recv() => {
                    debug!(app = %name, resource = %id, "sync: live change");
                    st.queue.push(Trigger::Drift(id));
                }
                _ = st.queue.notified() => {}
            }
            let triggers = st.queue.drain();
            if triggers.is_empty() { continue; }
            let rec = match self.registry.get(&name) {
                Ok(r) => r,
                Err(_) => {
                    info!(app = %name, "sync: application deregistered; worker exits");
                    break;
                }
            };
            let kind = match decide(&rec.app.sync_policy, &triggers) {
                Decision::Skip => continue,
                Decision::Refresh => PassKind::Refresh,
                Decision::Sync => PassKind::Sync { manual: false, dry_run: false },
            };
            // automated passes queue behind a manual sync
            let _held = st.lock.lock().await;
            if let Err(e) = self.pass(&name, &st, kind).await {
                warn!(app = %name, error = %e, "sync: pass failed");
            }
        }
        *guard(&st.drift_tx) = None;
        guard(&st.watched).clear();
        self.forget(&name, &st);
    }

    async fn poll_sources(&self) {
        for name in self.registry.names() {
            let Ok(rec) = self.registry.get(&name) else { continue };
            let Some(st) = guard(&self.apps).get(&name).cloned() else { continue };
            let last = guard(&st.last_revision).clone();
            let Some(last) = last else { continue };
            match self.resolve(&rec.app).await {
                Ok(r) if r.revision != last => {
                    info!(app = %name, from = %last, to = %r.revision, "sync: source changed");
                    self.enqueue(&name, &st, Trigger::SourceChange(r.revision));
                }
                Ok(_) => {}
                Err(e) => debug!(app = %name, error = %e, "sync: source poll failed"),
            }
        }
    }

    async fn resolve(&self, app: &Application) -> Result<Resolved, SyncError> {
        let sources = Arc::clone(&self.sources);
        let app = app.clone();
        match tokio::task::spawn_blocking(move || sources.resolve(&app)).await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(SyncError::Config(e)),
            Err(e) => Err(SyncError::Internal(format!("render task: {}", e))),
        }
    }

    /// `Ok(None)` when `cancel` fired while waiting to retry.
    async fn observe(&self, app: &Application, query: &ObserveQuery, cancel: &CancellationToken) -> Result<Option<Vec<ResourceDecl>>, KeelError> {
        let total = attempts(&app.sync_policy);
        let mut failed = 0u32;
        loop {
            self.throttle.acquire(&app.destination.endpoint).await;
            let err = match self.live.observe(&app.destination, query).await {
                Ok(v) => return Ok(Some(v)),
                Err(e) => KeelError::from(e),
            };
            failed += 1;
            if !err.is_retryable() || failed >= total {
                warn!(app = %app.name, attempts = failed, error = %err, "sync: observe gave up");
                return Err(err);
            }
            let delay = backoff(&app.sync_policy, failed - 1);
            counter!("observe_retry_total", 1u64);
            warn!(app = %app.name, attempt = failed, of = total, delay_ms = %delay.as_millis(), error = %err, "sync: observe failed; retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Report for a pass abandoned before applying anything; the recorded status stays.
    fn superseded(&self, name: &str, dry_run: bool) -> SyncReport {
        counter!("sync_passes_total", 1u64);
        info!(app = %name, "sync: pass superseded before apply");
        let status = self.registry.get(name).map(|r| r.status.sync).unwrap_or_else(|_| SyncStatus::unknown());
        SyncReport { app: name.to_string(), op_id: None, dry_run, summary: DiffSummary::default(), status }
    }

    async fn ensure_watch(&self, app: &Application, st: &AppState, kinds: &[KindRef]) {
        let Some(tx) = guard(&st.drift_tx).clone() else { return };
        let fresh: Vec<KindRef> = {
            let mut watched = guard(&st.watched);
            kinds.iter().filter(|k| watched.insert((*k).clone())).cloned().collect()
        };
        if fresh.is_empty() { return; }
        let query = ObserveQuery::tracked(fresh.clone(), &app.name);
        if let Err(e) = self.live.watch(&app.destination, &query, tx).await {
            warn!(app = %app.name, error = %e, "sync: watch failed; retrying next pass");
            let mut watched = guard(&st.watched);
            for k in &fresh { watched.remove(k); }
        }
    }

    fn write_status(&self, name: &str, status: SyncStatus) {
        if let Err(e) = self.registry.update_status(name, status) { debug!(app = %name, error = %e, "sync: status not written"); }
    }

    async fn pass(&self, name: &str, st: &AppState, kind: PassKind) -> Result<SyncReport, SyncError> {
        let t0 = Instant::now();
        let _permit = self.permits.acquire().await.map_err(|_| SyncError::Internal("worker pool closed".into()))?;
        let app = self.registry.get(name).map_err(|_| SyncError::NotFound(name.to_string()))?.app;
        let (manual, dry_run) = match kind {
            PassKind::Refresh => (false, false),
            PassKind::Sync { manual, dry_run } => (manual, dry_run),
        };

        // only real syncs can be superseded; refreshes and dry runs never apply
        let cancel = CancellationToken::new();
        let applies = matches!(kind, PassKind::Sync { dry_run: false, .. });
        let _slot = applies.then(|| {
            *guard(&st.running) = Some(Running { revision: None, seen: None, cancel: cancel.clone() });
            RunningSlot(st)
        });

        let resolved = match self.resolve(&app).await {
            Ok(r) => r,
            Err(SyncError::Config(e)) => {
                counter!("render_err", 1u64);
                warn!(app = %name, error = %e, "sync: render failed; keeping previous status");
                if let Err(re) = self.registry.record_error(name, &e) { debug!(app = %name, error = %re, "sync: error not recorded"); }
                return Err(SyncError::Config(e));
            }
            Err(e) => return Err(e),
        };
        if let Some(r) = guard(&st.running).as_mut() {
            if r.seen.as_ref().is_some_and(|s| s != &resolved.revision) {
                info!(app = %name, rendered = %resolved.revision, "sync: source moved on during render");
                counter!("sync_superseded_total", 1u64);
                r.cancel.cancel();
            }
            r.revision = Some(resolved.revision.clone());
        }
        *guard(&st.last_revision) = Some(resolved.revision.clone());
        let revision = Some(resolved.revision.clone());
        let mut desired = resolved.rendered.resources().to_vec();
        for d in &mut desired { d.labels.insert(TRACKING_LABEL.to_string(), app.name.clone()); }
        qualify_namespaces(&mut desired, &app.destination.namespace);
        let kinds = st.remember_kinds(&desired, &app.tracked_kinds);
        self.ensure_watch(&app, st, &kinds).await;
        let query = ObserveQuery::tracked(kinds, &app.name);

        let live = match self.observe(&app, &query, &cancel).await {
            Ok(Some(l)) => l,
            Ok(None) => return Ok(self.superseded(name, dry_run)),
            Err(e) => {
                let status = SyncStatus::from_error(revision, &e);
                self.advance(name, st, SyncPhase::Error);
                self.write_status(name, status.clone());
                if let Err(re) = self.registry.record_error(name, &e) { debug!(app = %name, error = %re, "sync: error not recorded"); }
                counter!("sync_passes_total", 1u64);
                return Ok(SyncReport { app: name.to_string(), op_id: None, dry_run, summary: DiffSummary::default(), status });
            }
        };

        let plan = plan(&desired, &live, app.sync_policy.prune);
        let summary = plan.summary();
        let compared = SyncStatus::from_diffs(revision.clone(), plan.diffs());
        self.advance(name, st, SyncPhase::from_code(compared.code()));
        if kind == PassKind::Refresh || dry_run || !plan.has_actions() || cancel.is_cancelled() {
            self.write_status(name, compared.clone());
            debug!(app = %name, code = %compared.code(), summary = %summary, dry_run, took_ms = %t0.elapsed().as_millis(), "sync: compared");
            return Ok(SyncReport { app: name.to_string(), op_id: None, dry_run, summary, status: compared });
        }

        let op = self.registry.begin_operation(name, manual, false).map_err(|_| SyncError::InProgress(name.to_string()))?;
        self.advance(name, st, SyncPhase::Syncing);
        let exec = Executor::new(self.live.as_ref(), &self.throttle, &self.cfg.exec);
        let run = exec.execute(&app.destination, &plan, &cancel).await;
        let status = if run.cancelled {
            // superseded: still out of sync, the newer pass takes over
            SyncStatus::from_diffs(revision, plan.diffs())
        } else {
            let converged = run.failed() == 0 && exec.verify(&app.destination, &query, &desired, app.sync_policy.prune).await;
            SyncStatus::from_outcomes(revision, plan.diffs(), run.outcomes.clone(), converged)
        };
        self.advance(name, st, SyncPhase::from_code(status.code()));
        self.write_status(name, status.clone());
        if let Err(e) = self.registry.end_operation(name, &op.id) { debug!(app = %name, op = %op.id, error = %e, "sync: operation marker not cleared"); }

        let entry = HistoryEntry {
            app: name.to_string(),
            op_id: op.id.clone(),
            revision: status.revision().map(|s| s.to_string()),
            code: status.code().to_string(),
            ts: now_ts(),
            actions: u32::try_from(run.outcomes.len()).unwrap_or(u32::MAX),
            message: status.message().map(|s| s.to_string()),
            manifest: maybe_compress(&resolved.rendered.to_yaml()),
        };
        if let Err(e) = self.history.append(entry) { warn!(app = %name, error = %e, "sync: history write failed"); }

        counter!("sync_passes_total", 1u64);
        histogram!("sync_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(app = %name, op = %op.id, code = %status.code(), summary = %summary, manual, took_ms = %t0.elapsed().as_millis(), "sync: pass ok");
        Ok(SyncReport { app: name.to_string(), op_id: Some(op.id), dry_run: false, summary, status })
    }
}
