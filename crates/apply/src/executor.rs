//! Batched execution of a plan against a destination, and post-apply convergence checks.

use std::time::{Duration, Instant};

use futures::future::join_all;
use keel_core::{Destination, KeelError, ResourceDecl, ResourceOutcome, SyncCode};
use keel_kubehub::{ClusterError, LiveState, ObserveQuery};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diff::{plan, Action, Plan};
use crate::order::{batches, Phase};
use crate::throttle::Throttle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    /// Deadline for a single apply or delete.
    pub apply_timeout: Duration,
    /// Observations after apply before giving up on convergence.
    pub converge_checks: u32,
    pub converge_interval: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { apply_timeout: Duration::from_secs(30), converge_checks: 3, converge_interval: Duration::from_secs(2) }
    }
}

impl ExecConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            apply_timeout: std::env::var("KEEL_APPLY_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).map(Duration::from_secs).unwrap_or(d.apply_timeout),
            converge_checks: std::env::var("KEEL_CONVERGE_CHECKS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.converge_checks),
            converge_interval: std::env::var("KEEL_CONVERGE_INTERVAL_MS").ok().and_then(|s| s.parse().ok()).map(Duration::from_millis).unwrap_or(d.converge_interval),
        }
    }
}

/// What happened to a plan. `cancelled` means some actions were never started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub outcomes: Vec<ResourceOutcome>,
    pub cancelled: bool,
}

impl Execution {
    pub fn failed(&self) -> usize { self.outcomes.iter().filter(|o| o.code == SyncCode::Error).count() }
}

pub struct Executor<'a> {
    live: &'a dyn LiveState,
    throttle: &'a Throttle,
    cfg: &'a ExecConfig,
}

impl<'a> Executor<'a> {
    pub fn new(live: &'a dyn LiveState, throttle: &'a Throttle, cfg: &'a ExecConfig) -> Self { Self { live, throttle, cfg } }

    /// Run the plan batch by batch. Actions inside a batch run concurrently and a failure stays
    /// scoped to its resource. Cancellation is checked before each action; started actions
    /// always finish.
    pub async fn execute(&self, dest: &Destination, plan: &Plan, cancel: &CancellationToken) -> Execution {
        let t0 = Instant::now();
        let mut out = Execution::default();
        for batch in batches(plan.actions.clone()) {
            if cancel.is_cancelled() {
                out.cancelled = true;
                break;
            }
            debug!(tier = batch.tier, phase = ?batch.phase, actions = batch.actions.len(), "apply: batch");
            let results = join_all(batch.actions.iter().map(|a| self.run_one(dest, a, batch.phase, cancel))).await;
            for r in results {
                match r {
                    Some(o) => out.outcomes.push(o),
                    None => out.cancelled = true,
                }
            }
        }
        histogram!("sync_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(endpoint = %dest.endpoint, actions = out.outcomes.len(), failed = out.failed(), cancelled = out.cancelled, took_ms = %t0.elapsed().as_millis(), "apply: plan done");
        out
    }

    async fn run_one(&self, dest: &Destination, action: &Action, phase: Phase, cancel: &CancellationToken) -> Option<ResourceOutcome> {
        if cancel.is_cancelled() { return None; }
        self.throttle.acquire(&dest.endpoint).await;
        if cancel.is_cancelled() { return None; }
        let id = action.id().clone();
        let call = async {
            match (phase, &action.decl) {
                (Phase::Delete, _) => self.live.delete(dest, &id).await,
                (Phase::Apply, Some(decl)) => self.live.apply(dest, decl).await,
                (Phase::Apply, None) => Err(ClusterError::Rejected { id: id.clone(), message: "no declaration to apply".into() }),
            }
        };
        let res = match tokio::time::timeout(self.cfg.apply_timeout, call).await {
            Ok(r) => r.map_err(KeelError::from),
            Err(_) => Err(KeelError::ApplyFailure { resource: id.to_string(), message: format!("timed out after {}s", self.cfg.apply_timeout.as_secs_f64()) }),
        };
        let outcome = match res {
            Ok(()) => {
                counter!("apply_ok", 1u64);
                ResourceOutcome { id, action: action.kind(), code: SyncCode::Synced, message: None }
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(resource = %id, action = ?action.kind(), error = %e, "apply: action failed");
                ResourceOutcome { id, action: action.kind(), code: SyncCode::Error, message: Some(e.to_string()) }
            }
        };
        Some(outcome)
    }

    /// Re-observe until the live side matches `desired` or the checks run out. Deletes count
    /// only when `prune` is set, as in the plan.
    pub async fn verify(&self, dest: &Destination, query: &ObserveQuery, desired: &[ResourceDecl], prune: bool) -> bool {
        let checks = self.cfg.converge_checks.max(1);
        for i in 0..checks {
            if i > 0 { tokio::time::sleep(self.cfg.converge_interval).await; }
            self.throttle.acquire(&dest.endpoint).await;
            match self.live.observe(dest, query).await {
                Ok(live) => {
                    let remaining = plan(desired, &live, prune);
                    if !remaining.has_actions() {
                        debug!(endpoint = %dest.endpoint, check = i + 1, "apply: converged");
                        return true;
                    }
                    debug!(endpoint = %dest.endpoint, check = i + 1, pending = remaining.actions.len(), "apply: not converged yet");
                }
                Err(e) => warn!(endpoint = %dest.endpoint, check = i + 1, error = %e, "apply: convergence check failed"),
            }
        }
        counter!("sync_not_converged_total", 1u64);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{KindRef, ResourceId, TRACKING_LABEL};
    use keel_kubehub::MemoryCluster;
    use serde_json::json;

    fn dest() -> Destination { Destination { endpoint: "mem://exec".into(), namespace: "web".into() } }

    fn decl(kind: &str, api: &str, name: &str, body: serde_json::Value) -> ResourceDecl {
        let mut obj = json!({ "apiVersion": api, "kind": kind, "metadata": { "name": name, "namespace": "web" } });
        if let (Some(o), Some(b)) = (obj.as_object_mut(), body.as_object()) {
            for (k, v) in b { o.insert(k.clone(), v.clone()); }
        }
        let mut d = ResourceDecl::from_object(&obj, "test").unwrap();
        d.labels.insert(TRACKING_LABEL.into(), "web".into());
        d
    }

    fn desired() -> Vec<ResourceDecl> {
        vec![
            decl("ConfigMap", "v1", "cfg", json!({ "data": { "k": "v" } })),
            decl("Deployment", "apps/v1", "api", json!({ "spec": { "replicas": 2 } })),
        ]
    }

    fn query() -> ObserveQuery { ObserveQuery::tracked(vec![KindRef::new("v1", "ConfigMap"), KindRef::new("apps/v1", "Deployment")], "web") }

    fn fast() -> ExecConfig { ExecConfig { apply_timeout: Duration::from_millis(100), converge_checks: 2, converge_interval: Duration::from_millis(5) } }

    #[tokio::test]
    async fn applies_and_converges() {
        let c = MemoryCluster::new();
        let (t, cfg) = (Throttle::unlimited(), fast());
        let ex = Executor::new(&c, &t, &cfg);
        let p = plan(&desired(), &[], false);
        let run = ex.execute(&dest(), &p, &CancellationToken::new()).await;
        assert_eq!(run.outcomes.len(), 2);
        assert_eq!(run.failed(), 0);
        assert!(!run.cancelled);
        assert!(ex.verify(&dest(), &query(), &desired(), false).await);
        let live = c.observe(&dest(), &query()).await.unwrap();
        assert!(!plan(&desired(), &live, false).has_actions());
    }

    #[tokio::test]
    async fn failure_is_scoped_to_its_resource() {
        let c = MemoryCluster::new();
        c.reject(ResourceId::new("ConfigMap", Some("web"), "cfg"));
        let (t, cfg) = (Throttle::unlimited(), fast());
        let ex = Executor::new(&c, &t, &cfg);
        let run = ex.execute(&dest(), &plan(&desired(), &[], false), &CancellationToken::new()).await;
        assert_eq!(run.failed(), 1);
        let ok: Vec<&str> = run.outcomes.iter().filter(|o| o.code == SyncCode::Synced).map(|o| o.id.name.as_str()).collect();
        assert_eq!(ok, vec!["api"]);
        assert!(c.get(&dest(), &ResourceId::new("Deployment", Some("web"), "api")).is_some());
    }

    #[tokio::test]
    async fn slow_apply_times_out() {
        let c = MemoryCluster::new();
        c.set_apply_delay(Some(Duration::from_millis(500)));
        let (t, cfg) = (Throttle::unlimited(), fast());
        let ex = Executor::new(&c, &t, &cfg);
        let run = ex.execute(&dest(), &plan(&desired()[..1], &[], false), &CancellationToken::new()).await;
        assert_eq!(run.outcomes[0].code, SyncCode::Error);
        assert!(run.outcomes[0].message.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_plan_starts_nothing() {
        let c = MemoryCluster::new();
        let (t, cfg) = (Throttle::unlimited(), fast());
        let ex = Executor::new(&c, &t, &cfg);
        let token = CancellationToken::new();
        token.cancel();
        let run = ex.execute(&dest(), &plan(&desired(), &[], false), &token).await;
        assert!(run.cancelled);
        assert!(run.outcomes.is_empty());
        assert_eq!(c.apply_calls(), 0);
    }

    #[tokio::test]
    async fn stuck_resource_never_converges() {
        let c = MemoryCluster::new();
        c.stick(ResourceId::new("Deployment", Some("web"), "api"));
        let (t, cfg) = (Throttle::unlimited(), fast());
        let ex = Executor::new(&c, &t, &cfg);
        let run = ex.execute(&dest(), &plan(&desired(), &[], false), &CancellationToken::new()).await;
        assert_eq!(run.failed(), 0);
        assert!(!ex.verify(&dest(), &query(), &desired(), false).await);
    }
}
