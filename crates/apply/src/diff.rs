//! Field-level diff of desired against live, and the action plan derived from it.
//!
//! Comparison is desired-subset: every field a declaration sets must match live, while fields
//! only present on live (server defaults, status, controller-owned metadata) are not drift.

use std::collections::BTreeMap;

use keel_core::{is_cluster_scoped, is_passthrough, DiffAction, FieldChange, ResourceDecl, ResourceDiff, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Stand-in for values of passthrough kinds in diffs and logs.
pub const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds + self.updates + self.removes == 0 }
}

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{} ~{} -{}", self.adds, self.updates, self.removes)
    }
}

/// Count creates, updates and deletes. `Ignored` entries are not counted.
pub fn diff_summary(diffs: &[ResourceDiff]) -> DiffSummary {
    let mut s = DiffSummary::default();
    for d in diffs {
        match d.action {
            DiffAction::Create => s.adds += 1,
            DiffAction::Update => s.updates += 1,
            DiffAction::Delete => s.removes += 1,
            DiffAction::Ignored => {}
        }
    }
    s
}

fn escape(seg: &str) -> String { seg.replace('~', "~0").replace('/', "~1") }

fn is_empty_collection(v: &Json) -> bool {
    match v {
        Json::Object(m) => m.is_empty(),
        Json::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// True when `live` satisfies everything `desired` sets.
fn covers(desired: &Json, live: &Json) -> bool {
    match (desired, live) {
        (Json::Null, _) => true,
        (Json::Object(d), Json::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => covers(dv, lv),
            None => dv.is_null() || is_empty_collection(dv),
        }),
        (Json::Array(d), Json::Array(l)) => d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| covers(dv, lv)),
        // 3 and 3.0 are the same quantity once a server has round-tripped it
        (Json::Number(a), Json::Number(b)) => a == b || a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

fn walk(path: &mut String, desired: &Json, live: Option<&Json>, out: &mut Vec<FieldChange>) {
    match (desired, live) {
        (Json::Null, _) => {}
        (d, None) if is_empty_collection(d) => {}
        (d, None) => out.push(FieldChange { path: path.clone(), desired: Some(d.clone()), live: None }),
        (Json::Object(dm), Some(Json::Object(lm))) => {
            for (k, dv) in dm {
                let len = path.len();
                path.push('/');
                path.push_str(&escape(k));
                walk(path, dv, lm.get(k), out);
                path.truncate(len);
            }
        }
        // lists are compared whole: positions carry meaning and there is no stable key here
        (d, Some(l)) => {
            if !covers(d, l) { out.push(FieldChange { path: path.clone(), desired: Some(d.clone()), live: Some(l.clone()) }); }
        }
    }
}

/// Fields of `desired` whose live value differs or is missing, as JSON pointers into the full
/// object. Values of passthrough kinds are redacted.
pub fn field_changes(desired: &ResourceDecl, live: &ResourceDecl) -> Vec<FieldChange> {
    let mut out = Vec::new();
    walk(&mut String::new(), &desired.to_object(), Some(&live.to_object()), &mut out);
    out.sort_by(|a, b| a.path.cmp(&b.path));
    if is_passthrough(desired.kind()) {
        let hidden = Json::String(REDACTED.to_string());
        for c in &mut out {
            if c.desired.is_some() { c.desired = Some(hidden.clone()); }
            if c.live.is_some() { c.live = Some(hidden.clone()); }
        }
    }
    out
}

/// Give namespaced declarations without a namespace the destination's.
pub fn qualify_namespaces(decls: &mut [ResourceDecl], namespace: &str) {
    for d in decls.iter_mut() {
        if d.id.namespace.is_none() && !is_cluster_scoped(&d.id.kind) { d.id.namespace = Some(namespace.to_string()); }
    }
}

/// One resource-level step of a sync. `decl` is the desired declaration for creates and
/// updates, `None` for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub diff: ResourceDiff,
    pub decl: Option<ResourceDecl>,
}

impl Action {
    pub fn id(&self) -> &ResourceId { &self.diff.id }
    pub fn kind(&self) -> DiffAction { self.diff.action }
}

/// The comparison of one desired set against one live snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
    /// Live-only resources left alone because pruning is off.
    pub ignored: Vec<ResourceDiff>,
}

impl Plan {
    pub fn has_actions(&self) -> bool { !self.actions.is_empty() }

    /// Every diff, actionable or not, sorted by identity.
    pub fn diffs(&self) -> Vec<ResourceDiff> {
        let mut all: Vec<ResourceDiff> = self.actions.iter().map(|a| a.diff.clone()).chain(self.ignored.iter().cloned()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn summary(&self) -> DiffSummary { diff_summary(&self.diffs()) }
}

/// Compare desired with live. Without `prune`, live-only resources become `Ignored` and no
/// `Delete` is ever produced.
pub fn plan(desired: &[ResourceDecl], live: &[ResourceDecl], prune: bool) -> Plan {
    let live_by_id: BTreeMap<&ResourceId, &ResourceDecl> = live.iter().map(|d| (&d.id, d)).collect();
    let mut out = Plan::default();
    for d in desired {
        match live_by_id.get(&d.id) {
            None => out.actions.push(Action {
                diff: ResourceDiff { id: d.id.clone(), action: DiffAction::Create, fields: Vec::new() },
                decl: Some(d.clone()),
            }),
            Some(l) => {
                let fields = field_changes(d, l);
                if !fields.is_empty() {
                    out.actions.push(Action { diff: ResourceDiff { id: d.id.clone(), action: DiffAction::Update, fields }, decl: Some(d.clone()) });
                }
            }
        }
    }
    let desired_ids: std::collections::BTreeSet<&ResourceId> = desired.iter().map(|d| &d.id).collect();
    for l in live.iter().filter(|l| !desired_ids.contains(&l.id)) {
        let action = if prune { DiffAction::Delete } else { DiffAction::Ignored };
        let diff = ResourceDiff { id: l.id.clone(), action, fields: Vec::new() };
        if prune { out.actions.push(Action { diff, decl: None }); } else { out.ignored.push(diff); }
    }
    out
}
