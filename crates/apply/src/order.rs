//! Dependency ordering: group actions into per-tier batches.

use keel_core::{apply_tier, DiffAction};

use crate::diff::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Apply,
    Delete,
}

/// Actions of one tier; they share no ordering constraint and run concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub tier: u8,
    pub phase: Phase,
    pub actions: Vec<Action>,
}

fn sort_key(a: &Action) -> (u8, Option<String>, String, String) {
    let id = a.id();
    (apply_tier(&id.kind), id.namespace.clone(), id.name.clone(), id.kind.clone())
}

/// Creates and updates in ascending tier order, then deletes in descending tier order. Ties
/// break on namespace, name, then kind.
pub fn batches(actions: Vec<Action>) -> Vec<Batch> {
    let (mut deletes, mut applies): (Vec<Action>, Vec<Action>) = actions.into_iter().partition(|a| a.kind() == DiffAction::Delete);
    applies.sort_by_key(sort_key);
    deletes.sort_by(|a, b| {
        let (ta, na, ma, ka) = sort_key(a);
        let (tb, nb, mb, kb) = sort_key(b);
        tb.cmp(&ta).then(na.cmp(&nb)).then(ma.cmp(&mb)).then(ka.cmp(&kb))
    });
    let mut out: Vec<Batch> = Vec::new();
    for (phase, list) in [(Phase::Apply, applies), (Phase::Delete, deletes)] {
        for a in list {
            let tier = apply_tier(&a.id().kind);
            match out.last_mut() {
                Some(b) if b.tier == tier && b.phase == phase => b.actions.push(a),
                _ => out.push(Batch { tier, phase, actions: vec![a] }),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ResourceDiff, ResourceId};

    fn act(kind: &str, ns: Option<&str>, name: &str, action: DiffAction) -> Action {
        Action { diff: ResourceDiff { id: ResourceId::new(kind, ns, name), action, fields: vec![] }, decl: None }
    }

    fn names(b: &Batch) -> Vec<String> { b.actions.iter().map(|a| format!("{}/{}", a.id().kind, a.id().name)).collect() }

    #[test]
    fn prerequisites_come_first() {
        let plan = vec![
            act("Deployment", Some("web"), "api", DiffAction::Create),
            act("Widget", Some("web"), "w", DiffAction::Create),
            act("ConfigMap", Some("web"), "cfg", DiffAction::Update),
            act("Namespace", None, "web", DiffAction::Create),
            act("Service", Some("web"), "api", DiffAction::Create),
            act("ServiceAccount", Some("web"), "runner", DiffAction::Create),
            act("CustomResourceDefinition", None, "widgets.example.io", DiffAction::Create),
        ];
        let order: Vec<String> = batches(plan).iter().flat_map(names).collect();
        assert_eq!(
            order,
            vec![
                "Namespace/web",
                "CustomResourceDefinition/widgets.example.io",
                "ServiceAccount/runner",
                "ConfigMap/cfg",
                "Service/api",
                "Deployment/api",
                "Widget/w",
            ]
        );
    }

    #[test]
    fn same_tier_shares_a_batch_sorted_by_namespace_then_name() {
        let plan = vec![
            act("Secret", Some("b"), "a", DiffAction::Create),
            act("ConfigMap", Some("a"), "z", DiffAction::Create),
            act("ConfigMap", Some("a"), "m", DiffAction::Create),
        ];
        let bs = batches(plan);
        assert_eq!(bs.len(), 1);
        assert_eq!(names(&bs[0]), vec!["ConfigMap/m", "ConfigMap/z", "Secret/a"]);
    }

    #[test]
    fn same_name_across_kinds_orders_by_kind_regardless_of_input() {
        let forward = vec![
            act("Secret", Some("web"), "app", DiffAction::Create),
            act("ConfigMap", Some("web"), "app", DiffAction::Create),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();
        let a: Vec<String> = batches(forward).iter().flat_map(names).collect();
        let b: Vec<String> = batches(reversed).iter().flat_map(names).collect();
        assert_eq!(a, vec!["ConfigMap/app", "Secret/app"]);
        assert_eq!(a, b);
    }

    #[test]
    fn deletes_run_last_in_reverse_tier_order() {
        let plan = vec![
            act("Namespace", None, "old", DiffAction::Delete),
            act("Deployment", Some("web"), "old", DiffAction::Delete),
            act("ConfigMap", Some("web"), "new", DiffAction::Create),
            act("ConfigMap", Some("web"), "stale", DiffAction::Delete),
        ];
        let bs = batches(plan);
        let phases: Vec<(Phase, u8)> = bs.iter().map(|b| (b.phase, b.tier)).collect();
        assert_eq!(phases, vec![(Phase::Apply, 4), (Phase::Delete, 7), (Phase::Delete, 4), (Phase::Delete, 0)]);
    }
}
