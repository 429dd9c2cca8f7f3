//! Sync status: always derived from a diff or from apply outcomes, never assembled by hand.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::KeelError;
use crate::now_ts;
use crate::resource::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncCode {
    Synced,
    OutOfSync,
    Unknown,
    Degraded,
    Error,
}

impl SyncCode {
    /// Ordering used to pick the worst outcome: `Error` dominates `Degraded` dominates `Synced`.
    pub fn severity(self) -> u8 {
        match self {
            SyncCode::Synced => 0,
            SyncCode::OutOfSync => 1,
            SyncCode::Unknown => 2,
            SyncCode::Degraded => 3,
            SyncCode::Error => 4,
        }
    }

    pub fn worst(self, other: SyncCode) -> SyncCode {
        if other.severity() > self.severity() { other } else { self }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncCode::Synced => "Synced",
            SyncCode::OutOfSync => "OutOfSync",
            SyncCode::Unknown => "Unknown",
            SyncCode::Degraded => "Degraded",
            SyncCode::Error => "Error",
        }
    }
}

impl std::fmt::Display for SyncCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for SyncCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "synced" => Ok(SyncCode::Synced),
            "outofsync" => Ok(SyncCode::OutOfSync),
            "unknown" => Ok(SyncCode::Unknown),
            "degraded" => Ok(SyncCode::Degraded),
            "error" => Ok(SyncCode::Error),
            _ => Err(format!("unknown sync code: {}", s)),
        }
    }
}

/// What the reconciler wants to do with one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffAction {
    Create,
    Update,
    Delete,
    /// Live-only resource left alone because pruning is disabled.
    Ignored,
}

/// A single field-level mismatch. `path` is a JSON pointer into the full object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDiff {
    pub id: ResourceId,
    pub action: DiffAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldChange>,
}

/// Result of applying one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub id: ResourceId,
    pub action: DiffAction,
    pub code: SyncCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    code: SyncCode,
    observed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    diffs: Vec<ResourceDiff>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outcomes: Vec<ResourceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl SyncStatus {
    /// Status before anything was compared.
    pub fn unknown() -> Self {
        Self { code: SyncCode::Unknown, observed_at: now_ts(), revision: None, diffs: Vec::new(), outcomes: Vec::new(), message: None }
    }

    /// Status of a comparison: `Synced` when no diff needs an action, `OutOfSync` otherwise.
    /// `Ignored` entries are reported but do not make the application out of sync.
    pub fn from_diffs(revision: Option<String>, diffs: Vec<ResourceDiff>) -> Self {
        let actionable = diffs.iter().any(|d| d.action != DiffAction::Ignored);
        let code = if actionable { SyncCode::OutOfSync } else { SyncCode::Synced };
        Self { code, observed_at: now_ts(), revision, diffs, outcomes: Vec::new(), message: None }
    }

    /// Status after a sync: the worst per-resource outcome. A pass whose post-apply observation
    /// never confirmed convergence is at best `Degraded`.
    pub fn from_outcomes(revision: Option<String>, diffs: Vec<ResourceDiff>, outcomes: Vec<ResourceOutcome>, converged: bool) -> Self {
        let mut code = outcomes.iter().fold(SyncCode::Synced, |acc, o| acc.worst(o.code));
        if !converged { code = code.worst(SyncCode::Degraded); }
        let failed = outcomes.iter().filter(|o| o.code == SyncCode::Error).count();
        let message = match (failed, converged) {
            (0, true) => None,
            (0, false) => Some("live state did not converge after apply".to_string()),
            (n, _) => Some(format!("{} of {} actions failed", n, outcomes.len())),
        };
        Self { code, observed_at: now_ts(), revision, diffs, outcomes, message }
    }

    /// Status of a pass that failed as a whole (unreachable after retries, forbidden).
    pub fn from_error(revision: Option<String>, err: &KeelError) -> Self {
        Self { code: SyncCode::Error, observed_at: now_ts(), revision, diffs: Vec::new(), outcomes: Vec::new(), message: Some(err.to_string()) }
    }

    pub fn code(&self) -> SyncCode { self.code }
    pub fn observed_at(&self) -> i64 { self.observed_at }
    pub fn revision(&self) -> Option<&str> { self.revision.as_deref() }
    pub fn diffs(&self) -> &[ResourceDiff] { &self.diffs }
    pub fn outcomes(&self) -> &[ResourceOutcome] { &self.outcomes }
    pub fn message(&self) -> Option<&str> { self.message.as_deref() }
}

impl Default for SyncStatus {
    fn default() -> Self { Self::unknown() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, code: SyncCode) -> ResourceOutcome {
        ResourceOutcome { id: ResourceId::new("ConfigMap", Some("ns"), name), action: DiffAction::Update, code, message: None }
    }

    #[test]
    fn worst_outcome_wins() {
        let s = SyncStatus::from_outcomes(None, vec![], vec![outcome("a", SyncCode::Synced), outcome("b", SyncCode::Error), outcome("c", SyncCode::Degraded)], true);
        assert_eq!(s.code(), SyncCode::Error);
        assert_eq!(s.message(), Some("1 of 3 actions failed"));
        let s = SyncStatus::from_outcomes(None, vec![], vec![outcome("a", SyncCode::Synced), outcome("c", SyncCode::Degraded)], true);
        assert_eq!(s.code(), SyncCode::Degraded);
    }

    #[test]
    fn non_convergence_degrades() {
        let s = SyncStatus::from_outcomes(Some("r1".into()), vec![], vec![outcome("a", SyncCode::Synced)], false);
        assert_eq!(s.code(), SyncCode::Degraded);
        assert_eq!(s.revision(), Some("r1"));
    }

    #[test]
    fn ignored_diffs_do_not_mark_out_of_sync() {
        let d = ResourceDiff { id: ResourceId::new("ConfigMap", Some("ns"), "extra"), action: DiffAction::Ignored, fields: vec![] };
        assert_eq!(SyncStatus::from_diffs(None, vec![d.clone()]).code(), SyncCode::Synced);
        let c = ResourceDiff { action: DiffAction::Create, ..d };
        assert_eq!(SyncStatus::from_diffs(None, vec![c]).code(), SyncCode::OutOfSync);
    }
}
