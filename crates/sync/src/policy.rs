//! What a batch of triggers means for an application, given its sync policy.

use std::time::Duration;

use keel_core::{ResourceId, SyncPolicy};

/// Why a pass was requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Periodic resync tick.
    Interval,
    /// The source resolved to a new revision.
    SourceChange(String),
    /// A tracked resource changed on the live side.
    Drift(ResourceId),
    /// Operator asked for a fresh comparison.
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    /// Compare and record status, apply nothing.
    Refresh,
    Sync,
}

/// Automated applications sync on ticks and source changes; drift syncs only with self-heal.
/// Everything else just refreshes status.
pub fn decide(policy: &SyncPolicy, triggers: &[Trigger]) -> Decision {
    if triggers.is_empty() { return Decision::Skip; }
    let wants_sync = triggers.iter().any(|t| match t {
        Trigger::Interval | Trigger::SourceChange(_) => policy.automated,
        Trigger::Drift(_) => policy.self_heal,
        Trigger::Refresh => false,
    });
    if wants_sync { Decision::Sync } else { Decision::Refresh }
}

/// Delay before retry `attempt` (0-based): `min(base * 2^attempt, cap)`.
pub fn backoff(policy: &SyncPolicy, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    policy.backoff_base.checked_mul(factor).unwrap_or(policy.backoff_cap).min(policy.backoff_cap)
}

/// Total observation attempts before a pass gives up.
pub fn attempts(policy: &SyncPolicy) -> u32 { policy.retry_limit.max(1) }
