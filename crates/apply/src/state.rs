//! Per-application sync phase and its legal transitions.

use keel_core::SyncCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Unknown,
    OutOfSync,
    Syncing,
    Synced,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal sync transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SyncPhase,
    pub to: SyncPhase,
}

impl SyncPhase {
    pub fn from_code(code: SyncCode) -> Self {
        match code {
            SyncCode::Synced => SyncPhase::Synced,
            SyncCode::OutOfSync => SyncPhase::OutOfSync,
            SyncCode::Unknown => SyncPhase::Unknown,
            SyncCode::Degraded => SyncPhase::Degraded,
            SyncCode::Error => SyncPhase::Error,
        }
    }

    /// A comparison may move any settled phase to `Synced`, `OutOfSync` or `Error`. Only an
    /// out-of-sync application starts syncing, and a sync ends `Synced`, `Degraded` or `Error`,
    /// or `OutOfSync` when it was superseded before finishing.
    pub fn can_transition(self, to: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, to) {
            (Syncing, Synced | Degraded | Error | OutOfSync) => true,
            (Syncing, _) => false,
            (OutOfSync, Syncing) => true,
            (_, Synced | OutOfSync | Error) => true,
            // a degraded application stays degraded until a comparison says otherwise
            (Degraded, Degraded) => true,
            _ => false,
        }
    }

    pub fn transition(self, to: SyncPhase) -> Result<SyncPhase, IllegalTransition> {
        if self.can_transition(to) { Ok(to) } else { Err(IllegalTransition { from: self, to }) }
    }
}
