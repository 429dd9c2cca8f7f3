//! Keel core types: resource declarations, applications, sync status and the error taxonomy.

#![forbid(unsafe_code)]

pub mod app;
pub mod error;
pub mod kinds;
pub mod resource;
pub mod status;

pub use app::{Application, Destination, Source, SyncPolicy, TRACKING_LABEL};
pub use error::{ErrorClass, KeelError, KeelResult};
pub use kinds::{apply_tier, is_cluster_scoped, is_passthrough, KindRef};
pub use resource::{canonical_bytes, sort_keys, ResourceDecl, ResourceId};
pub use status::{DiffAction, FieldChange, ResourceDiff, ResourceOutcome, SyncCode, SyncStatus};

pub mod prelude {
    pub use super::{
        Application, Destination, KeelError, KindRef, ResourceDecl, ResourceId, SyncCode, SyncPolicy,
        SyncStatus,
    };
}

/// 64-bit FNV-1a over arbitrary bytes. Used for render fingerprints and source revisions.
pub fn fingerprint(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
    h
}

/// Incremental form of [`fingerprint`] for streaming several inputs.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter(u64);

impl Default for Fingerprinter {
    fn default() -> Self { Self(0xcbf29ce484222325) }
}

impl Fingerprinter {
    pub fn update(&mut self, bytes: &[u8]) {
        for b in bytes { self.0 ^= *b as u64; self.0 = self.0.wrapping_mul(0x100000001b3); }
    }
    pub fn finish(&self) -> u64 { self.0 }
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
