//! Error taxonomy shared by every stage of a reconciliation pass.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by rendering, observation and apply.
///
/// Config-time errors (`MalformedInput`, `MissingReference`, `CyclicInclude`, `PatchConflict`,
/// `DuplicateIdentity`) abort rendering for one application. `Unreachable` is transient and
/// retried; `Forbidden` is fatal. `ApplyFailure` is scoped to a single resource.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KeelError {
    #[error("malformed input in {origin}: {message}")]
    MalformedInput { origin: String, message: String },

    #[error("missing reference in {origin}: {reference}")]
    MissingReference { origin: String, reference: String },

    #[error("cyclic include: {}", .cycle.join(" -> "))]
    CyclicInclude { cycle: Vec<String> },

    #[error("patch conflict on {resource} at {path}: {message}")]
    PatchConflict { resource: String, path: String, message: String },

    #[error("duplicate resource identity {resource} ({message})")]
    DuplicateIdentity { resource: String, message: String },

    #[error("destination unreachable: {message}")]
    Unreachable { message: String },

    #[error("forbidden: {message}")]
    Forbidden { message: String },

    #[error("apply failed for {resource}: {message}")]
    ApplyFailure { resource: String, message: String },
}

/// Coarse handling class for a [`KeelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Fatal to the current render, reported, never retried.
    Config,
    /// Retried with capped exponential backoff.
    Transient,
    /// Surfaced to the operator, never retried.
    Fatal,
    /// Isolated to one resource of a batch.
    Resource,
}

impl KeelError {
    pub fn malformed(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedInput { origin: origin.into(), message: message.into() }
    }

    pub fn missing(origin: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::MissingReference { origin: origin.into(), reference: reference.into() }
    }

    pub fn unreachable(message: impl Into<String>) -> Self { Self::Unreachable { message: message.into() } }

    pub fn forbidden(message: impl Into<String>) -> Self { Self::Forbidden { message: message.into() } }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedInput { .. }
            | Self::MissingReference { .. }
            | Self::CyclicInclude { .. }
            | Self::PatchConflict { .. }
            | Self::DuplicateIdentity { .. } => ErrorClass::Config,
            Self::Unreachable { .. } => ErrorClass::Transient,
            Self::Forbidden { .. } => ErrorClass::Fatal,
            Self::ApplyFailure { .. } => ErrorClass::Resource,
        }
    }

    /// Returns true if the error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool { self.class() == ErrorClass::Transient }

    /// Stable variant name, used in status reports and history rows.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MalformedInput { .. } => "MalformedInput",
            Self::MissingReference { .. } => "MissingReference",
            Self::CyclicInclude { .. } => "CyclicInclude",
            Self::PatchConflict { .. } => "PatchConflict",
            Self::DuplicateIdentity { .. } => "DuplicateIdentity",
            Self::Unreachable { .. } => "Unreachable",
            Self::Forbidden { .. } => "Forbidden",
            Self::ApplyFailure { .. } => "ApplyFailure",
        }
    }
}

pub type KeelResult<T> = std::result::Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_drive_retry() {
        assert!(KeelError::unreachable("dial tcp: refused").is_retryable());
        assert!(!KeelError::forbidden("rbac").is_retryable());
        assert_eq!(KeelError::malformed("a.yaml", "bad").class(), ErrorClass::Config);
        let cyc = KeelError::CyclicInclude { cycle: vec!["a".into(), "b".into(), "a".into()] };
        assert_eq!(cyc.to_string(), "cyclic include: a -> b -> a");
        assert_eq!(cyc.name(), "CyclicInclude");
    }
}
