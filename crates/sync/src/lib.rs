//! Keel sync: policy decisions, trigger queues, source resolution and the controller that
//! drives reconciliation passes.

#![forbid(unsafe_code)]

pub mod controller;
pub mod policy;
pub mod source;
pub mod trigger;

pub use controller::{Controller, ControllerConfig, SyncError, SyncReport};
pub use policy::{backoff, decide, Decision, Trigger};
pub use source::{LocalSource, Resolved, SourceResolver};
pub use trigger::{Coalescer, TriggerQueue};
