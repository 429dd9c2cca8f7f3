//! Keel apply: diff desired against live, order actions by dependency tier, execute them in
//! batches and check that the live side converged.

#![forbid(unsafe_code)]

pub mod diff;
pub mod executor;
pub mod order;
pub mod state;
pub mod throttle;

pub use diff::{diff_summary, field_changes, plan, qualify_namespaces, Action, DiffSummary, Plan, REDACTED};
pub use executor::{ExecConfig, Execution, Executor};
pub use order::{batches, Batch, Phase};
pub use state::{IllegalTransition, SyncPhase};
pub use throttle::Throttle;
