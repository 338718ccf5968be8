//! Planning and execution.
//!
//! This module compares the declared graph with the snapshot, orders the
//! resulting changes and applies them concurrently.

mod cancel;
mod diff;
mod executor;
mod plan;
mod retry;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use diff::{DiffEngine, DiffResult, DiffType, PropertyDiff, ResourceDiff};
pub use executor::{ApplyResult, ChangeReport, PlanExecutor, ResourceStatus, DEFAULT_WORKERS};
pub use plan::{Change, ChangeAction, Plan, Planner, Replacement};
pub use retry::RetryPolicy;
