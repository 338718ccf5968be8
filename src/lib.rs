// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Keelson
//!
//! A declarative resource orchestration engine.
//!
//! ## Overview
//!
//! Keelson takes a set of resource declarations and converges the remote
//! objects they describe:
//!
//! - Declarations reference each other's outputs, which orders them into a
//!   dependency graph
//! - Each run diffs the graph against the last recorded snapshot and turns the
//!   differences into an ordered plan of create, update, replace and delete
//!   changes
//! - The plan is applied concurrently, respecting dependencies, with retries
//!   for transient provider failures
//!
//! ## Architecture
//!
//! 1. **Graph**: [`graph::Graph`] validates declarations and orders them
//! 2. **Planner**: [`planner::Planner`] compares the graph with a
//!    [`state::Snapshot`] and produces a [`planner::Plan`]
//! 3. **Executor**: [`planner::PlanExecutor`] runs the plan against the
//!    registered [`provider::Provider`]s and returns the new snapshot
//! 4. **Reconciler**: [`reconciler::Reconciler`] ties the three together
//!    under the snapshot lock
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing and validation
//! - [`graph`]: Resource identities, values and the dependency graph
//! - [`state`]: Snapshots and their storage backends
//! - [`provider`]: The provider contract and the bundled providers
//! - [`planner`]: Diffing, planning and concurrent execution
//! - [`reconciler`]: Locked apply, destroy, drift and refresh runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: egress-hub
//!   environment: prod
//!
//! types:
//!   vpc:
//!     immutable: [cidr_block]
//!
//! resources:
//!   egress-vpc:
//!     type: vpc
//!     properties:
//!       cidr_block: 10.0.0.0/16
//!   public-subnet:
//!     type: subnet
//!     properties:
//!       vpc_id: { ref: egress-vpc }
//!       cidr_block: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{KeelsonError, Result};
pub use graph::{Graph, ResourceDecl, ResourceId, Value};
pub use planner::{ApplyResult, Plan, PlanExecutor, Planner};
pub use provider::{Provider, ProviderRegistry, TypeDescriptor};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use state::{LocalSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
