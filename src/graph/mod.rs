//! Resource graph building.
//!
//! This module turns resource declarations into a validated dependency graph
//! with a deterministic topological order.

mod builder;
mod types;

pub use builder::{Graph, GraphBuilder};
pub use types::{
    property_references, LifecycleState, Outputs, PropertyMap, Reference, Resource, ResourceDecl,
    ResourceId, Value, ID_SEPARATOR,
};
