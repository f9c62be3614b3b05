//! Module graph
//!
//! Module specifications and the connector graph derived from them.

pub mod dependencies;
pub mod spec;

pub use dependencies::{ConnectionGraph, ConnectorResolver, GraphError};
pub use spec::{ModuleSpec, Tier};
