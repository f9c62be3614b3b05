//! Module system
//!
//! Modules are named components built by registered factories, wired
//! together through connectors and driven through a per-module lifecycle.
//!
//! ## Layout
//!
//! - **graph**: specs and the connector graph (missing targets, cycles, ordering)
//! - **loader**: class id → factory catalog
//! - **registry**: live instances and their state machine
//! - **ipc**: remote access and same-host namespace servers

pub mod graph;
pub mod ipc;
pub mod loader;
pub mod registry;
pub mod traits;
pub mod value;

pub use graph::{ConnectionGraph, ConnectorResolver, GraphError, ModuleSpec, Tier};
pub use loader::ModuleCatalog;
pub use registry::{ModuleRegistry, ModuleStatus, RegistryError, ReloadReport, StateChange};
pub use traits::{Module, ModuleContext, ModuleError, ModuleFactory, ModuleState};
pub use value::Value;
