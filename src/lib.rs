//! modhost - process-local module runtime
//!
//! Loads a declarative configuration of named modules in three tiers
//! (hardware, logic, gui) connected through named connectors, activates them
//! in dependency order and republishes the Active ones to local and remote
//! callers.
//!
//! ## Flow
//!
//! 1. `config`: parse and validate the document into an immutable `RuntimeConfig`
//! 2. `module::graph`: resolve connectors into an acyclic `ConnectionGraph`
//! 3. `module::registry`: drive each module through its lifecycle
//! 4. `module::ipc`: expose Active modules over TCP
//!
//! `runtime::ModuleRuntime` ties these together.

pub mod config;
pub mod module;
pub mod runtime;
pub mod utils;

pub use config::{GlobalConfig, RuntimeConfig};
pub use module::{
    Module, ModuleCatalog, ModuleContext, ModuleError, ModuleRegistry, ModuleSpec, ModuleState,
    RegistryError, Tier, Value,
};
pub use runtime::ModuleRuntime;
