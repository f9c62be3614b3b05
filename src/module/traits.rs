//! Module system traits and interfaces
//!
//! Defines the capability contract every module implementation satisfies and
//! the factory contract the runtime uses to construct them by class id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::module::graph::Tier;
use crate::module::value::Value;

/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    /// No instance exists
    Unloaded,
    /// Instance is being constructed and activated
    Activating,
    /// Instance is live and reachable through the namespace
    Active,
    /// Instance is being torn down
    Deactivating,
    /// A transition failed; inert until reset or reload
    Error,
}

impl ModuleState {
    pub fn is_active(&self) -> bool {
        matches!(self, ModuleState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Activating => "activating",
            ModuleState::Active => "active",
            ModuleState::Deactivating => "deactivating",
            ModuleState::Error => "error",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Module trait that all module implementations must satisfy
///
/// The runtime never looks behind this trait: a module is constructible from
/// its options (through a [`ModuleFactory`]), can be activated and
/// deactivated, and exposes a named set of invocable capabilities.
#[async_trait]
pub trait Module: Send + Sync {
    /// Called once after construction, before the module becomes reachable
    async fn on_activate(&self) -> Result<(), ModuleError>;

    /// Called once when the module leaves the live set
    ///
    /// The instance is discarded afterwards whether or not this succeeds.
    async fn on_deactivate(&self) -> Result<(), ModuleError>;

    /// Names of the methods `invoke` accepts
    fn capabilities(&self) -> Vec<String>;

    /// Invoke a capability method
    ///
    /// Arguments are passed as a mutable slice. In-process callers see any
    /// mutation the module makes; by-value remote callers never do.
    async fn invoke(&self, method: &str, args: &mut [Value]) -> Result<Value, ModuleError>;
}

/// Construction function for one class id
pub trait ModuleFactory: Send + Sync {
    fn construct(&self, context: ModuleContext) -> Result<Arc<dyn Module>, ModuleError>;
}

impl<F> ModuleFactory for F
where
    F: Fn(ModuleContext) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync,
{
    fn construct(&self, context: ModuleContext) -> Result<Arc<dyn Module>, ModuleError> {
        self(context)
    }
}

/// Everything a factory gets to build one instance
#[derive(Clone)]
pub struct ModuleContext {
    /// Module name (unique across the graph)
    pub name: String,
    /// Tier the module was declared in
    pub tier: Tier,
    /// Options from the configuration document
    pub options: BTreeMap<String, Value>,
    /// Live dependency instances keyed by connector name
    pub connectors: HashMap<String, Arc<dyn Module>>,
}

impl ModuleContext {
    pub fn new(name: impl Into<String>, tier: Tier, options: BTreeMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            tier,
            options,
            connectors: HashMap::new(),
        }
    }

    /// Get an option value
    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    /// Get an option value with default
    pub fn option_or(&self, key: &str, default: Value) -> Value {
        self.options.get(key).cloned().unwrap_or(default)
    }

    /// Get the module bound to a connector
    pub fn connector(&self, name: &str) -> Result<Arc<dyn Module>, ModuleError> {
        self.connectors
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::MissingConnector(name.to_string()))
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut connectors: Vec<&String> = self.connectors.keys().collect();
        connectors.sort();
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("options", &self.options)
            .field("connectors", &connectors)
            .finish()
    }
}

/// Errors raised by module implementations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModuleError {
    #[error("Module initialization failed: {0}")]
    InitializationError(String),

    #[error("Module operation failed: {0}")]
    OperationError(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connector not bound: {0}")]
    MissingConnector(String),

    #[error("Unknown module class: {0}")]
    UnknownClass(String),

    #[error("Module panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for ModuleError {
    fn from(e: anyhow::Error) -> Self {
        ModuleError::OperationError(e.to_string())
    }
}
