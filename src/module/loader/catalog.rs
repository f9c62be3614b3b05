//! Module catalog
//!
//! Maps class identifiers from the configuration document to factories. The
//! runtime only ever talks to the catalog; concrete module types stay behind
//! the `Module` trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::module::traits::{Module, ModuleContext, ModuleError, ModuleFactory};

/// Registered factories keyed by class id
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    factories: HashMap<String, Arc<dyn ModuleFactory>>,
}

impl ModuleCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a class id, replacing any previous one
    pub fn register(&mut self, class_id: impl Into<String>, factory: Arc<dyn ModuleFactory>) {
        let class_id = class_id.into();
        debug!("Registering module class {}", class_id);
        self.factories.insert(class_id, factory);
    }

    /// Register a closure as the factory for a class id
    pub fn register_fn<F>(&mut self, class_id: impl Into<String>, factory: F)
    where
        F: Fn(ModuleContext) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        self.register(class_id, Arc::new(factory));
    }

    /// Builder-style registration
    pub fn with_fn<F>(mut self, class_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ModuleContext) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        self.register_fn(class_id, factory);
        self
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.factories.contains_key(class_id)
    }

    /// Registered class ids, sorted
    pub fn class_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Construct an instance of `class_id`
    pub fn construct(
        &self,
        class_id: &str,
        context: ModuleContext,
    ) -> Result<Arc<dyn Module>, ModuleError> {
        let factory = self
            .factories
            .get(class_id)
            .ok_or_else(|| ModuleError::UnknownClass(class_id.to_string()))?;
        factory.construct(context)
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("classes", &self.class_ids())
            .finish()
    }
}
