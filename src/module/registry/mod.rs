//! Module registry
//!
//! Owns the live set of modules and their lifecycle state machine:
//!
//! ```text
//! Unloaded -> Activating -> Active -> Deactivating -> Unloaded
//!                 |                        |
//!                 +--------> Error <-------+      (Error -> Unloaded via reset)
//! ```
//!
//! Activation walks the dependency closure in topological order and rolls
//! back whatever the request itself constructed if a step fails.
//! Deactivation cascades to dependents first. Each node has its own
//! transition lock; the topology (graph + nodes) sits behind a read-mostly
//! lock that is never held while module code runs.

pub mod events;
mod node;
mod reload;

pub use events::{StateChange, StateSubscription};
pub use reload::ReloadReport;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::module::graph::{ConnectionGraph, GraphError, ModuleSpec, Tier};
use crate::module::loader::ModuleCatalog;
use crate::module::registry::events::StateNotifier;
use crate::module::registry::node::ModuleNode;
use crate::module::traits::{Module, ModuleContext, ModuleError, ModuleState};

/// Registry errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Activation of module '{module}' failed: {cause}")]
    ActivationFailed { module: String, cause: String },

    #[error("Deactivation of module '{module}' failed: {cause}")]
    DeactivationFailed { module: String, cause: String },

    #[error("Module '{module}' requires '{dependency}' which is not active")]
    DependencyNotActive { module: String, dependency: String },

    #[error("Module '{module}' is in error state: {cause}")]
    InErrorState { module: String, cause: String },

    #[error("Activation of module '{0}' was cancelled")]
    Cancelled(String),

    #[error("Registry task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Point-in-time view of one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    pub tier: Tier,
    pub class_id: String,
    pub state: ModuleState,
    pub allow_remote: bool,
    pub last_error: Option<String>,
}

/// An Active module as seen through the namespace
#[derive(Clone)]
pub struct ActiveModule {
    pub spec: Arc<ModuleSpec>,
    pub instance: Arc<dyn Module>,
}

impl fmt::Debug for ActiveModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveModule")
            .field("name", &self.spec.name)
            .field("class_id", &self.spec.class_id)
            .finish()
    }
}

type NodeMap = HashMap<String, Arc<ModuleNode>>;

struct Topology {
    config: Arc<RuntimeConfig>,
    graph: Arc<ConnectionGraph>,
    nodes: NodeMap,
}

struct RegistryInner {
    catalog: Arc<ModuleCatalog>,
    topology: RwLock<Topology>,
    notifier: StateNotifier,
    /// Held shared by lifecycle requests and exclusively by a reload, so no
    /// request can touch a node while a reload tears it down or swaps it out
    reload_gate: RwLock<()>,
}

enum NodeOutcome {
    Constructed,
    AlreadyActive,
}

/// Live module set; cheap to clone, all clones share state
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

impl ModuleRegistry {
    /// Create a registry for a configuration; every module starts Unloaded
    pub fn new(config: Arc<RuntimeConfig>, catalog: ModuleCatalog) -> Result<Self, RegistryError> {
        let graph = Arc::new(config.graph()?);
        let nodes = Self::nodes_for(&graph);
        let notifier = StateNotifier::new(config.global.state_channel_capacity);

        info!("Module registry created with {} modules", graph.len());

        Ok(Self {
            inner: Arc::new(RegistryInner {
                catalog: Arc::new(catalog),
                topology: RwLock::new(Topology {
                    config,
                    graph,
                    nodes,
                }),
                notifier,
                reload_gate: RwLock::new(()),
            }),
        })
    }

    fn nodes_for(graph: &ConnectionGraph) -> NodeMap {
        graph
            .specs()
            .map(|spec| (spec.name.clone(), Arc::new(ModuleNode::new(Arc::clone(spec)))))
            .collect()
    }

    async fn topology_view(&self) -> (Arc<ConnectionGraph>, NodeMap) {
        let topology = self.inner.topology.read().await;
        (Arc::clone(&topology.graph), topology.nodes.clone())
    }

    async fn node(&self, name: &str) -> Result<Arc<ModuleNode>, RegistryError> {
        let topology = self.inner.topology.read().await;
        topology
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ModuleNotFound(name.to_string()))
    }

    fn notifier(&self) -> &StateNotifier {
        &self.inner.notifier
    }

    /// Configuration currently in effect
    pub async fn config(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.inner.topology.read().await.config)
    }

    /// Connection graph currently in effect
    pub async fn graph(&self) -> Arc<ConnectionGraph> {
        Arc::clone(&self.inner.topology.read().await.graph)
    }

    /// Subscribe to state-change notifications
    pub fn subscribe_state_changes(&self) -> StateSubscription {
        self.notifier().subscribe()
    }

    /// Current state of a module
    pub async fn status(&self, name: &str) -> Result<ModuleState, RegistryError> {
        Ok(self.node(name).await?.state())
    }

    /// Cause of the last failure, while the module is in Error
    pub async fn last_error(&self, name: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.node(name).await?.last_error())
    }

    /// Status of every module, sorted by name
    pub async fn snapshot(&self) -> Vec<ModuleStatus> {
        let topology = self.inner.topology.read().await;
        topology
            .graph
            .specs()
            .filter_map(|spec| topology.nodes.get(&spec.name))
            .map(|node| {
                let spec = node.spec();
                ModuleStatus {
                    name: spec.name.clone(),
                    tier: spec.tier,
                    class_id: spec.class_id.clone(),
                    state: node.state(),
                    allow_remote: spec.allow_remote,
                    last_error: node.last_error(),
                }
            })
            .collect()
    }

    /// Names of Active modules, sorted
    pub async fn active_modules(&self) -> Vec<String> {
        let topology = self.inner.topology.read().await;
        let mut names: Vec<String> = topology
            .nodes
            .values()
            .filter(|node| node.state().is_active())
            .map(|node| node.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Look up an Active module; never triggers activation
    pub async fn active_module(&self, name: &str) -> Option<ActiveModule> {
        let node = self.node(name).await.ok()?;
        let instance = node.active_instance()?;
        Some(ActiveModule {
            spec: Arc::clone(node.spec()),
            instance,
        })
    }

    /// Activate a module and, first, every dependency that is not Active
    ///
    /// Concurrent requests for the same module coalesce: only one
    /// construction runs and every caller observes its outcome.
    pub async fn request_activate(&self, name: &str) -> Result<(), RegistryError> {
        self.request_activate_with_cancel(name, CancellationToken::new())
            .await
    }

    /// Like `request_activate`, cancellable through `cancel`
    ///
    /// The request runs on its own task, so dropping the returned future
    /// does not abandon a transition halfway.
    pub async fn request_activate_with_cancel(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<(), RegistryError> {
        let registry = self.clone();
        let owned = name.to_string();
        tokio::spawn(async move {
            let _gate = registry.inner.reload_gate.read().await;
            registry.activate_closure(&owned, &cancel).await
        })
        .await
            .map_err(|e| RegistryError::TaskFailed(e.to_string()))?
    }

    async fn activate_closure(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RegistryError> {
        let (graph, nodes) = self.topology_view().await;
        if !graph.contains(name) {
            return Err(RegistryError::ModuleNotFound(name.to_string()));
        }

        let order = graph.dependency_closure(name);
        debug!("Activation plan for {}: {:?}", name, order);

        let mut activated: Vec<Arc<ModuleNode>> = Vec::new();
        for module in &order {
            let step = match nodes.get(module) {
                Some(node) => self
                    .activate_node(node, &nodes, name, cancel)
                    .await
                    .map(|outcome| (Arc::clone(node), outcome)),
                None => Err(RegistryError::ModuleNotFound(module.clone())),
            };
            match step {
                Ok((node, NodeOutcome::Constructed)) => activated.push(node),
                Ok((_, NodeOutcome::AlreadyActive)) => {}
                Err(e) => {
                    warn!("Activation of {} failed at {}: {}", name, module, e);
                    self.rollback(activated, &graph, &nodes).await;
                    if matches!(e, RegistryError::Cancelled(_)) && module != name {
                        if let Some(target) = nodes.get(name) {
                            self.fail_cancelled(target).await;
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Park the requested module in Error when its request was cancelled
    /// before it could be constructed; dependencies are left alone
    async fn fail_cancelled(&self, node: &Arc<ModuleNode>) {
        let _transition = node.transition.lock().await;
        if node.state() == ModuleState::Unloaded && !node.is_retired() {
            node.fail("activation cancelled before construction", self.notifier());
        }
    }

    async fn activate_node(
        &self,
        node: &Arc<ModuleNode>,
        nodes: &NodeMap,
        requested: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, RegistryError> {
        let name = node.name().to_string();
        let cancelled = || RegistryError::Cancelled(requested.to_string());

        let _transition = tokio::select! {
            biased;
            guard = node.transition.lock() => guard,
            _ = cancel.cancelled() => return Err(cancelled()),
        };

        if node.is_retired() {
            return Err(RegistryError::ModuleNotFound(name));
        }
        match node.state() {
            ModuleState::Active => return Ok(NodeOutcome::AlreadyActive),
            ModuleState::Error => {
                return Err(RegistryError::InErrorState {
                    module: name,
                    cause: node.last_error().unwrap_or_default(),
                })
            }
            _ => {}
        }

        let spec = Arc::clone(node.spec());
        let mut context = ModuleContext::new(spec.name.clone(), spec.tier, spec.options.clone());
        for (connector, target) in &spec.connectors {
            let instance = nodes
                .get(target)
                .and_then(|dep| dep.active_instance())
                .ok_or_else(|| RegistryError::DependencyNotActive {
                    module: name.clone(),
                    dependency: target.clone(),
                })?;
            context.connectors.insert(connector.clone(), instance);
        }

        if cancel.is_cancelled() {
            if name == requested {
                node.fail("activation cancelled before construction", self.notifier());
            }
            return Err(cancelled());
        }

        info!("Activating module {} ({})", name, spec.class_id);
        node.set_state(ModuleState::Activating, self.notifier());

        // Construction runs on its own task so a panicking implementation
        // is contained and a cancelled caller cannot abort it midway.
        let catalog = Arc::clone(&self.inner.catalog);
        let class_id = spec.class_id.clone();
        let construction = tokio::spawn(async move {
            let instance = catalog.construct(&class_id, context)?;
            instance.on_activate().await?;
            Ok::<_, ModuleError>(instance)
        });

        let cause = match construction.await {
            Ok(Ok(instance)) => {
                node.install(instance, self.notifier());
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(ModuleError::Panicked(e.to_string()).to_string()),
        };
        if let Some(cause) = cause {
            error!("Module {} failed to activate: {}", name, cause);
            node.fail(cause.clone(), self.notifier());
            return Err(RegistryError::ActivationFailed {
                module: name,
                cause,
            });
        }

        if cancel.is_cancelled() {
            info!("Activation of {} cancelled after construction, tearing down", name);
            if let Err(e) = self.deactivate_locked(node).await {
                warn!("Teardown of cancelled module {} failed: {}", name, e);
            }
            return Err(cancelled());
        }

        info!("Module {} active", name);
        Ok(NodeOutcome::Constructed)
    }

    /// Undo the activations a failed request performed, newest first
    async fn rollback(
        &self,
        activated: Vec<Arc<ModuleNode>>,
        graph: &ConnectionGraph,
        nodes: &NodeMap,
    ) {
        for node in activated.into_iter().rev() {
            let _transition = node.transition.lock().await;
            let in_use = graph
                .dependents_of(node.name())
                .filter_map(|d| nodes.get(d))
                .any(|d| d.state().is_active());
            if in_use {
                debug!("Keeping {} active: another module now depends on it", node.name());
                continue;
            }
            warn!("Rolling back activation of module {}", node.name());
            if let Err(e) = self.deactivate_locked(&node).await {
                warn!("Rollback of {} failed: {}", node.name(), e);
            }
        }
    }

    /// Tear down one node; the caller holds its transition lock
    ///
    /// The instance is discarded even when `on_deactivate` fails, so a
    /// misbehaving module can always leave the live set.
    async fn deactivate_locked(&self, node: &Arc<ModuleNode>) -> Result<(), RegistryError> {
        if !node.state().is_active() {
            return Ok(());
        }
        let name = node.name().to_string();
        info!("Deactivating module {}", name);
        node.set_state(ModuleState::Deactivating, self.notifier());

        let instance = node.instance();
        let teardown = tokio::spawn(async move {
            match instance {
                Some(instance) => instance.on_deactivate().await,
                None => Ok(()),
            }
        });
        let result = teardown.await;
        node.discard_instance();

        let cause = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(ModuleError::Panicked(e.to_string()).to_string()),
        };
        match cause {
            None => {
                node.set_state(ModuleState::Unloaded, self.notifier());
                info!("Module {} unloaded", name);
                Ok(())
            }
            Some(cause) => {
                error!("Module {} failed to deactivate: {}", name, cause);
                node.fail(cause.clone(), self.notifier());
                Err(RegistryError::DeactivationFailed {
                    module: name,
                    cause,
                })
            }
        }
    }

    /// Deactivate a module after every module that depends on it
    ///
    /// Failures do not stop the cascade; the first one is returned.
    pub async fn request_deactivate(&self, name: &str) -> Result<(), RegistryError> {
        let registry = self.clone();
        let owned = name.to_string();
        tokio::spawn(async move {
            let _gate = registry.inner.reload_gate.read().await;
            let (graph, nodes) = registry.topology_view().await;
            if !graph.contains(&owned) {
                return Err(RegistryError::ModuleNotFound(owned));
            }
            let order = graph.dependent_closure(&owned);
            debug!("Deactivation plan for {}: {:?}", owned, order);
            registry.deactivate_in_order(&order, &nodes).await
        })
        .await
        .map_err(|e| RegistryError::TaskFailed(e.to_string()))?
    }

    async fn deactivate_in_order(
        &self,
        order: &[String],
        nodes: &NodeMap,
    ) -> Result<(), RegistryError> {
        let mut first_error = None;

        // A concurrent activation can bring a dependent back mid-cascade;
        // repeat until no module in the set is Active.
        for _ in 0..=order.len() {
            for module in order {
                let Some(node) = nodes.get(module) else {
                    continue;
                };
                let _transition = node.transition.lock().await;
                if let Err(e) = self.deactivate_locked(node).await {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            let quiet = order
                .iter()
                .filter_map(|m| nodes.get(m))
                .all(|n| !n.state().is_active());
            if quiet {
                break;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Explicitly move a module out of Error
    pub async fn reset(&self, name: &str) -> Result<(), RegistryError> {
        let node = self.node(name).await?;
        let _transition = node.transition.lock().await;
        if node.state() == ModuleState::Error {
            info!("Resetting module {}", name);
            node.set_state(ModuleState::Unloaded, self.notifier());
        }
        Ok(())
    }

    /// Activate the configured startup modules; failures are collected
    pub async fn activate_startup(&self) -> Vec<(String, RegistryError)> {
        let startup = self.config().await.global.startup.clone();
        let mut failures = Vec::new();
        for name in startup {
            if let Err(e) = self.request_activate(&name).await {
                error!("Startup module {} failed: {}", name, e);
                failures.push((name, e));
            }
        }
        failures
    }

    /// Deactivate every Active module, dependents first
    pub async fn deactivate_all(&self) -> Result<(), RegistryError> {
        info!("Deactivating all modules");
        let _gate = self.inner.reload_gate.read().await;
        let (graph, nodes) = self.topology_view().await;
        self.deactivate_in_order(&graph.deactivation_order(), &nodes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::module::value::Value;
    use async_trait::async_trait;

    struct Inert;

    #[async_trait]
    impl Module for Inert {
        async fn on_activate(&self) -> Result<(), ModuleError> {
            Ok(())
        }
        async fn on_deactivate(&self) -> Result<(), ModuleError> {
            Ok(())
        }
        fn capabilities(&self) -> Vec<String> {
            Vec::new()
        }
        async fn invoke(&self, method: &str, _args: &mut [Value]) -> Result<Value, ModuleError> {
            Err(ModuleError::UnknownMethod(method.to_string()))
        }
    }

    fn registry(specs: Vec<ModuleSpec>) -> ModuleRegistry {
        let config = RuntimeConfig::new(GlobalConfig::default(), specs).unwrap();
        let catalog = ModuleCatalog::new()
            .with_fn("inert", |_ctx: ModuleContext| Ok(Arc::new(Inert) as Arc<dyn Module>));
        ModuleRegistry::new(Arc::new(config), catalog).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_class_sets_error() {
        let registry = registry(vec![ModuleSpec::new("x", Tier::Hardware, "missing.class")]);
        let err = registry.request_activate("x").await.unwrap_err();
        assert!(matches!(err, RegistryError::ActivationFailed { ref module, .. } if module == "x"));
        assert_eq!(registry.status("x").await.unwrap(), ModuleState::Error);
        assert!(registry
            .last_error("x")
            .await
            .unwrap()
            .unwrap()
            .contains("missing.class"));

        // Inert until reset
        assert!(matches!(
            registry.request_activate("x").await,
            Err(RegistryError::InErrorState { .. })
        ));
        registry.reset("x").await.unwrap();
        assert_eq!(registry.status("x").await.unwrap(), ModuleState::Unloaded);
    }

    #[tokio::test]
    async fn test_unknown_module() {
        let registry = registry(vec![]);
        assert_eq!(
            registry.request_activate("ghost").await,
            Err(RegistryError::ModuleNotFound("ghost".into()))
        );
        assert!(registry.status("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_deactivate_inactive_is_noop() {
        let registry = registry(vec![ModuleSpec::new("x", Tier::Logic, "inert")]);
        registry.request_deactivate("x").await.unwrap();
        assert_eq!(registry.status("x").await.unwrap(), ModuleState::Unloaded);
    }

    #[tokio::test]
    async fn test_modules_snapshot() {
        let registry = registry(vec![
            ModuleSpec::new("b", Tier::Logic, "inert").connect("a", "a"),
            ModuleSpec::new("a", Tier::Hardware, "inert").allow_remote(false),
        ]);
        registry.request_activate("b").await.unwrap();
        let modules = registry.snapshot().await;
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "a");
        assert!(!modules[0].allow_remote);
        assert!(modules.iter().all(|m| m.state == ModuleState::Active));
        assert_eq!(registry.active_modules().await, vec!["a", "b"]);
    }
}
