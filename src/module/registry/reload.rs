//! Configuration reload
//!
//! Diffs the running graph against a new configuration, tears down only
//! removed or changed modules (and their dependents), swaps the topology and
//! restores whatever was Active before.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ModuleRegistry, RegistryError, Topology};
use crate::config::RuntimeConfig;
use crate::module::registry::node::ModuleNode;
use crate::module::traits::ModuleState;

/// Outcome of a reload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadReport {
    /// Modules present only in the new configuration
    pub added: Vec<String>,
    /// Modules present only in the old configuration
    pub removed: Vec<String>,
    /// Modules whose spec differs between the two
    pub changed: Vec<String>,
    /// Active modules torn down by the reload
    pub deactivated: Vec<String>,
    /// Previously Active modules brought back up
    pub restored: Vec<String>,
    /// Previously Active modules that could not be restored
    pub failed: Vec<(String, RegistryError)>,
}

impl ReloadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl ModuleRegistry {
    /// Replace the configuration
    ///
    /// An invalid graph (missing target, cycle) is rejected and the running
    /// graph stays untouched. Modules whose spec and dependencies are
    /// unchanged keep running. Error states are cleared.
    pub async fn request_reload(
        &self,
        config: Arc<RuntimeConfig>,
    ) -> Result<ReloadReport, RegistryError> {
        let registry = self.clone();
        tokio::spawn(async move { registry.reload_inner(config).await })
            .await
            .map_err(|e| RegistryError::TaskFailed(e.to_string()))?
    }

    async fn reload_inner(&self, config: Arc<RuntimeConfig>) -> Result<ReloadReport, RegistryError> {
        let _gate = self.inner.reload_gate.write().await;

        let new_graph = match config.graph() {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                warn!("Reload rejected, keeping current graph: {}", e);
                return Err(e.into());
            }
        };

        let (old_graph, old_nodes) = self.topology_view().await;
        let was_active = |name: &str| {
            old_nodes
                .get(name)
                .map(|node| node.state().is_active())
                .unwrap_or(false)
        };
        let previously_active: Vec<String> = old_graph
            .activation_order()
            .iter()
            .filter(|name| was_active(name.as_str()))
            .cloned()
            .collect();

        let mut report = ReloadReport::default();
        for spec in new_graph.specs() {
            match old_graph.spec(&spec.name) {
                None => report.added.push(spec.name.clone()),
                Some(old) if **old != **spec => report.changed.push(spec.name.clone()),
                Some(_) => {}
            }
        }
        for spec in old_graph.specs() {
            if !new_graph.contains(&spec.name) {
                report.removed.push(spec.name.clone());
            }
        }
        info!(
            "Reloading configuration: {} added, {} removed, {} changed",
            report.added.len(),
            report.removed.len(),
            report.changed.len()
        );

        let affected = old_graph.dependent_closure_of_all(
            report
                .removed
                .iter()
                .chain(report.changed.iter())
                .map(String::as_str),
        );
        report.deactivated = affected.iter().filter(|name| was_active(name.as_str())).cloned().collect();

        // Retired nodes refuse activation, so nothing can bring them back
        // between the teardown and the swap.
        for name in &affected {
            if let Some(node) = old_nodes.get(name) {
                node.retire();
            }
        }
        if let Err(e) = self.deactivate_in_order(&affected, &old_nodes).await {
            warn!("Reload teardown reported an error: {}", e);
        }

        let (carried_over, dropped) = {
            let mut topology = self.inner.topology.write().await;
            let mut nodes: HashMap<String, Arc<ModuleNode>> = HashMap::new();
            let mut carried_over = Vec::new();
            for spec in new_graph.specs() {
                let reusable = topology
                    .nodes
                    .get(&spec.name)
                    .filter(|node| **node.spec() == **spec && !affected.contains(&spec.name))
                    .cloned();
                let node = match reusable {
                    Some(node) => {
                        carried_over.push(Arc::clone(&node));
                        node
                    }
                    None => Arc::new(ModuleNode::new(Arc::clone(spec))),
                };
                nodes.insert(spec.name.clone(), node);
            }
            let mut dropped = Vec::new();
            for (name, old) in &topology.nodes {
                let kept = nodes.get(name).map(|n| Arc::ptr_eq(n, old)).unwrap_or(false);
                if !kept {
                    old.retire();
                    dropped.push(Arc::clone(old));
                }
            }
            *topology = Topology {
                config,
                graph: Arc::clone(&new_graph),
                nodes,
            };
            (carried_over, dropped)
        };

        // A dropped node must not keep a live instance past the swap
        for node in dropped {
            let _transition = node.transition.lock().await;
            if node.state().is_active() {
                warn!("Tearing down {} left running by the old configuration", node.name());
                if let Err(e) = self.deactivate_locked(&node).await {
                    warn!("Teardown of {} failed: {}", node.name(), e);
                }
            }
        }

        for node in carried_over {
            let _transition = node.transition.lock().await;
            if node.state() == ModuleState::Error {
                info!("Clearing error state of {} on reload", node.name());
                node.set_state(ModuleState::Unloaded, self.notifier());
            }
        }

        let cancel = CancellationToken::new();
        for name in previously_active {
            if !new_graph.contains(&name) {
                continue;
            }
            if self.status(&name).await.map(|s| s.is_active()).unwrap_or(false) {
                continue;
            }
            match self.activate_closure(&name, &cancel).await {
                Ok(()) => report.restored.push(name),
                Err(e) => {
                    warn!("Could not restore {} after reload: {}", name, e);
                    if let Ok(node) = self.node(&name).await {
                        let _transition = node.transition.lock().await;
                        if node.state() == ModuleState::Unloaded {
                            node.fail(format!("not restored after reload: {}", e), self.notifier());
                        }
                    }
                    report.failed.push((name, e));
                }
            }
        }

        info!(
            "Reload complete: {} restored, {} failed",
            report.restored.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
