//! Runtime facade
//!
//! Wires the registry to the remote access and namespace servers and exposes
//! the lifecycle control surface used by hosts (UI, CLI, tests).

use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::module::ipc::{Namespace, NamespaceServer, RemoteAccessServer, SessionPolicy};
use crate::module::loader::ModuleCatalog;
use crate::module::registry::{
    ModuleRegistry, ModuleStatus, RegistryError, ReloadReport, StateSubscription,
};
use crate::module::traits::ModuleState;
use crate::utils::signal::wait_for_shutdown_signal;

/// A running module host
pub struct ModuleRuntime {
    registry: ModuleRegistry,
    remote_server: Option<RemoteAccessServer>,
    namespace_server: NamespaceServer,
}

impl ModuleRuntime {
    /// Build the registry, start the servers and activate the startup modules
    ///
    /// Startup modules that fail to activate are logged and left in Error;
    /// they do not prevent the runtime from starting.
    pub async fn start(config: Arc<RuntimeConfig>, catalog: ModuleCatalog) -> anyhow::Result<Self> {
        info!("Starting module runtime");

        let registry = ModuleRegistry::new(Arc::clone(&config), catalog)
            .context("Failed to build module graph")?;
        let global = &config.global;

        let remote_server = match &global.remote_modules_server {
            Some(server) => {
                let addr = server.socket_addr();
                let bound = RemoteAccessServer::bind(addr, registry.clone(), SessionPolicy::remote(global))
                    .await
                    .with_context(|| format!("Failed to bind remote access server on {}", addr))?;
                Some(bound)
            }
            None => {
                info!("No remote modules server configured");
                None
            }
        };

        let namespace_server =
            match NamespaceServer::bind(global.namespace_server_port, registry.clone(), global).await {
                Ok(server) => server,
                Err(e) => {
                    if let Some(server) = remote_server {
                        server.shutdown().await;
                    }
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to bind namespace server on port {}",
                            global.namespace_server_port
                        )
                    });
                }
            };

        let failures = registry.activate_startup().await;
        if failures.is_empty() {
            info!("Module runtime started");
        } else {
            warn!(
                "Module runtime started, {} startup module(s) failed to activate",
                failures.len()
            );
        }

        Ok(Self {
            registry,
            remote_server,
            namespace_server,
        })
    }

    /// Load the configuration document at `path` and start
    pub async fn from_file(path: &Path, catalog: ModuleCatalog) -> anyhow::Result<Self> {
        let config = RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?;
        Self::start(Arc::new(config), catalog).await
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// In-process view of the Active modules
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.registry.clone())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_server.as_ref().map(RemoteAccessServer::local_addr)
    }

    pub fn namespace_addr(&self) -> SocketAddr {
        self.namespace_server.local_addr()
    }

    pub async fn activate(&self, name: &str) -> Result<(), RegistryError> {
        self.registry.request_activate(name).await
    }

    pub async fn deactivate(&self, name: &str) -> Result<(), RegistryError> {
        self.registry.request_deactivate(name).await
    }

    /// Swap in a new configuration
    ///
    /// Server addresses and the marshaling flag are fixed at start; changes
    /// to them are reported and take effect on the next start.
    pub async fn reload(&self, config: Arc<RuntimeConfig>) -> Result<ReloadReport, RegistryError> {
        let current = self.registry.config().await;
        if current.global.remote_modules_server != config.global.remote_modules_server
            || current.global.namespace_server_port != config.global.namespace_server_port
            || current.global.force_remote_calls_by_value != config.global.force_remote_calls_by_value
        {
            warn!("Server settings changed; they take effect on the next start");
        }
        self.registry.request_reload(config).await
    }

    /// Reload from a configuration document on disk
    pub async fn reload_from_file(&self, path: &Path) -> anyhow::Result<ReloadReport> {
        let config = RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?;
        Ok(self.reload(Arc::new(config)).await?)
    }

    pub async fn status(&self, name: &str) -> Result<ModuleState, RegistryError> {
        self.registry.status(name).await
    }

    pub async fn modules(&self) -> Vec<ModuleStatus> {
        self.registry.snapshot().await
    }

    pub fn subscribe_state_changes(&self) -> StateSubscription {
        self.registry.subscribe_state_changes()
    }

    /// Stop both servers, then deactivate every module dependents-first
    pub async fn shutdown(self) -> Result<(), RegistryError> {
        info!("Shutting down module runtime");
        if let Some(server) = self.remote_server {
            server.shutdown().await;
        }
        self.namespace_server.shutdown().await;

        let result = self.registry.deactivate_all().await;
        match &result {
            Ok(()) => info!("Module runtime stopped"),
            Err(e) => error!("Module runtime stopped with errors: {}", e),
        }
        result
    }

    /// Serve until SIGINT/SIGTERM, then shut down
    pub async fn run_until_shutdown_signal(self) -> Result<(), RegistryError> {
        wait_for_shutdown_signal().await;
        self.shutdown().await
    }
}
