//! Same-host namespace
//!
//! `NamespaceServer` is the loopback-only sibling of the remote access
//! server: sessions always run by reference and every Active module is
//! visible, whatever its `allow_remote` flag. `Namespace` gives in-process
//! tooling the same view without any serialization at all.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::GlobalConfig;
use crate::module::graph::ModuleSpec;
use crate::module::ipc::protocol::RemoteError;
use crate::module::ipc::server::Listener;
use crate::module::ipc::session::SessionPolicy;
use crate::module::registry::ModuleRegistry;
use crate::module::traits::Module;
use crate::module::value::Value;

/// Loopback server for local client processes
pub struct NamespaceServer {
    listener: Listener,
}

impl NamespaceServer {
    /// Bind `127.0.0.1:port`; port 0 picks an ephemeral port
    pub async fn bind(
        port: u16,
        registry: ModuleRegistry,
        global: &GlobalConfig,
    ) -> std::io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let tcp = TcpListener::bind(addr).await?;
        let listener = Listener::spawn(tcp, registry, SessionPolicy::namespace(global), true)?;
        info!("Namespace server listening on {}", listener.local_addr());
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn active_sessions(&self) -> usize {
        self.listener.active_sessions()
    }

    pub async fn shutdown(self) {
        info!("Stopping namespace server on {}", self.local_addr());
        self.listener.shutdown().await;
    }
}

/// In-process view of the Active modules
#[derive(Clone)]
pub struct Namespace {
    registry: ModuleRegistry,
}

impl Namespace {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self { registry }
    }

    /// Names of the Active modules, sorted
    pub async fn names(&self) -> Vec<String> {
        self.registry.active_modules().await
    }

    /// Proxy for an Active module; never triggers activation
    pub async fn get(&self, name: &str) -> Result<ModuleProxy, RemoteError> {
        let active = self
            .registry
            .active_module(name)
            .await
            .ok_or_else(|| RemoteError::ModuleUnavailable(name.to_string()))?;
        Ok(ModuleProxy {
            spec: active.spec,
            instance: active.instance,
        })
    }
}

/// Direct reference to a live module instance
///
/// The proxy keeps the instance alive, but it does not keep the module
/// Active: after deactivation calls still reach the old instance.
#[derive(Clone)]
pub struct ModuleProxy {
    spec: Arc<ModuleSpec>,
    instance: Arc<dyn Module>,
}

impl ModuleProxy {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.instance.capabilities()
    }

    /// Call a capability; arguments are passed by reference and any
    /// mutation is visible to the caller
    pub async fn invoke(&self, method: &str, args: &mut [Value]) -> Result<Value, RemoteError> {
        self.instance
            .invoke(method, args)
            .await
            .map_err(|e| RemoteError::InvocationFailed(e.to_string()))
    }
}

impl fmt::Debug for ModuleProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleProxy")
            .field("name", &self.spec.name)
            .field("class_id", &self.spec.class_id)
            .finish()
    }
}
