//! Remote access server
//!
//! Republishes the Active-module namespace over TCP. Each accepted
//! connection becomes a session; the marshaling mode of every session is
//! taken from the policy fixed when the server started.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::module::ipc::protocol::MarshalMode;
use crate::module::ipc::session::{Session, SessionPolicy};
use crate::module::registry::ModuleRegistry;

/// Accept loop shared by the remote and namespace servers
pub(crate) struct Listener {
    local_addr: SocketAddr,
    policy: Arc<SessionPolicy>,
    shutdown: CancellationToken,
    sessions: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn spawn(
        listener: TcpListener,
        registry: ModuleRegistry,
        policy: SessionPolicy,
        loopback_only: bool,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let policy = Arc::new(policy);
        let shutdown = CancellationToken::new();
        let sessions = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            Arc::clone(&policy),
            shutdown.clone(),
            Arc::clone(&sessions),
            loopback_only,
        ));

        Ok(Self {
            local_addr,
            policy,
            shutdown,
            sessions,
            accept_task,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: ModuleRegistry,
        policy: Arc<SessionPolicy>,
        shutdown: CancellationToken,
        sessions: Arc<AtomicUsize>,
        loopback_only: bool,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            if loopback_only && !peer.ip().is_loopback() {
                warn!("Rejecting non-local connection from {}", peer);
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }

            let session = Session::new(peer, registry.clone(), Arc::clone(&policy));
            let token = shutdown.child_token();
            let counter = Arc::clone(&sessions);
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                session.run(stream, token).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub(crate) fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Stop accepting and close every open session
    pub(crate) async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
    }
}

/// TCP server publishing Active modules to other processes
pub struct RemoteAccessServer {
    listener: Listener,
}

impl RemoteAccessServer {
    /// Bind and start accepting
    ///
    /// Port 0 picks an ephemeral port; see `local_addr`.
    pub async fn bind(
        addr: SocketAddr,
        registry: ModuleRegistry,
        policy: SessionPolicy,
    ) -> std::io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let listener = Listener::spawn(tcp, registry, policy, false)?;
        info!(
            "Remote access server listening on {} ({:?})",
            listener.local_addr(),
            listener.policy().mode
        );
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Marshaling mode every session of this server uses
    pub fn mode(&self) -> MarshalMode {
        self.listener.policy().mode
    }

    pub fn active_sessions(&self) -> usize {
        self.listener.active_sessions()
    }

    pub async fn shutdown(self) {
        info!("Stopping remote access server on {}", self.local_addr());
        self.listener.shutdown().await;
    }
}
