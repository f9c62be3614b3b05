//! Per-connection session
//!
//! A session reads framed requests, answers bookkeeping requests inline and
//! runs each invocation on its own task. Every outgoing frame goes through
//! one writer task fed by an mpsc channel, so invocations can answer out of
//! order. A session never changes module lifecycle state.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::module::ipc::protocol::{
    decode, encode, Argument, HandleId, MarshalMode, ModuleInfo, RemoteError, RemoteMessage,
    RequestMessage, RequestPayload, ResponseMessage, ResponsePayload,
};
use crate::module::registry::{ActiveModule, ModuleRegistry};
use crate::module::value::Value;

/// Fixed for the lifetime of a server; every session inherits it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub mode: MarshalMode,
    /// Sessions with no incoming frame for this long are closed
    pub idle_timeout: Duration,
    /// Upper bound on a single invocation
    pub call_timeout: Duration,
    /// Hide modules configured with `allow_remote = false`
    pub honor_allow_remote: bool,
}

impl SessionPolicy {
    /// Remote access: marshaling follows `force_remote_calls_by_value`
    pub fn remote(global: &GlobalConfig) -> Self {
        Self {
            mode: MarshalMode::from_force_by_value(global.force_remote_calls_by_value),
            idle_timeout: global.session_idle_timeout(),
            call_timeout: global.call_timeout(),
            honor_allow_remote: true,
        }
    }

    /// Same-host namespace: always by reference, every Active module visible
    pub fn namespace(global: &GlobalConfig) -> Self {
        Self {
            mode: MarshalMode::ByReference,
            idle_timeout: global.session_idle_timeout(),
            call_timeout: global.call_timeout(),
            honor_allow_remote: false,
        }
    }
}

const WRITER_GRACE: Duration = Duration::from_millis(250);

#[derive(Default)]
struct CallCounters {
    running: AtomicUsize,
    finished: AtomicUsize,
}

impl CallCounters {
    /// True while a call runs or if one finished since `seen` was taken
    fn busy_since(&self, seen: &mut usize) -> bool {
        let finished = self.finished.load(Ordering::SeqCst);
        let fresh = finished != *seen;
        *seen = finished;
        fresh || self.running.load(Ordering::SeqCst) > 0
    }
}

#[derive(Default)]
struct HandleTable {
    next: HandleId,
    values: HashMap<HandleId, Value>,
}

#[derive(Clone)]
pub(crate) struct Session {
    id: Uuid,
    peer: SocketAddr,
    registry: ModuleRegistry,
    policy: Arc<SessionPolicy>,
    handles: Arc<Mutex<HandleTable>>,
    /// Modules this session has looked up
    proxies: Arc<Mutex<BTreeSet<String>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub(crate) fn new(peer: SocketAddr, registry: ModuleRegistry, policy: Arc<SessionPolicy>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            registry,
            policy,
            handles: Arc::new(Mutex::new(HandleTable::default())),
            proxies: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Serve one connection until the peer leaves, goes idle or `shutdown` fires
    pub(crate) async fn run<S>(self, stream: S, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("Session {} opened for {} ({:?})", self.id, self.peer, self.policy.mode);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Bytes>();
        let session_id = self.id;
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    debug!("Session {} write failed: {}", session_id, e);
                    break;
                }
            }
        });

        // A session with a call in flight, or one that finished during the
        // last idle window, is not idle
        let calls = Arc::new(CallCounters::default());
        let mut finished_seen = 0;
        let mut handshaken = false;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Session {} closing for server shutdown", self.id);
                    break;
                }
                next = tokio::time::timeout(self.policy.idle_timeout, reader.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    if calls.busy_since(&mut finished_seen) {
                        continue;
                    }
                    info!(
                        "Session {} idle for {:?}, closing",
                        self.id, self.policy.idle_timeout
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("Session {} read failed: {}", self.id, e);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let request = match decode(&frame) {
                Ok(RemoteMessage::Request(request)) => request,
                Ok(RemoteMessage::Response(resp)) => {
                    let error = RemoteError::Protocol("clients may only send requests".to_string());
                    Self::reply(&outgoing_tx, ResponseMessage::error(resp.correlation_id, error));
                    continue;
                }
                Err(e) => {
                    warn!("Session {} sent an undecodable frame: {}", self.id, e);
                    break;
                }
            };

            if !handshaken {
                let handshake = matches!(request.payload, RequestPayload::Handshake { .. });
                let response = self.handshake(request);
                Self::reply(&outgoing_tx, response);
                if !handshake {
                    break;
                }
                handshaken = true;
                continue;
            }

            match request.payload {
                RequestPayload::Invoke {
                    module,
                    method,
                    args,
                } => {
                    // Results of calls still running at disconnect are dropped
                    // with the channel.
                    let session = self.clone();
                    let tx = outgoing_tx.clone();
                    let correlation_id = request.correlation_id;
                    let running = Arc::clone(&calls);
                    running.running.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let result = session
                            .invoke(&module, &method, args)
                            .await
                            .map(ResponsePayload::Value);
                        Self::reply(&tx, ResponseMessage::from_result(correlation_id, result));
                        running.finished.fetch_add(1, Ordering::SeqCst);
                        running.running.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                payload => {
                    let response = self.handle(RequestMessage {
                        correlation_id: request.correlation_id,
                        payload,
                    });
                    Self::reply(&outgoing_tx, response.await);
                }
            }
        }

        // Let queued responses drain; whatever is still running after the
        // grace period is discarded with the connection.
        drop(outgoing_tx);
        let mut writer_task = writer_task;
        if tokio::time::timeout(WRITER_GRACE, &mut writer_task).await.is_err() {
            writer_task.abort();
        }

        let proxies = locked(&self.proxies).len();
        let handles = {
            let mut table = locked(&self.handles);
            let held = table.values.len();
            table.values.clear();
            held
        };
        info!(
            "Session {} closed ({} proxies, {} handles released)",
            self.id, proxies, handles
        );
    }

    fn reply(tx: &mpsc::UnboundedSender<Bytes>, response: ResponseMessage) {
        match encode(&RemoteMessage::Response(response)) {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(e) => warn!("Failed to encode response: {}", e),
        }
    }

    fn handshake(&self, request: RequestMessage) -> ResponseMessage {
        match request.payload {
            RequestPayload::Handshake {
                client_name,
                version,
            } => {
                info!(
                    "Session {} handshake: client={}, version={}",
                    self.id, client_name, version
                );
                ResponseMessage::success(
                    request.correlation_id,
                    ResponsePayload::HandshakeAck {
                        server_version: env!("CARGO_PKG_VERSION").to_string(),
                        session_id: self.id.to_string(),
                        mode: self.policy.mode,
                    },
                )
            }
            other => ResponseMessage::error(
                request.correlation_id,
                RemoteError::Protocol(format!(
                    "first request must be a handshake, got {}",
                    other.kind()
                )),
            ),
        }
    }

    async fn handle(&self, request: RequestMessage) -> ResponseMessage {
        debug!("Session {} request {}", self.id, request.payload.kind());
        let result = match request.payload {
            RequestPayload::Handshake { .. } => {
                Err(RemoteError::Protocol("session already established".to_string()))
            }
            RequestPayload::ListModules => Ok(ResponsePayload::Modules(self.visible_modules().await)),
            RequestPayload::Lookup { module } => self.lookup(&module).await.map(ResponsePayload::Module),
            RequestPayload::Invoke {
                module,
                method,
                args,
            } => self
                .invoke(&module, &method, args)
                .await
                .map(ResponsePayload::Value),
            RequestPayload::Put { value } => self.put(value).map(ResponsePayload::Handle),
            RequestPayload::Fetch { handle } => self.fetch(handle).map(ResponsePayload::Value),
            RequestPayload::Release { handle } => self.release(handle).map(|()| ResponsePayload::Released),
            RequestPayload::Ping => Ok(ResponsePayload::Pong),
        };
        ResponseMessage::from_result(request.correlation_id, result)
    }

    fn visible(&self, module: &ActiveModule) -> bool {
        !self.policy.honor_allow_remote || module.spec.allow_remote
    }

    async fn visible_modules(&self) -> Vec<String> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .filter(|status| status.state.is_active())
            .filter(|status| !self.policy.honor_allow_remote || status.allow_remote)
            .map(|status| status.name)
            .collect()
    }

    /// Resolve an Active, visible module; never activates anything
    async fn resolve(&self, name: &str) -> Result<ActiveModule, RemoteError> {
        match self.registry.active_module(name).await {
            Some(module) if self.visible(&module) => Ok(module),
            _ => Err(RemoteError::ModuleUnavailable(name.to_string())),
        }
    }

    async fn lookup(&self, name: &str) -> Result<ModuleInfo, RemoteError> {
        let module = self.resolve(name).await?;
        locked(&self.proxies).insert(name.to_string());
        Ok(ModuleInfo {
            name: module.spec.name.clone(),
            tier: module.spec.tier,
            class_id: module.spec.class_id.clone(),
            capabilities: module.instance.capabilities(),
        })
    }

    fn require_by_reference(&self, what: &str) -> Result<(), RemoteError> {
        match self.policy.mode {
            MarshalMode::ByReference => Ok(()),
            MarshalMode::ByValue => Err(RemoteError::Protocol(format!(
                "{} requires a by-reference session",
                what
            ))),
        }
    }

    fn put(&self, value: Value) -> Result<HandleId, RemoteError> {
        self.require_by_reference("put")?;
        let mut table = locked(&self.handles);
        table.next += 1;
        let handle = table.next;
        table.values.insert(handle, value);
        Ok(handle)
    }

    fn fetch(&self, handle: HandleId) -> Result<Value, RemoteError> {
        self.require_by_reference("fetch")?;
        locked(&self.handles)
            .values
            .get(&handle)
            .cloned()
            .ok_or_else(|| RemoteError::Protocol(format!("unknown handle {}", handle)))
    }

    fn release(&self, handle: HandleId) -> Result<(), RemoteError> {
        self.require_by_reference("release")?;
        locked(&self.handles)
            .values
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| RemoteError::Protocol(format!("unknown handle {}", handle)))
    }

    async fn invoke(
        &self,
        module: &str,
        method: &str,
        args: Vec<Argument>,
    ) -> Result<Value, RemoteError> {
        let target = self.resolve(module).await?;

        let mut values = Vec::with_capacity(args.len());
        let mut bound: Vec<(usize, HandleId)> = Vec::new();
        for (position, arg) in args.into_iter().enumerate() {
            match arg {
                Argument::Value(value) => values.push(value),
                Argument::Ref(handle) => {
                    self.require_by_reference("a reference argument")?;
                    values.push(self.fetch(handle)?);
                    bound.push((position, handle));
                }
            }
        }

        // The call owns its arguments; in a by-value session they are the
        // decoded copies and are dropped afterwards.
        let instance = Arc::clone(&target.instance);
        let owned_method = method.to_string();
        let call = tokio::spawn(async move {
            let result = instance.invoke(&owned_method, &mut values).await;
            (result, values)
        });

        let (result, values) = match tokio::time::timeout(self.policy.call_timeout, call).await {
            Err(_) => {
                warn!(
                    "Session {}: {}.{} exceeded {:?}",
                    self.id, module, method, self.policy.call_timeout
                );
                return Err(RemoteError::Timeout);
            }
            Ok(Err(e)) => {
                return Err(RemoteError::InvocationFailed(format!(
                    "{}.{} aborted: {}",
                    module, method, e
                )))
            }
            Ok(Ok(outcome)) => outcome,
        };

        if !bound.is_empty() {
            let mut table = locked(&self.handles);
            for (position, handle) in bound {
                if let (Some(slot), Some(value)) = (table.values.get_mut(&handle), values.get(position)) {
                    *slot = value.clone();
                }
            }
        }

        result.map_err(|e| RemoteError::InvocationFailed(e.to_string()))
    }
}
