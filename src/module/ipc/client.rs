//! Remote access client
//!
//! Client side of the wire protocol, for processes that want to call modules
//! hosted by a `RemoteAccessServer` or `NamespaceServer`. Requests are
//! sent one at a time over a single connection.

use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use crate::module::ipc::protocol::{
    decode, encode, Argument, CorrelationId, HandleId, MarshalMode, ModuleInfo, RemoteError,
    RemoteMessage, RequestMessage, RequestPayload, ResponsePayload,
};
use crate::module::value::Value;

struct Connection {
    reader: FramedRead<tokio::io::ReadHalf<TcpStream>, LengthDelimitedCodec>,
    writer: FramedWrite<tokio::io::WriteHalf<TcpStream>, LengthDelimitedCodec>,
    next_correlation_id: CorrelationId,
}

impl Connection {
    async fn request(&mut self, payload: RequestPayload) -> Result<ResponsePayload, RemoteError> {
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);

        let frame = encode(&RemoteMessage::Request(RequestMessage {
            correlation_id,
            payload,
        }))?;
        self.writer
            .send(frame)
            .await
            .map_err(|_| RemoteError::Disconnected)?;

        let bytes = self
            .reader
            .next()
            .await
            .ok_or(RemoteError::Disconnected)?
            .map_err(|_| RemoteError::Disconnected)?;

        match decode(&bytes)? {
            RemoteMessage::Response(resp) if resp.correlation_id == correlation_id => {
                resp.into_result()
            }
            RemoteMessage::Response(resp) => Err(RemoteError::Protocol(format!(
                "correlation ID mismatch: expected {}, got {}",
                correlation_id, resp.correlation_id
            ))),
            RemoteMessage::Request(_) => Err(RemoteError::Protocol(
                "server sent a request".to_string(),
            )),
        }
    }
}

fn unexpected(payload: ResponsePayload) -> RemoteError {
    RemoteError::Protocol(format!("unexpected response payload: {:?}", payload))
}

/// Handle to one remote session; clones share the connection
#[derive(Clone)]
pub struct RemoteClient {
    connection: Arc<Mutex<Connection>>,
    mode: MarshalMode,
    session_id: String,
    server_version: String,
}

impl RemoteClient {
    /// Connect and perform the handshake
    pub async fn connect<A: ToSocketAddrs>(addr: A, client_name: &str) -> Result<Self, RemoteError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| RemoteError::Disconnected)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut connection = Connection {
            reader: FramedRead::new(read_half, LengthDelimitedCodec::new()),
            writer: FramedWrite::new(write_half, LengthDelimitedCodec::new()),
            next_correlation_id: 1,
        };

        let ack = connection
            .request(RequestPayload::Handshake {
                client_name: client_name.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .await?;
        match ack {
            ResponsePayload::HandshakeAck {
                server_version,
                session_id,
                mode,
            } => {
                debug!("Connected to session {} ({:?})", session_id, mode);
                Ok(Self {
                    connection: Arc::new(Mutex::new(connection)),
                    mode,
                    session_id,
                    server_version,
                })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Marshaling mode the server fixed for this session
    pub fn mode(&self) -> MarshalMode {
        self.mode
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    async fn request(&self, payload: RequestPayload) -> Result<ResponsePayload, RemoteError> {
        self.connection.lock().await.request(payload).await
    }

    pub async fn list_modules(&self) -> Result<Vec<String>, RemoteError> {
        match self.request(RequestPayload::ListModules).await? {
            ResponsePayload::Modules(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    /// Look up an Active module and return a proxy for it
    pub async fn lookup(&self, module: &str) -> Result<RemoteModule, RemoteError> {
        match self
            .request(RequestPayload::Lookup {
                module: module.to_string(),
            })
            .await?
        {
            ResponsePayload::Module(info) => Ok(RemoteModule {
                info,
                client: self.clone(),
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn invoke(
        &self,
        module: &str,
        method: &str,
        args: Vec<Argument>,
    ) -> Result<Value, RemoteError> {
        match self
            .request(RequestPayload::Invoke {
                module: module.to_string(),
                method: method.to_string(),
                args,
            })
            .await?
        {
            ResponsePayload::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Store a value server-side (by-reference sessions only)
    pub async fn put(&self, value: Value) -> Result<HandleId, RemoteError> {
        match self.request(RequestPayload::Put { value }).await? {
            ResponsePayload::Handle(handle) => Ok(handle),
            other => Err(unexpected(other)),
        }
    }

    pub async fn fetch(&self, handle: HandleId) -> Result<Value, RemoteError> {
        match self.request(RequestPayload::Fetch { handle }).await? {
            ResponsePayload::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn release(&self, handle: HandleId) -> Result<(), RemoteError> {
        match self.request(RequestPayload::Release { handle }).await? {
            ResponsePayload::Released => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<(), RemoteError> {
        match self.request(RequestPayload::Ping).await? {
            ResponsePayload::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Proxy for one module of a remote session
#[derive(Clone)]
pub struct RemoteModule {
    info: ModuleInfo,
    client: RemoteClient,
}

impl RemoteModule {
    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub async fn invoke(&self, method: &str, args: Vec<Argument>) -> Result<Value, RemoteError> {
        self.client.invoke(&self.info.name, method, args).await
    }

    /// Invoke with plain values; the caller's copies are never touched
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<Value, RemoteError> {
        let args = args.iter().cloned().map(Argument::Value).collect();
        self.invoke(method, args).await
    }
}

impl fmt::Debug for RemoteModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteModule")
            .field("info", &self.info)
            .field("session_id", &self.client.session_id)
            .finish()
    }
}
