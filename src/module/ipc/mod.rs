//! Remote access layer
//!
//! TCP servers that republish Active modules to other processes, a client
//! for calling them, and the length-delimited bincode protocol they share.

pub mod client;
pub mod namespace;
pub mod protocol;
pub mod server;
mod session;

pub use client::{RemoteClient, RemoteModule};
pub use namespace::{ModuleProxy, Namespace, NamespaceServer};
pub use protocol::{Argument, HandleId, MarshalMode, ModuleInfo, RemoteError};
pub use server::RemoteAccessServer;
pub use session::SessionPolicy;
