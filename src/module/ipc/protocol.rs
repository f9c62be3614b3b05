//! Remote access wire protocol
//!
//! Every frame is a u32 length prefix followed by a bincode-encoded
//! `RemoteMessage`. Requests carry a correlation id which the matching
//! response echoes back; invocations may complete out of order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module::graph::Tier;
use crate::module::value::Value;

/// Correlation ID for matching requests with responses
pub type CorrelationId = u64;

/// Identifier of a value held in a by-reference session's object table
pub type HandleId = u64;

/// Main wire message wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteMessage {
    /// Request from client to server
    Request(RequestMessage),
    /// Response from server to client
    Response(ResponseMessage),
}

/// How arguments cross the connection for a whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarshalMode {
    /// Arguments and results are copies; nothing aliases across the boundary
    ByValue,
    /// Values may live in the session's object table and be passed by handle
    ByReference,
}

impl MarshalMode {
    pub fn from_force_by_value(force: bool) -> Self {
        if force {
            MarshalMode::ByValue
        } else {
            MarshalMode::ByReference
        }
    }
}

/// One invocation argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    /// Copied into the call
    Value(Value),
    /// Names a value in the session's object table; mutations are kept
    Ref(HandleId),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub correlation_id: CorrelationId,
    pub payload: RequestPayload,
}

/// Request payload types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestPayload {
    /// Must be the first request of every connection
    Handshake {
        client_name: String,
        version: String,
    },
    /// Names of the modules reachable through this session
    ListModules,
    Lookup {
        module: String,
    },
    Invoke {
        module: String,
        method: String,
        args: Vec<Argument>,
    },
    /// Store a value in the object table (by-reference sessions only)
    Put {
        value: Value,
    },
    Fetch {
        handle: HandleId,
    },
    Release {
        handle: HandleId,
    },
    Ping,
}

impl RequestPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestPayload::Handshake { .. } => "handshake",
            RequestPayload::ListModules => "list_modules",
            RequestPayload::Lookup { .. } => "lookup",
            RequestPayload::Invoke { .. } => "invoke",
            RequestPayload::Put { .. } => "put",
            RequestPayload::Fetch { .. } => "fetch",
            RequestPayload::Release { .. } => "release",
            RequestPayload::Ping => "ping",
        }
    }
}

/// What a lookup returns about an Active module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub tier: Tier,
    pub class_id: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub correlation_id: CorrelationId,
    pub success: bool,
    pub payload: Option<ResponsePayload>,
    pub error: Option<RemoteError>,
}

/// Response payload types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    HandshakeAck {
        server_version: String,
        session_id: String,
        mode: MarshalMode,
    },
    Modules(Vec<String>),
    Module(ModuleInfo),
    Value(Value),
    Handle(HandleId),
    Released,
    Pong,
}

impl ResponseMessage {
    pub fn success(correlation_id: CorrelationId, payload: ResponsePayload) -> Self {
        Self {
            correlation_id,
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(correlation_id: CorrelationId, error: RemoteError) -> Self {
        Self {
            correlation_id,
            success: false,
            payload: None,
            error: Some(error),
        }
    }

    pub fn from_result(
        correlation_id: CorrelationId,
        result: Result<ResponsePayload, RemoteError>,
    ) -> Self {
        match result {
            Ok(payload) => Self::success(correlation_id, payload),
            Err(error) => Self::error(correlation_id, error),
        }
    }

    /// Collapse into the payload or the structured error
    pub fn into_result(self) -> Result<ResponsePayload, RemoteError> {
        match (self.success, self.payload, self.error) {
            (true, Some(payload), _) => Ok(payload),
            (false, _, Some(error)) => Err(error),
            _ => Err(RemoteError::Protocol("malformed response".to_string())),
        }
    }
}

/// Errors returned to remote callers; none of them change module state
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("Module unavailable: {0}")]
    ModuleUnavailable(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Call timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    Disconnected,
}

/// Encode a message into one frame body
pub fn encode(message: &RemoteMessage) -> Result<Bytes, RemoteError> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| RemoteError::Protocol(format!("encode failed: {}", e)))
}

/// Decode one frame body
pub fn decode(frame: &[u8]) -> Result<RemoteMessage, RemoteError> {
    bincode::deserialize(frame).map_err(|e| RemoteError::Protocol(format!("decode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_invoke_request_survives_encoding() {
        let mut settings = BTreeMap::new();
        settings.insert("gain".to_string(), Value::Float(1.5));
        settings.insert("channels".to_string(), Value::List(vec![Value::Int(1), Value::Int(2)]));
        let message = RemoteMessage::Request(RequestMessage {
            correlation_id: 7,
            payload: RequestPayload::Invoke {
                module: "scope".to_string(),
                method: "configure".to_string(),
                args: vec![Argument::Value(Value::Map(settings)), Argument::Ref(3)],
            },
        });

        let frame = encode(&message).unwrap();
        assert_eq!(decode(&frame).unwrap(), message);
    }

    #[test]
    fn test_error_response_into_result() {
        let resp = ResponseMessage::error(1, RemoteError::ModuleUnavailable("laser".into()));
        let frame = encode(&RemoteMessage::Response(resp)).unwrap();
        match decode(&frame).unwrap() {
            RemoteMessage::Response(resp) => assert_eq!(
                resp.into_result(),
                Err(RemoteError::ModuleUnavailable("laser".into()))
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(decode(&[0xff, 0xff, 0xff]), Err(RemoteError::Protocol(_))));
    }

    #[test]
    fn test_malformed_response() {
        let resp = ResponseMessage {
            correlation_id: 1,
            success: true,
            payload: None,
            error: None,
        };
        assert!(matches!(resp.into_result(), Err(RemoteError::Protocol(_))));
    }

    #[test]
    fn test_marshal_mode_from_flag() {
        assert_eq!(MarshalMode::from_force_by_value(true), MarshalMode::ByValue);
        assert_eq!(MarshalMode::from_force_by_value(false), MarshalMode::ByReference);
    }
}
