//! Wire event definitions
//!
//! On the wire every event is an ordered `(name, args)` tuple. The name is
//! either a small integer reserved for system events or an application
//! chosen string. `NetworkEvent` is the typed view used everywhere else.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::CodecError;
use crate::state::{Map, Value};

/// Correlation id of a request/response pair
pub type RequestId = u32;

/// Reserved system event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemEvent {
    InitialData = 1,
    StateUpdate = 2,
    ClientConnectRequest = 3,
    Ping = 4,
    Request = 5,
    Response = 6,
    DisconnectionReason = 7,
}

impl SystemEvent {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(SystemEvent::InitialData),
            2 => Some(SystemEvent::StateUpdate),
            3 => Some(SystemEvent::ClientConnectRequest),
            4 => Some(SystemEvent::Ping),
            5 => Some(SystemEvent::Request),
            6 => Some(SystemEvent::Response),
            7 => Some(SystemEvent::DisconnectionReason),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            SystemEvent::InitialData => "INITIAL_DATA",
            SystemEvent::StateUpdate => "STATE_UPDATE",
            SystemEvent::ClientConnectRequest => "CLIENT_CONNECT_REQUEST",
            SystemEvent::Ping => "PING",
            SystemEvent::Request => "REQUEST",
            SystemEvent::Response => "RESPONSE",
            SystemEvent::DisconnectionReason => "DISCONNECTION_REASON",
        }
    }
}

/// Event identifier as it is serialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    System(u8),
    Named(String),
}

/// The ordered tuple that goes through the codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub name: EventName,
    pub args: Vec<Value>,
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectCode {
    /// Explicit, manual disconnect
    NoReason = 0,
    Timeout = 1,
    InvalidInitialData = 2,
    ConnectionFailure = 3,
    Throttler = 4,
}

impl DisconnectCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DisconnectCode::NoReason),
            1 => Some(DisconnectCode::Timeout),
            2 => Some(DisconnectCode::InvalidInitialData),
            3 => Some(DisconnectCode::ConnectionFailure),
            4 => Some(DisconnectCode::Throttler),
            _ => None,
        }
    }
}

/// Disconnection code plus human readable text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub code: DisconnectCode,
    pub text: String,
}

impl DisconnectReason {
    pub fn new(code: DisconnectCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// A disconnect requested by application code
    pub fn manual(text: impl Into<String>) -> Self {
        Self::new(DisconnectCode::NoReason, text)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.text, self.code)
    }
}

/// All events exchanged between a server and its clients
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Full state snapshot plus welcome data, sent once on activation
    InitialData { state: Arc<Map>, welcome: Value },
    /// Diff tree to merge into the client's mirror
    StateUpdate { diff: Arc<Map> },
    /// First message of a client, carrying application metadata
    ConnectRequest { metadata: Value },
    /// Keep-alive, no payload
    Ping,
    Request {
        name: String,
        id: RequestId,
        args: Vec<Value>,
    },
    Response { id: RequestId, result: Value },
    DisconnectionReason(DisconnectReason),
    /// Any application defined event
    App { name: String, args: Vec<Value> },
}

impl NetworkEvent {
    pub fn app(name: impl Into<String>, args: Vec<Value>) -> Self {
        NetworkEvent::App {
            name: name.into(),
            args,
        }
    }

    pub fn system_kind(&self) -> Option<SystemEvent> {
        match self {
            NetworkEvent::InitialData { .. } => Some(SystemEvent::InitialData),
            NetworkEvent::StateUpdate { .. } => Some(SystemEvent::StateUpdate),
            NetworkEvent::ConnectRequest { .. } => Some(SystemEvent::ClientConnectRequest),
            NetworkEvent::Ping => Some(SystemEvent::Ping),
            NetworkEvent::Request { .. } => Some(SystemEvent::Request),
            NetworkEvent::Response { .. } => Some(SystemEvent::Response),
            NetworkEvent::DisconnectionReason(_) => Some(SystemEvent::DisconnectionReason),
            NetworkEvent::App { .. } => None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.system_kind().is_some()
    }

    /// Name used in logs
    pub fn label(&self) -> &str {
        match self {
            NetworkEvent::App { name, .. } => name.as_str(),
            other => other.system_kind().map_or("?", SystemEvent::label),
        }
    }

    /// Flatten into the ordered wire tuple
    pub fn into_wire(self) -> WireEvent {
        let system = |kind: SystemEvent, args: Vec<Value>| WireEvent {
            name: EventName::System(kind.id()),
            args,
        };

        match self {
            NetworkEvent::InitialData { state, welcome } => {
                system(SystemEvent::InitialData, vec![Value::Map(state), welcome])
            }
            NetworkEvent::StateUpdate { diff } => {
                system(SystemEvent::StateUpdate, vec![Value::Map(diff)])
            }
            NetworkEvent::ConnectRequest { metadata } => {
                system(SystemEvent::ClientConnectRequest, vec![metadata])
            }
            NetworkEvent::Ping => system(SystemEvent::Ping, Vec::new()),
            NetworkEvent::Request { name, id, args } => {
                let mut wire_args = Vec::with_capacity(args.len() + 2);
                wire_args.push(Value::Str(name));
                wire_args.push(Value::from(id));
                wire_args.extend(args);
                system(SystemEvent::Request, wire_args)
            }
            NetworkEvent::Response { id, result } => {
                system(SystemEvent::Response, vec![Value::from(id), result])
            }
            NetworkEvent::DisconnectionReason(reason) => system(
                SystemEvent::DisconnectionReason,
                vec![
                    Value::from(u32::from(reason.code.code())),
                    Value::Str(reason.text),
                ],
            ),
            NetworkEvent::App { name, args } => WireEvent {
                name: EventName::Named(name),
                args,
            },
        }
    }

    /// Validate a wire tuple and lift it into a typed event
    pub fn from_wire(wire: WireEvent) -> Result<Self, CodecError> {
        let id = match wire.name {
            EventName::Named(name) => {
                return Ok(NetworkEvent::App {
                    name,
                    args: wire.args,
                })
            }
            EventName::System(id) => id,
        };

        let kind = SystemEvent::from_id(id).ok_or(CodecError::UnknownSystemEvent(id))?;
        let mut args = Arguments {
            kind,
            inner: wire.args.into_iter(),
        };

        let event = match kind {
            SystemEvent::InitialData => NetworkEvent::InitialData {
                state: args.map()?,
                welcome: args.optional(),
            },
            SystemEvent::StateUpdate => NetworkEvent::StateUpdate { diff: args.map()? },
            SystemEvent::ClientConnectRequest => NetworkEvent::ConnectRequest {
                metadata: args.optional(),
            },
            SystemEvent::Ping => NetworkEvent::Ping,
            SystemEvent::Request => NetworkEvent::Request {
                name: args.string()?,
                id: args.request_id()?,
                args: args.rest(),
            },
            SystemEvent::Response => NetworkEvent::Response {
                id: args.request_id()?,
                result: args.optional(),
            },
            SystemEvent::DisconnectionReason => {
                let code = args.int()?;
                let code = DisconnectCode::from_code(code)
                    .ok_or_else(|| args.malformed("unknown disconnection code"))?;
                NetworkEvent::DisconnectionReason(DisconnectReason::new(code, args.string()?))
            }
        };

        Ok(event)
    }
}

/// Positional argument reader for system events
struct Arguments {
    kind: SystemEvent,
    inner: std::vec::IntoIter<Value>,
}

impl Arguments {
    fn malformed(&self, detail: &'static str) -> CodecError {
        CodecError::MalformedEvent {
            event: self.kind.label(),
            detail,
        }
    }

    fn required(&mut self) -> Result<Value, CodecError> {
        self.inner
            .next()
            .ok_or_else(|| self.malformed("missing argument"))
    }

    fn optional(&mut self) -> Value {
        self.inner.next().unwrap_or_default()
    }

    fn map(&mut self) -> Result<Arc<Map>, CodecError> {
        match self.required()? {
            Value::Map(map) => Ok(map),
            _ => Err(self.malformed("expected a map")),
        }
    }

    fn string(&mut self) -> Result<String, CodecError> {
        match self.required()? {
            Value::Str(s) => Ok(s),
            _ => Err(self.malformed("expected a string")),
        }
    }

    fn int(&mut self) -> Result<i64, CodecError> {
        match self.required()? {
            Value::Int(i) => Ok(i),
            _ => Err(self.malformed("expected an integer")),
        }
    }

    fn request_id(&mut self) -> Result<RequestId, CodecError> {
        let raw = self.int()?;
        RequestId::try_from(raw).map_err(|_| self.malformed("request id out of range"))
    }

    fn rest(self) -> Vec<Value> {
        self.inner.collect()
    }
}
