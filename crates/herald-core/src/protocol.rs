//! WebSocket subprotocols and the `{id, type, payload}` envelope.
//!
//! Two subprotocols are understood, negotiated through the
//! `Sec-WebSocket-Protocol` header:
//!
//! | concept | `graphql-transport-ws` | `graphql-ws` (legacy) |
//! |---|---|---|
//! | start operation | `subscribe` | `start` |
//! | data payload | `next` | `data` |
//! | operation done | `complete` | `complete` |
//! | client stop | `complete` | `stop` |
//! | keep-alive | `ping` / `pong` | `ka` |
//!
//! The router only needs the data tag and the completion tag; the rest is
//! handled by the WebSocket session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::graphql::{GraphQLError, GraphQLRequest};

/// `graphql-transport-ws` subprotocol name.
pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";
/// Legacy `subscriptions-transport-ws` subprotocol name.
pub const GRAPHQL_WS: &str = "graphql-ws";

/// Minimal wire message exchanged with a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Operation id, absent for connection-level messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Message tag from the negotiated subprotocol.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Connection-level envelope with no id or payload.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            payload: None,
        }
    }

    /// Envelope addressed to one operation.
    #[must_use]
    pub fn for_operation(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: kind.into(),
            payload: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serialize to the JSON text written on the socket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, kind = %self.kind, "failed to serialize envelope");
            String::new()
        })
    }
}

/// A decoded client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// Connection handshake, with the optional init payload.
    Init {
        /// Client-supplied connection parameters.
        payload: Option<Value>,
    },
    /// Start an operation.
    Subscribe {
        /// Client-chosen operation id.
        id: String,
        /// The GraphQL request to run.
        request: GraphQLRequest,
    },
    /// Stop an operation.
    Stop {
        /// Operation id to stop.
        id: String,
    },
    /// Client ping.
    Ping {
        /// Optional ping payload, echoed back in the pong.
        payload: Option<Value>,
    },
    /// Client pong (reply to a server ping).
    Pong,
    /// Client asks to close the connection.
    Terminate,
}

/// Description of one WebSocket subprotocol.
pub trait SubProtocol: Send + Sync + std::fmt::Debug {
    /// Name advertised in `Sec-WebSocket-Protocol`.
    fn name(&self) -> &'static str;

    /// Tag meaning "a data payload".
    fn next(&self) -> &'static str;

    /// Tag meaning "operation completed".
    fn complete(&self) -> &'static str;

    /// Tag for operation- or connection-level errors.
    fn error(&self) -> &'static str;

    /// Envelopes sent after a successful `connection_init`.
    fn init_responses(&self) -> Vec<Envelope>;

    /// Envelope sent on every keep-alive tick.
    fn keep_alive(&self) -> Envelope;

    /// Reply to a client ping, when the subprotocol has one.
    fn pong(&self, payload: Option<Value>) -> Option<Envelope>;

    /// Decode a client text frame.
    fn decode(&self, text: &str) -> Result<ClientMessage, ProtocolError>;

    /// Error envelope payload for the given errors.
    fn error_payload(&self, errors: &[GraphQLError]) -> Value {
        serde_json::to_value(errors).unwrap_or(Value::Null)
    }
}

/// The `graphql-transport-ws` subprotocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphqlTransportWs;

/// The legacy `graphql-ws` (subscriptions-transport-ws) subprotocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphqlWs;

static TRANSPORT_WS: GraphqlTransportWs = GraphqlTransportWs;
static LEGACY_WS: GraphqlWs = GraphqlWs;

/// Look up a subprotocol by its advertised name.
pub fn by_name(name: &str) -> Option<&'static dyn SubProtocol> {
    match name.trim() {
        GRAPHQL_TRANSPORT_WS => Some(&TRANSPORT_WS),
        GRAPHQL_WS => Some(&LEGACY_WS),
        _ => None,
    }
}

/// Pick the subprotocol for a connection from the client's offer.
///
/// The first supported name wins; clients that offer nothing (or nothing
/// known) get `graphql-transport-ws`.
pub fn negotiate<'a>(offered: impl IntoIterator<Item = &'a str>) -> &'static dyn SubProtocol {
    offered
        .into_iter()
        .flat_map(|header| header.split(','))
        .find_map(by_name)
        .unwrap_or(&TRANSPORT_WS)
}

/// Names of every supported subprotocol, in preference order.
pub fn supported() -> [&'static str; 2] {
    [GRAPHQL_TRANSPORT_WS, GRAPHQL_WS]
}

struct RawFrame {
    kind: String,
    id: Option<String>,
    payload: Option<Value>,
}

fn parse_frame(text: &str) -> Result<RawFrame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::InvalidJson("expected an object".into()));
    };
    let kind = match fields.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(ProtocolError::MissingType),
    };
    let id = match fields.remove("id") {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let payload = fields.remove("payload").filter(|p| !p.is_null());
    Ok(RawFrame { kind, id, payload })
}

fn require_id(frame: &RawFrame) -> Result<String, ProtocolError> {
    frame
        .id
        .clone()
        .ok_or_else(|| ProtocolError::MissingId(frame.kind.clone()))
}

fn subscribe_message(frame: RawFrame) -> Result<ClientMessage, ProtocolError> {
    let id = require_id(&frame)?;
    let payload = frame.payload.unwrap_or(Value::Null);
    let request = GraphQLRequest::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: frame.kind.clone(),
        id: id.clone(),
        reason: e.to_string(),
    })?;
    Ok(ClientMessage::Subscribe { id, request })
}

impl SubProtocol for GraphqlTransportWs {
    fn name(&self) -> &'static str {
        GRAPHQL_TRANSPORT_WS
    }

    fn next(&self) -> &'static str {
        "next"
    }

    fn complete(&self) -> &'static str {
        "complete"
    }

    fn error(&self) -> &'static str {
        "error"
    }

    fn init_responses(&self) -> Vec<Envelope> {
        vec![Envelope::new("connection_ack")]
    }

    fn keep_alive(&self) -> Envelope {
        Envelope::new("ping")
    }

    fn pong(&self, payload: Option<Value>) -> Option<Envelope> {
        let pong = Envelope::new("pong");
        Some(match payload {
            Some(p) => pong.with_payload(p),
            None => pong,
        })
    }

    fn decode(&self, text: &str) -> Result<ClientMessage, ProtocolError> {
        let frame = parse_frame(text)?;
        match frame.kind.as_str() {
            "connection_init" => Ok(ClientMessage::Init {
                payload: frame.payload,
            }),
            "subscribe" => subscribe_message(frame),
            "complete" => Ok(ClientMessage::Stop {
                id: require_id(&frame)?,
            }),
            "ping" => Ok(ClientMessage::Ping {
                payload: frame.payload,
            }),
            "pong" => Ok(ClientMessage::Pong),
            other => Err(ProtocolError::UnsupportedType(other.to_owned())),
        }
    }
}

impl SubProtocol for GraphqlWs {
    fn name(&self) -> &'static str {
        GRAPHQL_WS
    }

    fn next(&self) -> &'static str {
        "data"
    }

    fn complete(&self) -> &'static str {
        "complete"
    }

    fn error(&self) -> &'static str {
        "error"
    }

    fn init_responses(&self) -> Vec<Envelope> {
        vec![Envelope::new("connection_ack"), self.keep_alive()]
    }

    fn keep_alive(&self) -> Envelope {
        Envelope::new("ka")
    }

    fn pong(&self, _payload: Option<Value>) -> Option<Envelope> {
        None
    }

    fn decode(&self, text: &str) -> Result<ClientMessage, ProtocolError> {
        let frame = parse_frame(text)?;
        match frame.kind.as_str() {
            "connection_init" => Ok(ClientMessage::Init {
                payload: frame.payload,
            }),
            "start" => subscribe_message(frame),
            "stop" => Ok(ClientMessage::Stop {
                id: require_id(&frame)?,
            }),
            "connection_terminate" => Ok(ClientMessage::Terminate),
            other => Err(ProtocolError::UnsupportedType(other.to_owned())),
        }
    }

    /// The legacy protocol carries a single error object.
    fn error_payload(&self, errors: &[GraphQLError]) -> Value {
        errors
            .first()
            .and_then(|e| serde_json::to_value(e).ok())
            .unwrap_or(Value::Null)
    }
}
