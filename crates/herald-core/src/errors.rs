//! Error hierarchy for Herald.
//!
//! - [`HeraldError`]: top-level enum covering every error domain
//! - [`ProtocolError`]: a WebSocket frame that does not fit the negotiated subprotocol
//! - [`RequestParseError`]: an HTTP/GraphQL request body that cannot be understood
//! - [`ExecutionError`]: the GraphQL engine failed to resolve an operation
//!
//! None of these cross actor boundaries as failures. Routing misses are
//! silent no-ops and execution failures are turned into error payloads.

use thiserror::Error;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum HeraldError {
    /// Malformed client frame.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed GraphQL request.
    #[error("{0}")]
    Request(#[from] RequestParseError),

    /// GraphQL execution failure.
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// Socket or filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using [`HeraldError`].
pub type Result<T> = std::result::Result<T, HeraldError>;

/// A client frame that the negotiated subprotocol cannot decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not valid JSON.
    #[error("invalid message: {0}")]
    InvalidJson(String),

    /// Frame has no string `type` field.
    #[error("missing message type")]
    MissingType,

    /// Frame type is not part of the subprotocol.
    #[error("unsupported message type: {0}")]
    UnsupportedType(String),

    /// Operation frame without an `id`.
    #[error("missing operation id for {0}")]
    MissingId(String),

    /// Operation frame whose payload is not a GraphQL request.
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload {
        /// Frame type.
        kind: String,
        /// Operation id carried by the frame.
        id: String,
        /// Why the payload was rejected.
        reason: String,
    },
}

impl ProtocolError {
    /// Operation id of the rejected frame, when it carried one.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::InvalidPayload { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Why a GraphQL request could not be parsed.
#[derive(Debug, Error)]
pub enum RequestParseError {
    /// No `query` in the request.
    #[error("Missing query parameter")]
    MissingQuery,

    /// Request is JSON, but not shaped like a GraphQL request.
    #[error("Invalid GraphQL request form")]
    InvalidForm,

    /// Request body is not JSON.
    #[error("Unable to parse JSON")]
    InvalidJson(#[source] serde_json::Error),
}

/// Failure reported by the GraphQL execution engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The document failed parsing or validation.
    #[error("{0}")]
    Validation(String),

    /// A resolver failed.
    #[error("{0}")]
    Resolution(String),

    /// The operation cannot run over the requested transport.
    #[error("{0}")]
    Unsupported(String),
}

impl ExecutionError {
    /// Shorthand for a resolver failure.
    #[must_use]
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn execution_error_display_is_bare_message() {
        let err = ExecutionError::resolution("field exploded");
        assert_eq!(err.to_string(), "field exploded");
    }

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::UnsupportedType("bogus".into());
        assert_eq!(err.to_string(), "unsupported message type: bogus");
        let err = ProtocolError::MissingId("subscribe".into());
        assert_eq!(err.to_string(), "missing operation id for subscribe");
    }

    #[test]
    fn operation_id_only_for_payload_errors() {
        let err = ProtocolError::InvalidPayload {
            kind: "subscribe".into(),
            id: "7".into(),
            reason: "Invalid GraphQL request form".into(),
        };
        assert_eq!(err.operation_id(), Some("7"));
        assert_eq!(ProtocolError::MissingType.operation_id(), None);
        assert_eq!(ProtocolError::MissingId("subscribe".into()).operation_id(), None);
    }

    #[test]
    fn request_parse_error_messages() {
        assert_eq!(
            RequestParseError::MissingQuery.to_string(),
            "Missing query parameter"
        );
        assert_eq!(
            RequestParseError::InvalidForm.to_string(),
            "Invalid GraphQL request form"
        );
    }

    #[test]
    fn from_conversions() {
        let err: HeraldError = ProtocolError::MissingType.into();
        assert_matches!(err, HeraldError::Protocol(ProtocolError::MissingType));

        let err: HeraldError = ExecutionError::Validation("bad".into()).into();
        assert_matches!(err, HeraldError::Execution(_));
        assert_eq!(err.to_string(), "bad");
    }
}
