//! GraphQL request/response values exchanged with the execution engine.
//!
//! The engine itself is opaque; these are only the shapes that cross the
//! transport: a request (`query`, `operationName`, `variables`), a result
//! (`data`, `errors`) and the operation kind used to decide whether a
//! request is long-running.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ExecutionError, RequestParseError};

/// A GraphQL request as sent by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// The GraphQL document.
    pub query: String,
    /// Operation to run when the document holds several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Variable values keyed by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
}

impl GraphQLRequest {
    /// Request with only a query document.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: None,
        }
    }

    /// Parse a request from a raw JSON body.
    pub fn from_json(body: &[u8]) -> Result<Self, RequestParseError> {
        let value: Value = serde_json::from_slice(body).map_err(RequestParseError::InvalidJson)?;
        Self::from_value(value)
    }

    /// Parse a request from an already decoded JSON value.
    ///
    /// A missing `query` is reported separately from a badly shaped request
    /// so HTTP callers can pick the right status code.
    pub fn from_value(value: Value) -> Result<Self, RequestParseError> {
        let Value::Object(mut fields) = value else {
            return Err(RequestParseError::InvalidForm);
        };
        let query = match fields.remove("query") {
            Some(Value::String(q)) => q,
            None | Some(Value::Null) => return Err(RequestParseError::MissingQuery),
            Some(_) => return Err(RequestParseError::InvalidForm),
        };
        let operation_name = match fields.remove("operationName") {
            Some(Value::String(name)) => Some(name),
            None | Some(Value::Null) => None,
            Some(_) => return Err(RequestParseError::InvalidForm),
        };
        let variables = match fields.remove("variables") {
            Some(Value::Object(vars)) => Some(vars),
            None | Some(Value::Null) => None,
            Some(_) => return Err(RequestParseError::InvalidForm),
        };
        Ok(Self {
            query,
            operation_name,
            variables,
        })
    }

    /// Kind of the operation this request selects, if it can be determined.
    pub fn operation_kind(&self) -> Option<OperationKind> {
        OperationKind::detect(&self.query, self.operation_name.as_deref())
    }
}

/// A single GraphQL error entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// Human-readable description.
    pub message: String,
    /// Response path of the failing field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Engine-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    /// Error carrying only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }
}

/// Result of resolving one GraphQL operation (or one subscription event).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResult {
    /// Resolved data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Errors raised while resolving.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResult {
    /// Successful result.
    #[must_use]
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Result with no data and a single error entry.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: vec![GraphQLError::new(message)],
        }
    }

    /// Whether any error was reported.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Result as a JSON value, suitable for an envelope payload.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<ExecutionError> for GraphQLResult {
    fn from(err: ExecutionError) -> Self {
        Self::error(err.to_string())
    }
}

/// Kind of GraphQL operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Read-only, one result.
    Query,
    /// Write, one result.
    Mutation,
    /// Long-running, a result per event.
    Subscription,
}

impl OperationKind {
    /// Detect the kind of the selected operation in `document`.
    ///
    /// With `operation_name` the named operation is looked up, otherwise the
    /// first operation definition wins. Returns `None` when no matching
    /// operation definition exists. This is a top-level scan only; the
    /// engine still validates the document.
    pub fn detect(document: &str, operation_name: Option<&str>) -> Option<Self> {
        let operations = scan_operations(document);
        match operation_name {
            Some(wanted) => operations
                .into_iter()
                .find(|(_, name)| name.as_deref() == Some(wanted))
                .map(|(kind, _)| kind),
            None => operations.into_iter().next().map(|(kind, _)| kind),
        }
    }

    /// Whether results stream over time.
    pub fn is_long_running(self) -> bool {
        self == Self::Subscription
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Name(&'a str),
    Punct(u8),
    Other,
}

/// Operation definitions at the top level of a document, in order.
fn scan_operations(document: &str) -> Vec<(OperationKind, Option<String>)> {
    let mut operations: Vec<(OperationKind, Option<String>)> = Vec::new();
    let mut depth = 0usize;
    let mut parens = 0usize;
    let mut in_header = false;
    let mut expect_name = false;

    for token in tokenize(document) {
        let top_level = depth == 0 && parens == 0;
        match token {
            Token::Punct(b'(') => {
                parens += 1;
                expect_name = false;
            }
            Token::Punct(b')') => parens = parens.saturating_sub(1),
            Token::Punct(b'{') if parens == 0 => {
                if depth == 0 {
                    if !in_header {
                        operations.push((OperationKind::Query, None));
                    }
                    in_header = false;
                    expect_name = false;
                }
                depth += 1;
            }
            Token::Punct(b'}') if parens == 0 => depth = depth.saturating_sub(1),
            Token::Name(name) if top_level => {
                if expect_name {
                    if let Some(last) = operations.last_mut() {
                        last.1 = Some(name.to_owned());
                    }
                    expect_name = false;
                    continue;
                }
                if in_header {
                    continue;
                }
                let kind = match name {
                    "query" => OperationKind::Query,
                    "mutation" => OperationKind::Mutation,
                    "subscription" => OperationKind::Subscription,
                    _ => {
                        // fragment definitions and anything else until its `{`
                        in_header = true;
                        continue;
                    }
                };
                operations.push((kind, None));
                in_header = true;
                expect_name = true;
            }
            _ => {
                if top_level {
                    expect_name = false;
                }
            }
        }
    }
    operations
}

fn tokenize(document: &str) -> Vec<Token<'_>> {
    let bytes = document.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' | b',' => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'"' => {
                if bytes[i..].starts_with(b"\"\"\"") {
                    i += 3;
                    while i < bytes.len() && !bytes[i..].starts_with(b"\"\"\"") {
                        if bytes[i..].starts_with(b"\\\"\"\"") {
                            i += 4;
                        } else {
                            i += 1;
                        }
                    }
                    i = (i + 3).min(bytes.len());
                } else {
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b'\n' {
                        i += if bytes[i] == b'\\' { 2 } else { 1 };
                    }
                    i = (i + 1).min(bytes.len());
                }
                tokens.push(Token::Other);
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token::Name(&document[start..i]));
            }
            b'0'..=b'9' | b'-' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'.' | b'-' | b'+'))
                {
                    i += 1;
                }
                tokens.push(Token::Other);
            }
            b'{' | b'}' | b'(' | b')' => {
                tokens.push(Token::Punct(b));
                i += 1;
            }
            _ => {
                tokens.push(Token::Other);
                i += 1;
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn request_from_json_full() {
        let body = br#"{"query":"{ a }","operationName":"Op","variables":{"x":1}}"#;
        let req = GraphQLRequest::from_json(body).unwrap();
        assert_eq!(req.query, "{ a }");
        assert_eq!(req.operation_name.as_deref(), Some("Op"));
        assert_eq!(req.variables.unwrap()["x"], 1);
    }

    #[test]
    fn request_missing_query() {
        let err = GraphQLRequest::from_value(json!({"variables": {}})).unwrap_err();
        assert_matches!(err, RequestParseError::MissingQuery);
        let err = GraphQLRequest::from_value(json!({"query": null})).unwrap_err();
        assert_matches!(err, RequestParseError::MissingQuery);
    }

    #[test]
    fn request_invalid_form() {
        assert_matches!(
            GraphQLRequest::from_value(json!([1, 2])),
            Err(RequestParseError::InvalidForm)
        );
        assert_matches!(
            GraphQLRequest::from_value(json!({"query": 42})),
            Err(RequestParseError::InvalidForm)
        );
        assert_matches!(
            GraphQLRequest::from_value(json!({"query": "{a}", "variables": "x"})),
            Err(RequestParseError::InvalidForm)
        );
    }

    #[test]
    fn request_invalid_json() {
        assert_matches!(
            GraphQLRequest::from_json(b"not json"),
            Err(RequestParseError::InvalidJson(_))
        );
    }

    #[test]
    fn request_serializes_camel_case() {
        let mut req = GraphQLRequest::new("query Q { a }");
        req.operation_name = Some("Q".into());
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["operationName"], "Q");
        assert!(value.get("variables").is_none());
    }

    #[test]
    fn result_error_shape() {
        let result = GraphQLResult::error("boom");
        assert!(result.has_errors());
        assert_eq!(result.to_value(), json!({"errors": [{"message": "boom"}]}));
    }

    #[test]
    fn result_data_shape() {
        let result = GraphQLResult::data(json!({"hello": "world"}));
        assert_eq!(result.to_value(), json!({"data": {"hello": "world"}}));
    }

    #[test]
    fn result_from_execution_error() {
        let result: GraphQLResult = ExecutionError::resolution("no such field").into();
        assert_eq!(result.errors[0].message, "no such field");
        assert!(result.data.is_none());
    }

    #[test]
    fn detect_shorthand_query() {
        assert_eq!(
            OperationKind::detect("{ hello }", None),
            Some(OperationKind::Query)
        );
    }

    #[test]
    fn detect_keywords() {
        assert_eq!(
            OperationKind::detect("mutation { add }", None),
            Some(OperationKind::Mutation)
        );
        assert_eq!(
            OperationKind::detect("subscription OnChat { chat }", None),
            Some(OperationKind::Subscription)
        );
    }

    #[test]
    fn detect_by_operation_name() {
        let doc = r#"
            query Feed { posts { id } }
            subscription Live($room: String = "lobby") { chat(room: $room) { text } }
        "#;
        assert_eq!(
            OperationKind::detect(doc, Some("Live")),
            Some(OperationKind::Subscription)
        );
        assert_eq!(
            OperationKind::detect(doc, Some("Feed")),
            Some(OperationKind::Query)
        );
        assert_eq!(OperationKind::detect(doc, Some("Missing")), None);
        assert_eq!(OperationKind::detect(doc, None), Some(OperationKind::Query));
    }

    #[test]
    fn detect_skips_fragments_comments_and_strings() {
        let doc = r#"
            # subscription in a comment
            fragment F on Message { text }
            subscription S($filter: Filter = {room: "x { y"}) @live { chat { ...F } }
        "#;
        assert_eq!(
            OperationKind::detect(doc, None),
            Some(OperationKind::Subscription)
        );
    }

    #[test]
    fn detect_nothing_in_empty_document() {
        assert_eq!(OperationKind::detect("   # only a comment", None), None);
    }

    #[test]
    fn request_operation_kind() {
        let req = GraphQLRequest::new("subscription { tick }");
        assert!(req.operation_kind().unwrap().is_long_running());
    }
}
