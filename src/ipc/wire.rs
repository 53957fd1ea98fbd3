//! JSON-RPC 2.0 message shapes and byte-level (de)serialization.
//!
//! Messages are a three-case tagged union built only through the dedicated
//! constructors, so the dispatch and correlation layers can match on the
//! variant instead of probing optional fields. Parsing is strict about
//! structure but never fails loudly: anything that does not validate comes
//! back as `None` and the caller decides whether the connection survives.

use serde_json::{json, Map, Value};

/// Protocol version carried by every message.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Payload is not well-formed.
pub const PARSE_ERROR: i64 = -32700;
/// Structurally malformed request.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler registered for the requested method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Parameters did not match what the handler expects.
pub const INVALID_PARAMS: i64 = -32602;
/// Handler failed while executing.
pub const INTERNAL_ERROR: i64 = -32603;
/// Catch-all for failures a handler explicitly reports as its own.
pub const SERVER_ERROR: i64 = -32000;

/// Correlation id of one in-flight call within a connection.
///
/// `None` at the message level marks a notification. Numeric ids are `i64`
/// so the sequential counters both sides actually generate round-trip
/// exactly; string ids round-trip byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Int(i64),
    Str(String),
}

impl RequestId {
    fn to_value(&self) -> Value {
        match self {
            RequestId::Int(n) => json!(n),
            RequestId::Str(s) => json!(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Int(n as i64)
    }
}

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// One protocol message: a request, a success response or an error response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Option<RequestId>,
        method: String,
        params: Option<Value>,
    },
    Success {
        id: Option<RequestId>,
        result: Value,
    },
    Error {
        id: Option<RequestId>,
        error: RpcError,
    },
}

impl Message {
    /// Build a request. `id = None` makes it a notification.
    pub fn request(id: Option<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a success response.
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Message::Success { id, result }
    }

    /// Build an error response. `id = None` means the offending request's id
    /// could not be determined.
    pub fn error(
        id: Option<RequestId>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Message::Error {
            id,
            error: RpcError {
                code,
                message: message.into(),
                data,
            },
        }
    }

    /// The correlation id, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request { id, .. }
            | Message::Success { id, .. }
            | Message::Error { id, .. } => id.as_ref(),
        }
    }

    /// True for a request carrying no id.
    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Request { id: None, .. })
    }

    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(PROTOCOL_VERSION));
        match self {
            Message::Request { id, method, params } => {
                obj.insert("id".into(), id_value(id));
                obj.insert("method".into(), json!(method));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Message::Success { id, result } => {
                obj.insert("id".into(), id_value(id));
                obj.insert("result".into(), result.clone());
            }
            Message::Error { id, error } => {
                obj.insert("id".into(), id_value(id));
                let mut err = Map::new();
                err.insert("code".into(), json!(error.code));
                err.insert("message".into(), json!(error.message));
                if let Some(data) = &error.data {
                    err.insert("data".into(), data.clone());
                }
                obj.insert("error".into(), Value::Object(err));
            }
        }
        Value::Object(obj)
    }

    /// Serialize to the byte form that goes inside one frame.
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value())
    }

    /// Parse bytes back into a validated message.
    ///
    /// Returns `None` (never an error) for: bytes that do not decode, a
    /// non-object top level, a missing or non-matching `jsonrpc` field, a
    /// request without a string `method`, a response with neither `result`
    /// nor `error`, or an id that is not a number, string or null. A missing
    /// `id` member is treated like an explicit null.
    ///
    /// A response carrying both `result` and `error` is accepted and treated
    /// as a success. Deliberately permissive, kept as documented behavior.
    pub fn parse(bytes: &[u8]) -> Option<Message> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let obj = value.as_object()?;

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(PROTOCOL_VERSION) {
            return None;
        }

        let id = parse_id(obj.get("id"))?;

        if let Some(method) = obj.get("method") {
            let method = method.as_str()?.to_string();
            return Some(Message::Request {
                id,
                method,
                params: obj.get("params").cloned(),
            });
        }

        // Both present => success wins.
        if let Some(result) = obj.get("result") {
            return Some(Message::Success {
                id,
                result: result.clone(),
            });
        }

        if let Some(error) = obj.get("error") {
            let error = error.as_object()?;
            let code = error.get("code").and_then(Value::as_i64)?;
            let message = error.get("message").and_then(Value::as_str)?.to_string();
            return Some(Message::Error {
                id,
                error: RpcError {
                    code,
                    message,
                    data: error.get("data").cloned(),
                },
            });
        }

        None
    }

    /// Best-effort id recovery from a payload that failed [`Message::parse`].
    ///
    /// Used to decide whether a malformed request still deserves an error
    /// response or the connection is simply dropped.
    pub fn recover_id(bytes: &[u8]) -> Option<RequestId> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        match value.as_object()?.get("id")? {
            Value::Number(n) => n.as_i64().map(RequestId::Int),
            Value::String(s) => Some(RequestId::Str(s.clone())),
            _ => None,
        }
    }
}

fn id_value(id: &Option<RequestId>) -> Value {
    match id {
        Some(id) => id.to_value(),
        None => Value::Null,
    }
}

/// Validate the id member. Outer `None` means the id type is illegal;
/// inner `None` means notification.
#[allow(clippy::option_option)]
fn parse_id(raw: Option<&Value>) -> Option<Option<RequestId>> {
    match raw {
        None | Some(Value::Null) => Some(None),
        Some(Value::Number(n)) => n.as_i64().map(|n| Some(RequestId::Int(n))),
        Some(Value::String(s)) => Some(Some(RequestId::Str(s.clone()))),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.serialize().unwrap();
        assert_eq!(Message::parse(&bytes), Some(msg));
    }

    #[test]
    fn request_roundtrip_all_id_kinds() {
        roundtrip(Message::request(
            Some(RequestId::Int(7)),
            "list",
            Some(json!({"filter": "running"})),
        ));
        roundtrip(Message::request(
            Some(RequestId::Str("abc-1".into())),
            "start",
            None,
        ));
        roundtrip(Message::request(None, "daemon.shutdown", None));
    }

    #[test]
    fn response_roundtrip() {
        roundtrip(Message::success(Some(RequestId::Int(1)), json!([1, 2, 3])));
        roundtrip(Message::success(Some(RequestId::Int(2)), Value::Null));
        roundtrip(Message::error(
            Some(RequestId::Str("x".into())),
            SERVER_ERROR,
            "boom",
            Some(json!({"detail": true})),
        ));
        roundtrip(Message::error(None, PARSE_ERROR, "unparseable", None));
    }

    #[test]
    fn rejects_non_json_and_non_object() {
        assert_eq!(Message::parse(b"not json"), None);
        assert_eq!(Message::parse(b"[1,2,3]"), None);
        assert_eq!(Message::parse(b"42"), None);
    }

    #[test]
    fn rejects_wrong_or_missing_version() {
        assert_eq!(
            Message::parse(br#"{"jsonrpc":"1.0","id":1,"method":"list"}"#),
            None
        );
        assert_eq!(Message::parse(br#"{"id":1,"method":"list"}"#), None);
    }

    #[test]
    fn rejects_missing_method_and_missing_result_or_error() {
        assert_eq!(Message::parse(br#"{"jsonrpc":"2.0","id":1}"#), None);
    }

    #[test]
    fn rejects_illegal_id_types() {
        assert_eq!(
            Message::parse(br#"{"jsonrpc":"2.0","id":[1],"method":"list"}"#),
            None
        );
        assert_eq!(
            Message::parse(br#"{"jsonrpc":"2.0","id":{"n":1},"method":"list"}"#),
            None
        );
        assert_eq!(
            Message::parse(br#"{"jsonrpc":"2.0","id":true,"method":"list"}"#),
            None
        );
    }

    #[test]
    fn missing_id_is_a_notification() {
        let msg = Message::parse(br#"{"jsonrpc":"2.0","method":"tick"}"#).unwrap();
        assert!(msg.is_notification());
    }

    #[test]
    fn both_result_and_error_is_treated_as_success() {
        let msg = Message::parse(
            br#"{"jsonrpc":"2.0","id":1,"result":"ok","error":{"code":-32000,"message":"x"}}"#,
        )
        .unwrap();
        assert_eq!(msg, Message::success(Some(RequestId::Int(1)), json!("ok")));
    }

    #[test]
    fn error_response_requires_code_and_message() {
        assert_eq!(
            Message::parse(br#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000}}"#),
            None
        );
        assert_eq!(
            Message::parse(br#"{"jsonrpc":"2.0","id":1,"error":"nope"}"#),
            None
        );
    }

    #[test]
    fn id_recovery_from_malformed_payload() {
        assert_eq!(
            Message::recover_id(br#"{"id":9,"method":42}"#),
            Some(RequestId::Int(9))
        );
        assert_eq!(
            Message::recover_id(br#"{"id":"req-1"}"#),
            Some(RequestId::Str("req-1".into()))
        );
        assert_eq!(Message::recover_id(b"garbage"), None);
        assert_eq!(Message::recover_id(br#"{"id":null}"#), None);
    }
}
