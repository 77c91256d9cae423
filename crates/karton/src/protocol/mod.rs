use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod value;

pub use value::Value;

use crate::{KartonError, KartonResult};

/// Messages exchanged in both directions over a Karton connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    /// Invoke a procedure registered by the peer
    RpcCall {
        call_id: String,
        procedure_path: Vec<String>,
        parameters: Vec<Value>,
    },
    /// Successful result of an earlier call
    RpcReturn { call_id: String, value: Value },
    /// Failed result of an earlier call
    RpcException { call_id: String, error: ErrorObject },
    /// Full replacement of the replicated state
    StateSync { state: Value },
    /// Incremental update of the replicated state, applied in order
    StatePatch { patch: Vec<PatchOperation> },
}

impl Message {
    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RpcCall { .. } => "rpc_call",
            Message::RpcReturn { .. } => "rpc_return",
            Message::RpcException { .. } => "rpc_exception",
            Message::StateSync { .. } => "state_sync",
            Message::StatePatch { .. } => "state_patch",
        }
    }

    /// Call id carried by RPC messages
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Message::RpcCall { call_id, .. }
            | Message::RpcReturn { call_id, .. }
            | Message::RpcException { call_id, .. } => Some(call_id),
            Message::StateSync { .. } | Message::StatePatch { .. } => None,
        }
    }
}

/// One step of a path into a state value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{}", index),
            PathSegment::Key(key) => f.write_str(key),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Render a path as `/a/0/b` for logs and errors
pub fn format_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|segment| format!("/{}", segment)).collect()
}

/// Represents a change operation on the replicated state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Insert a new object key or array element
    Add { path: Vec<PathSegment>, value: Value },
    /// Overwrite an existing value
    Replace { path: Vec<PathSegment>, value: Value },
    /// Delete an object key or array element
    Remove { path: Vec<PathSegment> },
}

impl PatchOperation {
    /// Target path of the operation
    pub fn path(&self) -> &[PathSegment] {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Remove { path } => path,
        }
    }
}

/// Wire form of an exception: name, message and any extra fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default = "default_error_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl ErrorObject {
    /// Create an error object with no extra fields
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Attach an extra field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up an extra field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorObject {}

impl From<KartonError> for ErrorObject {
    fn from(error: KartonError) -> Self {
        let message = error.to_string();
        match error {
            KartonError::Remote(remote) => remote,
            KartonError::ProcedureNotFound { path } => {
                ErrorObject::new("ProcedureNotFound", message).with_field("path", path)
            }
            KartonError::ConnectionLost {
                procedure,
                correlation_id,
                ..
            } => ErrorObject::new("ConnectionLost", message)
                .with_field("procedure", procedure)
                .with_field("sessionId", correlation_id),
            KartonError::ClientNotFound { session_id } => {
                ErrorObject::new("ClientNotFound", message).with_field("sessionId", session_id)
            }
            KartonError::ConnectionClosed => ErrorObject::new("ConnectionClosed", message),
            KartonError::MalformedMessage { .. } => ErrorObject::new("MalformedMessage", message),
            KartonError::InvalidPatch { .. } => ErrorObject::new("InvalidPatch", message),
            KartonError::Serialization(_) => ErrorObject::new("SerializationError", message),
            KartonError::WebSocket(_) => ErrorObject::new("WebSocketError", message),
            KartonError::Internal(_) => ErrorObject::new("InternalError", message),
        }
    }
}

/// A single frame on the underlying duplex socket
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Orderly shutdown with an optional reason
    Close(Option<String>),
}

/// Encode a message as JSON text
pub fn encode_text(message: &Message) -> KartonResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Encode a message using lib0 format
pub fn encode_message(message: &Message) -> KartonResult<Vec<u8>> {
    let json = encode_text(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from JSON text
pub fn decode_text(text: &str) -> KartonResult<Message> {
    serde_json::from_str(text).map_err(|e| KartonError::malformed(e.to_string()))
}

/// Decode a message from lib0 format
pub fn decode_message(data: &[u8]) -> KartonResult<Message> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json = lib0::decoding::Read::read_string(&mut decoder)
        .map_err(|e| KartonError::malformed(format!("Failed to decode lib0 string: {}", e)))?;

    decode_text(json)
}

/// Decode a binary frame holding either bare UTF-8 JSON or a lib0 string
pub fn decode_binary(data: &[u8]) -> KartonResult<Message> {
    match std::str::from_utf8(data) {
        Ok(text) if text.starts_with('{') => {
            decode_text(text).or_else(|_| decode_message(data))
        }
        _ => decode_message(data),
    }
}

/// Encode a message into the frame sent on the socket: one JSON text frame,
/// no length prefix
pub fn encode_frame(message: &Message) -> KartonResult<Frame> {
    encode_text(message).map(Frame::Text)
}

/// Decode a data frame; close frames carry no message
pub fn decode_frame(frame: &Frame) -> KartonResult<Message> {
    match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(data) => decode_binary(data),
        Frame::Close(_) => Err(KartonError::malformed("close frame carries no message")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_rpc_call_wire_shape() {
        let message = Message::RpcCall {
            call_id: "c1".to_string(),
            procedure_path: vec!["todos".to_string(), "add".to_string()],
            parameters: vec![Value::from("milk"), Value::Undefined],
        };

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "rpc_call",
                "data": {
                    "callId": "c1",
                    "procedurePath": ["todos", "add"],
                    "parameters": ["milk", {"$undefined": true}]
                }
            })
        );
    }

    #[test]
    fn test_state_patch_wire_shape() {
        let message = Message::StatePatch {
            patch: vec![
                PatchOperation::Replace {
                    path: vec!["counter".into()],
                    value: Value::from(1),
                },
                PatchOperation::Remove {
                    path: vec!["todos".into(), 0usize.into()],
                },
            ],
        };

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "state_patch",
                "data": {
                    "patch": [
                        {"op": "replace", "path": ["counter"], "value": 1},
                        {"op": "remove", "path": ["todos", 0]}
                    ]
                }
            })
        );
    }

    #[test]
    fn test_exception_flattens_extra_fields() {
        let message = Message::RpcException {
            call_id: "c2".to_string(),
            error: ErrorObject::new("ValidationError", "title is empty").with_field("field", "title"),
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded["data"]["error"],
            json!({"name": "ValidationError", "message": "title is empty", "field": "title"})
        );

        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_lib0_round_trip_with_extended_values() {
        let mut state = Value::object();
        state.set(
            "updatedAt",
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        );
        state.set("ratio", Value::Number(f64::NAN));
        state.set("limit", Value::Number(f64::INFINITY));
        state.set("cleared", Value::Undefined);
        state.set(
            "index",
            Value::Map(vec![(
                Value::from("k"),
                Value::Set(vec![Value::from(1), Value::from(2)]),
            )]),
        );
        let message = Message::StateSync { state };

        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);

        let text = encode_text(&message).unwrap();
        assert_eq!(decode_frame(&Frame::Text(text)).unwrap(), message);
    }

    #[test]
    fn test_frames_are_bare_json_text() {
        let message = Message::RpcReturn {
            call_id: "c3".to_string(),
            value: Value::from(42),
        };

        let frame = encode_frame(&message).unwrap();
        match &frame {
            Frame::Text(text) => {
                let raw: serde_json::Value = serde_json::from_str(text).unwrap();
                assert_eq!(raw["type"], json!("rpc_return"));
                assert_eq!(raw["data"]["value"], json!(42));
            }
            other => panic!("Expected a text frame, got: {:?}", other),
        }
        assert_eq!(decode_frame(&frame).unwrap(), message);

        // Binary frames may carry the same JSON as UTF-8, or a lib0 string
        let utf8 = Frame::Binary(encode_text(&message).unwrap().into_bytes());
        assert_eq!(decode_frame(&utf8).unwrap(), message);
        let lib0 = Frame::Binary(encode_message(&message).unwrap());
        assert_eq!(decode_frame(&lib0).unwrap(), message);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = decode_text("{not json").unwrap_err();
        assert!(matches!(err, KartonError::MalformedMessage { .. }));

        let err = decode_message(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, KartonError::MalformedMessage { .. }));
    }

    #[test]
    fn test_missing_or_unknown_tag_is_malformed() {
        let err = decode_text(r#"{"data": {"state": 1}}"#).unwrap_err();
        assert!(matches!(err, KartonError::MalformedMessage { .. }));

        let err = decode_text(r#"{"type": "state_merge", "data": {"state": 1}}"#).unwrap_err();
        assert!(matches!(err, KartonError::MalformedMessage { .. }));
    }

    #[test]
    fn test_procedure_not_found_error_object() {
        let error = ErrorObject::from(KartonError::ProcedureNotFound {
            path: "a.b".to_string(),
        });
        assert_eq!(error.name, "ProcedureNotFound");
        assert_eq!(error.field("path"), Some(&Value::from("a.b")));
    }

    #[test]
    fn test_format_path() {
        assert_eq!(format_path(&[]), "/");
        assert_eq!(format_path(&["todos".into(), 3usize.into()]), "/todos/3");
    }
}
