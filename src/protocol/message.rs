//! JSON-RPC 2.0 message types and the wire codec
//!
//! The codec is strict and side-effect free: every frame either decodes into
//! exactly one [`Message`] variant or fails with a decode error. Shape
//! detection follows the wire contract: `method` without `id` is a
//! notification, `method` with `id` is a request, `id` with exactly one of
//! `result`/`error` is a response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Wire protocol version discriminator, mandatory on every frame
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier: a string or an integer, unique per sender while
/// the request is outstanding
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl RequestId {
    /// Parse an id out of a raw JSON value; only strings and integers are legal.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(RequestId::String(s.clone())),
            Value::Number(n) => n
                .as_i64()
                .map(RequestId::Number)
                .ok_or_else(|| Error::Decode(format!("non-integer request id: {}", n))),
            other => Err(Error::Decode(format!(
                "request id must be a string or integer, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::Number((*n).into()),
            RequestId::String(s) => Value::String(s.clone()),
        }
    }
}

/// Error object carried by an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: &str, data: Value) -> Self {
        Self {
            code,
            message: message.to_string(),
            data: Some(data),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            crate::protocol::error_codes::METHOD_NOT_FOUND,
            &format!("Method '{}' not found", method),
        )
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self::new(crate::protocol::error_codes::INVALID_PARAMS, detail)
    }

    pub fn internal(detail: &str) -> Self {
        Self::new(crate::protocol::error_codes::INTERNAL_ERROR, detail)
    }
}

/// A request expecting exactly one response or error response
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A successful response correlated to a request by id
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// An error response correlated to a request by id
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: RequestId,
    pub error: RpcError,
}

/// A one-way message; no response is ever produced
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// The protocol message union
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
    Notification(Notification),
}

impl Message {
    pub fn request(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Message::Request(Request {
            id,
            method: method.to_string(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Message::Response(Response { id, result })
    }

    pub fn error_response(id: RequestId, error: RpcError) -> Self {
        Message::Error(ErrorResponse { id, error })
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.to_string(),
            params,
        })
    }

    /// The correlation id, when the variant carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => Some(&e.id),
            Message::Notification(_) => None,
        }
    }

    /// The method name, when the variant carries one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }
}

/// Encode a message into a single-line JSON frame.
pub fn encode(message: &Message) -> Result<String> {
    let value = match message {
        Message::Request(r) => {
            let mut obj = json_base();
            obj.insert("id".to_string(), r.id.to_value());
            obj.insert("method".to_string(), Value::String(r.method.clone()));
            if let Some(params) = &r.params {
                obj.insert("params".to_string(), params.clone());
            }
            Value::Object(obj)
        }
        Message::Response(r) => {
            let mut obj = json_base();
            obj.insert("id".to_string(), r.id.to_value());
            obj.insert("result".to_string(), r.result.clone());
            Value::Object(obj)
        }
        Message::Error(e) => {
            let mut obj = json_base();
            obj.insert("id".to_string(), e.id.to_value());
            obj.insert("error".to_string(), serde_json::to_value(&e.error)?);
            Value::Object(obj)
        }
        Message::Notification(n) => {
            let mut obj = json_base();
            obj.insert("method".to_string(), Value::String(n.method.clone()));
            if let Some(params) = &n.params {
                obj.insert("params".to_string(), params.clone());
            }
            Value::Object(obj)
        }
    };
    Ok(serde_json::to_string(&value)?)
}

fn json_base() -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert(
        "jsonrpc".to_string(),
        Value::String(JSONRPC_VERSION.to_string()),
    );
    obj
}

/// Decode a single frame into a message.
///
/// Rejects malformed structure outright; never coerces an ambiguous shape
/// into the nearest variant.
pub fn decode(frame: &str) -> Result<Message> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| Error::Decode(format!("invalid JSON: {}", e)))?;

    let obj = match value {
        Value::Object(obj) => obj,
        Value::Array(_) => {
            return Err(Error::Decode("batch frames are not supported".to_string()))
        }
        other => {
            return Err(Error::Decode(format!(
                "frame must be a JSON object, got {}",
                other
            )))
        }
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(Error::Decode(format!(
                "unsupported protocol version '{}'",
                other
            )))
        }
        None => return Err(Error::Decode("missing jsonrpc discriminator".to_string())),
    }

    let id = obj.get("id").map(RequestId::from_value).transpose()?;
    let method = obj.get("method").and_then(Value::as_str);
    let result = obj.get("result");
    let error = obj.get("error");

    match (method, id, result, error) {
        (Some(method), Some(id), None, None) => Ok(Message::Request(Request {
            id,
            method: method.to_string(),
            params: obj.get("params").cloned(),
        })),
        (Some(method), None, None, None) => Ok(Message::Notification(Notification {
            method: method.to_string(),
            params: obj.get("params").cloned(),
        })),
        (None, Some(id), Some(result), None) => Ok(Message::Response(Response {
            id,
            result: result.clone(),
        })),
        (None, Some(id), None, Some(error)) => {
            let error: RpcError = serde_json::from_value(error.clone())
                .map_err(|e| Error::Decode(format!("malformed error object: {}", e)))?;
            Ok(Message::Error(ErrorResponse { id, error }))
        }
        (None, None, Some(_), _) | (None, None, _, Some(_)) => {
            Err(Error::Decode("response is missing its id".to_string()))
        }
        (None, Some(_), Some(_), Some(_)) => Err(Error::Decode(
            "response carries both result and error".to_string(),
        )),
        (Some(_), _, Some(_), _) | (Some(_), _, _, Some(_)) => Err(Error::Decode(
            "frame mixes method with result/error".to_string(),
        )),
        (None, _, None, None) => Err(Error::Decode(
            "frame is neither request, response nor notification".to_string(),
        )),
    }
}

/// Build the params object for an outgoing request, injecting a progress
/// token under `_meta` when the caller opted into progress reporting.
pub fn inject_progress_token(params: Option<Value>, token: &Value) -> Value {
    let mut obj = match params {
        Some(Value::Object(obj)) => obj,
        Some(other) => {
            // Non-object params cannot carry _meta; wrap them untouched.
            return other;
        }
        None => Map::new(),
    };
    let meta = obj
        .entry("_meta".to_string())
        .or_insert_with(|| json!({}));
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), token.clone());
    }
    Value::Object(obj)
}

/// Extract the progress token from a request's params, if the sender opted in.
pub fn extract_progress_token(params: Option<&Value>) -> Option<Value> {
    params?
        .get("_meta")?
        .get("progressToken")
        .filter(|t| t.is_string() || t.is_i64())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_discriminates_all_variants() {
        let req = decode(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#).unwrap();
        assert!(matches!(req, Message::Request(ref r) if r.method == "tools/list"));

        let note = decode(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(note, Message::Notification(_)));

        let resp = decode(r#"{"jsonrpc":"2.0","id":"a","result":{"ok":true}}"#).unwrap();
        assert!(matches!(resp, Message::Response(ref r) if r.id == RequestId::from("a")));

        let err = decode(r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"nope"}}"#)
            .unwrap();
        assert!(matches!(err, Message::Error(ref e) if e.error.code == -32601));
    }

    #[test]
    fn decode_rejects_malformed_shapes() {
        // missing jsonrpc discriminator
        assert!(decode(r#"{"id":1,"method":"ping"}"#).is_err());
        // wrong version
        assert!(decode(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).is_err());
        // response without id
        assert!(decode(r#"{"jsonrpc":"2.0","result":{}}"#).is_err());
        // result and error together
        assert!(decode(r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#)
            .is_err());
        // method mixed with result
        assert!(decode(r#"{"jsonrpc":"2.0","id":1,"method":"ping","result":{}}"#).is_err());
        // unknown shape
        assert!(decode(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        // non-object frame
        assert!(decode(r#""just a string""#).is_err());
        // batch
        assert!(decode(r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#).is_err());
        // fractional id
        assert!(decode(r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).is_err());
        // invalid JSON entirely
        assert!(decode("not json").is_err());
    }

    #[test]
    fn encode_decode_round_trip_is_semantically_stable() {
        let messages = vec![
            Message::request(
                RequestId::Number(7),
                "tools/call",
                Some(json!({"name":"demo","arguments":{"n":1}})),
            ),
            Message::response(RequestId::from("r-1"), json!({"content":[]})),
            Message::error_response(
                RequestId::Number(3),
                RpcError::with_data(-32602, "Invalid params", json!({"field":"name"})),
            ),
            Message::notification("notifications/progress", Some(json!({"progress": 0.5}))),
            Message::notification("notifications/initialized", None),
        ];

        for message in messages {
            let frame = encode(&message).unwrap();
            assert!(!frame.contains('\n'));
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn progress_token_meta_round_trip() {
        let params = inject_progress_token(Some(json!({"name":"slow"})), &json!(42));
        assert_eq!(params["_meta"]["progressToken"], json!(42));
        assert_eq!(
            extract_progress_token(Some(&params)),
            Some(json!(42))
        );

        // Absent opt-in yields no token.
        assert_eq!(extract_progress_token(Some(&json!({"name":"x"}))), None);
        assert_eq!(extract_progress_token(None), None);
        // Token of an illegal type is ignored.
        assert_eq!(
            extract_progress_token(Some(&json!({"_meta":{"progressToken":true}}))),
            None
        );
    }

    #[test]
    fn request_id_parsing_is_strict() {
        assert!(RequestId::from_value(&json!("abc")).is_ok());
        assert!(RequestId::from_value(&json!(12)).is_ok());
        assert!(RequestId::from_value(&json!(1.25)).is_err());
        assert!(RequestId::from_value(&json!(null)).is_err());
        assert!(RequestId::from_value(&json!({"id":1})).is_err());
    }
}
