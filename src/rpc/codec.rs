//! JSON-RPC 2.0 message model, structural classification, and wire codec.
//!
//! A loose implementation of the JSON-RPC 2.0 protocol,
//! <https://www.jsonrpc.org/specification>. Classification is purely
//! structural: the key set of an inbound object decides whether it is a
//! Notification, Request, or Response, and anything else is invalid. A lone
//! object on the wire is treated as a one-element batch.

use serde_json::{Map, Value};

/// Protocol specifier carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

// =============================================================================
// PARAMS
// =============================================================================

/// Method parameters: a keyed mapping or an ordered sequence, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Named(Map<String, Value>),
    Positional(Vec<Value>),
}

impl Params {
    /// Accepts only the two shapes the protocol allows.
    pub fn from_value(v: Value) -> Option<Self> {
        match v {
            Value::Object(map) => Some(Params::Named(map)),
            Value::Array(items) => Some(Params::Positional(items)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Params::Named(map) => Value::Object(map.clone()),
            Params::Positional(items) => Value::Array(items.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::Named(map) => map.is_empty(),
            Params::Positional(items) => items.is_empty(),
        }
    }

    /// Positional element lookup, `None` for named params or out of range.
    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        match self {
            Params::Positional(items) => items.get(idx),
            Params::Named(_) => None,
        }
    }

    /// Named field lookup, `None` for positional params or a missing key.
    pub fn get_key(&self, key: &str) -> Option<&Value> {
        match self {
            Params::Named(map) => map.get(key),
            Params::Positional(_) => None,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// The wire error object: `{code, message, data?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(data: Option<Value>) -> Self {
        Self::new(-32700, "Parse error", data)
    }

    pub fn invalid_request(data: Option<Value>) -> Self {
        Self::new(-32600, "Invalid Request", data)
    }

    pub fn method_not_found(data: Option<Value>) -> Self {
        Self::new(-32601, "Method not found", data)
    }

    pub fn invalid_params(data: Option<Value>) -> Self {
        Self::new(-32602, "Invalid params", data)
    }

    pub fn internal_error(data: Option<Value>) -> Self {
        Self::new(-32603, "Internal error", data)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("code".into(), Value::from(self.code));
        map.insert("message".into(), Value::from(self.message.clone()));
        if let Some(data) = &self.data {
            map.insert("data".into(), data.clone());
        }
        Value::Object(map)
    }

    /// Parse an inbound error object. Requires `code` and `message`; any
    /// other key set fails.
    pub fn from_value(v: &Value) -> Option<Self> {
        let map = v.as_object()?;
        if !map.keys().all(|k| k == "code" || k == "message" || k == "data") {
            return None;
        }
        Some(Self {
            code: map.get("code")?.as_i64()?,
            message: map.get("message")?.as_str()?.to_string(),
            data: map.get("data").cloned(),
        })
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {}: {}", self.code, self.message)
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Result(Value),
    Error(RpcError),
}

/// The three wire shapes. `Request.id` is an opaque locally generated
/// string; `Response.id` stays a raw JSON value because replies to
/// malformed traffic carry `null` and inbound ids are untrusted.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Notification {
        method: String,
        params: Option<Params>,
    },
    Request {
        method: String,
        params: Option<Params>,
        id: String,
    },
    Response {
        id: Value,
        body: ResponseBody,
    },
}

impl Message {
    pub fn notification(method: impl Into<String>, params: Option<Params>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn request(method: impl Into<String>, params: Option<Params>, id: impl Into<String>) -> Self {
        Message::Request {
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    pub fn response_result(id: Value, result: Value) -> Self {
        Message::Response {
            id,
            body: ResponseBody::Result(result),
        }
    }

    pub fn response_error(id: Value, error: RpcError) -> Self {
        Message::Response {
            id,
            body: ResponseBody::Error(error),
        }
    }

    /// Counter key for this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Notification { .. } => "notif",
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Message::Notification { method, params } => {
                map.insert("method".into(), Value::from(method.clone()));
                if let Some(p) = params {
                    map.insert("params".into(), p.to_value());
                }
            }
            Message::Request { method, params, id } => {
                map.insert("method".into(), Value::from(method.clone()));
                if let Some(p) = params {
                    map.insert("params".into(), p.to_value());
                }
                map.insert("id".into(), Value::from(id.clone()));
            }
            Message::Response { id, body } => {
                match body {
                    ResponseBody::Result(v) => map.insert("result".into(), v.clone()),
                    ResponseBody::Error(e) => map.insert("error".into(), e.to_value()),
                };
                map.insert("id".into(), id.clone());
            }
        }
        Value::Object(map)
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Compact single-message encoding. `serde_json` emits the `(",", ":")`
/// separators the wire requires.
pub fn encode(msg: &Message) -> String {
    msg.to_value().to_string()
}

/// Encode an ordered batch as a JSON array.
pub fn encode_batch(msgs: &[Message]) -> String {
    Value::Array(msgs.iter().map(Message::to_value).collect()).to_string()
}

/// One classified inbound object.
#[derive(Debug)]
pub enum Inbound {
    Msg(Message),
    /// Structurally invalid. The id is retained when present so the
    /// dispatcher can reply with `invalid_request`; without one the object
    /// is dropped.
    Invalid {
        id: Option<Value>,
        keys: Vec<String>,
    },
}

/// Parse one frame payload into a sequence of classified messages.
///
/// A top-level object is wrapped as a one-element sequence; a top-level
/// array is iterated. Malformed JSON surfaces as the returned error; a
/// well-formed scalar classifies as a single invalid object and is dropped
/// downstream.
pub fn decode(text: &str) -> Result<Vec<Inbound>, serde_json::Error> {
    let outer: Value = serde_json::from_str(text)?;
    let objects = match outer {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(objects.into_iter().map(classify).collect())
}

fn invalid(map: &Map<String, Value>) -> Inbound {
    Inbound::Invalid {
        id: map.get("id").cloned(),
        keys: map.keys().cloned().collect(),
    }
}

/// The structural rule table. All shapes require `jsonrpc == "2.0"`:
///
/// | keys ⊆                         | must contain   | kind         |
/// |--------------------------------|----------------|--------------|
/// | `{jsonrpc, method, params}`    | `method`       | Notification |
/// | `{jsonrpc, method, params, id}`| `method`, `id` | Request      |
/// | `{jsonrpc, result\|error, id}` | `id`, one body | Response     |
fn classify(v: Value) -> Inbound {
    let map = match v {
        Value::Object(map) => map,
        _ => {
            return Inbound::Invalid {
                id: None,
                keys: Vec::new(),
            }
        }
    };

    if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return invalid(&map);
    }

    let has_method = map.contains_key("method");
    let has_id = map.contains_key("id");
    let has_result = map.contains_key("result");
    let has_error = map.contains_key("error");

    if has_method {
        let allowed = |k: &str| matches!(k, "jsonrpc" | "method" | "params" | "id");
        if !map.keys().all(|k| allowed(k)) {
            return invalid(&map);
        }
        let method = match map.get("method").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => return invalid(&map),
        };
        let params = match map.get("params") {
            None => None,
            Some(p) => match Params::from_value(p.clone()) {
                Some(p) => Some(p),
                None => return invalid(&map),
            },
        };
        if has_id {
            // Request ids are opaque strings; any other id shape is invalid.
            match map.get("id").and_then(Value::as_str) {
                Some(id) => Inbound::Msg(Message::Request {
                    method,
                    params,
                    id: id.to_string(),
                }),
                None => invalid(&map),
            }
        } else {
            Inbound::Msg(Message::Notification { method, params })
        }
    } else if has_id && (has_result ^ has_error) {
        let allowed = |k: &str| matches!(k, "jsonrpc" | "result" | "error" | "id");
        if !map.keys().all(|k| allowed(k)) {
            return invalid(&map);
        }
        let id = map.get("id").cloned().unwrap_or(Value::Null);
        if has_result {
            Inbound::Msg(Message::Response {
                id,
                body: ResponseBody::Result(map.get("result").cloned().unwrap_or(Value::Null)),
            })
        } else {
            match map.get("error").and_then(|e| RpcError::from_value(e)) {
                Some(err) => Inbound::Msg(Message::Response {
                    id,
                    body: ResponseBody::Error(err),
                }),
                None => invalid(&map),
            }
        }
    } else {
        invalid(&map)
    }
}

// =============================================================================
// IDS
// =============================================================================

/// Generate a request id: the local peer alias plus 32 bits of entropy.
/// The prefix keeps ids from different peers disjoint in a broadcast
/// topology; the entropy keeps them unique within a peer's lifetime.
pub fn new_id(alias: &str) -> String {
    format!("{}-{:08x}", alias, rand::random::<u32>())
}

/// Short hex alias for a peer, used in log lines and id prefixes.
pub fn new_alias() -> String {
    format!("{:03x}", rand::random::<u16>() & 0x0fff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_one(text: &str) -> Inbound {
        let mut items = decode(text).unwrap();
        assert_eq!(items.len(), 1);
        items.remove(0)
    }

    #[test]
    fn classify_notification() {
        match decode_one(r#"{"jsonrpc":"2.0","method":"EVENT","params":[1,2]}"#) {
            Inbound::Msg(Message::Notification { method, params }) => {
                assert_eq!(method, "EVENT");
                assert_eq!(params.unwrap().to_value(), json!([1, 2]));
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn classify_request() {
        match decode_one(r#"{"jsonrpc":"2.0","method":"PING","params":["x"],"id":"a1"}"#) {
            Inbound::Msg(Message::Request { method, id, .. }) => {
                assert_eq!(method, "PING");
                assert_eq!(id, "a1");
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn classify_responses() {
        match decode_one(r#"{"jsonrpc":"2.0","result":[],"id":"a1"}"#) {
            Inbound::Msg(Message::Response { body, .. }) => {
                assert_eq!(body, ResponseBody::Result(json!([])));
            }
            other => panic!("wrong kind: {other:?}"),
        }
        match decode_one(r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":"a2"}"#)
        {
            Inbound::Msg(Message::Response { body, .. }) => match body {
                ResponseBody::Error(e) => assert_eq!(e.code, -32601),
                other => panic!("wrong body: {other:?}"),
            },
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn both_result_and_error_is_invalid() {
        let text = r#"{"jsonrpc":"2.0","result":[],"error":{"code":1,"message":"x"},"id":"a1"}"#;
        match decode_one(text) {
            Inbound::Invalid { id, .. } => assert_eq!(id, Some(json!("a1"))),
            other => panic!("should be invalid: {other:?}"),
        }
    }

    #[test]
    fn wrong_version_is_invalid() {
        match decode_one(r#"{"jsonrpc":"1.0","method":"PING"}"#) {
            Inbound::Invalid { .. } => {}
            other => panic!("should be invalid: {other:?}"),
        }
    }

    #[test]
    fn extra_keys_are_invalid() {
        match decode_one(r#"{"jsonrpc":"2.0","method":"PING","extra":1}"#) {
            Inbound::Invalid { .. } => {}
            other => panic!("should be invalid: {other:?}"),
        }
    }

    #[test]
    fn scalar_params_are_invalid() {
        match decode_one(r#"{"jsonrpc":"2.0","method":"PING","params":5}"#) {
            Inbound::Invalid { .. } => {}
            other => panic!("should be invalid: {other:?}"),
        }
    }

    #[test]
    fn non_string_request_id_is_invalid() {
        match decode_one(r#"{"jsonrpc":"2.0","method":"PING","id":7}"#) {
            Inbound::Invalid { id, .. } => assert_eq!(id, Some(json!(7))),
            other => panic!("should be invalid: {other:?}"),
        }
    }

    #[test]
    fn lone_object_is_one_element_batch() {
        let items = decode(r#"{"jsonrpc":"2.0","method":"PING"}"#).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn array_is_iterated() {
        let items = decode(
            r#"[{"jsonrpc":"2.0","method":"A"},{"jsonrpc":"2.0","method":"B","id":"x"}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn encode_is_compact_and_round_trips() {
        let msg = Message::request("PING", Params::from_value(json!(["x"])), "a1");
        let text = encode(&msg);
        // Compact separators: no whitespace anywhere in the encoding.
        assert!(!text.contains(' '));
        assert!(text.contains(r#""jsonrpc":"2.0""#));
        assert!(text.contains(r#""params":["x"]"#));
        match decode_one(&text) {
            Inbound::Msg(decoded) => assert_eq!(decoded, msg),
            other => panic!("round trip failed: {other:?}"),
        }
    }

    #[test]
    fn response_round_trips() {
        let msg = Message::response_error(
            json!("a2"),
            RpcError::method_not_found(Some(json!("NOSUCH"))),
        );
        match decode_one(&encode(&msg)) {
            Inbound::Msg(decoded) => assert_eq!(decoded, msg),
            other => panic!("round trip failed: {other:?}"),
        }
    }

    #[test]
    fn batch_encodes_as_array() {
        let msgs = vec![
            Message::notification("A", None),
            Message::response_result(json!("i"), json!([])),
        ];
        let text = encode_batch(&msgs);
        assert!(text.starts_with('['));
        assert_eq!(decode(&text).unwrap().len(), 2);
    }

    #[test]
    fn ids_carry_prefix_and_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = new_id("abc");
            assert!(id.starts_with("abc-"));
            assert!(seen.insert(id));
        }
    }
}
