//! Request/response envelope and the uniform response builder.
//!
//! Requests are JSON-RPC-like: `{method, params, id}`. Responses wrap a
//! `result` object carrying `success` plus either `data` or `error`.
//! Streaming responses set `_isStreaming` on every chunk and `_last` on the
//! terminal one. The `id` correlates a response with its request when a
//! stream carries more than one logical request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Instant;

/// Params key carrying the final destination of a forwarded request.
pub const TARGET_ADDRESS_PARAM: &str = "_targetAddress";

/// Request correlation ID (string or number on the wire). Any JSON number
/// is accepted, including floats and integers beyond `i64`, and echoed back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    Text(String),
}

impl RequestId {
    /// A fresh random ID.
    pub fn generate() -> Self {
        RequestId::Text(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n.into())
    }
}

/// An outbound or inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method to invoke on the target.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Correlation ID.
    pub id: RequestId,
    /// Set when the caller accepts a streamed (chunked) response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl Request {
    /// Build a request with a generated ID. Non-object params are wrapped
    /// under a `value` key.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            method: method.into(),
            params,
            id: RequestId::generate(),
            stream: None,
        }
    }

    /// Override the generated ID.
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    /// Ask for a streamed response.
    pub fn streaming(mut self) -> Self {
        self.stream = Some(true);
        self
    }

    /// String-valued parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Final destination recorded on a forwarded request.
    pub fn target_address(&self) -> Option<&str> {
        self.param_str(TARGET_ADDRESS_PARAM)
    }

    /// Record the final destination on the request.
    pub fn set_target_address(&mut self, address: &str) {
        self.params.insert(
            TARGET_ADDRESS_PARAM.to_string(),
            Value::String(address.to_string()),
        );
    }

    /// Params as a JSON value (owned).
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }
}

/// Timing attached to every built response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetrics {
    /// When the response was produced.
    pub handled_at: DateTime<Utc>,
    /// Time from builder creation to response, in milliseconds.
    pub duration_ms: u64,
}

/// The `result` object of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "_isStreaming", default, skip_serializing_if = "is_false")]
    pub is_streaming: bool,
    #[serde(rename = "_last", default, skip_serializing_if = "is_false")]
    pub last: bool,
    #[serde(rename = "_requestMethod", default, skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(rename = "_metrics", default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResponseMetrics>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A response to one request (or one chunk of a streamed response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub result: ResponseResult,
}

impl Response {
    /// Whether this response ends the call (non-streaming, or the `_last`
    /// chunk of a stream).
    pub fn is_terminal(&self) -> bool {
        !self.result.is_streaming || self.result.last
    }

    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        self.result.success
    }

    /// Collapse into `Ok(data)` or `Err(error)`.
    pub fn into_result(self) -> Result<Value, String> {
        if self.result.success {
            Ok(self.result.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .result
                .error
                .unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

/// Builds success, error and chunk responses for one request, attaching
/// metrics uniformly.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    id: RequestId,
    method: String,
    started: Instant,
}

impl ResponseBuilder {
    /// Start building responses for `request`.
    pub fn new(request: &Request) -> Self {
        Self {
            id: request.id.clone(),
            method: request.method.clone(),
            started: Instant::now(),
        }
    }

    /// ID of the request being answered.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    fn build(&self, success: bool, data: Option<Value>, error: Option<String>) -> Response {
        Response {
            id: self.id.clone(),
            result: ResponseResult {
                success,
                data,
                error,
                is_streaming: false,
                last: false,
                request_method: Some(self.method.clone()),
                metrics: Some(ResponseMetrics {
                    handled_at: Utc::now(),
                    duration_ms: self.started.elapsed().as_millis() as u64,
                }),
            },
        }
    }

    /// A successful response.
    pub fn success(&self, data: Value) -> Response {
        self.build(true, Some(data), None)
    }

    /// A failed response.
    pub fn error(&self, error: impl fmt::Display) -> Response {
        self.build(false, None, Some(error.to_string()))
    }

    /// An intermediate streaming chunk.
    pub fn chunk(&self, data: Value) -> Response {
        let mut response = self.success(data);
        response.result.is_streaming = true;
        response
    }

    /// Mark `response` as the terminal chunk of a stream.
    pub fn finish_stream(&self, mut response: Response) -> Response {
        response.result.is_streaming = true;
        response.result.last = true;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = Request::new("embed", json!({"text": "hi"})).with_id(7);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["method"], "embed");
        assert_eq!(v["params"]["text"], "hi");
        assert_eq!(v["id"], 7);
        assert!(v.get("result").is_none());
        assert!(v.get("stream").is_none());
    }

    #[test]
    fn test_request_id_accepts_string_or_number() {
        let a: Request = serde_json::from_str(r#"{"method":"m","id":"abc"}"#).unwrap();
        assert_eq!(a.id, RequestId::Text("abc".into()));
        let b: Request = serde_json::from_str(r#"{"method":"m","id":42}"#).unwrap();
        assert_eq!(b.id, RequestId::from(42));
        assert!(b.params.is_empty());
    }

    #[test]
    fn test_request_id_keeps_any_json_number() {
        let big: Request =
            serde_json::from_str(r#"{"method":"m","id":18446744073709551615}"#).unwrap();
        assert_eq!(big.id, RequestId::Number(u64::MAX.into()));
        assert_eq!(big.id.to_string(), "18446744073709551615");

        let float: Request = serde_json::from_str(r#"{"method":"m","id":1.5}"#).unwrap();
        assert!(matches!(float.id, RequestId::Number(_)));
        let response = ResponseBuilder::new(&float).success(json!({}));
        assert_eq!(serde_json::to_value(&response).unwrap()["id"], json!(1.5));
    }

    #[test]
    fn test_non_object_params_are_wrapped() {
        let req = Request::new("m", json!("plain"));
        assert_eq!(req.params["value"], "plain");
    }

    #[test]
    fn test_target_address_param() {
        let mut req = Request::new("m", json!({}));
        assert!(req.target_address().is_none());
        req.set_target_address("o://leader/services");
        assert_eq!(req.target_address(), Some("o://leader/services"));
    }

    #[test]
    fn test_builder_success_and_error() {
        let req = Request::new("embed", json!({})).with_id("r-1");
        let builder = ResponseBuilder::new(&req);

        let ok = builder.success(json!([1, 2]));
        assert_eq!(ok.id, RequestId::from("r-1"));
        assert!(ok.is_success());
        assert!(ok.is_terminal());
        assert_eq!(ok.result.request_method.as_deref(), Some("embed"));
        assert!(ok.result.metrics.is_some());

        let err = builder.error("boom");
        assert!(!err.is_success());
        assert_eq!(err.into_result().unwrap_err(), "boom");
    }

    #[test]
    fn test_streaming_flags() {
        let req = Request::new("generate", json!({})).streaming();
        let builder = ResponseBuilder::new(&req);

        let chunk = builder.chunk(json!("partial"));
        assert!(!chunk.is_terminal());
        let v = serde_json::to_value(&chunk).unwrap();
        assert_eq!(v["result"]["_isStreaming"], true);
        assert!(v["result"].get("_last").is_none());

        let last = builder.finish_stream(builder.success(json!("done")));
        assert!(last.is_terminal());
    }
}
