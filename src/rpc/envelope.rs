//! Request and response envelopes
//!
//! Envelopes follow JSON-RPC 2.0 framing: requests always carry a string id,
//! responses echo it back together with either a result or an error object.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const APPLICATION_ERROR: i32 = -32000;
pub const REQUEST_CANCELLED: i32 = -32800;

/// Correlation token for one outstanding call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Interprets an arbitrary inbound document as a request envelope.
    ///
    /// On failure the returned error response carries the request id when one
    /// could be recovered, so the caller can still be answered.
    pub fn from_value(payload: Value) -> Result<Self, Response> {
        if !payload.is_object() {
            return Err(invalid_request(None, "envelope must be a JSON object"));
        }

        let request_id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(RequestId::from);

        let request: Request = serde_json::from_value(payload)
            .map_err(|err| invalid_request(request_id.clone(), &err.to_string()))?;

        if request.jsonrpc != JSONRPC_VERSION {
            return Err(invalid_request(request_id, "unsupported jsonrpc version"));
        }
        if request.method.trim().is_empty() {
            return Err(invalid_request(request_id, "method must not be empty"));
        }

        Ok(request)
    }
}

fn invalid_request(id: Option<RequestId>, reason: &str) -> Response {
    Response::from_error_object(id, RpcError::invalid_request(reason).to_error_object())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::from_error_object(id, ErrorObject::new(code, message))
    }

    pub fn from_error_object(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the envelope into its outcome. A response with neither field is
    /// treated as a null result.
    pub fn into_outcome(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let first = RequestId::generate();
        let second = RequestId::generate();

        assert_ne!(first, second);
        assert_eq!(first.as_str().len(), 32);
    }

    #[test]
    fn request_serializes_with_string_id() {
        let request = Request::new(RequestId::from("abc"), "Test.Test", json!("hello"));
        let value = serde_json::to_value(&request).expect("request serialization");

        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": "abc", "method": "Test.Test", "params": "hello"})
        );
    }

    #[test]
    fn from_value_recovers_id_of_invalid_request() {
        let error = Request::from_value(json!({"jsonrpc": "2.0", "id": "abc", "method": 7}))
            .expect_err("method must be a string");

        assert_eq!(error.id, Some(RequestId::from("abc")));
        assert_eq!(error.error.map(|error| error.code), Some(INVALID_REQUEST));
    }

    #[test]
    fn from_value_rejects_wrong_version_and_blank_method() {
        let wrong_version =
            Request::from_value(json!({"jsonrpc": "1.0", "id": "a", "method": "Test.Test"}));
        let blank_method = Request::from_value(json!({"jsonrpc": "2.0", "id": "b", "method": " "}));

        assert_eq!(
            wrong_version.expect_err("wrong version").error,
            Some(ErrorObject::new(INVALID_REQUEST, "unsupported jsonrpc version"))
        );
        assert_eq!(
            blank_method.expect_err("blank method").error,
            Some(ErrorObject::new(INVALID_REQUEST, "method must not be empty"))
        );
    }

    #[test]
    fn non_object_envelope_has_no_id() {
        let response = Request::from_value(json!(["not", "an", "object"])).expect_err("array");

        assert_eq!(response.id, None);
        assert_eq!(
            response.error,
            Some(ErrorObject::new(INVALID_REQUEST, "envelope must be a JSON object"))
        );
    }

    #[test]
    fn from_value_defaults_missing_params_to_null() {
        let request = Request::from_value(json!({"jsonrpc": "2.0", "id": "a", "method": "T.m"}))
            .expect("valid request");
        assert_eq!(request.params, Value::Null);
    }

    #[test]
    fn error_response_omits_result_field() {
        let response = Response::error(None, PARSE_ERROR, "Parse error");
        let value = serde_json::to_value(&response).expect("response serialization");

        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}})
        );
    }

    #[test]
    fn into_outcome_prefers_error() {
        let ok = Response::result(RequestId::from("a"), json!(1)).into_outcome();
        let err = Response::error(Some(RequestId::from("a")), APPLICATION_ERROR, "nope").into_outcome();

        assert_eq!(ok, Ok(json!(1)));
        assert_eq!(err, Err(ErrorObject::new(APPLICATION_ERROR, "nope")));
    }
}
