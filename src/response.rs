//! Response Envelope and Status Codes
//!
//! This module provides the structured response that consumers put on the
//! wire and producers hand back to callers, together with the HTTP status
//! name table used by controller renders.
//!
//! A reply travels as a JSON mapping:
//!
//! ```json
//! {"status": 200, "body": {"message": "Pong!"}, "headers": {}}
//! ```
//!
//! Statuses follow HTTP semantics: `2xx` success, `4xx` client-side
//! failures, `422` structured validation errors, `5xx` server-side
//! failures, `408` reserved for producer timeouts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Structured response exchanged between consumer and producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Status code with HTTP semantics.
    pub status: u16,
    /// Response body; `null` for empty renders.
    #[serde(default)]
    pub body: Value,
    /// Application-level response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Response {
    /// Create a response with the given status and body.
    pub fn new(status: impl Into<Status>, body: Value) -> Self {
        Response {
            status: status.into().code(),
            body,
            headers: HashMap::new(),
        }
    }

    /// A `204 No Content` response with a null body.
    pub fn no_content() -> Self {
        Response::new(204, Value::Null)
    }

    /// A structured error response: `{error, detail}` under the given status.
    pub fn error(status: impl Into<Status>, error: &str, detail: impl Into<String>) -> Self {
        Response::new(status, json!({ "error": error, "detail": detail.into() }))
    }

    /// Attach response headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Whether the status is in the success range.
    pub fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse a response from reply bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }

    /// Serialize the response for the wire.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }
}

/// A status code accepted either numerically or by its HTTP reason name.
///
/// Controller renders take `impl Into<Status>`, so both spellings work:
///
/// ```rust
/// use dumq_rpc::response::Status;
///
/// assert_eq!(Status::from(200), Status::from("ok"));
/// assert_eq!(Status::from("unprocessable_entity").code(), 422);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const CREATED: Status = Status(201);
    pub const NO_CONTENT: Status = Status(204);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const NOT_ACCEPTABLE: Status = Status(406);
    pub const REQUEST_TIMEOUT: Status = Status(408);
    pub const UNPROCESSABLE_ENTITY: Status = Status(422);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const NOT_IMPLEMENTED: Status = Status(501);

    /// The numeric code.
    pub fn code(self) -> u16 {
        self.0
    }

    /// Look up a status by its underscored HTTP reason name.
    pub fn named(name: &str) -> Option<Status> {
        let code = match name {
            "continue" => 100,
            "switching_protocols" => 101,
            "ok" => 200,
            "created" => 201,
            "accepted" => 202,
            "non_authoritative_information" => 203,
            "no_content" => 204,
            "reset_content" => 205,
            "partial_content" => 206,
            "multiple_choices" => 300,
            "moved_permanently" => 301,
            "found" => 302,
            "see_other" => 303,
            "not_modified" => 304,
            "temporary_redirect" => 307,
            "permanent_redirect" => 308,
            "bad_request" => 400,
            "unauthorized" => 401,
            "payment_required" => 402,
            "forbidden" => 403,
            "not_found" => 404,
            "method_not_allowed" => 405,
            "not_acceptable" => 406,
            "request_timeout" => 408,
            "conflict" => 409,
            "gone" => 410,
            "precondition_failed" => 412,
            "payload_too_large" => 413,
            "unsupported_media_type" => 415,
            "unprocessable_entity" => 422,
            "locked" => 423,
            "too_many_requests" => 429,
            "internal_server_error" => 500,
            "not_implemented" => 501,
            "bad_gateway" => 502,
            "service_unavailable" => 503,
            "gateway_timeout" => 504,
            _ => return None,
        };
        Some(Status(code))
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status(code)
    }
}

impl From<&str> for Status {
    fn from(name: &str) -> Self {
        match Status::named(name) {
            Some(status) => status,
            None => {
                log::warn!("unknown status name {:?}, rendering 500", name);
                Status::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_named_lookup() {
        assert_eq!(Status::named("ok"), Some(Status(200)));
        assert_eq!(Status::named("created"), Some(Status(201)));
        assert_eq!(Status::named("unprocessable_entity"), Some(Status(422)));
        assert_eq!(Status::named("not_a_status"), None);
    }

    #[test]
    fn test_status_from_str_falls_back_to_500() {
        assert_eq!(Status::from("definitely_not_a_status").code(), 500);
    }

    #[test]
    fn test_response_success_range() {
        assert!(Response::new(200, Value::Null).success());
        assert!(Response::new(299, Value::Null).success());
        assert!(!Response::new(199, Value::Null).success());
        assert!(!Response::new(404, Value::Null).success());
    }

    #[test]
    fn test_response_wire_roundtrip() {
        let response = Response::new("ok", json!({"message": "Pong!"}));
        let bytes = response.to_vec().unwrap();
        let parsed = Response::from_slice(&bytes).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_response_defaults_missing_fields() {
        let parsed = Response::from_slice(br#"{"status": 204}"#).unwrap();
        assert_eq!(parsed.status, 204);
        assert_eq!(parsed.body, Value::Null);
        assert!(parsed.headers.is_empty());
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::error(501, "NotImplemented", "no controller");
        assert_eq!(response.status, 501);
        assert_eq!(response.body["error"], "NotImplemented");
        assert_eq!(response.body["detail"], "no controller");
    }
}
