//! Error Handling
//!
//! This module provides the error taxonomy for dumq-rpc operations. Errors
//! fall into two families depending on where they originate:
//!
//! - **Communication**: broker connection and socket failures raised by the
//!   transport layer (connection refused, connection lost, channel closed).
//! - **Protocol**: responses whose status encodes a failure, mapped by the
//!   [`StatusError`](crate::middleware::StatusError) middleware into the
//!   client-error and server-error kinds below.
//!
//! # Error Types
//!
//! - **Communication**: broker connection / socket issues
//! - **RequestTimeout**: an RPC did not complete before its timeout
//! - **BadRequest / NotFound / NotAcceptable**: 400 / 404 / 406 responses
//! - **UnprocessableEntity**: 422 response carrying the raw body and a
//!   best-effort parse of the remote validation errors
//! - **ClientError / ServerError**: remaining 4xx / 5xx statuses
//! - **Serialization**: JSON encode/decode failures
//! - **InvalidArgument**: request construction failures (e.g. no exchange
//!   configured at any level)
//!
//! # Examples
//!
//! ```rust
//! use dumq_rpc::error::Error;
//!
//! fn classify(err: &Error) -> &'static str {
//!     if err.is_client_error() {
//!         "caller's fault"
//!     } else if err.is_server_error() {
//!         "remote service's fault"
//!     } else {
//!         "transport or local failure"
//!     }
//! }
//! ```

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by producers, middlewares and resources.
#[derive(Error, Debug)]
pub enum Error {
    #[error("communication error: {0}")]
    Communication(String),

    #[error("request timed out: {0}")]
    RequestTimeout(String),

    #[error("bad request: {0}")]
    BadRequest(Value),

    #[error("not found: {0}")]
    NotFound(Value),

    #[error("not acceptable: {0}")]
    NotAcceptable(Value),

    /// 422 response. Carries the raw body and an attempt at a parsed
    /// validation-errors map, keyed by attribute name (or `base`).
    #[error("unprocessable entity: {body}")]
    UnprocessableEntity {
        body: Value,
        errors: HashMap<String, Vec<String>>,
    },

    /// Any other 4xx status.
    #[error("client error ({status}): {body}")]
    ClientError { status: u16, body: Value },

    /// Any 5xx status.
    #[error("server error ({status}): {body}")]
    ServerError { status: u16, body: Value },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for dumq-rpc operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a communication error.
    pub fn communication(msg: impl Into<String>) -> Self {
        Error::Communication(msg.into())
    }

    /// Create a request timeout error.
    pub fn request_timeout(msg: impl Into<String>) -> Self {
        Error::RequestTimeout(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Map a response status to the matching protocol error.
    ///
    /// Statuses in `200..=299` are not errors; callers are expected to check
    /// [`Response::success`](crate::response::Response::success) first.
    pub fn from_status(status: u16, body: Value) -> Self {
        match status {
            400 => Error::BadRequest(body),
            404 => Error::NotFound(body),
            406 => Error::NotAcceptable(body),
            408 => Error::RequestTimeout(body.to_string()),
            422 => {
                let errors = parse_remote_errors(&body);
                Error::UnprocessableEntity { body, errors }
            }
            500..=599 => Error::ServerError { status, body },
            _ => Error::ClientError { status, body },
        }
    }

    /// The response status this error was mapped from, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::BadRequest(_) => Some(400),
            Error::NotFound(_) => Some(404),
            Error::NotAcceptable(_) => Some(406),
            Error::RequestTimeout(_) => Some(408),
            Error::UnprocessableEntity { .. } => Some(422),
            Error::ClientError { status, .. } | Error::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this is a client-side protocol error (4xx family).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::BadRequest(_)
                | Error::NotFound(_)
                | Error::NotAcceptable(_)
                | Error::RequestTimeout(_)
                | Error::UnprocessableEntity { .. }
                | Error::ClientError { .. }
        )
    }

    /// Whether this is a server-side protocol error (5xx family).
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::ServerError { .. })
    }

    /// Get the error kind as a string.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Communication(_) => "communication-error",
            Error::RequestTimeout(_) => "request-timeout",
            Error::BadRequest(_) => "bad-request",
            Error::NotFound(_) => "not-found",
            Error::NotAcceptable(_) => "not-acceptable",
            Error::UnprocessableEntity { .. } => "unprocessable-entity",
            Error::ClientError { .. } => "client-error",
            Error::ServerError { .. } => "server-error",
            Error::Serialization(_) => "serialization-error",
            Error::InvalidArgument(_) => "invalid-argument",
        }
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Error::Communication(err.to_string())
    }
}

/// Extract a validation-errors map from a 422 body.
///
/// Accepts `{"errors": {"email": ["taken"]}}` as well as a bare
/// `{"email": ["taken"]}` mapping. Scalar messages are wrapped in a
/// single-element list; anything unrecognized lands under `base`.
fn parse_remote_errors(body: &Value) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();

    let source = match body.get("errors") {
        Some(Value::Object(map)) => Some(map),
        _ => body.as_object(),
    };

    match source {
        Some(map) => {
            for (key, value) in map {
                let messages = match value {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                    Value::String(s) => vec![s.clone()],
                    other => vec![other.to_string()],
                };
                out.insert(key.clone(), messages);
            }
        }
        None => {
            if !body.is_null() {
                out.insert("base".to_string(), vec![body.to_string()]);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(Error::from_status(400, Value::Null), Error::BadRequest(_)));
        assert!(matches!(Error::from_status(404, Value::Null), Error::NotFound(_)));
        assert!(matches!(Error::from_status(406, Value::Null), Error::NotAcceptable(_)));
        assert!(matches!(Error::from_status(408, Value::Null), Error::RequestTimeout(_)));
        assert!(matches!(
            Error::from_status(422, Value::Null),
            Error::UnprocessableEntity { .. }
        ));
        assert!(matches!(
            Error::from_status(500, Value::Null),
            Error::ServerError { status: 500, .. }
        ));
        assert!(matches!(
            Error::from_status(503, Value::Null),
            Error::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            Error::from_status(403, Value::Null),
            Error::ClientError { status: 403, .. }
        ));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [400u16, 404, 406, 408, 422, 409, 500, 503] {
            let err = Error::from_status(status, Value::Null);
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn test_families() {
        assert!(Error::from_status(404, Value::Null).is_client_error());
        assert!(Error::from_status(422, Value::Null).is_client_error());
        assert!(Error::from_status(500, Value::Null).is_server_error());
        assert!(!Error::communication("boom").is_client_error());
        assert!(!Error::communication("boom").is_server_error());
    }

    #[test]
    fn test_unprocessable_entity_parses_nested_errors() {
        let body = json!({"errors": {"email": ["no se permiten .org"]}});
        match Error::from_status(422, body) {
            Error::UnprocessableEntity { errors, .. } => {
                assert_eq!(errors["email"], vec!["no se permiten .org".to_string()]);
            }
            other => panic!("expected UnprocessableEntity, got {:?}", other),
        }
    }

    #[test]
    fn test_unprocessable_entity_accepts_bare_map() {
        let body = json!({"name": "is required"});
        match Error::from_status(422, body) {
            Error::UnprocessableEntity { errors, .. } => {
                assert_eq!(errors["name"], vec!["is required".to_string()]);
            }
            other => panic!("expected UnprocessableEntity, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_body_lands_under_base() {
        let body = json!("everything is on fire");
        match Error::from_status(422, body) {
            Error::UnprocessableEntity { errors, .. } => {
                assert!(errors.contains_key("base"));
            }
            other => panic!("expected UnprocessableEntity, got {:?}", other),
        }
    }
}
