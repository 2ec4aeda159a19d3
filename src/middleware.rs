//! Middleware Stack
//!
//! An ordered list of wrappers around the producer call. Each middleware
//! sees the [`Request`] on the way down and the [`Response`] on the way up;
//! the first middleware registered is the outermost layer of the onion.
//!
//! Two hooks cover most cases: [`Middleware::on_request`] runs before
//! delegating down the chain, [`Middleware::on_complete`] runs on the
//! response coming back up. Middlewares that need to short-circuit or retry
//! override [`Middleware::call`] instead.
//!
//! # Built-ins
//!
//! - [`JsonResponse`] parses string response bodies as JSON, passing
//!   non-JSON strings through untouched.
//! - [`StatusError`] maps failure statuses onto the error taxonomy and
//!   returns `2xx` responses unchanged.
//!
//! # Examples
//!
//! ```rust
//! use dumq_rpc::middleware::{JsonResponse, MiddlewareStack, StatusError};
//!
//! let mut stack = MiddlewareStack::new();
//! stack.push(JsonResponse);
//! stack.push(StatusError);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

/// The innermost step of the chain: the producer's `rpc` or `fire`.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn call(&self, request: &mut Request) -> Result<Response>;
}

/// One layer of the onion.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Runs on the request before delegating down the chain.
    async fn on_request(&self, _request: &mut Request) -> Result<()> {
        Ok(())
    }

    /// Runs on the response on the way back up.
    async fn on_complete(&self, response: Response) -> Result<Response> {
        Ok(response)
    }

    /// Full control over the wrap; the default runs the two hooks around
    /// the rest of the chain.
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response> {
        self.on_request(request).await?;
        let response = next.run(request).await?;
        self.on_complete(response).await
    }
}

/// The remainder of the chain below the current middleware.
pub struct Next<'a> {
    entries: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    /// Delegate to the next middleware, or to the terminal when the chain
    /// is exhausted.
    pub async fn run(self, request: &mut Request) -> Result<Response> {
        match self.entries.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    entries: rest,
                    terminal: self.terminal,
                };
                head.call(request, next).await
            }
            None => self.terminal.call(request).await,
        }
    }
}

/// Ordered middleware list; first registered is outermost.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    entries: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    /// An empty stack.
    pub fn new() -> Self {
        MiddlewareStack {
            entries: Vec::new(),
        }
    }

    /// The default stack: JSON body decoding, then status→error mapping.
    ///
    /// [`StatusError`] sits innermost so failure statuses surface before
    /// body decoding touches the response.
    pub fn standard() -> Self {
        let mut stack = MiddlewareStack::new();
        stack.push(JsonResponse);
        stack.push(StatusError);
        stack
    }

    /// Append a middleware. Registration order is wrap order.
    pub fn push<M: Middleware + 'static>(&mut self, middleware: M) {
        self.entries.push(Arc::new(middleware));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Run the request through the chain into `terminal`.
    pub async fn run(&self, request: &mut Request, terminal: &dyn Terminal) -> Result<Response> {
        let next = Next {
            entries: &self.entries,
            terminal,
        };
        next.run(request).await
    }
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareStack")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Parses string response bodies as JSON.
///
/// Non-JSON strings pass through untouched.
pub struct JsonResponse;

#[async_trait]
impl Middleware for JsonResponse {
    async fn on_complete(&self, mut response: Response) -> Result<Response> {
        if let Value::String(text) = &response.body {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                response.body = parsed;
            }
        }
        Ok(response)
    }
}

/// Maps failure statuses onto the error taxonomy.
///
/// `2xx` responses return untouched; everything else becomes the matching
/// [`Error`] kind (`400` → `BadRequest`, `404` → `NotFound`, `406` →
/// `NotAcceptable`, `408` → `RequestTimeout`, `422` →
/// `UnprocessableEntity` carrying the body, `5xx` → `ServerError`, other
/// `4xx` → `ClientError`).
pub struct StatusError;

#[async_trait]
impl Middleware for StatusError {
    async fn on_complete(&self, response: Response) -> Result<Response> {
        if response.success() {
            Ok(response)
        } else {
            Err(Error::from_status(response.status, response.body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Echo(Response);

    #[async_trait]
    impl Terminal for Echo {
        async fn call(&self, _request: &mut Request) -> Result<Response> {
            Ok(self.0.clone())
        }
    }

    struct Recorder {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn on_request(&self, _request: &mut Request) -> Result<()> {
            self.trace.lock().unwrap().push(format!("{}:down", self.name));
            Ok(())
        }

        async fn on_complete(&self, response: Response) -> Result<Response> {
            self.trace.lock().unwrap().push(format!("{}:up", self.name));
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_first_registered_is_outermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut stack = MiddlewareStack::new();
        stack.push(Recorder {
            name: "outer",
            trace: trace.clone(),
        });
        stack.push(Recorder {
            name: "inner",
            trace: trace.clone(),
        });

        let mut request = Request::new("users");
        stack
            .run(&mut request, &Echo(Response::no_content()))
            .await
            .unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:down", "inner:down", "inner:up", "outer:up"]
        );
    }

    #[tokio::test]
    async fn test_empty_stack_hits_terminal() {
        let stack = MiddlewareStack::new();
        let mut request = Request::new("users");
        let response = stack
            .run(&mut request, &Echo(Response::new(200, json!({"ok": true}))))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_json_response_parses_string_bodies() {
        let stack = {
            let mut s = MiddlewareStack::new();
            s.push(JsonResponse);
            s
        };
        let mut request = Request::new("users");
        let wire = Response::new(200, Value::String(r#"{"id": 7}"#.to_string()));
        let response = stack.run(&mut request, &Echo(wire)).await.unwrap();
        assert_eq!(response.body, json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_json_response_passes_non_json_through() {
        let stack = {
            let mut s = MiddlewareStack::new();
            s.push(JsonResponse);
            s
        };
        let mut request = Request::new("users");
        let wire = Response::new(200, Value::String("plain text".to_string()));
        let response = stack.run(&mut request, &Echo(wire)).await.unwrap();
        assert_eq!(response.body, Value::String("plain text".to_string()));
    }

    #[tokio::test]
    async fn test_status_error_returns_success_untouched() {
        let stack = MiddlewareStack::standard();
        let mut request = Request::new("users");
        for status in [200u16, 201, 204, 299] {
            let wire = Response::new(status, json!({"fine": true}));
            let response = stack.run(&mut request, &Echo(wire.clone())).await.unwrap();
            assert_eq!(response.status, status);
        }
    }

    #[tokio::test]
    async fn test_status_error_maps_failures() {
        let stack = MiddlewareStack::standard();
        let mut request = Request::new("users");

        let err = stack
            .run(&mut request, &Echo(Response::new(404, Value::Null)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = stack
            .run(&mut request, &Echo(Response::new(503, Value::Null)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerError { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_unprocessable_entity_carries_body() {
        let stack = MiddlewareStack::standard();
        let mut request = Request::new("users");
        let body = json!({"errors": {"email": ["taken"]}});

        let err = stack
            .run(&mut request, &Echo(Response::new(422, body.clone())))
            .await
            .unwrap_err();
        match err {
            Error::UnprocessableEntity { body: carried, errors } => {
                assert_eq!(carried, body);
                assert_eq!(errors["email"], vec!["taken".to_string()]);
            }
            other => panic!("expected UnprocessableEntity, got {:?}", other),
        }
    }
}
