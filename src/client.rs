//! Client
//!
//! The [`Client`] is the public producer facade. For every call it checks a
//! connection out of the pool, wraps it in a fresh [`Session`], builds the
//! middleware chain with the producer's `rpc` or `fire` as the terminal
//! step, and releases the session when the chain unwinds.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dumq_rpc::client::{Client, RequestOptions};
//! use dumq_rpc::request::{ExchangeType, Method};
//! use serde_json::json;
//!
//! # async fn example() -> dumq_rpc::error::Result<()> {
//! let client = Client::from_global()?;
//!
//! let response = client
//!     .request(
//!         "test_user/ping",
//!         RequestOptions::new()
//!             .exchange("X")
//!             .exchange_type(ExchangeType::Topic)
//!             .routing_key("test_user.ping"),
//!     )
//!     .await?;
//! assert_eq!(response.status, 200);
//!
//! client
//!     .publish(
//!         "audits",
//!         RequestOptions::new()
//!             .method(Method::Post)
//!             .exchange("audit")
//!             .body(json!({"event": "login"})),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_lapin::Pool;
use serde_json::{Map, Value};

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::middleware::{MiddlewareStack, Terminal};
use crate::producer::Producer;
use crate::request::{Body, ExchangeType, Method, Request};
use crate::response::Response;
use crate::session::{ExchangeOptions, QueueOptions, Session};

/// Recognized per-call options for [`Client::request`] and
/// [`Client::publish`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub body: Option<Value>,
    pub raw_body: Option<String>,
    pub query: Option<Map<String, Value>>,
    pub exchange: Option<String>,
    pub exchange_type: Option<ExchangeType>,
    pub routing_key: Option<String>,
    pub timeout: Option<Duration>,
    pub headers: HashMap<String, String>,
    pub exchange_options: ExchangeOptions,
    pub queue_options: QueueOptions,
}

impl RequestOptions {
    pub fn new() -> Self {
        RequestOptions::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn raw_body(mut self, body: impl Into<String>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    pub fn query(mut self, query: Map<String, Value>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn exchange_type(mut self, exchange_type: ExchangeType) -> Self {
        self.exchange_type = Some(exchange_type);
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.exchange_options = options;
        self
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }
}

/// Public producer facade over a connection pool.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
    stack: MiddlewareStack,
    config: Config,
}

impl Client {
    /// Create a client over the given pool with the standard middleware
    /// stack and a snapshot of the global configuration.
    pub fn new(pool: Pool) -> Self {
        Client {
            pool,
            stack: MiddlewareStack::standard(),
            config: config::global(),
        }
    }

    /// Create a client with an explicit configuration.
    pub fn with_config(pool: Pool, config: Config) -> Self {
        Client {
            pool,
            stack: MiddlewareStack::standard(),
            config,
        }
    }

    /// Create a client over the lazily-built global pool.
    pub fn from_global() -> Result<Self> {
        Ok(Client::new(config::global_pool()?))
    }

    /// Reconfigure the middleware stack.
    pub fn configure_stack(mut self, configure: impl FnOnce(&mut MiddlewareStack)) -> Self {
        configure(&mut self.stack);
        self
    }

    /// Publish and block for the correlated reply.
    pub async fn request(&self, path: &str, options: RequestOptions) -> Result<Response> {
        self.request_with(path, options, |_| {}).await
    }

    /// Like [`Client::request`], with a final callback over the built
    /// [`Request`] before it enters the chain.
    pub async fn request_with(
        &self,
        path: &str,
        options: RequestOptions,
        configure: impl FnOnce(&mut Request),
    ) -> Result<Response> {
        let mut request = self.build_request(path, options);
        configure(&mut request);

        let producer = self.checkout().await?;
        let result = self.stack.run(&mut request, &RpcTerminal(&producer)).await;
        producer.session().close().await;
        result
    }

    /// Publish with no reply expected.
    pub async fn publish(&self, path: &str, options: RequestOptions) -> Result<()> {
        self.publish_with(path, options, |_| {}).await
    }

    /// Like [`Client::publish`], with a final callback over the built
    /// [`Request`] before it enters the chain.
    pub async fn publish_with(
        &self,
        path: &str,
        options: RequestOptions,
        configure: impl FnOnce(&mut Request),
    ) -> Result<()> {
        let mut request = self.build_request(path, options);
        configure(&mut request);

        let producer = self.checkout().await?;
        let result = self.stack.run(&mut request, &FireTerminal(&producer)).await;
        producer.session().close().await;
        result.map(|_| ())
    }

    /// The configuration this client operates under.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The pool connections are checked out of.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn build_request(&self, path: &str, options: RequestOptions) -> Request {
        let mut request = Request::new(path);
        if let Some(method) = options.method {
            request.method = method;
        }
        if let Some(body) = options.body {
            request.body = Body::Json(body);
        } else if let Some(raw) = options.raw_body {
            request.body = Body::Raw(raw);
        }
        request.query = options.query;
        if let Some(exchange) = options.exchange {
            request.exchange = exchange;
        }
        if let Some(exchange_type) = options.exchange_type {
            request.exchange_type = exchange_type;
        }
        request.routing_key = options.routing_key;
        request.timeout = options.timeout;
        request.headers = options.headers;
        request.exchange_options = options.exchange_options;
        request.queue_options = options.queue_options;
        request
    }

    async fn checkout(&self) -> Result<Producer> {
        let connection = self
            .pool
            .get()
            .await
            .map_err(|e| Error::communication(format!("pool checkout failed: {}", e)))?;
        let session = Arc::new(Session::new(connection, self.config.clone()));
        Ok(Producer::new(session, self.config.clone()))
    }
}

struct RpcTerminal<'a>(&'a Producer);

#[async_trait]
impl Terminal for RpcTerminal<'_> {
    async fn call(&self, request: &mut Request) -> Result<Response> {
        self.0.rpc(request).await
    }
}

struct FireTerminal<'a>(&'a Producer);

#[async_trait]
impl Terminal for FireTerminal<'_> {
    async fn call(&self, request: &mut Request) -> Result<Response> {
        self.0.fire(request).await?;
        Ok(Response::no_content())
    }
}
