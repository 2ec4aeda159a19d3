//! RPC and Messaging over AMQP 0-9-1
//!
//! This library provides a lightweight RPC-and-messaging framework layered
//! over an AMQP 0-9-1 broker. Application code gets a REST-like programming
//! model (resources with CRUD verbs, controllers with routed actions,
//! middlewares wrapping request and response) while the wire transport is
//! message queues.
//!
//! # Features
//!
//! - **Virtual URLs**: routing metadata encodes `method` + `path[?query]`
//!   in the AMQP `type` property; consumers parse it like a request line
//! - **RPC over direct reply-to**: many concurrent synchronous calls
//!   multiplex one channel via the broker's `amq.rabbitmq.reply-to`
//!   pseudo-queue, correlated by id
//! - **Middleware onion**: ordered wrappers see the request going down and
//!   the response coming up; JSON decoding and status→error mapping ship
//!   built in
//! - **Controllers**: before-action filters, rescue handlers and
//!   structured renders, declared as typed lists
//! - **Resources**: active-record-style models with dirty tracking,
//!   case-preserving attributes and scoped per-call overrides
//!
//! # Quick Start
//!
//! Producer side:
//!
//! ```rust,no_run
//! use dumq_rpc::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> dumq_rpc::error::Result<()> {
//!     let client = Client::from_global()?;
//!
//!     let response = client
//!         .request(
//!             "test_user/ping",
//!             RequestOptions::new()
//!                 .exchange("X")
//!                 .exchange_type(ExchangeType::Topic)
//!                 .routing_key("test_user.ping"),
//!         )
//!         .await?;
//!
//!     println!("status {}: {}", response.status, response.body);
//!     Ok(())
//! }
//! ```
//!
//! Consumer side:
//!
//! ```rust,no_run
//! use dumq_rpc::prelude::*;
//! use serde_json::json;
//!
//! fn ping(ctx: &mut Context) -> ActionFuture<'_> {
//!     Box::pin(async move {
//!         ctx.render("ok", json!({"message": "Pong!"}));
//!         Ok(())
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> dumq_rpc::error::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register(ControllerDef::new("test_user").action("ping", ping));
//!
//!     let pool = dumq_rpc::config::global_pool()?;
//!     let consumer = Consumer::new(pool, registry);
//!     consumer
//!         .run(Subscription::new("Q", "X", ExchangeType::Topic, "test_user.ping"))
//!         .await
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - **`config`**: process-wide defaults, the global pool, fork hooks and
//!   scoped per-call overrides
//! - **`request`**: the publication value object and its AMQP properties
//! - **`session`**: one channel per pooled checkout, declared topology
//! - **`producer`**: `fire` and `rpc`, the pending table, the reply listener
//! - **`middleware`**: the onion around the producer call
//! - **`client`**: the public producer facade
//! - **`consumer`** / **`router`**: subscription, virtual URL dispatch,
//!   ack/reject discipline, replies
//! - **`controller`**: per-message action execution and rendering
//! - **`resource`**: client-side models whose CRUD calls become RPCs
//! - **`query`**: the bracketed nested query-string codec
//! - **`response`** / **`error`**: the wire envelope and the error taxonomy
//!
//! # Process forks
//!
//! Broker sockets must not survive a fork. Host frameworks that fork
//! workers call [`config::on_fork`] in the child before publishing; the
//! global pool is rebuilt lazily.

pub mod client;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod middleware;
pub mod producer;
pub mod query;
pub mod request;
pub mod resource;
pub mod response;
pub mod router;
pub mod session;

pub use client::{Client, RequestOptions};
pub use config::{Config, ConfigBuilder, Pool, ScopeOverrides};
pub use consumer::{Consumer, Subscription};
pub use controller::{ActionFuture, Context, ControllerDef, Registry, RequestHeaders};
pub use error::{Error, Result};
pub use middleware::{JsonResponse, Middleware, MiddlewareStack, Next, StatusError};
pub use producer::{Producer, DIRECT_REPLY_TO};
pub use request::{Body, ExchangeType, Method, Request};
pub use resource::{Attributes, Errors, Instance, Resource};
pub use response::{Response, Status};
pub use session::{ExchangeOptions, QueueOptions, Session};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        Attributes, Body, Client, Config, ConfigBuilder, Consumer, Context, ControllerDef,
        Error, ExchangeOptions, ExchangeType, Instance, JsonResponse, Method, Middleware,
        MiddlewareStack, Producer, QueueOptions, Registry, Request, RequestHeaders,
        RequestOptions, Resource, Response, ScopeOverrides, Session, Status, StatusError,
        Subscription,
    };
    pub use crate::controller::ActionFuture;
    pub use crate::error::Result;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults_follow_the_contract() {
        let request = Request::new("users/42");
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.final_routing_key(), "users/42");
        assert_eq!(request.final_type(), "users/42");
    }

    #[test]
    fn test_virtual_url_round_trip() {
        let filters = match json!({"q": {"active": true, "roles": ["admin"]}}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let request = Request::new("users").with_query(filters.clone());

        let route = router::dispatch(Method::Get, &request.final_type()).unwrap();
        assert_eq!(route.controller, "users");
        assert_eq!(route.params["q"], json!({"active": true, "roles": ["admin"]}));
    }

    #[test]
    fn test_status_table_covers_render_symbols() {
        assert_eq!(Status::from("ok").code(), 200);
        assert_eq!(Status::from("created").code(), 201);
        assert_eq!(Status::from("no_content").code(), 204);
        assert_eq!(Status::from("unprocessable_entity").code(), 422);
    }

    #[test]
    fn test_error_taxonomy_families() {
        let err = Error::from_status(422, json!({"errors": {"email": ["taken"]}}));
        assert!(err.is_client_error());
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn test_default_stack_surfaces_response() {
        use crate::middleware::Terminal;

        struct Fixed;

        #[async_trait::async_trait]
        impl Terminal for Fixed {
            async fn call(&self, _request: &mut Request) -> Result<Response> {
                Ok(Response::new(200, json!({"message": "Pong!"})))
            }
        }

        let stack = MiddlewareStack::standard();
        let mut request = Request::new("test_user/ping");
        let response = stack.run(&mut request, &Fixed).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["message"], "Pong!");
    }
}
