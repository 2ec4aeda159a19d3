//! Request Value Object
//!
//! A [`Request`] assembles everything needed to publish one AMQP message:
//! the virtual URL, the verb, the body, the target exchange, and the AMQP
//! properties. It is a transport contract, not a model: the struct stays
//! passive and mutable so middlewares can adjust it freely on the way down
//! the chain.
//!
//! # Examples
//!
//! ```rust
//! use dumq_rpc::request::{Method, Request};
//! use serde_json::json;
//!
//! let request = Request::new("users/42")
//!     .with_method(Method::Put)
//!     .with_exchange("accounts")
//!     .with_json(json!({"user": {"name": "Gabriel"}}));
//!
//! assert_eq!(request.final_routing_key(), "users/42");
//! ```
//!
//! The `type` property carries the virtual URL (`path[?query]`); the
//! routing key falls back to the path when not set explicitly.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::query;
use crate::session::{ExchangeOptions, QueueOptions};

/// Request verb, mapped to controller actions by the consumer-side router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Wire spelling of the verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Parse the wire spelling back into a verb.
    pub fn parse(value: &str) -> Option<Method> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// AMQP exchange kind used when declaring the target exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        }
    }

    pub fn parse(value: &str) -> Option<ExchangeType> {
        match value {
            "direct" => Some(ExchangeType::Direct),
            "topic" => Some(ExchangeType::Topic),
            "fanout" => Some(ExchangeType::Fanout),
            "headers" => Some(ExchangeType::Headers),
            _ => None,
        }
    }

    /// The matching lapin exchange kind.
    pub fn to_kind(self) -> lapin::ExchangeKind {
        match self {
            ExchangeType::Direct => lapin::ExchangeKind::Direct,
            ExchangeType::Topic => lapin::ExchangeKind::Topic,
            ExchangeType::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeType::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Request payload.
///
/// Mappings serialize as JSON; raw strings travel as-is.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Raw(String),
}

impl Body {
    /// Serialize the body for publication.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Json(value) => serde_json::to_vec(value).map_err(Error::from),
            Body::Raw(text) => Ok(text.clone().into_bytes()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// Everything needed to publish one AMQP message.
#[derive(Debug, Clone)]
pub struct Request {
    /// Virtual URL path, e.g. `users/42`. Mandatory.
    pub path: String,
    /// Request verb. Travels in the AMQP headers table under `method`.
    pub method: Method,
    /// Request payload.
    pub body: Body,
    /// Query filters appended to the `type` property as `?a[b]=1` pairs.
    pub query: Option<Map<String, Value>>,
    /// Target exchange; empty means the default exchange.
    pub exchange: String,
    pub exchange_type: ExchangeType,
    /// Explicit routing key; falls back to `path` when unset.
    pub routing_key: Option<String>,
    /// RPC timeout; falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Application headers, merged into the AMQP headers table.
    pub headers: HashMap<String, String>,
    /// Correlation id; auto-assigned by the producer for RPC.
    pub correlation_id: Option<String>,
    /// Reply queue; set by the producer for RPC.
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Maps to delivery mode 2 when set.
    pub persistent: bool,
    /// Publication timestamp, seconds since the epoch.
    pub timestamp: Option<u64>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    /// Per-call exchange declaration overrides.
    pub exchange_options: ExchangeOptions,
    /// Per-call queue declaration overrides.
    pub queue_options: QueueOptions,
}

impl Request {
    /// Create a request for the given virtual URL path with defaults:
    /// `GET`, JSON content type, current timestamp, transient delivery,
    /// direct exchange type.
    pub fn new(path: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Request {
            path: path.into(),
            method: Method::Get,
            body: Body::Empty,
            query: None,
            exchange: String::new(),
            exchange_type: ExchangeType::Direct,
            routing_key: None,
            timeout: None,
            headers: HashMap::new(),
            correlation_id: None,
            reply_to: None,
            content_type: Some("application/json".to_string()),
            content_encoding: None,
            persistent: false,
            timestamp: Some(now),
            priority: None,
            expiration: None,
            app_id: None,
            message_id: None,
            exchange_options: ExchangeOptions::default(),
            queue_options: QueueOptions::default(),
        }
    }

    /// Set the request verb.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set a JSON body.
    pub fn with_json(mut self, value: Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    /// Set a raw string body.
    pub fn with_raw(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Raw(text.into());
        self
    }

    /// Set the target exchange.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the exchange type.
    pub fn with_exchange_type(mut self, exchange_type: ExchangeType) -> Self {
        self.exchange_type = exchange_type;
        self
    }

    /// Set an explicit routing key.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Set the RPC timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the query filters.
    pub fn with_query(mut self, filters: Map<String, Value>) -> Self {
        self.query = Some(filters);
        self
    }

    /// Add an application header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// The routing key the message publishes under: the explicit routing
    /// key when present, otherwise the path.
    pub fn final_routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.path)
    }

    /// The virtual URL placed in the AMQP `type` property: the path plus
    /// the encoded query, when filters are present.
    pub fn final_type(&self) -> String {
        match &self.query {
            Some(filters) if !filters.is_empty() => {
                format!("{}?{}", self.path, query::encode(filters))
            }
            _ => self.path.clone(),
        }
    }

    /// Build the AMQP properties for publication, omitting unset keys.
    ///
    /// The headers table always carries the `method` entry; the `type`
    /// property carries the virtual URL.
    pub fn amqp_properties(&self) -> BasicProperties {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("method"),
            AMQPValue::LongString(self.method.as_str().into()),
        );
        for (key, value) in &self.headers {
            table.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(value.as_str().into()),
            );
        }

        let mut props = BasicProperties::default()
            .with_kind(ShortString::from(self.final_type().as_str()))
            .with_headers(table);

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.as_str()));
        }
        if let Some(content_encoding) = &self.content_encoding {
            props = props.with_content_encoding(ShortString::from(content_encoding.as_str()));
        }
        if let Some(correlation_id) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.as_str()));
        }
        if self.persistent {
            props = props.with_delivery_mode(2);
        }
        if let Some(timestamp) = self.timestamp {
            props = props.with_timestamp(timestamp);
        }
        if let Some(priority) = self.priority {
            props = props.with_priority(priority);
        }
        if let Some(expiration) = &self.expiration {
            props = props.with_expiration(ShortString::from(expiration.as_str()));
        }
        if let Some(app_id) = &self.app_id {
            props = props.with_app_id(ShortString::from(app_id.as_str()));
        }
        if let Some(message_id) = &self.message_id {
            props = props.with_message_id(ShortString::from(message_id.as_str()));
        }

        props
    }
}
