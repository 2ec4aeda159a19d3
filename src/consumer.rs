//! Consumer
//!
//! The consumer binds a queue to an exchange and processes deliveries: it
//! parses the virtual URL from the `type` property, resolves a controller
//! through the registry, dispatches the action, and acks or rejects the
//! delivery. When the message carries a `reply_to`, the rendered response
//! is published back with the same correlation id.
//!
//! Exactly one of ack/reject is performed per delivery tag. Deliveries that
//! cannot be acked cleanly are rejected without requeue so a poison message
//! cannot loop; broker-side dead-letter policy takes over from there.
//!
//! A periodic passive declare of the bound queue doubles as a liveness
//! probe: when the queue was removed externally the subscription fails and
//! the outer retry loop reconnects after the configured recovery interval
//! (with jitter, so a fleet of workers does not reconnect in lockstep).

use std::sync::Arc;
use std::time::Duration;

use deadpool_lapin::Pool;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    QueueBindOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use rand::Rng;
use uuid::Uuid;

use crate::config::{self, Config};
use crate::controller::{Registry, RequestHeaders};
use crate::error::{Error, Result};
use crate::request::{ExchangeType, Method};
use crate::response::Response;
use crate::router;
use crate::session::{ExchangeOptions, QueueOptions, Session};

/// What a consumer binds: queue, exchange and routing key.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub queue: String,
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub queue_options: QueueOptions,
}

impl Subscription {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        exchange_type: ExchangeType,
        routing_key: impl Into<String>,
    ) -> Self {
        Subscription {
            queue: queue.into(),
            exchange: exchange.into(),
            exchange_type,
            routing_key: routing_key.into(),
            queue_options: QueueOptions::default(),
        }
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }
}

/// Subscribes queues and dispatches deliveries to registered controllers.
pub struct Consumer {
    pool: Pool,
    registry: Arc<Registry>,
    config: Config,
}

impl Consumer {
    /// Create a consumer over the given pool and controller registry,
    /// with a snapshot of the global configuration.
    pub fn new(pool: Pool, registry: Registry) -> Self {
        Consumer {
            pool,
            registry: Arc::new(registry),
            config: config::global(),
        }
    }

    /// Create a consumer with an explicit configuration.
    pub fn with_config(pool: Pool, registry: Registry, config: Config) -> Self {
        Consumer {
            pool,
            registry: Arc::new(registry),
            config,
        }
    }

    /// Subscribe and process deliveries until the transport fails,
    /// reconnecting per the configured recovery policy.
    pub async fn run(&self, subscription: Subscription) -> Result<()> {
        loop {
            let err = match self.subscribe(&subscription).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if !self.config.automatically_recover {
                return Err(err);
            }

            let jitter = {
                let base = self.config.network_recovery_interval.as_millis() as u64;
                rand::thread_rng().gen_range(0..=base / 2 + 1)
            };
            let delay = self.config.network_recovery_interval + Duration::from_millis(jitter);
            log::error!(
                "subscription on queue {:?} failed ({}), reconnecting in {:?}",
                subscription.queue,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Declare the exchange and queue, bind them, and process deliveries
    /// until the consumer is cancelled or the liveness probe fails.
    pub async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        let connection = self
            .pool
            .get()
            .await
            .map_err(|e| Error::communication(format!("pool checkout failed: {}", e)))?;
        let session = Session::new(connection, self.config.clone());

        let exchange = session
            .exchange(
                &subscription.exchange,
                subscription.exchange_type,
                &ExchangeOptions::default(),
            )
            .await?;
        let queue = session
            .queue(&subscription.queue, &subscription.queue_options)
            .await?;
        let queue_name = queue.name().as_str().to_string();

        let channel = session.channel().await?;
        if !exchange.is_empty() {
            channel
                .queue_bind(
                    &queue_name,
                    &exchange,
                    &subscription.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let mut consumer = channel
            .basic_consume(
                &queue_name,
                &format!("{}-{}", queue_name, Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "subscribed queue {:?} to exchange {:?} (routing key {:?})",
            queue_name,
            exchange,
            subscription.routing_key
        );

        let mut probe = tokio::time::interval(self.config.health_check_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        probe.tick().await; // the first tick fires immediately

        let result = loop {
            tokio::select! {
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.handle_delivery(&channel, delivery).await,
                    Some(Err(e)) => break Err(Error::from(e)),
                    None => break Err(Error::communication("consumer cancelled")),
                },
                _ = probe.tick() => {
                    if let Err(e) = session.queue_exists(&queue_name).await {
                        log::error!("liveness probe for queue {:?} failed: {}", queue_name, e);
                        break Err(e);
                    }
                }
            }
        };

        session.close().await;
        result
    }

    /// Process one delivery: route, dispatch, ack or reject, reply.
    async fn handle_delivery(&self, channel: &Channel, delivery: Delivery) {
        let kind = delivery
            .properties
            .kind()
            .as_ref()
            .map(|k| k.as_str().to_string());
        let kind = match kind {
            Some(kind) => kind,
            None => {
                log::warn!("rejecting delivery without a type property");
                reject(&delivery).await;
                return;
            }
        };

        let method = method_from_properties(&delivery.properties);
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string());
        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|r| r.as_str().to_string());

        let route = match router::dispatch(method, &kind) {
            Ok(route) => route,
            Err(e) => {
                log::warn!("rejecting unroutable delivery {:?}: {}", kind, e);
                reject(&delivery).await;
                return;
            }
        };

        let controller = match self.registry.resolve(&route.controller) {
            Some(controller) => controller,
            None => {
                let detail = format!(
                    "{}::{} is not registered",
                    self.config.controller_namespace,
                    router::camelize(&route.controller)
                );
                log::warn!("rejecting delivery for unresolved controller: {}", detail);
                if let Some(reply_to) = &reply_to {
                    let response = Response::error(501, "NotImplemented", detail);
                    publish_reply(channel, reply_to, correlation_id.as_deref(), &response).await;
                }
                reject(&delivery).await;
                return;
            }
        };

        let headers = RequestHeaders {
            method,
            kind: kind.clone(),
            controller: route.controller.clone(),
            action: route.action.clone(),
            id: route.id.clone(),
            correlation_id: correlation_id.clone(),
            reply_to: reply_to.clone(),
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|c| c.as_str().to_string()),
        };

        match controller.call(headers, route.params, &delivery.data).await {
            Ok(response) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    log::error!("failed to ack delivery for {:?}: {}", kind, e);
                    return;
                }
                if let Some(reply_to) = &reply_to {
                    publish_reply(channel, reply_to, correlation_id.as_deref(), &response).await;
                }
            }
            Err(e) => {
                log::error!("controller {:?} failed on {:?}: {}", route.controller, kind, e);
                if let Some(reply_to) = &reply_to {
                    let response = Response::error(500, "InternalServerError", e.to_string());
                    publish_reply(channel, reply_to, correlation_id.as_deref(), &response).await;
                }
                reject(&delivery).await;
            }
        }
    }
}

/// Reject without requeue; failures are logged, not retried.
async fn reject(delivery: &Delivery) {
    let options = BasicRejectOptions { requeue: false };
    if let Err(e) = delivery.reject(options).await {
        log::error!("failed to reject delivery: {}", e);
    }
}

/// Publish a rendered response to the caller's reply queue on the default
/// exchange, echoing the correlation id.
async fn publish_reply(
    channel: &Channel,
    reply_to: &str,
    correlation_id: Option<&str>,
    response: &Response,
) {
    let payload = match response.to_vec() {
        Ok(payload) => payload,
        Err(e) => {
            log::error!("failed to serialize reply for {:?}: {}", reply_to, e);
            return;
        }
    };

    let publish = channel
        .basic_publish(
            "",
            reply_to,
            BasicPublishOptions::default(),
            &payload,
            reply_properties(correlation_id),
        )
        .await;

    match publish {
        Ok(_confirm) => log::debug!("published reply to {:?}", reply_to),
        Err(e) => log::error!("failed to publish reply to {:?}: {}", reply_to, e),
    }
}

/// Reply properties: JSON content type plus the echoed correlation id.
fn reply_properties(correlation_id: Option<&str>) -> BasicProperties {
    let mut props =
        BasicProperties::default().with_content_type(ShortString::from("application/json"));
    if let Some(correlation_id) = correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id));
    }
    props
}

/// The request verb from the delivery's headers table; absent or
/// unrecognized verbs fall back to `GET`.
fn method_from_properties(properties: &BasicProperties) -> Method {
    let value = properties
        .headers()
        .as_ref()
        .and_then(|table| table.inner().get(&ShortString::from("method")));

    let name = match value {
        Some(AMQPValue::LongString(s)) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        Some(AMQPValue::ShortString(s)) => s.as_str().to_string(),
        _ => return Method::Get,
    };

    Method::parse(&name).unwrap_or(Method::Get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_builder() {
        let subscription = Subscription::new("Q", "X", ExchangeType::Topic, "test_user.ping")
            .with_queue_options(QueueOptions {
                durable: Some(false),
                ..QueueOptions::default()
            });
        assert_eq!(subscription.queue, "Q");
        assert_eq!(subscription.exchange, "X");
        assert_eq!(subscription.exchange_type, ExchangeType::Topic);
        assert_eq!(subscription.routing_key, "test_user.ping");
        assert_eq!(subscription.queue_options.durable, Some(false));
    }

    #[test]
    fn test_method_from_properties() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("method"),
            AMQPValue::LongString("DELETE".into()),
        );
        let props = BasicProperties::default().with_headers(table);
        assert_eq!(method_from_properties(&props), Method::Delete);
    }

    #[test]
    fn test_method_defaults_to_get() {
        assert_eq!(
            method_from_properties(&BasicProperties::default()),
            Method::Get
        );

        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("method"),
            AMQPValue::LongString("BREW".into()),
        );
        let props = BasicProperties::default().with_headers(table);
        assert_eq!(method_from_properties(&props), Method::Get);
    }

    #[test]
    fn test_reply_properties_echo_correlation_id() {
        let props = reply_properties(Some("abc-123"));
        assert_eq!(
            props.correlation_id().as_ref().map(|c| c.as_str()),
            Some("abc-123")
        );
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );

        let props = reply_properties(None);
        assert!(props.correlation_id().is_none());
    }
}
