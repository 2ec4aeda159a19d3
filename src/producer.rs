//! Producer
//!
//! This module provides the producer side of the framework: `fire` publishes
//! a message with no reply expected, `rpc` publishes and blocks the caller
//! until a correlated reply arrives or the timeout elapses.
//!
//! # RPC multiplexing
//!
//! Many concurrent synchronous calls share a single channel. Each call is
//! keyed by a correlation id in a concurrency-safe pending table; a single
//! lazily-started consumer on the broker's `amq.rabbitmq.reply-to`
//! pseudo-queue completes the matching entry for every reply delivery. The
//! listener is created once per producer with double-checked locking; it
//! is never re-created per call, which is what makes direct reply-to cheap.
//!
//! Invariant: every pending entry is removed on success, timeout or error,
//! and each future completes exactly once. Late replies for ids no longer
//! pending are logged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::session::Session;

/// The broker pseudo-queue for direct reply-to consumers.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

type PendingTable = DashMap<String, oneshot::Sender<Vec<u8>>>;

/// Publishes requests on one session, multiplexing RPC replies by
/// correlation id.
pub struct Producer {
    session: Arc<Session>,
    pending: Arc<PendingTable>,
    listener_started: AtomicBool,
    listener_init: Mutex<()>,
    config: Config,
}

impl Producer {
    /// Create a producer over the given session.
    pub fn new(session: Arc<Session>, config: Config) -> Self {
        Producer {
            session,
            pending: Arc::new(DashMap::new()),
            listener_started: AtomicBool::new(false),
            listener_init: Mutex::new(()),
            config,
        }
    }

    /// The session this producer publishes on.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Publish with no reply expected.
    ///
    /// Declares the target exchange when needed, serializes the body and
    /// awaits the publisher confirm.
    pub async fn fire(&self, request: &Request) -> Result<()> {
        let exchange = self
            .session
            .exchange(
                &request.exchange,
                request.exchange_type,
                &request.exchange_options,
            )
            .await?;
        let payload = request.body.to_bytes()?;
        let channel = self.session.channel().await?;

        log::debug!(
            "publishing {} {} to exchange {:?} (routing key {:?})",
            request.method,
            request.final_type(),
            exchange,
            request.final_routing_key(),
        );

        channel
            .basic_publish(
                &exchange,
                request.final_routing_key(),
                BasicPublishOptions::default(),
                &payload,
                request.amqp_properties(),
            )
            .await?
            .await?;

        Ok(())
    }

    /// Publish and block for the correlated reply.
    ///
    /// Assigns a correlation id when the request has none, points
    /// `reply_to` at the direct-reply pseudo-queue, then parks the caller
    /// on a oneshot future until the reply listener completes it. Fails
    /// with [`Error::RequestTimeout`] when the request timeout (or the
    /// configured default) elapses first.
    pub async fn rpc(&self, request: &mut Request) -> Result<Response> {
        self.ensure_reply_listener().await?;

        let correlation_id = request
            .correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        request.reply_to = Some(DIRECT_REPLY_TO.to_string());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        if let Err(e) = self.fire(request).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        let timeout = request.timeout.unwrap_or(self.config.rpc_timeout);
        let reply = tokio::time::timeout(timeout, rx).await;

        // The listener removes the entry when completing it; clean up here
        // for the timeout and listener-death paths.
        self.pending.remove(&correlation_id);

        match reply {
            Ok(Ok(bytes)) => Response::from_slice(&bytes),
            Ok(Err(_)) => Err(Error::communication("reply listener terminated")),
            Err(_) => Err(Error::request_timeout(format!(
                "no reply for {} within {:?}",
                request.final_type(),
                timeout
            ))),
        }
    }

    /// Number of RPCs currently awaiting replies.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Start the direct-reply consumer once, with double-checked locking.
    async fn ensure_reply_listener(&self) -> Result<()> {
        if self.listener_started.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.listener_init.lock().await;
        if self.listener_started.load(Ordering::Acquire) {
            return Ok(());
        }

        let channel = self.session.channel().await?;
        let consumer = channel
            .basic_consume(
                DIRECT_REPLY_TO,
                &format!("rpc-reply-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let pending = self.pending.clone();
        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let correlation_id = delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.as_str().to_string());
                        dispatch_reply(&pending, correlation_id, delivery.data);
                    }
                    Err(e) => {
                        log::error!("reply listener stream error: {}", e);
                        break;
                    }
                }
            }
            log::debug!("reply listener terminated");
        });

        self.listener_started.store(true, Ordering::Release);
        Ok(())
    }
}

/// Complete the pending entry for a reply delivery, exactly once.
fn dispatch_reply(pending: &PendingTable, correlation_id: Option<String>, data: Vec<u8>) {
    match correlation_id {
        Some(id) => match pending.remove(&id) {
            Some((_, tx)) => {
                if tx.send(data).is_err() {
                    log::warn!("rpc caller for correlation id {} is gone, dropping reply", id);
                }
            }
            None => log::warn!("dropping reply with unknown correlation id {}", id),
        },
        None => log::warn!("dropping reply without correlation id"),
    }
}
