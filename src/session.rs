use lapin::options::{
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueDeclareOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::ExchangeType;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No channel opened yet.
    Fresh,
    /// A live channel is cached.
    Open,
    /// The session was closed.
    Closed,
}

/// Exchange declaration options. Unset fields fall back to the configured
/// defaults, then to the broker defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub internal: Option<bool>,
    pub passive: Option<bool>,
}

impl ExchangeOptions {
    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merge(&self, overrides: &ExchangeOptions) -> ExchangeOptions {
        ExchangeOptions {
            durable: overrides.durable.or(self.durable),
            auto_delete: overrides.auto_delete.or(self.auto_delete),
            internal: overrides.internal.or(self.internal),
            passive: overrides.passive.or(self.passive),
        }
    }

    /// Resolve into lapin declare options.
    pub fn to_declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive.unwrap_or(false),
            durable: self.durable.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            internal: self.internal.unwrap_or(false),
            nowait: false,
        }
    }
}

/// Queue declaration options. Unset fields fall back to the configured
/// defaults, then to the broker defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub exclusive: Option<bool>,
    pub passive: Option<bool>,
}

impl QueueOptions {
    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merge(&self, overrides: &QueueOptions) -> QueueOptions {
        QueueOptions {
            durable: overrides.durable.or(self.durable),
            auto_delete: overrides.auto_delete.or(self.auto_delete),
            exclusive: overrides.exclusive.or(self.exclusive),
            passive: overrides.passive.or(self.passive),
        }
    }

    /// Resolve into lapin declare options.
    pub fn to_declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive.unwrap_or(false),
            durable: self.durable.unwrap_or(false),
            exclusive: self.exclusive.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            nowait: false,
        }
    }
}

/// One AMQP channel bound to a pooled connection checkout.
pub struct Session {
    connection: deadpool_lapin::Object,
    channel: Mutex<Option<Channel>>,
    closed: std::sync::atomic::AtomicBool,
    config: Config,
}

impl Session {
    /// Create a session over a pooled connection.
    pub fn new(connection: deadpool_lapin::Object, config: Config) -> Self {
        Session {
            connection,
            channel: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
            config,
        }
    }

    /// The session state.
    pub async fn state(&self) -> SessionState {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return SessionState::Closed;
        }
        match self.channel.lock().await.as_ref() {
            Some(_) => SessionState::Open,
            None => SessionState::Fresh,
        }
    }

    /// Return a live channel, opening or replacing one as needed.
    ///
    /// Publisher confirms are enabled and the configured prefetch applied
    /// on every fresh channel. A dead underlying connection surfaces as
    /// [`Error::Communication`]; the pool recycles it on the next checkout.
    pub async fn channel(&self) -> Result<Channel> {
        let mut guard = self.channel.lock().await;

        // Re-verify under the lock: another caller may have reopened.
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            log::debug!("cached channel is closed, opening a fresh one");
        }

        if !self.connection.status().connected() {
            return Err(Error::communication(
                "broker connection is closed and cannot be restarted in place",
            ));
        }

        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(self.config.channel_prefetch, BasicQosOptions::default())
            .await?;

        *guard = Some(channel.clone());
        self.closed
            .store(false, std::sync::atomic::Ordering::Release);
        Ok(channel)
    }

    /// Resolve an exchange name, declaring it when non-empty.
    ///
    /// The empty name is the broker's default exchange and needs no
    /// declaration. Declared exchanges merge the configured default options
    /// with `options`.
    pub async fn exchange(
        &self,
        name: &str,
        exchange_type: ExchangeType,
        options: &ExchangeOptions,
    ) -> Result<String> {
        if name.is_empty() {
            return Ok(String::new());
        }

        let channel = self.channel().await?;
        let merged = self.config.exchange_options.merge(options);
        channel
            .exchange_declare(
                name,
                exchange_type.to_kind(),
                merged.to_declare_options(),
                FieldTable::default(),
            )
            .await?;
        Ok(name.to_string())
    }

    /// Declare a queue, merging the configured default options with
    /// `options`. An empty name yields a broker-generated name.
    pub async fn queue(&self, name: &str, options: &QueueOptions) -> Result<lapin::Queue> {
        let channel = self.channel().await?;
        let merged = self.config.queue_options.merge(options);
        let queue = channel
            .queue_declare(name, merged.to_declare_options(), FieldTable::default())
            .await?;
        Ok(queue)
    }

    /// Probe a queue with a passive declare.
    ///
    /// Returns an error when the queue no longer exists or the channel is
    /// unusable; the probing channel is closed by the broker on failure,
    /// so the next [`Session::channel`] call opens a fresh one.
    pub async fn queue_exists(&self, name: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Close the channel if open. Idempotent.
    pub async fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Release);
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "session closed").await {
                    log::debug!("error closing channel: {}", e);
                }
            }
        }
    }
}
