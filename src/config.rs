//! Per-listener configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::BrokerChannel;
use crate::codec::{AutoDecoder, Decoder, Encoder, JsonEncoder};
use crate::error::{BrokerError, ConfigError};
use crate::handler::{BoxedHandler, Handler};

/// Worker count used when the host's parallelism cannot be determined.
const FALLBACK_WORKERS: usize = 4;

/// Delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long a stopping worker lets an in-flight handler finish.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Queue declaration applied by every worker before consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub passive: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A durable, non-exclusive queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            passive: false,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Prefetch limits applied once per worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosOptions {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

impl Default for QosOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            prefetch_size: 0,
            global: false,
        }
    }
}

/// Who acknowledges deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The broker considers a message acknowledged as soon as it is delivered.
    #[default]
    Auto,
    /// The handler acknowledges or rejects through its [`Channel`](crate::handler::Channel).
    Manual,
}

/// Hook run on every freshly opened channel once the queue is declared,
/// before QoS and consume registration.
#[async_trait]
pub trait ChannelSetup: Send + Sync {
    async fn setup(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError>;
}

/// Immutable configuration of one listener.
///
/// Use [`ListenerConfig::builder`] to construct it.
#[derive(Clone)]
pub struct ListenerConfig {
    pub queue: QueueOptions,
    pub qos: QosOptions,
    /// `None` means one worker per logical CPU.
    pub workers: Option<usize>,
    pub decoder: Option<Arc<dyn Decoder>>,
    pub encoder: Option<Arc<dyn Encoder>>,
    /// Queue that handler replies are published to; defaults to `queue`.
    pub reply_queue: Option<String>,
    /// Exchange that handler replies are published to; defaults to the default exchange.
    pub reply_exchange: Option<String>,
    pub ack_mode: AckMode,
    /// Reconnect after connection failures instead of giving up.
    pub restart: bool,
    pub reconnect_delay: Duration,
    /// Time a handler that is running when stop arrives gets to finish before
    /// it is abandoned and the worker closes its connection.
    pub stop_grace: Duration,
    pub channel_setup: Option<Arc<dyn ChannelSetup>>,
    pub(crate) handler: BoxedHandler,
}

impl ListenerConfig {
    /// Creates a new `ListenerConfigBuilder` for a queue and its handler.
    pub fn builder<H, Args>(queue: impl Into<String>, handler: H) -> ListenerConfigBuilder
    where
        H: Handler<Args>,
        Args: Send + 'static,
    {
        ListenerConfigBuilder::new(queue.into(), crate::handler::boxed(handler))
    }

    /// Name of the consumed queue.
    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Number of workers a listener will spawn.
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count)
    }

    /// Routing key for replies; the consumed queue unless overridden.
    pub fn reply_queue(&self) -> &str {
        self.reply_queue.as_deref().unwrap_or(&self.queue.name)
    }

    /// Exchange for replies; empty for the default exchange.
    pub fn reply_exchange(&self) -> &str {
        self.reply_exchange.as_deref().unwrap_or("")
    }

    /// The configured decoder, or [`AutoDecoder`].
    pub fn decoder(&self) -> Arc<dyn Decoder> {
        self.decoder.clone().unwrap_or_else(|| Arc::new(AutoDecoder))
    }

    /// The configured encoder, or [`JsonEncoder`].
    pub fn encoder(&self) -> Arc<dyn Encoder> {
        self.encoder.clone().unwrap_or_else(|| Arc::new(JsonEncoder))
    }

    /// Fills in a decoder and encoder where the registration did not pick one.
    pub(crate) fn inherit_codecs(
        &mut self,
        decoder: Option<&Arc<dyn Decoder>>,
        encoder: Option<&Arc<dyn Encoder>>,
    ) {
        if self.decoder.is_none() {
            self.decoder = decoder.cloned();
        }
        if self.encoder.is_none() {
            self.encoder = encoder.cloned();
        }
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("queue", &self.queue)
            .field("qos", &self.qos)
            .field("workers", &self.workers)
            .field("reply_queue", &self.reply_queue)
            .field("reply_exchange", &self.reply_exchange)
            .field("ack_mode", &self.ack_mode)
            .field("restart", &self.restart)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("stop_grace", &self.stop_grace)
            .finish_non_exhaustive()
    }
}

/// Logical CPU count, or 4 if it cannot be determined.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
}

/// A builder for creating `ListenerConfig` instances.
pub struct ListenerConfigBuilder {
    queue: QueueOptions,
    qos: QosOptions,
    workers: Option<usize>,
    decoder: Option<Arc<dyn Decoder>>,
    encoder: Option<Arc<dyn Encoder>>,
    reply_queue: Option<String>,
    reply_exchange: Option<String>,
    ack_mode: AckMode,
    restart: bool,
    reconnect_delay: Duration,
    stop_grace: Duration,
    channel_setup: Option<Arc<dyn ChannelSetup>>,
    handler: BoxedHandler,
}

impl ListenerConfigBuilder {
    fn new(queue: String, handler: BoxedHandler) -> Self {
        Self {
            queue: QueueOptions::new(queue),
            qos: QosOptions::default(),
            workers: None,
            decoder: None,
            encoder: None,
            reply_queue: None,
            reply_exchange: None,
            ack_mode: AckMode::Auto,
            restart: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
            channel_setup: None,
            handler,
        }
    }

    /// Sets the number of workers.
    /// Defaults to the logical CPU count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Whether the queue survives a broker restart.
    /// Defaults to `true`.
    pub fn durable(mut self, durable: bool) -> Self {
        self.queue.durable = durable;
        self
    }

    /// Only check that the queue exists instead of creating it.
    /// Defaults to `false`.
    pub fn passive(mut self, passive: bool) -> Self {
        self.queue.passive = passive;
        self
    }

    /// Restricts the queue to the declaring connection.
    /// Defaults to `false`.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.queue.exclusive = exclusive;
        self
    }

    /// Deletes the queue once its last consumer is gone.
    /// Defaults to `false`.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.queue.auto_delete = auto_delete;
        self
    }

    /// Sets the QoS prefetch count.
    /// Defaults to 1, so a worker never holds more than the message it is dispatching.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.qos.prefetch_count = count;
        self
    }

    /// Sets the QoS prefetch window in bytes.
    /// Defaults to 0 (no limit).
    pub fn prefetch_size(mut self, size: u32) -> Self {
        self.qos.prefetch_size = size;
        self
    }

    /// Applies QoS to the whole connection instead of each consumer.
    /// Defaults to `false`.
    pub fn global_qos(mut self, global: bool) -> Self {
        self.qos.global = global;
        self
    }

    /// Sets the body decoder.
    /// Defaults to the consumer default, then [`AutoDecoder`].
    pub fn decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Sets the reply encoder.
    /// Defaults to the consumer default, then [`JsonEncoder`].
    pub fn encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoder = Some(Arc::new(encoder));
        self
    }

    /// Sets the queue replies are routed to.
    /// Defaults to the consumed queue.
    pub fn reply_queue(mut self, queue: impl Into<String>) -> Self {
        self.reply_queue = Some(queue.into());
        self
    }

    /// Sets the exchange replies are published through.
    /// Defaults to the default exchange.
    pub fn reply_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.reply_exchange = Some(exchange.into());
        self
    }

    /// Sets who acknowledges deliveries.
    /// Defaults to [`AckMode::Auto`].
    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    /// Whether workers reconnect after connection failures.
    /// Defaults to `true`.
    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    /// Defaults to 2 seconds.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets how long an in-flight handler may run after stop is requested.
    /// Defaults to 5 seconds.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Sets a hook run on every new channel after the queue is declared.
    pub fn channel_setup(mut self, setup: impl ChannelSetup + 'static) -> Self {
        self.channel_setup = Some(Arc::new(setup));
        self
    }

    /// Builds the final `ListenerConfig`.
    pub fn build(self) -> Result<ListenerConfig, ConfigError> {
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::EmptyQueue);
        }
        if self.workers == Some(0) {
            return Err(ConfigError::ZeroWorkers(self.queue.name));
        }
        Ok(ListenerConfig {
            queue: self.queue,
            qos: self.qos,
            workers: self.workers,
            decoder: self.decoder,
            encoder: self.encoder,
            reply_queue: self.reply_queue,
            reply_exchange: self.reply_exchange,
            ack_mode: self.ack_mode,
            restart: self.restart,
            reconnect_delay: self.reconnect_delay,
            stop_grace: self.stop_grace,
            channel_setup: self.channel_setup,
            handler: self.handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AutoEncoder, PassthroughDecoder};

    async fn noop() {}

    #[test]
    fn test_listener_config_builder_defaults() {
        let config = ListenerConfig::builder("orders", noop).build().unwrap();

        assert_eq!(config.queue, QueueOptions::new("orders"));
        assert!(config.queue.durable);
        assert_eq!(config.qos, QosOptions::default());
        assert_eq!(config.effective_workers(), default_worker_count());
        assert_eq!(config.reply_queue(), "orders");
        assert_eq!(config.reply_exchange(), "");
        assert_eq!(config.ack_mode, AckMode::Auto);
        assert!(config.restart);
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.encoder().content_type(), "application/json");
    }

    #[test]
    fn test_listener_config_builder_custom_values() {
        let config = ListenerConfig::builder("orders", noop)
            .workers(3)
            .durable(false)
            .passive(true)
            .exclusive(true)
            .auto_delete(true)
            .prefetch_count(10)
            .prefetch_size(4096)
            .global_qos(true)
            .reply_queue("orders.replies")
            .reply_exchange("replies")
            .ack_mode(AckMode::Manual)
            .restart(false)
            .build()
            .unwrap();

        assert_eq!(config.effective_workers(), 3);
        assert_eq!(
            config.queue,
            QueueOptions {
                name: "orders".into(),
                durable: false,
                passive: true,
                exclusive: true,
                auto_delete: true,
            }
        );
        assert_eq!(
            config.qos,
            QosOptions { prefetch_count: 10, prefetch_size: 4096, global: true }
        );
        assert_eq!(config.reply_queue(), "orders.replies");
        assert_eq!(config.reply_exchange(), "replies");
        assert_eq!(config.ack_mode, AckMode::Manual);
        assert!(!config.restart);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let err = ListenerConfig::builder("orders", noop).workers(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroWorkers("orders".into()));

        let err = ListenerConfig::builder("", noop).build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyQueue);
    }

    #[test]
    fn test_inherit_codecs_keeps_explicit_choice() {
        let mut config = ListenerConfig::builder("orders", noop)
            .decoder(PassthroughDecoder)
            .build()
            .unwrap();
        let decoder: Arc<dyn Decoder> = Arc::new(AutoDecoder);
        let encoder: Arc<dyn Encoder> = Arc::new(AutoEncoder);

        config.inherit_codecs(Some(&decoder), Some(&encoder));

        assert!(config.decoder().decode(b"{}").unwrap().is_raw());
        assert!(config.encoder.is_some());
    }
}
