//! Per-message decode, handler invocation and reply.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;

use crate::broker::{BrokerChannel, Delivery, Metadata, Properties};
use crate::codec::{Body, Decoder, Encoder};
use crate::config::{ListenerConfig, QueueOptions};
use crate::error::{error_chain, BrokerError, DispatchError};
use crate::handler::{BoxedHandler, Channel, Message};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and returned no reply.
    Handled,
    /// The handler's reply was published.
    Replied,
    /// The handler returned an error or panicked.
    HandlerFailed,
    /// The handler succeeded but its reply could not be encoded or published.
    ReplyFailed,
}

/// Runs a listener's handler for each delivery a worker receives.
///
/// Dispatch never fails: decode errors fall back to text, and handler
/// errors and panics are logged and reported as [`DispatchOutcome::HandlerFailed`].
pub struct Dispatcher {
    queue: String,
    consumer_tag: String,
    handler: BoxedHandler,
    decoder: Arc<dyn Decoder>,
    encoder: Arc<dyn Encoder>,
    reply_exchange: String,
    reply_queue: String,
    /// Declaration made before the first reply; `None` when replies go back to
    /// the consumed queue or through a named exchange.
    reply_declare: Option<QueueOptions>,
    reply_declared: AtomicBool,
}

impl Dispatcher {
    /// Builds the dispatcher for one worker of `config`.
    pub fn new(config: &ListenerConfig, consumer_tag: impl Into<String>) -> Self {
        let reply_declare = (config.reply_exchange().is_empty()
            && config.reply_queue() != config.queue_name())
        .then(|| QueueOptions {
            durable: config.queue.durable,
            ..QueueOptions::new(config.reply_queue())
        });
        Self {
            queue: config.queue_name().to_string(),
            consumer_tag: consumer_tag.into(),
            handler: config.handler.clone(),
            decoder: config.decoder(),
            encoder: config.encoder(),
            reply_exchange: config.reply_exchange().to_string(),
            reply_queue: config.reply_queue().to_string(),
            reply_declare,
            reply_declared: AtomicBool::new(false),
        }
    }

    /// Handles one delivery and reports what happened to it.
    pub async fn dispatch(&self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) -> DispatchOutcome {
        let delivery_tag = delivery.delivery_tag;
        log::debug!(
            "Received message on queue '{}'. Tag: {}, routing key: '{}'",
            self.queue,
            delivery_tag,
            delivery.routing_key
        );

        let body = self.decode(&delivery.body, delivery_tag);
        let broker_channel = channel.clone();
        let channel = Channel::new(channel, delivery_tag);
        let correlation_id = delivery.properties.correlation_id.clone();
        let message = Message {
            body,
            channel: channel.clone(),
            metadata: Metadata {
                queue: self.queue.clone(),
                consumer_tag: self.consumer_tag.clone(),
                delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange,
                routing_key: delivery.routing_key,
            },
            properties: delivery.properties,
        };

        let result = AssertUnwindSafe(self.handler.call(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic.as_ref()))));

        let reply = match result {
            Ok(Some(reply)) => reply,
            Ok(None) => return DispatchOutcome::Handled,
            Err(e) => {
                log::error!(
                    "Handler for queue '{}' failed. Tag: {}, Error: {}",
                    self.queue,
                    delivery_tag,
                    error_chain(&e)
                );
                return DispatchOutcome::HandlerFailed;
            }
        };

        if let Err(e) = self.declare_reply_queue(broker_channel.as_ref()).await {
            log::error!(
                "Failed to declare reply queue '{}'. Tag: {}, Error: {}",
                self.reply_queue,
                delivery_tag,
                error_chain(&e)
            );
            return DispatchOutcome::ReplyFailed;
        }

        let mut properties = Properties::default();
        properties.correlation_id = correlation_id;
        match channel
            .publish_encoded(
                &self.reply_exchange,
                &self.reply_queue,
                &reply,
                self.encoder.as_ref(),
                properties,
            )
            .await
        {
            Ok(()) => {
                log::debug!("Published reply to '{}'. Tag: {}", self.reply_queue, delivery_tag);
                DispatchOutcome::Replied
            }
            Err(e) => {
                log::error!(
                    "Failed to publish reply to '{}'. Tag: {}, Error: {}",
                    self.reply_queue,
                    delivery_tag,
                    error_chain(&e)
                );
                DispatchOutcome::ReplyFailed
            }
        }
    }

    /// Declares the reply queue once, so replies routed through the default
    /// exchange are not dropped when nothing has created it yet.
    async fn declare_reply_queue(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        let Some(queue) = &self.reply_declare else {
            return Ok(());
        };
        if self.reply_declared.load(Ordering::Acquire) {
            return Ok(());
        }
        channel.queue_declare(queue).await?;
        self.reply_declared.store(true, Ordering::Release);
        Ok(())
    }

    fn decode(&self, raw: &[u8], delivery_tag: u64) -> Body {
        match self.decoder.decode(raw) {
            Ok(body) => body,
            Err(e) => {
                log::warn!(
                    "Failed to decode message on queue '{}', passing it on as text. Tag: {}, Error: {}",
                    self.queue,
                    delivery_tag,
                    e
                );
                Body::Text(String::from_utf8_lossy(raw).into_owned())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AutoEncoder, JsonDecoder};
    use crate::config::ListenerConfigBuilder;
    use crate::error::BoxError;
    use crate::memory::MemoryBroker;
    use serde_json::{json, Value};

    fn delivery(tag: u64, body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "orders".into(),
            properties: Properties::default().with_correlation_id("req-1"),
            body: body.to_vec(),
        }
    }

    fn dispatcher(builder: ListenerConfigBuilder) -> Dispatcher {
        Dispatcher::new(&builder.build().unwrap(), "orders-0")
    }

    #[tokio::test]
    async fn test_reply_is_encoded_and_published() {
        let broker = MemoryBroker::new();
        let handler = |body: Value| async move { json!({ "echo": body }) };
        let dispatcher = dispatcher(
            ListenerConfig::builder("orders", handler)
                .reply_queue("orders.replies")
                .encoder(AutoEncoder),
        );

        let outcome = dispatcher.dispatch(broker.detached_channel(), delivery(1, br#"{"id":1}"#)).await;

        assert_eq!(outcome, DispatchOutcome::Replied);
        let published = broker.published_to("orders.replies");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "");
        assert_eq!(
            published[0].body,
            AutoEncoder.encode(&json!({"echo": {"id": 1}})).unwrap()
        );
        assert_eq!(
            published[0].properties.content_type.as_deref(),
            Some(AutoEncoder.content_type())
        );
        assert_eq!(published[0].properties.correlation_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_reply_defaults_to_originating_queue() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(ListenerConfig::builder("orders", || async { "done".to_string() }));

        dispatcher.dispatch(broker.detached_channel(), delivery(1, b"x")).await;

        let published = broker.published_to("orders");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].body, br#""done""#);
    }

    #[tokio::test]
    async fn test_reply_queue_is_declared_once_before_publishing() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(
            ListenerConfig::builder("orders", || async { "done".to_string() }).reply_queue("orders.replies"),
        );

        let channel = broker.detached_channel();
        dispatcher.dispatch(channel.clone(), delivery(1, b"x")).await;
        dispatcher.dispatch(channel, delivery(2, b"x")).await;

        assert_eq!(broker.declared("orders.replies"), Some(QueueOptions::new("orders.replies")));
        let declares: Vec<_> = broker
            .events()
            .into_iter()
            .filter(|e| e.starts_with("queue.declare"))
            .collect();
        assert_eq!(declares, vec!["queue.declare orders.replies".to_string()]);
        assert_eq!(broker.published_to("orders.replies").len(), 2);
    }

    #[tokio::test]
    async fn test_reply_queue_not_declared_for_origin_queue_or_named_exchange() {
        let broker = MemoryBroker::new();
        let to_origin = dispatcher(ListenerConfig::builder("orders", || async { "one".to_string() }));
        let to_exchange = dispatcher(
            ListenerConfig::builder("orders", || async { "two".to_string() })
                .reply_exchange("receipts")
                .reply_queue("orders.replies"),
        );

        let channel = broker.detached_channel();
        assert_eq!(to_origin.dispatch(channel.clone(), delivery(1, b"x")).await, DispatchOutcome::Replied);
        assert_eq!(to_exchange.dispatch(channel, delivery(2, b"x")).await, DispatchOutcome::Replied);

        assert!(!broker.events().iter().any(|e| e.starts_with("queue.declare")));
    }

    #[tokio::test]
    async fn test_absent_result_publishes_nothing() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(ListenerConfig::builder("orders", |_: Value| async { Value::Null }));

        let outcome = dispatcher.dispatch(broker.detached_channel(), delivery(1, b"{}")).await;

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_are_contained() {
        let broker = MemoryBroker::new();
        let failing = dispatcher(ListenerConfig::builder("orders", |_: Value| async {
            Err::<(), BoxError>("db down".into())
        }));
        let panicking = dispatcher(ListenerConfig::builder("orders", |body: Value| async move {
            if body == json!(1) {
                panic!("bad order");
            }
        }));

        let channel = broker.detached_channel();
        assert_eq!(failing.dispatch(channel.clone(), delivery(1, b"1")).await, DispatchOutcome::HandlerFailed);
        assert_eq!(panicking.dispatch(channel.clone(), delivery(2, b"1")).await, DispatchOutcome::HandlerFailed);
        assert_eq!(panicking.dispatch(channel, delivery(3, b"2")).await, DispatchOutcome::Handled);
    }

    #[tokio::test]
    async fn test_decode_failure_falls_back_to_text() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(
            ListenerConfig::builder("orders", |body: Body| async move { body.to_value() })
                .decoder(JsonDecoder)
                .reply_queue("out"),
        );

        dispatcher.dispatch(broker.detached_channel(), delivery(1, b"not json")).await;

        assert_eq!(broker.published_to("out")[0].body, br#""not json""#);
    }

    #[tokio::test]
    async fn test_manual_ack_through_channel() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(ListenerConfig::builder("orders", |channel: Channel| async move {
            channel.ack().await
        }));

        let outcome = dispatcher.dispatch(broker.detached_channel(), delivery(9, b"{}")).await;

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(broker.acked(), vec![9]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
