//! Narrow capability interface over the broker client.
//!
//! Workers only talk to the broker through these traits, so the consume loop
//! runs unchanged against [`AmqpBroker`](crate::amqp::AmqpBroker) or the
//! in-process [`MemoryBroker`](crate::memory::MemoryBroker).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::config::{QosOptions, QueueOptions};
use crate::connection::ConnectionSpec;
use crate::error::BrokerError;

/// Stream of deliveries produced by a consume registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// One open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// One channel on an open connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn queue_declare(&self, queue: &QueueOptions) -> Result<(), BrokerError>;

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), BrokerError>;

    /// Registers a consumer; with `no_ack` the broker treats deliveries as acknowledged.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &Properties,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
}

/// Message properties: content type and custom headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<String, Value>,
}

impl Properties {
    /// Sets the MIME type of the body.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds or replaces one header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the id that ties a reply to its request.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Looks up a custom header.
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }
}

/// Delivery metadata handed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Queue the listener consumes from.
    pub queue: String,
    /// Consumer tag of the worker that received the message.
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}
