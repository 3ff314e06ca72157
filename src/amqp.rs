//! `lapin`-backed implementation of the broker capability traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, ShortString},
    BasicProperties, Connection, ConnectionProperties,
};
use serde_json::{Number, Value};

use crate::broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Properties};
use crate::config::{QosOptions, QueueOptions};
use crate::connection::ConnectionSpec;
use crate::error::BrokerError;

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ over AMQP 0-9-1.
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: Option<ConnectionProperties>,
}

impl AmqpBroker {
    /// A broker that opens a fresh lapin connection per worker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses custom `lapin` connection properties, e.g. a different executor.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self {
            properties: Some(properties),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let properties = self.properties.clone().unwrap_or_default();
        let connection = Connection::connect(&spec.amqp_uri(), properties).await?;
        log::debug!("Connected to RabbitMQ at {}", spec.display_addr());
        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

fn declare_options(queue: &QueueOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: queue.passive,
        durable: queue.durable,
        exclusive: queue.exclusive,
        auto_delete: queue.auto_delete,
        nowait: false,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn queue_declare(&self, queue: &QueueOptions) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(&queue.name, declare_options(queue), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), BrokerError> {
        if qos.prefetch_size != 0 {
            log::debug!(
                "prefetch_size={} is not supported by RabbitMQ and is ignored",
                qos.prefetch_size
            );
        }
        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|delivery| -> Result<Delivery, BrokerError> {
            let delivery = delivery?;
            Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                properties: properties_from_amqp(&delivery.properties),
                body: delivery.data,
            })
        });
        Ok(deliveries.boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &Properties,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties_to_amqp(properties),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

fn properties_from_amqp(props: &BasicProperties) -> Properties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    Properties {
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        message_id: text(props.message_id()),
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        headers: props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn properties_to_amqp(props: &Properties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(content_type) = &props.content_type {
        out = out.with_content_type(content_type.as_str().into());
    }
    if let Some(encoding) = &props.content_encoding {
        out = out.with_content_encoding(encoding.as_str().into());
    }
    if let Some(id) = &props.correlation_id {
        out = out.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &props.reply_to {
        out = out.with_reply_to(reply_to.as_str().into());
    }
    if let Some(id) = &props.message_id {
        out = out.with_message_id(id.as_str().into());
    }
    if let Some(mode) = props.delivery_mode {
        out = out.with_delivery_mode(mode);
    }
    if let Some(priority) = props.priority {
        out = out.with_priority(priority);
    }
    if !props.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &props.headers {
            headers.insert(key.as_str().into(), json_to_amqp(value));
        }
        out = out.with_headers(headers);
    }
    out
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => Value::Array(items.as_slice().iter().map(amqp_to_json).collect()),
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), amqp_to_json(v)))
                .collect(),
        ),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}

fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(n.to_string().into()),
        },
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(json_to_amqp(item));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, item) in map {
                table.insert(key.as_str().into(), json_to_amqp(item));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declare_options_keep_each_flag() {
        let queue = QueueOptions {
            name: "orders".into(),
            durable: false,
            passive: true,
            exclusive: true,
            auto_delete: false,
        };
        let options = declare_options(&queue);
        assert!(!options.durable);
        assert!(options.passive);
        assert!(options.exclusive);
        assert!(!options.auto_delete);
        assert!(!options.nowait);

        let options = declare_options(&QueueOptions {
            auto_delete: true,
            ..QueueOptions::new("orders")
        });
        assert!(options.durable);
        assert!(!options.passive);
        assert!(!options.exclusive);
        assert!(options.auto_delete);
    }

    #[test]
    fn test_headers_survive_conversion() {
        let props = Properties::default()
            .with_content_type("application/json")
            .with_correlation_id("abc")
            .with_header("attempt", 3)
            .with_header("tenant", "acme")
            .with_header("tags", json!(["a", "b"]))
            .with_header("nested", json!({"ok": true}));

        let back = properties_from_amqp(&properties_to_amqp(&props));

        assert_eq!(back, props);
    }

    #[test]
    fn test_amqp_scalars_to_json() {
        assert_eq!(amqp_to_json(&AMQPValue::ShortInt(-2)), json!(-2));
        assert_eq!(amqp_to_json(&AMQPValue::LongUInt(7)), json!(7));
        assert_eq!(amqp_to_json(&AMQPValue::Double(1.5)), json!(1.5));
        assert_eq!(amqp_to_json(&AMQPValue::Void), Value::Null);
    }
}
