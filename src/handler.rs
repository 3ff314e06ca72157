//! Handler signatures and the values they can ask for.
//!
//! A handler is any async function whose arguments implement [`FromMessage`]
//! and whose output implements [`IntoReply`]. Which arguments it declares
//! decides what it receives:
//!
//! - [`Channel`]: acknowledge, reject and publish on the worker's channel
//! - [`Metadata`]: delivery tag, routing key, exchange, consumer tag
//! - [`Properties`]: content type and custom headers
//! - anything else ([`Body`], [`serde_json::Value`], [`String`], `Vec<u8>`,
//!   [`Json<T>`]): the decoded body
//!
//! ```ignore
//! async fn on_order(channel: Channel, Json(order): Json<Order>) -> Result<(), BoxError> {
//!     process(order).await?;
//!     channel.ack().await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::broker::{BrokerChannel, Metadata, Properties};
use crate::codec::{Body, Encoder};
use crate::error::{BoxError, BrokerError, DispatchError};

/// Everything a handler may bind from one delivery.
pub struct Message {
    pub body: Body,
    pub channel: Channel,
    pub metadata: Metadata,
    pub properties: Properties,
}

/// The worker's channel, scoped to the delivery being handled.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
}

impl Channel {
    pub(crate) fn new(inner: Arc<dyn BrokerChannel>, delivery_tag: u64) -> Self {
        Self { inner, delivery_tag }
    }

    /// Tag of the delivery this channel acknowledges.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledges the current delivery.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.inner.basic_ack(self.delivery_tag, false).await
    }

    /// Rejects the current delivery, optionally returning it to the queue.
    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.inner.basic_nack(self.delivery_tag, false, requeue).await
    }

    /// Publishes raw bytes to `queue` through the default exchange.
    pub async fn publish(&self, queue: &str, body: &[u8], properties: &Properties) -> Result<(), BrokerError> {
        self.inner.basic_publish("", queue, body, properties).await
    }

    /// Publishes raw bytes through `exchange` with `routing_key`.
    pub async fn publish_to(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &Properties,
    ) -> Result<(), BrokerError> {
        self.inner.basic_publish(exchange, routing_key, body, properties).await
    }

    /// Encodes `value` and publishes it, overriding the content type with the encoder's.
    pub async fn publish_encoded(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &Value,
        encoder: &dyn Encoder,
        properties: Properties,
    ) -> Result<(), DispatchError> {
        let body = encoder.encode(value)?;
        let properties = properties.with_content_type(encoder.content_type());
        self.inner
            .basic_publish(exchange, routing_key, &body, &properties)
            .await?;
        Ok(())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

/// Binds one handler argument from a [`Message`].
pub trait FromMessage: Sized {
    fn from_message(message: &Message) -> Result<Self, DispatchError>;
}

impl FromMessage for Channel {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(message.channel.clone())
    }
}

impl FromMessage for Metadata {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(message.metadata.clone())
    }
}

impl FromMessage for Properties {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(message.properties.clone())
    }
}

impl FromMessage for Body {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(message.body.clone())
    }
}

impl FromMessage for Value {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(message.body.to_value())
    }
}

impl FromMessage for String {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(message.body.to_text())
    }
}

impl FromMessage for Vec<u8> {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(message.body.clone().into_bytes())
    }
}

/// A body deserialized into `T`, or a reply serialized from `T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromMessage for Json<T> {
    fn from_message(message: &Message) -> Result<Self, DispatchError> {
        serde_json::from_value(message.body.to_value())
            .map(Json)
            .map_err(|e| DispatchError::Extract {
                argument: std::any::type_name::<T>(),
                reason: e.to_string(),
            })
    }
}

/// Converts a handler's output into an optional reply.
///
/// `()`, `None` and JSON `null` mean "no reply".
pub trait IntoReply {
    fn into_reply(self) -> Result<Option<Value>, DispatchError>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Option<Value>, DispatchError> {
        Ok(None)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> Result<Option<Value>, DispatchError> {
        Ok((!self.is_null()).then_some(self))
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Result<Option<Value>, DispatchError> {
        Ok(Some(Value::String(self)))
    }
}

impl<T: Serialize> IntoReply for Json<T> {
    fn into_reply(self) -> Result<Option<Value>, DispatchError> {
        let value = serde_json::to_value(self.0).map_err(|e| DispatchError::Encode(e.to_string()))?;
        value.into_reply()
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Result<Option<Value>, DispatchError> {
        match self {
            Some(reply) => reply.into_reply(),
            None => Ok(None),
        }
    }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<BoxError>,
{
    fn into_reply(self) -> Result<Option<Value>, DispatchError> {
        match self {
            Ok(reply) => reply.into_reply(),
            Err(e) => Err(DispatchError::Handler(e.into())),
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Option<Value>, DispatchError>>;

/// An async function usable as a listener handler.
///
/// Implemented for functions of up to four [`FromMessage`] arguments.
pub trait Handler<Args>: Clone + Send + Sync + 'static {
    fn call(&self, message: Message) -> HandlerFuture;
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        #[allow(non_snake_case, unused_variables)]
        impl<F, Fut, R, $($arg,)*> Handler<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: IntoReply + Send,
            $($arg: FromMessage + Send + 'static,)*
        {
            fn call(&self, message: Message) -> HandlerFuture {
                let handler = self.clone();
                Box::pin(async move {
                    $(let $arg = $arg::from_message(&message)?;)*
                    handler($($arg),*).await.into_reply()
                })
            }
        }
    };
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);

pub(crate) trait ErasedHandler: Send + Sync {
    fn call(&self, message: Message) -> HandlerFuture;
}

pub(crate) type BoxedHandler = Arc<dyn ErasedHandler>;

struct HandlerFn<H, Args> {
    handler: H,
    _args: PhantomData<fn() -> Args>,
}

impl<H, Args> ErasedHandler for HandlerFn<H, Args>
where
    H: Handler<Args>,
    Args: 'static,
{
    fn call(&self, message: Message) -> HandlerFuture {
        self.handler.call(message)
    }
}

pub(crate) fn boxed<H, Args>(handler: H) -> BoxedHandler
where
    H: Handler<Args>,
    Args: Send + 'static,
{
    Arc::new(HandlerFn {
        handler,
        _args: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    async fn message(body: Body) -> Message {
        let broker = MemoryBroker::new();
        Message {
            body,
            channel: Channel::new(broker.detached_channel(), 7),
            metadata: Metadata {
                queue: "orders".into(),
                consumer_tag: "orders-0".into(),
                delivery_tag: 7,
                redelivered: false,
                exchange: String::new(),
                routing_key: "orders".into(),
            },
            properties: Properties::default().with_header("tenant", "acme"),
        }
    }

    #[tokio::test]
    async fn test_binds_channel_and_body() {
        let handler = |channel: Channel, body: Value| async move {
            json!({ "tag": channel.delivery_tag(), "body": body })
        };
        let reply = boxed(handler)
            .call(message(Body::Json(json!({"id": 1}))).await)
            .await
            .unwrap();

        assert_eq!(reply, Some(json!({"tag": 7, "body": {"id": 1}})));
    }

    #[tokio::test]
    async fn test_single_argument_receives_body() {
        let handler = |body: Value| async move { body };
        let reply = boxed(handler)
            .call(message(Body::Text("hello".into())).await)
            .await
            .unwrap();

        assert_eq!(reply, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_metadata_properties_and_typed_body() {
        let handler = |meta: Metadata, props: Properties, Json(order): Json<Order>| async move {
            assert_eq!(meta.routing_key, "orders");
            assert_eq!(props.header("tenant"), Some(&json!("acme")));
            Json(json!({ "id": order.id }))
        };
        let reply = boxed(handler)
            .call(message(Body::Json(json!({"id": 5}))).await)
            .await
            .unwrap();

        assert_eq!(reply, Some(json!({"id": 5})));
    }

    #[tokio::test]
    async fn test_zero_argument_handler_has_no_reply() {
        let reply = boxed(|| async {}).call(message(Body::Raw(vec![1])).await).await.unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_handler_error_and_bad_body_surface_as_errors() {
        let failing = |_body: Value| async move { Err::<(), _>("boom") };
        let err = boxed(failing)
            .call(message(Body::Json(json!(1))).await)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(e) if e.to_string() == "boom"));

        let typed = |Json(order): Json<Order>| async move { order.id.to_string() };
        let err = boxed(typed)
            .call(message(Body::Text("not json".into())).await)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Extract { .. }));
    }

    #[test]
    fn test_absent_replies() {
        assert_eq!(Value::Null.into_reply().unwrap(), None);
        assert_eq!(None::<Value>.into_reply().unwrap(), None);
        assert_eq!(Ok::<_, BoxError>(Some(json!(1))).into_reply().unwrap(), Some(json!(1)));
    }
}
