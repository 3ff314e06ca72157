//! In-process broker for tests and local runs.
//!
//! Queues are competing-consumer: each message goes to exactly one consumer.
//! Connection loss is simulated with [`MemoryBroker::sever_connections`] and
//! refused connects with [`MemoryBroker::fail_next_connects`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Properties};
use crate::config::{QosOptions, QueueOptions};
use crate::connection::ConnectionSpec;
use crate::error::BrokerError;

/// A message published through a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: Properties,
}

struct Queue {
    options: Option<QueueOptions>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl Queue {
    fn new(options: Option<QueueOptions>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            options,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    refuse_connects: usize,
    offline: bool,
    connect_attempts: usize,
    open_connections: usize,
    published: Vec<Published>,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
    qos: Vec<QosOptions>,
    events: Vec<String>,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut Queue {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Queue::new(None))
    }

    fn enqueue(&mut self, queue: &str, delivery: Delivery) {
        // The receiver lives in the same entry, so the send cannot fail.
        let _ = self.queue(queue).tx.send(delivery);
    }
}

struct Inner {
    state: Mutex<State>,
    epoch: watch::Sender<u64>,
    next_tag: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panicking test thread.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }
}

/// An in-memory broker implementing [`Broker`].
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                epoch,
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Refuses the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.state().refuse_connects = n;
    }

    /// Refuses every connection attempt while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.state().offline = offline;
    }

    /// Drops every open connection, ending their delivery streams.
    pub fn sever_connections(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
        let mut state = self.inner.state();
        state.open_connections = 0;
        state.events.push("sever".to_string());
    }

    /// Publishes `body` to `queue` through the default exchange.
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.publish_with(queue, body, Properties::default());
    }

    pub fn publish_with(&self, queue: &str, body: impl Into<Vec<u8>>, properties: Properties) {
        let delivery = Delivery {
            delivery_tag: 0,
            redelivered: false,
            exchange: String::new(),
            routing_key: queue.to_string(),
            properties,
            body: body.into(),
        };
        self.inner.state().enqueue(queue, delivery);
    }

    /// Messages published through channels, in order.
    pub fn published(&self) -> Vec<Published> {
        self.inner.state().published.clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.routing_key == routing_key)
            .collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.inner.state().acked.clone()
    }

    /// Rejected delivery tags with their requeue flag.
    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.inner.state().rejected.clone()
    }

    pub fn declared(&self, queue: &str) -> Option<QueueOptions> {
        self.inner
            .state()
            .queues
            .get(queue)
            .and_then(|q| q.options.clone())
    }

    pub fn qos_applied(&self) -> Vec<QosOptions> {
        self.inner.state().qos.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state().open_connections
    }

    /// Broker operations in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.inner.state().events.clone()
    }

    /// A channel that belongs to no connection.
    pub fn detached_channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::new(MemoryChannel::new(self.inner.clone(), self.inner.epoch()))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.inner.state();
        state.connect_attempts += 1;
        if state.offline || state.refuse_connects > 0 {
            state.refuse_connects = state.refuse_connects.saturating_sub(1);
            return Err(BrokerError::Unreachable(spec.display_addr()));
        }
        state.open_connections += 1;
        state.events.push("connect".to_string());
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            epoch: self.inner.epoch(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    epoch: u64,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) || self.inner.epoch() != self.epoch {
            return Err(BrokerError::Closed("connection".to_string()));
        }
        Ok(Arc::new(MemoryChannel::new(self.inner.clone(), self.epoch)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) && self.inner.epoch() == self.epoch {
            let mut state = self.inner.state();
            state.open_connections = state.open_connections.saturating_sub(1);
            state.events.push("connection.close".to_string());
        }
        Ok(())
    }
}

type Unacked = Arc<Mutex<HashMap<u64, (String, Delivery)>>>;

struct MemoryChannel {
    inner: Arc<Inner>,
    epoch: u64,
    closed: watch::Sender<bool>,
    unacked: Unacked,
}

impl MemoryChannel {
    fn new(inner: Arc<Inner>, epoch: u64) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner,
            epoch,
            closed,
            unacked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if *self.closed.borrow() || self.inner.epoch() != self.epoch {
            return Err(BrokerError::Closed("channel".to_string()));
        }
        Ok(())
    }

    fn take_unacked(&self, delivery_tag: u64, multiple: bool) -> Vec<(String, Delivery)> {
        let mut unacked = self.unacked.lock().unwrap_or_else(|p| p.into_inner());
        let tags: Vec<u64> = unacked
            .keys()
            .copied()
            .filter(|tag| *tag == delivery_tag || (multiple && *tag <= delivery_tag))
            .collect();
        tags.into_iter().filter_map(|tag| unacked.remove(&tag)).collect()
    }

    fn requeue(&self, deliveries: Vec<(String, Delivery)>) {
        let mut state = self.inner.state();
        for (queue, mut delivery) in deliveries {
            delivery.redelivered = true;
            state.enqueue(&queue, delivery);
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn queue_declare(&self, queue: &QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        let exists = state
            .queues
            .get(&queue.name)
            .is_some_and(|q| q.options.is_some());
        if queue.passive && !exists {
            return Err(BrokerError::Refused {
                operation: "queue.declare",
                reason: format!("NOT_FOUND - no queue '{}'", queue.name),
            });
        }
        let entry = state.queue(&queue.name);
        if entry.options.is_none() {
            entry.options = Some(queue.clone());
        }
        state.events.push(format!("queue.declare {}", queue.name));
        Ok(())
    }

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        state.qos.push(*qos);
        state.events.push(format!("basic.qos {}", qos.prefetch_count));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let rx = {
            let mut state = self.inner.state();
            let Some(entry) = state.queues.get(queue).filter(|q| q.options.is_some()) else {
                return Err(BrokerError::Refused {
                    operation: "basic.consume",
                    reason: format!("NOT_FOUND - no queue '{}'", queue),
                });
            };
            let rx = entry.rx.clone();
            state.events.push(format!("basic.consume {} {}", queue, consumer_tag));
            rx
        };

        let inner = self.inner.clone();
        let epoch = self.epoch;
        let epoch_rx = self.inner.epoch.subscribe();
        let closed_rx = self.closed.subscribe();
        let unacked = self.unacked.clone();
        let queue = queue.to_string();

        let deliveries = stream::unfold(
            (epoch_rx, closed_rx),
            move |(mut epoch_rx, mut closed_rx)| {
                let rx = rx.clone();
                let inner = inner.clone();
                let unacked = unacked.clone();
                let queue = queue.clone();
                async move {
                    // Both flags only ever move forward, so any change ends the stream.
                    let stopped = *closed_rx.borrow() || *epoch_rx.borrow() != epoch;
                    if stopped {
                        return None;
                    }
                    let mut receiver = rx.lock().await;
                    let next = tokio::select! {
                        delivery = receiver.recv() => delivery,
                        _ = epoch_rx.changed() => None,
                        _ = closed_rx.changed() => None,
                    };
                    drop(receiver);

                    let mut delivery = next?;
                    delivery.delivery_tag = inner.next_tag.fetch_add(1, Ordering::SeqCst);
                    if !no_ack {
                        unacked
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(delivery.delivery_tag, (queue, delivery.clone()));
                    }
                    Some((Ok(delivery), (epoch_rx, closed_rx)))
                }
            },
        );
        Ok(deliveries.boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let acked = self.take_unacked(delivery_tag, multiple);
        let mut state = self.inner.state();
        if acked.is_empty() {
            state.acked.push(delivery_tag);
        }
        state.acked.extend(acked.into_iter().map(|(_, d)| d.delivery_tag));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let rejected = self.take_unacked(delivery_tag, multiple);
        {
            let mut state = self.inner.state();
            state.rejected.push((delivery_tag, requeue));
        }
        if requeue {
            self.requeue(rejected);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &Properties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        state.published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        if exchange.is_empty() {
            let delivery = Delivery {
                delivery_tag: 0,
                redelivered: false,
                exchange: String::new(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
            };
            state.enqueue(routing_key, delivery);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let pending = self.take_unacked(u64::MAX, true);
        self.requeue(pending);
        self.inner.state().events.push("channel.close".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ConnectionSpec {
        ConnectionSpec::builder("memory").build().unwrap()
    }

    async fn consume(broker: &MemoryBroker, queue: &str, no_ack: bool) -> (Arc<dyn BrokerChannel>, DeliveryStream) {
        let conn = broker.connect(&spec()).await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.queue_declare(&QueueOptions::new(queue)).await.unwrap();
        let stream = channel.basic_consume(queue, "t", no_ack).await.unwrap();
        (channel, stream)
    }

    #[tokio::test]
    async fn test_refused_connects_then_success() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect(&spec()).await.is_err());
        assert!(broker.connect(&spec()).await.is_err());
        assert!(broker.connect(&spec()).await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_passive_declare_of_missing_queue_is_refused() {
        let broker = MemoryBroker::new();
        let channel = broker.detached_channel();
        let mut options = QueueOptions::new("missing");
        options.passive = true;

        let err = channel.queue_declare(&options).await.unwrap_err();
        assert!(matches!(err, BrokerError::Refused { operation: "queue.declare", .. }));
    }

    #[tokio::test]
    async fn test_delivers_and_requeues_unacked_on_close() {
        let broker = MemoryBroker::new();
        let (channel, mut stream) = consume(&broker, "jobs", false).await;
        broker.publish("jobs", "one");

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"one");
        assert!(!first.redelivered);

        channel.close().await.unwrap();
        assert!(stream.next().await.is_none());

        let (_channel, mut stream) = consume(&broker, "jobs", false).await;
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"one");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_sever_ends_streams_and_invalidates_channels() {
        let broker = MemoryBroker::new();
        let (channel, mut stream) = consume(&broker, "jobs", true).await;

        broker.sever_connections();

        assert!(stream.next().await.is_none());
        assert!(matches!(
            channel.basic_ack(1, false).await,
            Err(BrokerError::Closed(_))
        ));
        assert_eq!(broker.open_connections(), 0);
    }
}
