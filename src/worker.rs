//! A single worker: one connection, one channel, one receive loop.
//!
//! ```text
//! Starting ──► Connected ──► Disconnected ──► Connected ...
//!    │             │               │
//!    └─────────────┴───────────────┴──► Stopped (on shutdown)
//! ```

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;

use crate::broker::{Broker, BrokerChannel, BrokerConnection, DeliveryStream};
use crate::config::{AckMode, ListenerConfig};
use crate::connection::ConnectionSpec;
use crate::dispatcher::Dispatcher;
use crate::error::{BrokerError, WorkerError};
use crate::status::{StatusRegistry, WorkerId, WorkerStatus};

/// An open connection/channel pair.
struct Session {
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Session {
    /// Closes the channel, then the connection. Errors on an already dead
    /// connection are expected and only logged.
    async fn close(self, worker: &WorkerId) {
        if let Err(e) = self.channel.close().await {
            log::debug!("Worker {} failed to close channel: {}", worker, e);
        }
        if let Err(e) = self.connection.close().await {
            log::debug!("Worker {} failed to close connection: {}", worker, e);
        }
    }
}

enum Exit {
    Stopped,
    Lost(BrokerError),
}

/// Consumes one queue over its own broker connection, reconnecting as configured.
pub struct Worker {
    id: WorkerId,
    config: Arc<ListenerConfig>,
    spec: Arc<ConnectionSpec>,
    broker: Arc<dyn Broker>,
    registry: StatusRegistry,
    dispatcher: Dispatcher,
}

impl Worker {
    /// Creates a worker; nothing connects until [`Worker::run`] is polled.
    pub fn new(
        id: WorkerId,
        config: Arc<ListenerConfig>,
        spec: Arc<ConnectionSpec>,
        broker: Arc<dyn Broker>,
        registry: StatusRegistry,
    ) -> Self {
        let dispatcher = Dispatcher::new(&config, id.consumer_tag());
        Self {
            id,
            config,
            spec,
            broker,
            registry,
            dispatcher,
        }
    }

    /// The registry key this worker reports under.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Runs until `shutdown` is set (or its sender dropped).
    ///
    /// Connection failures are retried every `reconnect_delay` for as long as
    /// the listener's restart policy allows; with restart disabled the first
    /// failure is returned.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.registry.transition(&self.id, WorkerStatus::Starting);

        loop {
            let failure = match self.open_session(&mut shutdown).await {
                Ok(None) => break,
                Ok(Some((session, deliveries))) => {
                    if self.registry.transition(&self.id, WorkerStatus::Connected) {
                        log::info!(
                            "Worker {} connected to {} and is consuming '{}'",
                            self.id,
                            self.spec.display_addr(),
                            self.config.queue_name()
                        );
                    }
                    let exit = self.consume(&session, deliveries, &mut shutdown).await;
                    session.close(&self.id).await;
                    match exit {
                        Exit::Stopped => break,
                        Exit::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !self.config.restart {
                self.registry.transition(&self.id, WorkerStatus::Disconnected);
                log::error!(
                    "Worker {} lost its connection and restart is disabled: {}",
                    self.id,
                    failure
                );
                return Err(WorkerError::ConnectionFailed {
                    worker: self.id.clone(),
                    source: failure,
                });
            }

            if self.registry.transition(&self.id, WorkerStatus::Disconnected) {
                log::warn!(
                    "Worker {} disconnected: {}. Retrying every {:?}...",
                    self.id,
                    failure,
                    self.config.reconnect_delay
                );
            } else {
                log::debug!("Worker {} still disconnected: {}", self.id, failure);
            }

            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.registry.transition(&self.id, WorkerStatus::Stopped);
        log::info!("Worker {} stopped", self.id);
        Ok(())
    }

    /// Connects, declares the queue, applies QoS and registers the consumer.
    ///
    /// Returns `Ok(None)` if shutdown is requested first. Anything opened by
    /// then is closed before returning.
    async fn open_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<(Session, DeliveryStream)>, BrokerError> {
        let connection = tokio::select! {
            biased;
            _ = stopped(shutdown) => return Ok(None),
            connection = self.broker.connect(&self.spec) => connection?,
        };

        let channel = tokio::select! {
            biased;
            _ = stopped(shutdown) => None,
            channel = connection.create_channel() => Some(channel),
        };
        let channel = match channel {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                self.close_connection(connection.as_ref()).await;
                return Err(e);
            }
            None => {
                self.close_connection(connection.as_ref()).await;
                return Ok(None);
            }
        };
        let session = Session { connection, channel };

        let prepared = tokio::select! {
            biased;
            _ = stopped(shutdown) => None,
            prepared = self.prepare(session.channel.as_ref()) => Some(prepared),
        };
        match prepared {
            Some(Ok(deliveries)) => Ok(Some((session, deliveries))),
            Some(Err(e)) => {
                session.close(&self.id).await;
                Err(e)
            }
            None => {
                session.close(&self.id).await;
                Ok(None)
            }
        }
    }

    async fn close_connection(&self, connection: &dyn BrokerConnection) {
        if let Err(e) = connection.close().await {
            log::debug!("Worker {} failed to close connection: {}", self.id, e);
        }
    }

    async fn prepare(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream, BrokerError> {
        channel.queue_declare(&self.config.queue).await?;
        if let Some(setup) = &self.config.channel_setup {
            setup.setup(channel).await?;
        }
        channel.basic_qos(&self.config.qos).await?;
        channel
            .basic_consume(
                self.config.queue_name(),
                &self.id.consumer_tag(),
                self.config.ack_mode == AckMode::Auto,
            )
            .await
    }

    /// Dispatches deliveries one at a time until shutdown or connection loss.
    ///
    /// A handler still running when shutdown arrives gets `stop_grace` to
    /// finish; after that it is dropped so the session can be closed.
    async fn consume(
        &self,
        session: &Session,
        mut deliveries: DeliveryStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(shutdown) => return Exit::Stopped,
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    let tag = delivery.delivery_tag;
                    let dispatch = self.dispatcher.dispatch(session.channel.clone(), delivery);
                    tokio::pin!(dispatch);
                    tokio::select! {
                        biased;
                        _ = &mut dispatch => {}
                        _ = stopped(shutdown) => {
                            if tokio::time::timeout(self.config.stop_grace, &mut dispatch).await.is_err() {
                                log::warn!(
                                    "Worker {} abandoned handler after {:?}. Tag: {}",
                                    self.id,
                                    self.config.stop_grace,
                                    tag
                                );
                            }
                            return Exit::Stopped;
                        }
                    }
                }
                Some(Err(e)) => return Exit::Lost(e),
                None => {
                    return Exit::Lost(BrokerError::ConsumerCancelled(
                        self.config.queue_name().to_string(),
                    ))
                }
            }
        }
    }
}

/// Resolves once shutdown is requested or the requesting side is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}
