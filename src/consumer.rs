//! The orchestrator: registers listeners, starts them, waits for every worker
//! to connect and optionally blocks until the process is told to stop.
//!
//! ```ignore
//! let mut consumer = Consumer::new(ConnectionSpec::from_env()?, AmqpBroker::new());
//! consumer.listen(ListenerConfig::builder("orders", on_order).workers(2).build()?);
//! consumer.start(true).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::codec::{Decoder, Encoder};
use crate::config::ListenerConfig;
use crate::connection::ConnectionSpec;
use crate::error::ConsumerError;
use crate::listener::Listener;
use crate::signal::wait_for_shutdown_signal;
use crate::status::{StatusRegistry, WorkerId, WorkerStatus};

/// Upper bound between two startup barrier checks.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identifies a registration made with [`Consumer::listen`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: usize,
    queue: String,
}

impl ListenerHandle {
    /// Name of the queue the registration consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

enum Slot {
    Pending(ListenerConfig),
    Started(Listener),
}

struct Registration {
    handle: ListenerHandle,
    slot: Slot,
}

/// Registrations without connection details, merged into a [`Consumer`] with
/// [`Consumer::add`].
#[derive(Default)]
pub struct ListenerSet {
    configs: Vec<ListenerConfig>,
    decoder: Option<Arc<dyn Decoder>>,
    encoder: Option<Arc<dyn Encoder>>,
}

impl ListenerSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for registrations in this set that do not pick one.
    pub fn with_default_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Encoder for registrations in this set that do not pick one.
    pub fn with_default_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoder = Some(Arc::new(encoder));
        self
    }

    /// Adds a registration to the set.
    pub fn listen(&mut self, config: ListenerConfig) -> &mut Self {
        self.configs.push(config);
        self
    }

    /// Number of registrations in the set.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the set has no registrations.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    fn into_configs(self) -> Vec<ListenerConfig> {
        let Self { configs, decoder, encoder } = self;
        configs
            .into_iter()
            .map(|mut config| {
                config.inherit_codecs(decoder.as_ref(), encoder.as_ref());
                config
            })
            .collect()
    }
}

impl From<Consumer> for ListenerSet {
    /// Takes the consumer's registrations that are not running.
    ///
    /// Listeners still running in `consumer` are dropped with it, which stops
    /// their workers.
    fn from(consumer: Consumer) -> Self {
        let Consumer {
            decoder,
            encoder,
            registrations,
            ..
        } = consumer;

        let mut configs = Vec::new();
        for registration in registrations {
            match registration.slot {
                Slot::Pending(config) => configs.push(config),
                Slot::Started(listener) if !listener.is_listening() => {
                    configs.push(listener.into_config())
                }
                Slot::Started(listener) => log::warn!(
                    "Dropping running listener for queue '{}' while merging consumers",
                    listener.config().queue_name()
                ),
            }
        }

        ListenerSet {
            configs,
            decoder,
            encoder,
        }
    }
}

/// Owns the connection details and every listener registered against them.
pub struct Consumer {
    spec: Arc<ConnectionSpec>,
    broker: Arc<dyn Broker>,
    decoder: Option<Arc<dyn Decoder>>,
    encoder: Option<Arc<dyn Encoder>>,
    registrations: Vec<Registration>,
    next_id: usize,
    registry: StatusRegistry,
}

impl Consumer {
    /// Creates a consumer with no registrations.
    pub fn new(spec: ConnectionSpec, broker: impl Broker) -> Self {
        Self {
            spec: Arc::new(spec),
            broker: Arc::new(broker),
            decoder: None,
            encoder: None,
            registrations: Vec::new(),
            next_id: 0,
            registry: StatusRegistry::new(),
        }
    }

    /// Decoder for registrations that do not pick one. Applied when listeners start.
    pub fn with_default_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Encoder for registrations that do not pick one. Applied when listeners start.
    pub fn with_default_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoder = Some(Arc::new(encoder));
        self
    }

    /// The connection details every worker uses.
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// Registers a listener. It is spawned by the next [`Consumer::start`].
    pub fn listen(&mut self, config: ListenerConfig) -> ListenerHandle {
        let handle = ListenerHandle {
            id: self.next_id,
            queue: config.queue_name().to_string(),
        };
        self.next_id += 1;
        log::debug!("Registered listener for queue '{}'", handle.queue);
        self.registrations.push(Registration {
            handle: handle.clone(),
            slot: Slot::Pending(config),
        });
        handle
    }

    /// Merges another set of registrations into this consumer.
    ///
    /// Accepts a [`ListenerSet`] or another [`Consumer`]; from a consumer only
    /// the registrations that are not running are taken.
    pub fn add(&mut self, other: impl Into<ListenerSet>) -> Vec<ListenerHandle> {
        other
            .into()
            .into_configs()
            .into_iter()
            .map(|config| self.listen(config))
            .collect()
    }

    /// Starts every registered listener that is not already running, then
    /// waits until each of their workers reports connected.
    ///
    /// A listener with workers that exited on their own counts as not running;
    /// only its exited workers are replaced.
    ///
    /// Returns the number of running workers. With `halt`, it then waits for
    /// a shutdown signal, stops every listener and returns.
    pub async fn start(&mut self, halt: bool) -> Result<usize, ConsumerError> {
        if !self.is_listening() {
            self.registry = StatusRegistry::new();
        }

        for registration in &mut self.registrations {
            if let Slot::Pending(config) = &registration.slot {
                let mut config = config.clone();
                config.inherit_codecs(self.decoder.as_ref(), self.encoder.as_ref());
                registration.slot = Slot::Started(Listener::new(
                    config,
                    self.spec.clone(),
                    self.broker.clone(),
                ));
            }
            if let Slot::Started(listener) = &mut registration.slot {
                if !listener.is_listening() {
                    listener.start(&self.registry);
                }
            }
        }

        if let Err(e) = self.wait_until_connected().await {
            log::error!("Consumer failed to start: {}", e);
            self.stop().await;
            return Err(e);
        }

        let total = self.worker_count();
        log::info!(
            "Consumer started {} worker(s) across {} listener(s) on {}",
            total,
            self.registrations.len(),
            self.spec.display_addr()
        );

        if halt {
            let signal = wait_for_shutdown_signal().await;
            self.stop().await;
            signal?;
        }
        Ok(total)
    }

    /// Stops every running listener.
    pub async fn stop(&mut self) {
        for registration in &mut self.registrations {
            if let Slot::Started(listener) = &mut registration.slot {
                listener.stop().await;
            }
        }
        log::info!("Consumer stopped");
    }

    /// The registry of the current (or last) run.
    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    /// Whether any worker of any listener is still running.
    pub fn is_listening(&self) -> bool {
        self.listeners().any(|listener| listener.live_workers() > 0)
    }

    /// Number of workers currently running.
    pub fn worker_count(&self) -> usize {
        self.listeners().map(Listener::worker_count).sum()
    }

    /// The started listener behind a registration; `None` while it is pending.
    pub fn listener(&self, handle: &ListenerHandle) -> Option<&Listener> {
        self.registrations
            .iter()
            .find(|r| r.handle == *handle)
            .and_then(|r| match &r.slot {
                Slot::Started(listener) => Some(listener),
                Slot::Pending(_) => None,
            })
    }

    /// Current status of each running worker of one registration.
    pub fn workers(&self, handle: &ListenerHandle) -> BTreeMap<WorkerId, WorkerStatus> {
        self.listener(handle)
            .map(|listener| {
                listener
                    .worker_ids()
                    .into_iter()
                    .filter_map(|id| self.registry.status(&id).map(|status| (id, status)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn listeners(&self) -> impl Iterator<Item = &Listener> {
        self.registrations.iter().filter_map(|r| match &r.slot {
            Slot::Started(listener) => Some(listener),
            Slot::Pending(_) => None,
        })
    }

    /// Blocks until every current worker is connected, or fails if a worker
    /// ends first.
    async fn wait_until_connected(&self) -> Result<(), ConsumerError> {
        loop {
            if self.all_connected() {
                return Ok(());
            }
            if let Some(id) = self.listeners().find_map(Listener::exited_worker) {
                return Err(ConsumerError::WorkerExited(id));
            }
            tokio::select! {
                _ = self.registry.changed() => {}
                _ = tokio::time::sleep(STARTUP_POLL_INTERVAL) => {}
            }
        }
    }

    /// Replaced workers stay in the registry as stopped, so only the workers
    /// the listeners hold now are checked.
    fn all_connected(&self) -> bool {
        self.listeners()
            .flat_map(Listener::worker_ids)
            .all(|id| self.registry.status(&id) == Some(WorkerStatus::Connected))
    }
}
