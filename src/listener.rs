//! A pool of workers consuming one queue with one handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::config::ListenerConfig;
use crate::connection::ConnectionSpec;
use crate::error::WorkerError;
use crate::status::{StatusRegistry, WorkerId, WorkerStatus};
use crate::worker::Worker;

/// How long [`Listener::stop`] waits for a worker before aborting it.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningWorker {
    id: WorkerId,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), WorkerError>>,
}

/// Spawns and stops the workers for one [`ListenerConfig`].
pub struct Listener {
    config: Arc<ListenerConfig>,
    spec: Arc<ConnectionSpec>,
    broker: Arc<dyn Broker>,
    stop_timeout: Duration,
    registry: Option<StatusRegistry>,
    workers: Vec<RunningWorker>,
}

impl Listener {
    /// Creates a stopped listener; call [`Listener::start`] to spawn its workers.
    pub fn new(config: ListenerConfig, spec: Arc<ConnectionSpec>, broker: Arc<dyn Broker>) -> Self {
        Self {
            config: Arc::new(config),
            spec,
            broker,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            registry: None,
            workers: Vec::new(),
        }
    }

    /// Overrides how long `stop` waits for a busy worker before aborting it.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// The configuration every worker of this listener runs with.
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Spawns the configured number of workers.
    ///
    /// Every worker's `Starting` entry is in `registry` by the time this returns.
    /// Workers whose task has ended are marked stopped and replaced; workers
    /// still running are left alone and keep reporting to the registry they
    /// were started with. Starting a listener whose workers are all running
    /// does nothing.
    pub fn start(&mut self, registry: &StatusRegistry) {
        self.reap_exited();

        let count = self.config.effective_workers();
        if self.workers.len() >= count {
            log::warn!("Listener for queue '{}' is already running", self.config.queue_name());
            return;
        }

        let missing: Vec<usize> = (0..count)
            .filter(|index| !self.workers.iter().any(|w| w.id.index == *index))
            .collect();
        for &index in &missing {
            let id = WorkerId::new(self.config.queue_name(), index);
            registry.register(&id);

            let (shutdown, shutdown_rx) = watch::channel(false);
            let worker = Worker::new(
                id.clone(),
                self.config.clone(),
                self.spec.clone(),
                self.broker.clone(),
                registry.clone(),
            );
            let handle = tokio::spawn(worker.run(shutdown_rx));
            self.workers.push(RunningWorker { id, shutdown, handle });
        }
        self.workers.sort_by_key(|w| w.id.index);
        self.registry = Some(registry.clone());

        log::info!(
            "Started {} worker(s) for queue '{}'",
            missing.len(),
            self.config.queue_name()
        );
    }

    /// Drops workers whose task has ended and marks them stopped.
    fn reap_exited(&mut self) {
        let (exited, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        self.workers = running;

        for RunningWorker { id, .. } in exited {
            log::info!("Replacing worker {}, which has exited", id);
            if let Some(registry) = &self.registry {
                registry.transition(&id, WorkerStatus::Stopped);
            }
        }
    }

    /// Signals every worker to stop and waits for each to exit.
    ///
    /// Workers still busy after the stop timeout are aborted. Calling this on
    /// a listener that is not running does nothing.
    pub async fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        for worker in &self.workers {
            // A worker that already exited dropped its receiver.
            let _ = worker.shutdown.send(true);
        }

        for RunningWorker { id, shutdown, mut handle } in self.workers.drain(..) {
            match tokio::time::timeout(self.stop_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => log::warn!("Worker {} had already failed: {}", id, e),
                Ok(Err(e)) => log::error!("Worker {} ended abnormally: {}", id, e),
                Err(_) => {
                    log::warn!(
                        "Worker {} did not stop within {:?}. Aborting.",
                        id,
                        self.stop_timeout
                    );
                    handle.abort();
                }
            }
            if let Some(registry) = &self.registry {
                registry.transition(&id, WorkerStatus::Stopped);
            }
            drop(shutdown);
        }

        log::info!("Stopped listener for queue '{}'", self.config.queue_name());
    }

    /// Whether the listener was started and none of its workers has exited since.
    pub fn is_listening(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().all(|w| !w.handle.is_finished())
    }

    /// Number of workers spawned and not yet stopped; zero when stopped.
    ///
    /// Includes workers that exited on their own until the next `start` or `stop`.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of workers whose task is still running.
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.handle.is_finished()).count()
    }

    /// Ids of the workers counted by [`Listener::worker_count`], by index.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }

    /// The first worker whose task has already ended, if any.
    pub fn exited_worker(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .find(|w| w.handle.is_finished())
            .map(|w| w.id.clone())
    }

    pub(crate) fn into_config(self) -> ListenerConfig {
        Arc::try_unwrap(self.config).unwrap_or_else(|shared| (*shared).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use serde_json::Value;

    fn spec() -> Arc<ConnectionSpec> {
        Arc::new(ConnectionSpec::builder("memory").build().unwrap())
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_start_registers_every_worker_before_returning() {
        let broker = MemoryBroker::new();
        let registry = StatusRegistry::new();
        let config = ListenerConfig::builder("orders", |_: Value| async {})
            .workers(3)
            .build()
            .unwrap();
        let mut listener = Listener::new(config, spec(), Arc::new(broker.clone()));

        listener.start(&registry);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.count(WorkerStatus::Starting), 3);
        assert!(listener.is_listening());
        assert_eq!(listener.worker_count(), 3);

        wait_until(|| registry.all_in(WorkerStatus::Connected)).await;
        assert_eq!(broker.open_connections(), 3);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_connections() {
        let broker = MemoryBroker::new();
        let registry = StatusRegistry::new();
        let config = ListenerConfig::builder("orders", || async {})
            .workers(2)
            .build()
            .unwrap();
        let mut listener = Listener::new(config, spec(), Arc::new(broker.clone()));
        listener.start(&registry);
        wait_until(|| registry.all_in(WorkerStatus::Connected)).await;

        listener.stop().await;
        listener.stop().await;

        assert!(!listener.is_listening());
        assert_eq!(listener.worker_count(), 0);
        assert!(registry.all_in(WorkerStatus::Stopped));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_connection_of_worker_stuck_in_handler() {
        let broker = MemoryBroker::new();
        let registry = StatusRegistry::new();
        let config = ListenerConfig::builder("orders", || std::future::pending::<()>())
            .workers(1)
            .stop_grace(Duration::from_millis(20))
            .build()
            .unwrap();
        let mut listener = Listener::new(config, spec(), Arc::new(broker.clone()));
        listener.start(&registry);
        wait_until(|| registry.all_in(WorkerStatus::Connected)).await;
        broker.publish("orders", "{}");
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), listener.stop())
            .await
            .expect("stop must not wait for the handler");

        assert!(registry.all_in(WorkerStatus::Stopped));
        assert_eq!(broker.open_connections(), 0);
        assert!(broker.events().contains(&"connection.close".to_string()));
    }

    #[tokio::test]
    async fn test_stop_aborts_worker_past_stop_timeout() {
        let broker = MemoryBroker::new();
        let registry = StatusRegistry::new();
        let config = ListenerConfig::builder("orders", || std::future::pending::<()>())
            .workers(1)
            .stop_grace(Duration::from_secs(3600))
            .build()
            .unwrap();
        let mut listener = Listener::new(config, spec(), Arc::new(broker.clone()))
            .with_stop_timeout(Duration::from_millis(50));
        listener.start(&registry);
        wait_until(|| registry.all_in(WorkerStatus::Connected)).await;
        broker.publish("orders", "{}");
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), listener.stop())
            .await
            .expect("stop must not wait past its timeout");

        assert!(registry.all_in(WorkerStatus::Stopped));
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn test_exited_worker_reports_terminal_failure() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let registry = StatusRegistry::new();
        let config = ListenerConfig::builder("orders", || async {})
            .workers(1)
            .restart(false)
            .build()
            .unwrap();
        let mut listener = Listener::new(config, spec(), Arc::new(broker.clone()));
        listener.start(&registry);

        wait_until(|| listener.exited_worker().is_some()).await;

        assert!(!listener.is_listening());
        assert_eq!(listener.live_workers(), 0);
        assert_eq!(listener.worker_count(), 1);
        assert_eq!(listener.exited_worker(), listener.worker_ids().first().cloned());
        assert_eq!(registry.count(WorkerStatus::Disconnected), 1);
        listener.stop().await;
        assert!(registry.all_in(WorkerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_restart_after_stop_spawns_fresh_workers() {
        let broker = MemoryBroker::new();
        let registry = StatusRegistry::new();
        let config = ListenerConfig::builder("orders", || async {})
            .workers(1)
            .build()
            .unwrap();
        let mut listener = Listener::new(config, spec(), Arc::new(broker.clone()));

        listener.start(&registry);
        let first = listener.worker_ids();
        listener.stop().await;
        listener.start(&registry);
        let second = listener.worker_ids();

        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_start_replaces_exited_workers() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let registry = StatusRegistry::new();
        let config = ListenerConfig::builder("orders", || async {})
            .workers(1)
            .restart(false)
            .build()
            .unwrap();
        let mut listener = Listener::new(config, spec(), Arc::new(broker.clone()));
        listener.start(&registry);
        wait_until(|| listener.exited_worker().is_some()).await;
        let dead = listener.worker_ids();

        broker.set_offline(false);
        listener.start(&registry);
        let fresh = listener.worker_ids();

        assert_eq!(fresh.len(), 1);
        assert_ne!(fresh, dead);
        assert_eq!(fresh[0].index, 0);
        assert_eq!(registry.status(&dead[0]), Some(WorkerStatus::Stopped));
        wait_until(|| registry.status(&fresh[0]) == Some(WorkerStatus::Connected)).await;
        assert!(listener.is_listening());
        assert_eq!(broker.open_connections(), 1);

        listener.start(&registry);
        assert_eq!(listener.worker_ids(), fresh);

        listener.stop().await;
        assert_eq!(broker.open_connections(), 0);
    }
}
