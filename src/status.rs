//! Worker lifecycle status shared between workers and the orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

/// Lifecycle status of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Spawned, no broker I/O completed yet.
    Starting,
    /// Queue declared, QoS applied and consumer registered.
    Connected,
    /// Lost or never obtained a connection; retrying.
    Disconnected,
    /// Stopped on request. Terminal.
    Stopped,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Connected => "connected",
            WorkerStatus::Disconnected => "disconnected",
            WorkerStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Identifies one spawned worker; unique per spawn.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId {
    pub queue: String,
    pub index: usize,
    pub instance: Uuid,
}

impl WorkerId {
    /// Identity for the worker at `index` of a listener on `queue`, with a fresh instance id.
    pub fn new(queue: impl Into<String>, index: usize) -> Self {
        Self {
            queue: queue.into(),
            index,
            instance: Uuid::new_v4(),
        }
    }

    /// Consumer tag announced to the broker.
    pub fn consumer_tag(&self) -> String {
        format!("{}-{}-{}", self.queue, self.index, self.instance.simple())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.queue, self.index)
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: WorkerStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    status: WorkerStatus,
    history: Vec<StatusChange>,
}

impl Entry {
    fn new(status: WorkerStatus) -> Self {
        Self {
            status,
            history: vec![StatusChange { status, at: Utc::now() }],
        }
    }
}

/// Shared map from worker to status.
///
/// Cloning is cheap and every clone observes the same entries. Workers write
/// only their own entry; the orchestrator reads. Entries are never removed.
#[derive(Clone)]
pub struct StatusRegistry {
    entries: Arc<watch::Sender<BTreeMap<WorkerId, Entry>>>,
}

impl StatusRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self { entries: Arc::new(tx) }
    }

    /// Records a `Starting` entry for a worker about to be spawned.
    pub fn register(&self, id: &WorkerId) {
        self.entries.send_modify(|entries| {
            entries.insert(id.clone(), Entry::new(WorkerStatus::Starting));
        });
    }

    /// Sets a worker's status. Returns `true` if the status changed.
    pub fn transition(&self, id: &WorkerId, status: WorkerStatus) -> bool {
        self.entries.send_if_modified(|entries| match entries.get_mut(id) {
            Some(entry) if entry.status == status => false,
            Some(entry) => {
                entry.status = status;
                entry.history.push(StatusChange { status, at: Utc::now() });
                true
            }
            None => {
                entries.insert(id.clone(), Entry::new(status));
                true
            }
        })
    }

    /// Current status of a worker; `None` if it was never registered.
    pub fn status(&self, id: &WorkerId) -> Option<WorkerStatus> {
        self.entries.borrow().get(id).map(|entry| entry.status)
    }

    /// Every status the worker has gone through, oldest first.
    pub fn history(&self, id: &WorkerId) -> Vec<StatusChange> {
        self.entries
            .borrow()
            .get(id)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    /// Current status of every registered worker.
    pub fn snapshot(&self) -> BTreeMap<WorkerId, WorkerStatus> {
        self.entries
            .borrow()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status))
            .collect()
    }

    /// Number of workers ever registered, stopped ones included.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether no worker was ever registered.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// True if every entry has `status`; vacuously true when empty.
    pub fn all_in(&self, status: WorkerStatus) -> bool {
        self.entries.borrow().values().all(|entry| entry.status == status)
    }

    /// Number of workers currently in `status`.
    pub fn count(&self, status: WorkerStatus) -> usize {
        self.entries
            .borrow()
            .values()
            .filter(|entry| entry.status == status)
            .count()
    }

    /// Resolves after the next write to the registry.
    pub async fn changed(&self) {
        let mut rx = self.entries.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.changed().await;
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_transition() {
        let registry = StatusRegistry::new();
        let id = WorkerId::new("orders", 0);

        registry.register(&id);
        assert_eq!(registry.status(&id), Some(WorkerStatus::Starting));

        assert!(registry.transition(&id, WorkerStatus::Disconnected));
        assert!(!registry.transition(&id, WorkerStatus::Disconnected));
        assert!(registry.transition(&id, WorkerStatus::Connected));

        let statuses: Vec<_> = registry.history(&id).into_iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![WorkerStatus::Starting, WorkerStatus::Disconnected, WorkerStatus::Connected]
        );
    }

    #[test]
    fn test_aggregate_queries() {
        let registry = StatusRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.all_in(WorkerStatus::Connected));

        let a = WorkerId::new("orders", 0);
        let b = WorkerId::new("orders", 1);
        registry.register(&a);
        registry.register(&b);
        registry.transition(&a, WorkerStatus::Connected);

        assert_eq!(registry.len(), 2);
        assert!(!registry.all_in(WorkerStatus::Connected));
        assert_eq!(registry.count(WorkerStatus::Starting), 1);

        registry.transition(&b, WorkerStatus::Connected);
        assert!(registry.all_in(WorkerStatus::Connected));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_worker_ids_are_unique_per_spawn() {
        let a = WorkerId::new("orders", 0);
        let b = WorkerId::new("orders", 0);
        assert_ne!(a, b);
        assert_ne!(a.consumer_tag(), b.consumer_tag());
        assert_eq!(a.to_string(), "orders[0]");
    }

    #[tokio::test]
    async fn test_changed_wakes_on_write() {
        let registry = StatusRegistry::new();
        let id = WorkerId::new("orders", 0);
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.changed().await })
        };
        tokio::task::yield_now().await;

        registry.register(&id);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
