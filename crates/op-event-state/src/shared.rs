use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument};

use crate::event::Event;
use crate::registry::Registry;
use crate::snapshot::RegistrySnapshot;

/// Buffer up to this many events for slow subscribers
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Registry handle shared between one ingesting task and many readers.
///
/// Events are applied under the write lock, one at a time; queries take the
/// read lock and may run in parallel with each other.
#[derive(Clone)]
pub struct SharedRegistry {
    registry: Arc<RwLock<Registry>>,

    /// Forwards every processed event to live listeners
    event_sender: broadcast::Sender<Event>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(RwLock::new(registry)),
            event_sender: tx,
        }
    }

    /// Subscribe to processed events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_sender.subscribe()
    }

    /// Apply an event, then forward it to subscribers
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn event(&self, event: Event) {
        {
            let mut registry = self.registry.write().await;
            registry.event(&event);
        }
        // No subscribers is fine.
        let _ = self.event_sender.send(event);
    }

    /// Run a query against a consistent view
    pub async fn read<R>(&self, query: impl FnOnce(&Registry) -> R) -> R {
        let registry = self.registry.read().await;
        query(&registry)
    }

    /// Run `work` while no event can be applied, optionally clearing the
    /// registry before ingestion resumes.
    #[instrument(skip(self, work))]
    pub async fn freeze_while<R>(&self, work: impl FnOnce(&Registry) -> R, clear_after: bool) -> R {
        let mut registry = self.registry.write().await;
        info!(event_count = registry.event_count(), "Registry frozen");
        registry.freeze_while(work, clear_after)
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.registry.read().await.snapshot()
    }

    pub async fn clear(&self, ready: bool) {
        self.registry.write().await.clear(ready);
    }

    pub async fn clear_tasks(&self, ready: bool) {
        self.registry.write().await.clear_tasks(ready);
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_event(kind: &str, uuid: &str, clock: u64) -> Event {
        Event::from_value(json!({
            "type": format!("task-{}", kind),
            "uuid": uuid,
            "hostname": "w1",
            "clock": clock,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let shared = SharedRegistry::default();
        let mut rx = shared.subscribe();

        shared.event(task_event("received", "a", 1)).await;

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.event_type, "task-received");
        assert_eq!(forwarded.uuid(), Some("a"));
        assert_eq!(shared.read(|r| r.tasks().len()).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ingestion_is_serialized() {
        let shared = SharedRegistry::default();
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..25u64 {
                    shared
                        .event(task_event("started", &format!("t{}-{}", i, j), i * 100 + j))
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let (events, tasks, seen) = shared
            .read(|r| (r.event_count(), r.tasks().len(), r.task_count()))
            .await;
        assert_eq!(events, 200);
        assert_eq!(tasks, 200);
        assert_eq!(seen, 200);
    }

    #[tokio::test]
    async fn test_freeze_while_clears_after() {
        let shared = SharedRegistry::default();
        shared.event(task_event("received", "a", 1)).await;
        shared.event(task_event("succeeded", "b", 2)).await;

        let snapshot = shared.freeze_while(|r| r.snapshot(), true).await;
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(snapshot.event_count, 2);

        let (events, workers, tasks) = shared
            .read(|r| (r.event_count(), r.workers().len(), r.tasks().len()))
            .await;
        assert_eq!(events, 0);
        assert_eq!(workers, 0);
        // only the unfinished task survives
        assert_eq!(tasks, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_freeze_while_holds_off_ingestion() {
        let shared = SharedRegistry::default();
        shared.event(task_event("received", "a", 1)).await;
        let mut rx = shared.subscribe();

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let frozen = {
            let shared = shared.clone();
            tokio::spawn(async move {
                shared
                    .freeze_while(
                        move |r| {
                            let _ = entered_tx.send(());
                            let _ = release_rx.recv();
                            r.event_count()
                        },
                        false,
                    )
                    .await
            })
        };
        entered_rx.await.unwrap();

        let ingest = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.event(task_event("started", "b", 2)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!ingest.is_finished());
        assert!(rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        assert_eq!(frozen.await.unwrap(), 1);
        ingest.await.unwrap();

        assert_eq!(rx.recv().await.unwrap().uuid(), Some("b"));
        let (events, tasks) = shared.read(|r| (r.event_count(), r.tasks().len())).await;
        assert_eq!(events, 2);
        assert_eq!(tasks, 2);
    }

    #[tokio::test]
    async fn test_freeze_while_keeps_state() {
        let shared = SharedRegistry::default();
        shared.event(task_event("received", "a", 1)).await;
        shared.freeze_while(|_| (), false).await;
        assert_eq!(shared.snapshot().await.event_count, 1);

        shared.clear_tasks(false).await;
        assert!(shared.snapshot().await.tasks.is_empty());
        shared.clear(true).await;
        assert!(shared.snapshot().await.is_empty());
    }
}
