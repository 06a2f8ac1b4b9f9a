//! Event-state registry
//!
//! Owns every worker and task record, applies incoming events one at a time,
//! and keeps a bounded recency index of task ordering keys for
//! `tasks_by_time`. The maps are the source of truth; the index is an
//! auxiliary view that may hold stale entries, which readers skip.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::StateConfig;
use crate::error::Result;
use crate::event::{
    clock_field, float_field, str_field, Event, EventCategory, TaskTransition, WorkerEventKind,
};
use crate::lamport::LamportKey;
use crate::metrics::StateMetrics;
use crate::snapshot::RegistrySnapshot;
use crate::task::Task;
use crate::worker::{HeartbeatOutcome, Worker};

/// Source of "now", in seconds since the epoch
pub type TimeSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Called once per processed event, after the registry was updated
pub type EventObserver = Box<dyn Fn(&Registry, &Event) + Send + Sync>;

/// Non-owning reference from an index entry to a task incarnation.
///
/// The key's id names the task; the generation tells a task apart from a
/// later task created under the same id after a clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub generation: u64,
}

type IndexKey = LamportKey<TaskHandle>;

/// Wall clock time as float seconds
pub fn wall_clock() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1_000_000_000.0
}

/// In-memory view of the cluster reconstructed from lifecycle events
pub struct Registry {
    workers: HashMap<String, Worker>,
    tasks: HashMap<String, Task>,

    /// Min-heap so the lowest-ranked entries are evicted first
    task_index: BinaryHeap<Reverse<IndexKey>>,

    event_count: u64,
    task_count: u64,
    next_generation: u64,

    config: StateConfig,
    metrics: Arc<StateMetrics>,
    observer: Option<EventObserver>,
    now: TimeSource,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(StateConfig::default())
    }

    pub fn with_config(config: StateConfig) -> Self {
        Self {
            workers: HashMap::new(),
            tasks: HashMap::new(),
            task_index: BinaryHeap::new(),
            event_count: 0,
            task_count: 0,
            next_generation: 0,
            config,
            metrics: Arc::new(StateMetrics::default()),
            observer: None,
            now: Arc::new(wall_clock),
        }
    }

    /// Build a registry configured from the environment
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_config(StateConfig::from_env()?))
    }

    pub fn with_observer(
        mut self,
        observer: impl Fn(&Registry, &Event) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_time_source(mut self, now: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.now = Arc::new(now);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn set_observer(&mut self, observer: Option<EventObserver>) {
        self.observer = observer;
    }

    /// Change the index bound. Takes effect on the next task event.
    pub fn set_max_tasks_in_memory(&mut self, max_tasks: usize) {
        self.config.max_tasks_in_memory = max_tasks;
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<StateMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn workers(&self) -> &HashMap<String, Worker> {
        &self.workers
    }

    pub fn tasks(&self) -> &HashMap<String, Task> {
        &self.tasks
    }

    pub fn worker(&self, hostname: &str) -> Option<&Worker> {
        self.workers.get(hostname)
    }

    pub fn task(&self, uuid: &str) -> Option<&Task> {
        self.tasks.get(uuid)
    }

    /// Total events handed to [`Registry::event`] since the last clear
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Distinct tasks created since the last clear
    pub fn task_count(&self) -> u64 {
        self.task_count
    }

    /// Resolve a task's worker association
    pub fn task_worker(&self, task: &Task) -> Option<&Worker> {
        task.hostname.as_deref().and_then(|h| self.workers.get(h))
    }

    /// Process one event. Never fails: malformed events are dropped.
    pub fn event(&mut self, event: &Event) {
        self.event_count += 1;
        self.metrics.event_processed();

        match event.category() {
            EventCategory::Worker(subtype) => {
                self.worker_event(subtype, &event.fields);
            }
            EventCategory::Task(subtype) => {
                self.task_event(subtype, &event.fields);
            }
            EventCategory::Other(event_type) => {
                debug!(event_type = %event_type, "Ignoring event of unknown category");
            }
        }

        if let Some(observer) = &self.observer {
            observer(self, event);
        }
    }

    /// Apply a `worker-<subtype>` event. Returns the worker and whether it
    /// was created, or `None` if the event had no hostname.
    pub fn worker_event(
        &mut self,
        subtype: &str,
        fields: &Map<String, Value>,
    ) -> Option<(&Worker, bool)> {
        let Some(hostname) = str_field(fields, "hostname") else {
            debug!(subtype = %subtype, "Dropping worker event without hostname");
            self.metrics.event_dropped("missing_hostname");
            return None;
        };
        let now = (self.now)();

        let (worker, created) = get_or_create_worker(&mut self.workers, hostname);
        let was_alive = worker.alive;
        worker.update(fields);
        worker.observe_clock(clock_field(fields));
        let outcome = match WorkerEventKind::from_subtype(subtype) {
            Some(WorkerEventKind::Online) => {
                let outcome = worker.on_heartbeat(
                    float_field(fields, "local_received"),
                    float_field(fields, "timestamp"),
                    now,
                    &self.config,
                );
                worker.on_online();
                outcome
            }
            Some(WorkerEventKind::Offline) => {
                worker.on_offline();
                HeartbeatOutcome::default()
            }
            Some(WorkerEventKind::Heartbeat) => worker.on_heartbeat(
                float_field(fields, "local_received"),
                float_field(fields, "timestamp"),
                now,
                &self.config,
            ),
            None => HeartbeatOutcome::default(),
        };
        let is_alive = worker.alive;

        self.after_heartbeat(outcome, was_alive, is_alive);
        self.workers.get(hostname).map(|worker| (worker, created))
    }

    /// Apply a `task-<subtype>` event. Returns the task and whether it was
    /// created, or `None` if the event lacked a uuid or hostname.
    pub fn task_event(
        &mut self,
        subtype: &str,
        fields: &Map<String, Value>,
    ) -> Option<(&Task, bool)> {
        let Some(uuid) = str_field(fields, "uuid") else {
            debug!(subtype = %subtype, "Dropping task event without uuid");
            self.metrics.event_dropped("missing_uuid");
            return None;
        };
        let Some(hostname) = str_field(fields, "hostname") else {
            debug!(uuid = %uuid, subtype = %subtype, "Dropping task event without hostname");
            self.metrics.event_dropped("missing_hostname");
            return None;
        };
        let now = (self.now)();
        let clock = clock_field(fields);
        let local_received = float_field(fields, "local_received");
        let reported = float_field(fields, "timestamp");
        let timestamp = reported.or(local_received).unwrap_or(now);

        // Any task event is evidence that its worker is up.
        let (worker, _) = get_or_create_worker(&mut self.workers, hostname);
        let was_alive = worker.alive;
        worker.observe_clock(clock);
        let outcome = worker.on_heartbeat(local_received, reported, now, &self.config);
        let is_alive = worker.alive;
        self.after_heartbeat(outcome, was_alive, is_alive);

        let created = !self.tasks.contains_key(uuid);
        if created {
            self.task_count += 1;
            self.metrics.task_seen();
        }
        let (task, _) = self.get_or_create_task(uuid);
        task.hostname = Some(hostname.to_string());
        task.observe_event(clock, timestamp);
        match TaskTransition::from_subtype(subtype) {
            Some(transition) => {
                task.on_transition(transition, timestamp, fields);
            }
            None => task.on_unknown(fields),
        }
        let handle = TaskHandle {
            generation: task.generation,
        };

        self.task_index
            .push(Reverse(LamportKey::new(clock, timestamp, uuid, handle)));
        self.compact_index();

        self.tasks.get(uuid).map(|task| (task, created))
    }

    pub fn get_or_create_worker(&mut self, hostname: &str) -> (&mut Worker, bool) {
        get_or_create_worker(&mut self.workers, hostname)
    }

    pub fn get_or_create_task(&mut self, uuid: &str) -> (&mut Task, bool) {
        match self.tasks.entry(uuid.to_string()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let mut task = Task::new(uuid);
                task.generation = self.next_generation;
                self.next_generation += 1;
                (entry.insert(task), true)
            }
        }
    }

    fn after_heartbeat(&self, outcome: HeartbeatOutcome, was_alive: bool, is_alive: bool) {
        if outcome.drift.is_some() {
            self.metrics.heartbeat_drift();
        }
        match (was_alive, is_alive) {
            (false, true) => self.metrics.worker_up(),
            (true, false) => self.metrics.worker_down(),
            _ => {}
        }
    }

    /// Drop the lowest-ranked index entries once the soft bound is exceeded.
    fn compact_index(&mut self) {
        let threshold = self.config.index_threshold();
        if self.task_index.len() <= threshold {
            return;
        }
        let overflow = self.task_index.len() - threshold;
        for _ in 0..overflow {
            self.task_index.pop();
        }
        self.metrics.index_evicted(overflow);
        debug!(evicted = overflow, retained = threshold, "Compacted task index");
    }

    fn resolve(&self, key: &IndexKey) -> Option<&Task> {
        self.tasks
            .get(&key.id)
            .filter(|task| task.generation == key.payload.generation)
    }

    pub fn index_len(&self) -> usize {
        self.task_index.len()
    }

    /// Index keys, lowest first
    pub fn index_keys(&self) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> = self.task_index.iter().map(|Reverse(k)| k.clone()).collect();
        keys.sort();
        keys
    }

    /// Tasks by descending ordering key, one entry per task.
    pub fn tasks_by_time(&self) -> impl Iterator<Item = (&str, &Task)> + '_ {
        let mut keys: Vec<&IndexKey> = self.task_index.iter().map(|Reverse(k)| k).collect();
        keys.sort_unstable_by(|a, b| b.cmp(a));
        let mut seen: HashSet<&str> = HashSet::new();
        keys.into_iter().filter_map(move |key| {
            let task = self.resolve(key)?;
            seen.insert(task.uuid.as_str())
                .then_some((task.uuid.as_str(), task))
        })
    }

    /// Tasks by descending state-change timestamp
    pub fn tasks_by_timestamp(&self) -> impl Iterator<Item = (&str, &Task)> + '_ {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_unstable_by(|a, b| {
            let (ta, tb) = (a.timestamp.unwrap_or(0.0), b.timestamp.unwrap_or(0.0));
            tb.total_cmp(&ta).then_with(|| a.uuid.cmp(&b.uuid))
        });
        tasks.into_iter().map(|task| (task.uuid.as_str(), task))
    }

    pub fn tasks_by_type<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Task)> + 'a {
        self.tasks_by_timestamp()
            .filter(move |(_, task)| task.name.as_deref() == Some(name))
    }

    pub fn tasks_by_worker<'a>(
        &'a self,
        hostname: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Task)> + 'a {
        self.tasks_by_timestamp()
            .filter(move |(_, task)| task.hostname.as_deref() == Some(hostname))
    }

    /// Distinct task names, sorted
    pub fn task_types(&self) -> impl Iterator<Item = &str> + '_ {
        self.tasks
            .values()
            .filter_map(|task| task.name.as_deref())
            .collect::<BTreeSet<_>>()
            .into_iter()
    }

    pub fn alive_workers(&self) -> impl Iterator<Item = &Worker> + '_ {
        self.workers.values().filter(|worker| worker.alive)
    }

    /// Tasks in map order, at most `limit` of them
    pub fn itertasks(&self, limit: Option<usize>) -> impl Iterator<Item = (&str, &Task)> + '_ {
        self.tasks
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(uuid, task)| (uuid.as_str(), task))
    }

    /// Remove terminal tasks (`ready = true`) or every task.
    pub fn clear_tasks(&mut self, ready: bool) {
        let before = self.tasks.len();
        if ready {
            self.tasks.retain(|_, task| !task.ready());
            let tasks = &self.tasks;
            self.task_index.retain(|Reverse(key)| {
                tasks
                    .get(&key.id)
                    .map_or(false, |task| task.generation == key.payload.generation)
            });
        } else {
            self.tasks.clear();
            self.task_index.clear();
        }
        info!(
            removed = before - self.tasks.len(),
            remaining = self.tasks.len(),
            ready_only = ready,
            "Cleared tasks"
        );
    }

    /// Forget all workers and reset counters, then clear tasks.
    pub fn clear(&mut self, ready: bool) {
        self.workers.clear();
        self.event_count = 0;
        self.task_count = 0;
        self.metrics.set_alive_workers(0);
        self.clear_tasks(ready);
    }

    /// Run `work` with exclusive access to the registry, optionally clearing
    /// it (terminal tasks only) afterwards.
    pub fn freeze_while<R>(&mut self, work: impl FnOnce(&Registry) -> R, clear_after: bool) -> R {
        let result = work(self);
        if clear_after {
            self.clear(true);
        }
        result
    }

    /// Structural copy of the maps and counters
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            workers: self.workers.clone(),
            tasks: self.tasks.clone(),
            event_count: self.event_count,
            task_count: self.task_count,
        }
    }

    /// Rebuild a registry from a snapshot. The recency index is reseeded
    /// with each task's greatest event key, so `tasks_by_time` keeps its
    /// order across the round trip.
    pub fn restore(snapshot: RegistrySnapshot, config: StateConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::with_config(config);
        registry.workers = snapshot.workers;
        registry.tasks = snapshot.tasks;
        registry.event_count = snapshot.event_count;
        registry.task_count = snapshot.task_count;
        registry.next_generation = registry
            .tasks
            .values()
            .map(|task| task.generation + 1)
            .max()
            .unwrap_or(0);

        let keys: Vec<_> = registry
            .tasks
            .values()
            .map(|task| {
                Reverse(task.ordering_key().with_payload(TaskHandle {
                    generation: task.generation,
                }))
            })
            .collect();
        registry.task_index = BinaryHeap::from(keys);
        registry.compact_index();
        registry
            .metrics
            .set_alive_workers(registry.workers.values().filter(|w| w.alive).count());

        info!(
            workers = registry.workers.len(),
            tasks = registry.tasks.len(),
            "Restored registry from snapshot"
        );
        Ok(registry)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workers", &self.workers.len())
            .field("tasks", &self.tasks.len())
            .field("index", &self.task_index.len())
            .field("event_count", &self.event_count)
            .field("task_count", &self.task_count)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

fn get_or_create_worker<'a>(
    workers: &'a mut HashMap<String, Worker>,
    hostname: &str,
) -> (&'a mut Worker, bool) {
    match workers.entry(hostname.to_string()) {
        Entry::Occupied(entry) => (entry.into_mut(), false),
        Entry::Vacant(entry) => (entry.insert(Worker::new(hostname)), true),
    }
}
