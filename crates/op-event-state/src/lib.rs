//! OP Event State - In-memory cluster state from worker/task lifecycle events
//!
//! Consumes an unordered, at-least-once stream of events from independent
//! workers and keeps a queryable picture of what is running where:
//! - Lamport ordering of events across partially synchronized clocks
//! - Out-of-order and duplicate tolerant task state machine
//! - Heartbeat based worker liveness
//! - Bounded recency index of tasks
//! - Consistent snapshots while ingestion continues

pub mod config;
pub mod error;
pub mod event;
pub mod lamport;
pub mod metrics;
pub mod registry;
pub mod shared;
pub mod snapshot;
pub mod task;
pub mod worker;

pub use config::StateConfig;
pub use error::{Result, StateError};
pub use event::{Event, EventCategory, TaskTransition, WorkerEventKind};
pub use lamport::LamportKey;
pub use metrics::StateMetrics;
pub use registry::{EventObserver, Registry, TaskHandle, TimeSource};
pub use shared::SharedRegistry;
pub use snapshot::RegistrySnapshot;
pub use task::{Task, TaskState, INFO_FIELDS};
pub use worker::{HeartbeatOutcome, Worker};
