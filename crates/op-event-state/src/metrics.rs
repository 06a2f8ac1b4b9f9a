use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Result, StateError};

/// Event-state metrics collector
#[derive(Clone)]
pub struct StateMetrics {
    /// Events handed to the registry, including dropped ones
    events_processed: IntCounter,

    /// Events dropped for missing routing fields, by reason
    events_dropped: IntCounterVec,

    /// Distinct task executions first seen
    tasks_seen: IntCounter,

    /// Index entries discarded by compaction
    index_evictions: IntCounter,

    /// Heartbeats whose sender clock was too far from the receiver's
    heartbeat_drift_warnings: IntCounter,

    /// Workers currently believed alive
    alive_workers: IntGauge,

    registry: Registry,
}

impl StateMetrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_processed = IntCounter::new(
            "op_events_processed_total",
            "Total number of events processed by the state registry",
        )?;
        registry.register(Box::new(events_processed.clone()))?;

        let events_dropped = IntCounterVec::new(
            Opts::new(
                "op_events_dropped_total",
                "Events dropped for missing routing fields",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(events_dropped.clone()))?;

        let tasks_seen = IntCounter::new(
            "op_events_tasks_seen_total",
            "Total number of distinct task executions observed",
        )?;
        registry.register(Box::new(tasks_seen.clone()))?;

        let index_evictions = IntCounter::new(
            "op_events_index_evictions_total",
            "Recency index entries discarded by compaction",
        )?;
        registry.register(Box::new(index_evictions.clone()))?;

        let heartbeat_drift_warnings = IntCounter::new(
            "op_events_heartbeat_drift_total",
            "Heartbeats received with substantial clock drift",
        )?;
        registry.register(Box::new(heartbeat_drift_warnings.clone()))?;

        let alive_workers = IntGauge::new(
            "op_events_alive_workers",
            "Number of workers currently believed alive",
        )?;
        registry.register(Box::new(alive_workers.clone()))?;

        Ok(Self {
            events_processed,
            events_dropped,
            tasks_seen,
            index_evictions,
            heartbeat_drift_warnings,
            alive_workers,
            registry,
        })
    }

    pub fn event_processed(&self) {
        self.events_processed.inc();
    }

    pub fn event_dropped(&self, reason: &str) {
        self.events_dropped.with_label_values(&[reason]).inc();
    }

    pub fn task_seen(&self) {
        self.tasks_seen.inc();
    }

    pub fn index_evicted(&self, count: usize) {
        self.index_evictions.inc_by(count as u64);
    }

    pub fn heartbeat_drift(&self) {
        self.heartbeat_drift_warnings.inc();
    }

    pub fn set_alive_workers(&self, count: usize) {
        self.alive_workers.set(count as i64);
    }

    pub fn worker_up(&self) {
        self.alive_workers.inc();
    }

    pub fn worker_down(&self) {
        self.alive_workers.dec();
    }

    pub fn alive_workers(&self) -> i64 {
        self.alive_workers.get()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.get()
    }

    pub fn events_dropped(&self, reason: &str) -> u64 {
        self.events_dropped.with_label_values(&[reason]).get()
    }

    pub fn index_evictions(&self) -> u64 {
        self.index_evictions.get()
    }

    pub fn heartbeat_drift_warnings(&self) -> u64 {
        self.heartbeat_drift_warnings.get()
    }

    /// Get metrics registry for scraping
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of all metrics
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| StateError::Metrics(prometheus::Error::Msg(e.to_string())))
    }

    /// Get metrics as JSON (simplified version)
    pub fn gather_json(&self) -> serde_json::Value {
        let metrics: Vec<_> = self
            .registry
            .gather()
            .into_iter()
            .map(|family| {
                serde_json::json!({
                    "name": family.get_name(),
                    "help": family.get_help(),
                    "metric_count": family.get_metric().len(),
                })
            })
            .collect();

        serde_json::json!({ "metrics": metrics })
    }
}

impl Default for StateMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

impl std::fmt::Debug for StateMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMetrics")
            .field("events_processed", &self.events_processed.get())
            .field("tasks_seen", &self.tasks_seen.get())
            .field("alive_workers", &self.alive_workers.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = StateMetrics::new().unwrap();
        metrics.event_processed();
        metrics.event_processed();
        metrics.event_dropped("missing_hostname");
        metrics.index_evicted(3);
        metrics.set_alive_workers(2);

        assert_eq!(metrics.events_processed(), 2);
        assert_eq!(metrics.events_dropped("missing_hostname"), 1);
        assert_eq!(metrics.events_dropped("missing_uuid"), 0);
        assert_eq!(metrics.index_evictions(), 3);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("op_events_processed_total 2"));
        assert!(text.contains("op_events_alive_workers 2"));

        let json = metrics.gather_json();
        assert!(json["metrics"].as_array().map_or(false, |m| !m.is_empty()));
    }

    #[test]
    fn test_independent_registries() {
        let a = StateMetrics::new().unwrap();
        let b = StateMetrics::new().unwrap();
        a.task_seen();
        assert_eq!(b.registry().gather().len(), a.registry().gather().len());
    }
}
