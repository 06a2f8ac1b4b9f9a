//! Worker liveness tracking
//!
//! A worker is identified by hostname. Liveness is decided when an event is
//! processed (heartbeat freshness, or an explicit online/offline signal) and
//! stored; queries never re-evaluate it against the current time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use tracing::warn;

use crate::config::StateConfig;
use crate::event::mergeable;

/// Observed state of a single worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub hostname: String,

    /// Receipt times of recent heartbeats, oldest first
    #[serde(default)]
    pub heartbeats: VecDeque<f64>,

    /// Highest logical clock seen from this worker
    #[serde(default)]
    pub clock: Option<u64>,

    #[serde(default)]
    pub alive: bool,

    /// Heartbeat frequency reported by the worker, in seconds
    #[serde(default)]
    pub freq: Option<f64>,

    #[serde(default)]
    pub pid: Option<u64>,
    #[serde(default)]
    pub sw_ident: Option<String>,
    #[serde(default)]
    pub sw_ver: Option<String>,
    #[serde(default)]
    pub sw_sys: Option<String>,
    #[serde(default)]
    pub loadavg: Option<Vec<f64>>,
    #[serde(default)]
    pub active: Option<u64>,
    #[serde(default)]
    pub processed: Option<u64>,

    /// Any other field the worker reported
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// What a heartbeat did to the worker
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeartbeatOutcome {
    /// The receipt was appended to the history
    pub recorded: bool,

    /// Set when sender and receiver clocks disagree by more than the limit
    pub drift: Option<f64>,
}

impl Worker {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            heartbeats: VecDeque::new(),
            clock: None,
            alive: false,
            freq: None,
            pid: None,
            sw_ident: None,
            sw_ver: None,
            sw_sys: None,
            loadavg: None,
            active: None,
            processed: None,
            extra: Map::new(),
        }
    }

    /// Merge reported metadata verbatim. Reserved routing fields are skipped.
    pub fn update(&mut self, fields: &Map<String, Value>) {
        for (key, value) in mergeable(fields) {
            let consumed = match key.as_str() {
                "freq" => value.as_f64().map(|v| self.freq = Some(v)).is_some(),
                "pid" => value.as_u64().map(|v| self.pid = Some(v)).is_some(),
                "sw_ident" => value.as_str().map(|v| self.sw_ident = Some(v.to_string())).is_some(),
                "sw_ver" => value.as_str().map(|v| self.sw_ver = Some(v.to_string())).is_some(),
                "sw_sys" => value.as_str().map(|v| self.sw_sys = Some(v.to_string())).is_some(),
                "active" => value.as_u64().map(|v| self.active = Some(v)).is_some(),
                "processed" => value.as_u64().map(|v| self.processed = Some(v)).is_some(),
                "loadavg" => serde_json::from_value::<Vec<f64>>(value.clone())
                    .map(|v| self.loadavg = Some(v))
                    .is_ok(),
                _ => false,
            };
            if !consumed {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }

    /// Remember the highest logical clock seen
    pub fn observe_clock(&mut self, clock: Option<u64>) {
        if let Some(clock) = clock {
            self.clock = Some(self.clock.map_or(clock, |current| current.max(clock)));
        }
    }

    pub fn on_online(&mut self) {
        self.alive = true;
    }

    pub fn on_offline(&mut self) {
        self.alive = false;
    }

    /// Record a heartbeat and re-evaluate liveness against `now`.
    ///
    /// `received_at` is the collector's receipt time, `reported_at` the
    /// worker's own clock. A heartbeat without `reported_at` is dropped.
    pub fn on_heartbeat(
        &mut self,
        received_at: Option<f64>,
        reported_at: Option<f64>,
        now: f64,
        config: &StateConfig,
    ) -> HeartbeatOutcome {
        let Some(reported_at) = reported_at else {
            return HeartbeatOutcome::default();
        };
        let received_at = received_at.unwrap_or(reported_at);
        let mut outcome = HeartbeatOutcome::default();

        let drift = (received_at - reported_at).abs();
        if drift > config.heartbeat_drift_max {
            warn!(
                hostname = %self.hostname,
                drift_secs = drift,
                "Substantial drift from {} may mean clocks are out of sync. Current drift is {:.2} seconds",
                self.hostname,
                drift
            );
            outcome.drift = Some(drift);
        }

        let newer = self.heartbeats.back().map_or(true, |last| received_at > *last);
        if newer {
            self.heartbeats.push_back(received_at);
            while self.heartbeats.len() > config.heartbeat_history {
                self.heartbeats.pop_front();
            }
            outcome.recorded = true;
        }

        let latest = self.heartbeats.back().copied().unwrap_or(received_at);
        self.alive = latest + self.expiry_secs(config) > now;
        outcome
    }

    /// Seconds a heartbeat stays fresh for this worker
    pub fn expiry_secs(&self, config: &StateConfig) -> f64 {
        let freq = self.freq.unwrap_or(config.default_heartbeat_freq);
        freq * config.heartbeat_expire_window / 100.0
    }

    /// Instant at which the most recent heartbeat goes stale
    pub fn heartbeat_expires(&self, config: &StateConfig) -> Option<f64> {
        self.heartbeats
            .back()
            .map(|last| last + self.expiry_secs(config))
    }

    pub fn status_string(&self) -> &'static str {
        if self.alive {
            "ONLINE"
        } else {
            "OFFLINE"
        }
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
    }
}

impl Eq for Worker {}

impl Hash for Worker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
    }
}
