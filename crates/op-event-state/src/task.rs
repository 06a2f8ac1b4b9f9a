//! Task execution state machine
//!
//! Field data from every transition is merged unconditionally, whatever order
//! the events arrive in. Only `state` is guarded: it moves forward along a
//! fixed precedence, except for a retry, which always reopens the task.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::event::{mergeable, TaskTransition};
use crate::lamport::LamportKey;

/// Attributes returned by [`Task::info`] when no explicit list is given
pub const INFO_FIELDS: &[&str] = &[
    "args",
    "kwargs",
    "retries",
    "result",
    "eta",
    "runtime",
    "expires",
    "exception",
    "exchange",
    "routing_key",
];

/// Lifecycle state of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Sent, or not yet observed at all
    #[default]
    Pending,
    Received,
    Started,
    /// Scheduled for another attempt
    Retry,
    Revoked,
    Failure,
    Success,
}

impl TaskState {
    /// Precedence used to reject late, less significant states
    pub fn rank(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Retry => 1,
            TaskState::Received => 2,
            TaskState::Started => 3,
            TaskState::Revoked => 4,
            TaskState::Failure => 5,
            TaskState::Success => 6,
        }
    }

    /// Terminal states
    pub fn is_ready(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure | TaskState::Revoked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Received => "RECEIVED",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Revoked => "REVOKED",
            TaskState::Failure => "FAILURE",
            TaskState::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of one task execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub uuid: String,

    #[serde(default)]
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,

    // Transition timestamps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<f64>,

    /// Time of the transition that last changed `state`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,

    /// Highest logical clock among applied events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<u64>,

    /// Greatest `(clock, timestamp)` pair among applied events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_event: Option<(Option<u64>, f64)>,

    /// Worker association, resolved through the registry's worker map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Incarnation number handed out by the registry
    #[serde(default)]
    pub generation: u64,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn on_sent(&mut self, timestamp: f64, fields: &Map<String, Value>) {
        self.on_transition(TaskTransition::Sent, timestamp, fields);
    }

    pub fn on_received(&mut self, timestamp: f64, fields: &Map<String, Value>) {
        self.on_transition(TaskTransition::Received, timestamp, fields);
    }

    pub fn on_started(&mut self, timestamp: f64, fields: &Map<String, Value>) {
        self.on_transition(TaskTransition::Started, timestamp, fields);
    }

    pub fn on_retried(&mut self, timestamp: f64, fields: &Map<String, Value>) {
        self.on_transition(TaskTransition::Retried, timestamp, fields);
    }

    pub fn on_revoked(&mut self, timestamp: f64, fields: &Map<String, Value>) {
        self.on_transition(TaskTransition::Revoked, timestamp, fields);
    }

    pub fn on_failed(&mut self, timestamp: f64, fields: &Map<String, Value>) {
        self.on_transition(TaskTransition::Failed, timestamp, fields);
    }

    pub fn on_succeeded(&mut self, timestamp: f64, fields: &Map<String, Value>) {
        self.on_transition(TaskTransition::Succeeded, timestamp, fields);
    }

    /// Apply a lifecycle transition. Returns true if `state` was replaced.
    pub fn on_transition(
        &mut self,
        transition: TaskTransition,
        timestamp: f64,
        fields: &Map<String, Value>,
    ) -> bool {
        self.merge(fields);
        *self.transition_time_mut(transition) = Some(timestamp);

        let next = transition.target_state();
        let accepted = transition == TaskTransition::Retried || next.rank() >= self.state.rank();
        if accepted {
            self.state = next;
            self.timestamp = Some(timestamp);
        }
        accepted
    }

    /// Merge fields from an event with no known transition
    pub fn on_unknown(&mut self, fields: &Map<String, Value>) {
        self.merge(fields);
    }

    fn transition_time_mut(&mut self, transition: TaskTransition) -> &mut Option<f64> {
        match transition {
            TaskTransition::Sent => &mut self.sent,
            TaskTransition::Received => &mut self.received,
            TaskTransition::Started => &mut self.started,
            TaskTransition::Retried => &mut self.retried,
            TaskTransition::Revoked => &mut self.revoked,
            TaskTransition::Failed => &mut self.failed,
            TaskTransition::Succeeded => &mut self.succeeded,
        }
    }

    /// Merge event fields into the record. Values of an unexpected shape are
    /// kept in `extra` rather than rejected.
    pub fn merge(&mut self, fields: &Map<String, Value>) {
        for (key, value) in mergeable(fields) {
            if !self.merge_known(key, value) {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }

    fn merge_known(&mut self, key: &str, value: &Value) -> bool {
        let text = || value.as_str().map(str::to_string);
        match key {
            "name" => text().map(|v| self.name = Some(v)).is_some(),
            "exception" => text().map(|v| self.exception = Some(v)).is_some(),
            "traceback" => text().map(|v| self.traceback = Some(v)).is_some(),
            "exchange" => text().map(|v| self.exchange = Some(v)).is_some(),
            "routing_key" => text().map(|v| self.routing_key = Some(v)).is_some(),
            "retries" => value.as_u64().map(|v| self.retries = Some(v)).is_some(),
            "runtime" => value.as_f64().map(|v| self.runtime = Some(v)).is_some(),
            "args" => {
                self.args = Some(value.clone());
                true
            }
            "kwargs" => {
                self.kwargs = Some(value.clone());
                true
            }
            "eta" => {
                self.eta = Some(value.clone());
                true
            }
            "expires" => {
                self.expires = Some(value.clone());
                true
            }
            "result" => {
                self.result = Some(value.clone());
                true
            }
            _ => false,
        }
    }

    /// Look up a populated attribute by name
    pub fn get(&self, field: &str) -> Option<Value> {
        let string = |v: &Option<String>| v.clone().map(Value::String);
        let float = |v: Option<f64>| v.map(Value::from);
        let value = match field {
            "uuid" => Some(Value::String(self.uuid.clone())),
            "state" => Some(Value::String(self.state.to_string())),
            "name" => string(&self.name),
            "args" => self.args.clone(),
            "kwargs" => self.kwargs.clone(),
            "retries" => self.retries.map(Value::from),
            "eta" => self.eta.clone(),
            "expires" => self.expires.clone(),
            "result" => self.result.clone(),
            "exception" => string(&self.exception),
            "traceback" => string(&self.traceback),
            "runtime" => float(self.runtime),
            "exchange" => string(&self.exchange),
            "routing_key" => string(&self.routing_key),
            "sent" => float(self.sent),
            "received" => float(self.received),
            "started" => float(self.started),
            "retried" => float(self.retried),
            "revoked" => float(self.revoked),
            "failed" => float(self.failed),
            "succeeded" => float(self.succeeded),
            "timestamp" => float(self.timestamp),
            "clock" => self.clock.map(Value::from),
            "hostname" | "worker" => string(&self.hostname),
            other => self.extra.get(other).cloned(),
        };
        value
            .or_else(|| self.extra.get(field).cloned())
            .filter(|v| !v.is_null())
    }

    /// Restricted view of the task. `fields` defaults to [`INFO_FIELDS`];
    /// names that were never populated are left out.
    pub fn info(&self, fields: Option<&[&str]>, extra: &[&str]) -> Map<String, Value> {
        fields
            .unwrap_or(INFO_FIELDS)
            .iter()
            .chain(extra.iter())
            .filter_map(|name| self.get(name).map(|value| (name.to_string(), value)))
            .collect()
    }

    /// Record the position of an applied event, whether or not it changed
    /// `state`.
    pub fn observe_event(&mut self, clock: Option<u64>, timestamp: f64) {
        if let Some(clock) = clock {
            self.clock = Some(self.clock.map_or(clock, |current| current.max(clock)));
        }
        let newer = self.latest_event.map_or(true, |(c, t)| {
            clock.cmp(&c).then_with(|| timestamp.total_cmp(&t)).is_gt()
        });
        if newer {
            self.latest_event = Some((clock, timestamp));
        }
    }

    /// The task's position in event order: the greatest event applied to it
    pub fn ordering_key(&self) -> LamportKey {
        let (clock, timestamp) = self
            .latest_event
            .unwrap_or((self.clock, self.timestamp.unwrap_or(0.0)));
        LamportKey::bare(clock, timestamp, self.uuid.clone())
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::hash_map::DefaultHasher;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn none() -> Map<String, Value> {
        Map::new()
    }

    fn hash_of(task: &Task) -> u64 {
        let mut hasher = DefaultHasher::new();
        task.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_equality_is_by_uuid() {
        let mut a = Task::new("foo");
        a.name = Some("tasks.add".into());
        assert_eq!(a, Task::new("foo"));
        assert_ne!(Task::new("foo"), Task::new("bar"));
        assert_eq!(hash_of(&a), hash_of(&Task::new("foo")));
        assert_ne!(hash_of(&Task::new("foo")), hash_of(&Task::new("bar")));
    }

    #[test]
    fn test_info() {
        let mut task = Task::new("abcdefg");
        task.merge(&fields(json!({
            "name": "tasks.add",
            "args": "(2, 2)",
            "kwargs": "{}",
            "retries": 2,
            "result": 42,
            "eta": 1,
            "runtime": 0.0001,
            "expires": 1,
            "foo": null,
            "exception": "1",
            "exchange": "default",
            "routing_key": "default",
        })));
        task.on_received(90.0, &none());

        let mut keys: Vec<_> = task.info(None, &[]).keys().cloned().collect();
        keys.sort();
        let mut expected: Vec<_> = INFO_FIELDS.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(keys, expected);

        let with_received = task.info(None, &["received"]);
        assert_eq!(with_received.len(), INFO_FIELDS.len() + 1);
        assert_eq!(with_received.get("received"), Some(&json!(90.0)));

        let restricted = task.info(Some(&["args", "kwargs"]), &[]);
        let mut keys: Vec<_> = restricted.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["args", "kwargs"]);

        assert!(task.info(Some(&["foo"]), &[]).is_empty());
    }

    #[test]
    fn test_ready() {
        let mut task = Task::new("abcdefg");
        task.on_received(1.0, &none());
        assert!(!task.ready());
        task.on_succeeded(2.0, &none());
        assert!(task.ready());
    }

    #[test]
    fn test_sent() {
        let mut task = Task::new("abcdefg");
        task.on_sent(1.0, &none());
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.sent, Some(1.0));
    }

    #[test]
    fn test_merge_out_of_order() {
        let mut task = Task::new("x");
        task.on_failed(3.0, &none());
        task.on_started(2.0, &none());
        task.on_received(1.0, &fields(json!({"name": "tasks.add", "args": [2, 2]})));
        assert_eq!(task.state, TaskState::Failure);
        assert_eq!(task.timestamp, Some(3.0));
        assert_eq!(task.name.as_deref(), Some("tasks.add"));
        assert_eq!(task.args, Some(json!([2, 2])));
        assert_eq!(task.received, Some(1.0));
        assert_eq!(task.started, Some(2.0));

        task.on_retried(4.0, &none());
        assert_eq!(task.state, TaskState::Retry);
        assert_eq!(task.timestamp, Some(4.0));
    }

    #[test]
    fn test_retry_reopens_after_success() {
        let mut task = Task::new("x");
        task.on_succeeded(5.0, &none());
        assert!(task.on_transition(TaskTransition::Retried, 6.0, &none()));
        assert_eq!(task.state, TaskState::Retry);
        assert!(!task.ready());
        task.on_received(7.0, &none());
        assert_eq!(task.state, TaskState::Received);
    }

    #[test]
    fn test_rejected_state_keeps_timestamp() {
        let mut task = Task::new("x");
        task.on_succeeded(5.0, &none());
        assert!(!task.on_transition(TaskTransition::Started, 9.0, &none()));
        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.timestamp, Some(5.0));
        assert_eq!(task.started, Some(9.0));
    }

    #[test]
    fn test_repeated_event_is_idempotent() {
        let mut task = Task::new("x");
        let payload = fields(json!({"result": "4", "runtime": 0.1234}));
        task.on_succeeded(5.0, &payload);
        let before = serde_json::to_value(&task).unwrap();
        task.on_succeeded(5.0, &payload);
        assert_eq!(serde_json::to_value(&task).unwrap(), before);
    }

    #[test]
    fn test_unknown_fields_and_reserved_keys() {
        let mut task = Task::new("x");
        task.on_unknown(&fields(json!({
            "uuid": "other",
            "state": "SUCCESS",
            "foo": "bar",
            "retries": "many",
        })));
        assert_eq!(task.uuid, "x");
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.get("foo"), Some(json!("bar")));
        assert_eq!(task.retries, None);
        assert_eq!(task.get("retries"), Some(json!("many")));
    }

    #[test]
    fn test_ordering_key_follows_greatest_event() {
        let mut task = Task::new("a");
        task.observe_event(Some(5), 100.0);
        task.on_succeeded(100.0, &none());
        // late transition: rejected for state, still the greatest event
        task.observe_event(Some(6), 50.0);
        task.on_started(50.0, &none());
        assert_eq!(task.timestamp, Some(100.0));
        assert_eq!(task.ordering_key().scalars(), (Some(6), 50.0, "a"));

        task.observe_event(Some(4), 200.0);
        assert_eq!(task.clock, Some(6));
        assert_eq!(task.ordering_key().scalars(), (Some(6), 50.0, "a"));

        let mut unclocked = Task::new("b");
        unclocked.observe_event(None, 1.0);
        unclocked.on_received(1.0, &none());
        unclocked.observe_event(None, 3.0);
        unclocked.on_unknown(&none());
        assert_eq!(unclocked.ordering_key().scalars(), (None, 3.0, "b"));
    }

    #[test]
    fn test_state_serializes_upper_case() {
        assert_eq!(serde_json::to_value(TaskState::Retry).unwrap(), json!("RETRY"));
        assert_eq!(TaskState::Failure.to_string(), "FAILURE");
        let ranks: Vec<u8> = [
            TaskState::Pending,
            TaskState::Received,
            TaskState::Started,
            TaskState::Revoked,
            TaskState::Failure,
            TaskState::Success,
        ]
        .iter()
        .map(|s| s.rank())
        .collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
    }
}
