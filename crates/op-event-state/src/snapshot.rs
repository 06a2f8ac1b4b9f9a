//! Registry snapshots
//!
//! A snapshot carries the worker and task maps plus the counters. Observer
//! and recency index are not part of it; [`crate::Registry::restore`]
//! rebuilds the index from the tasks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::task::Task;
use crate::worker::Worker;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub workers: HashMap<String, Worker>,

    #[serde(default)]
    pub tasks: HashMap<String, Task>,

    #[serde(default)]
    pub event_count: u64,

    #[serde(default)]
    pub task_count: u64,
}

impl RegistrySnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use serde_json::json;

    #[test]
    fn test_json_preserves_records() {
        let mut worker = Worker::new("w1");
        worker.on_online();
        worker.heartbeats.push_back(10.0);
        worker.sw_ident = Some("op-worker".into());

        let mut task = Task::new("a");
        let fields = json!({"name": "tasks.add", "args": [2, 2], "custom": 1});
        task.on_started(5.0, fields.as_object().unwrap());
        task.hostname = Some("w1".into());

        let mut snapshot = RegistrySnapshot::default();
        snapshot.workers.insert("w1".into(), worker);
        snapshot.tasks.insert("a".into(), task);
        snapshot.event_count = 3;
        snapshot.task_count = 1;

        let back = RegistrySnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        let worker = &back.workers["w1"];
        assert!(worker.alive);
        assert_eq!(worker.heartbeats.back(), Some(&10.0));
        assert_eq!(worker.sw_ident.as_deref(), Some("op-worker"));

        let task = &back.tasks["a"];
        assert_eq!(task.state, TaskState::Started);
        assert_eq!(task.started, Some(5.0));
        assert_eq!(task.args, Some(json!([2, 2])));
        assert_eq!(task.extra.get("custom"), Some(&json!(1)));
        assert_eq!(back.event_count, 3);
        assert_eq!(back.task_count, 1);
    }

    #[test]
    fn test_missing_sections_default() {
        let back = RegistrySnapshot::from_json("{}").unwrap();
        assert!(back.is_empty());
        assert_eq!(back.event_count, 0);
        assert!(RegistrySnapshot::from_json("[1]").is_err());
    }
}
