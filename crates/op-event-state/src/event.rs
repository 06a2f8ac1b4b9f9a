//! Inbound lifecycle events
//!
//! Events arrive as `"<category>-<subtype>"` plus a flat field map. The
//! category selects the worker or task path; the subtype selects a handler
//! through the finite enums below, with an explicit merge-only fallback for
//! anything unrecognised.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Result, StateError};
use crate::task::TaskState;

/// Fields that steer dispatch and are never merged into records verbatim
pub const RESERVED_FIELDS: &[&str] = &[
    "type",
    "hostname",
    "uuid",
    "clock",
    "timestamp",
    "local_received",
    "state",
];

/// A raw event as delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Decode an event from a JSON object carrying a string `type` key.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(StateError::invalid_event("event must be a JSON object"));
        };
        let event_type = match fields.remove("type") {
            Some(Value::String(event_type)) => event_type,
            Some(other) => {
                return Err(StateError::invalid_event(format!(
                    "event type must be a string, got {}",
                    other
                )))
            }
            None => return Err(StateError::invalid_event("event has no `type` field")),
        };
        Ok(Self { event_type, fields })
    }

    /// Decode an event from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(raw)?)
    }

    pub fn category(&self) -> EventCategory<'_> {
        EventCategory::parse(&self.event_type)
    }

    pub fn hostname(&self) -> Option<&str> {
        str_field(&self.fields, "hostname")
    }

    pub fn uuid(&self) -> Option<&str> {
        str_field(&self.fields, "uuid")
    }

    pub fn clock(&self) -> Option<u64> {
        clock_field(&self.fields)
    }

    pub fn timestamp(&self) -> Option<f64> {
        float_field(&self.fields, "timestamp")
    }

    pub fn local_received(&self) -> Option<f64> {
        float_field(&self.fields, "local_received")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hostname() {
            Some(hostname) => write!(f, "{}@{}", self.event_type, hostname),
            None => write!(f, "{}", self.event_type),
        }
    }
}

/// Non-empty string field lookup
pub fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
}

pub fn float_field(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

pub fn clock_field(fields: &Map<String, Value>) -> Option<u64> {
    fields.get("clock").and_then(Value::as_u64)
}

/// Iterate the fields that may be merged into a record
pub fn mergeable(fields: &Map<String, Value>) -> impl Iterator<Item = (&String, &Value)> {
    fields
        .iter()
        .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
}

/// First level of the event type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory<'a> {
    Worker(&'a str),
    Task(&'a str),
    Other(&'a str),
}

impl<'a> EventCategory<'a> {
    pub fn parse(event_type: &'a str) -> Self {
        match event_type.split_once('-') {
            Some(("worker", subtype)) => EventCategory::Worker(subtype),
            Some(("task", subtype)) => EventCategory::Task(subtype),
            _ => EventCategory::Other(event_type),
        }
    }
}

/// Worker subtypes that affect liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEventKind {
    Online,
    Offline,
    Heartbeat,
}

impl WorkerEventKind {
    pub fn from_subtype(subtype: &str) -> Option<Self> {
        match subtype {
            "online" => Some(WorkerEventKind::Online),
            "offline" => Some(WorkerEventKind::Offline),
            "heartbeat" => Some(WorkerEventKind::Heartbeat),
            _ => None,
        }
    }
}

/// Task subtypes that drive the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    Sent,
    Received,
    Started,
    Retried,
    Revoked,
    Failed,
    Succeeded,
}

impl TaskTransition {
    pub fn from_subtype(subtype: &str) -> Option<Self> {
        match subtype {
            "sent" => Some(TaskTransition::Sent),
            "received" => Some(TaskTransition::Received),
            "started" => Some(TaskTransition::Started),
            "retried" => Some(TaskTransition::Retried),
            "revoked" => Some(TaskTransition::Revoked),
            "failed" => Some(TaskTransition::Failed),
            "succeeded" => Some(TaskTransition::Succeeded),
            _ => None,
        }
    }

    /// State the task moves to when this transition is accepted
    pub fn target_state(self) -> TaskState {
        match self {
            TaskTransition::Sent => TaskState::Pending,
            TaskTransition::Received => TaskState::Received,
            TaskTransition::Started => TaskState::Started,
            TaskTransition::Retried => TaskState::Retry,
            TaskTransition::Revoked => TaskState::Revoked,
            TaskTransition::Failed => TaskState::Failure,
            TaskTransition::Succeeded => TaskState::Success,
        }
    }
}
