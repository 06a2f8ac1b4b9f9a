//! Lamport ordering keys
//!
//! A `LamportKey` orders events and index entries by `(clock, timestamp, id)`.
//! Producer clocks are only partially synchronized, so the logical clock wins
//! first, the wall clock breaks ties, and the id makes the order total.
//!
//! An absent clock sorts below every present clock. The payload rides along
//! for the owner of the key and never takes part in comparisons.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Ordering key with an opaque payload
#[derive(Debug, Clone)]
pub struct LamportKey<P = ()> {
    /// Producer-local Lamport clock, if the producer sent one
    pub clock: Option<u64>,

    /// Producer wall clock (seconds since the epoch)
    pub timestamp: f64,

    /// Discriminator, usually the id of the owning record
    pub id: String,

    /// Back-reference to the owning record
    pub payload: P,
}

impl<P> LamportKey<P> {
    pub fn new(clock: Option<u64>, timestamp: f64, id: impl Into<String>, payload: P) -> Self {
        Self {
            clock,
            timestamp,
            id: id.into(),
            payload,
        }
    }

    /// Replace the payload, keeping the ordering fields
    pub fn with_payload<Q>(self, payload: Q) -> LamportKey<Q> {
        LamportKey {
            clock: self.clock,
            timestamp: self.timestamp,
            id: self.id,
            payload,
        }
    }

    /// The scalar fields that participate in ordering
    pub fn scalars(&self) -> (Option<u64>, f64, &str) {
        (self.clock, self.timestamp, &self.id)
    }

    fn compare_scalars(&self, clock: Option<u64>, timestamp: f64, id: &str) -> Ordering {
        self.clock
            .cmp(&clock)
            .then_with(|| self.timestamp.total_cmp(&timestamp))
            .then_with(|| self.id.as_str().cmp(id))
    }
}

impl LamportKey<()> {
    pub fn bare(clock: Option<u64>, timestamp: f64, id: impl Into<String>) -> Self {
        Self::new(clock, timestamp, id, ())
    }
}

impl<P> PartialEq for LamportKey<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for LamportKey<P> {}

impl<P> PartialOrd for LamportKey<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for LamportKey<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_scalars(other.clock, other.timestamp, &other.id)
    }
}

/// Read `[clock|null, timestamp, id, ...]` out of a JSON value.
fn conforming_scalars(value: &Value) -> Option<(Option<u64>, f64, &str)> {
    let items = value.as_array()?;
    if items.len() < 3 {
        return None;
    }
    let clock = match &items[0] {
        Value::Null => None,
        other => Some(other.as_u64()?),
    };
    let timestamp = items[1].as_f64()?;
    let id = items[2].as_str()?;
    Some((clock, timestamp, id))
}

impl<P> PartialEq<Value> for LamportKey<P> {
    fn eq(&self, other: &Value) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

/// Comparing with anything that is not a key-shaped array is unorderable.
impl<P> PartialOrd<Value> for LamportKey<P> {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        let (clock, timestamp, id) = conforming_scalars(other)?;
        Some(self.compare_scalars(clock, timestamp, id))
    }
}

impl<P: Serialize> Serialize for LamportKey<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.clock, &self.timestamp, &self.id, &self.payload).serialize(serializer)
    }
}

impl<'de, P: Deserialize<'de>> Deserialize<'de> for LamportKey<P> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (clock, timestamp, id, payload) =
            <(Option<u64>, f64, String, P)>::deserialize(deserializer)?;
        Ok(Self {
            clock,
            timestamp,
            id,
            payload,
        })
    }
}
