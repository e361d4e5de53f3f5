//! Canonical event model for the materialization pipeline
//!
//! Defines the transport-owned `DeliveryEnvelope` and the canonical
//! `NormalizedEvent` every downstream component operates on. The
//! normalizer produces `NormalizedEvent` values from raw delivery
//! bytes; nothing after the normalizer ever touches raw bytes again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single delivery as handed over by the message transport.
///
/// Ephemeral: nothing here is persisted beyond the dedup marker keyed
/// by `delivery_id`. The same `delivery_id` repeats on redelivery of
/// the same message, with `delivery_attempt` increasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEnvelope {
    /// Transport-unique message identifier.
    pub delivery_id: String,
    /// Time the transport accepted the message. Never used for
    /// ordering, only as a fallback when the producer asserted no
    /// event time of its own.
    pub publish_time: DateTime<Utc>,
    /// Undecoded payload bytes. May be malformed.
    pub raw_bytes: Vec<u8>,
    /// Subscription the delivery arrived on.
    pub subscription: String,
    /// Redelivery counter, starting at 1.
    pub delivery_attempt: u32,
}

/// Identity of the producer that emitted an event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub kind: String,
    pub name: String,
    pub instance_id: String,
}

/// Canonical in-memory event, the output of normalization.
///
/// `produced_at` is the producer-asserted event time and is the only
/// timestamp used for staleness comparisons. Optional wire fields
/// default deterministically: a missing `trace_id` is always the empty
/// string, a missing `event_id` is the delivery id, a missing
/// `produced_at` is the transport publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Canonical envelope schema version; 0 for lifted legacy shapes.
    pub schema_version: u32,
    /// Dot-namespaced event type, e.g. `svc.heartbeat`.
    pub event_type: String,
    /// Producer-assigned event identifier, else the delivery id.
    pub event_id: String,
    /// Producer-asserted event time — authoritative for ordering.
    pub produced_at: DateTime<Utc>,
    /// Producer-supplied monotonic counter, used only to break exact
    /// `produced_at` ties for the same target.
    pub sequence: Option<u64>,
    /// Distributed trace correlation id, empty when absent.
    pub trace_id: String,
    /// Producer identity.
    pub source: EventSource,
    /// Opaque payload object; shape depends on `event_type`.
    pub payload: Map<String, Value>,
}

impl NormalizedEvent {
    /// Fetch a string field from the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
