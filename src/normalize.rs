//! Envelope normalization
//!
//! Decodes raw delivery bytes into a canonical `NormalizedEvent`.
//! The canonical wire envelope is tried first (`schemaVersion` present
//! and numeric); otherwise an ordered chain of legacy adapters is
//! consulted, one per producer shape still in the wild. A shape no
//! adapter recognizes, invalid encoding, or a non-object payload is a
//! decode failure (poison).
//!
//! Mapping is total for every required canonical field. Optional
//! fields default deterministically: missing `traceId` is the empty
//! string, missing `eventId` is the delivery id, missing or
//! unparsable `producedAt` is the transport publish time.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::classify::PipelineError;
use crate::envelope::{DeliveryEnvelope, EventSource, NormalizedEvent};

/// One legacy producer shape the pipeline still accepts.
pub trait LegacyAdapter: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &'static str;

    /// Whether this adapter recognizes the decoded object.
    fn recognize(&self, obj: &Map<String, Value>) -> bool;

    /// Lift the object into the canonical event.
    fn lift(
        &self,
        obj: &Map<String, Value>,
        delivery: &DeliveryEnvelope,
    ) -> Result<NormalizedEvent, PipelineError>;
}

/// Canonical-first decoder with a legacy fallback chain.
pub struct Normalizer {
    adapters: Vec<Box<dyn LegacyAdapter>>,
}

impl Normalizer {
    pub fn new(adapters: Vec<Box<dyn LegacyAdapter>>) -> Self {
        Self { adapters }
    }

    /// Production chain: v0 envelope first, then the flat service
    /// event shape. Order matters; the first recognizer wins.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Box::new(V0EnvelopeAdapter),
            Box::new(FlatServiceEventAdapter),
        ])
    }

    /// Decode a delivery into the canonical event.
    pub fn normalize(&self, delivery: &DeliveryEnvelope) -> Result<NormalizedEvent, PipelineError> {
        let value: Value = serde_json::from_slice(&delivery.raw_bytes)
            .map_err(|err| PipelineError::Decode(format!("invalid JSON: {err}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| PipelineError::Decode("payload is not a JSON object".to_string()))?;

        if obj.get("schemaVersion").map(is_numeric).unwrap_or(false) {
            return lift_canonical(obj, delivery);
        }

        for adapter in &self.adapters {
            if adapter.recognize(obj) {
                debug!(
                    delivery_id = %delivery.delivery_id,
                    adapter = adapter.name(),
                    "legacy shape recognized"
                );
                return adapter.lift(obj, delivery);
            }
        }

        Err(PipelineError::Decode(
            "no envelope shape recognized".to_string(),
        ))
    }
}

fn is_numeric(value: &Value) -> bool {
    value.is_u64() || value.is_i64()
}

/// Parse a producer-asserted event time. Accepts RFC3339 strings and
/// unix epoch seconds; anything else falls back to publish time.
fn event_time_or(value: Option<&Value>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    match value {
        Some(Value::String(raw)) => raw
            .parse::<DateTime<Utc>>()
            .unwrap_or(fallback),
        Some(Value::Number(num)) => num
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(fallback),
        _ => fallback,
    }
}

fn payload_object(value: Option<&Value>) -> Result<Map<String, Value>, PipelineError> {
    match value {
        None => Ok(Map::new()),
        Some(Value::Object(obj)) => Ok(obj.clone()),
        Some(other) => Err(PipelineError::Decode(format!(
            "payload is not a JSON object (found {})",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn str_or_default(obj: &Map<String, Value>, key: &str, default: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

// ── Canonical envelope ──────────────────────────────────────────────

fn lift_canonical(
    obj: &Map<String, Value>,
    delivery: &DeliveryEnvelope,
) -> Result<NormalizedEvent, PipelineError> {
    let schema_version = obj
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .ok_or_else(|| PipelineError::Decode("schemaVersion is not a non-negative integer".to_string()))?
        as u32;

    let event_type = obj
        .get("eventType")
        .and_then(Value::as_str)
        .filter(|et| !et.is_empty())
        .ok_or_else(|| PipelineError::Decode("missing eventType".to_string()))?
        .to_string();

    let source = obj
        .get("source")
        .and_then(Value::as_object)
        .map(|src| EventSource {
            kind: str_or_default(src, "kind", ""),
            name: str_or_default(src, "name", ""),
            instance_id: str_or_default(src, "instanceId", ""),
        })
        .unwrap_or_default();

    Ok(NormalizedEvent {
        schema_version,
        event_type,
        event_id: str_or_default(obj, "eventId", &delivery.delivery_id),
        produced_at: event_time_or(obj.get("producedAt"), delivery.publish_time),
        sequence: obj.get("sequence").and_then(Value::as_u64),
        trace_id: str_or_default(obj, "traceId", ""),
        source,
        payload: payload_object(obj.get("payload"))?,
    })
}

// ── Legacy: v0 envelope ─────────────────────────────────────────────

/// The pre-canonical envelope: `{version, type, id, ts, trace,
/// origin, data}`.
pub struct V0EnvelopeAdapter;

impl LegacyAdapter for V0EnvelopeAdapter {
    fn name(&self) -> &'static str {
        "v0-envelope"
    }

    fn recognize(&self, obj: &Map<String, Value>) -> bool {
        obj.contains_key("version")
            && obj.get("type").map(Value::is_string).unwrap_or(false)
            && obj.get("data").map(Value::is_object).unwrap_or(false)
    }

    fn lift(
        &self,
        obj: &Map<String, Value>,
        delivery: &DeliveryEnvelope,
    ) -> Result<NormalizedEvent, PipelineError> {
        let event_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Decode("v0 envelope missing type".to_string()))?
            .to_string();

        let source = obj
            .get("origin")
            .and_then(Value::as_object)
            .map(|origin| EventSource {
                kind: "service".to_string(),
                name: str_or_default(origin, "service", ""),
                instance_id: str_or_default(origin, "instance", ""),
            })
            .unwrap_or_default();

        Ok(NormalizedEvent {
            schema_version: 0,
            event_type,
            event_id: str_or_default(obj, "id", &delivery.delivery_id),
            produced_at: event_time_or(obj.get("ts"), delivery.publish_time),
            sequence: obj.get("seq").and_then(Value::as_u64),
            trace_id: str_or_default(obj, "trace", ""),
            source,
            payload: payload_object(obj.get("data"))?,
        })
    }
}

// ── Legacy: flat service event ──────────────────────────────────────

/// The oldest producer shape: a flat object with `service` and
/// `timestamp` and no envelope at all. Carries no event type; routing
/// falls through to structural shape matching.
pub struct FlatServiceEventAdapter;

impl LegacyAdapter for FlatServiceEventAdapter {
    fn name(&self) -> &'static str {
        "flat-service-event"
    }

    fn recognize(&self, obj: &Map<String, Value>) -> bool {
        obj.get("service").map(Value::is_string).unwrap_or(false)
            && obj.contains_key("timestamp")
    }

    fn lift(
        &self,
        obj: &Map<String, Value>,
        delivery: &DeliveryEnvelope,
    ) -> Result<NormalizedEvent, PipelineError> {
        let service = obj
            .get("service")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Decode("flat event missing service".to_string()))?;

        Ok(NormalizedEvent {
            schema_version: 0,
            // No declared type; the router's structural fallback
            // decides which handler consumes this.
            event_type: String::new(),
            event_id: delivery.delivery_id.clone(),
            produced_at: event_time_or(obj.get("timestamp"), delivery.publish_time),
            sequence: obj.get("sequence").and_then(Value::as_u64),
            trace_id: String::new(),
            source: EventSource {
                kind: "legacy".to_string(),
                name: service.to_string(),
                instance_id: String::new(),
            },
            payload: obj.clone(),
        })
    }
}
