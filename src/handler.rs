//! Handler registration and built-in handlers
//!
//! A `Handler` is pure configuration: it declares which events it
//! consumes, which document they target, and how fields merge. It
//! holds no runtime state and performs no I/O — all mutation goes
//! through the materializer's transaction.
//!
//! The registry is an explicit table constructed once at process
//! start and passed by reference into the router. Adding a new event
//! type means adding one entry here; the delivery adapter, normalizer
//! and materializer are untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::classify::PipelineError;
use crate::envelope::NormalizedEvent;
use crate::store::ReadModelDocument;

/// Per-event-type materialization configuration.
pub trait Handler: Send + Sync {
    /// Exact event type this handler consumes.
    fn event_type(&self) -> &'static str;

    /// Dedup and document namespace for this handler.
    fn namespace(&self) -> &'static str;

    /// Structural fallback predicate, consulted only when an event
    /// carries no recognized `event_type`. Default: never matches.
    fn matches_shape(&self, _event: &NormalizedEvent) -> bool {
        false
    }

    /// Deterministic id of the destination document.
    fn target_key(&self, event: &NormalizedEvent) -> Result<String, PipelineError>;

    /// Pure merge: compute the new domain fields from the existing
    /// document (if any) and the incoming event.
    fn apply_to(
        &self,
        existing: Option<&ReadModelDocument>,
        event: &NormalizedEvent,
    ) -> Result<Map<String, Value>, PipelineError>;

    /// Event time used for staleness comparison.
    fn event_time(&self, event: &NormalizedEvent) -> DateTime<Utc> {
        event.produced_at
    }
}

/// Statically-constructed handler table.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
    by_type: HashMap<&'static str, usize>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        let by_type = handlers
            .iter()
            .enumerate()
            .map(|(idx, handler)| (handler.event_type(), idx))
            .collect();
        Self { handlers, by_type }
    }

    /// The built-in production table.
    pub fn builtin() -> Self {
        Self::new(vec![
            Arc::new(ServiceHealthHandler),
            Arc::new(ServiceIncidentHandler),
        ])
    }

    /// Exact event-type lookup.
    pub fn lookup(&self, event_type: &str) -> Option<&Arc<dyn Handler>> {
        self.by_type.get(event_type).map(|idx| &self.handlers[*idx])
    }

    /// All handlers whose structural predicate accepts the event.
    pub fn structural_matches(&self, event: &NormalizedEvent) -> Vec<&Arc<dyn Handler>> {
        self.handlers
            .iter()
            .filter(|handler| handler.matches_shape(event))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn required_str(event: &NormalizedEvent, key: &str) -> Result<String, PipelineError> {
    event
        .payload_str(key)
        .map(str::to_string)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            PipelineError::Validation(format!(
                "event '{}' missing required payload field '{key}'",
                event.event_type
            ))
        })
}

// ── svc.heartbeat ───────────────────────────────────────────────────

/// Materializes per-service health documents from heartbeat events.
///
/// Carries the structural fallback predicate for producers still
/// emitting the flat legacy shape without an explicit event type.
pub struct ServiceHealthHandler;

impl ServiceHealthHandler {
    fn status_for(severity: &str) -> &'static str {
        match severity {
            "DEBUG" | "INFO" => "healthy",
            "WARN" | "WARNING" => "degraded",
            _ => "unhealthy",
        }
    }
}

impl Handler for ServiceHealthHandler {
    fn event_type(&self) -> &'static str {
        "svc.heartbeat"
    }

    fn namespace(&self) -> &'static str {
        "service_health"
    }

    fn matches_shape(&self, event: &NormalizedEvent) -> bool {
        event.payload.contains_key("service") && event.payload.contains_key("timestamp")
    }

    fn target_key(&self, event: &NormalizedEvent) -> Result<String, PipelineError> {
        required_str(event, "service")
    }

    // Pure in the incoming event: the final document is a function
    // of the newest applied event alone, so any delivery permutation
    // converges to the in-order result.
    fn apply_to(
        &self,
        _existing: Option<&ReadModelDocument>,
        event: &NormalizedEvent,
    ) -> Result<Map<String, Value>, PipelineError> {
        let service = required_str(event, "service")?;
        let severity = event.payload_str("severity").unwrap_or("INFO").to_string();

        let mut fields = Map::new();
        fields.insert("service".to_string(), Value::String(service));
        fields.insert(
            "status".to_string(),
            Value::String(Self::status_for(&severity).to_string()),
        );
        fields.insert("last_severity".to_string(), Value::String(severity));
        if let Some(message) = event.payload_str("message") {
            fields.insert("last_message".to_string(), Value::String(message.to_string()));
        }
        Ok(fields)
    }
}

// ── svc.incident ────────────────────────────────────────────────────

/// Materializes per-service incident documents.
pub struct ServiceIncidentHandler;

impl Handler for ServiceIncidentHandler {
    fn event_type(&self) -> &'static str {
        "svc.incident"
    }

    fn namespace(&self) -> &'static str {
        "service_incidents"
    }

    fn target_key(&self, event: &NormalizedEvent) -> Result<String, PipelineError> {
        required_str(event, "service")
    }

    fn apply_to(
        &self,
        _existing: Option<&ReadModelDocument>,
        event: &NormalizedEvent,
    ) -> Result<Map<String, Value>, PipelineError> {
        let service = required_str(event, "service")?;
        let severity = required_str(event, "severity")?;
        let open = event
            .payload
            .get("resolved")
            .and_then(Value::as_bool)
            .map(|resolved| !resolved)
            .unwrap_or(true);

        let mut fields = Map::new();
        fields.insert("service".to_string(), Value::String(service));
        fields.insert("open_incident".to_string(), Value::Bool(open));
        fields.insert("last_severity".to_string(), Value::String(severity));
        Ok(fields)
    }
}
