//! Shape routing
//!
//! Selects the handler for a normalized event. Declared event type
//! wins; structural shape matching exists only for producers still
//! migrating to explicit type tagging. When more than one structural
//! predicate matches, routing fails closed — silent misrouting is
//! worse than a visible failure.

use std::sync::Arc;

use crate::classify::PipelineError;
use crate::envelope::NormalizedEvent;
use crate::handler::{Handler, HandlerRegistry};

/// Router over an immutable handler table.
pub struct Router {
    registry: Arc<HandlerRegistry>,
}

impl Router {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve the handler for an event.
    pub fn route(&self, event: &NormalizedEvent) -> Result<Arc<dyn Handler>, PipelineError> {
        if !event.event_type.is_empty() {
            if let Some(handler) = self.registry.lookup(&event.event_type) {
                return Ok(Arc::clone(handler));
            }
        }

        let candidates = self.registry.structural_matches(event);
        match candidates.len() {
            1 => Ok(Arc::clone(candidates[0])),
            0 => Err(PipelineError::Unroutable(event.event_type.clone())),
            n => Err(PipelineError::Unroutable(format!(
                "{} ({n} structural candidates, refusing to guess)",
                event.event_type
            ))),
        }
    }
}
