//! Error taxonomy and classification
//!
//! Every failure in the pipeline maps to one of three classes, which
//! fully determines the transport response:
//!
//! - `Poison`   → acknowledge (retrying can never succeed)
//! - `Transient` → negative-acknowledge for transport-level retry
//! - `FatalConfig` → negative-acknowledge plus a critical alert;
//!   acking would silently drop legitimate data
//!
//! `classify` is a pure function so classification behavior is
//! reproducible in tests, decoupled from transport status codes.

use thiserror::Error;

/// All errors the pipeline can surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("decode failure: {0}")]
    Decode(String),

    #[error("no handler matched event type '{0}'")]
    Unroutable(String),

    #[error("payload validation failed: {0}")]
    Validation(String),

    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("transaction conflict budget exhausted after {attempts} attempts")]
    StoreConflictExhausted { attempts: u32 },

    #[error("dependency timed out after {0}ms")]
    DependencyTimeout(u64),

    #[error("authorization failure: {0}")]
    Auth(String),

    #[error("missing configuration: {0}")]
    ConfigMissing(String),
}

/// Classification of a failure, deciding the transport signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Can never succeed; acknowledge and record.
    Poison,
    /// May succeed on redelivery; negative-acknowledge.
    Transient,
    /// Permanent until an operator intervenes; negative-acknowledge
    /// and alert. Never acked, never silently dropped.
    FatalConfig,
}

impl ErrorClass {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::Poison => "poison",
            ErrorClass::Transient => "transient",
            ErrorClass::FatalConfig => "fatal_config",
        }
    }
}

/// Map a pipeline error to its class. Pure, no side effects.
pub fn classify(err: &PipelineError) -> ErrorClass {
    match err {
        PipelineError::Decode(_)
        | PipelineError::Unroutable(_)
        | PipelineError::Validation(_) => ErrorClass::Poison,

        PipelineError::StoreUnavailable(_)
        | PipelineError::StoreConflictExhausted { .. }
        | PipelineError::DependencyTimeout(_) => ErrorClass::Transient,

        PipelineError::Auth(_) | PipelineError::ConfigMissing(_) => ErrorClass::FatalConfig,
    }
}
