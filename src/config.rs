//! Pipeline configuration.

/// Tunables for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum deliveries processed concurrently per process.
    pub max_concurrency: usize,
    /// Hard deadline per delivery attempt, matched to the transport's
    /// redelivery deadline. Overruns classify as transient.
    pub delivery_deadline_ms: u64,
    /// Store transaction-conflict retry budget.
    pub txn_retry_budget: u32,
    /// Base for the jittered conflict backoff, in milliseconds.
    pub txn_backoff_base_ms: u64,
    /// Whether a downstream dead-letter policy exists. When true,
    /// poison deliveries signal `DeadLetterImmediate` instead of
    /// being acknowledged in place.
    pub dead_letter_enabled: bool,
    /// Retention of dedup markers; redelivery windows are bounded,
    /// so markers older than this are garbage.
    pub dedupe_retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            delivery_deadline_ms: 10_000,
            txn_retry_budget: 3,
            txn_backoff_base_ms: 10,
            dead_letter_enabled: false,
            dedupe_retention_secs: 86_400,
        }
    }
}
