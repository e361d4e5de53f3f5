//! Idempotent materialization
//!
//! Executes a handler's upsert inside a single optimistic transaction
//! covering both the dedup namespace and the target document:
//!
//! 1. dedup marker for this delivery id already present → `DuplicateNoop`
//! 2. read the target document (may not exist)
//! 3. staleness check against `max(last_applied_event_time,
//!    provenance publish_time)`; exact ties resolved by the producer
//!    sequence, which must be strictly greater
//! 4. stale → record `stale_ignored`, no document mutation
//! 5. fresh → merge fields, advance the watermark, record `applied`
//!
//! The dedup marker is written in the same transaction as the
//! staleness decision, so the outcome of a given delivery id is
//! permanently fixed once committed: a retried delivery of a message
//! judged stale never re-evaluates staleness against a changed
//! baseline.
//!
//! Store-level transaction conflicts are retried here with jittered
//! backoff up to a small budget; everything past the budget surfaces
//! as a transient failure. A failed transaction leaves no partial
//! write, so no dedup marker exists after a transient failure and a
//! redelivery can still attempt the effect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, warn};

use crate::classify::PipelineError;
use crate::config::PipelineConfig;
use crate::envelope::{DeliveryEnvelope, NormalizedEvent};
use crate::handler::Handler;
use crate::store::{
    dedupe_key, doc_key, DedupeOutcome, DedupeRecord, DocumentStore, Provenance,
    ReadModelDocument, StoreError, Transaction,
};

/// Terminal result of materializing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The document was mutated and the watermark advanced.
    Applied,
    /// This delivery id was already settled; nothing happened.
    DuplicateNoop,
    /// The event is older than the document's watermark; recorded
    /// and ignored.
    StaleIgnored,
}

impl Outcome {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::DuplicateNoop => "duplicate_noop",
            Outcome::StaleIgnored => "stale_ignored",
        }
    }
}

/// Runs handler upserts transactionally against the document store.
pub struct Materializer {
    store: Arc<dyn DocumentStore>,
    retry_budget: u32,
    backoff_base_ms: u64,
}

impl Materializer {
    pub fn new(store: Arc<dyn DocumentStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            retry_budget: config.txn_retry_budget,
            backoff_base_ms: config.txn_backoff_base_ms,
        }
    }

    /// Apply one event to its target document, exactly once per
    /// delivery id.
    pub async fn apply(
        &self,
        handler: &dyn Handler,
        event: &NormalizedEvent,
        delivery: &DeliveryEnvelope,
    ) -> Result<Outcome, PipelineError> {
        let namespace = handler.namespace();
        let marker_key = dedupe_key(namespace, &delivery.delivery_id);
        let now = Utc::now();

        let mut outcome = Outcome::Applied;
        let mut handler_err: Option<PipelineError> = None;

        self.with_conflict_retry(|tx| {
            // The transaction may re-run on conflict; start clean.
            outcome = Outcome::Applied;
            handler_err = None;

            if tx.read(&marker_key)?.is_some() {
                outcome = Outcome::DuplicateNoop;
                return Ok(());
            }

            let target = match handler.target_key(event) {
                Ok(target) => target,
                Err(err) => {
                    handler_err = Some(err);
                    return Ok(());
                }
            };
            let document_key = doc_key(namespace, &target);
            let existing = match tx.read(&document_key)? {
                Some(value) => Some(decode_document(&document_key, value)?),
                None => None,
            };

            let incoming = handler.event_time(event);
            if is_stale(existing.as_ref(), incoming, event.sequence) {
                outcome = Outcome::StaleIgnored;
                tx.write(
                    &marker_key,
                    marker(&marker_key, delivery, DedupeOutcome::StaleIgnored, now)?,
                );
                return Ok(());
            }

            let fields = match handler.apply_to(existing.as_ref(), event) {
                Ok(fields) => fields,
                Err(err) => {
                    handler_err = Some(err);
                    return Ok(());
                }
            };
            let document = ReadModelDocument {
                fields,
                last_applied_event_time: incoming,
                last_applied_sequence: event.sequence,
                source: Provenance {
                    subscription: delivery.subscription.clone(),
                    delivery_id: delivery.delivery_id.clone(),
                    publish_time: delivery.publish_time,
                },
            };
            tx.write(&document_key, encode(&document_key, &document)?);
            tx.write(
                &marker_key,
                marker(&marker_key, delivery, DedupeOutcome::Applied, now)?,
            );
            Ok(())
        })
        .await?;

        if let Some(err) = handler_err {
            return Err(err);
        }
        Ok(outcome)
    }

    /// Settle a poison delivery: write a `poison_acked` marker unless
    /// this delivery id was already settled.
    pub async fn record_poison(
        &self,
        namespace: &str,
        delivery: &DeliveryEnvelope,
    ) -> Result<Outcome, PipelineError> {
        let marker_key = dedupe_key(namespace, &delivery.delivery_id);
        let now = Utc::now();
        let mut outcome = Outcome::Applied;

        self.with_conflict_retry(|tx| {
            outcome = Outcome::Applied;
            if tx.read(&marker_key)?.is_some() {
                outcome = Outcome::DuplicateNoop;
                return Ok(());
            }
            tx.write(
                &marker_key,
                marker(&marker_key, delivery, DedupeOutcome::PoisonAcked, now)?,
            );
            Ok(())
        })
        .await?;
        Ok(outcome)
    }

    /// Run a transaction, retrying store-level conflicts with
    /// jittered backoff up to the budget.
    async fn with_conflict_retry<F>(&self, mut op: F) -> Result<(), PipelineError>
    where
        F: FnMut(&mut dyn Transaction) -> Result<(), StoreError> + Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.run_transaction(&mut op) {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(key)) => {
                    if attempt >= self.retry_budget {
                        warn!(
                            key = %key,
                            attempts = attempt,
                            "transaction conflict budget exhausted"
                        );
                        return Err(PipelineError::StoreConflictExhausted { attempts: attempt });
                    }
                    let delay_ms = {
                        let jitter = rand::thread_rng().gen_range(0..=self.backoff_base_ms);
                        self.backoff_base_ms * u64::from(attempt) + jitter
                    };
                    debug!(key = %key, attempt, delay_ms, "transaction conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(StoreError::Unavailable(msg)) => {
                    return Err(PipelineError::StoreUnavailable(msg))
                }
                Err(StoreError::PermissionDenied(msg)) => return Err(PipelineError::Auth(msg)),
                // A corrupt stored document will not self-heal, but
                // acking would drop legitimate data; surface as
                // transient so the delivery stays visible.
                Err(StoreError::Codec { key, detail }) => {
                    return Err(PipelineError::StoreUnavailable(format!(
                        "corrupt document at '{key}': {detail}"
                    )))
                }
            }
        }
    }
}

/// Staleness decision for an incoming event time against a document.
fn is_stale(
    existing: Option<&ReadModelDocument>,
    incoming: chrono::DateTime<Utc>,
    sequence: Option<u64>,
) -> bool {
    let Some(document) = existing else {
        return false;
    };
    let baseline = document
        .last_applied_event_time
        .max(document.source.publish_time);
    if incoming < baseline {
        return true;
    }
    if incoming > baseline {
        return false;
    }
    // Exact tie: only a strictly greater producer sequence wins.
    match (sequence, document.last_applied_sequence) {
        (Some(incoming_seq), Some(applied_seq)) => incoming_seq <= applied_seq,
        _ => true,
    }
}

fn marker(
    key: &str,
    delivery: &DeliveryEnvelope,
    outcome: DedupeOutcome,
    applied_at: chrono::DateTime<Utc>,
) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(DedupeRecord {
        delivery_id: delivery.delivery_id.clone(),
        outcome,
        applied_at,
    })
    .map_err(|err| StoreError::Codec {
        key: key.to_string(),
        detail: err.to_string(),
    })
}

fn encode(key: &str, document: &ReadModelDocument) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(document).map_err(|err| StoreError::Codec {
        key: key.to_string(),
        detail: err.to_string(),
    })
}

fn decode_document(key: &str, value: serde_json::Value) -> Result<ReadModelDocument, StoreError> {
    serde_json::from_value(value).map_err(|err| StoreError::Codec {
        key: key.to_string(),
        detail: err.to_string(),
    })
}
