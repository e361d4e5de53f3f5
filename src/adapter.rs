//! Delivery adapter
//!
//! Owns the transport contract: every delivery resolves to exactly
//! one `TransportSignal`, decided by the error classification.
//! Success and poison acknowledge; transient failures retry;
//! fatal-config failures retry loudly and are never dropped.
//!
//! Processing is parallel across deliveries, bounded by a semaphore,
//! with a hard per-delivery deadline matched to the transport's
//! redelivery deadline. Exceeding the deadline classifies as
//! transient; the store transaction's atomicity means an abandoned
//! attempt leaves no partial effect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, ErrorClass, PipelineError};
use crate::config::PipelineConfig;
use crate::envelope::DeliveryEnvelope;
use crate::materialize::{Materializer, Outcome};
use crate::metrics::PipelineMetrics;
use crate::normalize::Normalizer;
use crate::route::Router;

/// Dedup namespace for deliveries that never reached a handler.
const POISON_NAMESPACE: &str = "poison";

/// Response signaled back to the transport for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    /// Processing reached a terminal outcome; do not redeliver.
    Ack,
    /// Negative-acknowledge; the transport backs off and redelivers.
    Retry,
    /// Route the message to the dead-letter channel now. Only used
    /// when a dead-letter policy is configured downstream.
    DeadLetterImmediate,
}

/// Explicit acknowledge/negative-acknowledge handle, for pull-model
/// transports where no status code exists.
pub trait AckHandle {
    fn ack(self);
    fn nack(self);
}

/// Transport-facing entry point of the pipeline.
pub struct DeliveryAdapter {
    normalizer: Normalizer,
    router: Router,
    materializer: Materializer,
    metrics: Arc<PipelineMetrics>,
    limiter: Semaphore,
    deadline: Duration,
    dead_letter_enabled: bool,
}

impl DeliveryAdapter {
    pub fn new(
        normalizer: Normalizer,
        router: Router,
        materializer: Materializer,
        metrics: Arc<PipelineMetrics>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            normalizer,
            router,
            materializer,
            metrics,
            limiter: Semaphore::new(config.max_concurrency),
            deadline: Duration::from_millis(config.delivery_deadline_ms),
            dead_letter_enabled: config.dead_letter_enabled,
        }
    }

    /// Process one delivery end to end and decide the transport signal.
    pub async fn handle(&self, delivery: DeliveryEnvelope) -> TransportSignal {
        // Closed semaphores do not occur; the adapter owns it.
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => return TransportSignal::Retry,
        };
        let started = Instant::now();

        let result = match tokio::time::timeout(self.deadline, self.process(&delivery)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DependencyTimeout(self.deadline.as_millis() as u64)),
        };
        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics.record_delivery(latency_us);

        match result {
            Ok((outcome, event_type)) => {
                self.metrics.record_outcome(outcome);
                info!(
                    delivery_id = %delivery.delivery_id,
                    event_type = %event_type,
                    outcome = outcome.label(),
                    latency_us,
                    "delivery processed"
                );
                TransportSignal::Ack
            }
            Err(err) => self.settle_failure(&delivery, &err, latency_us).await,
        }
    }

    /// Map the same signal contract onto a pull-model transport.
    ///
    /// Immediate dead-lettering is not expressible through pull
    /// acknowledgement; the poison marker is already recorded, so the
    /// message is acked rather than left to loop.
    pub async fn dispatch_pull<H: AckHandle>(&self, delivery: DeliveryEnvelope, handle: H) {
        match self.handle(delivery).await {
            TransportSignal::Ack | TransportSignal::DeadLetterImmediate => handle.ack(),
            TransportSignal::Retry => handle.nack(),
        }
    }

    async fn process(
        &self,
        delivery: &DeliveryEnvelope,
    ) -> Result<(Outcome, String), PipelineError> {
        let event = self.normalizer.normalize(delivery)?;
        let handler = self.router.route(&event)?;
        let outcome = self
            .materializer
            .apply(handler.as_ref(), &event, delivery)
            .await?;
        Ok((outcome, handler.event_type().to_string()))
    }

    async fn settle_failure(
        &self,
        delivery: &DeliveryEnvelope,
        err: &PipelineError,
        latency_us: u64,
    ) -> TransportSignal {
        let class = classify(err);
        self.metrics.record_error(class);

        match class {
            ErrorClass::Poison => {
                // Settle the delivery id before logging, so a
                // redelivered poison is visibly a no-op.
                let settled = self
                    .materializer
                    .record_poison(POISON_NAMESPACE, delivery)
                    .await;
                match settled {
                    Ok(Outcome::DuplicateNoop) => {
                        debug!(
                            delivery_id = %delivery.delivery_id,
                            outcome = "poison_duplicate",
                            latency_us,
                            "poison delivery already settled"
                        );
                    }
                    Ok(_) => {
                        let payload_sha256 = format!("{:x}", Sha256::digest(&delivery.raw_bytes));
                        error!(
                            delivery_id = %delivery.delivery_id,
                            payload_sha256 = %payload_sha256,
                            error = %err,
                            outcome = "poison_acked",
                            latency_us,
                            "poison delivery acknowledged"
                        );
                    }
                    Err(settle_err) => {
                        // Could not record the marker; keep the
                        // delivery visible and try again later.
                        warn!(
                            delivery_id = %delivery.delivery_id,
                            error = %settle_err,
                            "failed to settle poison delivery, retrying"
                        );
                        return TransportSignal::Retry;
                    }
                }
                if self.dead_letter_enabled {
                    TransportSignal::DeadLetterImmediate
                } else {
                    TransportSignal::Ack
                }
            }
            ErrorClass::Transient => {
                warn!(
                    delivery_id = %delivery.delivery_id,
                    delivery_attempt = delivery.delivery_attempt,
                    error = %err,
                    outcome = "retry",
                    latency_us,
                    "transient failure, redelivery requested"
                );
                TransportSignal::Retry
            }
            ErrorClass::FatalConfig => {
                // Will not self-heal; never ack, never drop.
                error!(
                    delivery_id = %delivery.delivery_id,
                    error = %err,
                    outcome = "retry",
                    alert = true,
                    latency_us,
                    "configuration failure requires operator intervention"
                );
                TransportSignal::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::store::{DocumentStore, MemoryStore, StoreError, Transaction};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn adapter_over(store: Arc<dyn DocumentStore>, config: PipelineConfig) -> DeliveryAdapter {
        let registry = Arc::new(HandlerRegistry::builtin());
        DeliveryAdapter::new(
            Normalizer::with_defaults(),
            Router::new(registry),
            Materializer::new(store, &config),
            Arc::new(PipelineMetrics::new()),
            &config,
        )
    }

    fn delivery(id: &str, body: &serde_json::Value) -> DeliveryEnvelope {
        DeliveryEnvelope {
            delivery_id: id.to_string(),
            publish_time: "2026-01-01T00:00:10Z".parse().unwrap(),
            raw_bytes: serde_json::to_vec(body).unwrap(),
            subscription: "sub".to_string(),
            delivery_attempt: 1,
        }
    }

    fn heartbeat_body() -> serde_json::Value {
        json!({
            "schemaVersion": 1,
            "eventType": "svc.heartbeat",
            "eventId": "e1",
            "producedAt": "2026-01-01T00:00:10Z",
            "payload": {"service": "svc-a", "severity": "INFO"},
        })
    }

    #[tokio::test]
    async fn test_successful_delivery_acks() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter_over(store.clone(), PipelineConfig::default());

        let signal = adapter.handle(delivery("m1", &heartbeat_body())).await;
        assert_eq!(signal, TransportSignal::Ack);
        assert!(store.get("doc/service_health/svc-a").is_some());
    }

    #[tokio::test]
    async fn test_poison_is_acked_and_settled_once() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter_over(store.clone(), PipelineConfig::default());

        let signal = adapter.handle(delivery("m1", &json!({"foo": 1}))).await;
        assert_eq!(signal, TransportSignal::Ack);
        assert_eq!(store.count_prefix("doc/"), 0);
        assert_eq!(store.count_prefix("dedupe/poison/"), 1);

        // Redelivery of the same poison id is a no-op, still acked.
        let signal = adapter.handle(delivery("m1", &json!({"foo": 1}))).await;
        assert_eq!(signal, TransportSignal::Ack);
        assert_eq!(store.count_prefix("dedupe/poison/"), 1);
    }

    #[tokio::test]
    async fn test_poison_dead_letters_when_policy_exists() {
        let store = Arc::new(MemoryStore::new());
        let config = PipelineConfig {
            dead_letter_enabled: true,
            ..PipelineConfig::default()
        };
        let adapter = adapter_over(store, config);

        let signal = adapter.handle(delivery("m1", &json!({"foo": 1}))).await;
        assert_eq!(signal, TransportSignal::DeadLetterImmediate);
    }

    struct UnavailableStore;

    impl DocumentStore for UnavailableStore {
        fn run_transaction(
            &self,
            _op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("maintenance".to_string()))
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries() {
        let adapter = adapter_over(Arc::new(UnavailableStore), PipelineConfig::default());
        let signal = adapter.handle(delivery("m1", &heartbeat_body())).await;
        assert_eq!(signal, TransportSignal::Retry);
    }

    /// Conflicts on the first commit, stalling processing in backoff
    /// long enough for a short deadline to fire.
    struct SlowCommitStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
    }

    impl DocumentStore for SlowCommitStore {
        fn run_transaction(
            &self,
            op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
        ) -> Result<(), StoreError> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Conflict("contended".to_string()));
            }
            self.inner.run_transaction(op)
        }
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_transient_retry() {
        let store = Arc::new(SlowCommitStore {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(1),
        });
        let config = PipelineConfig {
            delivery_deadline_ms: 1,
            txn_backoff_base_ms: 200,
            ..PipelineConfig::default()
        };
        let metrics = Arc::new(PipelineMetrics::new());
        let adapter = DeliveryAdapter::new(
            Normalizer::with_defaults(),
            Router::new(Arc::new(HandlerRegistry::builtin())),
            Materializer::new(store.clone(), &config),
            metrics.clone(),
            &config,
        );

        let signal = adapter.handle(delivery("m1", &heartbeat_body())).await;
        assert_eq!(signal, TransportSignal::Retry);
        assert_eq!(metrics.export()["errors_transient"], 1);

        // The retry would have committed, but the deadline abandoned
        // the attempt first; no marker or document exists, so a
        // redelivery can still apply the effect.
        assert_eq!(store.inner.count_prefix("doc/"), 0);
        assert_eq!(store.inner.count_prefix("dedupe/"), 0);
    }

    struct DeniedStore;

    impl DocumentStore for DeniedStore {
        fn run_transaction(
            &self,
            _op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
        ) -> Result<(), StoreError> {
            Err(StoreError::PermissionDenied("missing role".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fatal_config_retries_never_acks() {
        let adapter = adapter_over(Arc::new(DeniedStore), PipelineConfig::default());
        let signal = adapter.handle(delivery("m1", &heartbeat_body())).await;
        assert_eq!(signal, TransportSignal::Retry);
    }

    struct RecordingAck {
        acked: Arc<AtomicBool>,
        nacked: Arc<AtomicBool>,
    }

    impl AckHandle for RecordingAck {
        fn ack(self) {
            self.acked.store(true, Ordering::SeqCst);
        }
        fn nack(self) {
            self.nacked.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_pull_dispatch_acks_on_success() {
        let adapter = adapter_over(Arc::new(MemoryStore::new()), PipelineConfig::default());
        let acked = Arc::new(AtomicBool::new(false));
        let nacked = Arc::new(AtomicBool::new(false));

        adapter
            .dispatch_pull(
                delivery("m1", &heartbeat_body()),
                RecordingAck {
                    acked: acked.clone(),
                    nacked: nacked.clone(),
                },
            )
            .await;

        assert!(acked.load(Ordering::SeqCst));
        assert!(!nacked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pull_dispatch_nacks_on_transient() {
        let adapter = adapter_over(Arc::new(UnavailableStore), PipelineConfig::default());
        let acked = Arc::new(AtomicBool::new(false));
        let nacked = Arc::new(AtomicBool::new(false));

        adapter
            .dispatch_pull(
                delivery("m1", &heartbeat_body()),
                RecordingAck {
                    acked: acked.clone(),
                    nacked: nacked.clone(),
                },
            )
            .await;

        assert!(!acked.load(Ordering::SeqCst));
        assert!(nacked.load(Ordering::SeqCst));
    }
}
