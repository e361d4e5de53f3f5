//! Transport ingress (push model)
//!
//! One endpoint accepting the transport's delivery wrapper. The
//! response status code is the sole signal back to the transport:
//! 2xx acknowledges, 5xx requests redelivery, 4xx dead-letters (only
//! meaningful when a dead-letter policy exists downstream).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router as HttpRouter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use crate::adapter::{DeliveryAdapter, TransportSignal};
use crate::envelope::DeliveryEnvelope;
use crate::metrics::PipelineMetrics;

/// Push delivery wrapper as posted by the transport.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub message: PushMessage,
    pub subscription: String,
    #[serde(default)]
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    /// Base64-encoded payload bytes.
    pub data: String,
    #[serde(default)]
    pub publish_time: Option<DateTime<Utc>>,
    /// Transport attributes; carried on the wire, not consumed here.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Clone)]
pub struct AppState {
    pub adapter: Arc<DeliveryAdapter>,
    pub metrics: Arc<PipelineMetrics>,
}

pub fn create_router(state: AppState) -> HttpRouter {
    HttpRouter::new()
        .route("/push", post(push))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn push(State(state): State<AppState>, Json(req): Json<PushRequest>) -> StatusCode {
    let delivery_id = req
        .message
        .message_id
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    // Undecodable data still flows through as a delivery: the
    // normalizer rejects it and the poison path settles it, instead
    // of the transport redelivering it forever.
    let raw_bytes = match BASE64.decode(req.message.data.as_bytes()) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(delivery_id = %delivery_id, error = %err, "payload is not valid base64");
            req.message.data.into_bytes()
        }
    };

    let delivery = DeliveryEnvelope {
        delivery_id,
        publish_time: req.message.publish_time.unwrap_or_else(Utc::now),
        raw_bytes,
        subscription: req.subscription,
        delivery_attempt: req.delivery_attempt.unwrap_or(1),
    };

    match state.adapter.handle(delivery).await {
        TransportSignal::Ack => StatusCode::NO_CONTENT,
        TransportSignal::Retry => StatusCode::SERVICE_UNAVAILABLE,
        TransportSignal::DeadLetterImmediate => StatusCode::BAD_REQUEST,
    }
}

async fn metrics(State(state): State<AppState>) -> Json<std::collections::BTreeMap<String, u64>> {
    Json(state.metrics.export())
}
