//! Read-Model Materialization Service
//!
//! Consumes at-least-once, possibly out-of-order deliveries from the
//! message transport and materializes them into a consistent,
//! query-optimized document read model. The transport guarantees
//! nothing beyond at-least-once; exactly-once *effect* and per-target
//! monotonicity are built here, in application logic, on top of a
//! single optimistic read-modify-write transaction.
//!
//! # Architecture
//!
//! ```text
//! transport delivery
//!        │
//!   ┌────▼─────┐
//!   │ Adapter  │  ← ack / retry / dead-letter signaling
//!   └────┬─────┘
//!   ┌────▼─────┐
//!   │Normalizer│  ← canonical envelope + legacy shape chain
//!   └────┬─────┘
//!   ┌────▼─────┐
//!   │  Router  │  ← declared type first, shape fallback
//!   └────┬─────┘
//!   ┌────▼──────────┐
//!   │ Materializer  │  ← dedup + staleness, one transaction
//!   └────┬──────────┘
//!   ┌────▼─────┐
//!   │  Store   │
//!   └──────────┘
//! ```
//!
//! Errors from any stage flow back to the adapter through the pure
//! classifier in [`classify`].

pub mod adapter;
pub mod classify;
pub mod config;
pub mod envelope;
pub mod handler;
pub mod http;
pub mod materialize;
pub mod metrics;
pub mod normalize;
pub mod route;
pub mod store;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
