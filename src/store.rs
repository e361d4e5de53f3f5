//! Document store abstraction and persisted record types
//!
//! The pipeline consumes exactly one store primitive: an optimistic
//! read-modify-write transaction over point reads and writes by key.
//! No store-specific query language is assumed. `MemoryStore` is the
//! in-process implementation: each key carries a version counter,
//! reads are snapshotted, and commit fails with `Conflict` when any
//! key read was committed to in between. Writes are all-or-nothing;
//! an aborted or failed transaction leaves nothing visible.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("transaction conflict on key '{0}'")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("stored value corrupt at key '{key}': {detail}")]
    Codec { key: String, detail: String },
}

// ── Persisted record types ──────────────────────────────────────────

/// Provenance of the last successful apply to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub subscription: String,
    pub delivery_id: String,
    pub publish_time: DateTime<Utc>,
}

/// A materialized read-model document.
///
/// Created on the first successful apply for a target key and mutated
/// thereafter; never deleted by the pipeline. `last_applied_event_time`
/// is the staleness watermark and is monotonic per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadModelDocument {
    /// Domain fields written by the handler's merge function.
    pub fields: Map<String, Value>,
    /// Staleness watermark: event time of the last applied event.
    pub last_applied_event_time: DateTime<Utc>,
    /// Producer sequence of the last applied event, for tie-breaks.
    pub last_applied_sequence: Option<u64>,
    /// Where the last applied delivery came from.
    pub source: Provenance,
}

/// Terminal outcome recorded against a delivery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeOutcome {
    Applied,
    StaleIgnored,
    PoisonAcked,
}

/// Append-only dedup marker, keyed by delivery id within a handler
/// namespace. Written only when processing reaches a terminal,
/// non-retryable outcome — never on a transient failure, so a later
/// retry of the same delivery can still attempt the effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub delivery_id: String,
    pub outcome: DedupeOutcome,
    pub applied_at: DateTime<Utc>,
}

/// Key of a read-model document within a handler namespace.
pub fn doc_key(namespace: &str, target: &str) -> String {
    format!("doc/{namespace}/{target}")
}

/// Key of a dedup marker within a handler namespace.
pub fn dedupe_key(namespace: &str, delivery_id: &str) -> String {
    format!("dedupe/{namespace}/{delivery_id}")
}

// ── Transaction primitive ───────────────────────────────────────────

/// Point read/write operations available inside a transaction.
///
/// Reads observe the transaction's own buffered writes.
pub trait Transaction {
    fn read(&mut self, key: &str) -> Result<Option<Value>, StoreError>;
    fn write(&mut self, key: &str, value: Value);
}

/// The single store capability the pipeline depends on.
///
/// `run_transaction` executes `op` against a transaction and commits
/// its writes atomically. A `Conflict` result means another commit
/// raced the read set; the caller may re-run `op` from scratch.
pub trait DocumentStore: Send + Sync {
    fn run_transaction(
        &self,
        op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

// ── In-memory implementation ────────────────────────────────────────

struct Entry {
    version: u64,
    value: Value,
}

/// Versioned in-memory document store with optimistic concurrency.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value outside any transaction. Test and admin use only.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .ok()?
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Number of keys matching a prefix. Test and admin use only.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.keys().filter(|k| k.starts_with(prefix)).count(),
            Err(_) => 0,
        }
    }

    /// Garbage-collect dedup markers older than the retention cutoff.
    ///
    /// Transport redelivery windows are bounded, so markers past the
    /// idempotency window can never be consulted again. Returns the
    /// number of markers removed.
    pub fn sweep_dedupe(&self, older_than: DateTime<Utc>) -> usize {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let expired: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| {
                key.starts_with("dedupe/")
                    && serde_json::from_value::<DedupeRecord>(entry.value.clone())
                        .map(|record| record.applied_at < older_than)
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired.len()
    }

    fn version_of(entries: &HashMap<String, Entry>, key: &str) -> u64 {
        entries.get(key).map(|entry| entry.version).unwrap_or(0)
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    /// Version of every key read, 0 meaning absent.
    read_set: HashMap<String, u64>,
    /// Buffered writes, applied in order on commit.
    writes: Vec<(String, Value)>,
}

impl Transaction for MemoryTransaction<'_> {
    fn read(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        // Read-your-writes within the transaction.
        if let Some((_, value)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(value.clone()));
        }

        let entries = self
            .store
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        let version = MemoryStore::version_of(&entries, key);
        self.read_set.entry(key.to_string()).or_insert(version);
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    fn write(&mut self, key: &str, value: Value) {
        self.writes.push((key.to_string(), value));
    }
}

impl DocumentStore for MemoryStore {
    fn run_transaction(
        &self,
        op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut tx = MemoryTransaction {
            store: self,
            read_set: HashMap::new(),
            writes: Vec::new(),
        };
        op(&mut tx)?;

        let MemoryTransaction {
            read_set, writes, ..
        } = tx;

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;

        // Validate the read set before any write becomes visible.
        for (key, seen_version) in &read_set {
            if MemoryStore::version_of(&entries, key) != *seen_version {
                return Err(StoreError::Conflict(key.clone()));
            }
        }

        for (key, value) in writes {
            let version = MemoryStore::version_of(&entries, &key) + 1;
            entries.insert(key, Entry { version, value });
        }
        Ok(())
    }
}
