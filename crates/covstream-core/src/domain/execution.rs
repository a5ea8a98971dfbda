//! Execution data: what was run, in which collection session.
//!
//! # Model
//!
//! Instrumented code is divided into *classes* (any unit with a stable id),
//! and each class owns a fixed number of *probes*.  A probe flips to `true`
//! the first time the code location it guards executes.  A *session* is the
//! period between two resets of the accumulated probes.
//!
//! The agent never inspects execution data itself: it asks an
//! [`ExecutionDataSource`] for an already-serialized snapshot and streams the
//! bytes to the collector.  [`ExecutionStore`] is the in-memory source used by
//! the agent binary and the tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::blocks::Block;
use crate::protocol::codec::encode_block;

/// Describes one collection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Free-form session identifier (host name plus a random suffix by default).
    pub id: String,
    /// Milliseconds since the Unix epoch when the session started.
    pub start_ms: i64,
    /// Milliseconds since the Unix epoch when the snapshot was taken.
    pub dump_ms: i64,
}

/// Probe data for a single class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Stable class identifier (typically a checksum of the class definition).
    pub class_id: i64,
    /// Human-readable class name, e.g. `com/example/Foo`.
    pub name: String,
    /// One flag per probe; `true` once the probe has executed.
    pub probes: Vec<bool>,
}

impl ExecutionRecord {
    /// Creates a record with `probe_count` unexecuted probes.
    pub fn new(class_id: i64, name: impl Into<String>, probe_count: usize) -> Self {
        Self {
            class_id,
            name: name.into(),
            probes: vec![false; probe_count],
        }
    }

    /// Returns `true` if at least one probe has executed.
    pub fn has_hits(&self) -> bool {
        self.probes.iter().any(|&p| p)
    }

    /// Number of executed probes.
    pub fn hit_count(&self) -> usize {
        self.probes.iter().filter(|&&p| p).count()
    }

    /// Clears every probe.
    pub fn reset(&mut self) {
        self.probes.iter_mut().for_each(|p| *p = false);
    }
}

/// Producer of execution-data snapshots.
///
/// The agent's session calls [`serialize_current`](Self::serialize_current)
/// to obtain the bytes to transmit and, after a successful transmission
/// with `reset` requested, [`reset`](Self::reset).  Both methods are called
/// from network tasks, so implementations must be thread-safe.
///
/// The two calls are not atomic: probes may be hit after the snapshot was
/// serialized and before `reset` runs.  `reset` should only clear what the
/// last snapshot contained, or those hits are lost without being reported.
pub trait ExecutionDataSource: Send + Sync {
    /// Returns the current execution data as a sequence of encoded blocks
    /// (a session info block followed by execution data blocks).
    fn serialize_current(&self) -> Vec<u8>;

    /// Clears the accumulated execution data and starts a new session period.
    fn reset(&self);
}

#[derive(Debug)]
struct StoreInner {
    start_ms: i64,
    records: BTreeMap<i64, ExecutionRecord>,
    /// Probe state included in the last serialized snapshot; `None` when
    /// nothing was serialized since the last reset.
    last_serialized: Option<BTreeMap<i64, Vec<bool>>>,
}

/// Thread-safe in-memory execution data store.
///
/// # Example
///
/// ```rust
/// use covstream_core::{ExecutionDataSource, ExecutionStore};
///
/// let store = ExecutionStore::new("demo");
/// store.register(1, "demo/Main", 4);
/// assert!(store.hit(1, 2));
/// assert!(!store.serialize_current().is_empty());
/// ```
#[derive(Debug)]
pub struct ExecutionStore {
    session_id: String,
    inner: Mutex<StoreInner>,
}

impl ExecutionStore {
    /// Creates an empty store whose snapshots carry `session_id`.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            inner: Mutex::new(StoreInner {
                start_ms: now_ms(),
                records: BTreeMap::new(),
                last_serialized: None,
            }),
        }
    }

    /// Creates an empty store with a generated `<prefix>-<random hex>` id.
    pub fn with_generated_id(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::new(format!("{prefix}-{}", &suffix[..8]))
    }

    /// The session id written into every snapshot.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Registers a class with `probe_count` probes.
    ///
    /// Registering an already-known id keeps its existing probes, so
    /// re-registration after a reload does not lose data.
    pub fn register(&self, class_id: i64, name: &str, probe_count: usize) {
        let mut inner = self.lock();
        inner
            .records
            .entry(class_id)
            .or_insert_with(|| ExecutionRecord::new(class_id, name, probe_count));
    }

    /// Marks probe `probe` of class `class_id` as executed.
    ///
    /// Returns `false` if the class is unknown or the index is out of range.
    pub fn hit(&self, class_id: i64, probe: usize) -> bool {
        let mut inner = self.lock();
        match inner
            .records
            .get_mut(&class_id)
            .and_then(|r| r.probes.get_mut(probe))
        {
            Some(slot) => {
                *slot = true;
                true
            }
            None => false,
        }
    }

    /// Takes a point-in-time copy of the session info and the records that
    /// have at least one executed probe.
    pub fn snapshot(&self) -> (SessionInfo, Vec<ExecutionRecord>) {
        self.snapshot_locked(&self.lock())
    }

    fn snapshot_locked(&self, inner: &StoreInner) -> (SessionInfo, Vec<ExecutionRecord>) {
        let info = SessionInfo {
            id: self.session_id.clone(),
            start_ms: inner.start_ms,
            dump_ms: now_ms(),
        };
        let records = inner
            .records
            .values()
            .filter(|r| r.has_hits())
            .cloned()
            .collect();
        (info, records)
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ExecutionDataSource for ExecutionStore {
    fn serialize_current(&self) -> Vec<u8> {
        let mut inner = self.lock();
        let (info, records) = self.snapshot_locked(&inner);
        inner.last_serialized = Some(
            records
                .iter()
                .map(|r| (r.class_id, r.probes.clone()))
                .collect(),
        );
        drop(inner);

        let mut buf = Vec::new();
        encode_block(&Block::SessionInfo(info), &mut buf);
        for record in records {
            encode_block(&Block::ExecutionData(record), &mut buf);
        }
        buf
    }

    /// Clears the probes reported by the last snapshot, or every probe if
    /// nothing was serialized since the previous reset.  Hits recorded after
    /// the snapshot survive into the next session.
    fn reset(&self) {
        let mut inner = self.lock();
        match inner.last_serialized.take() {
            Some(reported) => {
                for (class_id, probes) in reported {
                    if let Some(record) = inner.records.get_mut(&class_id) {
                        for (slot, was_reported) in record.probes.iter_mut().zip(probes) {
                            if was_reported {
                                *slot = false;
                            }
                        }
                    }
                }
            }
            None => inner.records.values_mut().for_each(ExecutionRecord::reset),
        }
        inner.start_ms = now_ms();
        debug!(session = %self.session_id, "execution data reset");
    }
}

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
