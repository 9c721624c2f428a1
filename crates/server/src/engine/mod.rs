//! Document authorities: the single in-memory owners of document state.
//!
//! One authority exists per document, held in a process-wide registry. All
//! mutations and snapshots of a document go through its `tokio::sync::Mutex`,
//! which is the per-document serialization primitive: operations on one
//! document are FIFO, documents proceed in parallel.

use std::collections::{hash_map::Entry, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coedit_common::ot::{self, EditKind, Operation, ValidationError};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::metrics;
use crate::store::{DocumentStore, StoreError};

/// Smallest usable transform tail. Anything shorter makes `TooStale` fire
/// on ordinary keystroke-level concurrency.
pub const MIN_TAIL_LIMIT: usize = 10;

const STORE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retained transform tail length; operations based on an older version
    /// than the tail covers are rejected as too stale.
    pub tail_limit: usize,
    /// Applied-op count that forces a write-back.
    pub persist_ops_threshold: u32,
    /// Dirty age that forces a write-back.
    pub persist_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tail_limit: 50,
            persist_ops_threshold: 20,
            persist_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound { doc_id: Uuid },

    FromTheFuture { base_version: u64, head_version: u64 },

    TooStale { base_version: u64, oldest_supported: u64 },

    Invalid { reason: String },

    StoreUnavailable { source: StoreError },
}

impl EngineError {
    /// Wire error code carried in `ERROR` frames.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::FromTheFuture { .. } => "FROM_THE_FUTURE",
            Self::TooStale { .. } => "TOO_STALE",
            Self::Invalid { .. } => "INVALID_OPERATION",
            Self::StoreUnavailable { .. } => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { doc_id } => write!(f, "document {doc_id} does not exist"),
            Self::FromTheFuture { base_version, head_version } => write!(
                f,
                "base version {base_version} is ahead of the document head {head_version}"
            ),
            Self::TooStale { base_version, oldest_supported } => write!(
                f,
                "base version {base_version} predates the retained history \
                 (oldest supported is {oldest_supported}); rejoin to resync"
            ),
            Self::Invalid { reason } => write!(f, "operation failed validation: {reason}"),
            Self::StoreUnavailable { source } => {
                write!(f, "document store is unavailable: {source}")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::StoreUnavailable { source } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct AppliedOp {
    /// The version this operation produced.
    version: u64,
    op: Operation,
}

#[derive(Debug)]
struct DocState {
    content: String,
    version: u64,
    recent_ops: VecDeque<AppliedOp>,
    /// When the oldest unpersisted change was applied; `None` when clean.
    dirty_since: Option<Instant>,
    ops_since_persist: u32,
}

/// The authoritative in-memory owner of one document.
#[derive(Debug)]
pub struct DocAuthority {
    doc_id: Uuid,
    store: DocumentStore,
    config: EngineConfig,
    state: Mutex<DocState>,
}

impl DocAuthority {
    fn new(doc_id: Uuid, store: DocumentStore, config: EngineConfig, content: String, version: u64) -> Self {
        Self {
            doc_id,
            store,
            config,
            state: Mutex::new(DocState {
                content,
                version,
                recent_ops: VecDeque::new(),
                dirty_since: None,
                ops_since_persist: 0,
            }),
        }
    }

    /// Validate, transform, and apply one client operation.
    ///
    /// Returns the resulting document version together with the transformed
    /// operation peers must apply. A delete consumed entirely by concurrent
    /// deletes is acknowledged at the current version without advancing
    /// history.
    pub async fn apply_operation(&self, op: Operation) -> Result<(u64, Operation), EngineError> {
        // Payload-shape invariants hold independent of content; enforce them
        // on the client-submitted op before transformation can mask them.
        match &op.edit {
            EditKind::Insert { text } if text.is_empty() => {
                return Err(EngineError::Invalid { reason: ValidationError::EmptyInsert.to_string() });
            }
            EditKind::Delete { length: 0 } => {
                return Err(EngineError::Invalid {
                    reason: ValidationError::ZeroLengthDelete.to_string(),
                });
            }
            _ => {}
        }

        let mut state = self.state.lock().await;

        if op.base_version > state.version {
            return Err(EngineError::FromTheFuture {
                base_version: op.base_version,
                head_version: state.version,
            });
        }

        let mut op = op;
        if op.base_version < state.version {
            let oldest_supported = state.version - state.recent_ops.len() as u64;
            if op.base_version < oldest_supported {
                return Err(EngineError::TooStale {
                    base_version: op.base_version,
                    oldest_supported,
                });
            }

            let base_version = op.base_version;
            for applied in state.recent_ops.iter().filter(|entry| entry.version > base_version) {
                op = ot::transform(&op, &applied.op);
            }
        }

        if op.is_noop() {
            return Ok((state.version, op));
        }

        if let Err(error) = ot::check(&state.content, &op) {
            return Err(EngineError::Invalid { reason: error.to_string() });
        }

        state.content = ot::apply(&state.content, &op);
        state.version += 1;
        let version = state.version;
        state.recent_ops.push_back(AppliedOp { version, op: op.clone() });
        while state.recent_ops.len() > self.config.tail_limit {
            state.recent_ops.pop_front();
        }

        state.ops_since_persist += 1;
        if state.dirty_since.is_none() {
            state.dirty_since = Some(Instant::now());
        }
        if self.should_persist(&state) {
            self.persist_locked(&mut state).await;
        }

        Ok((version, op))
    }

    /// A consistent `(content, version)` pair for sync replies.
    pub async fn snapshot(&self) -> (String, u64) {
        let state = self.state.lock().await;
        (state.content.clone(), state.version)
    }

    /// Persist if dirty. With `force` false, only when a trigger condition
    /// is met; returns whether a persist succeeded.
    pub async fn flush(&self, force: bool) -> bool {
        let mut state = self.state.lock().await;
        if state.dirty_since.is_none() {
            return false;
        }
        if !force && !self.should_persist(&state) {
            return false;
        }
        self.persist_locked(&mut state).await
    }

    fn should_persist(&self, state: &DocState) -> bool {
        state.ops_since_persist >= self.config.persist_ops_threshold
            || state
                .dirty_since
                .is_some_and(|since| since.elapsed() >= self.config.persist_interval)
    }

    /// Write `{content, version}` back to the durable store. Runs under the
    /// document lock so the persisted pair is always consistent. Failure
    /// leaves the counters untouched; the next trigger retries.
    async fn persist_locked(&self, state: &mut DocState) -> bool {
        let write = self.store.upsert(self.doc_id, &state.content, state.version);
        match tokio::time::timeout(STORE_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {
                state.ops_since_persist = 0;
                state.dirty_since = None;
                metrics::record_persist(false);
                true
            }
            Ok(Err(error)) => {
                metrics::record_persist(true);
                warn!(
                    doc_id = %self.doc_id,
                    error = %error,
                    "document write-back failed; retrying on next trigger"
                );
                false
            }
            Err(_) => {
                metrics::record_persist(true);
                warn!(
                    doc_id = %self.doc_id,
                    timeout_ms = STORE_WRITE_TIMEOUT.as_millis() as u64,
                    "document write-back timed out; retrying on next trigger"
                );
                false
            }
        }
    }
}

/// Process-wide `docId -> authority` registry. Authorities are created
/// lazily on first reference and stay resident for the process lifetime.
pub struct DocRegistry {
    docs: RwLock<HashMap<Uuid, Arc<DocAuthority>>>,
    store: DocumentStore,
    config: EngineConfig,
}

impl DocRegistry {
    pub fn new(store: DocumentStore, config: EngineConfig) -> Self {
        Self { docs: RwLock::new(HashMap::new()), store, config }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Insert a new durable record seeded with `seed` at version 0.
    pub async fn create_document(&self, seed: String) -> Result<Uuid, EngineError> {
        self.store.create(seed).await.map_err(|source| EngineError::StoreUnavailable { source })
    }

    /// Return the authority for `doc_id`, hydrating from the durable store
    /// on first reference.
    pub async fn load_or_attach(&self, doc_id: Uuid) -> Result<Arc<DocAuthority>, EngineError> {
        if let Some(authority) = self.docs.read().await.get(&doc_id) {
            return Ok(Arc::clone(authority));
        }

        let record = self
            .store
            .fetch(doc_id)
            .await
            .map_err(|source| EngineError::StoreUnavailable { source })?
            .ok_or(EngineError::NotFound { doc_id })?;

        let mut docs = self.docs.write().await;
        let authority = match docs.entry(doc_id) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(vacant) => {
                let authority = Arc::new(DocAuthority::new(
                    doc_id,
                    self.store.clone(),
                    self.config.clone(),
                    record.content,
                    record.version,
                ));
                Arc::clone(vacant.insert(authority))
            }
        };

        Ok(authority)
    }

    /// The authority for `doc_id` if it is already resident.
    pub async fn attached(&self, doc_id: Uuid) -> Option<Arc<DocAuthority>> {
        self.docs.read().await.get(&doc_id).map(Arc::clone)
    }

    /// Write-back sweep over resident documents; returns how many persisted.
    pub async fn flush_dirty(&self, force: bool) -> usize {
        let authorities: Vec<_> = self.docs.read().await.values().map(Arc::clone).collect();

        let mut flushed = 0;
        for authority in authorities {
            if authority.flush(force).await {
                flushed += 1;
            }
        }
        flushed
    }
}
