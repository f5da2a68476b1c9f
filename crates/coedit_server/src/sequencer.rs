use crate::cache::DocumentCache;
use crate::db::{DocumentRepo, OperationRecord};
use crate::error::SubmitError;
use crate::sync::protocol::{DocumentState, OperationInput, OperationSummary};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::info;

/// A successfully sequenced operation
#[derive(Debug, Clone)]
pub struct CommittedOperation {
    pub operation_id: String,
    pub version: i64,
    pub kind: String,
    pub payload_hex: String,
    pub timestamp: i64,
}

/// Result of a catch-up request
#[derive(Debug)]
pub enum CatchUp {
    /// Operations the caller is missing, in version order
    Operations(Vec<OperationRecord>),
    /// The caller's known version predates the retained window; it must take
    /// a full document resync instead of replaying history
    SnapshotRequired,
}

/// Authoritative, serialized version assignment and durable append of
/// operations per document.
///
/// All submissions for one document pass through that document's ordering
/// section, so acknowledged versions form a gap-free sequence 1..=N no matter
/// how many connections submit concurrently.
pub struct OperationSequencer {
    repo: Arc<DocumentRepo>,
    cache: Arc<DocumentCache>,
    sync_window: usize,
    ordering: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OperationSequencer {
    pub fn new(repo: Arc<DocumentRepo>, cache: Arc<DocumentCache>, sync_window: usize) -> Self {
        Self {
            repo,
            cache,
            sync_window,
            ordering: StdMutex::new(HashMap::new()),
        }
    }

    /// Sequence and persist one operation as a single atomic unit.
    ///
    /// On failure nothing is persisted and the version counter does not
    /// advance. The caller acks the returned version to the submitting
    /// session and relays the operation to the rest of the group.
    pub async fn submit(
        &self,
        document_id: &str,
        author_id: &str,
        input: &OperationInput,
        client_message_id: Option<&str>,
    ) -> Result<CommittedOperation, SubmitError> {
        let section = self.ordering_section(document_id);
        let _ordered = section.lock().await;

        let kind = match input.kind.as_deref() {
            Some(kind) if !kind.is_empty() => kind,
            _ => return Err(SubmitError::InvalidOperation("missing operation type".into())),
        };
        let payload_hex = match input.payload.as_deref() {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Err(SubmitError::InvalidOperation("missing payload".into())),
        };
        let payload = hex::decode(payload_hex)
            .map_err(|_| SubmitError::InvalidOperation("payload is not valid hex".into()))?;

        let appended =
            self.repo
                .append_operation(document_id, author_id, kind, &payload, client_message_id)?;

        self.cache.invalidate(document_id);

        Ok(CommittedOperation {
            operation_id: appended.operation_id,
            version: appended.version,
            kind: kind.to_string(),
            payload_hex: payload_hex.to_string(),
            timestamp: appended.timestamp,
        })
    }

    /// Operations with version greater than `known_version`, bounded to the
    /// retained recency window.
    pub fn catch_up(&self, document_id: &str, known_version: i64) -> Result<CatchUp, SubmitError> {
        let document = self
            .repo
            .get_document(document_id)?
            .ok_or(SubmitError::DocumentNotFound)?;

        // If compaction discarded operations the caller has never seen, a
        // replay would silently skip history; force a full resync instead.
        if known_version < document.current_version {
            if let Some(min_version) = self.repo.min_retained_version(document_id)? {
                if known_version + 1 < min_version {
                    return Ok(CatchUp::SnapshotRequired);
                }
            } else {
                return Ok(CatchUp::SnapshotRequired);
            }
        }

        let operations =
            self.repo
                .operations_since(document_id, known_version, self.sync_window)?;
        Ok(CatchUp::Operations(operations))
    }

    /// Read-view of a document for initial sync, served through the cache
    pub fn document_state(&self, document_id: &str) -> Result<DocumentState, SubmitError> {
        if let Some(state) = self.cache.get(document_id) {
            return Ok(state);
        }

        let document = self
            .repo
            .get_document(document_id)?
            .ok_or(SubmitError::DocumentNotFound)?;
        let updates = self
            .repo
            .recent_operations(document_id, self.sync_window)?
            .into_iter()
            .map(|op| OperationSummary {
                operation_id: op.operation_id,
                version: op.version,
                payload: hex::encode(&op.payload),
                timestamp: op.timestamp,
            })
            .collect();

        let state = DocumentState {
            document_id: document.id,
            version: document.current_version,
            updates,
        };
        self.cache.put(document_id, state.clone());
        Ok(state)
    }

    /// Out-of-band log compaction for one document. Not on the hot path.
    pub fn compact(
        &self,
        document_id: &str,
        threshold: usize,
        retain: usize,
    ) -> Result<usize, SubmitError> {
        let deleted = self.repo.compact_operations(document_id, threshold, retain)?;
        if deleted > 0 {
            info!(
                "Compacted {} operations for document {}",
                deleted, document_id
            );
        }
        Ok(deleted)
    }

    fn ordering_section(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut sections = self.ordering.lock().unwrap();
        sections
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
