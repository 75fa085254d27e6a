//! Persistence and file store collaborators.
//!
//! The engine needs only a handful of operations from the outside world:
//! resolve and read a document, write signed output next to it, find and
//! conditionally update a workflow, and insert/find signature records.
//! [`MemoryStore`] implements all of them in memory; [`FsDocumentStore`]
//! serves documents from a directory.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::SignatureRecord;
use crate::signatures::DocumentId;
use crate::workflow::{StatusUpdate, Workflow, WorkflowId, WorkflowStatus};

mod fs;
mod memory;

pub use fs::FsDocumentStore;
pub use memory::MemoryStore;

/// File store collaborator: PDF bytes in, PDF bytes out.
pub trait DocumentStore: Send + Sync {
    /// Path the document id refers to.
    fn resolve_path(&self, id: &DocumentId) -> Result<PathBuf>;

    /// Read the document.
    fn read(&self, id: &DocumentId) -> Result<Vec<u8>>;

    /// Write signed output for `id` to a new path, never over the original.
    fn write_signed(&self, id: &DocumentId, record_id: Uuid, bytes: &[u8]) -> Result<PathBuf>;

    /// Remove output previously returned by [`write_signed`](Self::write_signed).
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Workflow persistence.
pub trait WorkflowStore: Send + Sync {
    /// Insert a new workflow.
    fn insert_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Look up a workflow.
    fn find_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>>;

    /// Apply `update` only if the stored status is still `expected`.
    ///
    /// Returns the updated workflow, `StateViolation::StaleState` when the
    /// status moved on, and `NotFound` for an unknown id.
    fn update_workflow_status(
        &self,
        id: WorkflowId,
        expected: WorkflowStatus,
        update: &StatusUpdate,
    ) -> Result<Workflow>;
}

/// Signature record persistence. Records are immutable once inserted.
pub trait SignatureRecordStore: Send + Sync {
    /// Insert a record.
    fn insert_signature_record(&self, record: &SignatureRecord) -> Result<()>;

    /// Most recent record (by timestamp, then insertion) for a document.
    fn find_latest_signature_record(&self, document_id: &DocumentId)
        -> Result<Option<SignatureRecord>>;

    /// All records for a document, oldest first.
    fn list_signature_records(&self, document_id: &DocumentId) -> Result<Vec<SignatureRecord>>;
}
