//! In-memory implementation of every collaborator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::debug;
use uuid::Uuid;

use super::{DocumentStore, SignatureRecordStore, WorkflowStore};
use crate::error::{Error, Result, StateViolation};
use crate::pipeline::SignatureRecord;
use crate::signatures::DocumentId;
use crate::workflow::{StatusUpdate, Workflow, WorkflowId, WorkflowStatus};

/// Thread-safe in-memory store for workflows, records and documents.
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
    records: Mutex<Vec<SignatureRecord>>,
    documents: Mutex<HashMap<DocumentId, Vec<u8>>>,
    outputs: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Storage(format!("{} lock poisoned", what)))
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub fn put_document(&self, id: DocumentId, bytes: Vec<u8>) -> Result<()> {
        lock(&self.documents, "documents")?.insert(id, bytes);
        Ok(())
    }

    /// Bytes written by [`DocumentStore::write_signed`].
    pub fn signed_output(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.outputs, "outputs")?.get(path).cloned())
    }

    /// Number of signed outputs currently held.
    pub fn output_count(&self) -> Result<usize> {
        Ok(lock(&self.outputs, "outputs")?.len())
    }

    /// Every record, in insertion order.
    pub fn all_signature_records(&self) -> Result<Vec<SignatureRecord>> {
        Ok(lock(&self.records, "records")?.clone())
    }
}

impl DocumentStore for MemoryStore {
    fn resolve_path(&self, id: &DocumentId) -> Result<PathBuf> {
        if lock(&self.documents, "documents")?.contains_key(id) {
            Ok(PathBuf::from(format!("memory/{}.pdf", id)))
        } else {
            Err(Error::NotFound(format!("document {}", id)))
        }
    }

    fn read(&self, id: &DocumentId) -> Result<Vec<u8>> {
        lock(&self.documents, "documents")?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))
    }

    fn write_signed(&self, id: &DocumentId, record_id: Uuid, bytes: &[u8]) -> Result<PathBuf> {
        let path = PathBuf::from(format!("memory/{}.signed.{}.pdf", id, record_id));
        lock(&self.outputs, "outputs")?.insert(path.clone(), bytes.to_vec());
        Ok(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        lock(&self.outputs, "outputs")?.remove(path);
        Ok(())
    }
}

impl WorkflowStore for MemoryStore {
    fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = lock(&self.workflows, "workflows")?;
        if workflows.contains_key(&workflow.id) {
            return Err(Error::Storage(format!("workflow {} already exists", workflow.id)));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    fn find_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        Ok(lock(&self.workflows, "workflows")?.get(&id).cloned())
    }

    fn update_workflow_status(
        &self,
        id: WorkflowId,
        expected: WorkflowStatus,
        update: &StatusUpdate,
    ) -> Result<Workflow> {
        let mut workflows = lock(&self.workflows, "workflows")?;
        let workflow = workflows
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))?;

        if workflow.status != expected {
            debug!(
                "CAS on workflow {} refused: expected {}, found {}",
                id, expected, workflow.status
            );
            return Err(StateViolation::StaleState {
                workflow: id,
                expected,
                found: workflow.status,
            }
            .into());
        }

        workflow.apply(update);
        Ok(workflow.clone())
    }
}

impl SignatureRecordStore for MemoryStore {
    fn insert_signature_record(&self, record: &SignatureRecord) -> Result<()> {
        let mut records = lock(&self.records, "records")?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(Error::Storage(format!("signature record {} already exists", record.id)));
        }
        records.push(record.clone());
        Ok(())
    }

    fn find_latest_signature_record(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<SignatureRecord>> {
        let records = lock(&self.records, "records")?;
        // max_by_key keeps the last maximum, so ties resolve to the newest insert
        Ok(records
            .iter()
            .filter(|r| &r.document_id == document_id)
            .max_by_key(|r| r.timestamp)
            .cloned())
    }

    fn list_signature_records(&self, document_id: &DocumentId) -> Result<Vec<SignatureRecord>> {
        let mut list: Vec<SignatureRecord> = lock(&self.records, "records")?
            .iter()
            .filter(|r| &r.document_id == document_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.timestamp);
        Ok(list)
    }
}
