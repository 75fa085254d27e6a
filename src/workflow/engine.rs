//! Workflow engine: guards, second factor, signing and persistence.
//!
//! Calls for the same workflow are serialized through a per-workflow lock,
//! and every state change is a conditional update on the prior status. A
//! second concurrent sign therefore sees `Signed` before it reaches the
//! backend, and a writer in another process loses the compare-and-set.
//! Signed output and the success record are only committed after the status
//! update wins; a failed attempt leaves the workflow in its prior state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{info, warn};

use super::machine::{check_cancel, check_reject, plan_approve, plan_sign, ApprovePlan, SignPlan};
use super::model::{
    SignatureDraft, SigningDetails, StatusUpdate, UserId, Workflow, WorkflowId, WorkflowMetadata,
    WorkflowStatus,
};
use crate::auth::{require_totp, Authenticator};
use crate::error::{Error, Result};
use crate::pipeline::{PipelineOutput, SignatureRecord, SigningPipeline};
use crate::signatures::{DocumentId, VerificationReport};
use crate::store::WorkflowStore;

/// Result of a sign call.
#[derive(Debug, Clone)]
pub enum SignOutcome {
    /// The document was signed
    Signed {
        /// Workflow after the transition
        workflow: Workflow,
        /// Persisted success record
        record: SignatureRecord,
    },
    /// Approval is pending; the attempt was stored as a draft
    DraftRecorded {
        /// Workflow carrying the draft
        workflow: Workflow,
    },
}

impl SignOutcome {
    /// Workflow after the call.
    pub fn workflow(&self) -> &Workflow {
        match self {
            SignOutcome::Signed { workflow, .. } | SignOutcome::DraftRecorded { workflow } => {
                workflow
            },
        }
    }
}

/// Result of an approval.
#[derive(Debug, Clone)]
pub enum ApproveOutcome {
    /// Approved; the delegate may now sign
    Approved {
        /// Workflow after the transition
        workflow: Workflow,
    },
    /// A draft existed and was signed
    Signed {
        /// Workflow after the transition
        workflow: Workflow,
        /// Persisted success record
        record: SignatureRecord,
    },
}

impl ApproveOutcome {
    /// Workflow after the call.
    pub fn workflow(&self) -> &Workflow {
        match self {
            ApproveOutcome::Approved { workflow } | ApproveOutcome::Signed { workflow, .. } => {
                workflow
            },
        }
    }
}

/// Delegation/approval workflow engine.
pub struct WorkflowEngine {
    workflows: Arc<dyn WorkflowStore>,
    pipeline: Arc<SigningPipeline>,
    auth: Arc<dyn Authenticator>,
    locks: Mutex<HashMap<WorkflowId, Arc<Mutex<()>>>>,
}

impl WorkflowEngine {
    /// Wire the engine to its collaborators.
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        pipeline: Arc<SigningPipeline>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            workflows,
            pipeline,
            auth,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Signing pipeline.
    pub fn pipeline(&self) -> &SigningPipeline {
        &self.pipeline
    }

    /// Create a delegation workflow; the delegate may sign right away.
    pub fn create_delegation(
        &self,
        document_id: DocumentId,
        delegator: UserId,
        delegate: UserId,
        reason: Option<String>,
    ) -> Result<Workflow> {
        self.create(Workflow::delegation(document_id, delegator, delegate), reason)
    }

    /// Create an approval workflow; the delegator must approve first.
    pub fn create_approval(
        &self,
        document_id: DocumentId,
        delegator: UserId,
        delegate: UserId,
        reason: Option<String>,
    ) -> Result<Workflow> {
        self.create(Workflow::approval(document_id, delegator, delegate), reason)
    }

    fn create(&self, mut workflow: Workflow, reason: Option<String>) -> Result<Workflow> {
        if workflow.delegator.as_str().trim().is_empty() || workflow.delegate.as_str().trim().is_empty()
        {
            return Err(Error::Config("delegator and delegate must be named".into()));
        }
        workflow.reason = reason;
        self.workflows.insert_workflow(&workflow)?;
        info!(
            "Created {:?} workflow {} for document {} ({} -> {})",
            workflow.kind, workflow.id, workflow.document_id, workflow.delegator, workflow.delegate
        );
        Ok(workflow)
    }

    /// Current state of a workflow.
    pub fn get(&self, id: WorkflowId) -> Result<Workflow> {
        self.workflows
            .find_workflow(id)?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))
    }

    fn lock_for(&self, id: WorkflowId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Storage("workflow lock table poisoned".into()))?;
        Ok(locks.entry(id).or_default().clone())
    }

    /// Drop the table entry for `id` unless another caller is waiting on it.
    fn release(&self, id: WorkflowId, held: &Arc<Mutex<()>>) {
        if let Ok(mut locks) = self.locks.lock() {
            // One reference in the table, one in `held`
            if Arc::strong_count(held) <= 2 {
                locks.remove(&id);
            }
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map_or(0, |locks| locks.len())
    }

    /// Run `action` while holding the workflow's lock.
    fn serialized<T>(&self, id: WorkflowId, action: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.lock_for(id)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::Storage(format!("lock for workflow {} poisoned", id)))?;
        let result = action();
        // Unknown and terminal workflows never change again
        match self.workflows.find_workflow(id) {
            Ok(Some(wf)) if !wf.status.is_terminal() => {},
            Ok(_) => self.release(id, &lock),
            Err(e) => warn!("Keeping lock for workflow {}: {}", id, e),
        }
        result
    }

    fn transition(
        &self,
        workflow: &Workflow,
        actor: &UserId,
        update: StatusUpdate,
    ) -> Result<Workflow> {
        let updated = self
            .workflows
            .update_workflow_status(workflow.id, workflow.status, &update)?;
        info!(
            "Workflow {}: {} -> {} by {}",
            workflow.id, workflow.status, updated.status, actor
        );
        Ok(updated)
    }

    /// Sign with the pipeline, then commit `from -> Signed`.
    fn sign_and_commit(
        &self,
        workflow: &Workflow,
        actor: &UserId,
        details: &SigningDetails,
    ) -> Result<(Workflow, SignatureRecord)> {
        let request = details.to_request(workflow.document_id.clone());
        let output = self.pipeline.execute(&request, Some(workflow.id))?;

        let update = StatusUpdate::new(WorkflowStatus::Signed).with_metadata(
            WorkflowMetadata::Signed {
                record_id: output.record.id,
            },
        );
        let updated = match self.transition(workflow, actor, update) {
            Ok(updated) => updated,
            Err(e) => {
                warn!("Workflow {} moved on while signing; discarding output", workflow.id);
                self.discard(&output);
                return Err(e);
            },
        };

        let record = self.pipeline.record_success(&output)?;
        Ok((updated, record))
    }

    fn discard(&self, output: &PipelineOutput) {
        if let Err(e) = self.pipeline.discard(output) {
            warn!("Could not remove uncommitted output: {}", e);
        }
    }

    /// Delegate signs.
    ///
    /// `Pending` and `Approved` workflows are signed. A `PendingApproval`
    /// workflow only records the details as a draft; the backend is not
    /// called until the delegator approves.
    pub fn sign(
        &self,
        id: WorkflowId,
        actor: &UserId,
        details: SigningDetails,
        totp: Option<&str>,
    ) -> Result<SignOutcome> {
        self.serialized(id, || {
            let workflow = self.get(id)?;
            let plan = plan_sign(&workflow, actor)?;
            require_totp(self.auth.as_ref(), actor, totp)?;

            match plan {
                SignPlan::RecordDraft => {
                    let draft = SignatureDraft {
                        details,
                        submitted_by: actor.clone(),
                        submitted_at: Utc::now(),
                    };
                    let update = StatusUpdate::new(WorkflowStatus::PendingApproval)
                        .with_metadata(WorkflowMetadata::Draft { draft });
                    let workflow = self.transition(&workflow, actor, update)?;
                    info!("Recorded signature draft on workflow {}", id);
                    Ok(SignOutcome::DraftRecorded { workflow })
                },
                SignPlan::Sign { .. } => {
                    let (workflow, record) = self.sign_and_commit(&workflow, actor, &details)?;
                    Ok(SignOutcome::Signed { workflow, record })
                },
            }
        })
    }

    /// Delegator approves.
    ///
    /// With a draft present the document is signed with the draft's
    /// parameters and the workflow moves directly to `Signed`.
    pub fn approve(
        &self,
        id: WorkflowId,
        actor: &UserId,
        totp: Option<&str>,
        note: Option<String>,
    ) -> Result<ApproveOutcome> {
        self.serialized(id, || {
            let workflow = self.get(id)?;
            let plan = plan_approve(&workflow, actor)?;
            require_totp(self.auth.as_ref(), actor, totp)?;

            match plan {
                ApprovePlan::Approve => {
                    let update = StatusUpdate::new(WorkflowStatus::Approved)
                        .with_metadata(WorkflowMetadata::Approved { note });
                    let workflow = self.transition(&workflow, actor, update)?;
                    Ok(ApproveOutcome::Approved { workflow })
                },
                ApprovePlan::FinalizeDraft(draft) => {
                    info!(
                        "Finalizing draft on workflow {} submitted by {}",
                        id, draft.submitted_by
                    );
                    let (workflow, record) =
                        self.sign_and_commit(&workflow, actor, &draft.details)?;
                    Ok(ApproveOutcome::Signed { workflow, record })
                },
            }
        })
    }

    /// Delegator rejects a pending approval; any draft is dropped.
    pub fn reject(&self, id: WorkflowId, actor: &UserId, reason: Option<String>) -> Result<Workflow> {
        self.serialized(id, || {
            let workflow = self.get(id)?;
            check_reject(&workflow, actor)?;
            let update = StatusUpdate::new(WorkflowStatus::Rejected)
                .with_metadata(WorkflowMetadata::Rejected { reason });
            self.transition(&workflow, actor, update)
        })
    }

    /// Delegator cancels a non-terminal workflow.
    pub fn cancel(&self, id: WorkflowId, actor: &UserId, reason: Option<String>) -> Result<Workflow> {
        self.serialized(id, || {
            let workflow = self.get(id)?;
            check_cancel(&workflow, actor)?;
            let update = StatusUpdate::new(WorkflowStatus::Cancelled)
                .with_metadata(WorkflowMetadata::Cancelled { reason });
            self.transition(&workflow, actor, update)
        })
    }

    /// Verify signed bytes of `document_id` against its latest record.
    pub fn verify(&self, document_id: &DocumentId, data: &[u8]) -> Result<VerificationReport> {
        self.pipeline.verify(document_id, data)
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}
