//! Transition guards.
//!
//! Pure functions over a loaded [`Workflow`]: they decide whether an actor
//! may perform an action from the current state and what the action turns
//! into. Persistence, TOTP and signing happen in the engine.

use super::model::{SignatureDraft, UserId, Workflow, WorkflowStatus};
use crate::error::{Result, StateViolation};

/// What a delegate's sign call does.
#[derive(Debug, Clone, PartialEq)]
pub enum SignPlan {
    /// Run the pipeline and move `from -> Signed`
    Sign {
        /// Status the conditional update expects
        from: WorkflowStatus,
    },
    /// Approval still pending: store a draft, do not sign
    RecordDraft,
}

/// What a delegator's approval does.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovePlan {
    /// Move to `Approved` and wait for the delegate
    Approve,
    /// Sign with the delegate's draft and move straight to `Signed`
    FinalizeDraft(SignatureDraft),
}

fn require_delegate(workflow: &Workflow, actor: &UserId) -> Result<()> {
    if workflow.delegate.matches(actor) {
        Ok(())
    } else {
        Err(StateViolation::NotDelegate {
            workflow: workflow.id,
            actor: actor.to_string(),
        }
        .into())
    }
}

fn require_delegator(workflow: &Workflow, actor: &UserId) -> Result<()> {
    if workflow.delegator.matches(actor) {
        Ok(())
    } else {
        Err(StateViolation::NotDelegator {
            workflow: workflow.id,
            actor: actor.to_string(),
        }
        .into())
    }
}

fn invalid(workflow: &Workflow, action: &'static str) -> crate::error::Error {
    StateViolation::InvalidTransition {
        workflow: workflow.id,
        action,
        status: workflow.status,
    }
    .into()
}

/// Guard for a sign call.
///
/// An already signed workflow is refused before anything else, so a repeated
/// call always reports `AlreadySigned`.
pub fn plan_sign(workflow: &Workflow, actor: &UserId) -> Result<SignPlan> {
    if workflow.status == WorkflowStatus::Signed {
        return Err(StateViolation::AlreadySigned(workflow.id).into());
    }
    require_delegate(workflow, actor)?;
    match workflow.status {
        WorkflowStatus::Pending | WorkflowStatus::Approved => Ok(SignPlan::Sign {
            from: workflow.status,
        }),
        WorkflowStatus::PendingApproval => Ok(SignPlan::RecordDraft),
        _ => Err(invalid(workflow, "sign")),
    }
}

/// Guard for an approval.
pub fn plan_approve(workflow: &Workflow, actor: &UserId) -> Result<ApprovePlan> {
    require_delegator(workflow, actor)?;
    if workflow.status != WorkflowStatus::PendingApproval {
        return Err(invalid(workflow, "approve"));
    }
    Ok(match workflow.metadata.draft() {
        Some(draft) => ApprovePlan::FinalizeDraft(draft.clone()),
        None => ApprovePlan::Approve,
    })
}

/// Guard for a rejection.
pub fn check_reject(workflow: &Workflow, actor: &UserId) -> Result<()> {
    require_delegator(workflow, actor)?;
    if workflow.status != WorkflowStatus::PendingApproval {
        return Err(invalid(workflow, "reject"));
    }
    Ok(())
}

/// Guard for a cancellation.
pub fn check_cancel(workflow: &Workflow, actor: &UserId) -> Result<()> {
    require_delegator(workflow, actor)?;
    if !workflow.status.can_transition_to(WorkflowStatus::Cancelled) {
        return Err(invalid(workflow, "cancel"));
    }
    Ok(())
}
