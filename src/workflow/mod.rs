//! Delegation and approval signing workflows.
//!
//! ```text
//! Delegation:  Pending ----------------------> Signed
//! Approval:    PendingApproval -> Approved --> Signed
//!              PendingApproval --------------> Signed    (approve with draft)
//!              PendingApproval --------------> Rejected
//! any non-terminal --------------------------> Cancelled
//! ```
//!
//! [`machine`] holds the pure transition guards, [`WorkflowEngine`] applies
//! them with the second factor, the signing pipeline and the persistence
//! collaborator.

mod engine;
pub mod machine;
mod model;

pub use engine::{ApproveOutcome, SignOutcome, WorkflowEngine};
pub use model::{
    MetadataPatch, SignatureDraft, SigningDetails, StatusUpdate, UserId, Workflow, WorkflowId,
    WorkflowKind, WorkflowMetadata, WorkflowStatus,
};
