//! Workflow data model.
//!
//! Metadata is a tagged union rather than an open map, so a workflow can only
//! carry the data that makes sense for its current state (a draft while
//! awaiting approval, a rejection reason once rejected, ...).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signatures::{
    DigestAlgorithm, DocumentId, KeyReference, SignerMetadata, SigningRequest, WidgetAppearance,
};

/// Workflow identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// User identity as supplied by the auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an identity string as given.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trimmed, case-insensitive identity comparison.
    pub fn matches(&self, other: &UserId) -> bool {
        self.0.trim().to_lowercase() == other.0.trim().to_lowercase()
    }
}

impl PartialEq for UserId {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for UserId {}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Workflow kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Delegate may sign immediately
    Delegation,
    /// Delegator must approve before the signature is finalized
    Approval,
}

/// Workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Delegation awaiting the delegate's signature
    Pending,
    /// Approval awaiting the delegator's decision
    PendingApproval,
    /// Approved, awaiting the delegate's signature
    Approved,
    /// Signed (terminal)
    Signed,
    /// Rejected by the delegator (terminal)
    Rejected,
    /// Cancelled by the delegator (terminal)
    Cancelled,
}

impl WorkflowStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Signed | WorkflowStatus::Rejected | WorkflowStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Pending, Signed) => true,
            (PendingApproval, Approved | Rejected | Signed) => true,
            (Approved, Signed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Snake-case name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::PendingApproval => "pending_approval",
            WorkflowStatus::Approved => "approved",
            WorkflowStatus::Signed => "signed",
            WorkflowStatus::Rejected => "rejected",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signing parameters a delegate supplies; everything of a
/// [`SigningRequest`] except the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningDetails {
    /// Signer details
    pub signer: SignerMetadata,
    /// Key material
    pub key: KeyReference,
    /// Timestamp authority endpoint
    #[serde(default)]
    pub tsa_url: Option<String>,
    /// Placeholder size override
    #[serde(default)]
    pub reserved_bytes: Option<usize>,
    /// Visible widget
    #[serde(default)]
    pub appearance: Option<WidgetAppearance>,
    /// Digest algorithm
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,
}

impl SigningDetails {
    /// Details with SHA-256 and an invisible widget.
    pub fn new(signer: SignerMetadata, key: KeyReference) -> Self {
        Self {
            signer,
            key,
            tsa_url: None,
            reserved_bytes: None,
            appearance: None,
            digest_algorithm: DigestAlgorithm::Sha256,
        }
    }

    /// Timestamp at `url`.
    pub fn with_timestamp(mut self, url: impl Into<String>) -> Self {
        self.tsa_url = Some(url.into());
        self
    }

    /// Use a visible widget.
    pub fn with_appearance(mut self, appearance: WidgetAppearance) -> Self {
        self.appearance = Some(appearance);
        self
    }

    /// Reserve `bytes` for the signature.
    pub fn with_reserved_bytes(mut self, bytes: usize) -> Self {
        self.reserved_bytes = Some(bytes);
        self
    }

    /// Build the request for `document_id`.
    pub fn to_request(&self, document_id: DocumentId) -> SigningRequest {
        SigningRequest {
            document_id,
            signer: self.signer.clone(),
            key: self.key.clone(),
            tsa_url: self.tsa_url.clone(),
            reserved_bytes: self.reserved_bytes,
            appearance: self.appearance.clone(),
            digest_algorithm: self.digest_algorithm,
        }
    }
}

/// A delegate's signing attempt recorded before approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureDraft {
    /// Captured parameters
    pub details: SigningDetails,
    /// Who submitted it
    pub submitted_by: UserId,
    /// When
    pub submitted_at: DateTime<Utc>,
}

/// State-specific workflow data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowMetadata {
    /// Nothing recorded
    #[default]
    Empty,
    /// Pending approval with a delegate draft
    Draft {
        /// The draft
        draft: SignatureDraft,
    },
    /// Approved without a draft
    Approved {
        /// Optional approval note
        note: Option<String>,
    },
    /// Signed
    Signed {
        /// Success record id
        record_id: Uuid,
    },
    /// Rejected
    Rejected {
        /// Optional reason
        reason: Option<String>,
    },
    /// Cancelled
    Cancelled {
        /// Optional reason
        reason: Option<String>,
    },
}

impl WorkflowMetadata {
    /// The recorded draft, if any.
    pub fn draft(&self) -> Option<&SignatureDraft> {
        match self {
            WorkflowMetadata::Draft { draft } => Some(draft),
            _ => None,
        }
    }
}

/// How a status update changes the metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataPatch {
    /// Leave metadata untouched
    Keep,
    /// Replace metadata
    Set(WorkflowMetadata),
}

/// Conditional status update handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// New status
    pub status: WorkflowStatus,
    /// Metadata change
    pub metadata: MetadataPatch,
    /// Transition time
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Update to `status` at the current time, keeping metadata.
    pub fn new(status: WorkflowStatus) -> Self {
        Self {
            status,
            metadata: MetadataPatch::Keep,
            at: Utc::now(),
        }
    }

    /// Replace the metadata as part of the update.
    pub fn with_metadata(mut self, metadata: WorkflowMetadata) -> Self {
        self.metadata = MetadataPatch::Set(metadata);
        self
    }
}

/// A signing workflow between a delegator and a delegate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Id
    pub id: WorkflowId,
    /// Kind
    pub kind: WorkflowKind,
    /// Document to be signed
    pub document_id: DocumentId,
    /// Owner who created the workflow
    pub delegator: UserId,
    /// User allowed to sign
    pub delegate: UserId,
    /// Current status
    pub status: WorkflowStatus,
    /// Why the signature is requested
    #[serde(default)]
    pub reason: Option<String>,
    /// State-specific data
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Approval time
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    /// Signing time
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    /// Rejection time
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    /// Cancellation time
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Workflow {
    fn create(
        kind: WorkflowKind,
        status: WorkflowStatus,
        document_id: DocumentId,
        delegator: UserId,
        delegate: UserId,
    ) -> Self {
        Self {
            id: WorkflowId::new(),
            kind,
            document_id,
            delegator,
            delegate,
            status,
            reason: None,
            metadata: WorkflowMetadata::Empty,
            created_at: Utc::now(),
            approved_at: None,
            signed_at: None,
            rejected_at: None,
            cancelled_at: None,
        }
    }

    /// Delegation: starts `Pending`.
    pub fn delegation(document_id: DocumentId, delegator: UserId, delegate: UserId) -> Self {
        Self::create(
            WorkflowKind::Delegation,
            WorkflowStatus::Pending,
            document_id,
            delegator,
            delegate,
        )
    }

    /// Approval: starts `PendingApproval`.
    pub fn approval(document_id: DocumentId, delegator: UserId, delegate: UserId) -> Self {
        Self::create(
            WorkflowKind::Approval,
            WorkflowStatus::PendingApproval,
            document_id,
            delegator,
            delegate,
        )
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Apply an update that the store has already accepted.
    pub fn apply(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        if let MetadataPatch::Set(metadata) = &update.metadata {
            self.metadata = metadata.clone();
        }
        match update.status {
            WorkflowStatus::Approved => self.approved_at = Some(update.at),
            WorkflowStatus::Signed => {
                // Finalizing a draft approves and signs in one step
                if self.kind == WorkflowKind::Approval && self.approved_at.is_none() {
                    self.approved_at = Some(update.at);
                }
                self.signed_at = Some(update.at);
            },
            WorkflowStatus::Rejected => self.rejected_at = Some(update.at),
            WorkflowStatus::Cancelled => self.cancelled_at = Some(update.at),
            WorkflowStatus::Pending | WorkflowStatus::PendingApproval => {},
        }
    }
}
