//! Error types for the signature engine.
//!
//! This module defines all error types that can occur while preparing,
//! signing, embedding and verifying PDF signatures, and while driving the
//! signing workflow.

use crate::workflow::{WorkflowId, WorkflowStatus};

/// Result type alias for signature engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the signature engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input is not a well-formed PDF (or a prepared PDF lost its placeholder)
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Encoded CMS does not fit into the reserved `/Contents` placeholder
    #[error("Signature needs {required} bytes but only {reserved} bytes are reserved")]
    SignatureTooLarge {
        /// DER length of the signature
        required: usize,
        /// Reserved placeholder size in bytes
        reserved: usize,
    },

    /// Neither the real signer nor a permitted fallback could be reached
    #[error("Signing backend unavailable: {0}")]
    SigningBackendUnavailable(String),

    /// Signer rejected the request or returned an unusable result
    #[error("Signing failed: {message}")]
    SigningFailed {
        /// Upstream error detail
        message: String,
        /// Whether retrying later may succeed
        transient: bool,
    },

    /// Actor has a second factor enabled but did not supply a code
    #[error("TOTP code required for user {0}")]
    TotpRequired(String),

    /// Supplied TOTP code did not verify
    #[error("Invalid TOTP code for user {0}")]
    InvalidTotp(String),

    /// Workflow transition refused
    #[error("Workflow state violation: {0}")]
    WorkflowStateViolation(StateViolation),

    /// Two digests of the same signed bytes disagree
    #[error("Digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch {
        /// Digest that was expected (recorded or attested)
        expected: String,
        /// Digest recomputed from the document
        computed: String,
    },

    /// Signature structure could not be verified
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// RFC 3161 timestamp authority failure
    #[error("Timestamp authority error: {message}")]
    Timestamp {
        /// Error detail
        message: String,
        /// Whether retrying later may succeed
        transient: bool,
    },

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced document, workflow or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unsupported feature
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a workflow transition is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateViolation {
    /// Signing is at-most-once per workflow
    #[error("workflow {0} is already signed")]
    AlreadySigned(WorkflowId),

    /// Only the delegator may approve, reject or cancel
    #[error("user '{actor}' is not the delegator of workflow {workflow}")]
    NotDelegator {
        /// Workflow id
        workflow: WorkflowId,
        /// Acting user
        actor: String,
    },

    /// Only the delegate may sign
    #[error("user '{actor}' is not the delegate of workflow {workflow}")]
    NotDelegate {
        /// Workflow id
        workflow: WorkflowId,
        /// Acting user
        actor: String,
    },

    /// Action is not allowed from the current state
    #[error("cannot {action} workflow {workflow} while it is {status}")]
    InvalidTransition {
        /// Workflow id
        workflow: WorkflowId,
        /// Attempted action
        action: &'static str,
        /// Status observed
        status: WorkflowStatus,
    },

    /// Conditional update lost against a concurrent writer
    #[error("workflow {workflow} changed concurrently: expected {expected}, found {found}")]
    StaleState {
        /// Workflow id
        workflow: WorkflowId,
        /// Prior status the update was conditioned on
        expected: WorkflowStatus,
        /// Status found in the store
        found: WorkflowStatus,
    },
}

impl Error {
    /// Create a non-transient signing failure.
    pub fn signing_failed(message: impl Into<String>) -> Self {
        Error::SigningFailed {
            message: message.into(),
            transient: false,
        }
    }

    /// Create a signing failure that may succeed on retry.
    pub fn transient_signing_failure(message: impl Into<String>) -> Self {
        Error::SigningFailed {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether a caller may retry the operation with backoff.
    ///
    /// Only transient backend failures qualify; structural and validation
    /// failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SigningBackendUnavailable(_) => true,
            Error::SigningFailed { transient, .. } => *transient,
            Error::Timestamp { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether the failure is correctable by the user (4xx-equivalent).
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Error::TotpRequired(_) | Error::InvalidTotp(_) | Error::WorkflowStateViolation(_)
        )
    }
}

impl From<StateViolation> for Error {
    fn from(violation: StateViolation) -> Self {
        Error::WorkflowStateViolation(violation)
    }
}
