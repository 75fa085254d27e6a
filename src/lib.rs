// Allow some clippy lints that are too pedantic for this project
#![allow(clippy::too_many_arguments)]
#![allow(clippy::enum_variant_names)]
#![allow(clippy::large_enum_variant)]
// Allow unused for tests
#![cfg_attr(test, allow(dead_code))]

//! # PDF Signflow
//!
//! PDF signature engine: byte-exact signature placeholders, detached CMS/PKCS#7
//! signatures, pluggable signing backends and a delegation/approval workflow
//! that decides when a document may be signed and by whom.
//!
//! ## Core Features
//!
//! - **Placeholder preparation**: incremental update adding a signature field,
//!   widget (invisible or with a visible stamp) and a zero-filled `/Contents`
//!   reservation with a final `/ByteRange`
//! - **Byte-range digests**: explicit-ByteRange and Contents-relative policies,
//!   cross-checked against each other
//! - **CMS/PKCS#7**: detached SignedData with signing-time, message-digest and
//!   ESS signing-certificate-v2 attributes, optional RFC 3161 timestamp token
//! - **Backends**: local PKCS#12 key or remote HSM over an authenticated HTTP
//!   channel, with a configuration-gated deterministic mock for development
//! - **Workflow**: Delegation and Approval state machines with ownership
//!   checks, TOTP re-authentication and draft-then-finalize signing
//! - **Verification**: structural markers plus cryptographic checks, cross
//!   referenced against persisted signature records
//!
//! ## Quick Start
//!
//! ```ignore
//! use pdf_signflow::backend::LocalP12Backend;
//! use pdf_signflow::signatures::{PlaceholderOptions, SignatureVerifier, SignerMetadata};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pdf = std::fs::read("contract.pdf")?;
//! let backend = LocalP12Backend::open("signer.p12", "password")?;
//! let options = PlaceholderOptions::new(SignerMetadata::new("Alice").with_reason("Approved"));
//!
//! let signed = pdf_signflow::sign_document(&pdf, &options, &backend)?;
//! std::fs::write("contract.signed.pdf", &signed.bytes)?;
//!
//! let report = SignatureVerifier::new().verify_document(&signed.bytes)?;
//! assert!(report.is_signed && report.is_valid);
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! Licensed under either of:
//!
//! * Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
//! * MIT license ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Error handling
pub mod error;

// Configuration
pub mod config;

// PDF-level signature machinery
pub mod signatures;

// Signing backends (local PKCS#12, remote HSM, mock)
pub mod backend;

// Prepare -> digest -> sign -> embed
pub mod pipeline;

// Persistence and file store collaborators
pub mod store;

// TOTP and the auth collaborator
pub mod auth;

// Delegation/approval state machine
pub mod workflow;

// Re-exports
pub use config::{EngineConfig, Environment, HsmConfig, MockPolicy, TsaConfig};
pub use error::{Error, Result, StateViolation};
pub use pipeline::{sign_document, RecordStatus, SignatureRecord, SignedPdf, SigningPipeline};
pub use signatures::{DocumentId, SigningRequest};
pub use workflow::{Workflow, WorkflowEngine, WorkflowId, WorkflowKind, WorkflowStatus};

// Internal utilities
pub(crate) mod utils {
    //! Internal utility functions for the library.

    use chrono::{DateTime, Utc};

    const HEX_UPPER: &[u8] = b"0123456789ABCDEF";
    const HEX_LOWER: &[u8] = b"0123456789abcdef";

    fn to_hex(bytes: &[u8], table: &[u8]) -> String {
        let mut hex = String::with_capacity(bytes.len() * 2);
        for &byte in bytes {
            hex.push(table[(byte >> 4) as usize] as char);
            hex.push(table[(byte & 0x0F) as usize] as char);
        }
        hex
    }

    /// Convert bytes to uppercase hex string.
    pub fn to_hex_upper(bytes: &[u8]) -> String {
        to_hex(bytes, HEX_UPPER)
    }

    /// Convert bytes to lowercase hex string.
    pub fn to_hex_lower(bytes: &[u8]) -> String {
        to_hex(bytes, HEX_LOWER)
    }

    /// Decode a hex string (either case). Returns `None` on odd length or
    /// non-hex characters.
    pub fn decode_hex(hex: &str) -> Option<Vec<u8>> {
        let bytes = hex.as_bytes();
        if bytes.len() % 2 != 0 {
            return None;
        }
        bytes
            .chunks(2)
            .map(|pair| {
                let hi = (pair[0] as char).to_digit(16)?;
                let lo = (pair[1] as char).to_digit(16)?;
                Some((hi * 16 + lo) as u8)
            })
            .collect()
    }

    /// Escape special characters in a PDF literal string.
    pub fn escape_pdf_string(s: &str) -> String {
        let mut result = String::with_capacity(s.len() + 10);
        for c in s.chars() {
            match c {
                '\\' => result.push_str("\\\\"),
                '(' => result.push_str("\\("),
                ')' => result.push_str("\\)"),
                '\n' => result.push_str("\\n"),
                '\r' => result.push_str("\\r"),
                '\t' => result.push_str("\\t"),
                _ => result.push(c),
            }
        }
        result
    }

    /// Format a timestamp as a PDF date string (`D:YYYYMMDDHHmmSS+00'00'`).
    pub fn format_pdf_date(at: DateTime<Utc>) -> String {
        format!("D:{}+00'00'", at.format("%Y%m%d%H%M%S"))
    }

}


// Version info
/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
