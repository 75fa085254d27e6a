//! PDF Digital Signatures module.
//!
//! Everything that touches PDF bytes or CMS structures:
//!
//! - **Placeholder preparation**: incremental update with a signature field
//!   and a fixed-size `/Contents` reservation
//! - **ByteRange handling**: locating, validating and hashing the signed ranges
//! - **CMS building**: detached SignedData with PAdES signed attributes and an
//!   optional RFC 3161 timestamp
//! - **Embedding**: writing the DER signature into the reservation without
//!   moving a single byte
//! - **Verification**: structural markers plus cryptographic checks
//!
//! ## Example
//!
//! ```ignore
//! use pdf_signflow::signatures::{
//!     compute_digest, DigestAlgorithm, DigestPolicy, PlaceholderOptions, PlaceholderPreparer,
//!     SignatureEmbedder, SignerMetadata,
//! };
//!
//! let options = PlaceholderOptions::new(SignerMetadata::new("Alice"));
//! let prepared = PlaceholderPreparer::new(options).prepare(&pdf)?;
//! let digest = compute_digest(prepared.bytes(), DigestPolicy::ExplicitByteRange, DigestAlgorithm::Sha256)?;
//! let cms_der = my_signer(&digest.bytes)?;
//! let signed = SignatureEmbedder::new().embed(&prepared, &cms_der)?;
//! ```
//!
//! ## PDF Specification Reference
//!
//! - ISO 32000-1:2008 Section 12.8 - Digital Signatures
//! - ISO 32000-2:2020 Section 12.8 - Digital Signatures
//! - ETSI TS 102 778 - PAdES
//! - RFC 5652 - Cryptographic Message Syntax
//! - RFC 3161 - Time-Stamp Protocol

pub mod byterange;
pub mod cms;
pub mod digest;
mod embedder;
mod placeholder;
mod scanner;
mod serializer;
pub mod timestamp;
mod types;
mod verifier;

pub use byterange::{ByteRange, ByteRangeCalculator, SignatureSlot};
pub use cms::{CmsBuilder, CmsIdentity, CmsProfile, ParsedCms, RawSigner, RsaSigner, SignedCms};
pub use digest::{compute_digest, cross_check, digest_byte_range, DigestPolicy, DocumentDigest};
pub use embedder::SignatureEmbedder;
pub use placeholder::{PlaceholderOptions, PlaceholderPreparer, PreparedDocument};
pub use serializer::ObjectSerializer;
pub use timestamp::TsaClient;
pub use types::{
    CertificateSummary, DigestAlgorithm, DocumentId, KeyReference, Rect, SignatureProvenance,
    SignatureSubFilter, SignerMetadata, SigningRequest, WidgetAppearance,
};
pub use verifier::{
    scan, RecordSummary, SignatureCheck, SignatureInfo, SignatureVerifier, StructuralScan,
    VerificationReport, VerificationStatus,
};
