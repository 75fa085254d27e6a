//! Digital signature types and data structures.
//!
//! This module defines the core types shared by the preparer, the CMS
//! builder, the signing backends and the verifier.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use der::asn1::ObjectIdentifier;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

const OID_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const OID_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2");
const OID_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3");

/// Digest algorithm used for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-1 (deprecated, accepted only when verifying legacy PDFs)
    Sha1,
    /// SHA-256 (recommended)
    #[default]
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl DigestAlgorithm {
    /// Get the OID for this digest algorithm.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha1 => OID_SHA1,
            DigestAlgorithm::Sha256 => OID_SHA256,
            DigestAlgorithm::Sha384 => OID_SHA384,
            DigestAlgorithm::Sha512 => OID_SHA512,
        }
    }

    /// Look up an algorithm by OID.
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ]
        .into_iter()
        .find(|alg| alg.oid() == *oid)
    }

    /// Get the name of this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Hash the concatenation of `parts` without copying them together.
    pub fn digest_parts(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                parts.iter().for_each(|p| hasher.update(p));
                hasher.finalize().to_vec()
            },
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                parts.iter().for_each(|p| hasher.update(p));
                hasher.finalize().to_vec()
            },
            DigestAlgorithm::Sha384 => {
                let mut hasher = Sha384::new();
                parts.iter().for_each(|p| hasher.update(p));
                hasher.finalize().to_vec()
            },
            DigestAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                parts.iter().for_each(|p| hasher.update(p));
                hasher.finalize().to_vec()
            },
        }
    }

    /// Hash a single buffer.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        self.digest_parts(&[data])
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signature sub-filter type (signature format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignatureSubFilter {
    /// adbe.pkcs7.detached - PKCS#7 detached signature
    #[default]
    Pkcs7Detached,
    /// ETSI.CAdES.detached - PAdES CAdES signature
    CadesDetached,
}

impl SignatureSubFilter {
    /// Get the PDF name for this sub-filter.
    pub fn as_pdf_name(&self) -> &'static str {
        match self {
            SignatureSubFilter::Pkcs7Detached => "adbe.pkcs7.detached",
            SignatureSubFilter::CadesDetached => "ETSI.CAdES.detached",
        }
    }

    /// Parse a PDF name into a sub-filter type.
    pub fn from_pdf_name(name: &str) -> Option<Self> {
        match name {
            "adbe.pkcs7.detached" => Some(SignatureSubFilter::Pkcs7Detached),
            "ETSI.CAdES.detached" => Some(SignatureSubFilter::CadesDetached),
            _ => None,
        }
    }
}

/// Who is signing, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerMetadata {
    /// Name of the signer
    pub name: String,
    /// Reason for signing
    pub reason: Option<String>,
    /// Location where the document was signed
    pub location: Option<String>,
    /// Contact information
    pub contact_info: Option<String>,
    /// Organization the signer acts for
    pub organization: Option<String>,
}

impl SignerMetadata {
    /// Create metadata for a named signer.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the reason for signing.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the signing location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the contact information.
    pub fn with_contact_info(mut self, contact: impl Into<String>) -> Self {
        self.contact_info = Some(contact.into());
        self
    }

    /// Set the organization.
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

/// Which key material signs the digest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyReference {
    /// PKCS#12 container on the local filesystem
    LocalP12 {
        /// Path to the .p12/.pfx file
        path: PathBuf,
        /// Container password
        password: String,
    },
    /// Key held by the remote HSM; `None` uses the configured key id
    Hsm {
        /// HSM key id
        key_id: Option<String>,
    },
}

impl fmt::Debug for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyReference::LocalP12 { path, .. } => f
                .debug_struct("LocalP12")
                .field("path", path)
                .field("password", &"[REDACTED]")
                .finish(),
            KeyReference::Hsm { key_id } => f.debug_struct("Hsm").field("key_id", key_id).finish(),
        }
    }
}

/// Rectangle in PDF user space (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge
    pub x: f32,
    /// Bottom edge
    pub y: f32,
    /// Width
    pub width: f32,
    /// Height
    pub height: f32,
}

impl Rect {
    /// Create a rectangle from origin and size.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Corners as `[x1 y1 x2 y2]`.
    pub fn corners(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }
}

/// Visible signature widget configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetAppearance {
    /// Page number (0-indexed)
    pub page: usize,
    /// Rectangle for the signature appearance
    pub rect: Rect,
    /// Stamp text; one line per `\n`. Derived from the signer when absent.
    pub stamp_text: Option<String>,
    /// Font size of the stamp text
    pub font_size: f32,
}

impl WidgetAppearance {
    /// Visible widget on `page` at `rect`.
    pub fn new(page: usize, rect: Rect) -> Self {
        Self {
            page,
            rect,
            stamp_text: None,
            font_size: 9.0,
        }
    }

    /// Override the stamp text.
    pub fn with_stamp_text(mut self, text: impl Into<String>) -> Self {
        self.stamp_text = Some(text.into());
        self
    }
}

/// Identifier of a document known to the file store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Wrap a document id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One signing attempt. Not persisted beyond its [`SignatureRecord`](crate::SignatureRecord).
#[derive(Debug, Clone, PartialEq)]
pub struct SigningRequest {
    /// Document to sign
    pub document_id: DocumentId,
    /// Signer details written into the signature dictionary
    pub signer: SignerMetadata,
    /// Key material
    pub key: KeyReference,
    /// RFC 3161 timestamp authority endpoint
    pub tsa_url: Option<String>,
    /// Placeholder size override in bytes
    pub reserved_bytes: Option<usize>,
    /// Visible widget; invisible when absent
    pub appearance: Option<WidgetAppearance>,
    /// Digest algorithm
    pub digest_algorithm: DigestAlgorithm,
}

impl SigningRequest {
    /// Create a request with SHA-256 and an invisible widget.
    pub fn new(document_id: DocumentId, signer: SignerMetadata, key: KeyReference) -> Self {
        Self {
            document_id,
            signer,
            key,
            tsa_url: None,
            reserved_bytes: None,
            appearance: None,
            digest_algorithm: DigestAlgorithm::Sha256,
        }
    }

    /// Timestamp the signature at `url`.
    pub fn with_timestamp(mut self, url: impl Into<String>) -> Self {
        self.tsa_url = Some(url.into());
        self
    }

    /// Reserve `bytes` for the signature.
    pub fn with_reserved_bytes(mut self, bytes: usize) -> Self {
        self.reserved_bytes = Some(bytes);
        self
    }

    /// Use a visible widget.
    pub fn with_appearance(mut self, appearance: WidgetAppearance) -> Self {
        self.appearance = Some(appearance);
        self
    }

    /// Select the digest algorithm.
    pub fn with_digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }
}

/// Where a signature came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureProvenance {
    /// Local PKCS#12 key
    LocalKey,
    /// Remote HSM
    Hsm,
    /// Development mock signer; not a legally meaningful signature
    Mock,
}

/// Subject/issuer/validity of one certificate in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSummary {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Serial number as lowercase hex
    pub serial_hex: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

impl CertificateSummary {
    /// Summarize a DER-encoded X.509 certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| Error::VerificationFailed(format!("invalid certificate: {}", e)))?;
        let validity = cert.validity();
        let timestamp = |t: i64| {
            DateTime::<Utc>::from_timestamp(t, 0)
                .ok_or_else(|| Error::VerificationFailed(format!("certificate time {} out of range", t)))
        };

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial_hex: crate::utils::to_hex_lower(cert.raw_serial()),
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
        })
    }

    /// Whether `at` falls inside the validity window.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    /// Whether subject and issuer are the same name.
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_algorithm_names() {
        assert_eq!(DigestAlgorithm::Sha256.name(), "SHA-256");
        assert_eq!(DigestAlgorithm::Sha1.name(), "SHA-1");
        assert_eq!(DigestAlgorithm::default(), DigestAlgorithm::Sha256);
    }

    #[test]
    fn test_digest_algorithm_oid_roundtrip() {
        for alg in [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ] {
            assert_eq!(DigestAlgorithm::from_oid(&alg.oid()), Some(alg));
            assert_eq!(alg.digest(b"abc").len(), alg.output_len());
        }
    }

    #[test]
    fn test_digest_parts_equals_concatenation() {
        let alg = DigestAlgorithm::Sha256;
        assert_eq!(alg.digest_parts(&[b"AAA", b"CCC"]), alg.digest(b"AAACCC"));
    }

    #[test]
    fn test_sha256_known_vector() {
        let digest = DigestAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            crate::utils::to_hex_lower(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sub_filter_names() {
        assert_eq!(SignatureSubFilter::Pkcs7Detached.as_pdf_name(), "adbe.pkcs7.detached");
        assert_eq!(
            SignatureSubFilter::from_pdf_name("ETSI.CAdES.detached"),
            Some(SignatureSubFilter::CadesDetached)
        );
        assert_eq!(SignatureSubFilter::from_pdf_name("adbe.x509.rsa_sha1"), None);
    }

    #[test]
    fn test_key_reference_debug_redacts_password() {
        let key = KeyReference::LocalP12 {
            path: PathBuf::from("cert.p12"),
            password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", key);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_signing_request_builder() {
        let request = SigningRequest::new(
            DocumentId::new("doc-1"),
            SignerMetadata::new("Alice").with_reason("Approval"),
            KeyReference::Hsm { key_id: None },
        )
        .with_reserved_bytes(16000)
        .with_timestamp("http://tsa.example");

        assert_eq!(request.reserved_bytes, Some(16000));
        assert_eq!(request.tsa_url.as_deref(), Some("http://tsa.example"));
        assert_eq!(request.signer.reason.as_deref(), Some("Approval"));
        assert!(request.appearance.is_none());
    }

    #[test]
    fn test_rect_corners() {
        let rect = Rect::new(72.0, 72.0, 200.0, 50.0);
        assert_eq!(rect.corners(), [72.0, 72.0, 272.0, 122.0]);
    }
}
