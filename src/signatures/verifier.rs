//! PDF signature verification.
//!
//! Two layers:
//! - a structural scan: a document counts as signed when a `/ByteRange`
//!   coexists with a `/SubFilter` entry or a PKCS#7 signedData OID marker,
//!   and the number of distinct ByteRanges approximates the signature count;
//!   markers inside strings and stream data do not count
//! - cryptographic checks per ByteRange: decode the CMS, recompute the
//!   byte-range digest, compare it with the messageDigest attribute and
//!   verify the RSA signature over the signed attributes with the embedded
//!   signer certificate
//!
//! [`SignatureVerifier::verify_with_record`] additionally cross-references
//! the latest persisted [`SignatureRecord`]; without a matching record a
//! signed document is reported as [`VerificationStatus::SignedUnverifiable`].

use chrono::{DateTime, Utc};
use der::{Decode, Encode};
use log::{debug, warn};
use lopdf::{Document, Object};
use pkcs8::DecodePublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::RsaPublicKey;
use signature::Verifier;
use x509_cert::Certificate;

use super::byterange::{contents_in_gap, ByteRange};
use super::cms::{ParsedCms, OID_RSA_ENCRYPTION};
use super::digest::digest_byte_range;
use super::scanner::scan_markers;
use super::types::{CertificateSummary, DigestAlgorithm, SignatureProvenance, SignatureSubFilter};
use crate::error::{Error, Result};
use crate::pipeline::{RecordStatus, SignatureRecord};
use crate::utils::to_hex_lower;

/// DER of the signedData OID (1.2.840.113549.1.7.2), raw and as hex.
const PKCS7_OID_DER: &[u8] = &[0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];
const PKCS7_OID_HEX: &[u8] = b"06092A864886F70D010702";

/// sha{1,256,384,512}WithRSAEncryption
const RSA_WITH_DIGEST_OIDS: [(&str, DigestAlgorithm); 4] = [
    ("1.2.840.113549.1.1.5", DigestAlgorithm::Sha1),
    ("1.2.840.113549.1.1.11", DigestAlgorithm::Sha256),
    ("1.2.840.113549.1.1.12", DigestAlgorithm::Sha384),
    ("1.2.840.113549.1.1.13", DigestAlgorithm::Sha512),
];

fn rsa_with_digest(oid: &str) -> Option<DigestAlgorithm> {
    RSA_WITH_DIGEST_OIDS
        .iter()
        .find(|(known, _)| *known == oid)
        .map(|(_, algorithm)| *algorithm)
}

/// Result of the structural marker scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StructuralScan {
    /// At least one `/ByteRange [..]` array
    pub has_byte_range: bool,
    /// A `/SubFilter /..` entry
    pub has_sub_filter: bool,
    /// The signedData OID, raw or hex-encoded
    pub has_pkcs7_marker: bool,
    /// Distinct ByteRange arrays
    pub byte_range_count: usize,
}

impl StructuralScan {
    /// ByteRange plus SubFilter or PKCS#7 marker.
    pub fn is_signed(&self) -> bool {
        self.has_byte_range && (self.has_sub_filter || self.has_pkcs7_marker)
    }
}

/// Scan `data` for signature markers.
pub fn scan(data: &[u8]) -> StructuralScan {
    let markers = scan_markers(data);
    let mut distinct: Vec<ByteRange> = Vec::new();
    for range in markers.byte_ranges {
        if !distinct.contains(&range) {
            distinct.push(range);
        }
    }

    let has_pkcs7_marker = contains(data, PKCS7_OID_DER)
        || data
            .windows(PKCS7_OID_HEX.len())
            .any(|w| w.eq_ignore_ascii_case(PKCS7_OID_HEX));

    StructuralScan {
        has_byte_range: !distinct.is_empty(),
        has_sub_filter: markers.has_sub_filter,
        has_pkcs7_marker,
        byte_range_count: distinct.len(),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    /// No signature markers
    Unsigned,
    /// Cryptographically valid (and matching the record when one was checked)
    Verified,
    /// Signed, but validity cannot be established (mock signer, missing
    /// certificate, untrusted chain or no matching record)
    SignedUnverifiable,
    /// Broken signature
    Invalid,
}

/// Entries of the signature dictionary that owns a ByteRange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureInfo {
    /// `/Name`
    pub signer_name: Option<String>,
    /// `/Reason`
    pub reason: Option<String>,
    /// `/Location`
    pub location: Option<String>,
    /// `/ContactInfo`
    pub contact_info: Option<String>,
    /// `/M`, as written
    pub signing_time: Option<String>,
    /// `/SubFilter`
    pub sub_filter: Option<SignatureSubFilter>,
}

/// Checks of one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    /// ByteRange of this signature
    pub byte_range: ByteRange,
    /// Whether the ByteRange is valid and ends at the end of the file
    pub covers_whole_document: bool,
    /// Dictionary entries, when the dictionary could be located
    pub info: SignatureInfo,
    /// SignerInfo digest algorithm
    pub digest_algorithm: Option<DigestAlgorithm>,
    /// Recomputed byte-range digest (lowercase hex)
    pub digest_hex: Option<String>,
    /// Subject of the signer certificate
    pub signer_subject: Option<String>,
    /// Embedded certificates, signer first
    pub certificate_chain: Vec<CertificateSummary>,
    /// signingTime attribute
    pub signing_time: Option<DateTime<Utc>>,
    /// Whether an RFC 3161 token is attached
    pub timestamped: bool,
    /// Produced by the development mock signer
    pub mock: bool,
    /// Outcome
    pub status: VerificationStatus,
    /// Human-readable findings
    pub messages: Vec<String>,
}

impl SignatureCheck {
    fn new(byte_range: ByteRange, file_len: usize) -> Self {
        Self {
            byte_range,
            covers_whole_document: byte_range.validate_covers(file_len).is_ok(),
            info: SignatureInfo::default(),
            digest_algorithm: None,
            digest_hex: None,
            signer_subject: None,
            certificate_chain: Vec::new(),
            signing_time: None,
            timestamped: false,
            mock: false,
            status: VerificationStatus::Invalid,
            messages: Vec::new(),
        }
    }
}

/// What the persisted record says about the latest signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    /// Record id
    pub record_id: uuid::Uuid,
    /// Who signed
    pub signer_identity: String,
    /// Algorithm recorded at signing time
    pub digest_algorithm: DigestAlgorithm,
    /// Which backend produced the signature
    pub provenance: Option<SignatureProvenance>,
    /// Chain recorded at signing time
    pub certificate_chain: Vec<CertificateSummary>,
    /// When the record was written
    pub signed_at: DateTime<Utc>,
    /// Whether the recorded digest equals the latest signature's digest
    pub matches_document: bool,
}

/// Document-level verification report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Structural markers present
    pub is_signed: bool,
    /// Every signature verified
    pub is_valid: bool,
    /// Distinct ByteRanges
    pub signature_count: usize,
    /// Overall outcome
    pub status: VerificationStatus,
    /// Per-signature checks in file order
    pub signatures: Vec<SignatureCheck>,
    /// Record cross-reference, when a record was supplied
    pub record: Option<RecordSummary>,
    /// Document-level findings
    pub messages: Vec<String>,
}

impl VerificationReport {
    fn unsigned() -> Self {
        Self {
            is_signed: false,
            is_valid: false,
            signature_count: 0,
            status: VerificationStatus::Unsigned,
            signatures: Vec::new(),
            record: None,
            messages: Vec::new(),
        }
    }

    /// The most recent signature.
    pub fn latest(&self) -> Option<&SignatureCheck> {
        self.signatures.last()
    }
}

/// Verifier for PDF digital signatures.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    /// Trusted root certificates (DER-encoded)
    trusted_roots: Vec<Vec<u8>>,
}

impl SignatureVerifier {
    /// Create a verifier that does not evaluate trust.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trusted root certificate.
    ///
    /// Once any root is configured, a signature whose signer certificate
    /// does not chain to one of them is reported as unverifiable.
    pub fn add_trusted_root(&mut self, cert_der: Vec<u8>) {
        self.trusted_roots.push(cert_der);
    }

    /// Builder form of [`add_trusted_root`](Self::add_trusted_root).
    pub fn with_trusted_root(mut self, cert_der: Vec<u8>) -> Self {
        self.trusted_roots.push(cert_der);
        self
    }

    /// Structural scan plus cryptographic checks of every signature.
    pub fn verify_document(&self, data: &[u8]) -> Result<VerificationReport> {
        let markers = scan(data);
        if !markers.is_signed() {
            debug!("No signature markers found");
            return Ok(VerificationReport::unsigned());
        }

        let infos = signature_dictionaries(data);
        let mut signatures = Vec::new();
        let mut seen: Vec<ByteRange> = Vec::new();
        for byte_range in scan_markers(data).byte_ranges {
            if seen.contains(&byte_range) {
                continue;
            }
            seen.push(byte_range);
            let mut check = self.check_signature(data, byte_range);
            if let Some((_, info)) = infos.iter().find(|(br, _)| *br == byte_range) {
                check.info = info.clone();
            }
            signatures.push(check);
        }

        let mut messages = Vec::new();
        if let Some(latest) = signatures.last() {
            if !latest.covers_whole_document {
                messages.push("document was modified after the last signature".to_string());
            }
        }

        let all_verified = !signatures.is_empty()
            && signatures.iter().all(|s| s.status == VerificationStatus::Verified);
        let latest_covers = signatures.last().map_or(false, |s| s.covers_whole_document);
        let status = if signatures.iter().any(|s| s.status == VerificationStatus::Invalid) {
            VerificationStatus::Invalid
        } else if all_verified && latest_covers {
            VerificationStatus::Verified
        } else {
            VerificationStatus::SignedUnverifiable
        };

        Ok(VerificationReport {
            is_signed: true,
            is_valid: status == VerificationStatus::Verified,
            signature_count: markers.byte_range_count,
            status,
            signatures,
            record: None,
            messages,
        })
    }

    /// Verify and cross-reference the latest persisted record.
    ///
    /// A signed document without a successful record whose digest matches
    /// the latest signature is reported as signed-but-unverifiable.
    pub fn verify_with_record(
        &self,
        data: &[u8],
        record: Option<&SignatureRecord>,
    ) -> Result<VerificationReport> {
        let mut report = self.verify_document(data)?;
        if !report.is_signed {
            return Ok(report);
        }

        let Some(record) = record.filter(|r| r.status == RecordStatus::Success) else {
            report.messages.push("no signature record for this document".to_string());
            if report.status == VerificationStatus::Verified {
                report.status = VerificationStatus::SignedUnverifiable;
                report.is_valid = false;
            }
            return Ok(report);
        };

        let latest_digest = report.latest().and_then(|s| {
            // Recompute with the recorded algorithm in case the CMS was unreadable
            digest_byte_range(data, &s.byte_range, record.digest_algorithm)
                .ok()
                .map(|d| d.hex())
        });
        let matches_document = latest_digest.as_deref() == Some(record.digest_hex.as_str());

        let certificate_chain = record
            .certificate_ders()
            .unwrap_or_default()
            .iter()
            .filter_map(|der| CertificateSummary::from_der(der).ok())
            .collect();

        if !matches_document {
            warn!(
                "Record {} does not match the latest signature of document {}",
                record.id, record.document_id
            );
            report
                .messages
                .push("latest signature does not match the persisted record".to_string());
            if report.status == VerificationStatus::Verified {
                report.status = VerificationStatus::SignedUnverifiable;
                report.is_valid = false;
            }
        }

        report.record = Some(RecordSummary {
            record_id: record.id,
            signer_identity: record.signer_identity.clone(),
            digest_algorithm: record.digest_algorithm,
            provenance: record.provenance,
            certificate_chain,
            signed_at: record.timestamp,
            matches_document,
        });
        Ok(report)
    }

    /// Verify the signature occupying `byte_range`, failing on the first
    /// problem instead of reporting it.
    pub fn verify_signature(&self, data: &[u8], byte_range: ByteRange) -> Result<SignatureCheck> {
        let mut check = SignatureCheck::new(byte_range, data.len());
        self.verify_into(data, &mut check)?;
        Ok(check)
    }

    fn check_signature(&self, data: &[u8], byte_range: ByteRange) -> SignatureCheck {
        let mut check = SignatureCheck::new(byte_range, data.len());
        if let Err(e) = self.verify_into(data, &mut check) {
            debug!("Signature at {:?} failed: {}", byte_range.to_array(), e);
            check.status = VerificationStatus::Invalid;
            check.messages.push(e.to_string());
        }
        check
    }

    fn verify_into(&self, data: &[u8], check: &mut SignatureCheck) -> Result<()> {
        let byte_range = check.byte_range;
        let contents = contents_in_gap(data, &byte_range)?;
        if contents.iter().all(|&b| b == 0) {
            return Err(Error::VerificationFailed("signature placeholder is empty".into()));
        }

        let cms = ParsedCms::from_der_padded(&contents)?;
        let algorithm = cms.digest_algorithm()?;
        let digest = digest_byte_range(data, &byte_range, algorithm)?;
        check.digest_algorithm = Some(algorithm);
        check.digest_hex = Some(digest.hex());
        check.signing_time = cms.signing_time()?;
        check.timestamped = cms.has_timestamp();

        let expected = match cms.encapsulated_content()? {
            None => digest.bytes.clone(),
            Some(content) => {
                if content != digest.bytes {
                    return Err(Error::DigestMismatch {
                        expected: to_hex_lower(&content),
                        computed: digest.hex(),
                    });
                }
                algorithm.digest(&content)
            },
        };
        let attested = cms.message_digest()?;
        if attested != expected {
            return Err(Error::DigestMismatch {
                expected: to_hex_lower(&attested),
                computed: to_hex_lower(&expected),
            });
        }

        let signer_cert = cms.signer_certificate()?;
        check.certificate_chain = chain_summary(&cms, signer_cert.as_deref());

        if cms.is_mock() {
            check.mock = true;
            check.status = VerificationStatus::SignedUnverifiable;
            check.messages.push("signed by the development mock signer".to_string());
            return Ok(());
        }

        let Some(signer_cert) = signer_cert else {
            check.status = VerificationStatus::SignedUnverifiable;
            check.messages.push("signer certificate is not embedded".to_string());
            return Ok(());
        };

        let summary = CertificateSummary::from_der(&signer_cert)?;
        check.signer_subject = Some(summary.subject.clone());

        let algorithm_oid = cms.signature_algorithm()?;
        let is_rsa = algorithm_oid == OID_RSA_ENCRYPTION
            || rsa_with_digest(&algorithm_oid.to_string()).is_some();
        if !is_rsa {
            return Err(Error::Unsupported(format!("signature algorithm {}", algorithm_oid)));
        }
        verify_rsa(
            &signer_cert,
            algorithm,
            &cms.signed_attributes_der()?,
            cms.signature()?,
        )?;

        check.status = VerificationStatus::Verified;

        if let Some(at) = check.signing_time {
            if !summary.is_valid_at(at) {
                check
                    .messages
                    .push("signer certificate was not valid at signing time".to_string());
            }
        }

        if !self.trusted_roots.is_empty()
            && !self.chains_to_trusted_root(&signer_cert, &cms.certificates())
        {
            check.status = VerificationStatus::SignedUnverifiable;
            check.messages.push("certificate chain is not trusted".to_string());
        }
        Ok(())
    }

    /// Walk issuer links from the signer certificate through the embedded
    /// certificates until a configured root signs one of them.
    fn chains_to_trusted_root(&self, signer_der: &[u8], embedded: &[Vec<u8>]) -> bool {
        if self.trusted_roots.iter().any(|root| root.as_slice() == signer_der) {
            return true;
        }
        let Ok(mut current) = Certificate::from_der(signer_der) else {
            return false;
        };
        let roots: Vec<Certificate> = self
            .trusted_roots
            .iter()
            .filter_map(|der| Certificate::from_der(der).ok())
            .collect();
        let intermediates: Vec<Certificate> = embedded
            .iter()
            .filter_map(|der| Certificate::from_der(der).ok())
            .collect();

        // A chain never needs more links than there are embedded certificates
        for _ in 0..=intermediates.len() {
            if roots.iter().any(|root| is_issued_by(&current, root)) {
                return true;
            }
            match intermediates
                .iter()
                .find(|candidate| **candidate != current && is_issued_by(&current, candidate))
            {
                Some(issuer) => current = issuer.clone(),
                None => break,
            }
        }
        debug!(
            "Signer {} does not chain to a trusted root",
            current.tbs_certificate.subject
        );
        false
    }
}

/// Whether `issuer` names and signs `cert`.
fn is_issued_by(cert: &Certificate, issuer: &Certificate) -> bool {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return false;
    }
    let Some(algorithm) = rsa_with_digest(&cert.signature_algorithm.oid.to_string()) else {
        return false;
    };
    let (Ok(tbs), Some(signature)) = (cert.tbs_certificate.to_der(), cert.signature.as_bytes())
    else {
        return false;
    };
    rsa_public_key(issuer)
        .and_then(|key| verify_rsa_with_key(key, algorithm, &tbs, signature))
        .is_ok()
}

/// Embedded certificates summarized, signer first.
fn chain_summary(cms: &ParsedCms, signer: Option<&[u8]>) -> Vec<CertificateSummary> {
    let mut ders = cms.certificates();
    if let Some(signer) = signer {
        if let Some(pos) = ders.iter().position(|der| der.as_slice() == signer) {
            let leaf = ders.remove(pos);
            ders.insert(0, leaf);
        }
    }
    ders.iter()
        .filter_map(|der| CertificateSummary::from_der(der).ok())
        .collect()
}

/// RSA PKCS#1 v1.5 check of `signature` over `message`.
fn verify_rsa(
    cert_der: &[u8],
    algorithm: DigestAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| Error::VerificationFailed(format!("invalid signer certificate: {}", e)))?;
    verify_rsa_with_key(rsa_public_key(&cert)?, algorithm, message, signature)
}

fn rsa_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::VerificationFailed(format!("invalid public key: {}", e)))?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| Error::VerificationFailed(format!("certificate key is not RSA: {}", e)))
}

fn verify_rsa_with_key(
    key: RsaPublicKey,
    algorithm: DigestAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let signature = Signature::try_from(signature)
        .map_err(|e| Error::VerificationFailed(format!("malformed RSA signature: {}", e)))?;

    let result = match algorithm {
        DigestAlgorithm::Sha1 => VerifyingKey::<sha1::Sha1>::new(key).verify(message, &signature),
        DigestAlgorithm::Sha256 => {
            VerifyingKey::<sha2::Sha256>::new(key).verify(message, &signature)
        },
        DigestAlgorithm::Sha384 => {
            VerifyingKey::<sha2::Sha384>::new(key).verify(message, &signature)
        },
        DigestAlgorithm::Sha512 => {
            VerifyingKey::<sha2::Sha512>::new(key).verify(message, &signature)
        },
    };
    result.map_err(|_| Error::VerificationFailed("RSA signature does not verify".into()))
}

/// Signature dictionaries keyed by their ByteRange.
///
/// Documents lopdf cannot load yield no entries; the byte-level checks do not
/// depend on them.
fn signature_dictionaries(data: &[u8]) -> Vec<(ByteRange, SignatureInfo)> {
    let Ok(doc) = Document::load_mem(data) else {
        return Vec::new();
    };
    doc.objects
        .values()
        .filter_map(|obj| obj.as_dict().ok())
        .filter(|dict| dict.has(b"ByteRange") && dict.has(b"Contents"))
        .filter_map(|dict| {
            let values = dict
                .get(b"ByteRange")
                .ok()?
                .as_array()
                .ok()?
                .iter()
                .map(|v| v.as_i64().ok().and_then(|v| usize::try_from(v).ok()))
                .collect::<Option<Vec<usize>>>()?;
            let [s1, l1, s2, l2] = values[..] else {
                return None;
            };
            let text = |key: &[u8]| match dict.get(key) {
                Ok(Object::String(bytes, _)) => Some(decode_text_string(bytes)),
                _ => None,
            };
            let sub_filter = dict
                .get(b"SubFilter")
                .ok()
                .and_then(|o| o.as_name().ok())
                .and_then(|n| std::str::from_utf8(n).ok())
                .and_then(SignatureSubFilter::from_pdf_name);
            Some((
                ByteRange::new(s1, l1, s2, l2),
                SignatureInfo {
                    signer_name: text(b"Name"),
                    reason: text(b"Reason"),
                    location: text(b"Location"),
                    contact_info: text(b"ContactInfo"),
                    signing_time: text(b"M"),
                    sub_filter,
                },
            ))
        })
        .collect()
}

/// UTF-16BE with BOM, otherwise Latin-1.
fn decode_text_string(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}
