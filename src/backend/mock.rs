//! Deterministic development signer.
//!
//! Produces a structurally valid CMS SignedData whose "signature" is an
//! HMAC-SHA256 over the signed attributes. The signature algorithm OID
//! (hmacWithSHA256) marks it unmistakably; the verifier reports it as signed
//! but never valid. The signing time is fixed, so the same digest always
//! yields the same bytes.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::warn;
use sha2::Sha256;
use spki::AlgorithmIdentifierOwned;

use super::{decode_digest, SignContext, SignedDigest, SigningBackend};
use crate::error::{Error, Result};
use crate::signatures::cms::OID_HMAC_SHA256;
use crate::signatures::{CmsBuilder, CmsIdentity, DigestAlgorithm, RawSigner, SignatureProvenance};

/// 2000-01-01T00:00:00Z
const MOCK_SIGNING_TIME: i64 = 946_684_800;

const DEFAULT_SECRET: &[u8] = b"pdf_signflow development mock signer";

/// Subject key identifier naming the mock signer.
pub const MOCK_KEY_ID: &[u8] = b"pdf_signflow-mock";

struct HmacSigner<'a> {
    secret: &'a [u8],
}

impl RawSigner for HmacSigner<'_> {
    fn signature_algorithm(&self) -> Result<AlgorithmIdentifierOwned> {
        Ok(AlgorithmIdentifierOwned {
            oid: OID_HMAC_SHA256,
            parameters: None,
        })
    }

    fn sign_raw(&self, _digest: DigestAlgorithm, message: &[u8]) -> Result<Vec<u8>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret)
            .map_err(|e| Error::signing_failed(format!("mock key rejected: {}", e)))?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Non-authoritative signer for development.
#[derive(Clone)]
pub struct MockSigner {
    secret: Vec<u8>,
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET)
    }
}

impl MockSigner {
    /// Mock signer keyed with `secret`.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// The fixed signing time written into every mock signature.
    pub fn signing_time() -> DateTime<Utc> {
        DateTime::from_timestamp(MOCK_SIGNING_TIME, 0).unwrap_or_default()
    }
}

impl fmt::Debug for MockSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSigner").finish_non_exhaustive()
    }
}

impl SigningBackend for MockSigner {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn sign(&self, digest_hex: &str, context: &SignContext<'_>) -> Result<SignedDigest> {
        let digest = decode_digest(digest_hex, context.algorithm)?;
        warn!("MOCK signature produced for {}; not legally meaningful", context.signer.name);

        let cms = CmsBuilder::new()
            .with_digest_algorithm(context.algorithm)
            .with_signing_time(Self::signing_time())
            .without_signing_certificate()
            .build(
                &digest,
                &CmsIdentity::key_identifier(MOCK_KEY_ID),
                &HmacSigner {
                    secret: &self.secret,
                },
            )?;

        Ok(SignedDigest {
            cms_der: cms.into_der(),
            certificate_chain: Vec::new(),
            provenance: SignatureProvenance::Mock,
            backend: self.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::{ParsedCms, SignerMetadata};

    fn sign(signer: &MockSigner, digest: &[u8]) -> SignedDigest {
        let meta = SignerMetadata::new("Dev");
        signer
            .sign(
                &crate::utils::to_hex_lower(digest),
                &SignContext::new(DigestAlgorithm::Sha256, &meta),
            )
            .unwrap()
    }

    #[test]
    fn test_mock_is_deterministic() {
        let signer = MockSigner::default();
        let digest = DigestAlgorithm::Sha256.digest(b"doc");
        assert_eq!(sign(&signer, &digest).cms_der, sign(&signer, &digest).cms_der);

        let other = DigestAlgorithm::Sha256.digest(b"other doc");
        assert_ne!(sign(&signer, &digest).cms_der, sign(&signer, &other).cms_der);
    }

    #[test]
    fn test_mock_is_marked() {
        let digest = DigestAlgorithm::Sha256.digest(b"doc");
        let signed = sign(&MockSigner::default(), &digest);
        assert_eq!(signed.provenance, SignatureProvenance::Mock);
        assert_eq!(signed.backend, "mock");

        let parsed = ParsedCms::from_der_padded(&signed.cms_der).unwrap();
        assert!(parsed.is_mock());
        assert_eq!(parsed.message_digest().unwrap(), digest);
        assert_eq!(parsed.signing_time().unwrap(), Some(MockSigner::signing_time()));
    }

    #[test]
    fn test_mock_rejects_bad_digest() {
        let meta = SignerMetadata::new("Dev");
        let result = MockSigner::default()
            .sign("abcd", &SignContext::new(DigestAlgorithm::Sha256, &meta));
        assert!(result.is_err());
    }
}
