//! Signing backends.
//!
//! A backend turns a byte-range digest (lowercase hex) into a DER CMS
//! SignedData. Three variants exist:
//!
//! - [`LocalP12Backend`]: private key and chain from a PKCS#12 container
//! - [`RemoteHsmBackend`]: remote signing service behind a bearer token
//! - [`MockSigner`] (feature `mock-signer`): deterministic, non-authoritative
//!   development signer, reachable from the HSM backend only through an
//!   explicit [`MockPolicy`](crate::config::MockPolicy)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::signatures::{DigestAlgorithm, KeyReference, SignatureProvenance, SignerMetadata};
use crate::utils::decode_hex;

mod hsm;
mod local;
#[cfg(feature = "mock-signer")]
mod mock;

pub use hsm::{GenerateKeyRequest, GeneratedKey, HsmClient, HsmKey, RemoteHsmBackend};
pub use local::{LocalP12Backend, SigningCredentials};
#[cfg(feature = "mock-signer")]
pub use mock::MockSigner;

/// Inputs a backend needs besides the digest.
#[derive(Debug, Clone, Copy)]
pub struct SignContext<'a> {
    /// Algorithm that produced the digest
    pub algorithm: DigestAlgorithm,
    /// Signer details
    pub signer: &'a SignerMetadata,
}

impl<'a> SignContext<'a> {
    /// Create a context.
    pub fn new(algorithm: DigestAlgorithm, signer: &'a SignerMetadata) -> Self {
        Self { algorithm, signer }
    }
}

/// A CMS signature produced by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDigest {
    /// DER ContentInfo
    pub cms_der: Vec<u8>,
    /// DER certificates, leaf first (may be empty)
    pub certificate_chain: Vec<Vec<u8>>,
    /// Which kind of backend signed
    pub provenance: SignatureProvenance,
    /// Backend name
    pub backend: &'static str,
}

impl SignedDigest {
    /// Base64 of the DER CMS.
    pub fn cms_base64(&self) -> String {
        BASE64.encode(&self.cms_der)
    }
}

/// Capability to sign a byte-range digest.
pub trait SigningBackend: Send + Sync {
    /// Short name for logs and records.
    fn name(&self) -> &'static str;

    /// Lightweight health check.
    fn is_available(&self) -> bool {
        true
    }

    /// Sign `digest_hex` and return the CMS.
    fn sign(&self, digest_hex: &str, context: &SignContext<'_>) -> Result<SignedDigest>;
}

/// Turns a request's key reference into a backend.
pub trait BackendResolver: Send + Sync {
    /// Resolve `key` to a ready backend.
    fn resolve(&self, key: &KeyReference) -> Result<Box<dyn SigningBackend>>;
}

/// Resolver backed by [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct DefaultBackendResolver {
    config: EngineConfig,
}

impl DefaultBackendResolver {
    /// Create a resolver; the configuration is validated first.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl BackendResolver for DefaultBackendResolver {
    fn resolve(&self, key: &KeyReference) -> Result<Box<dyn SigningBackend>> {
        match key {
            KeyReference::LocalP12 { path, password } => {
                debug!("Resolving local PKCS#12 backend for {}", path.display());
                Ok(Box::new(LocalP12Backend::open(path, password)?))
            },
            KeyReference::Hsm { key_id } => {
                let hsm = self.config.hsm.clone().ok_or_else(|| {
                    Error::Config("HSM key requested but no HSM is configured".into())
                })?;
                Ok(Box::new(RemoteHsmBackend::new(hsm, key_id.clone())?))
            },
        }
    }
}

/// Decode a hex digest and check its length against `algorithm`.
pub(crate) fn decode_digest(digest_hex: &str, algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
    let digest = decode_hex(digest_hex.trim())
        .ok_or_else(|| Error::signing_failed("digest is not valid hex"))?;
    if digest.len() != algorithm.output_len() {
        return Err(Error::signing_failed(format!(
            "{} digest must be {} bytes, got {}",
            algorithm,
            algorithm.output_len(),
            digest.len()
        )));
    }
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_digest() {
        let hex = "00".repeat(32);
        assert_eq!(decode_digest(&hex, DigestAlgorithm::Sha256).unwrap(), vec![0; 32]);
        assert!(decode_digest(&hex, DigestAlgorithm::Sha512).is_err());
        assert!(decode_digest("xyz", DigestAlgorithm::Sha256).is_err());
    }

    #[test]
    fn test_resolver_requires_hsm_config() {
        let resolver = DefaultBackendResolver::new(EngineConfig::new()).unwrap();
        let result = resolver.resolve(&KeyReference::Hsm { key_id: None });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_resolver_missing_p12() {
        let resolver = DefaultBackendResolver::new(EngineConfig::new()).unwrap();
        let result = resolver.resolve(&KeyReference::LocalP12 {
            path: "/nonexistent/signer.p12".into(),
            password: "x".into(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_signed_digest_base64() {
        let signed = SignedDigest {
            cms_der: vec![0xDE, 0xAD, 0xBE, 0xEF],
            certificate_chain: Vec::new(),
            provenance: SignatureProvenance::Mock,
            backend: "test",
        };
        assert_eq!(signed.cms_base64(), "3q2+7w==");
    }
}
