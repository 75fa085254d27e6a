//! Local PKCS#12 signing backend.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use der::{Decode, Encode};
use log::{debug, info};
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use x509_cert::Certificate;

use super::{decode_digest, SignContext, SignedDigest, SigningBackend};
use crate::error::{Error, Result};
use crate::signatures::{
    CertificateSummary, CmsBuilder, CmsIdentity, CmsProfile, RsaSigner, SignatureProvenance,
};

/// Private key, signer certificate and chain loaded from a PKCS#12 file.
#[derive(Clone)]
pub struct SigningCredentials {
    key: RsaPrivateKey,
    certificate: Vec<u8>,
    chain: Vec<Vec<u8>>,
}

impl SigningCredentials {
    /// Load credentials from a PKCS#12 file.
    pub fn from_pkcs12_file(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::from_pkcs12(&data, password)
    }

    /// Load credentials from PKCS#12 bytes.
    ///
    /// The signer certificate is the one whose public key matches the private
    /// key; the remaining certificates are ordered by issuer from it upwards.
    pub fn from_pkcs12(data: &[u8], password: &str) -> Result<Self> {
        let pfx = p12::PFX::parse(data)
            .map_err(|e| Error::Config(format!("invalid PKCS#12 container: {:?}", e)))?;
        if !pfx.verify_mac(password) {
            return Err(Error::Config("PKCS#12 password is incorrect".into()));
        }

        let key_der = pfx
            .key_bags(password)
            .map_err(|e| Error::Config(format!("cannot decrypt PKCS#12 key: {:?}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("PKCS#12 container holds no private key".into()))?;
        let key = RsaPrivateKey::from_pkcs8_der(&key_der)
            .map_err(|e| Error::Unsupported(format!("only RSA keys are supported: {}", e)))?;

        let certificates = pfx
            .cert_x509_bags(password)
            .map_err(|e| Error::Config(format!("cannot decrypt PKCS#12 certificates: {:?}", e)))?;
        let public_key = key.to_public_key();

        let mut parsed = Vec::with_capacity(certificates.len());
        for der in certificates {
            let cert = Certificate::from_der(&der)
                .map_err(|e| Error::Config(format!("invalid certificate in PKCS#12: {}", e)))?;
            parsed.push((der, cert));
        }

        let leaf_index = parsed
            .iter()
            .position(|(_, cert)| certificate_key(cert).as_ref() == Some(&public_key))
            .ok_or_else(|| {
                Error::Config("no certificate in PKCS#12 matches the private key".into())
            })?;
        let (certificate, leaf) = parsed.remove(leaf_index);

        // Walk issuer links; certificates that do not chain are appended as-is
        let mut chain = Vec::with_capacity(parsed.len());
        let mut current = leaf;
        while let Some(pos) = parsed.iter().position(|(_, cert)| {
            cert.tbs_certificate.subject == current.tbs_certificate.issuer
                && current.tbs_certificate.subject != current.tbs_certificate.issuer
        }) {
            let (der, cert) = parsed.remove(pos);
            chain.push(der);
            current = cert;
        }
        chain.extend(parsed.into_iter().map(|(der, _)| der));

        debug!("Loaded PKCS#12 credentials with {} chain certificates", chain.len());
        Ok(Self {
            key,
            certificate,
            chain,
        })
    }

    /// DER signer certificate.
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// DER chain certificates above the signer, nearest issuer first.
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// Signer certificate followed by the chain.
    pub fn full_chain(&self) -> Vec<Vec<u8>> {
        let mut all = Vec::with_capacity(self.chain.len() + 1);
        all.push(self.certificate.clone());
        all.extend(self.chain.iter().cloned());
        all
    }

    /// Summary of the signer certificate.
    pub fn summary(&self) -> Result<CertificateSummary> {
        CertificateSummary::from_der(&self.certificate)
    }

    pub(crate) fn rsa_signer(&self) -> RsaSigner {
        RsaSigner::new(self.key.clone())
    }
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("key", &"[REDACTED]")
            .field("certificate_len", &self.certificate.len())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

fn certificate_key(cert: &Certificate) -> Option<RsaPublicKey> {
    let spki = cert.tbs_certificate.subject_public_key_info.to_der().ok()?;
    RsaPublicKey::from_public_key_der(&spki).ok()
}

/// Signs with a local PKCS#12 key, building the CMS in-process.
#[derive(Debug, Clone)]
pub struct LocalP12Backend {
    credentials: SigningCredentials,
    profile: CmsProfile,
    signing_time: Option<DateTime<Utc>>,
}

impl LocalP12Backend {
    /// Open a PKCS#12 file.
    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let path = path.as_ref();
        let credentials = SigningCredentials::from_pkcs12_file(path, password)?;
        info!("Opened local signing key {}", path.display());
        Ok(Self::from_credentials(credentials))
    }

    /// Use already-loaded credentials.
    pub fn from_credentials(credentials: SigningCredentials) -> Self {
        Self {
            credentials,
            profile: CmsProfile::Detached,
            signing_time: None,
        }
    }

    /// Select the CMS content profile.
    pub fn with_profile(mut self, profile: CmsProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Pin the signingTime attribute.
    pub fn with_signing_time(mut self, at: DateTime<Utc>) -> Self {
        self.signing_time = Some(at);
        self
    }

    /// Loaded credentials.
    pub fn credentials(&self) -> &SigningCredentials {
        &self.credentials
    }
}

impl SigningBackend for LocalP12Backend {
    fn name(&self) -> &'static str {
        "local-p12"
    }

    fn sign(&self, digest_hex: &str, context: &SignContext<'_>) -> Result<SignedDigest> {
        let digest = decode_digest(digest_hex, context.algorithm)?;

        let mut builder = CmsBuilder::new()
            .with_profile(self.profile)
            .with_digest_algorithm(context.algorithm);
        if let Some(at) = self.signing_time {
            builder = builder.with_signing_time(at);
        }

        let identity = CmsIdentity::from_chain(
            self.credentials.certificate.clone(),
            self.credentials.chain.clone(),
        );
        let cms = builder.build(&digest, &identity, &self.credentials.rsa_signer())?;

        debug!("Local key produced {} byte CMS for {}", cms.len(), context.signer.name);
        Ok(SignedDigest {
            cms_der: cms.into_der(),
            certificate_chain: self.credentials.full_chain(),
            provenance: SignatureProvenance::LocalKey,
            backend: self.name(),
        })
    }
}
