//! Remote HSM signing backend.
//!
//! Every call carries a short-lived HS256 bearer token minted from the
//! configured shared secret. Endpoints:
//!
//! - `GET  /hsm/status`        health probe (short timeout)
//! - `POST /hsm/sign/cms`      `{keyId, data, certificateChain, signerInfo}`
//! - `POST /hsm/keys/generate` key generation
//! - `GET  /hsm/keys`          key listing
//!
//! Mock fallback follows [`MockPolicy`]: `Always` never contacts the HSM,
//! `OnUnavailable` falls back when the probe fails or the transport breaks,
//! `Disabled` reports [`Error::SigningBackendUnavailable`].

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{decode_digest, SignContext, SignedDigest, SigningBackend};
use crate::config::{HsmConfig, MockPolicy};
use crate::error::{Error, Result};
use crate::signatures::{ParsedCms, SignatureProvenance, SignerMetadata};

#[cfg(feature = "mock-signer")]
use super::MockSigner;

/// Key generation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeyRequest {
    /// Key algorithm, e.g. `RSA-2048`
    pub algorithm: String,
    /// Optional human-readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl GenerateKeyRequest {
    /// RSA-2048 key with a label.
    pub fn rsa_2048(label: impl Into<String>) -> Self {
        Self {
            algorithm: "RSA-2048".to_string(),
            label: Some(label.into()),
        }
    }
}

/// Result of key generation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedKey {
    /// New key id
    pub key_id: String,
    /// Public key as returned by the HSM (PEM or base64 DER)
    pub public_key: String,
}

/// A key known to the HSM.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HsmKey {
    /// Key id
    pub key_id: String,
    /// Key algorithm
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Label
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    key_id: &'a str,
    data: &'a str,
    certificate_chain: Vec<String>,
    signer_info: SignerInfoPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignerInfoPayload<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact_info: Option<&'a str>,
    algorithm: &'a str,
}

/// Accepts both `{success, data: {signature}}` and `{success, signature}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<SignData>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    certificate_chain: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignData {
    signature: String,
    #[serde(default)]
    certificate_chain: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    success: bool,
}

/// Either a `{success, data, error}` envelope or the bare payload.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped {
        success: bool,
        data: Option<T>,
        error: Option<String>,
    },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_result(self, what: &str) -> Result<T> {
        match self {
            Envelope::Bare(value) => Ok(value),
            Envelope::Wrapped {
                success: true,
                data: Some(value),
                ..
            } => Ok(value),
            Envelope::Wrapped { error, .. } => Err(Error::signing_failed(format!(
                "HSM {} failed: {}",
                what,
                error.unwrap_or_else(|| "no detail".to_string())
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyList {
    keys: Vec<HsmKey>,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    sub: &'a str,
    scope: &'a str,
    iat: u64,
    exp: u64,
}

/// Blocking HTTP client for the HSM service.
#[derive(Debug, Clone)]
pub struct HsmClient {
    config: HsmConfig,
    http: reqwest::blocking::Client,
    probe: reqwest::blocking::Client,
}

impl HsmClient {
    /// Create a client; nothing is contacted yet.
    pub fn new(config: HsmConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(config.probe_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HSM HTTP client: {}", e)))?;
        let probe = reqwest::blocking::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HSM probe client: {}", e)))?;
        Ok(Self {
            config,
            http,
            probe,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &HsmConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn token(&self, scope: &str) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::signing_failed(e.to_string()))?
            .as_secs();
        let claims = Claims {
            sub: crate::NAME,
            scope,
            iat: now,
            exp: now + self.config.token_ttl_secs,
        };
        let key = EncodingKey::from_secret(self.config.shared_secret.as_bytes());
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| Error::signing_failed(format!("cannot mint HSM token: {}", e)))
    }

    /// Probe `/hsm/status`. Any error counts as unavailable.
    pub fn status(&self) -> bool {
        let Ok(token) = self.token("status") else {
            return false;
        };
        let response = self
            .probe
            .get(self.endpoint("/hsm/status"))
            .bearer_auth(token)
            .send();
        match response {
            Ok(response) if response.status().is_success() => response
                .json::<StatusResponse>()
                .map(|status| status.success)
                .unwrap_or(false),
            Ok(response) => {
                debug!("HSM status probe returned HTTP {}", response.status().as_u16());
                false
            },
            Err(e) => {
                debug!("HSM status probe failed: {}", e);
                false
            },
        }
    }

    /// Request a CMS signature over `digest_hex`.
    pub fn sign_cms(
        &self,
        key_id: &str,
        digest_hex: &str,
        context: &SignContext<'_>,
    ) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
        let signer: &SignerMetadata = context.signer;
        let body = SignRequest {
            key_id,
            data: digest_hex,
            certificate_chain: Vec::new(),
            signer_info: SignerInfoPayload {
                name: &signer.name,
                reason: signer.reason.as_deref(),
                location: signer.location.as_deref(),
                contact_info: signer.contact_info.as_deref(),
                algorithm: context.algorithm.name(),
            },
        };

        let response = self
            .http
            .post(self.endpoint("/hsm/sign/cms"))
            .bearer_auth(self.token("sign")?)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            let message = format!("HSM returned HTTP {}: {}", status.as_u16(), detail);
            return Err(if status.is_server_error() {
                Error::transient_signing_failure(message)
            } else {
                Error::signing_failed(message)
            });
        }

        let payload: SignResponse = response
            .json()
            .map_err(|e| Error::signing_failed(format!("invalid HSM response: {}", e)))?;
        if payload.success == Some(false) {
            return Err(Error::signing_failed(format!(
                "HSM refused to sign: {}",
                payload.error.unwrap_or_else(|| "no detail".to_string())
            )));
        }

        let (signature, chain) = match payload.data {
            Some(data) => (data.signature, data.certificate_chain),
            None => (
                payload
                    .signature
                    .ok_or_else(|| Error::signing_failed("HSM response carries no signature"))?,
                payload.certificate_chain,
            ),
        };

        let cms_der = BASE64
            .decode(signature.trim())
            .map_err(|e| Error::signing_failed(format!("HSM signature is not base64: {}", e)))?;
        let chain = chain
            .unwrap_or_default()
            .iter()
            .map(|cert| BASE64.decode(cert.trim()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::signing_failed(format!("HSM certificate is not base64: {}", e)))?;
        Ok((cms_der, chain))
    }

    /// Generate a key pair on the HSM.
    pub fn generate_key(&self, request: &GenerateKeyRequest) -> Result<GeneratedKey> {
        let response = self
            .http
            .post(self.endpoint("/hsm/keys/generate"))
            .bearer_auth(self.token("keys")?)
            .json(request)
            .send()
            .map_err(transport_error)?
            .error_for_status()
            .map_err(|e| Error::signing_failed(format!("HSM key generation failed: {}", e)))?;
        let envelope: Envelope<GeneratedKey> = response
            .json()
            .map_err(|e| Error::signing_failed(format!("invalid HSM response: {}", e)))?;
        let key = envelope.into_result("key generation")?;
        info!("HSM generated key {}", key.key_id);
        Ok(key)
    }

    /// List the keys the HSM holds.
    pub fn list_keys(&self) -> Result<Vec<HsmKey>> {
        let response = self
            .http
            .get(self.endpoint("/hsm/keys"))
            .bearer_auth(self.token("keys")?)
            .send()
            .map_err(transport_error)?
            .error_for_status()
            .map_err(|e| Error::signing_failed(format!("HSM key listing failed: {}", e)))?;
        let envelope: Envelope<KeyList> = response
            .json()
            .map_err(|e| Error::signing_failed(format!("invalid HSM response: {}", e)))?;
        Ok(envelope.into_result("key listing")?.keys)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::transient_signing_failure(format!("HSM request failed: {}", e))
}

/// Signs through the remote HSM, with configuration-gated mock fallback.
#[derive(Debug)]
pub struct RemoteHsmBackend {
    client: HsmClient,
    key_id: String,
    policy: MockPolicy,
    #[cfg(feature = "mock-signer")]
    mock: MockSigner,
}

impl RemoteHsmBackend {
    /// Create a backend for `key_id`, or the configured key id.
    ///
    /// There is no built-in default key: a missing key id is a configuration
    /// error.
    pub fn new(config: HsmConfig, key_id: Option<String>) -> Result<Self> {
        let key_id = key_id
            .or_else(|| config.key_id.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                Error::Config("no HSM key id in the request or in hsm.key_id".into())
            })?;
        if config.mock_policy != MockPolicy::Disabled && !cfg!(feature = "mock-signer") {
            return Err(Error::Config(
                "mock signer requested but the `mock-signer` feature is not compiled in".into(),
            ));
        }
        let policy = config.mock_policy;
        Ok(Self {
            client: HsmClient::new(config)?,
            key_id,
            policy,
            #[cfg(feature = "mock-signer")]
            mock: MockSigner::default(),
        })
    }

    /// Key id used for signing.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Underlying client.
    pub fn client(&self) -> &HsmClient {
        &self.client
    }

    /// Generate a key pair on the HSM.
    pub fn generate_key(&self, request: &GenerateKeyRequest) -> Result<GeneratedKey> {
        self.client.generate_key(request)
    }

    /// List HSM keys.
    pub fn list_keys(&self) -> Result<Vec<HsmKey>> {
        self.client.list_keys()
    }

    #[cfg(feature = "mock-signer")]
    fn fallback(&self, reason: &str, digest_hex: &str, context: &SignContext<'_>) -> Result<SignedDigest> {
        warn!("HSM fallback to MOCK signer ({}); signature is not authoritative", reason);
        self.mock.sign(digest_hex, context)
    }

    #[cfg(not(feature = "mock-signer"))]
    fn fallback(&self, reason: &str, _digest_hex: &str, _context: &SignContext<'_>) -> Result<SignedDigest> {
        Err(Error::SigningBackendUnavailable(reason.to_string()))
    }
}

impl SigningBackend for RemoteHsmBackend {
    fn name(&self) -> &'static str {
        "remote-hsm"
    }

    fn is_available(&self) -> bool {
        self.client.status()
    }

    fn sign(&self, digest_hex: &str, context: &SignContext<'_>) -> Result<SignedDigest> {
        decode_digest(digest_hex, context.algorithm)?;

        if self.policy == MockPolicy::Always {
            return self.fallback("mock policy is `always`", digest_hex, context);
        }

        if !self.is_available() {
            return match self.policy {
                MockPolicy::Disabled => Err(Error::SigningBackendUnavailable(format!(
                    "HSM at {} did not answer the status probe",
                    self.client.config.base_url
                ))),
                _ => self.fallback("status probe failed", digest_hex, context),
            };
        }

        match self.client.sign_cms(&self.key_id, digest_hex, context) {
            Ok((cms_der, mut chain)) => {
                if chain.is_empty() {
                    chain = ParsedCms::from_der_padded(&cms_der)
                        .map(|cms| cms.certificates())
                        .unwrap_or_default();
                }
                info!("HSM key {} signed digest for {}", self.key_id, context.signer.name);
                Ok(SignedDigest {
                    cms_der,
                    certificate_chain: chain,
                    provenance: SignatureProvenance::Hsm,
                    backend: self.name(),
                })
            },
            Err(e) if e.is_retryable() && self.policy == MockPolicy::OnUnavailable => {
                self.fallback(&e.to_string(), digest_hex, context)
            },
            Err(e) => Err(e),
        }
    }
}
