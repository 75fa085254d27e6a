//! Configuration for the signature engine.
//!
//! All secrets and endpoints are passed in explicitly through these structs;
//! the engine itself never reads process environment.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::signatures::DigestAlgorithm;

/// Default placeholder reservation in bytes.
pub const DEFAULT_RESERVED_BYTES: usize = 16384;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development; the mock signer may be enabled
    #[default]
    Development,
    /// Production; the mock signer is never reachable
    Production,
}

/// When the deterministic mock signer may stand in for the HSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockPolicy {
    /// Never use the mock signer
    #[default]
    Disabled,
    /// Use the mock signer when the HSM health probe or transport fails
    OnUnavailable,
    /// Always use the mock signer, without contacting the HSM
    Always,
}

/// Defaults applied to every signing request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SigningDefaults {
    /// Bytes reserved for the DER-encoded CMS inside `/Contents`
    pub reserved_bytes: usize,
    /// Digest algorithm over the byte ranges
    pub digest_algorithm: DigestAlgorithm,
    /// Prefix of generated signature field names (`<prefix><n>`)
    pub field_name_prefix: String,
}

impl Default for SigningDefaults {
    fn default() -> Self {
        Self {
            reserved_bytes: DEFAULT_RESERVED_BYTES,
            digest_algorithm: DigestAlgorithm::Sha256,
            field_name_prefix: "Signature".to_string(),
        }
    }
}

/// Remote HSM connection settings.
#[derive(Clone, PartialEq, Deserialize)]
pub struct HsmConfig {
    /// Base URL, e.g. `https://hsm.internal:8443`
    pub base_url: String,
    /// Operator-chosen key used when a request names none
    #[serde(default)]
    pub key_id: Option<String>,
    /// HS256 secret for the short-lived bearer token
    pub shared_secret: String,
    /// Bearer token lifetime
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Timeout for signing and key management calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for the `/hsm/status` probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Mock fallback policy
    #[serde(default)]
    pub mock_policy: MockPolicy,
}

fn default_token_ttl() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    3
}

impl HsmConfig {
    /// Create a config for `base_url` with the given shared secret.
    pub fn new(base_url: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            key_id: None,
            shared_secret: shared_secret.into(),
            token_ttl_secs: default_token_ttl(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            mock_policy: MockPolicy::Disabled,
        }
    }

    /// Set the default key id.
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Set the mock fallback policy.
    pub fn with_mock_policy(mut self, policy: MockPolicy) -> Self {
        self.mock_policy = policy;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Set the status probe timeout.
    pub fn with_probe_timeout(mut self, secs: u64) -> Self {
        self.probe_timeout_secs = secs;
        self
    }

    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Probe timeout as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl fmt::Debug for HsmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmConfig")
            .field("base_url", &self.base_url)
            .field("key_id", &self.key_id)
            .field("shared_secret", &"[REDACTED]")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .field("mock_policy", &self.mock_policy)
            .finish()
    }
}

/// RFC 3161 timestamp authority settings.
#[derive(Clone, PartialEq, Deserialize)]
pub struct TsaConfig {
    /// Endpoint accepting `application/timestamp-query`
    pub url: String,
    /// Request timeout
    #[serde(default = "default_tsa_timeout")]
    pub timeout_secs: u64,
    /// Basic auth user
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,
}

fn default_tsa_timeout() -> u64 {
    20
}

impl TsaConfig {
    /// Create a config for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_tsa_timeout(),
            username: None,
            password: None,
        }
    }

    /// Use basic authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl fmt::Debug for TsaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsaConfig")
            .field("url", &self.url)
            .field("timeout_secs", &self.timeout_secs)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Signing defaults
    pub signing: SigningDefaults,
    /// Remote HSM, if any
    pub hsm: Option<HsmConfig>,
    /// Timestamp authority, if any
    pub tsa: Option<TsaConfig>,
}

impl EngineConfig {
    /// Create new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the environment.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the placeholder reservation.
    pub fn with_reserved_bytes(mut self, bytes: usize) -> Self {
        self.signing.reserved_bytes = bytes;
        self
    }

    /// Set the digest algorithm.
    pub fn with_digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.signing.digest_algorithm = algorithm;
        self
    }

    /// Configure the remote HSM.
    pub fn with_hsm(mut self, hsm: HsmConfig) -> Self {
        self.hsm = Some(hsm);
        self
    }

    /// Configure the timestamp authority.
    pub fn with_tsa(mut self, tsa: TsaConfig) -> Self {
        self.tsa = Some(tsa);
        self
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for unsafe or incomplete settings.
    pub fn validate(&self) -> Result<()> {
        if self.signing.reserved_bytes == 0 {
            return Err(Error::Config("signing.reserved_bytes must be greater than zero".into()));
        }
        if self.signing.digest_algorithm == DigestAlgorithm::Sha1 {
            return Err(Error::Config("SHA-1 is accepted for verification only".into()));
        }

        if let Some(hsm) = &self.hsm {
            if hsm.base_url.trim().is_empty() {
                return Err(Error::Config("hsm.base_url is empty".into()));
            }
            if hsm.shared_secret.is_empty() {
                return Err(Error::Config("hsm.shared_secret is empty".into()));
            }
            if hsm.mock_policy != MockPolicy::Disabled {
                if self.environment == Environment::Production {
                    return Err(Error::Config(
                        "mock signer cannot be enabled in production".into(),
                    ));
                }
                if !cfg!(feature = "mock-signer") {
                    return Err(Error::Config(
                        "mock signer requested but the `mock-signer` feature is not compiled in"
                            .into(),
                    ));
                }
            }
        }

        if let Some(tsa) = &self.tsa {
            if tsa.url.trim().is_empty() {
                return Err(Error::Config("tsa.url is empty".into()));
            }
        }

        Ok(())
    }
}
