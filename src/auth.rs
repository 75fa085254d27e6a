//! Auth collaborator and RFC 6238 TOTP verification.
//!
//! The engine never authenticates callers itself. It receives an identity
//! and, for second-factor gated transitions, asks an [`Authenticator`]
//! whether the user has TOTP enabled and whether a code is valid.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use hmac::{Hmac, Mac};
use log::debug;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::workflow::UserId;

/// Auth collaborator.
pub trait Authenticator: Send + Sync {
    /// Whether `user` has a second factor enabled.
    fn totp_enabled(&self, user: &UserId) -> Result<bool>;

    /// Whether `code` is currently valid for `user`.
    fn verify_totp(&self, user: &UserId, code: &str) -> Result<bool>;
}

/// Enforce the second factor for a state-changing action.
///
/// Users without TOTP pass. Users with TOTP need a code, and the code has to
/// verify; neither case silently proceeds.
pub fn require_totp(auth: &dyn Authenticator, user: &UserId, code: Option<&str>) -> Result<()> {
    if !auth.totp_enabled(user)? {
        return Ok(());
    }
    let code = code
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::TotpRequired(user.to_string()))?;
    if auth.verify_totp(user, code)? {
        debug!("TOTP accepted for {}", user);
        Ok(())
    } else {
        Err(Error::InvalidTotp(user.to_string()))
    }
}

/// RFC 6238 verifier: HMAC-SHA1, 6 digits, 30 second steps.
#[derive(Clone)]
pub struct TotpVerifier {
    secret: Vec<u8>,
    step_secs: u64,
    digits: u32,
    skew: u64,
}

impl TotpVerifier {
    /// Verifier for a raw shared secret, accepting one step of clock skew.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            step_secs: 30,
            digits: 6,
            skew: 1,
        }
    }

    /// Accept codes up to `steps` steps away from the current one.
    pub fn with_skew(mut self, steps: u64) -> Self {
        self.skew = steps;
        self
    }

    /// Code length (6 to 8 digits).
    pub fn with_digits(mut self, digits: u32) -> Self {
        self.digits = digits.clamp(6, 8);
        self
    }

    fn hotp(&self, counter: u64) -> String {
        let mut mac = match Hmac::<Sha1>::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(&counter.to_be_bytes());
        let hash = mac.finalize().into_bytes();

        let offset = (hash[hash.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            hash[offset] & 0x7f,
            hash[offset + 1],
            hash[offset + 2],
            hash[offset + 3],
        ]);
        let code = binary % 10u32.pow(self.digits);
        format!("{:0width$}", code, width = self.digits as usize)
    }

    /// Code for the step containing `unix_secs`.
    pub fn code_at(&self, unix_secs: u64) -> String {
        self.hotp(unix_secs / self.step_secs)
    }

    /// Check `code` against the steps around `unix_secs`.
    pub fn verify_at(&self, code: &str, unix_secs: u64) -> bool {
        let code = code.trim();
        if code.len() != self.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let current = unix_secs / self.step_secs;
        let first = current.saturating_sub(self.skew);
        let mut matched = subtle::Choice::from(0u8);
        for counter in first..=current.saturating_add(self.skew) {
            matched |= self.hotp(counter).as_bytes().ct_eq(code.as_bytes());
        }
        matched.into()
    }

    /// Check `code` against the current time.
    pub fn verify(&self, code: &str) -> bool {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        self.verify_at(code, now)
    }
}

impl fmt::Debug for TotpVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpVerifier")
            .field("secret", &"[REDACTED]")
            .field("step_secs", &self.step_secs)
            .field("digits", &self.digits)
            .field("skew", &self.skew)
            .finish()
    }
}

/// Fixed table of users with a second factor.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    users: HashMap<String, TotpVerifier>,
}

fn user_key(user: &UserId) -> String {
    user.as_str().trim().to_lowercase()
}

impl StaticAuthenticator {
    /// Nobody has TOTP enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable TOTP for `user`.
    pub fn with_totp(mut self, user: impl Into<UserId>, verifier: TotpVerifier) -> Self {
        self.users.insert(user_key(&user.into()), verifier);
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn totp_enabled(&self, user: &UserId) -> Result<bool> {
        Ok(self.users.contains_key(&user_key(user)))
    }

    fn verify_totp(&self, user: &UserId, code: &str) -> Result<bool> {
        Ok(self
            .users
            .get(&user_key(user))
            .map(|verifier| verifier.verify(code))
            .unwrap_or(false))
    }
}
