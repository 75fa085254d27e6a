//! Digests over the signed byte ranges of a prepared document.
//!
//! Two policies locate the excluded span:
//!
//! - [`DigestPolicy::ExplicitByteRange`] reads the `/ByteRange` array of the
//!   last signature dictionary and hashes the two ranges it names.
//! - [`DigestPolicy::ContentsRelative`] finds the `/Contents <hex>` value of
//!   the last signature dictionary and hashes everything before and after it.
//!
//! Both read tokens, not raw text, so strings written into the dictionary
//! or an appearance stream cannot shift either policy.
//!
//! On a document prepared by this crate both policies exclude exactly the
//! same span and therefore produce identical digests. The explicit policy is
//! the one the pipeline and the verifier use.

use log::debug;

use super::byterange::{find_contents_placeholder, find_signature_slots, ByteRange};
use super::types::DigestAlgorithm;
use crate::error::{Error, Result};
use crate::utils::to_hex_lower;

/// How the excluded placeholder span is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestPolicy {
    /// Hash the ranges named by the last signature's `/ByteRange`
    #[default]
    ExplicitByteRange,
    /// Hash everything except the last signature's `/Contents <hex>` value
    ContentsRelative,
}

/// Digest of a prepared or signed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDigest {
    /// Hash algorithm
    pub algorithm: DigestAlgorithm,
    /// Raw digest
    pub bytes: Vec<u8>,
    /// Ranges that were hashed
    pub byte_range: ByteRange,
}

impl DocumentDigest {
    /// Lowercase hex encoding of the digest.
    pub fn hex(&self) -> String {
        to_hex_lower(&self.bytes)
    }
}

/// Hash the two ranges of `byte_range`.
pub fn digest_byte_range(
    data: &[u8],
    byte_range: &ByteRange,
    algorithm: DigestAlgorithm,
) -> Result<DocumentDigest> {
    let [first, second] = byte_range.signed_parts(data)?;
    Ok(DocumentDigest {
        algorithm,
        bytes: algorithm.digest_parts(&[first, second]),
        byte_range: *byte_range,
    })
}

/// Compute the digest of the most recent signature slot using `policy`.
pub fn compute_digest(
    data: &[u8],
    policy: DigestPolicy,
    algorithm: DigestAlgorithm,
) -> Result<DocumentDigest> {
    let byte_range = match policy {
        DigestPolicy::ExplicitByteRange => {
            let slot = find_signature_slots(data).pop().ok_or_else(|| {
                Error::MalformedDocument("no signature dictionary found in document".to_string())
            })?;
            let byte_range = slot.byte_range.ok_or_else(|| {
                Error::MalformedDocument(
                    "/ByteRange is not four non-negative integers".to_string(),
                )
            })?;
            byte_range.validate_covers(data.len())?;
            byte_range
        },
        DigestPolicy::ContentsRelative => {
            let span = find_contents_placeholder(data).ok_or_else(|| {
                Error::MalformedDocument("no /Contents hex string found in document".to_string())
            })?;
            ByteRange::around(span, data.len())
        },
    };

    let digest = digest_byte_range(data, &byte_range, algorithm)?;
    debug!(
        "{:?} digest {} over {:?}: {}",
        policy,
        algorithm,
        byte_range.to_array(),
        digest.hex()
    );
    Ok(digest)
}

/// Compute the digest with both policies and require them to agree.
pub fn cross_check(data: &[u8], algorithm: DigestAlgorithm) -> Result<DocumentDigest> {
    let explicit = compute_digest(data, DigestPolicy::ExplicitByteRange, algorithm)?;
    let relative = compute_digest(data, DigestPolicy::ContentsRelative, algorithm)?;
    if explicit.bytes != relative.bytes {
        return Err(Error::DigestMismatch {
            expected: explicit.hex(),
            computed: relative.hex(),
        });
    }
    Ok(explicit)
}
