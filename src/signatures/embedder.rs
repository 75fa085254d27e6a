//! Writes a DER signature into a prepared placeholder.
//!
//! The signature is hex-encoded in uppercase and right-padded with `0` to the
//! placeholder width, so the document length and every offset named by the
//! `/ByteRange` stay unchanged.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};

use super::placeholder::PreparedDocument;
use crate::error::{Error, Result};
use crate::utils::to_hex_upper;

/// Embeds CMS signatures into prepared documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureEmbedder;

impl SignatureEmbedder {
    /// Create an embedder.
    pub fn new() -> Self {
        Self
    }

    /// Embed DER bytes, returning the signed document.
    ///
    /// Fails with [`Error::SignatureTooLarge`] when `2 * der.len()` exceeds
    /// the reserved hex digits; the input is never truncated.
    pub fn embed(&self, prepared: &PreparedDocument, der: &[u8]) -> Result<Vec<u8>> {
        if der.is_empty() {
            return Err(Error::signing_failed("signature is empty"));
        }

        let hex_len = prepared.hex_len();
        let hex = to_hex_upper(der);
        if hex.len() > hex_len {
            warn!(
                "Signature of {} bytes does not fit the {} byte reservation",
                der.len(),
                prepared.reserved_bytes()
            );
            return Err(Error::SignatureTooLarge {
                required: der.len(),
                reserved: prepared.reserved_bytes(),
            });
        }

        let range = prepared.contents_range();
        let mut output = prepared.bytes().to_vec();
        // Skip the '<' delimiter; the padding zeros are already in place
        let start = range.start + 1;
        output[start..start + hex.len()].copy_from_slice(hex.as_bytes());
        output[start + hex.len()..range.end - 1].fill(b'0');

        debug!(
            "Embedded {} byte signature ({} of {} hex digits used)",
            der.len(),
            hex.len(),
            hex_len
        );
        Ok(output)
    }

    /// Embed a base64-encoded DER signature.
    pub fn embed_base64(&self, prepared: &PreparedDocument, cms_base64: &str) -> Result<Vec<u8>> {
        let der = BASE64
            .decode(cms_base64.trim())
            .map_err(|e| Error::signing_failed(format!("signature is not valid base64: {}", e)))?;
        self.embed(prepared, &der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::byterange::{contents_in_gap, ByteRange};

    fn prepared(reserved: usize) -> PreparedDocument {
        let head = b"%PDF-1.7\n1 0 obj << /ByteRange ".to_vec();
        let slot_at = head.len();
        let mut data = head;
        data.extend_from_slice(ByteRange::new(0, 0, 0, 0).format_fixed().as_bytes());
        data.extend_from_slice(b" /Contents ");
        let contents_at = data.len();
        data.push(b'<');
        data.extend(std::iter::repeat(b'0').take(reserved * 2));
        data.push(b'>');
        data.extend_from_slice(b" >> endobj\n%%EOF\n");

        let byte_range = ByteRange::around(contents_at..contents_at + reserved * 2 + 2, data.len());
        let slot = byte_range.format_fixed();
        data[slot_at..slot_at + slot.len()].copy_from_slice(slot.as_bytes());
        PreparedDocument::from_bytes(data).unwrap()
    }

    #[test]
    fn test_embed_preserves_length() {
        let doc = prepared(16);
        let signed = SignatureEmbedder::new().embed(&doc, &[0xAB, 0xCD]).unwrap();
        assert_eq!(signed.len(), doc.bytes().len());

        let gap = &signed[doc.contents_range()];
        assert!(gap.starts_with(b"<ABCD000"));
        assert!(gap.ends_with(b"0>"));
    }

    #[test]
    fn test_embedded_bytes_decode() {
        let doc = prepared(8);
        let signed = SignatureEmbedder::new().embed(&doc, &[1, 2, 3]).unwrap();
        let decoded = contents_in_gap(&signed, &doc.byte_range()).unwrap();
        assert_eq!(&decoded[..3], &[1, 2, 3]);
        assert!(decoded[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_embed_exact_fit() {
        let doc = prepared(4);
        let signed = SignatureEmbedder::new().embed(&doc, &[0xFF; 4]).unwrap();
        assert!(signed[doc.contents_range()].starts_with(b"<FFFFFFFF>"));
    }

    #[test]
    fn test_embed_too_large() {
        let doc = prepared(4);
        let err = SignatureEmbedder::new().embed(&doc, &[0u8; 5]).unwrap_err();
        assert!(matches!(err, Error::SignatureTooLarge { required: 5, reserved: 4 }));
    }

    #[test]
    fn test_embed_base64() {
        let doc = prepared(4);
        let signed = SignatureEmbedder::new().embed_base64(&doc, "3q2+7w==").unwrap();
        assert!(signed[doc.contents_range()].starts_with(b"<DEADBEEF>"));
        assert!(SignatureEmbedder::new().embed_base64(&doc, "!!!").is_err());
    }

    #[test]
    fn test_digest_unchanged_by_embedding() {
        use crate::signatures::types::DigestAlgorithm;
        let doc = prepared(8);
        let before = doc.digest(DigestAlgorithm::Sha256).unwrap();
        let signed = SignatureEmbedder::new().embed(&doc, &[9; 8]).unwrap();
        let after = doc.byte_range().extract_signed_bytes(&signed).unwrap();
        assert_eq!(DigestAlgorithm::Sha256.digest(&after), before.bytes);
    }
}
