//! ByteRange calculation for PDF signatures.
//!
//! PDF digital signatures use a ByteRange array to specify which portions
//! of the document are covered by the signature. The signature itself is
//! stored in a placeholder that is excluded from the signed bytes.
//!
//! ## ByteRange Format
//!
//! The ByteRange is an array of four integers:
//! `[offset1, length1, offset2, length2]`
//!
//! Where:
//! - `offset1` = 0 (start of file)
//! - `length1` = byte offset where the signature value begins
//! - `offset2` = byte offset where the signature value ends
//! - `length2` = remaining bytes to end of file
//!
//! The signature value is a hex-encoded string within `<` and `>` delimiters.
//! The excluded gap covers the delimiters as well as the hex digits.

use std::ops::Range;

pub use super::scanner::SignatureSlot;
use super::scanner::scan_markers;
use crate::error::{Error, Result};

/// Width of each numeric field in the fixed-width `/ByteRange` slot.
const FIELD_WIDTH: usize = 10;

/// A parsed `/ByteRange [s1 l1 s2 l2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// Start of the first range (always 0 for a well-formed signature)
    pub start1: usize,
    /// Length of the first range
    pub len1: usize,
    /// Start of the second range
    pub start2: usize,
    /// Length of the second range
    pub len2: usize,
}

impl ByteRange {
    /// Create a ByteRange from its four components.
    pub fn new(start1: usize, len1: usize, start2: usize, len2: usize) -> Self {
        Self {
            start1,
            len1,
            start2,
            len2,
        }
    }

    /// ByteRange excluding `gap` from a file of `file_len` bytes.
    pub fn around(gap: Range<usize>, file_len: usize) -> Self {
        Self::new(0, gap.start, gap.end, file_len.saturating_sub(gap.end))
    }

    /// The excluded span between the two ranges.
    ///
    /// Only meaningful once [`ByteRange::validate`] has passed.
    pub fn gap(&self) -> Range<usize> {
        self.start1.saturating_add(self.len1)..self.start2
    }

    /// End of the second range, `None` on overflow.
    pub fn end(&self) -> Option<usize> {
        self.start2.checked_add(self.len2)
    }

    /// Total number of signed bytes.
    pub fn signed_len(&self) -> usize {
        self.len1.saturating_add(self.len2)
    }

    /// Components as an array.
    pub fn to_array(&self) -> [usize; 4] {
        [self.start1, self.len1, self.start2, self.len2]
    }

    /// Format as a fixed-width PDF array.
    ///
    /// Every ByteRange formats to the same length (as long as each value
    /// has at most ten digits), so a slot written with zeros can be patched
    /// in place once offsets are known.
    pub fn format_fixed(&self) -> String {
        format!(
            "[{} {:<w$} {:<w$} {:<w$}]",
            self.start1,
            self.len1,
            self.start2,
            self.len2,
            w = FIELD_WIDTH
        )
    }

    /// Length of the fixed-width slot produced by [`ByteRange::format_fixed`].
    pub fn fixed_width() -> usize {
        // "[0 " + three fields separated by spaces + "]"
        3 + FIELD_WIDTH * 3 + 2 + 1
    }

    /// Check that the ranges are in bounds and ordered.
    ///
    /// A ByteRange covering the whole document must also satisfy
    /// [`ByteRange::validate_covers`].
    pub fn validate(&self, file_len: usize) -> Result<()> {
        if self.start1 != 0 {
            return Err(Error::MalformedDocument(format!(
                "ByteRange must start at 0, got {}",
                self.start1
            )));
        }
        if self.len1 > self.start2 {
            return Err(Error::MalformedDocument(format!(
                "ByteRange first range ({}) overlaps with second range start ({})",
                self.len1, self.start2
            )));
        }
        let end = self.end().ok_or_else(|| {
            Error::MalformedDocument(format!(
                "ByteRange second range overflows: {} + {}",
                self.start2, self.len2
            ))
        })?;
        if end > file_len {
            return Err(Error::MalformedDocument(format!(
                "ByteRange second range exceeds file size: {} + {} > {}",
                self.start2, self.len2, file_len
            )));
        }
        Ok(())
    }

    /// Check that the ByteRange covers the entire document except the gap.
    pub fn validate_covers(&self, file_len: usize) -> Result<()> {
        self.validate(file_len)?;
        if self.end() != Some(file_len) {
            return Err(Error::MalformedDocument(format!(
                "ByteRange must end at file size {}, got {}",
                file_len,
                self.start2 + self.len2
            )));
        }
        Ok(())
    }

    /// Borrow the two signed slices of `data`.
    pub fn signed_parts<'a>(&self, data: &'a [u8]) -> Result<[&'a [u8]; 2]> {
        self.validate(data.len())?;
        Ok([
            &data[self.start1..self.start1 + self.len1],
            &data[self.start2..self.start2 + self.len2],
        ])
    }

    /// Extract the bytes to be signed: the concatenation of both ranges.
    pub fn extract_signed_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let [first, second] = self.signed_parts(data)?;
        let mut signed = Vec::with_capacity(first.len() + second.len());
        signed.extend_from_slice(first);
        signed.extend_from_slice(second);
        Ok(signed)
    }
}

/// Calculator for placeholder sizes and byte ranges.
#[derive(Debug, Clone, Copy)]
pub struct ByteRangeCalculator {
    /// Reserved DER bytes for the signature
    reserved_bytes: usize,
}

impl ByteRangeCalculator {
    /// Create a calculator reserving `reserved_bytes` for the DER signature.
    ///
    /// The placeholder is `reserved_bytes * 2` hex digits, plus 2 for the
    /// angle brackets.
    pub fn new(reserved_bytes: usize) -> Self {
        Self { reserved_bytes }
    }

    /// Reserved DER size in bytes.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// Number of hex digits inside the placeholder.
    pub fn hex_len(&self) -> usize {
        self.reserved_bytes * 2
    }

    /// Size of the whole placeholder, including `<` and `>`.
    pub fn placeholder_size(&self) -> usize {
        self.hex_len() + 2
    }

    /// Generate the zero-filled placeholder: `<000...000>`.
    pub fn generate_placeholder(&self) -> String {
        format!("<{}>", "0".repeat(self.hex_len()))
    }

    /// Calculate the ByteRange given the position of the placeholder's `<`.
    pub fn calculate_byte_range(&self, file_len: usize, contents_offset: usize) -> ByteRange {
        ByteRange::around(contents_offset..contents_offset + self.placeholder_size(), file_len)
    }
}

impl Default for ByteRangeCalculator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RESERVED_BYTES)
    }
}

/// Find every `/ByteRange` array in the document, in file order.
///
/// Arrays inside strings, comments and stream data are not counted.
pub fn find_byte_ranges(data: &[u8]) -> Vec<ByteRange> {
    scan_markers(data).byte_ranges
}

/// Find every signature dictionary, in file order.
pub fn find_signature_slots(data: &[u8]) -> Vec<SignatureSlot> {
    scan_markers(data).slots
}

/// Find the `/Contents <hex>` value of the last signature dictionary,
/// returning the span of the hex string including its `<` and `>`.
pub fn find_contents_placeholder(data: &[u8]) -> Option<Range<usize>> {
    find_signature_slots(data).pop().map(|slot| slot.contents)
}

/// Find the hex string that fills the gap of `byte_range`.
pub fn contents_in_gap(data: &[u8], byte_range: &ByteRange) -> Result<Vec<u8>> {
    byte_range.validate(data.len())?;
    let gap = &data[byte_range.gap()];
    if gap.len() < 2 || gap[0] != b'<' || gap[gap.len() - 1] != b'>' {
        return Err(Error::MalformedDocument(
            "ByteRange gap does not contain a hex string".to_string(),
        ));
    }
    let hex: String = gap[1..gap.len() - 1]
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|&b| b as char)
        .collect();
    crate::utils::decode_hex(&hex).ok_or_else(|| {
        Error::MalformedDocument("signature contents are not valid hex".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_size() {
        let calc = ByteRangeCalculator::new(1024);
        // 1024 bytes * 2 (hex) + 2 (brackets) = 2050
        assert_eq!(calc.placeholder_size(), 2050);
        assert_eq!(calc.hex_len(), 2048);
    }

    #[test]
    fn test_generate_placeholder() {
        let calc = ByteRangeCalculator::new(4);
        let placeholder = calc.generate_placeholder();
        assert_eq!(placeholder, "<00000000>");
    }

    #[test]
    fn test_calculate_byte_range() {
        let calc = ByteRangeCalculator::new(49);
        let byte_range = calc.calculate_byte_range(1000, 400);

        assert_eq!(byte_range.to_array(), [0, 400, 500, 500]);
        assert_eq!(byte_range.gap(), 400..500);
    }

    #[test]
    fn test_format_fixed_width() {
        let zero = ByteRange::new(0, 0, 0, 0).format_fixed();
        let real = ByteRange::new(0, 1234, 34000, 987654).format_fixed();
        assert_eq!(zero.len(), ByteRange::fixed_width());
        assert_eq!(real.len(), ByteRange::fixed_width());
        assert!(real.starts_with("[0 1234 "));
    }

    #[test]
    fn test_extract_signed_bytes() {
        let pdf_data = b"AAABBBCCC";
        let byte_range = ByteRange::new(0, 3, 6, 3);

        let signed = byte_range.extract_signed_bytes(pdf_data).unwrap();
        assert_eq!(signed, b"AAACCC");
    }

    #[test]
    fn test_validate_byte_range() {
        assert!(ByteRange::new(0, 100, 150, 50).validate_covers(200).is_ok());
        assert!(ByteRange::new(10, 100, 150, 50).validate(200).is_err());
        assert!(ByteRange::new(0, 100, 150, 100).validate(200).is_err());
        assert!(ByteRange::new(0, 160, 150, 50).validate(200).is_err());
        assert!(ByteRange::new(0, 100, 150, 40).validate_covers(200).is_err());
    }

    #[test]
    fn test_validate_rejects_overflow() {
        let byte_range = ByteRange::new(0, 1, usize::MAX, 1);
        assert_eq!(byte_range.end(), None);
        assert!(matches!(byte_range.validate(100), Err(Error::MalformedDocument(_))));
        assert!(byte_range.validate_covers(100).is_err());
        assert!(byte_range.extract_signed_bytes(b"short").is_err());

        let byte_range = ByteRange::new(0, usize::MAX, usize::MAX, 0);
        assert!(byte_range.validate(100).is_err());
        assert_eq!(byte_range.signed_len(), usize::MAX);
    }

    #[test]
    fn test_find_byte_ranges() {
        let data = b"<< /ByteRange [0 10 20 30] >> << /ByteRange[ 0  5 15 25 ] >>";
        let ranges = find_byte_ranges(data);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1], ByteRange::new(0, 5, 15, 25));
    }

    #[test]
    fn test_find_contents_placeholder_uses_last_signature() {
        let data = b"<< /ByteRange [0 1 2 3] /Contents <AB> >> \
                     << /Contents <CD> >> \
                     << /ByteRange [0 4 5 6] /Contents <00000000> /Reason (/Contents <11>) >>";
        let span = find_contents_placeholder(data).unwrap();
        assert_eq!(&data[span], b"<00000000>");
        assert_eq!(find_signature_slots(data).len(), 2);
    }

    #[test]
    fn test_contents_in_gap() {
        let data = b"XX<ABCD0000>YY";
        let byte_range = ByteRange::new(0, 2, 12, 2);
        assert_eq!(contents_in_gap(data, &byte_range).unwrap(), vec![0xAB, 0xCD, 0, 0]);
    }
}
