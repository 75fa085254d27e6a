//! Signature placeholder preparation.
//!
//! Appends an incremental update to the original bytes containing:
//! - a signature dictionary with a zero-filled `/Contents` reservation and
//!   its final `/ByteRange`
//! - a merged signature field/widget annotation
//! - the target page with the widget added to `/Annots`
//! - the AcroForm with the field added and `/SigFlags 3`
//! - for visible signatures, an appearance stream and its font
//!
//! The original bytes are never modified, so earlier signatures stay valid.
//!
//! ## PDF Specification Reference
//!
//! - ISO 32000-1:2008 Section 7.5.6 - Incremental Updates
//! - ISO 32000-1:2008 Section 12.7.4.5 - Signature Fields
//! - ISO 32000-1:2008 Section 12.8.1 - Signature Dictionaries

use std::io::Write;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, info};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use regex::bytes::Regex;

use super::byterange::{find_signature_slots, ByteRange, ByteRangeCalculator};
use super::digest::{digest_byte_range, DocumentDigest};
use super::serializer::ObjectSerializer;
use super::types::{DigestAlgorithm, SignatureSubFilter, SignerMetadata, WidgetAppearance};
use crate::config::DEFAULT_RESERVED_BYTES;
use crate::error::{Error, Result};
use crate::utils::{escape_pdf_string, format_pdf_date};

/// Annotation flags: Print (4) | Locked (128).
const WIDGET_FLAGS: i64 = 132;

/// AcroForm `/SigFlags`: SignaturesExist | AppendOnly.
const SIG_FLAGS: i64 = 3;

lazy_static! {
    static ref STARTXREF_RE: Regex =
        Regex::new(r"startxref\s+(\d+)").expect("valid startxref regex");
}

/// Options for preparing a signature placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderOptions {
    /// Signer details written into the signature dictionary
    pub signer: SignerMetadata,
    /// Bytes reserved for the DER-encoded CMS
    pub reserved_bytes: usize,
    /// Signature format
    pub sub_filter: SignatureSubFilter,
    /// Visible widget; invisible when absent
    pub appearance: Option<WidgetAppearance>,
    /// Explicit field name; generated from `field_name_prefix` when absent
    pub field_name: Option<String>,
    /// Prefix for generated field names
    pub field_name_prefix: String,
    /// Value of `/M`; the current time when absent
    pub signing_time: Option<DateTime<Utc>>,
}

impl PlaceholderOptions {
    /// Invisible signature with the default reservation.
    pub fn new(signer: SignerMetadata) -> Self {
        Self {
            signer,
            reserved_bytes: DEFAULT_RESERVED_BYTES,
            sub_filter: SignatureSubFilter::Pkcs7Detached,
            appearance: None,
            field_name: None,
            field_name_prefix: "Signature".to_string(),
            signing_time: None,
        }
    }

    /// Reserve `bytes` for the DER signature.
    pub fn with_reserved_bytes(mut self, bytes: usize) -> Self {
        self.reserved_bytes = bytes;
        self
    }

    /// Use a visible widget.
    pub fn with_appearance(mut self, appearance: WidgetAppearance) -> Self {
        self.appearance = Some(appearance);
        self
    }

    /// Name the signature field.
    pub fn with_field_name(mut self, name: impl Into<String>) -> Self {
        self.field_name = Some(name.into());
        self
    }

    /// Set the prefix for generated field names.
    pub fn with_field_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.field_name_prefix = prefix.into();
        self
    }

    /// Pin the `/M` signing time.
    pub fn with_signing_time(mut self, at: DateTime<Utc>) -> Self {
        self.signing_time = Some(at);
        self
    }

    /// Select the signature format.
    pub fn with_sub_filter(mut self, sub_filter: SignatureSubFilter) -> Self {
        self.sub_filter = sub_filter;
        self
    }
}

/// A PDF with a final `/ByteRange` and a zero-filled `/Contents` placeholder.
///
/// The placeholder holds exactly `2 * reserved_bytes` hex digits and its size
/// never changes; only the embedder writes into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDocument {
    bytes: Vec<u8>,
    byte_range: ByteRange,
    reserved_bytes: usize,
    field_name: String,
}

impl PreparedDocument {
    /// Re-derive a prepared document from bytes produced earlier.
    ///
    /// The last signature dictionary's `/ByteRange` must cover the whole
    /// file, and its gap must be that dictionary's zero-filled `/Contents`.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let slot = find_signature_slots(&bytes).pop().ok_or_else(|| {
            Error::MalformedDocument("document has no signature placeholder".to_string())
        })?;
        let byte_range = slot.byte_range.ok_or_else(|| {
            Error::MalformedDocument("/ByteRange is not four non-negative integers".to_string())
        })?;
        byte_range.validate_covers(bytes.len())?;
        if byte_range.gap() != slot.contents {
            return Err(Error::MalformedDocument(
                "/ByteRange gap does not match the /Contents value".to_string(),
            ));
        }

        let gap = &bytes[byte_range.gap()];
        let is_placeholder = gap.len() >= 2
            && gap[0] == b'<'
            && gap[gap.len() - 1] == b'>'
            && (gap.len() - 2) % 2 == 0
            && gap[1..gap.len() - 1].iter().all(|&b| b == b'0');
        if !is_placeholder {
            return Err(Error::MalformedDocument(
                "last /ByteRange gap is not an empty placeholder".to_string(),
            ));
        }

        let reserved_bytes = (gap.len() - 2) / 2;
        Ok(Self {
            bytes,
            byte_range,
            reserved_bytes,
            field_name: String::new(),
        })
    }

    /// Prepared bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Final ByteRange.
    pub fn byte_range(&self) -> ByteRange {
        self.byte_range
    }

    /// Span of the placeholder including `<` and `>`.
    pub fn contents_range(&self) -> std::ops::Range<usize> {
        self.byte_range.gap()
    }

    /// Reserved DER bytes.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// Number of hex digits in the placeholder.
    pub fn hex_len(&self) -> usize {
        self.reserved_bytes * 2
    }

    /// Name of the signature field (empty when re-derived from bytes).
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Digest over the byte ranges.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Result<DocumentDigest> {
        digest_byte_range(&self.bytes, &self.byte_range, algorithm)
    }
}

/// Prepares signature placeholders.
#[derive(Debug, Clone)]
pub struct PlaceholderPreparer {
    options: PlaceholderOptions,
}

/// Object ids allocated for one update.
struct UpdateIds {
    sig: ObjectId,
    widget: ObjectId,
    appearance: Option<(ObjectId, ObjectId)>,
    acroform: ObjectId,
    catalog_rewrite: Option<ObjectId>,
}

impl PlaceholderPreparer {
    /// Create a preparer.
    pub fn new(options: PlaceholderOptions) -> Self {
        Self { options }
    }

    /// Options in use.
    pub fn options(&self) -> &PlaceholderOptions {
        &self.options
    }

    /// Prepare `pdf` for signing.
    pub fn prepare(&self, pdf: &[u8]) -> Result<PreparedDocument> {
        if self.options.reserved_bytes == 0 {
            return Err(Error::Config("reserved signature size must be greater than zero".into()));
        }
        if !pdf.starts_with(b"%PDF-") {
            return Err(Error::MalformedDocument("missing %PDF- header".to_string()));
        }

        let doc = Document::load_mem(pdf)
            .map_err(|e| Error::MalformedDocument(format!("cannot parse PDF: {}", e)))?;
        if doc.trailer.has(b"Encrypt") {
            return Err(Error::Unsupported("signing encrypted documents".to_string()));
        }

        let root_id = doc
            .trailer
            .get(b"Root")
            .and_then(Object::as_reference)
            .map_err(|_| Error::MalformedDocument("trailer has no /Root reference".to_string()))?;
        let catalog = doc.get_dictionary(root_id).map_err(malformed)?.clone();

        let page_index = self.options.appearance.as_ref().map_or(0, |a| a.page);
        let pages = doc.get_pages();
        let page_id = *pages.values().nth(page_index).ok_or_else(|| {
            if pages.is_empty() {
                Error::MalformedDocument("document has no pages".to_string())
            } else {
                Error::NotFound(format!(
                    "page {} (document has {} pages)",
                    page_index,
                    pages.len()
                ))
            }
        })?;

        // AcroForm: reuse an indirect one, lift an inline one into a new object
        let (acroform_ref, mut acroform) = match catalog.get(b"AcroForm") {
            Ok(Object::Reference(id)) => {
                (Some(*id), doc.get_dictionary(*id).map_err(malformed)?.clone())
            },
            Ok(Object::Dictionary(dict)) => (None, dict.clone()),
            _ => (None, Dictionary::new()),
        };

        let mut next_id = doc.max_id + 1;
        let mut allocate = || {
            let id = (next_id, 0);
            next_id += 1;
            id
        };
        let ids = UpdateIds {
            sig: allocate(),
            widget: allocate(),
            appearance: self.options.appearance.as_ref().map(|_| (allocate(), allocate())),
            acroform: acroform_ref.unwrap_or_else(&mut allocate),
            catalog_rewrite: if acroform_ref.is_some() { None } else { Some(root_id) },
        };
        let size = next_id;

        let existing_fields = self.existing_fields(&doc, &acroform)?;
        let field_name = self.field_name(&doc, &existing_fields);
        let signing_time = self.options.signing_time.unwrap_or_else(Utc::now);

        let mut fields = existing_fields;
        fields.push(Object::Reference(ids.widget));
        acroform.set("Fields", Object::Array(fields));
        acroform.set("SigFlags", Object::Integer(SIG_FLAGS));

        let mut page = doc.get_dictionary(page_id).map_err(malformed)?.clone();
        let mut annots = match page.get(b"Annots") {
            Ok(obj) => resolve(&doc, obj)?.as_array().map_err(malformed)?.clone(),
            Err(_) => Vec::new(),
        };
        annots.push(Object::Reference(ids.widget));
        page.set("Annots", Object::Array(annots));

        let widget = self.widget_dictionary(&ids, page_id, &field_name);

        // Signature dictionary first: its offsets are needed for the ByteRange
        let calculator = ByteRangeCalculator::new(self.options.reserved_bytes);
        let serializer = ObjectSerializer::compact();

        let mut output = pdf.to_vec();
        if !matches!(output.last(), Some(b'\n') | Some(b'\r')) {
            output.push(b'\n');
        }

        let mut xref_entries: Vec<(u32, usize)> = Vec::new();

        let sig_offset = output.len();
        let (sig_bytes, slot_rel, contents_rel) =
            self.signature_object(ids.sig, &calculator, signing_time, &serializer);
        output.extend_from_slice(&sig_bytes);
        xref_entries.push((ids.sig.0, sig_offset));

        let mut objects: Vec<(ObjectId, Object)> = vec![
            (ids.widget, Object::Dictionary(widget)),
            (page_id, Object::Dictionary(page)),
            (ids.acroform, Object::Dictionary(acroform)),
        ];
        if let Some(root) = ids.catalog_rewrite {
            let mut catalog = catalog;
            catalog.set("AcroForm", Object::Reference(ids.acroform));
            objects.push((root, Object::Dictionary(catalog)));
        }
        if let (Some((ap_id, font_id)), Some(appearance)) =
            (ids.appearance, self.options.appearance.as_ref())
        {
            let text = self.stamp_text(appearance, signing_time);
            objects.push((ap_id, appearance_stream(appearance, &text, font_id)));
            objects.push((font_id, helvetica()));
        }

        for (id, object) in &objects {
            xref_entries.push((id.0, output.len()));
            output.extend_from_slice(&serializer.serialize_indirect(id.0, id.1, object));
        }

        let xref_offset = output.len();
        write_xref(&mut output, &mut xref_entries);

        let mut trailer = Dictionary::new();
        trailer.set("Size", Object::Integer(size as i64));
        trailer.set("Root", Object::Reference(root_id));
        for key in [&b"Info"[..], b"ID"] {
            if let Ok(value) = doc.trailer.get(key) {
                trailer.set(key.to_vec(), value.clone());
            }
        }
        trailer.set("Prev", Object::Integer(find_prev_xref_offset(pdf)? as i64));
        output.extend_from_slice(b"trailer\n");
        output.extend_from_slice(&serializer.serialize(&Object::Dictionary(trailer)));
        let _ = write!(output, "\nstartxref\n{}\n%%EOF\n", xref_offset);

        // Offsets are final now; patch the fixed-width ByteRange slot in place
        let contents_offset = sig_offset + contents_rel;
        let byte_range = calculator.calculate_byte_range(output.len(), contents_offset);
        let slot = byte_range.format_fixed();
        let slot_at = sig_offset + slot_rel;
        output[slot_at..slot_at + slot.len()].copy_from_slice(slot.as_bytes());
        byte_range.validate_covers(output.len())?;

        info!(
            "Prepared signature field '{}' (sig {} 0 R, widget {} 0 R, page {} 0 R), reserved {} bytes",
            field_name, ids.sig.0, ids.widget.0, page_id.0, self.options.reserved_bytes
        );
        debug!("ByteRange {:?}, output {} bytes", byte_range.to_array(), output.len());

        Ok(PreparedDocument {
            bytes: output,
            byte_range,
            reserved_bytes: self.options.reserved_bytes,
            field_name,
        })
    }

    /// Resolve the AcroForm `/Fields` array.
    fn existing_fields(&self, doc: &Document, acroform: &Dictionary) -> Result<Vec<Object>> {
        match acroform.get(b"Fields") {
            Ok(obj) => Ok(resolve(doc, obj)?.as_array().map_err(malformed)?.clone()),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Explicit name, or the first `<prefix><n>` not already taken.
    fn field_name(&self, doc: &Document, fields: &[Object]) -> String {
        if let Some(name) = &self.options.field_name {
            return name.clone();
        }
        let taken: Vec<String> = fields
            .iter()
            .filter_map(|field| resolve(doc, field).ok()?.as_dict().ok())
            .filter_map(|dict| match dict.get(b"T") {
                Ok(Object::String(bytes, _)) => Some(String::from_utf8_lossy(bytes).to_string()),
                _ => None,
            })
            .collect();
        (1..)
            .map(|n| format!("{}{}", self.options.field_name_prefix, n))
            .find(|candidate| !taken.contains(candidate))
            .unwrap_or_else(|| self.options.field_name_prefix.clone())
    }

    fn widget_dictionary(&self, ids: &UpdateIds, page_id: ObjectId, field_name: &str) -> Dictionary {
        let mut widget = Dictionary::new();
        widget.set("Type", name("Annot"));
        widget.set("Subtype", name("Widget"));
        widget.set("FT", name("Sig"));
        widget.set("T", text_string(field_name));
        widget.set("V", Object::Reference(ids.sig));
        widget.set("F", Object::Integer(WIDGET_FLAGS));
        widget.set("P", Object::Reference(page_id));

        let rect = match self.options.appearance.as_ref() {
            Some(appearance) => appearance.rect.corners(),
            None => [0.0; 4],
        };
        widget.set(
            "Rect",
            Object::Array(rect.iter().map(|v| Object::Integer(v.round() as i64)).collect()),
        );

        if let Some((ap_id, _)) = ids.appearance {
            let mut ap = Dictionary::new();
            ap.set("N", Object::Reference(ap_id));
            widget.set("AP", Object::Dictionary(ap));
        }
        widget
    }

    /// Serialize the signature dictionary, returning the bytes and the
    /// offsets (relative to the object start) of the ByteRange slot and the
    /// `<` of the Contents placeholder.
    ///
    /// Free-text entries come before `/ByteRange` and `/Contents`, which
    /// close the dictionary.
    fn signature_object(
        &self,
        id: ObjectId,
        calculator: &ByteRangeCalculator,
        signing_time: DateTime<Utc>,
        serializer: &ObjectSerializer,
    ) -> (Vec<u8>, usize, usize) {
        let mut buf = Vec::with_capacity(calculator.placeholder_size() + 512);
        let _ = write!(
            buf,
            "{} {} obj\n<< /Type /Sig /Filter /Adobe.PPKLite /SubFilter /{}",
            id.0,
            id.1,
            self.options.sub_filter.as_pdf_name()
        );

        let signer = &self.options.signer;
        let optional = [
            ("Name", Some(&signer.name)),
            ("Reason", signer.reason.as_ref()),
            ("Location", signer.location.as_ref()),
            ("ContactInfo", signer.contact_info.as_ref()),
        ];
        for (key, value) in optional {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                let _ = write!(buf, " /{} ", key);
                serializer.write_object(&mut buf, &text_string(value));
            }
        }
        let _ = write!(
            buf,
            " /M ({}) /ByteRange ",
            escape_pdf_string(&format_pdf_date(signing_time))
        );

        let slot_rel = buf.len();
        buf.extend_from_slice(ByteRange::new(0, 0, 0, 0).format_fixed().as_bytes());
        buf.extend_from_slice(b" /Contents ");
        let contents_rel = buf.len();
        buf.extend_from_slice(calculator.generate_placeholder().as_bytes());
        buf.extend_from_slice(b" >>\nendobj\n");
        (buf, slot_rel, contents_rel)
    }

    /// Stamp text lines: explicit text, or derived from the signer.
    fn stamp_text(&self, appearance: &WidgetAppearance, at: DateTime<Utc>) -> Vec<String> {
        if let Some(text) = &appearance.stamp_text {
            return text.lines().map(str::to_string).collect();
        }
        let signer = &self.options.signer;
        let mut lines = vec![format!("Digitally signed by {}", signer.name)];
        if let Some(org) = &signer.organization {
            lines.push(org.clone());
        }
        if let Some(reason) = &signer.reason {
            lines.push(format!("Reason: {}", reason));
        }
        if let Some(location) = &signer.location {
            lines.push(format!("Location: {}", location));
        }
        lines.push(format!("Date: {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
        lines
    }
}

fn malformed(e: lopdf::Error) -> Error {
    Error::MalformedDocument(e.to_string())
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).map_err(malformed),
        other => Ok(other),
    }
}

fn name(value: &str) -> Object {
    Object::Name(value.as_bytes().to_vec())
}

/// PDF text string: literal for ASCII, UTF-16BE with BOM otherwise.
fn text_string(s: &str) -> Object {
    if s.is_ascii() {
        Object::string_literal(s)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in s.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}

fn helvetica() -> Object {
    let mut font = Dictionary::new();
    font.set("Type", name("Font"));
    font.set("Subtype", name("Type1"));
    font.set("BaseFont", name("Helvetica"));
    font.set("Encoding", name("WinAnsiEncoding"));
    Object::Dictionary(font)
}

/// Format a coordinate with at most two decimals.
fn num(value: f32) -> String {
    let formatted = format!("{:.2}", value);
    formatted.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Form XObject drawing a thin border and the stamp lines in Helvetica.
fn appearance_stream(appearance: &WidgetAppearance, lines: &[String], font_id: ObjectId) -> Object {
    let width = appearance.rect.width.round().max(1.0);
    let height = appearance.rect.height.round().max(1.0);
    let font_size = appearance.font_size.max(1.0);
    let leading = font_size * 1.2;

    let mut content = Vec::new();
    let _ = writeln!(
        content,
        "q 0 0 0 RG 0.5 w 0.25 0.25 {} {} re S Q",
        num(width - 0.5),
        num(height - 0.5)
    );
    let _ = writeln!(
        content,
        "BT /F1 {} Tf {} TL 4 {} Td",
        num(font_size),
        num(leading),
        num(height - font_size - 2.0)
    );
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            content.extend_from_slice(b"T* ");
        }
        content.push(b'(');
        for c in line.chars() {
            match c {
                '(' | ')' | '\\' => {
                    content.push(b'\\');
                    content.push(c as u8);
                },
                // WinAnsi covers Latin-1; anything else degrades to '?'
                c if (c as u32) < 0x100 && !c.is_control() => content.push(c as u32 as u8),
                _ => content.push(b'?'),
            }
        }
        content.extend_from_slice(b") Tj\n");
    }
    content.extend_from_slice(b"ET");

    let mut fonts = Dictionary::new();
    fonts.set("F1", Object::Reference(font_id));
    let mut resources = Dictionary::new();
    resources.set("Font", Object::Dictionary(fonts));

    let mut dict = Dictionary::new();
    dict.set("Type", name("XObject"));
    dict.set("Subtype", name("Form"));
    dict.set(
        "BBox",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(width as i64),
            Object::Integer(height as i64),
        ]),
    );
    dict.set("Resources", Object::Dictionary(resources));
    Object::Stream(Stream::new(dict, content))
}

/// Write a classic xref section, grouping consecutive ids into subsections.
fn write_xref(output: &mut Vec<u8>, entries: &mut [(u32, usize)]) {
    entries.sort_by_key(|(id, _)| *id);
    output.extend_from_slice(b"xref\n");

    let mut start = 0;
    while start < entries.len() {
        let mut end = start + 1;
        while end < entries.len() && entries[end].0 == entries[end - 1].0 + 1 {
            end += 1;
        }
        let _ = writeln!(output, "{} {}", entries[start].0, end - start);
        for (_, offset) in &entries[start..end] {
            let _ = write!(output, "{:010} {:05} n \n", offset, 0);
        }
        start = end;
    }
}

/// Find the offset of the previous xref section from the last `startxref`.
fn find_prev_xref_offset(bytes: &[u8]) -> Result<u64> {
    let window = &bytes[bytes.len().saturating_sub(2048)..];
    let offset = STARTXREF_RE
        .captures_iter(window)
        .last()
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| Error::MalformedDocument("could not find startxref".to_string()))?;
    std::str::from_utf8(offset.as_bytes())
        .ok()
        .and_then(|digits| digits.parse::<u64>().ok())
        .ok_or_else(|| Error::MalformedDocument("startxref offset is out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::types::Rect;
    use crate::test_support::minimal_pdf;

    fn options() -> PlaceholderOptions {
        PlaceholderOptions::new(SignerMetadata::new("Alice").with_reason("Approval"))
            .with_reserved_bytes(2048)
    }

    #[test]
    fn test_prepare_invisible() {
        let pdf = minimal_pdf();
        let prepared = PlaceholderPreparer::new(options()).prepare(&pdf).unwrap();

        assert!(prepared.bytes().starts_with(&pdf));
        assert_eq!(prepared.field_name(), "Signature1");
        assert_eq!(prepared.hex_len(), 4096);

        let gap = &prepared.bytes()[prepared.contents_range()];
        assert_eq!(gap.len(), 4096 + 2);
        assert_eq!(gap[0], b'<');
        assert!(gap[1..gap.len() - 1].iter().all(|&b| b == b'0'));

        let br = prepared.byte_range();
        assert_eq!(br.start1, 0);
        assert_eq!(br.end(), Some(prepared.bytes().len()));
    }

    #[test]
    fn test_prepared_document_parses() {
        let prepared = PlaceholderPreparer::new(options()).prepare(&minimal_pdf()).unwrap();
        let doc = Document::load_mem(prepared.bytes()).unwrap();

        let catalog = doc.catalog().unwrap();
        let acroform_id = catalog.get(b"AcroForm").unwrap().as_reference().unwrap();
        let acroform = doc.get_dictionary(acroform_id).unwrap();
        assert_eq!(acroform.get(b"SigFlags").unwrap().as_i64().unwrap(), 3);
        assert_eq!(acroform.get(b"Fields").unwrap().as_array().unwrap().len(), 1);

        let page_id = *doc.get_pages().values().next().unwrap();
        let page = doc.get_dictionary(page_id).unwrap();
        assert_eq!(page.get(b"Annots").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_prepared_document_roundtrip_from_bytes() {
        let prepared = PlaceholderPreparer::new(options()).prepare(&minimal_pdf()).unwrap();
        let again = PreparedDocument::from_bytes(prepared.bytes().to_vec()).unwrap();
        assert_eq!(again.byte_range(), prepared.byte_range());
        assert_eq!(again.reserved_bytes(), 2048);
    }

    #[test]
    fn test_prepare_twice_adds_second_field() {
        let preparer = PlaceholderPreparer::new(options());
        let first = preparer.prepare(&minimal_pdf()).unwrap();
        let second = preparer.prepare(first.bytes()).unwrap();
        assert_eq!(second.field_name(), "Signature2");
        assert_eq!(find_signature_slots(second.bytes()).len(), 2);
    }

    #[test]
    fn test_prepare_visible() {
        let appearance = WidgetAppearance::new(0, Rect::new(72.0, 72.0, 200.0, 60.0));
        let prepared = PlaceholderPreparer::new(options().with_appearance(appearance))
            .prepare(&minimal_pdf())
            .unwrap();
        let text = String::from_utf8_lossy(prepared.bytes());
        assert!(text.contains("/BaseFont /Helvetica"));
        assert!(text.contains("(Digitally signed by Alice) Tj"));
        assert!(text.contains("/Rect [72 72 272 132]"));
        assert!(Document::load_mem(prepared.bytes()).is_ok());
    }

    #[test]
    fn test_signature_dictionary_metadata() {
        let at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 1, 2, 3, 4, 5).unwrap();
        let prepared = PlaceholderPreparer::new(options().with_signing_time(at))
            .prepare(&minimal_pdf())
            .unwrap();
        let text = String::from_utf8_lossy(prepared.bytes());
        assert!(text.contains("/SubFilter /adbe.pkcs7.detached"));
        assert!(text.contains("/Name (Alice)"));
        assert!(text.contains("/Reason (Approval)"));
        assert!(text.contains("/M (D:20240102030405+00'00')"));
    }

    #[test]
    fn test_free_text_cannot_pose_as_markers() {
        let signer = SignerMetadata::new("Mallory /ByteRange [0 1 2 3]")
            .with_reason("see /Contents <00>")
            .with_location("x) /Contents <FF> (");
        let appearance = WidgetAppearance::new(0, Rect::new(10.0, 10.0, 150.0, 40.0))
            .with_stamp_text("/ByteRange [0 9 9 9] endstream /Contents <AA>");
        let prepared = PlaceholderPreparer::new(
            PlaceholderOptions::new(signer)
                .with_reserved_bytes(512)
                .with_appearance(appearance),
        )
        .prepare(&minimal_pdf())
        .unwrap();

        let again = PreparedDocument::from_bytes(prepared.bytes().to_vec()).unwrap();
        assert_eq!(again.byte_range(), prepared.byte_range());
        assert_eq!(find_signature_slots(prepared.bytes()).len(), 1);

        let bytes = prepared.bytes();
        let slot = &find_signature_slots(bytes)[0];
        let reason_at = bytes.windows(7).position(|w| w == b"/Reason").unwrap();
        assert!(slot.dict_start < reason_at && reason_at < slot.contents.start);
    }

    #[test]
    fn test_malformed_input() {
        let preparer = PlaceholderPreparer::new(options());
        assert!(matches!(preparer.prepare(b"hello"), Err(Error::MalformedDocument(_))));
        assert!(matches!(
            preparer.prepare(b"%PDF-1.7\ngarbage"),
            Err(Error::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_page_out_of_range() {
        let appearance = WidgetAppearance::new(3, Rect::new(0.0, 0.0, 10.0, 10.0));
        let result = PlaceholderPreparer::new(options().with_appearance(appearance))
            .prepare(&minimal_pdf());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_text_string_encoding() {
        assert_eq!(text_string("abc"), Object::string_literal("abc"));
        match text_string("Zoë") {
            Object::String(bytes, StringFormat::Hexadecimal) => {
                assert_eq!(&bytes[..2], &[0xFE, 0xFF]);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_find_prev_xref_offset() {
        let pdf = minimal_pdf();
        let offset = find_prev_xref_offset(&pdf).unwrap() as usize;
        assert!(pdf[offset..].starts_with(b"xref"));
    }
}
