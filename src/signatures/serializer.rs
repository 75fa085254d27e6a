//! PDF object serialization for incremental updates.
//!
//! Serializes `lopdf` objects to their byte representation according to
//! ISO 32000-1:2008 section 7.3.

use std::io::Write;

use lopdf::{Dictionary, Object, StringFormat};

/// Serializer for PDF objects.
///
/// Writing into a `Vec<u8>` cannot fail, so the public methods return bytes
/// directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectSerializer {
    /// Whether to use compact formatting (minimal whitespace)
    compact: bool,
}

impl ObjectSerializer {
    /// Create a new object serializer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a compact serializer (minimal whitespace).
    pub fn compact() -> Self {
        Self { compact: true }
    }

    /// Serialize an object to bytes.
    pub fn serialize(&self, obj: &Object) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_object(&mut buf, obj);
        buf
    }

    /// Serialize an indirect object definition.
    ///
    /// Format: `{id} {gen} obj\n{object}\nendobj\n`
    pub fn serialize_indirect(&self, id: u32, gen: u16, obj: &Object) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = writeln!(buf, "{} {} obj", id, gen);
        self.write_object(&mut buf, obj);
        buf.extend_from_slice(b"\nendobj\n");
        buf
    }

    /// Write an object to a buffer.
    pub fn write_object(&self, w: &mut Vec<u8>, obj: &Object) {
        match obj {
            Object::Null => w.extend_from_slice(b"null"),
            Object::Boolean(b) => w.extend_from_slice(if *b { b"true" } else { b"false" }),
            Object::Integer(i) => {
                let _ = write!(w, "{}", i);
            },
            Object::Real(r) => self.write_real(w, f64::from(*r)),
            Object::Name(n) => self.write_name(w, n),
            Object::String(s, format) => self.write_string(w, s, *format),
            Object::Array(arr) => self.write_array(w, arr),
            Object::Dictionary(dict) => self.write_dictionary(w, dict),
            Object::Stream(stream) => self.write_stream(w, &stream.dict, &stream.content),
            Object::Reference((id, gen)) => {
                let _ = write!(w, "{} {} R", id, gen);
            },
        }
    }

    /// Write a real number, trimming trailing zeros.
    fn write_real(&self, w: &mut Vec<u8>, value: f64) {
        if value.fract() == 0.0 {
            let _ = write!(w, "{}", value as i64);
        } else {
            let formatted = format!("{:.5}", value);
            let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
            w.extend_from_slice(trimmed.as_bytes());
        }
    }

    /// Write a PDF string.
    ///
    /// Literal strings holding non-printable bytes fall back to hex syntax.
    fn write_string(&self, w: &mut Vec<u8>, data: &[u8], format: StringFormat) {
        let is_printable = data
            .iter()
            .all(|&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..=0x7E).contains(&b));

        if matches!(format, StringFormat::Literal) && is_printable {
            w.push(b'(');
            for &byte in data {
                match byte {
                    b'(' => w.extend_from_slice(b"\\("),
                    b')' => w.extend_from_slice(b"\\)"),
                    b'\\' => w.extend_from_slice(b"\\\\"),
                    b'\n' => w.extend_from_slice(b"\\n"),
                    b'\r' => w.extend_from_slice(b"\\r"),
                    b'\t' => w.extend_from_slice(b"\\t"),
                    _ => w.push(byte),
                }
            }
            w.push(b')');
        } else {
            w.push(b'<');
            w.extend_from_slice(crate::utils::to_hex_upper(data).as_bytes());
            w.push(b'>');
        }
    }

    /// Write a PDF name, escaping delimiters and non-regular bytes as `#xx`.
    fn write_name(&self, w: &mut Vec<u8>, name: &[u8]) {
        w.push(b'/');
        for &byte in name {
            match byte {
                b'!'
                | b'"'
                | b'$'..=b'&'
                | b'\''
                | b'*'..=b'.'
                | b'0'..=b'9'
                | b';'
                | b'='
                | b'?'
                | b'@'
                | b'A'..=b'Z'
                | b'^'..=b'z'
                | b'|'
                | b'~' => w.push(byte),
                _ => {
                    let _ = write!(w, "#{:02X}", byte);
                },
            }
        }
    }

    /// Write a PDF array.
    fn write_array(&self, w: &mut Vec<u8>, arr: &[Object]) {
        w.push(b'[');
        for (i, obj) in arr.iter().enumerate() {
            if i > 0 {
                w.push(b' ');
            }
            self.write_object(w, obj);
        }
        w.push(b']');
    }

    /// Write a PDF dictionary, keeping the key order of the source.
    fn write_dictionary(&self, w: &mut Vec<u8>, dict: &Dictionary) {
        w.extend_from_slice(b"<<");
        for (key, value) in dict.iter() {
            if self.compact {
                w.push(b' ');
            } else {
                w.extend_from_slice(b"\n  ");
            }
            self.write_name(w, key);
            w.push(b' ');
            self.write_object(w, value);
        }
        if self.compact {
            w.push(b' ');
        } else if !dict.is_empty() {
            w.push(b'\n');
        }
        w.extend_from_slice(b">>");
    }

    /// Write a PDF stream. `/Length` always reflects `data`.
    fn write_stream(&self, w: &mut Vec<u8>, dict: &Dictionary, data: &[u8]) {
        let mut dict = dict.clone();
        dict.set("Length", Object::Integer(data.len() as i64));
        self.write_dictionary(w, &dict);
        w.extend_from_slice(b"\nstream\n");
        w.extend_from_slice(data);
        w.extend_from_slice(b"\nendstream");
    }
}
