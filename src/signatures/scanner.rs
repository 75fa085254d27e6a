//! Token-level scan for signature markers.
//!
//! Markers only count outside literal strings, comments and stream data, so
//! text a signer controls (a reason, a stamp line) never reads as a
//! `/ByteRange` or `/Contents` entry.
//!
//! This is a lexer, not a parser: it tracks dictionary nesting and the key
//! preceding each value, which is enough to tie a `/ByteRange` array and a
//! `/Contents` hex string to the dictionary that holds them.

use std::ops::Range;

use super::byterange::ByteRange;

/// A dictionary holding both a `/ByteRange` array and a `/Contents` hex string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSlot {
    /// Offset of the dictionary's `<<`
    pub dict_start: usize,
    /// The ByteRange, or `None` when the array is not four non-negative integers
    pub byte_range: Option<ByteRange>,
    /// Span of the `/Contents` hex string, including `<` and `>`
    pub contents: Range<usize>,
}

/// Everything the scan found, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markers {
    /// Every well-formed `/ByteRange` array, inside a dictionary or not
    pub byte_ranges: Vec<ByteRange>,
    /// Signature dictionaries
    pub slots: Vec<SignatureSlot>,
    /// A `/SubFilter` key followed by a name
    pub has_sub_filter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    DictOpen,
    DictClose,
    ArrayOpen,
    ArrayClose,
    Name(&'a [u8]),
    Number(&'a [u8]),
    HexString,
    LiteralString,
    Keyword(&'a [u8]),
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b'\0' | b'\t' | b'\n' | b'\x0C' | b'\r' | b' ')
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

fn is_number(word: &[u8]) -> bool {
    let digits = word.strip_prefix(b"+").or_else(|| word.strip_prefix(b"-")).unwrap_or(word);
    digits.iter().any(u8::is_ascii_digit)
        && digits.iter().all(|b| b.is_ascii_digit() || *b == b'.')
}

/// Non-negative integer that fits a `usize`.
fn parse_offset(raw: &[u8]) -> Option<usize> {
    if !raw.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn find(data: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    data.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

struct Lexer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.data.get(self.pos + ahead).copied()
    }

    fn regular_end(&self, from: usize) -> usize {
        self.data[from..]
            .iter()
            .position(|&b| is_whitespace(b) || is_delimiter(b))
            .map_or(self.data.len(), |p| from + p)
    }

    fn next_token(&mut self) -> Option<(Range<usize>, Token<'a>)> {
        loop {
            let start = self.pos;
            let b = *self.data.get(start)?;
            let token = match b {
                b if is_whitespace(b) => {
                    self.pos += 1;
                    continue;
                },
                b'%' => {
                    self.pos = self.data[start..]
                        .iter()
                        .position(|&b| b == b'\n' || b == b'\r')
                        .map_or(self.data.len(), |p| start + p);
                    continue;
                },
                b'<' if self.peek(1) == Some(b'<') => {
                    self.pos += 2;
                    Token::DictOpen
                },
                b'<' => {
                    self.pos = find(self.data, start + 1, b">").map_or(self.data.len(), |end| end + 1);
                    Token::HexString
                },
                b'>' if self.peek(1) == Some(b'>') => {
                    self.pos += 2;
                    Token::DictClose
                },
                b'[' => {
                    self.pos += 1;
                    Token::ArrayOpen
                },
                b']' => {
                    self.pos += 1;
                    Token::ArrayClose
                },
                b'(' => {
                    self.skip_literal_string();
                    Token::LiteralString
                },
                b'/' => {
                    let end = self.regular_end(start + 1);
                    self.pos = end;
                    Token::Name(&self.data[start + 1..end])
                },
                b if is_delimiter(b) => {
                    self.pos += 1;
                    continue;
                },
                _ => {
                    let end = self.regular_end(start);
                    self.pos = end;
                    let word = &self.data[start..end];
                    if is_number(word) {
                        Token::Number(word)
                    } else {
                        Token::Keyword(word)
                    }
                },
            };
            return Some((start..self.pos, token));
        }
    }

    /// Skip a balanced `( ... )` string, honoring backslash escapes.
    fn skip_literal_string(&mut self) {
        let mut depth = 0usize;
        while let Some(&b) = self.data.get(self.pos) {
            self.pos += 1;
            match b {
                b'\\' => self.pos += 1,
                b'(' => depth += 1,
                b')' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                },
                _ => {},
            }
        }
        self.pos = self.pos.min(self.data.len());
    }

    /// Skip stream data after the `stream` keyword.
    ///
    /// A direct `/Length` is trusted when `endstream` follows it; otherwise
    /// the data ends at the next `endstream`.
    fn skip_stream(&mut self, length: Option<usize>) {
        if self.data[self.pos..].starts_with(b"\r\n") {
            self.pos += 2;
        } else if matches!(self.peek(0), Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
        let data_start = self.pos;

        if let Some(end) = length
            .and_then(|len| data_start.checked_add(len))
            .filter(|&end| end <= self.data.len())
        {
            let rest = &self.data[end..];
            let ws = rest.iter().take_while(|&&b| is_whitespace(b)).count();
            if rest[ws..].starts_with(b"endstream") {
                self.pos = end + ws;
                return;
            }
        }
        self.pos = find(self.data, data_start, b"endstream").unwrap_or(self.data.len());
    }
}

#[derive(Debug, Default)]
struct Frame<'a> {
    start: usize,
    /// Name token immediately before the current one
    key: Option<&'a [u8]>,
    byte_range: Option<Option<ByteRange>>,
    contents: Option<Range<usize>>,
    length: Option<usize>,
    /// `/Length n` was just read; a following number makes it `n g R`
    length_open: bool,
}

impl Frame<'_> {
    fn at(start: usize) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }
}

/// Scan `data` for signature markers.
pub fn scan_markers(data: &[u8]) -> Markers {
    let mut lexer = Lexer::new(data);
    let mut markers = Markers::default();
    // The bottom frame collects markers outside any dictionary
    let mut frames = vec![Frame::at(0)];
    let mut byte_range_values: Option<Vec<Option<usize>>> = None;
    let mut stream_length: Option<usize> = None;

    while let Some((span, token)) = lexer.next_token() {
        if let Some(values) = byte_range_values.as_mut() {
            match token {
                Token::Number(raw) => {
                    values.push(parse_offset(raw));
                    continue;
                },
                Token::ArrayClose => {
                    let byte_range = match values[..] {
                        [Some(s1), Some(l1), Some(s2), Some(l2)] => {
                            Some(ByteRange::new(s1, l1, s2, l2))
                        },
                        _ => None,
                    };
                    markers.byte_ranges.extend(byte_range);
                    if let Some(frame) = frames.last_mut() {
                        frame.byte_range = Some(byte_range);
                    }
                    byte_range_values = None;
                    continue;
                },
                _ => byte_range_values = None,
            }
        }

        let length = stream_length.take();
        match token {
            Token::DictOpen => {
                frames.push(Frame::at(span.start));
                continue;
            },
            Token::DictClose => {
                if frames.len() > 1 {
                    if let Some(closed) = frames.pop() {
                        stream_length = closed.length;
                        if let (Some(byte_range), Some(contents)) = (closed.byte_range, closed.contents)
                        {
                            markers.slots.push(SignatureSlot {
                                dict_start: closed.start,
                                byte_range,
                                contents,
                            });
                        }
                    }
                }
                if let Some(parent) = frames.last_mut() {
                    parent.key = None;
                }
                continue;
            },
            Token::Keyword(b"stream") => {
                lexer.skip_stream(length);
                continue;
            },
            _ => {},
        }

        let Some(frame) = frames.last_mut() else {
            continue;
        };
        if frame.length_open {
            frame.length_open = false;
            if matches!(token, Token::Number(_)) {
                frame.length = None;
            }
        }
        match (frame.key.take(), token) {
            (Some(b"ByteRange"), Token::ArrayOpen) => byte_range_values = Some(Vec::with_capacity(4)),
            (Some(b"Contents"), Token::HexString) => frame.contents = Some(span),
            (Some(b"SubFilter"), Token::Name(_)) => markers.has_sub_filter = true,
            (Some(b"Length"), Token::Number(raw)) => {
                frame.length = parse_offset(raw);
                frame.length_open = true;
            },
            (_, Token::Name(name)) => frame.key = Some(name),
            _ => {},
        }
    }
    markers
}
