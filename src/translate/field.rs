//! Path-addressed edits on a raw JSON request body.
//!
//! Paths are dot separated (`messages.3.content`). Numeric segments index
//! arrays, `\.` is a literal dot inside a key, and `-1` appends when setting
//! into an array. Every edit either produces a valid JSON buffer or leaves the
//! previous buffer untouched and returns [`ProxyError::MalformedPayload`].
//!
//! Edits splice only the bytes of the addressed value. Everything else in the
//! document, including escapes serde_json would refuse (lone surrogates) and
//! numbers wider than 64 bits, is carried over byte for byte.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::ops::Range;

/// Nesting limit, matching serde_json's default recursion limit.
const MAX_DEPTH: usize = 128;

/// One JSON object held as bytes for the lifetime of a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    buf: Vec<u8>,
}

impl Payload {
    #[must_use]
    pub fn new(buf: impl Into<Vec<u8>>) -> Self {
        Self { buf: buf.into() }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    /// Value at `path`. Strings are decoded leniently: a lone surrogate escape
    /// reads as U+FFFD.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let segments = parse_path(path)?;
        match self.walk(path, &segments)? {
            Walk::Found { value, .. } => Scanner::at(&self.buf, value.start)
                .value()
                .map(Some)
                .map_err(|reason| ProxyError::malformed(path, reason)),
            Walk::Absent { .. } | Walk::Scalar { .. } => Ok(None),
        }
    }

    /// String value at `path`; absent or non-string reads as `None`.
    pub fn get_str(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .get(path)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Integer view of the value at `path`. Absent or non-numeric reads as 0.
    pub fn count(&self, path: &str) -> Result<i64> {
        Ok(self.get(path)?.as_ref().map_or(0, as_count))
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let segments = parse_path(path)?;
        Ok(matches!(self.walk(path, &segments)?, Walk::Found { .. }))
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        let segments = parse_path(path)?;
        let value = value.into();
        let malformed = |reason: String| ProxyError::malformed(path, reason);

        let (range, text) = match self.walk(path, &segments)? {
            Walk::Found { value: span, .. } => (span, encode(&value, path)?),
            Walk::Scalar { value: span, depth } => {
                if &self.buf[span.clone()] != b"null" {
                    return Err(malformed(format!(
                        "cannot descend into scalar at '{}'",
                        segments[depth]
                    )));
                }
                let nested = build(&segments[depth..], value).map_err(malformed)?;
                (span, encode(&nested, path)?)
            }
            Walk::Absent {
                container,
                depth,
                is_object,
            } => {
                let segment = &segments[depth];
                let nested = build(&segments[depth + 1..], value).map_err(malformed)?;

                let mut text = Vec::new();
                if !container.members.is_empty() {
                    text.push(b',');
                }
                if is_object {
                    text.extend(encode(&Value::String(segment.clone()), path)?);
                    text.push(b':');
                } else {
                    let len = container.members.len();
                    let index = if segment == "-1" {
                        len
                    } else {
                        segment
                            .parse::<usize>()
                            .map_err(|_| malformed(format!("'{segment}' is not an array index")))?
                    };
                    for _ in len..index {
                        text.extend_from_slice(b"null,");
                    }
                }
                text.extend(encode(&nested, path)?);
                (container.close..container.close, text)
            }
        };

        self.buf.splice(range, text);
        Ok(())
    }

    /// Removes the value at `path`. Missing paths are a no-op.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let segments = parse_path(path)?;
        if let Walk::Found {
            parent: Some((container, index)),
            ..
        } = self.walk(path, &segments)?
        {
            let members = &container.members;
            let range = if index > 0 {
                members[index - 1].value.end..members[index].value.end
            } else if let Some(next) = members.get(1) {
                members[0].start..next.start
            } else {
                members[0].start..members[0].value.end
            };
            self.buf.drain(range);
        }
        Ok(())
    }

    /// Rewrites `\u003c` and `\u003e` escapes as literal `<` and `>`.
    pub fn unescape_angle_brackets(&mut self) {
        self.buf = unescape_angle_brackets(&self.buf);
    }

    fn walk(&self, path: &str, segments: &[String]) -> Result<Walk> {
        validate(&self.buf)
            .map_err(|e| format!("invalid JSON: {e}"))
            .and_then(|()| walk(&self.buf, segments))
            .map_err(|reason| ProxyError::malformed(path, reason))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes.to_vec())
    }
}

fn parse_path(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Err(ProxyError::malformed(path, "empty path"));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => current.push('\\'),
            },
            '.' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);

    if segments.iter().any(String::is_empty) {
        return Err(ProxyError::malformed(path, "empty path segment"));
    }
    Ok(segments)
}

/// Byte offsets of one object member or array element.
#[derive(Debug)]
struct Member {
    key: Option<String>,
    /// Start of the key for objects, of the value for arrays.
    start: usize,
    value: Range<usize>,
}

#[derive(Debug)]
struct Container {
    members: Vec<Member>,
    /// Offset of the closing bracket.
    close: usize,
}

/// How far a path got into the document.
#[derive(Debug)]
enum Walk {
    /// Every segment matched.
    Found {
        value: Range<usize>,
        parent: Option<(Container, usize)>,
    },
    /// `segments[depth]` is not present in `container`.
    Absent {
        container: Container,
        depth: usize,
        is_object: bool,
    },
    /// `segments[depth]` would descend into the scalar spanning `value`.
    Scalar { value: Range<usize>, depth: usize },
}

/// Syntax check of the whole buffer.
fn validate(buf: &[u8]) -> std::result::Result<(), String> {
    let mut scanner = Scanner::at(buf, 0);
    scanner.skip_value()?;
    scanner.skip_ws();
    match scanner.peek() {
        None => Ok(()),
        Some(_) => Err(scanner.unexpected("end of input")),
    }
}

fn walk(buf: &[u8], segments: &[String]) -> std::result::Result<Walk, String> {
    let mut span = Scanner::at(buf, 0).skip_value()?;
    let mut parent = None;

    for (depth, segment) in segments.iter().enumerate() {
        let is_object = match buf.get(span.start) {
            Some(b'{') => true,
            Some(b'[') => false,
            _ => return Ok(Walk::Scalar { value: span, depth }),
        };
        let container = Scanner::at(buf, span.start).container()?;
        let slot = if is_object {
            container
                .members
                .iter()
                .position(|m| m.key.as_deref() == Some(segment.as_str()))
        } else {
            segment
                .parse::<usize>()
                .ok()
                .filter(|&i| i < container.members.len())
        };

        match slot {
            Some(i) => {
                span = container.members[i].value.clone();
                parent = Some((container, i));
            }
            None => {
                return Ok(Walk::Absent {
                    container,
                    depth,
                    is_object,
                })
            }
        }
    }

    Ok(Walk::Found {
        value: span,
        parent,
    })
}

/// Minimal JSON reader over a byte slice. Tracks positions only; values are
/// materialised on demand by [`Scanner::value`].
struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Scanner<'a> {
    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos, depth: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn unexpected(&self, wanted: &str) -> String {
        match self.peek() {
            Some(b) => format!(
                "expected {wanted} at byte {}, found '{}'",
                self.pos,
                char::from(b).escape_default()
            ),
            None => format!("expected {wanted}, found end of input"),
        }
    }

    fn eat(&mut self, byte: u8) -> std::result::Result<(), String> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", char::from(byte))))
        }
    }

    fn skip_value(&mut self) -> std::result::Result<Range<usize>, String> {
        self.skip_ws();
        let start = self.pos;
        match self.peek() {
            Some(b'{' | b'[') => {
                self.container()?;
            }
            Some(b'"') => self.skip_string()?,
            Some(b't') => self.literal(b"true")?,
            Some(b'f') => self.literal(b"false")?,
            Some(b'n') => self.literal(b"null")?,
            Some(b'-' | b'0'..=b'9') => self.skip_number()?,
            _ => return Err(self.unexpected("a JSON value")),
        }
        Ok(start..self.pos)
    }

    fn container(&mut self) -> std::result::Result<Container, String> {
        self.skip_ws();
        let (close, is_object) = match self.peek() {
            Some(b'{') => (b'}', true),
            Some(b'[') => (b']', false),
            _ => return Err(self.unexpected("an object or array")),
        };
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("nesting deeper than {MAX_DEPTH} at byte {}", self.pos));
        }
        self.pos += 1;

        let mut members = Vec::new();
        self.skip_ws();
        if self.peek() != Some(close) {
            loop {
                self.skip_ws();
                let start = self.pos;
                let key = if is_object {
                    let key = self.string()?;
                    self.eat(b':')?;
                    Some(key)
                } else {
                    None
                };
                let value = self.skip_value()?;
                members.push(Member { key, start, value });

                self.skip_ws();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b) if b == close => break,
                    _ => return Err(self.unexpected(&format!("',' or '{}'", char::from(close)))),
                }
            }
        }

        let close_at = self.pos;
        self.pos += 1;
        self.depth -= 1;
        Ok(Container {
            members,
            close: close_at,
        })
    }

    fn literal(&mut self, text: &[u8]) -> std::result::Result<(), String> {
        if self.buf[self.pos..].starts_with(text) {
            self.pos += text.len();
            Ok(())
        } else {
            Err(self.unexpected(&String::from_utf8_lossy(text)))
        }
    }

    fn digits(&mut self) -> bool {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn skip_number(&mut self) -> std::result::Result<(), String> {
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        match self.peek() {
            Some(b'0') => self.pos += 1,
            Some(b'1'..=b'9') => {
                self.digits();
            }
            _ => return Err(self.unexpected("a digit")),
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            if !self.digits() {
                return Err(self.unexpected("a fraction digit"));
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !self.digits() {
                return Err(self.unexpected("an exponent digit"));
            }
        }
        Ok(())
    }

    fn hex4(&mut self) -> std::result::Result<u16, String> {
        let unit = self
            .buf
            .get(self.pos..self.pos + 4)
            .filter(|d| d.iter().all(u8::is_ascii_hexdigit))
            .and_then(|d| std::str::from_utf8(d).ok())
            .and_then(|d| u16::from_str_radix(d, 16).ok())
            .ok_or_else(|| format!("invalid \\u escape at byte {}", self.pos))?;
        self.pos += 4;
        Ok(unit)
    }

    fn skip_string(&mut self) -> std::result::Result<(), String> {
        self.pos += 1;
        loop {
            match self.peek() {
                None => return Err("unterminated string".to_string()),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'u') => {
                            self.pos += 1;
                            self.hex4()?;
                        }
                        Some(b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't') => self.pos += 1,
                        _ => return Err(self.unexpected("an escape character")),
                    }
                }
                Some(0x00..=0x1f) => return Err(self.unexpected("a string character")),
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Decode a string. Unpaired surrogates become U+FFFD and invalid UTF-8 is
    /// replaced, the same way Go's JSON readers treat them.
    fn string(&mut self) -> std::result::Result<String, String> {
        self.skip_ws();
        if self.peek() != Some(b'"') {
            return Err(self.unexpected("a string"));
        }
        self.pos += 1;

        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err("unterminated string".to_string()),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let c = self.escape()?;
                    let mut utf8 = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                }
                Some(0x00..=0x1f) => return Err(self.unexpected("a string character")),
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn escape(&mut self) -> std::result::Result<char, String> {
        let c = match self.peek() {
            Some(b'"') => '"',
            Some(b'\\') => '\\',
            Some(b'/') => '/',
            Some(b'b') => '\u{8}',
            Some(b'f') => '\u{c}',
            Some(b'n') => '\n',
            Some(b'r') => '\r',
            Some(b't') => '\t',
            Some(b'u') => {
                self.pos += 1;
                return self.unicode_escape();
            }
            _ => return Err(self.unexpected("an escape character")),
        };
        self.pos += 1;
        Ok(c)
    }

    fn unicode_escape(&mut self) -> std::result::Result<char, String> {
        let unit = u32::from(self.hex4()?);
        if (0xD800..0xDC00).contains(&unit) && self.buf[self.pos..].starts_with(b"\\u") {
            let resume = self.pos;
            self.pos += 2;
            let low = u32::from(self.hex4()?);
            if (0xDC00..0xE000).contains(&low) {
                let code = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                return Ok(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            // Not a low surrogate; decode it on its own next time round.
            self.pos = resume;
        }
        Ok(char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    fn value(&mut self) -> std::result::Result<Value, String> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') => {
                let container = self.container()?;
                let mut map = Map::new();
                for member in container.members {
                    let value = Scanner::at(self.buf, member.value.start).value()?;
                    map.insert(member.key.unwrap_or_default(), value);
                }
                Ok(Value::Object(map))
            }
            Some(b'[') => {
                let container = self.container()?;
                container
                    .members
                    .iter()
                    .map(|member| Scanner::at(self.buf, member.value.start).value())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            Some(b'"') => self.string().map(Value::String),
            _ => {
                let span = self.skip_value()?;
                serde_json::from_slice(&self.buf[span]).map_err(|e| e.to_string())
            }
        }
    }
}

/// Fresh value holding `value` at `segments`, creating containers as needed.
fn build(segments: &[String], value: Value) -> std::result::Result<Value, String> {
    let mut node = Value::Null;
    set_in(&mut node, segments, value)?;
    Ok(node)
}

fn is_index(segment: &str) -> bool {
    segment == "-1" || segment.parse::<usize>().is_ok()
}

fn container_for(next_segment: &str) -> Value {
    if is_index(next_segment) {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

fn set_in(node: &mut Value, segments: &[String], value: Value) -> std::result::Result<(), String> {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return Ok(());
    };

    if node.is_null() {
        *node = container_for(head);
    }

    match node {
        Value::Object(map) => {
            let child = map
                .entry(head.clone())
                .or_insert(Value::Null);
            set_in(child, rest, value)
        }
        Value::Array(items) => {
            let index = if head == "-1" {
                items.len()
            } else {
                head.parse::<usize>()
                    .map_err(|_| format!("'{head}' is not an array index"))?
            };
            while items.len() <= index {
                items.push(Value::Null);
            }
            set_in(&mut items[index], rest, value)
        }
        _ => Err(format!("cannot descend into scalar at '{head}'")),
    }
}

fn encode(value: &Value, path: &str) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ProxyError::malformed(path, e.to_string()))
}

/// Loose integer reading: numbers truncate, numeric strings parse, `true` is 1.
#[must_use]
pub fn as_count(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map_or(0, |f| f as i64),
        Value::Bool(true) => 1,
        _ => 0,
    }
}

#[must_use]
pub fn unescape_angle_brackets(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != b'\\' {
            out.push(buf[i]);
            i += 1;
            continue;
        }
        match buf.get(i + 1..i + 6) {
            Some(esc) if esc.eq_ignore_ascii_case(b"u003c") => {
                out.push(b'<');
                i += 6;
            }
            Some(esc) if esc.eq_ignore_ascii_case(b"u003e") => {
                out.push(b'>');
                i += 6;
            }
            _ => {
                // Keep the escape pair intact so `\\u003c` stays a literal backslash.
                out.extend_from_slice(&buf[i..(i + 2).min(buf.len())]);
                i += 2;
            }
        }
    }
    out
}
