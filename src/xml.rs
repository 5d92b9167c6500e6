//! Chunk-fed XML front-end
//!
//! quick-xml pulls from a reader, while the index builder pushes fixed-size
//! chunks as it streams them out of the archive. [`XmlStream`] bridges the
//! two: it buffers bytes until a complete markup construct has arrived,
//! hands every complete prefix to a fresh quick-xml reader and forwards the
//! resulting events to a [`MarkupHandler`].
//!
//! Element nesting is tracked by the stream itself so that mismatched end
//! tags are detected even when the start tag arrived in an earlier chunk.

extern crate alloc;

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::ParseError;

/// Push-style parser fed by repeated chunks
///
/// `consume` returns the number of bytes accepted. A count below the chunk
/// length means the parser could not make progress and the caller must
/// abort the pass.
pub trait ChunkParser {
    /// Reset state before the first chunk.
    fn setup(&mut self) -> Result<(), ParseError>;

    /// Feed the next chunk.
    fn consume(&mut self, chunk: &[u8]) -> Result<usize, ParseError>;

    /// Flush buffered input after the last chunk.
    fn finish(&mut self) -> Result<(), ParseError>;
}

/// Resource limits for a streaming XML parse
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XmlLimits {
    /// Largest single markup construct (tag, comment, text run) that may be buffered.
    pub max_pending: usize,
    /// Deepest element nesting accepted.
    pub max_depth: usize,
}

impl Default for XmlLimits {
    fn default() -> Self {
        Self {
            max_pending: 16 * 1024,
            max_depth: 256,
        }
    }
}

/// A start (or empty) element with decoded attributes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
}

impl Element {
    /// Qualified element name, e.g. `dc:title`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element name without namespace prefix
    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }

    /// Attribute value by exact qualified key
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value by key ignoring any namespace prefix
    pub fn attr_local(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| local_name(k) == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Strip a namespace prefix from a qualified name
pub fn local_name(name: &str) -> &str {
    match name.rfind(':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// Receiver of markup events
pub trait MarkupHandler {
    /// Called for every start tag; empty elements get a matching `end` call.
    /// `depth` is 1 for the root element.
    fn start(&mut self, element: &Element, depth: usize) -> Result<(), ParseError>;

    /// Called for every end tag with the element's local name.
    fn end(&mut self, _local_name: &str, _depth: usize) -> Result<(), ParseError> {
        Ok(())
    }

    /// Called for character data, including resolved entity references.
    fn text(&mut self, _text: &str) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Incremental XML parser driving a [`MarkupHandler`]
pub struct XmlStream<H> {
    handler: H,
    pending: Vec<u8>,
    scanner: Scanner,
    open: Vec<String>,
    limits: XmlLimits,
}

impl<H: MarkupHandler> XmlStream<H> {
    /// Wrap `handler` with default limits
    pub fn new(handler: H) -> Self {
        Self::with_limits(handler, XmlLimits::default())
    }

    /// Wrap `handler` with explicit limits
    pub fn with_limits(handler: H, limits: XmlLimits) -> Self {
        Self {
            handler,
            pending: Vec::new(),
            scanner: Scanner::default(),
            open: Vec::new(),
            limits,
        }
    }

    /// Borrow the handler to read extracted fields
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Consume the stream, returning the handler
    pub fn into_handler(self) -> H {
        self.handler
    }

    fn flush_complete(&mut self) -> Result<(), ParseError> {
        self.scanner.advance(&self.pending);
        let boundary = self.scanner.boundary;
        if boundary == 0 {
            return Ok(());
        }
        dispatch(
            &self.pending[..boundary],
            &mut self.open,
            self.limits.max_depth,
            &mut self.handler,
        )?;
        self.pending.drain(..boundary);
        self.scanner.drained(boundary);
        Ok(())
    }
}

impl<H: MarkupHandler> ChunkParser for XmlStream<H> {
    fn setup(&mut self) -> Result<(), ParseError> {
        self.pending.clear();
        self.pending.reserve(self.limits.max_pending.min(4096));
        self.scanner = Scanner::default();
        self.open.clear();
        Ok(())
    }

    fn consume(&mut self, chunk: &[u8]) -> Result<usize, ParseError> {
        let mut consumed = 0;
        while consumed < chunk.len() {
            let room = self.limits.max_pending.saturating_sub(self.pending.len());
            if room == 0 {
                log::warn!(
                    "[XML] Markup construct exceeds {} byte buffer",
                    self.limits.max_pending
                );
                break;
            }
            let take = room.min(chunk.len() - consumed);
            self.pending
                .extend_from_slice(&chunk[consumed..consumed + take]);
            consumed += take;
            self.flush_complete()?;
        }
        Ok(consumed)
    }

    fn finish(&mut self) -> Result<(), ParseError> {
        self.flush_complete()?;
        if !self.pending.is_empty() {
            if self.scanner.scanned < self.pending.len() {
                return Err(ParseError::Malformed("unterminated markup at end of input".into()));
            }
            let rest = core::mem::take(&mut self.pending);
            dispatch(&rest, &mut self.open, self.limits.max_depth, &mut self.handler)?;
            self.scanner = Scanner::default();
        }
        if let Some(open) = self.open.last() {
            return Err(ParseError::Malformed(format!("unclosed element <{}>", open)));
        }
        Ok(())
    }
}

/// Tracks how far the pending buffer has been scanned and where the last
/// complete construct ends.
#[derive(Clone, Copy, Debug, Default)]
struct Scanner {
    scanned: usize,
    boundary: usize,
}

impl Scanner {
    fn advance(&mut self, buf: &[u8]) {
        let mut i = self.scanned;
        while i < buf.len() {
            if buf[i] != b'<' {
                i += 1;
                continue;
            }
            match markup_len(&buf[i..]) {
                Some(len) => {
                    i += len;
                    self.boundary = i;
                }
                None => {
                    self.scanned = i;
                    return;
                }
            }
        }
        self.scanned = i;

        // Trailing character data can be released, except a dangling entity
        // reference or a UTF-8 sequence whose remaining bytes are still to come.
        let tail = &buf[self.boundary..];
        let release = match tail.iter().rposition(|&b| b == b'&') {
            Some(amp) if !tail[amp..].contains(&b';') => amp,
            _ => tail.len(),
        };
        self.boundary += complete_utf8_len(&tail[..release]);
    }

    fn drained(&mut self, n: usize) {
        self.scanned -= n;
        self.boundary -= n;
    }
}

/// Length of `text` without a truncated multi-byte character at its end.
/// Invalid sequences are left in place for the decoder to report.
fn complete_utf8_len(text: &[u8]) -> usize {
    match core::str::from_utf8(text) {
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        _ => text.len(),
    }
}

/// Returns `Some(true/false)` once enough bytes are present to decide
/// whether `s` opens with `marker`.
fn opens_with(s: &[u8], marker: &[u8]) -> Option<bool> {
    if s.len() >= marker.len() {
        Some(s.starts_with(marker))
    } else if marker.starts_with(s) {
        None
    } else {
        Some(false)
    }
}

fn find(s: &[u8], from: usize, pattern: &[u8]) -> Option<usize> {
    if s.len() < from {
        return None;
    }
    s[from..]
        .windows(pattern.len())
        .position(|w| w == pattern)
        .map(|p| p + from)
}

/// Length of the complete markup construct at the start of `s`, or `None`
/// if it has not fully arrived yet.
fn markup_len(s: &[u8]) -> Option<usize> {
    if opens_with(s, b"<!--")? {
        return find(s, 4, b"-->").map(|p| p + 3);
    }
    if opens_with(s, b"<![CDATA[")? {
        return find(s, 9, b"]]>").map(|p| p + 3);
    }
    match s.get(1)? {
        b'?' => find(s, 2, b"?>").map(|p| p + 2),
        b'!' => bracketed_len(s),
        _ => tag_len(s),
    }
}

fn tag_len(s: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in s.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => return Some(i + 1),
                _ => {}
            },
        }
    }
    None
}

// DOCTYPE may carry an internal subset in brackets.
fn bracketed_len(s: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    for (i, &b) in s.iter().enumerate().skip(2) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b'>' if depth == 0 => return Some(i + 1),
                _ => {}
            },
        }
    }
    None
}

fn decode_element(
    reader: &Reader<&[u8]>,
    e: &BytesStart<'_>,
) -> Result<Element, ParseError> {
    let name = reader
        .decoder()
        .decode(e.name().as_ref())
        .map_err(|e| ParseError::Malformed(format!("Decode error: {:?}", e)))?
        .to_string();

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ParseError::Malformed(format!("Attr error: {:?}", e)))?;
        let key = reader
            .decoder()
            .decode(attr.key.as_ref())
            .map_err(|e| ParseError::Malformed(format!("Decode error: {:?}", e)))?
            .to_string();
        let raw = reader
            .decoder()
            .decode(&attr.value)
            .map_err(|e| ParseError::Malformed(format!("Decode error: {:?}", e)))?;
        let value = match unescape(&raw) {
            Ok(value) => value.to_string(),
            Err(_) => raw.to_string(),
        };
        attributes.push((key, value));
    }

    Ok(Element { name, attributes })
}

fn resolve_entity(name: &str) -> String {
    match unescape(&format!("&{};", name)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => match name {
            "nbsp" => "\u{a0}".into(),
            "mdash" => "\u{2014}".into(),
            "ndash" => "\u{2013}".into(),
            "hellip" => "\u{2026}".into(),
            "lsquo" => "\u{2018}".into(),
            "rsquo" => "\u{2019}".into(),
            "ldquo" => "\u{201c}".into(),
            "rdquo" => "\u{201d}".into(),
            _ => {
                log::debug!("[XML] Unknown entity &{};", name);
                format!("&{};", name)
            }
        },
    }
}

/// Run quick-xml over a complete prefix of the document
fn dispatch<H: MarkupHandler>(
    bytes: &[u8],
    open: &mut Vec<String>,
    max_depth: usize,
    handler: &mut H,
) -> Result<(), ParseError> {
    let mut reader = Reader::from_reader(bytes);
    {
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
    }

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let element = decode_element(&reader, &e)?;
                if open.len() >= max_depth {
                    return Err(ParseError::LimitExceeded("element depth"));
                }
                open.push(element.name.clone());
                handler.start(&element, open.len())?;
            }
            Ok(Event::Empty(e)) => {
                let element = decode_element(&reader, &e)?;
                let depth = open.len() + 1;
                handler.start(&element, depth)?;
                handler.end(element.local_name(), depth)?;
            }
            Ok(Event::End(e)) => {
                let name = reader
                    .decoder()
                    .decode(e.name().as_ref())
                    .map_err(|e| ParseError::Malformed(format!("Decode error: {:?}", e)))?
                    .to_string();
                let depth = open.len();
                match open.pop() {
                    Some(expected) if expected == name => {
                        handler.end(local_name(&name), depth)?;
                    }
                    Some(expected) => {
                        return Err(ParseError::Malformed(format!(
                            "expected </{}>, found </{}>",
                            expected, name
                        )));
                    }
                    None => {
                        return Err(ParseError::Malformed(format!("unexpected </{}>", name)));
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = reader
                    .decoder()
                    .decode(&e)
                    .map_err(|e| ParseError::Malformed(format!("Decode error: {:?}", e)))?;
                if !text.is_empty() {
                    handler.text(&text)?;
                }
            }
            Ok(Event::CData(e)) => {
                let text = reader
                    .decoder()
                    .decode(&e)
                    .map_err(|e| ParseError::Malformed(format!("Decode error: {:?}", e)))?;
                handler.text(&text)?;
            }
            Ok(Event::GeneralRef(e)) => {
                let entity_name = e
                    .decode()
                    .map_err(|e| ParseError::Malformed(format!("Decode error: {:?}", e)))?;
                handler.text(&resolve_entity(&entity_name))?;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Malformed(format!("XML parse error: {:?}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}
