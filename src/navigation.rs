//! Table of contents parsing (EPUB 3 nav document and EPUB 2 NCX)
//!
//! Both parsers flatten the hierarchy into document order and push each
//! entry to a [`TocSink`] as soon as its label and target are known. The
//! nesting depth travels with the entry as `level` (1 = top level).
//!
//! Nav hrefs are resolved against the nav document's own directory; NCX
//! hrefs against the package document's directory.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{ParseError, StorageError};
use crate::metadata::normalise_title;
use crate::path;
use crate::xml::{Element, MarkupHandler, XmlLimits, XmlStream};

/// A table of contents entry as produced by a parser, before it is
/// resolved against the spine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TocDraft {
    /// Display label
    pub title: String,
    /// Normalised archive path of the target, without fragment
    pub href: String,
    /// Fragment identifier within the target, without `#`
    pub anchor: String,
    /// Nesting depth, starting at 1
    pub level: u8,
}

/// A resolved table of contents entry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TocEntry {
    /// Display label
    pub title: String,
    /// Normalised archive path of the target, without fragment
    pub href: String,
    /// Fragment identifier within the target, without `#`
    pub anchor: String,
    /// Nesting depth, starting at 1
    pub level: u8,
    /// Position of the target in the spine, if the href matches one
    pub spine_index: Option<usize>,
}

/// Which document the table of contents came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TocSource {
    /// EPUB 3 XHTML navigation document
    Nav,
    /// EPUB 2 NCX
    Ncx,
}

/// Receiver of table of contents entries, in document order
pub trait TocSink {
    /// Accept the next entry.
    fn push_toc_entry(&mut self, entry: &TocDraft) -> Result<(), StorageError>;
}

impl TocSink for Vec<TocDraft> {
    fn push_toc_entry(&mut self, entry: &TocDraft) -> Result<(), StorageError> {
        self.push(entry.clone());
        Ok(())
    }
}

fn level_of(depth: usize) -> u8 {
    depth.clamp(1, u8::MAX as usize) as u8
}

fn draft(base_dir: &str, href: &str, title: &str, level: u8) -> Option<TocDraft> {
    let (path, anchor) = path::resolve_href(base_dir, href);
    if path.is_empty() {
        log::debug!("[TOC] Skipping entry without document target: {}", href);
        return None;
    }
    Some(TocDraft {
        title: normalise_title(title),
        href: path,
        anchor,
        level,
    })
}

/// Extracts the `epub:type="toc"` list from an XHTML navigation document
pub struct NavHandler<'s> {
    base_dir: String,
    sink: &'s mut dyn TocSink,
    toc_depth: Option<usize>,
    toc_seen: bool,
    list_depth: usize,
    anchor_href: Option<String>,
    label: String,
    count: usize,
}

impl<'s> NavHandler<'s> {
    /// Create a handler for the nav document at `nav_path`
    pub fn new(nav_path: &str, sink: &'s mut dyn TocSink) -> Self {
        Self {
            base_dir: path::base_dir(nav_path).into(),
            sink,
            toc_depth: None,
            toc_seen: false,
            list_depth: 0,
            anchor_href: None,
            label: String::new(),
            count: 0,
        }
    }

    /// Entries pushed so far
    pub fn count(&self) -> usize {
        self.count
    }
}

fn is_toc_nav(element: &Element) -> bool {
    let typed = element
        .attr("epub:type")
        .or_else(|| element.attr_local("type"))
        .is_some_and(|value| value.split_ascii_whitespace().any(|t| t == "toc"));
    typed || element.attr("role") == Some("doc-toc")
}

impl MarkupHandler for NavHandler<'_> {
    fn start(&mut self, element: &Element, depth: usize) -> Result<(), ParseError> {
        let name = element.local_name();
        if self.toc_depth.is_none() {
            if name == "nav" && !self.toc_seen && is_toc_nav(element) {
                self.toc_depth = Some(depth);
                self.toc_seen = true;
            }
            return Ok(());
        }
        match name {
            "ol" | "ul" => self.list_depth += 1,
            "a" => {
                self.anchor_href = element.attr("href").map(String::from);
                self.label.clear();
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, local_name: &str, depth: usize) -> Result<(), ParseError> {
        if self.toc_depth.is_none() {
            return Ok(());
        }
        match local_name {
            "a" => {
                if let Some(href) = self.anchor_href.take() {
                    let level = level_of(self.list_depth);
                    if let Some(entry) = draft(&self.base_dir, &href, &self.label, level) {
                        self.sink.push_toc_entry(&entry)?;
                        self.count += 1;
                    }
                }
            }
            "ol" | "ul" => self.list_depth = self.list_depth.saturating_sub(1),
            "nav" if self.toc_depth == Some(depth) => self.toc_depth = None,
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), ParseError> {
        if self.anchor_href.is_some() {
            self.label.push_str(text);
        }
        Ok(())
    }
}

/// Streaming parser for EPUB 3 navigation documents
pub type NavParser<'s> = XmlStream<NavHandler<'s>>;

/// Create a nav document parser pushing entries into `sink`
pub fn nav_parser<'s>(nav_path: &str, sink: &'s mut dyn TocSink, limits: XmlLimits) -> NavParser<'s> {
    XmlStream::with_limits(NavHandler::new(nav_path, sink), limits)
}

#[derive(Debug, Default)]
struct PendingPoint {
    label: String,
    src: Option<String>,
    label_done: bool,
    emitted: bool,
}

/// Extracts the `navMap` from an NCX document
pub struct NcxHandler<'s> {
    base_dir: String,
    sink: &'s mut dyn TocSink,
    in_nav_map: bool,
    in_label: bool,
    points: Vec<PendingPoint>,
    count: usize,
}

impl<'s> NcxHandler<'s> {
    /// Create a handler resolving hrefs against `base_dir`
    pub fn new(base_dir: &str, sink: &'s mut dyn TocSink) -> Self {
        Self {
            base_dir: base_dir.into(),
            sink,
            in_nav_map: false,
            in_label: false,
            points: Vec::new(),
            count: 0,
        }
    }

    /// Entries pushed so far
    pub fn count(&self) -> usize {
        self.count
    }

    fn emit_top(&mut self, require_label: bool) -> Result<(), ParseError> {
        let level = level_of(self.points.len());
        let Some(point) = self.points.last_mut() else {
            return Ok(());
        };
        if point.emitted || (require_label && !point.label_done) {
            return Ok(());
        }
        let Some(src) = point.src.as_deref() else {
            return Ok(());
        };
        point.emitted = true;
        if let Some(entry) = draft(&self.base_dir, src, &point.label, level) {
            self.sink.push_toc_entry(&entry)?;
            self.count += 1;
        }
        Ok(())
    }
}

impl MarkupHandler for NcxHandler<'_> {
    fn start(&mut self, element: &Element, _depth: usize) -> Result<(), ParseError> {
        match element.local_name() {
            "navMap" => self.in_nav_map = true,
            "navPoint" if self.in_nav_map => {
                // A parent is complete once its first child starts.
                self.emit_top(false)?;
                self.points.push(PendingPoint::default());
            }
            "navLabel" if !self.points.is_empty() => self.in_label = true,
            "content" if !self.points.is_empty() => {
                if let Some(point) = self.points.last_mut() {
                    if point.src.is_none() {
                        point.src = element.attr("src").map(String::from);
                    }
                }
                self.emit_top(true)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, local_name: &str, _depth: usize) -> Result<(), ParseError> {
        match local_name {
            "navLabel" if self.in_label => {
                self.in_label = false;
                if let Some(point) = self.points.last_mut() {
                    point.label_done = true;
                }
                self.emit_top(true)?;
            }
            "navPoint" if self.in_nav_map => {
                self.emit_top(false)?;
                self.points.pop();
            }
            "navMap" => self.in_nav_map = false,
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), ParseError> {
        if self.in_label {
            if let Some(point) = self.points.last_mut() {
                point.label.push_str(text);
            }
        }
        Ok(())
    }
}

/// Streaming parser for NCX documents
pub type NcxParser<'s> = XmlStream<NcxHandler<'s>>;

/// Create an NCX parser pushing entries into `sink`
pub fn ncx_parser<'s>(base_dir: &str, sink: &'s mut dyn TocSink, limits: XmlLimits) -> NcxParser<'s> {
    XmlStream::with_limits(NcxHandler::new(base_dir, sink), limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::ChunkParser;

    fn run<P: ChunkParser>(parser: &mut P, doc: &[u8], chunk_size: usize) -> Result<(), ParseError> {
        parser.setup()?;
        for chunk in doc.chunks(chunk_size) {
            assert_eq!(parser.consume(chunk)?, chunk.len());
        }
        parser.finish()
    }

    fn parse_nav(path: &str, doc: &[u8]) -> Result<Vec<TocDraft>, ParseError> {
        let mut entries: Vec<TocDraft> = Vec::new();
        let mut parser = nav_parser(path, &mut entries, XmlLimits::default());
        run(&mut parser, doc, 1024)?;
        drop(parser);
        Ok(entries)
    }

    fn parse_ncx(base: &str, doc: &[u8], chunk_size: usize) -> Vec<TocDraft> {
        let mut entries: Vec<TocDraft> = Vec::new();
        let mut parser = ncx_parser(base, &mut entries, XmlLimits::default());
        run(&mut parser, doc, chunk_size).unwrap();
        drop(parser);
        entries
    }

    const NAV: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
  <nav epub:type="landmarks"><ol><li><a href="../text/cover.xhtml">Cover</a></li></ol></nav>
  <nav epub:type="toc" id="toc">
    <h1>Contents</h1>
    <ol>
      <li><a href="../text/ch1.xhtml">Chapter <em>One</em></a>
        <ol>
          <li><a href="../text/ch1.xhtml#s1">Section&#160;1.1</a></li>
        </ol>
      </li>
      <li><span>Part Two</span>
        <ol><li><a href="../text/ch2.xhtml">Chapter Two</a></li></ol>
      </li>
    </ol>
  </nav>
</body>
</html>"#;

    #[test]
    fn test_nav_flattens_toc_in_document_order() {
        let entries = parse_nav("OEBPS/nav/toc.xhtml", NAV).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].title, "Chapter One");
        assert_eq!(entries[0].href, "OEBPS/text/ch1.xhtml");
        assert_eq!(entries[0].level, 1);
        assert_eq!(entries[1].href, "OEBPS/text/ch1.xhtml");
        assert_eq!(entries[1].anchor, "s1");
        assert_eq!(entries[1].level, 2);
        assert_eq!(entries[2].title, "Chapter Two");
        assert_eq!(entries[2].level, 2);
    }

    #[test]
    fn test_nav_ignores_landmarks() {
        let entries = parse_nav("OEBPS/nav/toc.xhtml", NAV).unwrap();
        assert!(entries.iter().all(|e| e.title != "Cover"));
    }

    #[test]
    fn test_nav_malformed_markup_is_an_error() {
        let doc = br#"<html><body><nav epub:type="toc"><ol><li><a href="c1.xhtml">One</li></ol></nav></body></html>"#;
        assert!(matches!(parse_nav("nav.xhtml", doc), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_nav_without_toc_yields_nothing() {
        let doc = br#"<html><body><nav epub:type="page-list"><ol><li><a href="p1.xhtml">1</a></li></ol></nav></body></html>"#;
        assert!(parse_nav("nav.xhtml", doc).unwrap().is_empty());
    }

    const NCX: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head><meta name="dtb:uid" content="id"/></head>
  <docTitle><text>Title</text></docTitle>
  <navMap>
    <navPoint id="p1" playOrder="1">
      <navLabel><text>Chapter 1</text></navLabel>
      <content src="text/ch1.xhtml"/>
      <navPoint id="p1-1" playOrder="2">
        <navLabel><text>Section 1.1</text></navLabel>
        <content src="text/ch1.xhtml#s1"/>
      </navPoint>
    </navPoint>
    <navPoint id="p2" playOrder="3">
      <content src="text/ch2.xhtml"/>
      <navLabel><text>Chapter 2</text></navLabel>
    </navPoint>
  </navMap>
  <pageList><pageTarget><navLabel><text>1</text></navLabel><content src="text/ch1.xhtml#p1"/></pageTarget></pageList>
</ncx>"#;

    #[test]
    fn test_ncx_flattens_nav_map() {
        let entries = parse_ncx("OEBPS/", NCX, 1024);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].title, "Chapter 1");
        assert_eq!(entries[0].href, "OEBPS/text/ch1.xhtml");
        assert_eq!(entries[0].level, 1);
        assert_eq!(entries[1].title, "Section 1.1");
        assert_eq!(entries[1].anchor, "s1");
        assert_eq!(entries[1].level, 2);
        assert_eq!(entries[2].title, "Chapter 2");
        assert_eq!(entries[2].level, 1);
    }

    #[test]
    fn test_ncx_chunking_does_not_change_entries() {
        assert_eq!(parse_ncx("OEBPS/", NCX, 1024), parse_ncx("OEBPS/", NCX, 5));
    }

    #[test]
    fn test_ncx_doc_title_is_not_an_entry() {
        let entries = parse_ncx("", NCX, 1024);
        assert!(entries.iter().all(|e| e.title != "Title" && e.title != "1"));
    }
}
