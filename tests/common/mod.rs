//! Shared fixtures: in-memory EPUB archives, ZIP bytes and collaborator fakes.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use epub_index::assets::ConversionMode;
use epub_index::bitmap::write_cross_marker;
use epub_index::{
    Archive, ByteSink, ByteSource, ChunkSink, IndexError, MemoryArchive, RasterConverter,
    RasterError,
};

pub const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Package document with three chapters, a nav, an NCX and one stylesheet.
///
/// `{COVER}` is replaced with extra manifest items.
const OPF_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:1</dc:identifier>
    <dc:title>The Three Chapters</dc:title>
    <dc:creator>A. N. Author</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="c1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="c3" href="text/ch3.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="styles/book.css" media-type="text/css"/>
    {COVER}
  </manifest>
  <spine toc="ncx">
    <itemref idref="c1"/>
    <itemref idref="c2"/>
    <itemref idref="c3"/>
  </spine>
  <guide>
    <reference type="text" href="text/ch2.xhtml" title="Start"/>
  </guide>
</package>"#;

pub const NAV: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
  <nav epub:type="toc"><ol>
    <li><a href="text/ch1.xhtml">Chapter One</a></li>
    <li><a href="text/ch2.xhtml">Chapter Two</a>
      <ol><li><a href="text/ch2.xhtml#part">Part of Two</a></li></ol>
    </li>
    <li><a href="text/ch3.xhtml">Chapter Three</a></li>
  </ol></nav>
</body>
</html>"#;

/// Nav document with a mismatched closing tag.
pub const MALFORMED_NAV: &str = r#"<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body><nav epub:type="toc"><ol>
  <li><a href="text/ch1.xhtml">Chapter One</a></li>
  <li><a href="text/ch2.xhtml">Chapter Two</a></p>
</ol></nav></body></html>"#;

pub const NCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="n1" playOrder="1"><navLabel><text>One</text></navLabel><content src="text/ch1.xhtml"/></navPoint>
    <navPoint id="n2" playOrder="2"><navLabel><text>Two</text></navLabel><content src="text/ch2.xhtml"/>
      <navPoint id="n3" playOrder="3"><navLabel><text>Two, first half</text></navLabel><content src="text/ch2.xhtml#a"/></navPoint>
      <navPoint id="n4" playOrder="4"><navLabel><text>Two, second half</text></navLabel><content src="text/ch2.xhtml#b"/></navPoint>
    </navPoint>
    <navPoint id="n5" playOrder="5"><navLabel><text>Three</text></navLabel><content src="text/ch3.xhtml"/></navPoint>
  </navMap>
</ncx>"#;

pub const CSS: &str = "p { text-indent: 1em } h1 { text-align: center }";

/// Chapter sizes used by every fixture book.
pub const CHAPTER_SIZES: [usize; 3] = [1000, 2000, 500];

pub fn opf(cover_items: &str) -> String {
    OPF_TEMPLATE.replace("{COVER}", cover_items)
}

/// Entries of the standard fixture book with the given nav and extra manifest items.
pub fn book_entries(nav: &str, cover_items: &str) -> Vec<(String, Vec<u8>)> {
    let mut entries = vec![
        ("mimetype".to_string(), b"application/epub+zip".to_vec()),
        ("META-INF/container.xml".to_string(), CONTAINER.as_bytes().to_vec()),
        ("OEBPS/content.opf".to_string(), opf(cover_items).into_bytes()),
        ("OEBPS/nav.xhtml".to_string(), nav.as_bytes().to_vec()),
        ("OEBPS/toc.ncx".to_string(), NCX.as_bytes().to_vec()),
        ("OEBPS/styles/book.css".to_string(), CSS.as_bytes().to_vec()),
    ];
    for (i, size) in CHAPTER_SIZES.iter().enumerate() {
        entries.push((format!("OEBPS/text/ch{}.xhtml", i + 1), vec![b'x'; *size]));
    }
    entries
}

pub fn memory_book(nav: &str, cover_items: &str) -> MemoryArchive {
    let mut archive = MemoryArchive::new();
    for (path, content) in book_entries(nav, cover_items) {
        archive.insert(&path, content);
    }
    archive
}

/// Minimal JPEG-looking payload (SOI marker plus filler).
pub fn jpeg_bytes() -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0];
    data.extend_from_slice(&[0u8; 60]);
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// Build ZIP bytes; entries flagged `true` are DEFLATE-compressed.
pub fn build_zip(files: &[(&str, &[u8], bool)]) -> Vec<u8> {
    let mut zip = Vec::new();
    let mut central = Vec::new();

    for (name, content, deflate) in files {
        let name_bytes = name.as_bytes();
        let crc = crc32fast::hash(content);
        let (method, data) = if *deflate {
            (8u16, miniz_oxide::deflate::compress_to_vec(content, 6))
        } else {
            (0u16, content.to_vec())
        };
        let local_offset = zip.len() as u32;

        zip.extend_from_slice(&0x04034b50u32.to_le_bytes());
        zip.extend_from_slice(&20u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&method.to_le_bytes());
        zip.extend_from_slice(&0u32.to_le_bytes());
        zip.extend_from_slice(&crc.to_le_bytes());
        zip.extend_from_slice(&(data.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(content.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(name_bytes);
        zip.extend_from_slice(&data);

        central.extend_from_slice(&0x02014b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&method.to_le_bytes());
        central.extend_from_slice(&0u32.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(content.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u32.to_le_bytes());
        central.extend_from_slice(&local_offset.to_le_bytes());
        central.extend_from_slice(name_bytes);
    }

    let cd_offset = zip.len() as u32;
    let cd_size = central.len() as u32;
    zip.extend_from_slice(&central);
    zip.extend_from_slice(&0x06054b50u32.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip.extend_from_slice(&(files.len() as u16).to_le_bytes());
    zip.extend_from_slice(&(files.len() as u16).to_le_bytes());
    zip.extend_from_slice(&cd_size.to_le_bytes());
    zip.extend_from_slice(&cd_offset.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip
}

/// ZIP bytes of the standard fixture book, chapters deflated.
pub fn zip_book(nav: &str, extra: &[(&str, &[u8])], cover_items: &str) -> Vec<u8> {
    let entries = book_entries(nav, cover_items);
    let mut files: Vec<(&str, &[u8], bool)> = entries
        .iter()
        .map(|(path, content)| (path.as_str(), content.as_slice(), path != "mimetype"))
        .collect();
    for (path, content) in extra {
        files.push((*path, *content, false));
    }
    build_zip(&files)
}

/// Archive wrapper counting how many entries were streamed
pub struct CountingArchive<A> {
    pub inner: A,
    pub streams: Rc<Cell<usize>>,
}

impl<A: Archive> CountingArchive<A> {
    pub fn new(inner: A) -> (Self, Rc<Cell<usize>>) {
        let streams = Rc::new(Cell::new(0));
        (
            Self {
                inner,
                streams: Rc::clone(&streams),
            },
            streams,
        )
    }
}

impl<A: Archive> Archive for CountingArchive<A> {
    fn size_of(&self, path: &str) -> Option<usize> {
        self.inner.size_of(path)
    }

    fn stream_to(
        &mut self,
        path: &str,
        sink: &mut dyn ChunkSink,
        chunk_size: usize,
    ) -> Result<usize, IndexError> {
        self.streams.set(self.streams.get() + 1);
        self.inner.stream_to(path, sink, chunk_size)
    }
}

/// Converter that accepts anything starting with the JPEG SOI marker
#[derive(Default)]
pub struct FakeConverter {
    pub calls: usize,
    pub fail: bool,
    pub last_mode: Option<ConversionMode>,
}

impl FakeConverter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl RasterConverter for FakeConverter {
    fn convert(
        &mut self,
        source: &mut dyn ByteSource,
        dest: &mut dyn ByteSink,
        mode: ConversionMode,
    ) -> Result<(), RasterError> {
        self.calls += 1;
        self.last_mode = Some(mode);
        let mut magic = [0u8; 2];
        source
            .read_exact(&mut magic)
            .map_err(|e| RasterError(e.to_string()))?;
        if self.fail || magic != [0xFF, 0xD8] {
            return Err(RasterError("unsupported JPEG".into()));
        }
        let (width, height) = match mode {
            ConversionMode::Cover { .. } => (48, 80),
            ConversionMode::Thumbnail { width, height } => (width, height),
        };
        write_cross_marker(dest, width, height, 0).map_err(|e| RasterError(e.to_string()))
    }
}
