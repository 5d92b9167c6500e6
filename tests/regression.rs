//! Regression tests for behavior that broke or is easy to break
//!
//! Each test pins one observable behavior of the public API.

mod common;

use common::{memory_book, NAV, NCX};
use epub_index::format::BOOK_BIN;
use epub_index::xml::XmlLimits;
use epub_index::{
    build_index, BookIndex, IndexError, IndexOptions, MemStorage, MemoryArchive, Storage,
    TocSource, ZipError, ZipErrorKind,
};

fn build_with(archive: &mut MemoryArchive, options: &IndexOptions) -> (MemStorage, Result<(), IndexError>) {
    let storage = MemStorage::new();
    storage.create_dir_all("cache").unwrap();
    let result = build_index(archive, &storage, "cache", "/b.epub", options).map(|_| ());
    (storage, result)
}

// =============================================================================
// Chunk boundaries
// =============================================================================

#[test]
fn index_bytes_do_not_depend_on_chunk_size() {
    let (reference, result) = build_with(&mut memory_book(NAV, ""), &IndexOptions::default());
    result.unwrap();
    let expected = reference.get(&format!("cache/{}", BOOK_BIN)).unwrap();

    for chunk in [1usize, 3, 17, 4096] {
        let options = IndexOptions::default().with_chunk_size(chunk);
        let (storage, result) = build_with(&mut memory_book(NAV, ""), &options);
        result.unwrap_or_else(|e| panic!("chunk {} failed: {}", chunk, e));
        assert_eq!(
            storage.get(&format!("cache/{}", BOOK_BIN)).unwrap(),
            expected,
            "chunk size {} changed the index",
            chunk
        );
    }
}

#[test]
fn entity_split_across_chunks_is_decoded() {
    let mut archive = memory_book(NAV, "");
    let opf = common::opf("").replace("The Three Chapters", "Barnes &amp; Noble &#8212; Tales");
    archive.insert("OEBPS/content.opf", opf);
    let (storage, result) = build_with(&mut archive, &IndexOptions::default().with_chunk_size(2));
    result.unwrap();
    let index = BookIndex::load(&storage, "cache", Some("/b.epub")).unwrap();
    assert_eq!(index.metadata().title, "Barnes & Noble \u{2014} Tales");
}

const ACCENTED_TITLE: &str = "Les Misérables \u{b7} \u{5e8f}\u{7ae0}";
const ACCENTED_AUTHOR: &str = "Émile Zoë Brontë";

/// Fixture book with non-ASCII metadata and TOC labels; an empty `nav`
/// leaves only the NCX.
fn accented_book(nav: &str) -> MemoryArchive {
    let mut archive = memory_book(nav, "");
    let opf = common::opf("")
        .replace("The Three Chapters", ACCENTED_TITLE)
        .replace("A. N. Author", ACCENTED_AUTHOR);
    archive.insert("OEBPS/content.opf", opf);
    let ncx = NCX
        .replace(">One<", ">Première<")
        .replace(">Two, first half<", ">Deuxième, moitié \u{2160}<")
        .replace(">Three<", ">\u{7b2c}\u{4e09}\u{7ae0}<");
    archive.insert("OEBPS/toc.ncx", ncx);
    archive
}

fn accented_nav() -> String {
    NAV.replace("Chapter One", "Chapitre un \u{2014} été")
        .replace("Part of Two", "Partie \u{e0} deux")
        .replace("Chapter Three", "\u{7b2c}\u{4e09}\u{7ae0} \u{1f4d6}")
}

fn check_labels(storage: &MemStorage, expected: &[(usize, &str)]) {
    let index = BookIndex::load(storage, "cache", Some("/b.epub")).unwrap();
    assert_eq!(index.metadata().title, ACCENTED_TITLE);
    assert_eq!(index.metadata().author, ACCENTED_AUTHOR);
    for (i, title) in expected {
        assert_eq!(index.toc()[*i].title, *title);
    }
}

#[test]
fn non_ascii_index_bytes_do_not_depend_on_chunk_size() {
    let nav = accented_nav();
    let nav_labels = [
        (0, "Chapitre un \u{2014} été"),
        (2, "Partie \u{e0} deux"),
        (3, "\u{7b2c}\u{4e09}\u{7ae0} \u{1f4d6}"),
    ];
    let ncx_labels = [
        (0, "Première"),
        (2, "Deuxième, moitié \u{2160}"),
        (4, "\u{7b2c}\u{4e09}\u{7ae0}"),
    ];

    for (nav, source, labels) in [
        (nav.as_str(), TocSource::Nav, &nav_labels),
        ("", TocSource::Ncx, &ncx_labels),
    ] {
        let mut expected: Option<Vec<u8>> = None;
        for chunk in (1usize..=8).chain([17, 1024]) {
            let storage = MemStorage::new();
            storage.create_dir_all("cache").unwrap();
            let options = IndexOptions::default().with_chunk_size(chunk);
            let report = build_index(&mut accented_book(nav), &storage, "cache", "/b.epub", &options)
                .unwrap_or_else(|e| panic!("chunk {} failed: {}", chunk, e));
            assert_eq!(report.toc_source, Some(source), "chunk size {}", chunk);
            check_labels(&storage, labels);

            let bytes = storage.get(&format!("cache/{}", BOOK_BIN)).unwrap();
            match &expected {
                Some(first) => assert_eq!(&bytes, first, "chunk size {} changed the index", chunk),
                None => expected = Some(bytes),
            }
        }
    }
}

#[test]
fn accented_title_across_default_read_boundary() {
    let opf = common::opf("");
    let start = opf.find("The Three Chapters").unwrap();
    let chunk = IndexOptions::default().opf_chunk;
    // The two bytes of the first "é" sit on either side of the first read.
    let title = format!("{}é tail", "x".repeat(chunk - 1 - start));
    let doc = opf.replace("The Three Chapters", &title);
    assert_eq!(doc.as_bytes()[chunk - 1], 0xC3);
    let mut archive = memory_book(NAV, "");
    archive.insert("OEBPS/content.opf", doc);

    let (storage, result) = build_with(&mut archive, &IndexOptions::default());
    result.unwrap();
    let index = BookIndex::load(&storage, "cache", Some("/b.epub")).unwrap();
    assert_eq!(index.metadata().title, title);
}

// =============================================================================
// Parser limits
// =============================================================================

#[test]
fn oversized_nav_tag_falls_back_instead_of_failing() {
    let mut archive = memory_book(NAV, "");
    let huge = format!(r#"<a title="{}" href="text/ch1.xhtml">"#, "x".repeat(8 * 1024));
    archive.insert("OEBPS/nav.xhtml", NAV.replace(r#"<a href="text/ch1.xhtml">"#, &huge));
    let limits = XmlLimits {
        max_pending: 2048,
        ..XmlLimits::default()
    };
    let options = IndexOptions::default().with_xml_limits(limits);
    let storage = MemStorage::new();
    storage.create_dir_all("cache").unwrap();
    let report = build_index(&mut archive, &storage, "cache", "/b.epub", &options).unwrap();
    assert_eq!(report.toc_source, Some(TocSource::Ncx));
    assert_eq!(report.toc_count, 5);
}

// =============================================================================
// Error types
// =============================================================================

#[test]
fn index_error_implements_std_error() {
    let err: Box<dyn std::error::Error> = Box::new(IndexError::TocUnavailable);
    assert!(!err.to_string().is_empty());
}

#[test]
fn zip_error_alias_matches_kind() {
    let kind: ZipErrorKind = ZipError::CrcMismatch;
    let err: IndexError = kind.into();
    assert_eq!(err, IndexError::Zip(ZipErrorKind::CrcMismatch));
    assert!(err.to_string().to_lowercase().contains("crc"));
}

#[test]
fn missing_index_is_not_found_not_corrupt() {
    let storage = MemStorage::new();
    assert_eq!(
        BookIndex::load(&storage, "cache/none", None).unwrap_err(),
        IndexError::NotFound
    );
}
