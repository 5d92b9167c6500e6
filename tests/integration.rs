//! Integration tests for epub-index
//!
//! Every test builds its fixture book in memory (see `common`); the ZIP
//! tests write real archives into a temporary directory.

mod common;

use std::io::Cursor;

use common::{
    jpeg_bytes, memory_book, zip_book, CountingArchive, FakeConverter, CHAPTER_SIZES,
    MALFORMED_NAV, NAV,
};
use epub_index::assets::ConversionMode;
use epub_index::bitmap::is_valid_bitmap;
use epub_index::format::{BOOK_BIN, SPINE_SCRATCH, TOC_SCRATCH};
use epub_index::{
    build_index, AssetOutcome, Book, BookIndex, FsStorage, IndexError, IndexOptions, IndexState,
    LoadOptions, MemStorage, Storage, TocSource, ZipArchive,
};

const SOURCE: &str = "/books/three.epub";
const CACHE_ROOT: &str = ".sd/cache";

fn opened(storage: &MemStorage) -> Book<epub_index::MemoryArchive, MemStorage> {
    let mut book = Book::new(memory_book(NAV, ""), storage.clone(), SOURCE, CACHE_ROOT);
    book.load(LoadOptions::default()).expect("fixture book should index");
    book
}

// -- Index build tests --------------------------------------------------------

#[test]
fn test_cumulative_sizes_and_progress() {
    let storage = MemStorage::new();
    let book = opened(&storage);

    assert_eq!(book.spine_count(), 3);
    let sizes: Vec<u32> = (0..3).map(|i| book.cumulative_size(i)).collect();
    assert_eq!(sizes, vec![1000, 3000, 3500]);
    assert_eq!(book.book_size(), 3500);
    assert_eq!(book.spine_entry(0).unwrap().href, "OEBPS/text/ch1.xhtml");

    let progress = book.calculate_progress(1, 0.5);
    assert!((progress - 0.5714).abs() < 1e-4, "progress was {}", progress);
}

#[test]
fn test_cumulative_sizes_strictly_increase() {
    let storage = MemStorage::new();
    let book = opened(&storage);
    let index = book.index().unwrap();
    let spine = index.spine();
    for pair in spine.windows(2) {
        assert!(pair[0].cumulative_size < pair[1].cumulative_size);
    }
    let total: usize = CHAPTER_SIZES.iter().sum();
    assert_eq!(spine.last().unwrap().cumulative_size as usize, total);
}

#[test]
fn test_nav_toc_cross_references() {
    let storage = MemStorage::new();
    let book = opened(&storage);

    assert_eq!(book.toc_count(), 4);
    let part = book.toc_entry(2).unwrap();
    assert_eq!(part.title, "Part of Two");
    assert_eq!(part.href, "OEBPS/text/ch2.xhtml");
    assert_eq!(part.anchor, "part");
    assert_eq!(part.level, 2);
    assert_eq!(part.spine_index, Some(1));

    assert_eq!(book.spine_index_for_toc_index(3), 2);
    assert_eq!(book.toc_index_for_spine_index(1), Some(1));
    assert_eq!(book.spine_entry(1).unwrap().toc_index, Some(1));
    assert_eq!(book.spine_index_for_href("OEBPS/text/ch3.xhtml"), Some(2));
    assert_eq!(book.spine_index_for_text_reference(), 1);
}

#[test]
fn test_malformed_nav_falls_back_to_ncx() {
    let storage = MemStorage::new();
    storage.create_dir_all("cache").unwrap();
    let mut archive = memory_book(MALFORMED_NAV, "");
    let report = build_index(&mut archive, &storage, "cache", SOURCE, &IndexOptions::default())
        .expect("NCX fallback should succeed");
    assert_eq!(report.toc_source, Some(TocSource::Ncx));
    assert_eq!(report.toc_count, 5);

    let index = BookIndex::load(&storage, "cache", Some(SOURCE)).unwrap();
    assert_eq!(index.toc_count(), 5);
    let titles: Vec<&str> = index.toc().iter().map(|e| e.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["One", "Two", "Two, first half", "Two, second half", "Three"]
    );
    assert_eq!(index.toc()[3].anchor, "b");
    assert_eq!(index.toc()[3].level, 2);
    assert_eq!(index.toc()[4].spine_index, Some(2));
}

#[test]
fn test_toc_href_outside_spine_is_unresolved() {
    let ncx_only = common::NCX.replace("text/ch3.xhtml", "notes.xhtml");
    let mut archive = memory_book("", "");
    archive.insert("OEBPS/toc.ncx", ncx_only);
    let storage = MemStorage::new();
    storage.create_dir_all("cache").unwrap();
    build_index(&mut archive, &storage, "cache", SOURCE, &IndexOptions::default()).unwrap();

    let index = BookIndex::load(&storage, "cache", Some(SOURCE)).unwrap();
    assert_eq!(index.toc()[4].spine_index, None);
    assert_eq!(index.spine_index_for_toc_index(4), 0);
    assert_eq!(index.spine()[2].toc_index, None);
}

#[test]
fn test_round_trip_matches_build() {
    let storage = MemStorage::new();
    let first = opened(&storage);
    let built = first.index().unwrap().clone();
    drop(first);

    let reloaded = BookIndex::load(
        &storage,
        &format!("{}/{}", CACHE_ROOT, epub_index::cache_dir_name(SOURCE)),
        Some(SOURCE),
    )
    .unwrap();
    assert_eq!(reloaded.metadata(), built.metadata());
    assert_eq!(reloaded.spine(), built.spine());
    assert_eq!(reloaded.toc(), built.toc());
    assert_eq!(reloaded.css_files(), built.css_files());
    assert_eq!(reloaded.metadata().title, "The Three Chapters");
    assert_eq!(reloaded.metadata().author, "A. N. Author");
    assert_eq!(reloaded.css_files(), ["OEBPS/styles/book.css"]);
}

#[test]
fn test_second_open_is_pure_cache_hit() {
    let storage = MemStorage::new();
    let first = opened(&storage);
    let index_file = format!("{}/{}", first.cache_path(), BOOK_BIN);
    let committed = storage.get(&index_file).unwrap();

    let (archive, streams) = CountingArchive::new(memory_book(NAV, ""));
    let mut second = Book::new(archive, storage.clone(), SOURCE, CACHE_ROOT);
    second.load(LoadOptions::default()).unwrap();
    assert_eq!(streams.get(), 0, "cache hit must not stream any document");
    assert_eq!(second.state(), IndexState::Loaded);
    assert_eq!(second.index().unwrap().spine(), first.index().unwrap().spine());
    assert_eq!(storage.get(&index_file).unwrap(), committed);
}

#[test]
fn test_scratch_files_removed_after_build() {
    let storage = MemStorage::new();
    let book = opened(&storage);
    for name in [SPINE_SCRATCH, TOC_SCRATCH] {
        let path = format!("{}/{}", book.cache_path(), name);
        assert!(!storage.exists(&path), "{} should be removed", path);
    }
}

#[test]
fn test_corrupt_index_is_rebuilt() {
    let storage = MemStorage::new();
    let book = opened(&storage);
    let index_file = format!("{}/{}", book.cache_path(), BOOK_BIN);
    let mut bytes = storage.get(&index_file).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    storage.insert(&index_file, &bytes);

    assert!(matches!(
        BookIndex::load(&storage, book.cache_path(), Some(SOURCE)),
        Err(IndexError::Corrupt(_))
    ));

    let mut again = Book::new(memory_book(NAV, ""), storage.clone(), SOURCE, CACHE_ROOT);
    again.load(LoadOptions::default()).unwrap();
    assert_eq!(again.book_size(), 3500);
}

#[test]
fn test_path_mismatch_forces_rebuild() {
    let storage = MemStorage::new();
    let book = opened(&storage);
    let bytes = storage.get(&format!("{}/{}", book.cache_path(), BOOK_BIN)).unwrap();

    let mut other = Book::new(memory_book(NAV, ""), storage.clone(), "/books/other.epub", CACHE_ROOT);
    other.setup_cache_dir().unwrap();
    storage.insert(&format!("{}/{}", other.cache_path(), BOOK_BIN), &bytes);
    assert!(matches!(
        BookIndex::load(&storage, other.cache_path(), Some("/books/other.epub")),
        Err(IndexError::SourceMismatch { .. })
    ));

    assert_eq!(
        other.load(LoadOptions::default().cached_only()),
        Err(IndexError::NotFound)
    );
    other.load(LoadOptions::default()).unwrap();
    assert_eq!(other.index().unwrap().source_path(), "/books/other.epub");
}

// -- Asset tests --------------------------------------------------------------

#[test]
fn test_png_cover_marker_written_once() {
    let storage = MemStorage::new();
    let items = r#"<item id="cover" href="images/cover.png" media-type="image/png" properties="cover-image"/>"#;
    let mut archive = memory_book(NAV, items);
    archive.insert("OEBPS/images/cover.png", b"\x89PNG\r\n".to_vec());
    let mut book = Book::new(archive, storage.clone(), SOURCE, CACHE_ROOT);
    book.load(LoadOptions::default()).unwrap();

    let mut converter = FakeConverter::default();
    assert_eq!(
        book.generate_cover(&mut converter, false),
        AssetOutcome::UnsupportedFormatMarker {
            href: "OEBPS/images/cover.png".into()
        }
    );
    let path = book.cover_bmp_path(false);
    let marker = storage.get(&path).unwrap();
    assert!(is_valid_bitmap(&storage, &path));

    assert_eq!(book.generate_cover(&mut converter, false), AssetOutcome::Reused);
    assert!(book.generate_cover_bmp(&mut converter, false));
    assert_eq!(converter.calls, 0);
    assert_eq!(storage.get(&path).unwrap(), marker);
}

#[test]
fn test_no_cover_source() {
    let storage = MemStorage::new();
    let mut book = opened(&storage);
    let mut converter = FakeConverter::default();

    assert!(!book.generate_cover_bmp(&mut converter, false));
    assert!(!storage.exists(&book.cover_bmp_path(false)));

    assert!(!book.generate_thumb_bmp(&mut converter, 200));
    let thumb = book.thumb_bmp_path(200);
    assert_eq!(storage.file_size(&thumb), Some(0));

    // The zero-byte file does not stop a second probe.
    assert_eq!(book.generate_thumbnail(&mut converter, 200), AssetOutcome::NoSource);
    assert_eq!(converter.calls, 0);
}

#[test]
fn test_conventional_cover_converted() {
    let storage = MemStorage::new();
    let mut archive = memory_book(NAV, "");
    archive.insert("OEBPS/images/cover.jpg", jpeg_bytes());
    let mut book = Book::new(archive, storage.clone(), SOURCE, CACHE_ROOT);
    book.load(LoadOptions::default()).unwrap();

    let mut converter = FakeConverter::default();
    assert_eq!(book.generate_thumbnail(&mut converter, 200), AssetOutcome::Generated);
    assert_eq!(
        converter.last_mode,
        Some(ConversionMode::Thumbnail {
            width: 120,
            height: 200
        })
    );
    assert!(is_valid_bitmap(&storage, &book.thumb_bmp_path(200)));
    assert!(!storage.exists(&format!("{}/.cover.jpg", book.cache_path())));

    assert!(book.generate_thumb_bmp(&mut converter, 200));
    assert_eq!(converter.calls, 1);
}

#[test]
fn test_conversion_failure_not_retried() {
    let storage = MemStorage::new();
    let items = r#"<item id="cover" href="cover.jpg" media-type="image/jpeg" properties="cover-image"/>"#;
    let mut archive = memory_book(NAV, items);
    archive.insert("OEBPS/cover.jpg", jpeg_bytes());
    let mut book = Book::new(archive, storage.clone(), SOURCE, CACHE_ROOT);
    book.load(LoadOptions::default()).unwrap();

    let mut converter = FakeConverter::failing();
    let outcome = book.generate_cover(&mut converter, true);
    assert_eq!(
        outcome,
        AssetOutcome::ConversionFailedMarker {
            href: "OEBPS/cover.jpg".into()
        }
    );
    assert!(outcome.is_available());
    assert!(is_valid_bitmap(&storage, &book.cover_bmp_path(true)));

    assert!(book.generate_cover_bmp(&mut converter, true));
    assert_eq!(converter.calls, 1);
}

// -- ZIP tests ----------------------------------------------------------------

#[test]
fn test_zip_archive_indexes_like_memory() {
    let bytes = zip_book(NAV, &[], "");
    let zip = ZipArchive::new(Cursor::new(bytes)).expect("fixture ZIP should parse");
    let storage = MemStorage::new();
    let mut book = Book::new(zip, storage, SOURCE, CACHE_ROOT);
    book.load(LoadOptions::default()).unwrap();

    assert_eq!(book.title(), "The Three Chapters");
    assert_eq!(book.book_size(), 3500);
    assert_eq!(book.toc_count(), 4);
    assert_eq!(book.read_item("OEBPS/text/ch3.xhtml", false).unwrap().len(), 500);
}

#[test]
fn test_open_from_filesystem() {
    let dir = tempfile::tempdir().expect("tempdir");
    let epub_path = dir.path().join("three.epub");
    let cover = jpeg_bytes();
    std::fs::write(&epub_path, zip_book(NAV, &[("cover.jpg", cover.as_slice())], "")).unwrap();
    let epub_path = epub_path.to_string_lossy().into_owned();
    let cache_root = dir.path().join("cache").to_string_lossy().into_owned();

    let mut book = Book::open(&epub_path, &cache_root).expect("open");
    book.load(LoadOptions::default()).unwrap();
    assert_eq!(book.spine_count(), 3);
    assert!(std::path::Path::new(&book.index_file_path()).exists());

    let mut converter = FakeConverter::default();
    assert!(book.generate_cover_bmp(&mut converter, false));
    assert!(is_valid_bitmap(&FsStorage::new(), &book.cover_bmp_path(false)));

    let mut reopened = Book::open(&epub_path, &cache_root).expect("reopen");
    reopened.load(LoadOptions::default().cached_only()).unwrap();
    assert_eq!(reopened.author(), "A. N. Author");

    reopened.clear_cache().unwrap();
    assert!(!std::path::Path::new(reopened.cache_path()).exists());
}

#[test]
fn test_open_missing_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("nope.epub").to_string_lossy().into_owned();
    let result = Book::open(&missing, "cache");
    assert!(matches!(result, Err(IndexError::ArchiveUnreadable(_))));
}
