//! High-level book API: open, index, reload, CSS and derived assets.
//!
//! [`Book`] ties the archive, the storage backend and the on-disk cache of
//! one EPUB together. It is intended for the common "open book -> query
//! spine/TOC -> show cover" flow of a reader shell; the lower-level
//! [`crate::builder`] and [`crate::index`] modules remain available for
//! custom pipelines.

extern crate alloc;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::archive::{Archive, ChunkSink, CopyToSink};
use crate::assets::{AssetManager, AssetOutcome, RasterConverter};
use crate::builder::build_index;
use crate::error::{IndexError, ZipError};
use crate::format::BOOK_BIN;
use crate::index::BookIndex;
use crate::metadata::CoreMetadata;
use crate::navigation::TocEntry;
use crate::options::{IndexOptions, LoadOptions};
use crate::path;
use crate::progress::calculate_progress;
use crate::spine::SpineEntry;
use crate::storage::{join_path, ByteSink, ByteSource, Storage};

/// CSS rule cache file inside the book cache directory
pub const CSS_CACHE: &str = "css_rules.cache";

/// Scratch copy of the stylesheet being parsed
pub const CSS_SCRATCH: &str = ".tmp.css";

const CSS_CHUNK: usize = 1024;

/// Lifecycle of the in-memory index of a [`Book`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IndexState {
    /// Nothing loaded yet, or [`Book::load`] is starting over.
    #[default]
    Uninitialized,
    /// The index builder is running.
    Building,
    /// `book.bin` was committed but has not been read back yet.
    BuiltUnverified,
    /// An index was read from disk and is queryable.
    Loaded,
    /// The last load or build failed.
    Invalid,
}

/// Stylesheet rule parser with its own persistent cache
///
/// The book streams stylesheets and cache files through it but never looks
/// inside; the rule representation belongs to the implementation.
pub trait CssCache {
    /// Whether rules are currently held in memory.
    fn has_cache(&self) -> bool;

    /// Replace the held rules with a previously saved cache. Returns `false`
    /// when the cache is stale or unreadable.
    fn load_cache(&mut self, source: &mut dyn ByteSource) -> bool;

    /// Parse one stylesheet and add its rules.
    fn load_from_stream(&mut self, source: &mut dyn ByteSource);

    /// Persist the held rules.
    fn save_to_cache(&self, dest: &mut dyn ByteSink) -> bool;

    /// Drop every held rule.
    fn clear(&mut self);

    /// Number of held rules.
    fn rule_count(&self) -> usize;
}

/// Cache directory name for the book at `source_path`
///
/// Two CRC-32 digests with different seeds form a 64-bit key; collisions
/// are caught by the source path stored in the index.
pub fn cache_dir_name(source_path: &str) -> String {
    let mut low = crc32fast::Hasher::new();
    low.update(source_path.as_bytes());
    let mut high = crc32fast::Hasher::new_with_initial(0x9E37_79B9);
    high.update(source_path.as_bytes());
    let key = (u64::from(high.finalize()) << 32) | u64::from(low.finalize());
    format!("epub_{:016x}", key)
}

/// Builder for configuring how a [`Book`] is opened.
#[derive(Default)]
pub struct BookBuilder {
    options: IndexOptions,
    css: Option<Box<dyn CssCache>>,
}

impl BookBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit index options.
    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a CSS rule cache.
    pub fn with_css_cache(mut self, css: Box<dyn CssCache>) -> Self {
        self.css = Some(css);
        self
    }

    /// Assemble a book from an already opened archive and storage.
    pub fn build<A: Archive, S: Storage>(
        self,
        archive: A,
        storage: S,
        source_path: &str,
        cache_root: &str,
    ) -> Book<A, S> {
        Book {
            archive,
            storage,
            source_path: String::from(source_path),
            cache_path: join_path(cache_root, &cache_dir_name(source_path)),
            options: self.options,
            css: self.css,
            state: IndexState::Uninitialized,
            index: None,
        }
    }

    /// Open the EPUB at `source_path` from the local filesystem.
    #[cfg(feature = "std")]
    pub fn open(
        self,
        source_path: &str,
        cache_root: &str,
    ) -> Result<Book<StdZipArchive, crate::storage::FsStorage>, IndexError> {
        let archive = crate::zip::open_zip_file(source_path).map_err(|err| {
            IndexError::ArchiveUnreadable(format!("{}: {}", source_path, err))
        })?;
        Ok(self.build(archive, crate::storage::FsStorage::new(), source_path, cache_root))
    }
}

/// ZIP archive over a buffered local file
#[cfg(feature = "std")]
pub type StdZipArchive = crate::zip::ZipArchive<std::io::BufReader<std::fs::File>>;

/// One EPUB and its cache directory
pub struct Book<A: Archive, S: Storage> {
    archive: A,
    storage: S,
    source_path: String,
    cache_path: String,
    options: IndexOptions,
    css: Option<Box<dyn CssCache>>,
    state: IndexState,
    index: Option<BookIndex>,
}

#[cfg(feature = "std")]
impl Book<StdZipArchive, crate::storage::FsStorage> {
    /// Open a local EPUB with default options.
    pub fn open(source_path: &str, cache_root: &str) -> Result<Self, IndexError> {
        BookBuilder::new().open(source_path, cache_root)
    }
}

impl<A: Archive, S: Storage> Book<A, S> {
    /// Assemble a book with default options.
    pub fn new(archive: A, storage: S, source_path: &str, cache_root: &str) -> Self {
        BookBuilder::new().build(archive, storage, source_path, cache_root)
    }

    /// Load the book index, building it first when allowed and needed.
    pub fn load(&mut self, options: LoadOptions) -> Result<(), IndexError> {
        log::info!("[BOOK] Loading {}", self.source_path);
        self.state = IndexState::Uninitialized;
        self.index = None;
        if let Some(css) = self.css.as_mut() {
            css.clear();
        }

        match BookIndex::load(&self.storage, &self.cache_path, Some(&self.source_path)) {
            Ok(index) => {
                self.index = Some(index);
                self.state = IndexState::Loaded;
                if !options.skip_css {
                    self.load_css();
                }
                log::info!("[BOOK] Loaded {} from cache", self.source_path);
                return Ok(());
            }
            Err(IndexError::NotFound) => {
                log::info!("[BOOK] No index cached for {}", self.source_path);
            }
            Err(err) => {
                log::warn!("[BOOK] Cached index unusable ({}), rebuilding", err);
            }
        }

        if !options.build_if_missing {
            return Err(IndexError::NotFound);
        }

        if let Err(err) = self.build() {
            self.state = IndexState::Invalid;
            log::warn!("[BOOK] Could not index {}: {}", self.source_path, err);
            return Err(err);
        }
        self.state = IndexState::BuiltUnverified;

        match BookIndex::load(&self.storage, &self.cache_path, Some(&self.source_path)) {
            Ok(index) => {
                self.index = Some(index);
                self.state = IndexState::Loaded;
            }
            Err(err) => {
                self.state = IndexState::Invalid;
                log::warn!("[BOOK] Failed to reload index after writing: {}", err);
                return Err(err);
            }
        }

        if !options.skip_css {
            self.load_css();
        }
        log::info!("[BOOK] Loaded {}", self.source_path);
        Ok(())
    }

    fn build(&mut self) -> Result<(), IndexError> {
        self.setup_cache_dir()?;
        self.state = IndexState::Building;
        let report = build_index(
            &mut self.archive,
            &self.storage,
            &self.cache_path,
            &self.source_path,
            &self.options,
        )?;
        log::info!(
            "[BOOK] Indexed {} spine items, {} TOC entries ({:?}), {} stylesheets",
            report.spine_count,
            report.toc_count,
            report.toc_source,
            report.css_count
        );
        Ok(())
    }

    fn load_css(&mut self) {
        let (Some(css), Some(index)) = (self.css.as_mut(), self.index.as_ref()) else {
            return;
        };
        let cache_file = join_path(&self.cache_path, CSS_CACHE);
        if self.storage.exists(&cache_file) {
            match self.storage.open_read(&cache_file) {
                Ok(mut reader) => {
                    if css.load_cache(&mut reader) {
                        log::debug!("[CSS] Loaded {} rules from cache", css.rule_count());
                        return;
                    }
                    log::info!("[CSS] Rule cache invalid, reparsing");
                }
                Err(err) => log::warn!("[CSS] Cannot open {}: {}", cache_file, err),
            }
        }

        css.clear();
        let scratch = join_path(&self.cache_path, CSS_SCRATCH);
        for href in index.css_files() {
            log::debug!("[CSS] Parsing {}", href);
            if let Err(err) = extract_to(&mut self.archive, &self.storage, href, &scratch) {
                log::warn!("[CSS] Could not extract {}: {}", href, err);
                remove_css_scratch(&self.storage, &scratch);
                continue;
            }
            match self.storage.open_read(&scratch) {
                Ok(mut reader) => css.load_from_stream(&mut reader),
                Err(err) => log::warn!("[CSS] Cannot reopen scratch for {}: {}", href, err),
            }
            remove_css_scratch(&self.storage, &scratch);
        }

        let saved = match self.storage.open_write(&cache_file) {
            Ok(mut writer) => css.save_to_cache(&mut writer) && writer.flush().is_ok(),
            Err(_) => false,
        };
        if !saved {
            log::warn!("[CSS] Could not save rule cache");
        }
        log::info!(
            "[CSS] Loaded {} rules from {} stylesheets",
            css.rule_count(),
            index.css_files().len()
        );
    }

    /// Remove the whole cache directory of this book.
    ///
    /// A missing directory is not an error. The in-memory index stays usable.
    pub fn clear_cache(&self) -> Result<(), IndexError> {
        if !self.storage.exists(&self.cache_path) {
            log::debug!("[BOOK] Cache {} does not exist", self.cache_path);
            return Ok(());
        }
        self.storage.remove_dir_all(&self.cache_path)?;
        log::info!("[BOOK] Cleared cache {}", self.cache_path);
        Ok(())
    }

    /// Create the cache directory if it is missing.
    pub fn setup_cache_dir(&self) -> Result<(), IndexError> {
        if self.storage.exists(&self.cache_path) {
            return Ok(());
        }
        self.storage.create_dir_all(&self.cache_path)?;
        Ok(())
    }

    /// Cache directory of this book
    pub fn cache_path(&self) -> &str {
        &self.cache_path
    }

    /// Source path of the EPUB
    pub fn path(&self) -> &str {
        &self.source_path
    }

    /// Path of the committed index file
    pub fn index_file_path(&self) -> String {
        join_path(&self.cache_path, BOOK_BIN)
    }

    /// Current lifecycle state
    pub fn state(&self) -> IndexState {
        self.state
    }

    /// Whether an index is loaded
    pub fn is_loaded(&self) -> bool {
        self.state == IndexState::Loaded
    }

    /// Loaded index, if any
    pub fn index(&self) -> Option<&BookIndex> {
        self.index.as_ref()
    }

    /// Active index options
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Attached CSS rule cache, if any
    pub fn css_cache(&self) -> Option<&dyn CssCache> {
        self.css.as_deref()
    }

    /// Book metadata, if loaded
    pub fn metadata(&self) -> Option<&CoreMetadata> {
        self.index.as_ref().map(BookIndex::metadata)
    }

    /// Book title, empty when not loaded
    pub fn title(&self) -> &str {
        self.metadata().map_or("", |m| m.title.as_str())
    }

    /// Book author, empty when not loaded
    pub fn author(&self) -> &str {
        self.metadata().map_or("", |m| m.author.as_str())
    }

    /// Book language, empty when not loaded
    pub fn language(&self) -> &str {
        self.metadata().map_or("", |m| m.language.as_str())
    }

    /// Number of spine entries (0 when not loaded)
    pub fn spine_count(&self) -> usize {
        self.index.as_ref().map_or(0, BookIndex::spine_count)
    }

    /// Number of TOC entries (0 when not loaded)
    pub fn toc_count(&self) -> usize {
        self.index.as_ref().map_or(0, BookIndex::toc_count)
    }

    /// Spine entry at `index`, clamped to the first entry when out of range
    pub fn spine_entry(&self, index: usize) -> Option<&SpineEntry> {
        self.index.as_ref().map(|i| i.spine_entry(index))
    }

    /// TOC entry at `index`
    pub fn toc_entry(&self, index: usize) -> Option<&TocEntry> {
        self.index.as_ref().and_then(|i| i.toc_entry(index))
    }

    /// Spine position a TOC entry points at (0 when unresolved)
    pub fn spine_index_for_toc_index(&self, toc_index: usize) -> usize {
        self.index
            .as_ref()
            .map_or(0, |i| i.spine_index_for_toc_index(toc_index))
    }

    /// First TOC entry pointing at a spine position
    pub fn toc_index_for_spine_index(&self, spine_index: usize) -> Option<usize> {
        self.index
            .as_ref()
            .and_then(|i| i.toc_index_for_spine_index(spine_index))
    }

    /// Spine position of an archive href
    pub fn spine_index_for_href(&self, href: &str) -> Option<usize> {
        self.index.as_ref().and_then(|i| i.spine_index_for_href(href))
    }

    /// Spine position where reading should start (0 when unknown)
    pub fn spine_index_for_text_reference(&self) -> usize {
        self.index
            .as_ref()
            .map_or(0, BookIndex::spine_index_for_text_reference)
    }

    /// Inflated size of everything up to and including `spine_index`
    pub fn cumulative_size(&self, spine_index: usize) -> u32 {
        self.index.as_ref().map_or(0, |i| i.cumulative_size(spine_index))
    }

    /// Inflated size of the whole spine
    pub fn book_size(&self) -> u32 {
        self.index.as_ref().map_or(0, BookIndex::book_size)
    }

    /// Whole-book progress for a position inside a spine entry
    pub fn calculate_progress(&self, spine_index: usize, fraction: f32) -> f32 {
        self.index
            .as_ref()
            .map_or(0.0, |i| calculate_progress(i.spine(), spine_index, fraction))
    }

    /// Inflated size of an archive entry
    pub fn item_size(&self, href: &str) -> Option<usize> {
        self.archive.size_of(&path::normalise(href))
    }

    /// Read a whole archive entry
    pub fn read_item(&mut self, href: &str, trailing_nul: bool) -> Option<Vec<u8>> {
        self.archive
            .read_to_buffer(&path::normalise(href), trailing_nul)
    }

    /// Stream an archive entry into `sink`
    pub fn stream_item(
        &mut self,
        href: &str,
        sink: &mut dyn ChunkSink,
        chunk_size: usize,
    ) -> Result<usize, IndexError> {
        self.archive
            .stream_to(&path::normalise(href), sink, chunk_size)
    }

    /// Path of the cover bitmap
    pub fn cover_bmp_path(&self, cropped: bool) -> String {
        self.assets().cover_path(cropped)
    }

    /// Path of the thumbnail bitmap for `height`
    pub fn thumb_bmp_path(&self, height: u32) -> String {
        self.assets().thumb_path(height)
    }

    fn assets(&self) -> AssetManager<'_, S> {
        AssetManager::new(&self.storage, &self.cache_path, &self.options)
    }

    /// Produce the cover bitmap, reporting what happened
    pub fn generate_cover(
        &mut self,
        converter: &mut dyn RasterConverter,
        cropped: bool,
    ) -> AssetOutcome {
        let Some(index) = self.index.as_ref() else {
            log::warn!("[ASSET] Cover requested before the index was loaded");
            return AssetOutcome::Failed(IndexError::NotLoaded);
        };
        AssetManager::new(&self.storage, &self.cache_path, &self.options).generate_cover(
            &mut self.archive,
            index.metadata(),
            converter,
            cropped,
        )
    }

    /// Produce the thumbnail bitmap, reporting what happened
    pub fn generate_thumbnail(
        &mut self,
        converter: &mut dyn RasterConverter,
        height: u32,
    ) -> AssetOutcome {
        let Some(index) = self.index.as_ref() else {
            log::warn!("[ASSET] Thumbnail requested before the index was loaded");
            return AssetOutcome::Failed(IndexError::NotLoaded);
        };
        AssetManager::new(&self.storage, &self.cache_path, &self.options).generate_thumbnail(
            &mut self.archive,
            index.metadata(),
            converter,
            height,
        )
    }

    /// `true` when a cover bitmap (real or marker) exists afterwards
    pub fn generate_cover_bmp(&mut self, converter: &mut dyn RasterConverter, cropped: bool) -> bool {
        self.generate_cover(converter, cropped).is_available()
    }

    /// `true` when a thumbnail bitmap (real or marker) exists afterwards
    pub fn generate_thumb_bmp(&mut self, converter: &mut dyn RasterConverter, height: u32) -> bool {
        self.generate_thumbnail(converter, height).is_available()
    }

    /// Release the archive and storage backend
    pub fn into_parts(self) -> (A, S) {
        (self.archive, self.storage)
    }
}

fn extract_to<A: Archive, S: Storage>(
    archive: &mut A,
    storage: &S,
    href: &str,
    dest: &str,
) -> Result<(), IndexError> {
    if archive.size_of(href).is_none() {
        return Err(ZipError::FileNotFound.into());
    }
    let mut writer = storage.open_write(dest)?;
    archive.stream_to(href, &mut CopyToSink(&mut writer), CSS_CHUNK)?;
    writer.flush()?;
    Ok(())
}

fn remove_css_scratch<S: Storage>(storage: &S, scratch: &str) {
    if !storage.exists(scratch) {
        return;
    }
    if let Err(err) = storage.remove_file(scratch) {
        log::warn!("[CSS] Failed to remove {}: {}", scratch, err);
    }
}
