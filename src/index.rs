//! Read side of the committed book index
//!
//! [`BookIndex::load`] validates and decodes `book.bin` in one pass; every
//! query afterwards is answered from memory.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{IndexError, StorageError};
use crate::format::{self, RecordReader, BOOK_BIN};
use crate::metadata::CoreMetadata;
use crate::navigation::TocEntry;
use crate::path;
use crate::spine::{HrefTable, SpineEntry};
use crate::storage::{join_path, Storage};

/// Upper bound on spine, TOC and stylesheet counts accepted from disk
pub const MAX_TABLE_ENTRIES: usize = 65_535;

/// Decoded `book.bin`
#[derive(Clone, Debug, Default)]
pub struct BookIndex {
    source_path: String,
    metadata: CoreMetadata,
    spine: Vec<SpineEntry>,
    toc: Vec<TocEntry>,
    css_files: Vec<String>,
    hrefs: HrefTable,
}

static EMPTY_SPINE_ENTRY: SpineEntry = SpineEntry {
    href: String::new(),
    cumulative_size: 0,
    toc_index: None,
};

impl BookIndex {
    /// Load and validate `<cache_dir>/book.bin`
    ///
    /// Fails with [`IndexError::NotFound`] when no file exists,
    /// [`IndexError::Corrupt`] on any format violation and
    /// [`IndexError::SourceMismatch`] when `expected_source` is given and
    /// differs from the recorded path.
    pub fn load<S: Storage>(
        storage: &S,
        cache_dir: &str,
        expected_source: Option<&str>,
    ) -> Result<Self, IndexError> {
        let bin_path = join_path(cache_dir, BOOK_BIN);
        if !storage.exists(&bin_path) {
            return Err(IndexError::NotFound);
        }
        let bytes = match storage.read_all(&bin_path) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return Err(IndexError::NotFound),
            Err(err) => return Err(IndexError::CacheIo(err)),
        };
        let index = Self::decode(&bytes)?;
        if let Some(expected) = expected_source {
            if index.source_path != expected {
                return Err(IndexError::SourceMismatch {
                    expected: expected.into(),
                    found: index.source_path,
                });
            }
        }
        log::debug!(
            "[INDEX] Loaded {}: {} spine, {} toc, {} css",
            bin_path,
            index.spine.len(),
            index.toc.len(),
            index.css_files.len()
        );
        Ok(index)
    }

    /// Decode `book.bin` bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        let body = format::verified_body(bytes)?;
        let mut r = RecordReader::new(body);
        let source_path = format::read_header(&mut r)?;
        let metadata = format::read_metadata(&mut r)?;
        let spine_count = r.take_count(MAX_TABLE_ENTRIES)?;
        let toc_count = r.take_count(MAX_TABLE_ENTRIES)?;
        let css_count = r.take_count(MAX_TABLE_ENTRIES)?;

        let mut spine = Vec::with_capacity(spine_count);
        for _ in 0..spine_count {
            let entry = format::read_spine_entry(&mut r)?;
            if entry.toc_index.is_some_and(|i| i >= toc_count) {
                return Err(IndexError::Corrupt("spine toc index out of range".into()));
            }
            spine.push(entry);
        }
        let mut toc = Vec::with_capacity(toc_count);
        for _ in 0..toc_count {
            let entry = format::read_toc_entry(&mut r)?;
            if entry.spine_index.is_some_and(|i| i >= spine_count) {
                return Err(IndexError::Corrupt("toc spine index out of range".into()));
            }
            toc.push(entry);
        }
        let mut css_files = Vec::with_capacity(css_count);
        for _ in 0..css_count {
            css_files.push(r.take_str()?);
        }

        let hrefs = HrefTable::new(spine.iter().map(|e| e.href.as_str()));
        Ok(Self {
            source_path,
            metadata,
            spine,
            toc,
            css_files,
            hrefs,
        })
    }

    /// Source path recorded at build time
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Core metadata fields
    pub fn metadata(&self) -> &CoreMetadata {
        &self.metadata
    }

    /// Every spine entry in reading order
    pub fn spine(&self) -> &[SpineEntry] {
        &self.spine
    }

    /// Every TOC entry in document order
    pub fn toc(&self) -> &[TocEntry] {
        &self.toc
    }

    /// Stylesheets listed in the manifest
    pub fn css_files(&self) -> &[String] {
        &self.css_files
    }

    /// Number of spine entries
    pub fn spine_count(&self) -> usize {
        self.spine.len()
    }

    /// Number of TOC entries
    pub fn toc_count(&self) -> usize {
        self.toc.len()
    }

    /// Spine entry at `index`, clamped to entry 0 when out of range
    pub fn spine_entry(&self, index: usize) -> &SpineEntry {
        match self.spine.get(index) {
            Some(entry) => entry,
            None => {
                log::warn!(
                    "[INDEX] Spine index {} out of range ({}), using 0",
                    index,
                    self.spine.len()
                );
                self.spine.first().unwrap_or(&EMPTY_SPINE_ENTRY)
            }
        }
    }

    /// TOC entry at `index`
    pub fn toc_entry(&self, index: usize) -> Option<&TocEntry> {
        let entry = self.toc.get(index);
        if entry.is_none() {
            log::warn!(
                "[INDEX] TOC index {} out of range ({})",
                index,
                self.toc.len()
            );
        }
        entry
    }

    /// Spine position a TOC entry points at, 0 if unknown
    pub fn spine_index_for_toc_index(&self, toc_index: usize) -> usize {
        match self.toc.get(toc_index).and_then(|e| e.spine_index) {
            Some(spine_index) => spine_index,
            None => {
                log::debug!("[INDEX] No spine entry for TOC {}, using 0", toc_index);
                0
            }
        }
    }

    /// First TOC entry targeting a spine entry
    pub fn toc_index_for_spine_index(&self, spine_index: usize) -> Option<usize> {
        self.spine.get(spine_index).and_then(|e| e.toc_index)
    }

    /// Cumulative inflated size up to and including `spine_index`
    pub fn cumulative_size(&self, spine_index: usize) -> u32 {
        self.spine_entry(spine_index).cumulative_size
    }

    /// Total inflated size of the spine
    pub fn book_size(&self) -> u32 {
        self.spine.last().map_or(0, |e| e.cumulative_size)
    }

    /// Spine position of an href, matched exactly after normalisation
    pub fn spine_index_for_href(&self, href: &str) -> Option<usize> {
        self.hrefs.position(&path::normalise(href))
    }

    /// Spine position of the guide's start-reading reference, 0 if unavailable
    pub fn spine_index_for_text_reference(&self) -> usize {
        let target = &self.metadata.text_reference_href;
        if target.is_empty() {
            return 0;
        }
        match self.hrefs.position(target) {
            Some(index) => index,
            None => {
                log::debug!("[INDEX] Text reference {} not in spine", target);
                0
            }
        }
    }
}
