//! epub-index -- Streaming EPUB index and metadata cache for e-ink readers
//!
//! Builds a compact binary index of an EPUB (metadata, spine with cumulative
//! sizes, table of contents cross-referenced with the spine, stylesheet list)
//! in a bounded number of streaming passes, persists it in a per-book cache
//! directory and reloads it on later opens without touching the archive.
//! Cover and thumbnail bitmaps are derived once and never retried.
//!
//! # Features
//!
//! - `std` (default) -- enables the streaming ZIP reader and `std::fs` storage
//!
//! # Allocation Behavior
//!
//! Archive entries are only ever handled in caller-sized chunks. Spine and
//! TOC records stream through scratch files while the index is built, so
//! peak memory during a build is bounded by the chunk sizes in
//! [`IndexOptions`] plus the spine href table, not by the size of the book.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(clippy::large_enum_variant, clippy::large_stack_arrays, clippy::redundant_clone)]
#![warn(
    clippy::box_collection,
    clippy::needless_collect,
    clippy::map_clone,
    clippy::implicit_clone,
    clippy::inefficient_to_string
)]

extern crate alloc;

pub mod archive;
pub mod assets;
pub mod bitmap;
pub mod book;
pub mod builder;
pub mod error;
pub mod format;
pub mod index;
pub mod metadata;
pub mod navigation;
pub mod options;
pub mod path;
pub mod progress;
pub mod spine;
pub mod storage;
pub mod xml;

#[cfg(feature = "std")]
pub mod zip;

// Re-export key types for convenience
pub use archive::{Archive, ChunkSink, MemoryArchive};
pub use assets::{AssetManager, AssetOutcome, AssetState, ConversionMode, RasterConverter};
pub use book::{cache_dir_name, Book, BookBuilder, CssCache, IndexState};
pub use builder::{build_index, BuildReport, IndexWriter};
pub use error::{IndexError, ParseError, RasterError, StorageError, ZipError, ZipErrorKind};
pub use index::BookIndex;
pub use metadata::CoreMetadata;
pub use navigation::{TocEntry, TocSource};
pub use options::{IndexOptions, LoadOptions};
pub use progress::calculate_progress;
pub use spine::SpineEntry;
#[cfg(feature = "std")]
pub use book::StdZipArchive;
#[cfg(feature = "std")]
pub use storage::FsStorage;
pub use storage::{ByteSink, ByteSource, MemStorage, Storage};
pub use xml::XmlLimits;
#[cfg(feature = "std")]
pub use zip::{ZipArchive, ZipLimits};
