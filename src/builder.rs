//! Multi-pass index build
//!
//! [`build_index`] runs the container, package and TOC passes against an
//! [`Archive`], streaming every structural document through its push
//! parser, then resolves spine/TOC cross references and commits
//! `book.bin`. Intermediate results live in scratch files so neither the
//! spine nor the TOC has to fit in memory while parsing.
//!
//! The scratch-file protocol is encoded in [`IndexWriter`]'s phase
//! parameter: each pass transition consumes the writer and is only
//! available from the phase that precedes it.
//!
//! ```text
//! Idle -> WritingOpf -> OpfWritten -> WritingToc -> TocWritten -> Finalizing -> Committed
//! ```
//!
//! Until the final rename nothing named `book.bin` is touched, so a failed
//! build leaves any previously committed index in place.

extern crate alloc;

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::archive::{Archive, ChunkSink};
use crate::error::{IndexError, StorageError, ZipError};
use crate::format::{
    self, RecordReader, RecordWriter, BOOK_BIN, BOOK_BIN_TMP, SPINE_SCRATCH, TOC_SCRATCH,
};
use crate::metadata::{self, OpfSummary, SpineSink, CONTAINER_PATH};
use crate::navigation::{self, TocDraft, TocEntry, TocSink, TocSource};
use crate::options::IndexOptions;
use crate::path;
use crate::spine::{cumulative_sizes, HrefTable, SpineEntry};
use crate::storage::{join_path, ByteSink, Storage};
use crate::xml::ChunkParser;

/// Summary of a completed build
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildReport {
    /// Spine entries written
    pub spine_count: usize,
    /// TOC entries written
    pub toc_count: usize,
    /// Document the TOC came from, `None` when no strategy succeeded
    pub toc_source: Option<TocSource>,
    /// Stylesheets recorded from the manifest
    pub css_count: usize,
}

/// Writer phase: no scratch file is open.
pub struct Idle;

/// Writer phase: the package document is being streamed.
pub struct WritingOpf<W: ByteSink> {
    spine: RecordWriter<W>,
    spine_count: usize,
}

/// Writer phase: the spine scratch file is closed.
pub struct OpfWritten {
    summary: OpfSummary,
    spine_count: usize,
}

/// Writer phase: a TOC strategy is being streamed.
pub struct WritingToc<W: ByteSink> {
    summary: OpfSummary,
    spine_count: usize,
    toc: RecordWriter<W>,
    toc_count: usize,
}

/// Writer phase: the TOC scratch file is closed.
pub struct TocWritten {
    summary: OpfSummary,
    spine_count: usize,
    toc_count: usize,
    toc_source: Option<TocSource>,
}

/// Writer phase: scratch files are closed and ready to be folded into `book.bin`.
pub struct Finalizing {
    summary: OpfSummary,
    spine_count: usize,
    toc_count: usize,
    toc_source: Option<TocSource>,
}

/// Writer phase: `book.bin` has been renamed into place.
pub struct Committed {
    report: BuildReport,
}

/// Scratch-file writer for one build, parameterised by its protocol phase
pub struct IndexWriter<'s, S: Storage, P> {
    storage: &'s S,
    cache_dir: String,
    source_path: String,
    phase: P,
}

impl<'s, S: Storage, P> IndexWriter<'s, S, P> {
    fn scratch_path(&self, name: &str) -> String {
        join_path(&self.cache_dir, name)
    }

    fn with_phase<Q>(self, phase: Q) -> IndexWriter<'s, S, Q> {
        IndexWriter {
            storage: self.storage,
            cache_dir: self.cache_dir,
            source_path: self.source_path,
            phase,
        }
    }

    fn remove_scratch(&self, names: &[&str]) {
        for name in names {
            let scratch = self.scratch_path(name);
            if !self.storage.exists(&scratch) {
                continue;
            }
            if let Err(err) = self.storage.remove_file(&scratch) {
                log::warn!("[INDEX] Failed to remove {}: {}", scratch, err);
            }
        }
    }

    /// Abandon the build, removing every scratch file it created.
    ///
    /// A committed `book.bin` from an earlier build is left untouched.
    pub fn abort(self) {
        let IndexWriter {
            storage,
            cache_dir,
            source_path,
            phase,
        } = self;
        drop(phase);
        let idle = IndexWriter {
            storage,
            cache_dir,
            source_path,
            phase: Idle,
        };
        idle.remove_scratch(&[SPINE_SCRATCH, TOC_SCRATCH, BOOK_BIN_TMP]);
    }
}

impl<'s, S: Storage> IndexWriter<'s, S, Idle> {
    /// Start a build for `source_path` inside an existing `cache_dir`
    pub fn new(storage: &'s S, cache_dir: &str, source_path: &str) -> Self {
        Self {
            storage,
            cache_dir: cache_dir.into(),
            source_path: source_path.into(),
            phase: Idle,
        }
    }

    /// Open the spine scratch file
    pub fn begin_content_opf_pass(self) -> Result<IndexWriter<'s, S, WritingOpf<S::Writer>>, IndexError> {
        let spine_path = self.scratch_path(SPINE_SCRATCH);
        let spine = match self.storage.open_write(&spine_path) {
            Ok(handle) => RecordWriter::new(handle),
            Err(err) => {
                self.abort();
                return Err(IndexError::CacheIo(err));
            }
        };
        Ok(self.with_phase(WritingOpf {
            spine,
            spine_count: 0,
        }))
    }
}

impl<'s, S: Storage> IndexWriter<'s, S, WritingOpf<S::Writer>> {
    /// Spine entries written so far
    pub fn spine_count(&self) -> usize {
        self.phase.spine_count
    }

    /// Close the spine scratch file and record the package facts
    ///
    /// A package without a single spine entry cannot be read and fails the
    /// build.
    pub fn end_content_opf_pass(
        self,
        summary: OpfSummary,
    ) -> Result<IndexWriter<'s, S, OpfWritten>, IndexError> {
        let spine_count = self.phase.spine_count;
        let IndexWriter {
            storage,
            cache_dir,
            source_path,
            phase,
        } = self;
        let finished = phase.spine.finish();
        let next = IndexWriter {
            storage,
            cache_dir,
            source_path,
            phase: OpfWritten {
                summary,
                spine_count,
            },
        };
        if let Err(err) = finished {
            next.abort();
            return Err(IndexError::CacheIo(err));
        }
        if spine_count == 0 {
            next.abort();
            return Err(IndexError::ArchiveUnreadable("package has an empty spine".into()));
        }
        Ok(next)
    }
}

impl<S: Storage> SpineSink for IndexWriter<'_, S, WritingOpf<S::Writer>> {
    fn push_spine_href(&mut self, href: &str) -> Result<(), StorageError> {
        self.phase.spine.put_str(href)?;
        self.phase.spine_count += 1;
        Ok(())
    }
}

impl<'s, S: Storage> IndexWriter<'s, S, OpfWritten> {
    /// Package facts recorded by the OPF pass
    pub fn summary(&self) -> &OpfSummary {
        &self.phase.summary
    }

    /// Open the TOC scratch file
    pub fn begin_toc_pass(self) -> Result<IndexWriter<'s, S, WritingToc<S::Writer>>, IndexError> {
        let toc_path = self.scratch_path(TOC_SCRATCH);
        let toc = match self.storage.open_write(&toc_path) {
            Ok(handle) => RecordWriter::new(handle),
            Err(err) => {
                self.abort();
                return Err(IndexError::CacheIo(err));
            }
        };
        let OpfWritten {
            summary,
            spine_count,
        } = self.phase;
        Ok(IndexWriter {
            storage: self.storage,
            cache_dir: self.cache_dir,
            source_path: self.source_path,
            phase: WritingToc {
                summary,
                spine_count,
                toc,
                toc_count: 0,
            },
        })
    }
}

impl<'s, S: Storage> IndexWriter<'s, S, WritingToc<S::Writer>> {
    /// Package facts recorded by the OPF pass
    pub fn summary(&self) -> &OpfSummary {
        &self.phase.summary
    }

    /// TOC entries written by the current strategy
    pub fn toc_count(&self) -> usize {
        self.phase.toc_count
    }

    /// Discard every entry written so far by truncating the scratch file
    pub fn reset_toc(&mut self) -> Result<(), IndexError> {
        let toc_path = self.scratch_path(TOC_SCRATCH);
        let handle = self.storage.open_write(&toc_path)?;
        self.phase.toc = RecordWriter::new(handle);
        self.phase.toc_count = 0;
        Ok(())
    }

    /// Close the TOC scratch file, recording which strategy produced it
    pub fn end_toc_pass(
        self,
        toc_source: Option<TocSource>,
    ) -> Result<IndexWriter<'s, S, TocWritten>, IndexError> {
        let IndexWriter {
            storage,
            cache_dir,
            source_path,
            phase,
        } = self;
        let WritingToc {
            summary,
            spine_count,
            toc,
            toc_count,
        } = phase;
        let finished = toc.finish();
        let next = IndexWriter {
            storage,
            cache_dir,
            source_path,
            phase: TocWritten {
                summary,
                spine_count,
                toc_count,
                toc_source: toc_source.filter(|_| toc_count > 0),
            },
        };
        if let Err(err) = finished {
            next.abort();
            return Err(IndexError::CacheIo(err));
        }
        Ok(next)
    }
}

impl<S: Storage> TocSink for IndexWriter<'_, S, WritingToc<S::Writer>> {
    fn push_toc_entry(&mut self, entry: &TocDraft) -> Result<(), StorageError> {
        format::write_toc_draft(&mut self.phase.toc, entry)?;
        self.phase.toc_count += 1;
        Ok(())
    }
}

impl<'s, S: Storage> IndexWriter<'s, S, TocWritten> {
    /// Finish writing; every scratch stream is closed after this point
    pub fn end_write(self) -> IndexWriter<'s, S, Finalizing> {
        let TocWritten {
            summary,
            spine_count,
            toc_count,
            toc_source,
        } = self.phase;
        IndexWriter {
            storage: self.storage,
            cache_dir: self.cache_dir,
            source_path: self.source_path,
            phase: Finalizing {
                summary,
                spine_count,
                toc_count,
                toc_source,
            },
        }
    }
}

impl<'s, S: Storage> IndexWriter<'s, S, Finalizing> {
    /// Resolve cross references, write `book.bin.tmp` and rename it into place
    ///
    /// Cumulative sizes come from `archive.size_of`; entries missing from
    /// the archive contribute 0. The TOC scratch file is streamed twice so
    /// only per-spine bookkeeping is held in memory.
    pub fn build_book_bin<A: Archive + ?Sized>(
        self,
        archive: &A,
    ) -> Result<IndexWriter<'s, S, Committed>, IndexError> {
        if let Err(err) = self.write_book_bin(archive) {
            self.abort();
            return Err(err);
        }
        let rename = self.storage.rename(
            &self.scratch_path(BOOK_BIN_TMP),
            &self.scratch_path(BOOK_BIN),
        );
        if let Err(err) = rename {
            self.abort();
            return Err(IndexError::CacheIo(err));
        }
        let Finalizing {
            summary,
            spine_count,
            toc_count,
            toc_source,
        } = self.phase;
        let report = BuildReport {
            spine_count,
            toc_count,
            toc_source,
            css_count: summary.css_files.len(),
        };
        Ok(IndexWriter {
            storage: self.storage,
            cache_dir: self.cache_dir,
            source_path: self.source_path,
            phase: Committed { report },
        })
    }

    fn read_spine_hrefs(&self) -> Result<Vec<String>, IndexError> {
        let handle = self.storage.open_read(&self.scratch_path(SPINE_SCRATCH))?;
        let mut reader = RecordReader::new(handle);
        let mut hrefs = Vec::with_capacity(self.phase.spine_count);
        for _ in 0..self.phase.spine_count {
            hrefs.push(reader.take_str()?);
        }
        Ok(hrefs)
    }

    fn open_toc_scratch(&self) -> Result<RecordReader<S::Reader>, IndexError> {
        let handle = self.storage.open_read(&self.scratch_path(TOC_SCRATCH))?;
        Ok(RecordReader::new(handle))
    }

    fn write_book_bin<A: Archive + ?Sized>(&self, archive: &A) -> Result<(), IndexError> {
        let Finalizing {
            summary,
            spine_count,
            toc_count,
            ..
        } = &self.phase;
        let hrefs = self.read_spine_hrefs()?;
        let table = HrefTable::new(hrefs.iter().map(String::as_str));

        let sizes = hrefs.iter().map(|href| match archive.size_of(href) {
            Some(size) => u32::try_from(size).unwrap_or(u32::MAX),
            None => {
                log::warn!("[INDEX] Spine entry {} missing from archive", href);
                0
            }
        });
        let cumulative = cumulative_sizes(sizes);

        // First pass: the first TOC entry targeting a spine position wins.
        let mut spine_toc: Vec<Option<usize>> = vec![None; *spine_count];
        let mut toc_reader = self.open_toc_scratch()?;
        for toc_index in 0..*toc_count {
            let draft = format::read_toc_draft(&mut toc_reader)?;
            if let Some(spine_index) = table.position(&draft.href) {
                let slot = &mut spine_toc[spine_index];
                if slot.is_none() {
                    *slot = Some(toc_index);
                }
            }
        }

        let handle = self.storage.open_write(&self.scratch_path(BOOK_BIN_TMP))?;
        let mut w = RecordWriter::new(handle);
        format::write_header(&mut w, &self.source_path)?;
        format::write_metadata(&mut w, &summary.metadata)?;
        w.put_u32(count_u32(*spine_count)?)?;
        w.put_u32(count_u32(*toc_count)?)?;
        w.put_u32(count_u32(summary.css_files.len())?)?;

        for ((href, cumulative_size), toc_index) in hrefs.into_iter().zip(cumulative).zip(spine_toc) {
            let entry = SpineEntry {
                href,
                cumulative_size,
                toc_index,
            };
            format::write_spine_entry(&mut w, &entry)?;
        }

        // Second pass: stream TOC records straight into book.bin.
        let mut toc_reader = self.open_toc_scratch()?;
        let mut unresolved = 0usize;
        for _ in 0..*toc_count {
            let TocDraft {
                title,
                href,
                anchor,
                level,
            } = format::read_toc_draft(&mut toc_reader)?;
            let spine_index = table.position(&href);
            if spine_index.is_none() {
                unresolved += 1;
            }
            let entry = TocEntry {
                title,
                href,
                anchor,
                level,
                spine_index,
            };
            format::write_toc_entry(&mut w, &entry)?;
        }
        if unresolved > 0 {
            log::debug!("[TOC] {} entries do not target a spine document", unresolved);
        }

        for css in &summary.css_files {
            w.put_str(css)?;
        }
        let written = w.written();
        w.finish_with_crc()?;
        log::debug!("[INDEX] Wrote {} bytes to {}", written + 4, BOOK_BIN_TMP);
        Ok(())
    }
}

fn count_u32(count: usize) -> Result<u32, IndexError> {
    u32::try_from(count).map_err(|_| IndexError::Corrupt(format!("table of {} entries", count)))
}

impl<S: Storage> IndexWriter<'_, S, Committed> {
    /// Remove scratch files and return the build summary
    ///
    /// Removal failures are logged; the committed index stays valid.
    pub fn cleanup(self) -> BuildReport {
        self.remove_scratch(&[SPINE_SCRATCH, TOC_SCRATCH]);
        self.phase.report
    }
}

/// Feeds streamed chunks into a push parser, enforcing full consumption
pub struct ParserFeed<'a, P: ChunkParser> {
    parser: &'a mut P,
    document: &'a str,
}

impl<'a, P: ChunkParser> ParserFeed<'a, P> {
    /// Wrap `parser`, naming `document` in truncation errors
    pub fn new(parser: &'a mut P, document: &'a str) -> Self {
        Self { parser, document }
    }
}

impl<P: ChunkParser> ChunkSink for ParserFeed<'_, P> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IndexError> {
        let consumed = self.parser.consume(chunk)?;
        if consumed != chunk.len() {
            return Err(IndexError::ParseTruncated {
                document: self.document.into(),
                supplied: chunk.len(),
                consumed,
            });
        }
        Ok(())
    }
}

/// Stream one archive entry through `parser` from setup to finish
pub fn stream_document<A: Archive + ?Sized, P: ChunkParser>(
    archive: &mut A,
    document: &str,
    parser: &mut P,
    chunk_size: usize,
) -> Result<usize, IndexError> {
    if archive.size_of(document).is_none() {
        return Err(IndexError::Zip(ZipError::FileNotFound));
    }
    parser.setup()?;
    let streamed = archive.stream_to(document, &mut ParserFeed::new(&mut *parser, document), chunk_size)?;
    parser.finish()?;
    Ok(streamed)
}

fn fatal(document: &str, err: IndexError) -> IndexError {
    match err {
        err @ (IndexError::ParseTruncated { .. } | IndexError::CacheIo(_)) => err,
        other => IndexError::ArchiveUnreadable(format!("{}: {}", document, other)),
    }
}

fn locate_package<A: Archive + ?Sized>(
    archive: &mut A,
    options: &IndexOptions,
) -> Result<String, IndexError> {
    let mut parser = metadata::container_parser(options.xml_limits);
    stream_document(archive, CONTAINER_PATH, &mut parser, options.container_chunk)
        .map_err(|err| fatal(CONTAINER_PATH, err))?;
    match parser.handler().root_path() {
        Some(root) if !root.is_empty() => Ok(path::normalise(root)),
        _ => Err(IndexError::ArchiveUnreadable(format!(
            "{}: no rootfile full-path",
            CONTAINER_PATH
        ))),
    }
}

fn run_toc_strategy<A: Archive + ?Sized, S: Storage>(
    archive: &mut A,
    writer: &mut IndexWriter<'_, S, WritingToc<S::Writer>>,
    source: TocSource,
    href: &str,
    options: &IndexOptions,
) -> Result<usize, IndexError> {
    let base_dir = writer.summary().base_dir.clone();
    match source {
        TocSource::Nav => {
            let mut parser = navigation::nav_parser(href, writer, options.xml_limits);
            stream_document(archive, href, &mut parser, options.toc_chunk)?;
        }
        TocSource::Ncx => {
            let mut parser = navigation::ncx_parser(&base_dir, writer, options.xml_limits);
            stream_document(archive, href, &mut parser, options.toc_chunk)?;
        }
    }
    Ok(writer.toc_count())
}

/// Build and commit `<cache_dir>/book.bin` for the book in `archive`
///
/// `cache_dir` must exist. On error every scratch file is removed and any
/// previously committed index is left as it was.
pub fn build_index<A: Archive + ?Sized, S: Storage>(
    archive: &mut A,
    storage: &S,
    cache_dir: &str,
    source_path: &str,
    options: &IndexOptions,
) -> Result<BuildReport, IndexError> {
    let opf_path = locate_package(archive, options)?;
    log::debug!("[OPF] Package document at {}", opf_path);

    // OPF pass
    let mut writer = IndexWriter::new(storage, cache_dir, source_path).begin_content_opf_pass()?;
    let summary = {
        let mut parser = metadata::content_opf_parser(&opf_path, &mut writer, options.xml_limits);
        stream_document(archive, &opf_path, &mut parser, options.opf_chunk)
            .map(|_| parser.into_handler().into_summary())
    };
    let summary = match summary {
        Ok(summary) => summary,
        Err(err) => {
            writer.abort();
            return Err(fatal(&opf_path, err));
        }
    };
    log::info!(
        "[OPF] '{}' by '{}': {} spine entries, {} stylesheets",
        summary.metadata.title,
        summary.metadata.author,
        writer.spine_count(),
        summary.css_files.len()
    );
    let writer = writer.end_content_opf_pass(summary)?;

    // TOC pass
    let mut writer = writer.begin_toc_pass()?;
    let strategies = [
        (TocSource::Nav, writer.summary().nav_href.clone()),
        (TocSource::Ncx, writer.summary().ncx_href.clone()),
    ];
    let mut toc_source = None;
    for (source, href) in strategies {
        let Some(href) = href else {
            continue;
        };
        match run_toc_strategy(archive, &mut writer, source, &href, options) {
            Ok(count) if count > 0 => {
                log::debug!("[TOC] {:?} {} produced {} entries", source, href, count);
                toc_source = Some(source);
                break;
            }
            Ok(_) => log::warn!("[TOC] {:?} {} produced no entries", source, href),
            Err(err) => log::warn!("[TOC] {:?} {} failed: {}", source, href, err),
        }
        if let Err(err) = writer.reset_toc() {
            writer.abort();
            return Err(err);
        }
    }
    if toc_source.is_none() {
        log::warn!("[TOC] {}", IndexError::TocUnavailable);
    }
    let writer = writer.end_toc_pass(toc_source)?;

    // Finalize
    let report = writer.end_write().build_book_bin(archive)?.cleanup();
    log::info!(
        "[INDEX] Committed {}: {} spine, {} toc ({:?}), {} css",
        join_path(cache_dir, BOOK_BIN),
        report.spine_count,
        report.toc_count,
        report.toc_source,
        report.css_count
    );
    Ok(report)
}
