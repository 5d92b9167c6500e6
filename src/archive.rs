//! Archive accessor interface
//!
//! The index builder reads the EPUB only through [`Archive`]: the inflated
//! size of an entry, a chunked stream of its bytes, or the whole entry as a
//! buffer. [`MemoryArchive`] backs tests and pre-extracted books; the ZIP
//! reader in [`crate::zip`] backs real files.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{IndexError, ZipError};
use crate::path;
use crate::storage::ByteSink;

/// Consumer of streamed archive bytes
pub trait ChunkSink {
    /// Accept the next chunk of an entry.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IndexError>;
}

impl ChunkSink for Vec<u8> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IndexError> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// Forwards streamed archive bytes into a storage write handle
pub struct CopyToSink<'a, W: ByteSink + ?Sized>(pub &'a mut W);

impl<W: ByteSink + ?Sized> ChunkSink for CopyToSink<'_, W> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IndexError> {
        self.0.write_all(chunk).map_err(IndexError::CacheIo)
    }
}

/// Read access to the entries of an EPUB container
///
/// Paths are archive-internal and normalised by the caller.
pub trait Archive {
    /// Inflated size of an entry, or `None` if it does not exist.
    fn size_of(&self, path: &str) -> Option<usize>;

    /// Stream an entry into `sink` in chunks of at most `chunk_size` bytes.
    ///
    /// Returns the number of bytes streamed.
    fn stream_to(
        &mut self,
        path: &str,
        sink: &mut dyn ChunkSink,
        chunk_size: usize,
    ) -> Result<usize, IndexError>;

    /// Read a whole entry, optionally appending a NUL terminator.
    fn read_to_buffer(&mut self, path: &str, trailing_nul: bool) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size_of(path)? + usize::from(trailing_nul));
        match self.stream_to(path, &mut out, 1024) {
            Ok(_) => {
                if trailing_nul {
                    out.push(0);
                }
                Some(out)
            }
            Err(err) => {
                log::warn!("[ARCHIVE] Failed to read {}: {}", path, err);
                None
            }
        }
    }
}

impl<A: Archive + ?Sized> Archive for &mut A {
    fn size_of(&self, path: &str) -> Option<usize> {
        (**self).size_of(path)
    }

    fn stream_to(
        &mut self,
        path: &str,
        sink: &mut dyn ChunkSink,
        chunk_size: usize,
    ) -> Result<usize, IndexError> {
        (**self).stream_to(path, sink, chunk_size)
    }
}

/// Archive held entirely in memory
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; the path is normalised on insert
    pub fn insert(&mut self, path: &str, content: impl Into<Vec<u8>>) {
        self.entries.insert(path::normalise(path), content.into());
    }

    /// Builder-style variant of [`MemoryArchive::insert`]
    pub fn with_entry(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert(path, content);
        self
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry paths in sorted order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}

impl Archive for MemoryArchive {
    fn size_of(&self, path: &str) -> Option<usize> {
        self.entries.get(path).map(|content| content.len())
    }

    fn stream_to(
        &mut self,
        path: &str,
        sink: &mut dyn ChunkSink,
        chunk_size: usize,
    ) -> Result<usize, IndexError> {
        if chunk_size == 0 {
            return Err(IndexError::Zip(ZipError::BufferTooSmall));
        }
        let content = self
            .entries
            .get(path)
            .ok_or(IndexError::Zip(ZipError::FileNotFound))?;
        for chunk in content.chunks(chunk_size) {
            sink.write_chunk(chunk)?;
        }
        Ok(content.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChunkLengths(Vec<usize>);

    impl ChunkSink for ChunkLengths {
        fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IndexError> {
            self.0.push(chunk.len());
            Ok(())
        }
    }

    #[test]
    fn test_memory_archive_streams_bounded_chunks() {
        let mut archive = MemoryArchive::new().with_entry("OEBPS/ch1.xhtml", vec![b'a'; 2500]);
        let mut sink = ChunkLengths(Vec::new());
        let n = archive.stream_to("OEBPS/ch1.xhtml", &mut sink, 1024).unwrap();
        assert_eq!(n, 2500);
        assert_eq!(sink.0, vec![1024, 1024, 452]);
    }

    #[test]
    fn test_memory_archive_normalises_on_insert() {
        let archive = MemoryArchive::new().with_entry("/OEBPS/./text/../ch1.xhtml", b"x".to_vec());
        assert_eq!(archive.size_of("OEBPS/ch1.xhtml"), Some(1));
    }

    #[test]
    fn test_missing_entry_is_an_error() {
        let mut archive = MemoryArchive::new();
        let mut out: Vec<u8> = Vec::new();
        let err = archive.stream_to("nope", &mut out, 512).unwrap_err();
        assert_eq!(err, IndexError::Zip(ZipError::FileNotFound));
        assert!(archive.read_to_buffer("nope", false).is_none());
    }

    #[test]
    fn test_read_to_buffer_appends_nul() {
        let mut archive = MemoryArchive::new().with_entry("mimetype", b"application/epub+zip".to_vec());
        let buf = archive.read_to_buffer("mimetype", true).unwrap();
        assert_eq!(buf.len(), 21);
        assert_eq!(buf.last(), Some(&0));
    }
}
