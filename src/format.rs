//! Binary layout of the committed index and the build scratch files
//!
//! All integers are little-endian. Strings are a `u32` byte length followed
//! by UTF-8. `book.bin` ends with a CRC-32 of every preceding byte:
//!
//! ```text
//! magic "EPIX" | version u16 | reserved u16 | source_path str
//! title str | author str | language str | cover_href str | text_ref_href str
//! spine_count u32 | toc_count u32 | css_count u32
//! spine_count x (href str | cumulative_size u32 | toc_index i32)
//! toc_count   x (title str | href str | anchor str | level u8 | spine_index i32)
//! css_count   x (href str)
//! crc32 u32
//! ```
//!
//! Negative `i32` indices encode "no match".

extern crate alloc;

use alloc::format;
use alloc::string::String;
use alloc::vec;

use crate::error::{IndexError, StorageError};
use crate::metadata::CoreMetadata;
use crate::navigation::{TocDraft, TocEntry};
use crate::spine::SpineEntry;
use crate::storage::{ByteSink, ByteSource};

/// Committed index file name
pub const BOOK_BIN: &str = "book.bin";
/// Index file while it is being written
pub const BOOK_BIN_TMP: &str = "book.bin.tmp";
/// Spine scratch file written during the OPF pass
pub const SPINE_SCRATCH: &str = "spine.tmp";
/// TOC scratch file written during the TOC pass
pub const TOC_SCRATCH: &str = "toc.tmp";

/// File magic of `book.bin`
pub const INDEX_MAGIC: [u8; 4] = *b"EPIX";
/// Current `book.bin` layout version
pub const INDEX_VERSION: u16 = 1;

/// Strings longer than this are treated as corruption
const MAX_STRING_LEN: usize = 64 * 1024;

/// Little-endian record encoder with a running CRC-32
pub struct RecordWriter<W: ByteSink> {
    sink: W,
    hasher: crc32fast::Hasher,
    written: usize,
}

impl<W: ByteSink> RecordWriter<W> {
    /// Wrap a write handle
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            hasher: crc32fast::Hasher::new(),
            written: 0,
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.sink.write_all(bytes)?;
        self.hasher.update(bytes);
        self.written += bytes.len();
        Ok(())
    }

    /// Append a byte
    pub fn put_u8(&mut self, value: u8) -> Result<(), StorageError> {
        self.put(&[value])
    }

    /// Append a `u16`
    pub fn put_u16(&mut self, value: u16) -> Result<(), StorageError> {
        self.put(&value.to_le_bytes())
    }

    /// Append a `u32`
    pub fn put_u32(&mut self, value: u32) -> Result<(), StorageError> {
        self.put(&value.to_le_bytes())
    }

    /// Append an optional index as `i32`, `-1` for `None`
    pub fn put_index(&mut self, value: Option<usize>) -> Result<(), StorageError> {
        let encoded = value.and_then(|v| i32::try_from(v).ok()).unwrap_or(-1);
        self.put(&encoded.to_le_bytes())
    }

    /// Append a length-prefixed string
    pub fn put_str(&mut self, value: &str) -> Result<(), StorageError> {
        let len = u32::try_from(value.len())
            .map_err(|_| StorageError::Io(format!("string of {} bytes", value.len())))?;
        self.put_u32(len)?;
        self.put(value.as_bytes())
    }

    /// Bytes written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Append the CRC-32 trailer and flush, returning the handle
    pub fn finish_with_crc(mut self) -> Result<W, StorageError> {
        let crc = self.hasher.clone().finalize();
        self.sink.write_all(&crc.to_le_bytes())?;
        self.sink.flush()?;
        Ok(self.sink)
    }

    /// Flush without a trailer, returning the handle
    pub fn finish(mut self) -> Result<W, StorageError> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// Little-endian record decoder
pub struct RecordReader<R: ByteSource> {
    source: R,
}

fn truncated(err: StorageError) -> IndexError {
    match err {
        StorageError::UnexpectedEof => IndexError::Corrupt("truncated record".into()),
        other => IndexError::CacheIo(other),
    }
}

impl<R: ByteSource> RecordReader<R> {
    /// Wrap a read handle
    pub fn new(source: R) -> Self {
        Self { source }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], IndexError> {
        let mut buf = [0u8; N];
        self.source.read_exact(&mut buf).map_err(truncated)?;
        Ok(buf)
    }

    /// Read a byte
    pub fn take_u8(&mut self) -> Result<u8, IndexError> {
        Ok(self.take::<1>()?[0])
    }

    /// Read a `u16`
    pub fn take_u16(&mut self) -> Result<u16, IndexError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    /// Read a `u32`
    pub fn take_u32(&mut self) -> Result<u32, IndexError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    /// Read an optional index written by [`RecordWriter::put_index`]
    pub fn take_index(&mut self) -> Result<Option<usize>, IndexError> {
        let value = i32::from_le_bytes(self.take()?);
        Ok(usize::try_from(value).ok())
    }

    /// Read a length-prefixed string
    pub fn take_str(&mut self) -> Result<String, IndexError> {
        let len = self.take_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(IndexError::Corrupt(format!("string length {}", len)));
        }
        let mut bytes = vec![0u8; len];
        self.source.read_exact(&mut bytes).map_err(truncated)?;
        String::from_utf8(bytes).map_err(|_| IndexError::Corrupt("invalid UTF-8".into()))
    }

    /// Read a count field, rejecting values larger than `limit`
    pub fn take_count(&mut self, limit: usize) -> Result<usize, IndexError> {
        let count = self.take_u32()? as usize;
        if count > limit {
            return Err(IndexError::Corrupt(format!("count {} exceeds {}", count, limit)));
        }
        Ok(count)
    }
}

/// Layout header of `book.bin`
pub fn write_header<W: ByteSink>(w: &mut RecordWriter<W>, source_path: &str) -> Result<(), StorageError> {
    w.put(&INDEX_MAGIC)?;
    w.put_u16(INDEX_VERSION)?;
    w.put_u16(0)?;
    w.put_str(source_path)
}

/// Validate the header and return the stored source path
pub fn read_header<R: ByteSource>(r: &mut RecordReader<R>) -> Result<String, IndexError> {
    let magic: [u8; 4] = r.take()?;
    if magic != INDEX_MAGIC {
        return Err(IndexError::Corrupt("bad magic".into()));
    }
    let version = r.take_u16()?;
    if version != INDEX_VERSION {
        return Err(IndexError::Corrupt(format!(
            "version mismatch (found {}, expected {})",
            version, INDEX_VERSION
        )));
    }
    let _reserved = r.take_u16()?;
    r.take_str()
}

/// Split `book.bin` bytes into body and verify the CRC trailer
pub fn verified_body(bytes: &[u8]) -> Result<&[u8], IndexError> {
    if bytes.len() < INDEX_MAGIC.len() + 4 {
        return Err(IndexError::Corrupt("file too short".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != stored {
        return Err(IndexError::Corrupt("checksum mismatch".into()));
    }
    Ok(body)
}

/// Write core metadata fields
pub fn write_metadata<W: ByteSink>(
    w: &mut RecordWriter<W>,
    metadata: &CoreMetadata,
) -> Result<(), StorageError> {
    w.put_str(&metadata.title)?;
    w.put_str(&metadata.author)?;
    w.put_str(&metadata.language)?;
    w.put_str(&metadata.cover_item_href)?;
    w.put_str(&metadata.text_reference_href)
}

/// Read core metadata fields
pub fn read_metadata<R: ByteSource>(r: &mut RecordReader<R>) -> Result<CoreMetadata, IndexError> {
    Ok(CoreMetadata {
        title: r.take_str()?,
        author: r.take_str()?,
        language: r.take_str()?,
        cover_item_href: r.take_str()?,
        text_reference_href: r.take_str()?,
    })
}

/// Write a spine table record
pub fn write_spine_entry<W: ByteSink>(
    w: &mut RecordWriter<W>,
    entry: &SpineEntry,
) -> Result<(), StorageError> {
    w.put_str(&entry.href)?;
    w.put_u32(entry.cumulative_size)?;
    w.put_index(entry.toc_index)
}

/// Read a spine table record
pub fn read_spine_entry<R: ByteSource>(r: &mut RecordReader<R>) -> Result<SpineEntry, IndexError> {
    Ok(SpineEntry {
        href: r.take_str()?,
        cumulative_size: r.take_u32()?,
        toc_index: r.take_index()?,
    })
}

/// Write a TOC table record
pub fn write_toc_entry<W: ByteSink>(
    w: &mut RecordWriter<W>,
    entry: &TocEntry,
) -> Result<(), StorageError> {
    w.put_str(&entry.title)?;
    w.put_str(&entry.href)?;
    w.put_str(&entry.anchor)?;
    w.put_u8(entry.level)?;
    w.put_index(entry.spine_index)
}

/// Read a TOC table record
pub fn read_toc_entry<R: ByteSource>(r: &mut RecordReader<R>) -> Result<TocEntry, IndexError> {
    Ok(TocEntry {
        title: r.take_str()?,
        href: r.take_str()?,
        anchor: r.take_str()?,
        level: r.take_u8()?,
        spine_index: r.take_index()?,
    })
}

/// Write an unresolved TOC record to the scratch file
pub fn write_toc_draft<W: ByteSink>(
    w: &mut RecordWriter<W>,
    entry: &TocDraft,
) -> Result<(), StorageError> {
    w.put_str(&entry.title)?;
    w.put_str(&entry.href)?;
    w.put_str(&entry.anchor)?;
    w.put_u8(entry.level)
}

/// Read an unresolved TOC record from the scratch file
pub fn read_toc_draft<R: ByteSource>(r: &mut RecordReader<R>) -> Result<TocDraft, IndexError> {
    Ok(TocDraft {
        title: r.take_str()?,
        href: r.take_str()?,
        anchor: r.take_str()?,
        level: r.take_u8()?,
    })
}
