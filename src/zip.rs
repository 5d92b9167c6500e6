//! Streaming ZIP archive accessor
//!
//! Reads the central directory once into a fixed-capacity table and streams
//! individual entries through bounded input/output buffers. Stored and
//! DEFLATE entries are supported; DEFLATE goes through `miniz_oxide` and
//! every entry is CRC-checked with `crc32fast` as it streams.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use heapless::Vec as HeaplessVec;
use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZFlush, MZStatus};
use std::io::{Read, Seek, SeekFrom};

use crate::archive::{Archive, ChunkSink};
use crate::error::IndexError;

pub use crate::error::ZipError;

/// Maximum number of central directory entries kept
const MAX_CD_ENTRIES: usize = 512;

/// Maximum filename length in ZIP entries
const MAX_FILENAME_LEN: usize = 512;

/// Local file header signature (little-endian)
const SIG_LOCAL_FILE_HEADER: u32 = 0x04034b50;
/// Central directory entry signature (little-endian)
const SIG_CD_ENTRY: u32 = 0x02014b50;
/// End of central directory signature (little-endian)
const SIG_EOCD: u32 = 0x06054b50;
/// ZIP64 end of central directory locator signature (little-endian)
const SIG_ZIP64_EOCD_LOCATOR: u32 = 0x07064b50;
/// Minimum EOCD record size in bytes
const EOCD_MIN_SIZE: usize = 22;
/// Maximum EOCD search window (EOCD + max comment length)
const MAX_EOCD_SCAN: usize = EOCD_MIN_SIZE + u16::MAX as usize;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Runtime-configurable ZIP safety limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZipLimits {
    /// Maximum compressed or uncompressed entry size allowed for reads.
    pub max_file_read_size: usize,
    /// Whether ZIP parsing should fail on strict structural issues.
    pub strict: bool,
    /// Maximum bytes scanned from file tail while searching for EOCD.
    pub max_eocd_scan: usize,
}

impl Default for ZipLimits {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl ZipLimits {
    /// Create explicit ZIP limits.
    pub fn new(max_file_read_size: usize) -> Self {
        Self {
            max_file_read_size,
            strict: false,
            max_eocd_scan: MAX_EOCD_SCAN,
        }
    }

    /// Enable or disable strict ZIP parsing behavior.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set a cap for EOCD tail scan bytes.
    pub fn with_max_eocd_scan(mut self, max_eocd_scan: usize) -> Self {
        self.max_eocd_scan = max_eocd_scan.max(EOCD_MIN_SIZE);
        self
    }
}

#[derive(Clone, Copy, Debug)]
struct EocdInfo {
    cd_offset: u64,
    cd_size: u32,
    num_entries: u16,
    uses_zip64: bool,
}

/// Central directory entry metadata
#[derive(Debug, Clone, Default)]
pub struct CdEntry {
    /// Compression method (0=stored, 8=deflated)
    pub method: u16,
    /// Compressed size in bytes
    pub compressed_size: u32,
    /// Uncompressed size in bytes
    pub uncompressed_size: u32,
    /// Offset to local file header
    pub local_header_offset: u32,
    /// CRC32 checksum
    pub crc32: u32,
    /// Entry path inside the archive
    pub filename: String,
}

fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// EPUB container backed by a seekable ZIP stream
pub struct ZipArchive<F: Read + Seek> {
    file: F,
    entries: HeaplessVec<CdEntry, MAX_CD_ENTRIES>,
    limits: ZipLimits,
}

/// Open the ZIP file at `path` with default limits
pub fn open_zip_file(path: &str) -> Result<ZipArchive<std::io::BufReader<std::fs::File>>, ZipError> {
    let file = std::fs::File::open(path).map_err(|err| {
        log::warn!("[ZIP] Cannot open {}: {}", path, err);
        ZipError::IoError
    })?;
    ZipArchive::new(std::io::BufReader::new(file))
}

impl<F: Read + Seek> ZipArchive<F> {
    /// Parse the central directory of `file` with default limits
    pub fn new(file: F) -> Result<Self, ZipError> {
        Self::with_limits(file, ZipLimits::default())
    }

    /// Parse the central directory of `file` with explicit limits
    pub fn with_limits(mut file: F, limits: ZipLimits) -> Result<Self, ZipError> {
        let eocd = Self::find_eocd(&mut file, limits.max_eocd_scan.min(MAX_EOCD_SCAN))?;
        if eocd.uses_zip64 {
            return Err(ZipError::UnsupportedZip64);
        }
        if limits.strict && eocd.num_entries as usize > MAX_CD_ENTRIES {
            return Err(ZipError::CentralDirFull);
        }

        let mut entries: HeaplessVec<CdEntry, MAX_CD_ENTRIES> = HeaplessVec::new();
        file.seek(SeekFrom::Start(eocd.cd_offset))
            .map_err(|_| ZipError::IoError)?;
        let cd_end = eocd.cd_offset + eocd.cd_size as u64;

        for _ in 0..eocd.num_entries.min(MAX_CD_ENTRIES as u16) {
            let pos = file.stream_position().map_err(|_| ZipError::IoError)?;
            if pos >= cd_end {
                if limits.strict {
                    return Err(ZipError::InvalidFormat);
                }
                break;
            }
            match Self::read_cd_entry(&mut file)? {
                Some(entry) if entry.filename.is_empty() => continue,
                Some(entry) => entries.push(entry).map_err(|_| ZipError::CentralDirFull)?,
                None if limits.strict => return Err(ZipError::InvalidFormat),
                None => break,
            }
        }

        if eocd.num_entries as usize > MAX_CD_ENTRIES {
            log::warn!(
                "[ZIP] Archive has {} entries but only {} were loaded (max: {})",
                eocd.num_entries,
                entries.len(),
                MAX_CD_ENTRIES
            );
        }
        log::debug!(
            "[ZIP] Parsed {} central directory entries (offset {})",
            entries.len(),
            eocd.cd_offset
        );

        Ok(Self {
            file,
            entries,
            limits,
        })
    }

    fn find_eocd(file: &mut F, max_eocd_scan: usize) -> Result<EocdInfo, ZipError> {
        let file_size = file.seek(SeekFrom::End(0)).map_err(|_| ZipError::IoError)?;
        if file_size < EOCD_MIN_SIZE as u64 {
            return Err(ZipError::InvalidFormat);
        }

        let scan_range = file_size.min(max_eocd_scan as u64) as usize;
        let mut buffer = vec![0u8; scan_range];
        file.seek(SeekFrom::Start(file_size - scan_range as u64))
            .map_err(|_| ZipError::IoError)?;
        file.read_exact(&mut buffer).map_err(|_| ZipError::IoError)?;
        let scan_base = file_size - scan_range as u64;

        for i in (0..=scan_range - EOCD_MIN_SIZE).rev() {
            if read_u32_le(&buffer, i) != SIG_EOCD {
                continue;
            }
            let num_entries = read_u16_le(&buffer, i + 10);
            let cd_size = read_u32_le(&buffer, i + 12);
            let cd_offset = read_u32_le(&buffer, i + 16) as u64;
            let comment_len = read_u16_le(&buffer, i + 20) as u64;
            let eocd_pos = scan_base + i as u64;
            if eocd_pos + EOCD_MIN_SIZE as u64 + comment_len != file_size {
                continue;
            }

            let cd_end = cd_offset
                .checked_add(cd_size as u64)
                .ok_or(ZipError::InvalidFormat)?;
            if cd_end > eocd_pos {
                return Err(ZipError::InvalidFormat);
            }

            let uses_zip64_sentinel =
                num_entries == u16::MAX || cd_size == u32::MAX || cd_offset == u32::MAX as u64;
            let uses_zip64_locator = if eocd_pos >= 20 {
                file.seek(SeekFrom::Start(eocd_pos - 20))
                    .map_err(|_| ZipError::IoError)?;
                let mut locator_sig = [0u8; 4];
                file.read_exact(&mut locator_sig)
                    .map_err(|_| ZipError::IoError)?;
                u32::from_le_bytes(locator_sig) == SIG_ZIP64_EOCD_LOCATOR
            } else {
                false
            };

            return Ok(EocdInfo {
                cd_offset,
                cd_size,
                num_entries,
                uses_zip64: uses_zip64_sentinel || uses_zip64_locator,
            });
        }

        Err(ZipError::InvalidFormat)
    }

    fn read_cd_entry(file: &mut F) -> Result<Option<CdEntry>, ZipError> {
        let mut sig_buf = [0u8; 4];
        if file.read_exact(&mut sig_buf).is_err() {
            return Ok(None);
        }
        if u32::from_le_bytes(sig_buf) != SIG_CD_ENTRY {
            return Ok(None);
        }

        // Fixed part after the signature; buf[N] is record offset N + 4.
        let mut buf = [0u8; 42];
        file.read_exact(&mut buf).map_err(|_| ZipError::IoError)?;

        let mut entry = CdEntry {
            method: read_u16_le(&buf, 6),
            crc32: read_u32_le(&buf, 12),
            compressed_size: read_u32_le(&buf, 16),
            uncompressed_size: read_u32_le(&buf, 20),
            local_header_offset: read_u32_le(&buf, 38),
            ..CdEntry::default()
        };
        let name_len = read_u16_le(&buf, 24) as usize;
        let extra_len = read_u16_le(&buf, 26) as usize;
        let comment_len = read_u16_le(&buf, 28) as usize;

        if name_len <= MAX_FILENAME_LEN {
            let mut name_buf = vec![0u8; name_len];
            file.read_exact(&mut name_buf)
                .map_err(|_| ZipError::IoError)?;
            entry.filename = String::from_utf8_lossy(&name_buf).into_owned();
        } else {
            log::warn!("[ZIP] Skipping entry with {} byte name", name_len);
            file.seek(SeekFrom::Current(name_len as i64))
                .map_err(|_| ZipError::IoError)?;
        }

        let skip_bytes = extra_len + comment_len;
        if skip_bytes > 0 {
            file.seek(SeekFrom::Current(skip_bytes as i64))
                .map_err(|_| ZipError::IoError)?;
        }

        Ok(Some(entry))
    }

    /// Entry with exactly this path, falling back to a case-insensitive match
    pub fn get_entry(&self, name: &str) -> Option<&CdEntry> {
        let name = name.strip_prefix('/').unwrap_or(name);
        self.entries
            .iter()
            .find(|e| e.filename == name)
            .or_else(|| self.entries.iter().find(|e| e.filename.eq_ignore_ascii_case(name)))
    }

    /// Number of entries loaded from the central directory
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries
    pub fn entries(&self) -> impl Iterator<Item = &CdEntry> {
        self.entries.iter()
    }

    /// Active limits
    pub fn limits(&self) -> ZipLimits {
        self.limits
    }

    fn calc_data_offset(&mut self, entry: &CdEntry) -> Result<u64, ZipError> {
        let offset = entry.local_header_offset as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| ZipError::IoError)?;
        let mut header = [0u8; 30];
        self.file
            .read_exact(&mut header)
            .map_err(|_| ZipError::IoError)?;
        if read_u32_le(&header, 0) != SIG_LOCAL_FILE_HEADER {
            return Err(ZipError::InvalidFormat);
        }
        let name_len = read_u16_le(&header, 26) as u64;
        let extra_len = read_u16_le(&header, 28) as u64;
        Ok(offset + 30 + name_len + extra_len)
    }

    /// Stream an entry's inflated bytes into `sink` through caller buffers
    ///
    /// Each chunk handed to `sink` is at most `output_buf.len()` bytes.
    pub fn stream_entry(
        &mut self,
        entry: &CdEntry,
        sink: &mut dyn ChunkSink,
        input_buf: &mut [u8],
        output_buf: &mut [u8],
    ) -> Result<usize, IndexError> {
        if input_buf.is_empty() || output_buf.is_empty() {
            return Err(ZipError::BufferTooSmall.into());
        }
        let max = self.limits.max_file_read_size;
        if entry.uncompressed_size as usize > max || entry.compressed_size as usize > max {
            return Err(ZipError::FileTooLarge.into());
        }

        let data_offset = self.calc_data_offset(entry)?;
        self.file
            .seek(SeekFrom::Start(data_offset))
            .map_err(|_| ZipError::IoError)?;

        let mut hasher = crc32fast::Hasher::new();
        let written = match entry.method {
            METHOD_STORED => {
                let mut remaining = entry.compressed_size as usize;
                let buf_len = input_buf.len().min(output_buf.len());
                let mut written = 0usize;
                while remaining > 0 {
                    let take = remaining.min(buf_len);
                    self.file
                        .read_exact(&mut input_buf[..take])
                        .map_err(|_| ZipError::IoError)?;
                    hasher.update(&input_buf[..take]);
                    sink.write_chunk(&input_buf[..take])?;
                    written += take;
                    remaining -= take;
                }
                written
            }
            METHOD_DEFLATED => self.inflate_into(entry, sink, &mut hasher, input_buf, output_buf)?,
            _ => return Err(ZipError::UnsupportedCompression.into()),
        };

        if entry.crc32 != 0 && hasher.finalize() != entry.crc32 {
            log::warn!("[ZIP] CRC mismatch in {}", entry.filename);
            return Err(ZipError::CrcMismatch.into());
        }
        Ok(written)
    }

    fn inflate_into(
        &mut self,
        entry: &CdEntry,
        sink: &mut dyn ChunkSink,
        hasher: &mut crc32fast::Hasher,
        input_buf: &mut [u8],
        output_buf: &mut [u8],
    ) -> Result<usize, IndexError> {
        let mut state = Box::new(InflateState::new(DataFormat::Raw));
        let mut compressed_remaining = entry.compressed_size as usize;
        let mut pending_start = 0usize;
        let mut pending_end = 0usize;
        let mut written = 0usize;

        loop {
            if pending_start == pending_end && compressed_remaining > 0 {
                let take = compressed_remaining.min(input_buf.len());
                self.file
                    .read_exact(&mut input_buf[..take])
                    .map_err(|_| ZipError::IoError)?;
                pending_start = 0;
                pending_end = take;
                compressed_remaining -= take;
            }

            let flush = if compressed_remaining == 0 {
                MZFlush::Finish
            } else {
                MZFlush::None
            };
            let result = inflate(
                &mut state,
                &input_buf[pending_start..pending_end],
                output_buf,
                flush,
            );
            let consumed = result.bytes_consumed;
            let produced = result.bytes_written;
            pending_start += consumed;

            if produced > 0 {
                hasher.update(&output_buf[..produced]);
                sink.write_chunk(&output_buf[..produced])?;
                written += produced;
                if written > entry.uncompressed_size as usize {
                    return Err(ZipError::DecompressError.into());
                }
            }

            match result.status {
                Ok(MZStatus::StreamEnd) => {
                    if compressed_remaining != 0 || pending_start != pending_end {
                        return Err(ZipError::DecompressError.into());
                    }
                    return Ok(written);
                }
                Ok(MZStatus::Ok) => {
                    if consumed == 0 && produced == 0 {
                        return Err(ZipError::DecompressError.into());
                    }
                }
                Ok(MZStatus::NeedDict) | Err(_) => return Err(ZipError::DecompressError.into()),
            }
        }
    }
}

impl<F: Read + Seek> Archive for ZipArchive<F> {
    fn size_of(&self, path: &str) -> Option<usize> {
        self.get_entry(path).map(|e| e.uncompressed_size as usize)
    }

    fn stream_to(
        &mut self,
        path: &str,
        sink: &mut dyn ChunkSink,
        chunk_size: usize,
    ) -> Result<usize, IndexError> {
        if chunk_size == 0 {
            return Err(ZipError::BufferTooSmall.into());
        }
        let entry = self.get_entry(path).cloned().ok_or(ZipError::FileNotFound)?;
        let mut input_buf = vec![0u8; chunk_size];
        let mut output_buf = vec![0u8; chunk_size];
        self.stream_entry(&entry, sink, &mut input_buf, &mut output_buf)
    }
}
