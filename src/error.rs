//! Unified error types for epub_index
//!
//! Provides a top-level `IndexError` that wraps module-specific errors,
//! plus `From` impls so `?` works across module boundaries.

extern crate alloc;

use alloc::string::String;
use core::fmt;

/// Top-level error type for index build, load and asset operations
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IndexError {
    /// Container descriptor or content manifest is missing or unreadable
    ArchiveUnreadable(String),
    /// A structural parser consumed fewer bytes than it was given
    ParseTruncated {
        /// Archive path of the document being streamed.
        document: String,
        /// Bytes handed to the parser in the failing chunk.
        supplied: usize,
        /// Bytes the parser reported as consumed.
        consumed: usize,
    },
    /// A structural parser rejected its input
    Parse(ParseError),
    /// Neither the nav document nor the NCX produced a table of contents
    TocUnavailable,
    /// Storage failure while building, loading or writing assets
    CacheIo(StorageError),
    /// Cover image extension is not a supported raster format
    AssetUnsupportedFormat {
        /// Archive path of the rejected image.
        href: String,
    },
    /// Raster converter rejected the cover image
    AssetConversionFailed {
        /// Archive path of the image that failed to convert.
        href: String,
    },
    /// No committed index exists in the cache directory
    NotFound,
    /// The committed index failed format validation
    Corrupt(String),
    /// The committed index belongs to a different source file
    SourceMismatch {
        /// Source path the caller asked for.
        expected: String,
        /// Source path recorded in the index.
        found: String,
    },
    /// Operation requires a loaded index
    NotLoaded,
    /// ZIP archive error
    Zip(ZipError),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::ArchiveUnreadable(msg) => write!(f, "Archive unreadable: {}", msg),
            IndexError::ParseTruncated {
                document,
                supplied,
                consumed,
            } => write!(
                f,
                "Parser stopped early in {} (consumed {} of {} bytes)",
                document, consumed, supplied
            ),
            IndexError::Parse(err) => write!(f, "Parse error: {}", err),
            IndexError::TocUnavailable => write!(f, "No table of contents available"),
            IndexError::CacheIo(err) => write!(f, "Cache I/O error: {}", err),
            IndexError::AssetUnsupportedFormat { href } => {
                write!(f, "Unsupported cover image format: {}", href)
            }
            IndexError::AssetConversionFailed { href } => {
                write!(f, "Cover image conversion failed: {}", href)
            }
            IndexError::NotFound => write!(f, "Index not found"),
            IndexError::Corrupt(msg) => write!(f, "Corrupt index: {}", msg),
            IndexError::SourceMismatch { expected, found } => write!(
                f,
                "Index belongs to '{}', expected '{}'",
                found, expected
            ),
            IndexError::NotLoaded => write!(f, "Index not loaded"),
            IndexError::Zip(kind) => write!(f, "ZIP error: {}", kind),
        }
    }
}

/// Errors raised by the streaming structural parsers
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Markup is not well formed
    Malformed(String),
    /// A configured parser limit was hit
    LimitExceeded(&'static str),
    /// The document was well formed but lacked required content
    Missing(&'static str),
    /// The event sink failed to persist parsed output
    Sink(StorageError),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Malformed(msg) => write!(f, "malformed markup: {}", msg),
            ParseError::LimitExceeded(what) => write!(f, "limit exceeded: {}", what),
            ParseError::Missing(what) => write!(f, "missing {}", what),
            ParseError::Sink(err) => write!(f, "sink failed: {}", err),
        }
    }
}

/// Storage backend errors (description only, since `std::io::Error` is not `Clone`)
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    /// Path does not exist
    NotFound(String),
    /// Read, write or metadata failure
    Io(String),
    /// Handle reached end of file before the requested bytes were read
    UnexpectedEof,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(path) => write!(f, "not found: {}", path),
            StorageError::Io(msg) => write!(f, "{}", msg),
            StorageError::UnexpectedEof => write!(f, "unexpected end of file"),
        }
    }
}

/// ZIP-specific error variants
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ZipErrorKind {
    /// File not found in archive
    FileNotFound,
    /// Invalid ZIP format
    InvalidFormat,
    /// Unsupported compression method
    UnsupportedCompression,
    /// Decompression failed
    DecompressError,
    /// CRC32 mismatch
    CrcMismatch,
    /// I/O error during ZIP operations
    IoError,
    /// Central directory full (exceeded max entries)
    CentralDirFull,
    /// Scratch buffer is empty
    BufferTooSmall,
    /// File exceeds maximum allowed size
    FileTooLarge,
    /// ZIP64 structures are present but unsupported
    UnsupportedZip64,
}

/// Public ZIP error type alias used across the crate API.
pub type ZipError = ZipErrorKind;

impl fmt::Display for ZipErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZipErrorKind::FileNotFound => write!(f, "file not found in archive"),
            ZipErrorKind::InvalidFormat => write!(f, "invalid ZIP format"),
            ZipErrorKind::UnsupportedCompression => write!(f, "unsupported compression method"),
            ZipErrorKind::DecompressError => write!(f, "decompression failed"),
            ZipErrorKind::CrcMismatch => write!(f, "CRC32 checksum mismatch"),
            ZipErrorKind::IoError => write!(f, "I/O error"),
            ZipErrorKind::CentralDirFull => write!(f, "central directory full"),
            ZipErrorKind::BufferTooSmall => write!(f, "buffer too small"),
            ZipErrorKind::FileTooLarge => write!(f, "file too large"),
            ZipErrorKind::UnsupportedZip64 => write!(f, "ZIP64 is not supported"),
        }
    }
}

/// Failure reported by a raster converter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterError(pub String);

impl fmt::Display for RasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raster conversion failed: {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for IndexError {}

#[cfg(feature = "std")]
impl std::error::Error for ParseError {}

#[cfg(feature = "std")]
impl std::error::Error for StorageError {}

#[cfg(feature = "std")]
impl std::error::Error for ZipErrorKind {}

#[cfg(feature = "std")]
impl std::error::Error for RasterError {}

impl From<ZipErrorKind> for IndexError {
    fn from(err: ZipErrorKind) -> Self {
        IndexError::Zip(err)
    }
}

impl From<StorageError> for IndexError {
    fn from(err: StorageError) -> Self {
        IndexError::CacheIo(err)
    }
}

impl From<ParseError> for IndexError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Sink(storage) => IndexError::CacheIo(storage),
            other => IndexError::Parse(other),
        }
    }
}

impl From<StorageError> for ParseError {
    fn from(err: StorageError) -> Self {
        ParseError::Sink(err)
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            std::io::ErrorKind::UnexpectedEof => StorageError::UnexpectedEof,
            _ => StorageError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_error_display() {
        let err = IndexError::Corrupt("bad magic".into());
        assert_eq!(format!("{}", err), "Corrupt index: bad magic");
    }

    #[test]
    fn test_parse_truncated_display_names_document() {
        let err = IndexError::ParseTruncated {
            document: "OEBPS/nav.xhtml".into(),
            supplied: 1024,
            consumed: 700,
        };
        let display = format!("{}", err);
        assert!(display.contains("OEBPS/nav.xhtml"));
        assert!(display.contains("700 of 1024"));
    }

    #[test]
    fn test_sink_parse_error_becomes_cache_io() {
        let err: IndexError = ParseError::Sink(StorageError::Io("disk full".into())).into();
        assert_eq!(err, IndexError::CacheIo(StorageError::Io("disk full".into())));
    }

    #[test]
    fn test_malformed_parse_error_stays_parse() {
        let err: IndexError = ParseError::Malformed("unexpected </li>".into()).into();
        assert!(matches!(err, IndexError::Parse(ParseError::Malformed(_))));
    }

    #[test]
    fn test_zip_error_wraps() {
        let err: IndexError = ZipErrorKind::CrcMismatch.into();
        assert!(format!("{}", err).contains("ZIP error"));
    }
}
