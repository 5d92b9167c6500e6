//! Storage abstraction for the book cache
//!
//! The cache engine never touches a filesystem directly. It goes through
//! [`Storage`], so the same build and load code runs against an SD card
//! driver, `std::fs` ([`FsStorage`]) or the in-memory [`MemStorage`].

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::error::StorageError;

/// Write handle returned by [`Storage::open_write`]
pub trait ByteSink {
    /// Write every byte of `bytes`.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Push buffered bytes to the backing medium.
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Read handle returned by [`Storage::open_read`]
pub trait ByteSource {
    /// Read up to `buf.len()` bytes, returning 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Fill `buf` completely or fail with [`StorageError::UnexpectedEof`].
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(StorageError::UnexpectedEof);
            }
            filled += n;
        }
        Ok(())
    }
}

impl ByteSink for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl ByteSource for &[u8] {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let n = buf.len().min(self.len());
        let (head, tail) = self.split_at(n);
        buf[..n].copy_from_slice(head);
        *self = tail;
        Ok(n)
    }
}

/// Synchronous storage primitives used by the index builder, reader and asset manager
pub trait Storage {
    /// Read handle type
    type Reader: ByteSource;
    /// Write handle type
    type Writer: ByteSink;

    /// Whether a file or directory exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// Size in bytes of the file at `path`
    fn file_size(&self, path: &str) -> Option<u64>;

    /// Create `path` and any missing parents
    fn create_dir_all(&self, path: &str) -> Result<(), StorageError>;

    /// Remove a single file
    fn remove_file(&self, path: &str) -> Result<(), StorageError>;

    /// Remove a directory and everything below it
    fn remove_dir_all(&self, path: &str) -> Result<(), StorageError>;

    /// Rename `from` to `to`, replacing any existing file at `to`
    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Open an existing file for reading
    fn open_read(&self, path: &str) -> Result<Self::Reader, StorageError>;

    /// Create or truncate a file for writing
    fn open_write(&self, path: &str) -> Result<Self::Writer, StorageError>;

    /// Read a whole file into memory
    fn read_all(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.open_read(path)?;
        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}

/// Join a directory and a file name with a single `/`
pub fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

#[derive(Default)]
struct MemState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

/// In-memory storage backend
///
/// Clones share the same contents, so a test can keep a handle while the
/// code under test owns another.
#[derive(Clone, Default)]
pub struct MemStorage {
    state: Rc<RefCell<MemState>>,
}

impl MemStorage {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file
    pub fn insert(&self, path: &str, content: &[u8]) {
        self.state
            .borrow_mut()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    /// Copy of a file's content, if present
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.borrow().files.get(path).cloned()
    }

    /// Paths of every file currently stored, in sorted order
    pub fn file_paths(&self) -> Vec<String> {
        self.state.borrow().files.keys().cloned().collect()
    }
}

fn is_below(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// Write handle into a [`MemStorage`] file
pub struct MemWriter {
    state: Rc<RefCell<MemState>>,
    path: String,
}

impl ByteSink for MemWriter {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        match state.files.get_mut(&self.path) {
            Some(content) => {
                content.extend_from_slice(bytes);
                Ok(())
            }
            None => Err(StorageError::NotFound(self.path.clone())),
        }
    }
}

/// Read handle over a snapshot of a [`MemStorage`] file
pub struct MemReader {
    content: Vec<u8>,
    pos: usize,
}

impl ByteSource for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let remaining = &self.content[self.pos..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Storage for MemStorage {
    type Reader = MemReader;
    type Writer = MemWriter;

    fn exists(&self, path: &str) -> bool {
        let state = self.state.borrow();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    fn file_size(&self, path: &str) -> Option<u64> {
        self.state
            .borrow()
            .files
            .get(path)
            .map(|content| content.len() as u64)
    }

    fn create_dir_all(&self, path: &str) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() || path.starts_with('/') {
                prefix.push('/');
            }
            prefix.push_str(segment);
            state.dirs.insert(prefix.clone());
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<(), StorageError> {
        match self.state.borrow_mut().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn remove_dir_all(&self, path: &str) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        if !state.dirs.contains(path) {
            return Err(StorageError::NotFound(path.to_string()));
        }
        state.files.retain(|file, _| !is_below(file, path));
        state.dirs.retain(|dir| dir != path && !is_below(dir, path));
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        let content = state
            .files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        state.files.insert(to.to_string(), content);
        Ok(())
    }

    fn open_read(&self, path: &str) -> Result<MemReader, StorageError> {
        let content = self
            .state
            .borrow()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(MemReader { content, pos: 0 })
    }

    fn open_write(&self, path: &str) -> Result<MemWriter, StorageError> {
        self.state
            .borrow_mut()
            .files
            .insert(path.to_string(), Vec::new());
        Ok(MemWriter {
            state: Rc::clone(&self.state),
            path: path.to_string(),
        })
    }
}

#[cfg(feature = "std")]
pub use self::fs::FsStorage;

#[cfg(feature = "std")]
mod fs {
    use super::{ByteSink, ByteSource, Storage};
    use crate::error::StorageError;
    use std::io::{BufReader, BufWriter, Read, Write};

    /// `std::fs` storage backend; paths are passed through unchanged
    #[derive(Clone, Copy, Debug, Default)]
    pub struct FsStorage;

    impl FsStorage {
        /// Create a filesystem-backed store
        pub fn new() -> Self {
            Self
        }
    }

    impl ByteSink for BufWriter<std::fs::File> {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
            Write::write_all(self, bytes).map_err(StorageError::from)
        }

        fn flush(&mut self) -> Result<(), StorageError> {
            Write::flush(self).map_err(StorageError::from)
        }
    }

    impl ByteSource for BufReader<std::fs::File> {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
            Read::read(self, buf).map_err(StorageError::from)
        }
    }

    impl Storage for FsStorage {
        type Reader = BufReader<std::fs::File>;
        type Writer = BufWriter<std::fs::File>;

        fn exists(&self, path: &str) -> bool {
            std::path::Path::new(path).exists()
        }

        fn file_size(&self, path: &str) -> Option<u64> {
            std::fs::metadata(path)
                .ok()
                .filter(|meta| meta.is_file())
                .map(|meta| meta.len())
        }

        fn create_dir_all(&self, path: &str) -> Result<(), StorageError> {
            std::fs::create_dir_all(path).map_err(StorageError::from)
        }

        fn remove_file(&self, path: &str) -> Result<(), StorageError> {
            std::fs::remove_file(path).map_err(StorageError::from)
        }

        fn remove_dir_all(&self, path: &str) -> Result<(), StorageError> {
            std::fs::remove_dir_all(path).map_err(StorageError::from)
        }

        fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
            std::fs::rename(from, to).map_err(StorageError::from)
        }

        fn open_read(&self, path: &str) -> Result<Self::Reader, StorageError> {
            let file = std::fs::File::open(path)?;
            Ok(BufReader::new(file))
        }

        fn open_write(&self, path: &str) -> Result<Self::Writer, StorageError> {
            let file = std::fs::File::create(path)?;
            Ok(BufWriter::new(file))
        }
    }
}
