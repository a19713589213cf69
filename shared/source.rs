use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open '{}': {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "Short read at byte offset {offset}: requested {requested} bytes but only {available} are available."
    )]
    ShortRead {
        offset: u64,
        requested: usize,
        available: u64,
    },
    #[error("Source holds {found} bytes but the matrix layout needs {expected}.")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("Failed to write '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed line {line} in '{}': {reason}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Random-access, read-only bytes. Implementations must be shareable between
/// the worker threads of a process.
pub trait ByteSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `dst` with the bytes starting at `offset`, or fails with a
    /// `ShortRead` naming how much was actually there.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<(), SourceError>;
}

fn copy_range(bytes: &[u8], offset: u64, dst: &mut [u8]) -> Result<(), SourceError> {
    let requested = dst.len();
    let available = (bytes.len() as u64).saturating_sub(offset);
    let short = move || SourceError::ShortRead {
        offset,
        requested,
        available,
    };
    let start = usize::try_from(offset).map_err(|_| short())?;
    let end = start.checked_add(requested).ok_or_else(short)?;
    let src = bytes.get(start..end).ok_or_else(short)?;
    dst.copy_from_slice(src);
    Ok(())
}

/// A file on local storage, memory-mapped read-only.
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let open_err = |source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_err)?;
        // SAFETY: the mapping is read-only and the input files are not
        // modified while a run is in progress.
        let mmap = unsafe { Mmap::map(&file) }.map_err(open_err)?;
        Ok(Self { mmap })
    }
}

impl ByteSource for MmapSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<(), SourceError> {
        copy_range(&self.mmap, offset, dst)
    }
}

/// Bytes already held in memory.
pub struct MemorySource {
    bytes: Vec<u8>,
}

impl From<Vec<u8>> for MemorySource {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<(), SourceError> {
        copy_range(&self.bytes, offset, dst)
    }
}

/// Opens a local file as a byte source.
pub fn open_source(path: &Path) -> Result<Box<dyn ByteSource>, SourceError> {
    Ok(Box::new(MmapSource::open(path)?))
}
