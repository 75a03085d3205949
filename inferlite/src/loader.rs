use std::fmt;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::warning;

/// Read-only byte access over the serialized program's backing store.
///
/// A loader is absorbed by the [`Program`](crate::Program) parsed from it,
/// so the backing store stays valid for the program's whole life.
pub trait DataLoader: fmt::Debug {
    /// The full byte range of the backing store.
    fn bytes(&self) -> &[u8];

    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Page-locking policy for memory-mapped loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlockPolicy {
    /// Map without locking pages.
    None,
    /// Lock pages; fail construction if locking fails.
    Required,
    /// Try to lock pages; proceed unlocked on failure.
    BestEffort,
}

/// Loader that reads the whole file into memory.
#[derive(Debug)]
pub struct FileDataLoader {
    data: Vec<u8>,
}

impl FileDataLoader {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|err| {
            Error::AccessorConstruction(format!("read {}: {}", path.display(), err))
        })?;
        Ok(Self { data })
    }
}

impl DataLoader for FileDataLoader {
    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Loader backed by a memory map.
#[derive(Debug)]
pub struct MmapDataLoader {
    mmap: Mmap,
}

impl MmapDataLoader {
    pub fn from_path(path: impl AsRef<Path>, mlock: MlockPolicy) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            Error::AccessorConstruction(format!("open {}: {}", path.display(), err))
        })?;
        let mmap = unsafe {
            Mmap::map(&file).map_err(|err| {
                Error::AccessorConstruction(format!("mmap {}: {}", path.display(), err))
            })?
        };
        match mlock {
            MlockPolicy::None => {}
            MlockPolicy::Required => {
                mmap.lock().map_err(|err| {
                    Error::AccessorConstruction(format!("mlock {}: {}", path.display(), err))
                })?;
            }
            MlockPolicy::BestEffort => {
                if let Err(err) = mmap.lock() {
                    warning!("mlock {} failed, proceeding unlocked: {}", path.display(), err);
                }
            }
        }
        Ok(Self { mmap })
    }
}

impl DataLoader for MmapDataLoader {
    fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

/// Loader over caller-supplied bytes. Never touches the filesystem.
#[derive(Debug)]
pub struct BufferDataLoader {
    data: Vec<u8>,
}

impl BufferDataLoader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl DataLoader for BufferDataLoader {
    fn bytes(&self) -> &[u8] {
        &self.data
    }
}
