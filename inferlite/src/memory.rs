use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};

/// Allocator handle shared between a module and its materialized methods.
pub type SharedAllocator = Rc<RefCell<dyn MemoryAllocator>>;

/// Byte-buffer allocator role handed to method materialization.
///
/// The persistent role survives across repeated runs of a loaded method;
/// the temporary role is reset at the start of every run.
pub trait MemoryAllocator: fmt::Debug {
    /// Allocate an owned buffer of `nbytes` bytes. Content is unspecified.
    fn allocate(&mut self, nbytes: usize) -> Result<Vec<u8>>;

    /// Release transient allocations between runs.
    fn reset(&mut self) {}
}

/// General-purpose heap allocator, the default for both long-lived roles.
#[derive(Debug, Default)]
pub struct MallocAllocator;

impl MallocAllocator {
    pub fn shared() -> SharedAllocator {
        Rc::new(RefCell::new(MallocAllocator))
    }
}

impl MemoryAllocator for MallocAllocator {
    fn allocate(&mut self, nbytes: usize) -> Result<Vec<u8>> {
        Ok(vec![0u8; nbytes])
    }
}

/// Plan-indexed view over the planned buffers of one loaded method.
///
/// Owns exactly one buffer per plan entry, addressed by stable plan id.
/// Assembly is one-shot: a changed plan means discarding the whole method
/// holder and rebuilding from metadata.
#[derive(Debug)]
pub struct HierarchicalAllocator {
    buffers: Vec<Vec<u8>>,
}

impl HierarchicalAllocator {
    pub fn new(buffers: Vec<Vec<u8>>) -> Self {
        Self { buffers }
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self, id: usize) -> Option<usize> {
        self.buffers.get(id).map(|buffer| buffer.len())
    }

    pub fn buffer(&self, id: usize) -> Option<&[u8]> {
        self.buffers.get(id).map(|buffer| buffer.as_slice())
    }

    pub(crate) fn region(&self, id: usize, offset: usize, nbytes: usize) -> Result<&[u8]> {
        let buffer = self
            .buffers
            .get(id)
            .ok_or_else(|| Error::Execution(format!("planned buffer {} out of range", id)))?;
        let end = offset
            .checked_add(nbytes)
            .filter(|&end| end <= buffer.len())
            .ok_or_else(|| {
                Error::Execution(format!(
                    "planned region {}+{} exceeds buffer {} of {} bytes",
                    offset,
                    nbytes,
                    id,
                    buffer.len()
                ))
            })?;
        Ok(&buffer[offset..end])
    }

    pub(crate) fn region_mut(&mut self, id: usize, offset: usize, nbytes: usize) -> Result<&mut [u8]> {
        let buffer = self
            .buffers
            .get_mut(id)
            .ok_or_else(|| Error::Execution(format!("planned buffer {} out of range", id)))?;
        let end = offset
            .checked_add(nbytes)
            .filter(|&end| end <= buffer.len())
            .ok_or_else(|| {
                Error::Execution(format!(
                    "planned region {}+{} exceeds buffer {} of {} bytes",
                    offset,
                    nbytes,
                    id,
                    buffer.len()
                ))
            })?;
        Ok(&mut buffer[offset..end])
    }
}

/// The three-role allocator bundle consumed once at method materialization.
#[derive(Debug)]
pub struct MemoryManager {
    persistent: SharedAllocator,
    planned: HierarchicalAllocator,
    temp: SharedAllocator,
}

impl MemoryManager {
    pub fn new(
        persistent: SharedAllocator,
        planned: HierarchicalAllocator,
        temp: SharedAllocator,
    ) -> Self {
        Self {
            persistent,
            planned,
            temp,
        }
    }

    pub fn planned(&self) -> &HierarchicalAllocator {
        &self.planned
    }

    pub(crate) fn planned_mut(&mut self) -> &mut HierarchicalAllocator {
        &mut self.planned
    }

    pub fn persistent(&self) -> &SharedAllocator {
        &self.persistent
    }

    pub fn temp(&self) -> &SharedAllocator {
        &self.temp
    }
}
