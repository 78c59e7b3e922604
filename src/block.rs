//! A single device memory object carved into suballocations.

use crate::device::{MappedPtr, MemoryContext, MemoryDevice};
use crate::error::{ensure, ValidationError};
use crate::metadata::BlockMetadata;
use crate::{DeviceSize, MapError};

/// Identifies a block within its block list. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(pub(crate) u64);

pub(crate) struct MemoryBlock<M> {
    id: BlockId,
    memory: M,
    memory_type_index: u32,
    pub(crate) metadata: BlockMetadata,
    map_count: u32,
    mapped: Option<MappedPtr>,
}

impl<M> MemoryBlock<M> {
    pub(crate) fn new(id: BlockId, memory: M, memory_type_index: u32, size: DeviceSize) -> Self {
        MemoryBlock {
            id,
            memory,
            memory_type_index,
            metadata: BlockMetadata::new(size),
            map_count: 0,
            mapped: None,
        }
    }

    pub(crate) fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn memory(&self) -> &M {
        &self.memory
    }

    pub(crate) fn size(&self) -> DeviceSize {
        self.metadata.size()
    }

    pub(crate) fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    #[cfg(test)]
    pub(crate) fn map_count(&self) -> u32 {
        self.map_count
    }

    /// Adds `count` map references, mapping the memory on the first one.
    ///
    /// With a `count` of zero this only returns the existing mapping.
    pub(crate) fn map<D>(&mut self, device: &D, count: u32) -> Result<MappedPtr, MapError>
    where
        D: MemoryDevice<Memory = M>,
    {
        if count == 0 {
            return self.mapped.ok_or(MapError::NotMapped);
        }

        let new_count = self
            .map_count
            .checked_add(count)
            .ok_or(MapError::TooManyMappings)?;
        let ptr = match self.mapped {
            Some(ptr) => ptr,
            None => {
                // Safety: the block's memory is ours and currently unmapped.
                let ptr = unsafe { device.map_memory(&self.memory, self.size())? };
                let ptr = MappedPtr::new(ptr);
                self.mapped = Some(ptr);
                ptr
            }
        };
        self.map_count = new_count;
        Ok(ptr)
    }

    /// Drops `count` map references, unmapping the memory when none remain.
    pub(crate) fn unmap<D>(&mut self, device: &D, count: u32) -> Result<(), MapError>
    where
        D: MemoryDevice<Memory = M>,
    {
        if count == 0 {
            return Ok(());
        }
        if self.map_count < count {
            log::warn!(
                "unmapping block {:?} {count} times but it is mapped only {} times",
                self.id,
                self.map_count
            );
            return Err(MapError::NotMapped);
        }

        self.map_count -= count;
        if self.map_count == 0 {
            self.mapped = None;
            // Safety: the last reference is gone, so nothing uses the mapping.
            unsafe { device.unmap_memory(&self.memory) };
        }
        Ok(())
    }

    /// Returns the block's memory to the device.
    pub(crate) fn release<D>(self, ctx: &MemoryContext<D>)
    where
        D: MemoryDevice<Memory = M>,
    {
        if !self.metadata.is_empty() {
            log::warn!(
                "releasing block {:?} with {} live allocations",
                self.id,
                self.metadata.allocation_count()
            );
        }
        if self.map_count > 0 {
            log::warn!(
                "releasing block {:?} that is still mapped {} times",
                self.id,
                self.map_count
            );
            // Safety: the block is being destroyed, nobody may use the
            // mapping anymore.
            unsafe { ctx.device().unmap_memory(&self.memory) };
        }

        let size = self.size();
        log::debug!(
            "releasing block {:?} of {size} bytes of memory type {}",
            self.id,
            self.memory_type_index
        );
        // Safety: the block was unlinked from its list, so no new allocation
        // can land in it, and it is unmapped.
        unsafe { ctx.free_device_memory(self.memory_type_index, self.memory, size) };
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        ensure!(
            (self.map_count == 0) == self.mapped.is_none(),
            "block mapping does not match its map count"
        );
        self.metadata.validate()
    }
}
