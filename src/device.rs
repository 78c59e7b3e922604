//! The device-memory collaborator interface and the context through which the
//! allocator talks to it.

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::budget::{Budget, BudgetCounters};
use crate::{AllocationError, DeviceError, DeviceSize};

bitflags::bitflags! {
    /// Properties of a memory type.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        /// Fastest for device access.
        const DEVICE_LOCAL = 1 << 0;
        /// Can be mapped into the host address space.
        const HOST_VISIBLE = 1 << 1;
        /// Host writes are visible to the device without flushing.
        const HOST_COHERENT = 1 << 2;
        /// Cached on the host.
        const HOST_CACHED = 1 << 3;
        /// Backing storage is committed lazily.
        const LAZILY_ALLOCATED = 1 << 4;
        /// Only accessible to protected operations.
        const PROTECTED = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Properties of a memory heap.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryHeapFlags: u32 {
        /// The heap is device-local.
        const DEVICE_LOCAL = 1 << 0;
        /// The heap is replicated across a device group.
        const MULTI_INSTANCE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Extra flags passed through to every device allocation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryAllocateFlags: u32 {
        /// Allocate on a subset of a device group.
        const DEVICE_MASK = 1 << 0;
        /// The memory may be used with device addresses.
        const DEVICE_ADDRESS = 1 << 1;
        /// Device addresses may be captured and replayed.
        const DEVICE_ADDRESS_CAPTURE_REPLAY = 1 << 2;
    }
}

/// One of the device's memory types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryType {
    /// Properties of memory of this type.
    pub property_flags: MemoryPropertyFlags,
    /// The heap this type allocates from.
    pub heap_index: u32,
}

/// One of the device's memory heaps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryHeap {
    /// Total size of the heap in bytes.
    pub size: DeviceSize,
    /// Heap properties.
    pub flags: MemoryHeapFlags,
}

/// Memory-related properties of a device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    /// Available memory types, indexed by memory type index.
    pub memory_types: Vec<MemoryType>,
    /// Available memory heaps, indexed by heap index.
    pub memory_heaps: Vec<MemoryHeap>,
    /// The page size at which linear and non-linear resources must not be
    /// mixed.
    pub buffer_image_granularity: DeviceSize,
}

/// A device's own view of a heap's memory pressure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapBudget {
    /// Bytes currently in use on the heap, by this process or otherwise.
    pub usage: DeviceSize,
    /// Bytes this process may use before the device becomes unhappy.
    pub budget: DeviceSize,
}

/// A device that hands out coarse memory objects to sub-allocate.
///
/// Device allocations are assumed to be expensive and possibly limited in
/// number, which is why this crate exists.
pub trait MemoryDevice {
    /// Handle to a memory object allocated from this device.
    type Memory: Clone;

    /// The memory types and heaps of this device.
    ///
    /// Queried once, when the allocator is created.
    fn properties(&self) -> MemoryProperties;

    /// Allocates a new memory object of `size` bytes from the given memory
    /// type.
    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
        flags: MemoryAllocateFlags,
    ) -> Result<Self::Memory, DeviceError>;

    /// Frees a memory object.
    ///
    /// # Safety
    ///
    /// `memory` must have been allocated by this device, must not be mapped,
    /// and must not be used afterwards.
    unsafe fn free_memory(&self, memory: Self::Memory);

    /// Maps the whole memory object into the host address space.
    ///
    /// # Safety
    ///
    /// `memory` must have been allocated from a host-visible memory type of
    /// this device and must not currently be mapped.
    unsafe fn map_memory(
        &self,
        memory: &Self::Memory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, DeviceError>;

    /// Unmaps a memory object.
    ///
    /// # Safety
    ///
    /// `memory` must currently be mapped, and no pointer into the mapping may
    /// be used afterwards.
    unsafe fn unmap_memory(&self, memory: &Self::Memory);

    /// The device's report of a heap's usage and budget, if it has one.
    ///
    /// Queried before every decision to create or release a block. When this
    /// returns `None`, usage is estimated from this allocator's own block
    /// bytes and the budget is 80% of the heap size.
    fn heap_budget(&self, heap_index: u32) -> Option<HeapBudget> {
        let _ = heap_index;
        None
    }
}

/// A host pointer to the start of a mapped memory object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MappedPtr(NonNull<u8>);

// Safety: the pointer is only an address into device memory mapped by the
// device provider; all accesses through it happen in the caller's code, which
// is responsible for synchronizing them.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        MappedPtr(ptr)
    }

    pub(crate) fn get(self) -> NonNull<u8> {
        self.0
    }

    /// The pointer `offset` bytes into the mapping.
    ///
    /// # Safety
    ///
    /// `offset` must lie within the mapped memory object.
    pub(crate) unsafe fn offset(self, offset: DeviceSize) -> NonNull<u8> {
        self.0.add(offset as usize)
    }
}

/// Everything the block lists need to obtain and release device memory.
///
/// This is the only place in the crate that calls
/// [`MemoryDevice::allocate_memory`] and [`MemoryDevice::free_memory`], which
/// keeps the per-heap block-byte counters exact.
pub(crate) struct MemoryContext<D: MemoryDevice> {
    device: D,
    properties: MemoryProperties,
    heap_size_limits: Vec<Option<DeviceSize>>,
    allocate_flags: MemoryAllocateFlags,
    budget: BudgetCounters,
}

impl<D: MemoryDevice> MemoryContext<D> {
    pub(crate) fn new(
        device: D,
        heap_size_limits: Vec<Option<DeviceSize>>,
        allocate_flags: MemoryAllocateFlags,
    ) -> Result<Self, AllocationError> {
        let mut properties = device.properties();
        if properties.memory_types.is_empty() || properties.memory_heaps.is_empty() {
            return Err(AllocationError::InvalidArgument(
                "device reports no memory types or heaps",
            ));
        }
        if properties
            .memory_types
            .iter()
            .any(|ty| ty.heap_index as usize >= properties.memory_heaps.len())
        {
            return Err(AllocationError::InvalidArgument(
                "memory type refers to a heap that does not exist",
            ));
        }
        if !heap_size_limits.is_empty() && heap_size_limits.len() != properties.memory_heaps.len()
        {
            return Err(AllocationError::InvalidArgument(
                "heap size limits must be given for every heap",
            ));
        }

        // A heap limit smaller than the heap makes the heap look that small.
        for (heap, limit) in properties.memory_heaps.iter_mut().zip(&heap_size_limits) {
            if let Some(limit) = *limit {
                heap.size = heap.size.min(limit);
            }
        }
        properties.buffer_image_granularity = properties.buffer_image_granularity.max(1);

        let budget = BudgetCounters::new(properties.memory_heaps.len());
        Ok(MemoryContext {
            device,
            properties,
            heap_size_limits,
            allocate_flags,
            budget,
        })
    }

    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    pub(crate) fn properties(&self) -> &MemoryProperties {
        &self.properties
    }

    pub(crate) fn memory_type_count(&self) -> usize {
        self.properties.memory_types.len()
    }

    pub(crate) fn heap_count(&self) -> usize {
        self.properties.memory_heaps.len()
    }

    pub(crate) fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.properties.memory_types[memory_type_index as usize].heap_index
    }

    pub(crate) fn is_host_visible(&self, memory_type_index: u32) -> bool {
        self.properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub(crate) fn counters(&self) -> &BudgetCounters {
        &self.budget
    }

    /// The current budget of a heap.
    pub(crate) fn heap_budget(&self, heap_index: u32) -> Budget {
        let heap = heap_index as usize;
        let block_bytes = self.budget.block_bytes(heap);
        let allocation_bytes = self.budget.allocation_bytes(heap);
        match self.device.heap_budget(heap_index) {
            Some(reported) => Budget {
                block_bytes,
                allocation_bytes,
                usage: reported.usage,
                budget: reported.budget,
            },
            None => Budget {
                block_bytes,
                allocation_bytes,
                usage: block_bytes,
                budget: self.properties.memory_heaps[heap].size / 10 * 8,
            },
        }
    }

    /// Allocates device memory, charging it to the heap's block bytes.
    pub(crate) fn allocate_device_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<D::Memory, AllocationError> {
        let heap = self.heap_index(memory_type_index) as usize;

        match self.heap_size_limits.get(heap).copied().flatten() {
            Some(limit) => {
                if !self.budget.try_reserve_block_bytes(heap, size, limit) {
                    log::debug!(
                        "heap {heap} size limit of {limit} bytes would be exceeded by a {size} byte block"
                    );
                    return Err(AllocationError::OutOfDeviceMemory);
                }
            }
            None => self.budget.add_block_bytes(heap, size),
        }

        match self
            .device
            .allocate_memory(memory_type_index, size, self.allocate_flags)
        {
            Ok(memory) => {
                log::debug!(
                    "allocated {size} bytes of device memory from memory type {memory_type_index}"
                );
                Ok(memory)
            }
            Err(e) => {
                self.budget.remove_block_bytes(heap, size);
                log::debug!(
                    "device failed to allocate {size} bytes from memory type {memory_type_index}: {e}"
                );
                Err(e.into())
            }
        }
    }

    /// Returns device memory obtained from
    /// [`allocate_device_memory`](Self::allocate_device_memory).
    ///
    /// # Safety
    ///
    /// `memory` must be unmapped and unused, and `size` and
    /// `memory_type_index` must be the values it was allocated with.
    pub(crate) unsafe fn free_device_memory(
        &self,
        memory_type_index: u32,
        memory: D::Memory,
        size: DeviceSize,
    ) {
        self.device.free_memory(memory);
        let heap = self.heap_index(memory_type_index) as usize;
        self.budget.remove_block_bytes(heap, size);
        log::debug!("freed {size} bytes of device memory of memory type {memory_type_index}");
    }
}
