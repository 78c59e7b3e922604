//! The allocator facade.
//!
//! An [`Allocator`] owns one block list per memory type of its device, the
//! custom pools created through it, and a registry of dedicated allocations.
//! Requests are routed like this:
//!
//! * A request naming a pool is served by that pool's block list and nowhere
//!   else.
//!
//! * Otherwise a memory type is picked from the request's usage and property
//!   flags. Requests that ask for it, or that are larger than half the type's
//!   preferred block size, get a device memory object of their own. The rest
//!   are placed in the type's block list, falling back to dedicated memory
//!   when the list cannot place them.
//!
//! * When a memory type fails, the next compatible one is tried, until none
//!   remain.
//!
//! The allocator is the only owner of device memory: blocks are released when
//! their list no longer needs them, and everything still held is released
//! when the allocator is dropped.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::allocation::{
    Allocation, AllocationInfo, AllocationKind, AllocationTracker, DedicatedAllocation, MapState,
    FRAME_INDEX_LOST,
};
use crate::block_list::{BlockList, BlockListConfig, BlockRequest};
use crate::budget::Budget;
use crate::create_info::{AllocationCreateFlags, AllocationCreateInfo, MemoryRequirements};
use crate::device::{MappedPtr, MemoryAllocateFlags, MemoryContext, MemoryDevice, MemoryProperties};
use crate::error::{ensure, ValidationError};
use crate::pool::{MemoryPool, PoolCreateFlags, PoolCreateInfo, PoolId};
use crate::stats::{PoolStats, StatInfo, Stats};
use crate::suballocation::{align_up, Suballocation, SuballocationType};
use crate::{AllocationError, DeviceSize, MapError};

pub(crate) mod lock;
use lock::{LockingMechanism, RwLock};

/// Heaps up to this size get blocks of an eighth of the heap.
const SMALL_HEAP_MAX_SIZE: DeviceSize = 1 << 30;

/// The default preferred block size on heaps larger than 1 GiB.
pub const DEFAULT_LARGE_HEAP_BLOCK_SIZE: DeviceSize = 256 << 20;

/// Parameters of an [`Allocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorCreateInfo {
    /// Preferred block size on heaps larger than 1 GiB. Zero selects
    /// [`DEFAULT_LARGE_HEAP_BLOCK_SIZE`].
    pub preferred_large_heap_block_size: DeviceSize,

    /// For how many frames after its last use an allocation that can become
    /// lost is protected from eviction, in the default block lists.
    pub frame_in_use_count: u32,

    /// Optional cap on the bytes allocated from each heap. Either empty or one
    /// entry per heap.
    pub heap_size_limits: Vec<Option<DeviceSize>>,

    /// Bytes kept free before and after every block allocation.
    pub debug_margin: DeviceSize,

    /// Flags passed through to every device allocation.
    pub allocate_flags: MemoryAllocateFlags,
}

impl Default for AllocatorCreateInfo {
    fn default() -> Self {
        AllocatorCreateInfo {
            preferred_large_heap_block_size: DEFAULT_LARGE_HEAP_BLOCK_SIZE,
            frame_in_use_count: 0,
            heap_size_limits: Vec::new(),
            debug_margin: 0,
            allocate_flags: MemoryAllocateFlags::empty(),
        }
    }
}

/// The block size a default block list of a heap works towards.
fn preferred_block_size(heap_size: DeviceSize, large_heap_block_size: DeviceSize) -> DeviceSize {
    let size = if heap_size <= SMALL_HEAP_MAX_SIZE {
        heap_size / 8
    } else {
        large_heap_block_size
    };
    align_up(size, 32)
}

/// Memory type bits where zero means "any type".
fn any_if_zero(memory_type_bits: u32) -> u32 {
    if memory_type_bits == 0 {
        u32::MAX
    } else {
        memory_type_bits
    }
}

fn find_pool<M, L>(pools: &[MemoryPool<M, L>], id: PoolId) -> Result<&MemoryPool<M, L>, AllocationError> {
    pools
        .iter()
        .find(|pool| pool.id() == id)
        .ok_or(AllocationError::UnknownPool)
}

/// A dedicated allocation, as remembered for statistics and validation.
#[derive(Debug)]
struct DedicatedRecord {
    id: u64,
    size: DeviceSize,
}

/// A sub-allocator for the device memory of a [`MemoryDevice`].
///
/// Because this crate is `no_std` and does not assume the presence of an
/// operating system, you must provide the locking mechanism via the `L` type
/// parameter. See the [`LockingMechanism`] trait for details. With
/// [`ParkingLotLock`](crate::ParkingLotLock), the allocator is `Sync` and may
/// be shared between threads.
pub struct Allocator<D, L>
where
    D: MemoryDevice,
    L: LockingMechanism,
{
    /// The device and the per-heap accounting.
    ctx: MemoryContext<D>,

    current_frame: AtomicU32,

    /// One default block list per memory type.
    block_lists: Vec<BlockList<D::Memory, L>>,

    /// Live dedicated allocations, per memory type.
    dedicated: Vec<RwLock<Vec<DedicatedRecord>, L>>,

    pools: RwLock<Vec<MemoryPool<D::Memory, L>>, L>,

    next_pool_id: AtomicU32,
    next_dedicated_id: AtomicU64,
}

impl<D, L> Allocator<D, L>
where
    D: MemoryDevice,
    L: LockingMechanism,
{
    /// Creates an allocator for `device`.
    ///
    /// No device memory is allocated until the first allocation.
    pub fn new(device: D, info: AllocatorCreateInfo) -> Result<Self, AllocationError> {
        let AllocatorCreateInfo {
            preferred_large_heap_block_size,
            frame_in_use_count,
            heap_size_limits,
            debug_margin,
            allocate_flags,
        } = info;

        let ctx = MemoryContext::new(device, heap_size_limits, allocate_flags)?;
        let large_heap_block_size = if preferred_large_heap_block_size == 0 {
            DEFAULT_LARGE_HEAP_BLOCK_SIZE
        } else {
            preferred_large_heap_block_size
        };

        let type_count = ctx.memory_type_count();
        let block_lists = (0..type_count as u32)
            .map(|memory_type_index| {
                let heap = ctx.heap_index(memory_type_index) as usize;
                let heap_size = ctx.properties().memory_heaps[heap].size;
                BlockList::new(BlockListConfig {
                    memory_type_index,
                    pool: None,
                    preferred_block_size: preferred_block_size(heap_size, large_heap_block_size),
                    explicit_block_size: false,
                    min_block_count: 0,
                    max_block_count: usize::MAX,
                    buffer_image_granularity: ctx.properties().buffer_image_granularity,
                    frame_in_use_count,
                    debug_margin,
                })
            })
            .collect();
        let dedicated = (0..type_count).map(|_| RwLock::new(Vec::new())).collect();

        log::debug!(
            "created allocator for {type_count} memory types in {} heaps",
            ctx.heap_count()
        );
        Ok(Allocator {
            ctx,
            current_frame: AtomicU32::new(0),
            block_lists,
            dedicated,
            pools: RwLock::new(Vec::new()),
            next_pool_id: AtomicU32::new(0),
            next_dedicated_id: AtomicU64::new(0),
        })
    }

    /// Get a shared reference to the underlying device.
    #[inline]
    pub fn device(&self) -> &D {
        self.ctx.device()
    }

    /// The device's memory types and heaps, with heap sizes capped at the
    /// configured heap size limits.
    pub fn memory_properties(&self) -> &MemoryProperties {
        self.ctx.properties()
    }

    /// The frame allocations are currently touched in.
    pub fn current_frame_index(&self) -> u32 {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Advances to a new frame. [`FRAME_INDEX_LOST`] is reserved and rejected.
    pub fn set_current_frame_index(&self, frame_index: u32) -> Result<(), AllocationError> {
        if frame_index == FRAME_INDEX_LOST {
            return Err(AllocationError::InvalidArgument(
                "the frame index is reserved for lost allocations",
            ));
        }
        self.current_frame.store(frame_index, Ordering::Release);
        Ok(())
    }

    /// Picks the memory type for `info` among `memory_type_bits`.
    ///
    /// The type must have every required property flag, counting those of
    /// `info.usage`; among those, the first with the fewest missing preferred
    /// flags wins.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        info: &AllocationCreateInfo,
    ) -> Result<u32, AllocationError> {
        self.find_memory_type(memory_type_bits & any_if_zero(info.memory_type_bits), info)
    }

    fn find_memory_type(
        &self,
        memory_type_bits: u32,
        info: &AllocationCreateInfo,
    ) -> Result<u32, AllocationError> {
        let (usage_required, usage_preferred) = info.usage.property_flags();
        let required = info.required_flags | usage_required;
        let preferred = info.preferred_flags | usage_preferred;

        let mut best = None;
        let mut min_cost = u32::MAX;
        for (index, ty) in self.ctx.properties().memory_types.iter().enumerate().take(32) {
            if memory_type_bits & (1u32 << index) == 0 || !ty.property_flags.contains(required) {
                continue;
            }
            let cost = (preferred - ty.property_flags).bits().count_ones();
            if cost < min_cost {
                best = Some(index as u32);
                if cost == 0 {
                    break;
                }
                min_cost = cost;
            }
        }
        best.ok_or(AllocationError::NoSuitableMemoryType)
    }

    /// Allocates memory for a resource.
    pub fn allocate(
        &self,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
        suballocation_type: SuballocationType,
    ) -> Result<Allocation<D::Memory>, AllocationError> {
        if requirements.size == 0 {
            return Err(AllocationError::InvalidArgument(
                "allocation size must not be zero",
            ));
        }
        let strategy = info.check()?;
        if requirements.requires_dedicated {
            if info.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
                return Err(AllocationError::OutOfDeviceMemory);
            }
            if info.pool.is_some() {
                return Err(AllocationError::InvalidArgument(
                    "resources requiring dedicated memory cannot be placed in a pool",
                ));
            }
        }

        let request = BlockRequest {
            size: requirements.size,
            alignment: requirements.alignment.max(1),
            ty: suballocation_type,
            flags: info.flags,
            strategy,
            user_data: info.user_data,
        };

        if let Some(id) = info.pool {
            let pools = self.pools.read();
            let pool = find_pool(&pools, id)?;
            let memory_type_index = pool.block_list.config().memory_type_index;
            if any_if_zero(requirements.memory_type_bits) & (1u32 << memory_type_index) == 0 {
                return Err(AllocationError::NoSuitableMemoryType);
            }
            return pool
                .block_list
                .allocate(&self.ctx, self.current_frame_index(), &request);
        }

        let mut memory_type_bits =
            any_if_zero(requirements.memory_type_bits) & any_if_zero(info.memory_type_bits);
        let mut memory_type_index = self.find_memory_type(memory_type_bits, info)?;
        loop {
            match self.allocate_of_type(memory_type_index, requirements, &request) {
                Ok(allocation) => return Ok(allocation),
                Err(e) => {
                    memory_type_bits &= !(1u32 << memory_type_index);
                    match self.find_memory_type(memory_type_bits, info) {
                        Ok(next) => {
                            log::debug!(
                                "memory type {memory_type_index} failed ({e}), trying memory type {next}"
                            );
                            memory_type_index = next;
                        }
                        Err(_) => return Err(e),
                    }
                }
            }
        }
    }

    fn allocate_of_type(
        &self,
        memory_type_index: u32,
        requirements: &MemoryRequirements,
        request: &BlockRequest,
    ) -> Result<Allocation<D::Memory>, AllocationError> {
        let mut request = *request;
        if request.flags.contains(AllocationCreateFlags::MAPPED)
            && !self.ctx.is_host_visible(memory_type_index)
        {
            request.flags.remove(AllocationCreateFlags::MAPPED);
        }

        let list = &self.block_lists[memory_type_index as usize];
        let never_allocate = request.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE);
        let prefer_dedicated = request
            .flags
            .contains(AllocationCreateFlags::DEDICATED_MEMORY)
            || requirements.requires_dedicated
            || requirements.prefers_dedicated
            || request.size > list.config().preferred_block_size / 2;

        if prefer_dedicated && !never_allocate {
            return self.allocate_dedicated(memory_type_index, &request);
        }

        match list.allocate(&self.ctx, self.current_frame_index(), &request) {
            Ok(allocation) => Ok(allocation),
            Err(e) if never_allocate => Err(e),
            Err(e) => {
                log::debug!(
                    "block list of memory type {memory_type_index} cannot place {} bytes ({e}), using dedicated memory",
                    request.size
                );
                self.allocate_dedicated(memory_type_index, &request)
            }
        }
    }

    fn allocate_dedicated(
        &self,
        memory_type_index: u32,
        request: &BlockRequest,
    ) -> Result<Allocation<D::Memory>, AllocationError> {
        let size = request.size;
        let heap = self.ctx.heap_index(memory_type_index);
        if request.flags.contains(AllocationCreateFlags::WITHIN_BUDGET) {
            let budget = self.ctx.heap_budget(heap);
            if budget.usage.saturating_add(size) > budget.budget {
                log::debug!(
                    "{size} byte dedicated allocation would exceed the budget of heap {heap}"
                );
                return Err(AllocationError::OutOfDeviceMemory);
            }
        }

        let memory = self.ctx.allocate_device_memory(memory_type_index, size)?;
        let mapped = if request.flags.contains(AllocationCreateFlags::MAPPED) {
            // Safety: the memory was just allocated and is not mapped.
            match unsafe { self.ctx.device().map_memory(&memory, size) } {
                Ok(ptr) => Some(MappedPtr::new(ptr)),
                Err(e) => {
                    // Safety: nothing else has seen the memory.
                    unsafe { self.ctx.free_device_memory(memory_type_index, memory, size) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let id = self.next_dedicated_id.fetch_add(1, Ordering::Relaxed);
        self.dedicated[memory_type_index as usize]
            .write()
            .push(DedicatedRecord { id, size });
        self.ctx.counters().add_allocation(heap as usize, size);
        log::debug!("allocated {size} bytes of dedicated memory from memory type {memory_type_index}");

        Ok(Allocation {
            size,
            alignment: request.alignment,
            memory_type_index,
            user_data: request.user_data,
            map_state: MapState {
                persistent: mapped.is_some(),
                ref_count: 0,
            },
            tracker: Arc::new(AllocationTracker::new(self.current_frame_index(), false)),
            kind: AllocationKind::Dedicated(DedicatedAllocation { memory, mapped, id }),
        })
    }

    /// Runs `f` on the block list owning allocations of `pool`, or on the
    /// default list of the memory type.
    fn with_block_list<R>(
        &self,
        pool: Option<PoolId>,
        memory_type_index: u32,
        f: impl FnOnce(&BlockList<D::Memory, L>) -> R,
    ) -> Result<R, AllocationError> {
        match pool {
            Some(id) => {
                let pools = self.pools.read();
                let pool = find_pool(&pools, id)?;
                Ok(f(&pool.block_list))
            }
            None => Ok(f(&self.block_lists[memory_type_index as usize])),
        }
    }

    /// Returns an allocation's memory.
    ///
    /// Lost allocations are accepted; their range was already reclaimed.
    pub fn free(&self, allocation: Allocation<D::Memory>) {
        let memory_type_index = allocation.memory_type_index;
        let size = allocation.size;
        let heap = self.ctx.heap_index(memory_type_index) as usize;
        let live = allocation.tracker.touch(self.current_frame_index());

        match allocation.kind {
            AllocationKind::Block(placement) => {
                if live
                    && self
                        .with_block_list(placement.pool, memory_type_index, |list| {
                            list.free(&self.ctx, &allocation)
                        })
                        .is_err()
                {
                    log::warn!(
                        "freeing an allocation of pool {:?}, which no longer exists",
                        placement.pool
                    );
                }
            }
            AllocationKind::Dedicated(dedicated) => {
                self.free_dedicated(memory_type_index, size, allocation.map_state, dedicated)
            }
        }

        self.ctx.counters().remove_allocation(heap, size);
    }

    fn free_dedicated(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
        map_state: MapState,
        dedicated: DedicatedAllocation<D::Memory>,
    ) {
        {
            let mut records = self.dedicated[memory_type_index as usize].write();
            let Some(index) = records.iter().position(|r| r.id == dedicated.id) else {
                log::warn!(
                    "freeing dedicated allocation {} that this allocator does not know",
                    dedicated.id
                );
                return;
            };
            records.swap_remove(index);
        }

        if dedicated.mapped.is_some() {
            if map_state.ref_count > 0 {
                log::warn!(
                    "freeing a dedicated allocation that is still mapped {} times",
                    map_state.ref_count
                );
            }
            // Safety: the allocation is being freed; its mapping must not be
            // used anymore.
            unsafe { self.ctx.device().unmap_memory(&dedicated.memory) };
        }
        // Safety: the memory is unmapped, and the allocation owning it is gone.
        unsafe { self.ctx.free_device_memory(memory_type_index, dedicated.memory, size) };
        log::debug!("freed {size} bytes of dedicated memory of memory type {memory_type_index}");
    }

    /// Maps an allocation and returns a host pointer to its first byte.
    ///
    /// Mappings are reference counted: every successful `map` must be paired
    /// with an [`unmap`](Self::unmap). Allocations that can become lost cannot
    /// be mapped.
    pub fn map(&self, allocation: &mut Allocation<D::Memory>) -> Result<NonNull<u8>, MapError> {
        if allocation.is_lost() {
            return Err(MapError::Lost);
        }
        if allocation.can_become_lost() {
            return Err(MapError::EvictableAllocation);
        }

        let memory_type_index = allocation.memory_type_index;
        match &mut allocation.kind {
            AllocationKind::Block(placement) => {
                let placement = *placement;
                let map_state = &mut allocation.map_state;
                self.with_block_list(placement.pool, memory_type_index, |list| {
                    list.map_allocation(&self.ctx, &placement, map_state)
                })
                .map_err(|_| MapError::UnknownPool)?
            }
            AllocationKind::Dedicated(dedicated) => {
                let mut state = allocation.map_state;
                state.acquire()?;
                let ptr = match dedicated.mapped {
                    Some(ptr) => ptr,
                    None => {
                        // Safety: the memory belongs to this allocation and is
                        // not mapped.
                        let ptr = unsafe {
                            self.ctx
                                .device()
                                .map_memory(&dedicated.memory, allocation.size)?
                        };
                        let ptr = MappedPtr::new(ptr);
                        dedicated.mapped = Some(ptr);
                        ptr
                    }
                };
                allocation.map_state = state;
                Ok(ptr.get())
            }
        }
    }

    /// Drops one map reference taken with [`map`](Self::map).
    pub fn unmap(&self, allocation: &mut Allocation<D::Memory>) -> Result<(), MapError> {
        let memory_type_index = allocation.memory_type_index;
        match &mut allocation.kind {
            AllocationKind::Block(placement) => {
                let placement = *placement;
                let map_state = &mut allocation.map_state;
                self.with_block_list(placement.pool, memory_type_index, |list| {
                    list.unmap_allocation(&self.ctx, &placement, map_state)
                })
                .map_err(|_| MapError::UnknownPool)?
            }
            AllocationKind::Dedicated(dedicated) => {
                let mut state = allocation.map_state;
                state.release()?;
                if state.total() == 0 && dedicated.mapped.take().is_some() {
                    // Safety: the last map reference is gone.
                    unsafe { self.ctx.device().unmap_memory(&dedicated.memory) };
                }
                allocation.map_state = state;
                Ok(())
            }
        }
    }

    /// Where an allocation lives, or `None` if it is lost.
    ///
    /// Touches the allocation in the current frame.
    pub fn allocation_info(
        &self,
        allocation: &Allocation<D::Memory>,
    ) -> Option<AllocationInfo<D::Memory>> {
        if !allocation.tracker.touch(self.current_frame_index()) {
            return None;
        }

        let (memory, offset, mapped) = match &allocation.kind {
            AllocationKind::Block(placement) => {
                let (memory, mapped) = self
                    .with_block_list(placement.pool, allocation.memory_type_index, |list| {
                        list.allocation_memory(placement, allocation.is_mapped())
                    })
                    .ok()
                    .flatten()?;
                (memory, placement.offset, mapped)
            }
            AllocationKind::Dedicated(dedicated) => (
                dedicated.memory.clone(),
                0,
                dedicated.mapped.map(MappedPtr::get),
            ),
        };

        Some(AllocationInfo {
            memory_type_index: allocation.memory_type_index,
            memory,
            offset,
            size: allocation.size,
            mapped,
            user_data: allocation.user_data,
        })
    }

    /// Records a use of the allocation in the current frame, protecting it
    /// from eviction for the frame-in-use count. Returns `false` if it is
    /// already lost.
    pub fn touch_allocation(&self, allocation: &Allocation<D::Memory>) -> bool {
        allocation.tracker.touch(self.current_frame_index())
    }

    /// The budget of a heap, or `None` if there is no such heap.
    pub fn budget(&self, heap_index: u32) -> Option<Budget> {
        ((heap_index as usize) < self.ctx.heap_count()).then(|| self.ctx.heap_budget(heap_index))
    }

    /// Statistics over all default block lists, pools and dedicated
    /// allocations.
    pub fn calculate_stats(&self) -> Stats {
        let mut stats = Stats {
            memory_type: alloc::vec![StatInfo::default(); self.ctx.memory_type_count()],
            memory_heap: alloc::vec![StatInfo::default(); self.ctx.heap_count()],
            total: StatInfo::default(),
        };

        for list in &self.block_lists {
            let heap = self.ctx.heap_index(list.config().memory_type_index) as usize;
            list.add_stats(&mut stats, heap);
        }
        {
            let pools = self.pools.read();
            for pool in pools.iter() {
                let heap = self.ctx.heap_index(pool.block_list.config().memory_type_index) as usize;
                pool.block_list.add_stats(&mut stats, heap);
            }
        }
        for (memory_type_index, records) in self.dedicated.iter().enumerate() {
            let heap = self.ctx.heap_index(memory_type_index as u32) as usize;
            for record in records.read().iter() {
                let info = StatInfo::single_allocation(record.size);
                stats.total.add(&info);
                stats.memory_type[memory_type_index].add(&info);
                stats.memory_heap[heap].add(&info);
            }
        }

        stats.total.postprocess();
        for info in stats.memory_type.iter_mut().chain(stats.memory_heap.iter_mut()) {
            info.postprocess();
        }
        stats
    }

    /// Creates a custom pool and allocates its minimum number of blocks.
    ///
    /// If any of those blocks cannot be allocated, the ones that were are
    /// released again and the pool is not created.
    pub fn create_pool(&self, info: &PoolCreateInfo) -> Result<PoolId, AllocationError> {
        let memory_type_index = info.memory_type_index;
        if memory_type_index as usize >= self.ctx.memory_type_count() {
            return Err(AllocationError::InvalidArgument(
                "pool memory type index out of range",
            ));
        }
        let max_block_count = if info.max_block_count == 0 {
            usize::MAX
        } else {
            info.max_block_count
        };
        if info.min_block_count > max_block_count {
            return Err(AllocationError::InvalidArgument(
                "pool minimum block count exceeds its maximum",
            ));
        }

        let (preferred_block_size, explicit_block_size) = if info.block_size == 0 {
            let default_list = &self.block_lists[memory_type_index as usize];
            (default_list.config().preferred_block_size, false)
        } else {
            (info.block_size, true)
        };
        let buffer_image_granularity = if info
            .flags
            .contains(PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY)
        {
            1
        } else {
            self.ctx.properties().buffer_image_granularity
        };

        let id = PoolId(self.next_pool_id.fetch_add(1, Ordering::Relaxed));
        let mut block_list = BlockList::new(BlockListConfig {
            memory_type_index,
            pool: Some(id),
            preferred_block_size,
            explicit_block_size,
            min_block_count: info.min_block_count,
            max_block_count,
            buffer_image_granularity,
            frame_in_use_count: info.frame_in_use_count,
            debug_margin: self.block_lists[memory_type_index as usize]
                .config()
                .debug_margin,
        });
        if let Err(e) = block_list.create_min_blocks(&self.ctx) {
            log::debug!("failed to create the minimum blocks of pool {id:?}: {e}");
            block_list.release_blocks(&self.ctx);
            return Err(e);
        }

        log::debug!(
            "created pool {id:?} ({:?}) for memory type {memory_type_index} with {} blocks",
            info.name,
            info.min_block_count
        );
        self.pools
            .write()
            .push(MemoryPool::new(id, info.name.clone(), block_list));
        Ok(id)
    }

    /// Destroys a pool and releases all of its blocks.
    ///
    /// Allocations still living in the pool are leaked: their memory is
    /// released, and freeing them later only updates the budget.
    pub fn destroy_pool(&self, id: PoolId) -> Result<(), AllocationError> {
        let mut pool = {
            let mut pools = self.pools.write();
            let index = pools
                .iter()
                .position(|pool| pool.id() == id)
                .ok_or(AllocationError::UnknownPool)?;
            pools.swap_remove(index)
        };

        let live = pool.block_list.calc_allocation_count();
        if live > 0 {
            log::warn!("destroying pool {id:?} with {live} live allocations");
        }
        pool.block_list.release_blocks(&self.ctx);
        log::debug!("destroyed pool {id:?}");
        Ok(())
    }

    /// Statistics of one pool.
    pub fn pool_stats(&self, id: PoolId) -> Result<PoolStats, AllocationError> {
        let pools = self.pools.read();
        Ok(find_pool(&pools, id)?.block_list.pool_stats())
    }

    /// Renames a pool.
    pub fn set_pool_name(&self, id: PoolId, name: Option<&str>) -> Result<(), AllocationError> {
        let mut pools = self.pools.write();
        let pool = pools
            .iter_mut()
            .find(|pool| pool.id() == id)
            .ok_or(AllocationError::UnknownPool)?;
        pool.set_name(name.map(String::from));
        Ok(())
    }

    /// The name of a pool.
    pub fn pool_name(&self, id: PoolId) -> Result<Option<String>, AllocationError> {
        let pools = self.pools.read();
        Ok(find_pool(&pools, id)?.name().map(String::from))
    }

    /// Evicts every allocation of the pool that can become lost and was not
    /// used within its frame-in-use count. Returns how many were evicted.
    pub fn make_pool_allocations_lost(&self, id: PoolId) -> Result<usize, AllocationError> {
        let pools = self.pools.read();
        let pool = find_pool(&pools, id)?;
        Ok(pool
            .block_list
            .make_pool_allocations_lost(&self.ctx, self.current_frame_index()))
    }

    /// Whether resources of conflicting granularity classes currently sit in
    /// the pool's blocks closely enough that moving allocations around would
    /// have to respect buffer-image granularity.
    pub fn is_buffer_image_granularity_conflict_possible(
        &self,
        id: PoolId,
    ) -> Result<bool, AllocationError> {
        let pools = self.pools.read();
        Ok(find_pool(&pools, id)?
            .block_list
            .is_buffer_image_granularity_conflict_possible())
    }

    /// Checks the margins around allocations for corruption. Not supported.
    pub fn check_corruption(&self, memory_type_bits: u32) -> Result<(), AllocationError> {
        let _ = memory_type_bits;
        Err(AllocationError::FeatureNotPresent("corruption detection"))
    }

    /// Checks the margins around a pool's allocations for corruption. Not
    /// supported.
    pub fn check_pool_corruption(&self, id: PoolId) -> Result<(), AllocationError> {
        let pools = self.pools.read();
        find_pool(&pools, id)?;
        Err(AllocationError::FeatureNotPresent("corruption detection"))
    }

    /// Compacts allocations into fewer blocks. Not supported.
    pub fn defragment(
        &self,
        allocations: &mut [Allocation<D::Memory>],
    ) -> Result<(), AllocationError> {
        let _ = allocations;
        Err(AllocationError::FeatureNotPresent("defragmentation"))
    }

    /// The suballocations of every block of a memory type's default list, in
    /// block order and then offset order. `None` if there is no such type.
    pub fn memory_type_suballocations(
        &self,
        memory_type_index: u32,
    ) -> Option<Vec<Vec<Suballocation>>> {
        self.block_lists
            .get(memory_type_index as usize)
            .map(|list| list.suballocations())
    }

    /// The suballocations of every block of a pool.
    pub fn pool_suballocations(&self, id: PoolId) -> Result<Vec<Vec<Suballocation>>, AllocationError> {
        let pools = self.pools.read();
        Ok(find_pool(&pools, id)?.block_list.suballocations())
    }

    /// Checks the consistency of every block list and of the per-heap
    /// accounting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut block_bytes = alloc::vec![0; self.ctx.heap_count()];

        for list in &self.block_lists {
            list.validate()?;
            let heap = self.ctx.heap_index(list.config().memory_type_index) as usize;
            block_bytes[heap] += list.pool_stats().size;
        }
        {
            let pools = self.pools.read();
            for pool in pools.iter() {
                pool.block_list.validate()?;
                let heap = self.ctx.heap_index(pool.block_list.config().memory_type_index) as usize;
                block_bytes[heap] += pool.block_list.pool_stats().size;
            }
        }
        for (memory_type_index, records) in self.dedicated.iter().enumerate() {
            let heap = self.ctx.heap_index(memory_type_index as u32) as usize;
            block_bytes[heap] += records.read().iter().map(|r| r.size).sum::<DeviceSize>();
        }

        for (heap, bytes) in block_bytes.into_iter().enumerate() {
            ensure!(
                bytes == self.ctx.counters().block_bytes(heap),
                "heap block bytes do not match the blocks and dedicated allocations"
            );
        }
        Ok(())
    }
}

impl<D, L> Drop for Allocator<D, L>
where
    D: MemoryDevice,
    L: LockingMechanism,
{
    fn drop(&mut self) {
        let leaked_dedicated: usize = self.dedicated.iter_mut().map(|r| r.get_mut().len()).sum();
        if leaked_dedicated > 0 {
            log::warn!("dropping allocator with {leaked_dedicated} live dedicated allocations");
        }

        let ctx = &self.ctx;
        for list in &mut self.block_lists {
            let live = list.calc_allocation_count();
            if live > 0 {
                log::warn!(
                    "dropping allocator with {live} live allocations in memory type {}",
                    list.config().memory_type_index
                );
            }
            list.release_blocks(ctx);
        }
        for mut pool in self.pools.get_mut().drain(..) {
            pool.block_list.release_blocks(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_info::MemoryUsage;
    use crate::device::{HeapBudget, MemoryPropertyFlags};
    use crate::test_device::TestDevice;
    use crate::SingleThreadedLock;

    const KIB: DeviceSize = 1 << 10;
    const MIB: DeviceSize = 1 << 20;

    type TestAllocator = Allocator<TestDevice, SingleThreadedLock>;

    fn allocator_with(info: AllocatorCreateInfo) -> TestAllocator {
        let _ = env_logger::try_init();
        Allocator::new(TestDevice::discrete(256 * MIB, 256 * MIB), info).unwrap()
    }

    fn allocator() -> TestAllocator {
        allocator_with(AllocatorCreateInfo::default())
    }

    fn requirements(size: DeviceSize) -> MemoryRequirements {
        MemoryRequirements {
            size,
            alignment: 256,
            ..MemoryRequirements::default()
        }
    }

    fn usage(usage: MemoryUsage, flags: AllocationCreateFlags) -> AllocationCreateInfo {
        AllocationCreateInfo {
            usage,
            flags,
            ..AllocationCreateInfo::default()
        }
    }

    fn gpu_only() -> AllocationCreateInfo {
        usage(MemoryUsage::GpuOnly, AllocationCreateFlags::empty())
    }

    fn pool_info(memory_type_index: u32, min: usize, max: usize) -> PoolCreateInfo {
        PoolCreateInfo {
            memory_type_index,
            block_size: MIB,
            min_block_count: min,
            max_block_count: max,
            frame_in_use_count: 1,
            ..PoolCreateInfo::default()
        }
    }

    #[test]
    fn memory_type_selection_follows_usage() {
        let allocator = allocator();
        let find = |usage: MemoryUsage| {
            allocator.find_memory_type_index(
                u32::MAX,
                &AllocationCreateInfo {
                    usage,
                    ..AllocationCreateInfo::default()
                },
            )
        };
        assert_eq!(find(MemoryUsage::GpuOnly), Ok(0));
        assert_eq!(find(MemoryUsage::CpuOnly), Ok(1));
        assert_eq!(find(MemoryUsage::CpuToGpu), Ok(2));
        assert_eq!(find(MemoryUsage::GpuToCpu), Ok(3));
        assert_eq!(find(MemoryUsage::Unknown), Ok(0));

        // Only type 1 allowed: it wins despite lacking the preferred flag.
        assert_eq!(allocator.find_memory_type_index(0b10, &gpu_only()), Ok(1));
        assert_eq!(
            allocator.find_memory_type_index(
                u32::MAX,
                &AllocationCreateInfo {
                    required_flags: MemoryPropertyFlags::PROTECTED,
                    ..AllocationCreateInfo::default()
                }
            ),
            Err(AllocationError::NoSuitableMemoryType)
        );
    }

    #[test]
    fn small_requests_share_a_block() {
        let allocator = allocator();
        let a = allocator
            .allocate(&requirements(KIB), &gpu_only(), SuballocationType::Buffer)
            .unwrap();
        let b = allocator
            .allocate(&requirements(KIB), &gpu_only(), SuballocationType::Buffer)
            .unwrap();
        assert!(!a.is_dedicated() && !b.is_dedicated());
        assert_eq!(a.memory_type_index(), 0);

        let info_a = allocator.allocation_info(&a).unwrap();
        let info_b = allocator.allocation_info(&b).unwrap();
        assert_eq!(info_a.memory, info_b.memory);
        assert_ne!(info_a.offset, info_b.offset);
        assert_eq!(allocator.device().live_count(), 1);

        // The first block of a young list starts at an eighth of the
        // preferred 32 MiB.
        let budget = allocator.budget(0).unwrap();
        assert_eq!(budget.block_bytes, 4 * MIB);
        assert_eq!(budget.allocation_bytes, 2 * KIB);

        allocator.free(a);
        allocator.free(b);
        let budget = allocator.budget(0).unwrap();
        assert_eq!(budget.allocation_bytes, 0);
        allocator.validate().unwrap();
    }

    #[test]
    fn large_requests_get_dedicated_memory() {
        let allocator = allocator();
        let big = allocator
            .allocate(&requirements(20 * MIB), &gpu_only(), SuballocationType::ImageOptimal)
            .unwrap();
        assert!(big.is_dedicated());
        assert_eq!(big.offset(), 0);

        let stats = allocator.calculate_stats();
        assert_eq!(stats.memory_type[0].allocation_count, 1);
        assert_eq!(stats.memory_heap[0].used_bytes, 20 * MIB);
        assert_eq!(stats.total.block_count, 1);
        allocator.validate().unwrap();

        allocator.free(big);
        assert_eq!(allocator.device().live_count(), 0);
        let budget = allocator.budget(0).unwrap();
        assert_eq!(budget.block_bytes, 0);
        assert_eq!(budget.allocation_bytes, 0);
        allocator.validate().unwrap();
    }

    #[test]
    fn dedicated_requests() {
        let allocator = allocator();
        let small = allocator
            .allocate(
                &requirements(KIB),
                &usage(MemoryUsage::GpuOnly, AllocationCreateFlags::DEDICATED_MEMORY),
                SuballocationType::Buffer,
            )
            .unwrap();
        assert!(small.is_dedicated());

        let required = MemoryRequirements {
            requires_dedicated: true,
            ..requirements(KIB)
        };
        assert_eq!(
            allocator
                .allocate(
                    &required,
                    &usage(MemoryUsage::GpuOnly, AllocationCreateFlags::NEVER_ALLOCATE),
                    SuballocationType::Buffer,
                )
                .unwrap_err(),
            AllocationError::OutOfDeviceMemory
        );
        let preferred = allocator
            .allocate(
                &MemoryRequirements {
                    prefers_dedicated: true,
                    ..requirements(KIB)
                },
                &gpu_only(),
                SuballocationType::Buffer,
            )
            .unwrap();
        assert!(preferred.is_dedicated());

        allocator.free(small);
        allocator.free(preferred);
        allocator.validate().unwrap();
    }

    #[test]
    fn block_failure_falls_back_to_dedicated() {
        let allocator = allocator();
        allocator.device().set_max_allocation_size(Some(2 * MIB));

        let allocation = allocator
            .allocate(&requirements(KIB), &gpu_only(), SuballocationType::Buffer)
            .unwrap();
        assert!(allocation.is_dedicated());
        assert_eq!(allocation.memory_type_index(), 0);

        assert_eq!(
            allocator
                .allocate(
                    &requirements(KIB),
                    &usage(MemoryUsage::GpuOnly, AllocationCreateFlags::NEVER_ALLOCATE),
                    SuballocationType::Buffer,
                )
                .unwrap_err(),
            AllocationError::OutOfDeviceMemory
        );

        allocator.free(allocation);
        allocator.validate().unwrap();
    }

    #[test]
    fn failing_memory_type_falls_through_to_the_next() {
        let allocator = allocator_with(AllocatorCreateInfo {
            heap_size_limits: alloc::vec![Some(0), None],
            ..AllocatorCreateInfo::default()
        });
        let allocation = allocator
            .allocate(&requirements(KIB), &gpu_only(), SuballocationType::Buffer)
            .unwrap();
        assert_eq!(allocation.memory_type_index(), 1);
        allocator.free(allocation);

        // Nothing is left once every compatible type failed.
        let info = AllocationCreateInfo {
            memory_type_bits: 0b101,
            ..gpu_only()
        };
        assert_eq!(
            allocator
                .allocate(&requirements(KIB), &info, SuballocationType::Buffer)
                .unwrap_err(),
            AllocationError::OutOfDeviceMemory
        );
        allocator.validate().unwrap();
    }

    #[test]
    fn mapped_flag_needs_host_visible_memory() {
        let allocator = allocator();
        let staging = allocator
            .allocate(
                &requirements(KIB),
                &usage(MemoryUsage::CpuOnly, AllocationCreateFlags::MAPPED),
                SuballocationType::Buffer,
            )
            .unwrap();
        assert!(staging.is_mapped());
        let ptr = allocator.allocation_info(&staging).unwrap().mapped.unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x5A, KIB as usize) };

        // Type 0 cannot be mapped, so the flag is dropped.
        let device_local = allocator
            .allocate(
                &requirements(KIB),
                &usage(MemoryUsage::GpuOnly, AllocationCreateFlags::MAPPED),
                SuballocationType::Buffer,
            )
            .unwrap();
        assert_eq!(device_local.memory_type_index(), 0);
        assert!(!device_local.is_mapped());
        assert_eq!(allocator.allocation_info(&device_local).unwrap().mapped, None);

        allocator.free(staging);
        allocator.free(device_local);
        allocator.validate().unwrap();
    }

    #[test]
    fn explicit_mapping_is_reference_counted() {
        let allocator = allocator();
        for flags in [
            AllocationCreateFlags::empty(),
            AllocationCreateFlags::DEDICATED_MEMORY,
        ] {
            let mut allocation = allocator
                .allocate(
                    &requirements(KIB),
                    &usage(MemoryUsage::CpuOnly, flags),
                    SuballocationType::Buffer,
                )
                .unwrap();
            let memory = allocator.allocation_info(&allocation).unwrap().memory;

            let a = allocator.map(&mut allocation).unwrap();
            let b = allocator.map(&mut allocation).unwrap();
            assert_eq!(a, b);
            assert!(allocator.device().is_mapped(memory));

            allocator.unmap(&mut allocation).unwrap();
            assert!(allocation.is_mapped());
            allocator.unmap(&mut allocation).unwrap();
            assert!(!allocation.is_mapped());
            assert!(!allocator.device().is_mapped(memory));
            assert_eq!(allocator.unmap(&mut allocation), Err(MapError::NotMapped));

            allocator.free(allocation);
        }
        allocator.validate().unwrap();
    }

    #[test]
    fn lost_allocations() {
        let allocator = allocator();
        let pool = allocator.create_pool(&pool_info(1, 1, 1)).unwrap();
        let in_pool = |flags| AllocationCreateInfo {
            flags,
            pool: Some(pool),
            ..AllocationCreateInfo::default()
        };

        let mut old = allocator
            .allocate(
                &requirements(MIB),
                &in_pool(AllocationCreateFlags::CAN_BECOME_LOST),
                SuballocationType::Buffer,
            )
            .unwrap();
        assert_eq!(allocator.map(&mut old), Err(MapError::EvictableAllocation));

        allocator.set_current_frame_index(10).unwrap();
        let fresh = allocator
            .allocate(
                &requirements(KIB),
                &in_pool(AllocationCreateFlags::CAN_MAKE_OTHER_LOST),
                SuballocationType::Buffer,
            )
            .unwrap();
        assert!(old.is_lost());
        assert_eq!(old.last_use_frame(), FRAME_INDEX_LOST);
        assert_eq!(allocator.map(&mut old), Err(MapError::Lost));
        assert!(allocator.allocation_info(&old).is_none());
        assert!(!allocator.touch_allocation(&old));

        allocator.free(old);
        allocator.validate().unwrap();
        assert_eq!(allocator.pool_stats(pool).unwrap().allocation_count, 1);
        allocator.free(fresh);
        assert_eq!(allocator.budget(1).unwrap().allocation_bytes, 0);
    }

    #[test]
    fn touching_protects_from_eviction() {
        let allocator = allocator();
        let pool = allocator.create_pool(&pool_info(1, 1, 1)).unwrap();
        let info = AllocationCreateInfo {
            flags: AllocationCreateFlags::CAN_BECOME_LOST,
            pool: Some(pool),
            ..AllocationCreateInfo::default()
        };
        let allocation = allocator
            .allocate(&requirements(KIB), &info, SuballocationType::Buffer)
            .unwrap();

        allocator.set_current_frame_index(5).unwrap();
        assert!(allocator.touch_allocation(&allocation));
        assert_eq!(allocation.last_use_frame(), 5);
        assert_eq!(allocator.make_pool_allocations_lost(pool), Ok(0));

        allocator.set_current_frame_index(7).unwrap();
        assert_eq!(allocator.make_pool_allocations_lost(pool), Ok(1));
        assert!(allocation.is_lost());
        allocator.free(allocation);
        allocator.validate().unwrap();
    }

    #[test]
    fn pool_lifecycle() {
        let allocator = allocator();
        let live_before = allocator.device().live_count();
        let pool = allocator
            .create_pool(&PoolCreateInfo {
                name: Some(String::from("staging")),
                ..pool_info(1, 2, 3)
            })
            .unwrap();

        let stats = allocator.pool_stats(pool).unwrap();
        assert_eq!(stats.block_count, 2);
        assert_eq!(stats.size, 2 * MIB);
        assert_eq!(allocator.pool_name(pool).unwrap().as_deref(), Some("staging"));
        allocator.set_pool_name(pool, Some("upload")).unwrap();
        assert_eq!(allocator.pool_name(pool).unwrap().as_deref(), Some("upload"));
        allocator.set_pool_name(pool, None).unwrap();
        assert_eq!(allocator.pool_name(pool), Ok(None));

        let info = AllocationCreateInfo {
            pool: Some(pool),
            ..AllocationCreateInfo::default()
        };
        let allocations: Vec<_> = (0..3)
            .map(|_| {
                allocator
                    .allocate(&requirements(MIB), &info, SuballocationType::Buffer)
                    .unwrap()
            })
            .collect();
        assert_eq!(allocator.pool_stats(pool).unwrap().block_count, 3);
        // Pools never fall back to dedicated memory.
        assert_eq!(
            allocator
                .allocate(&requirements(MIB), &info, SuballocationType::Buffer)
                .unwrap_err(),
            AllocationError::OutOfDeviceMemory
        );
        assert_eq!(
            allocator.pool_suballocations(pool).unwrap().len(),
            3
        );
        allocator.validate().unwrap();

        allocator.destroy_pool(pool).unwrap();
        assert_eq!(allocator.device().live_count(), live_before);
        assert_eq!(allocator.pool_stats(pool), Err(AllocationError::UnknownPool));
        assert_eq!(allocator.destroy_pool(pool), Err(AllocationError::UnknownPool));

        // Allocations outliving their pool only update the accounting.
        for allocation in allocations {
            allocator.free(allocation);
        }
        assert_eq!(allocator.budget(1).unwrap().allocation_bytes, 0);
        allocator.validate().unwrap();
    }

    #[test]
    fn pool_creation_is_all_or_nothing() {
        let allocator = allocator_with(AllocatorCreateInfo {
            heap_size_limits: alloc::vec![None, Some(3 * MIB)],
            ..AllocatorCreateInfo::default()
        });
        assert_eq!(
            allocator.create_pool(&pool_info(1, 4, 4)),
            Err(AllocationError::OutOfDeviceMemory)
        );
        assert_eq!(allocator.device().live_count(), 0);
        assert_eq!(allocator.budget(1).unwrap().block_bytes, 0);

        assert!(matches!(
            allocator.create_pool(&pool_info(9, 0, 0)),
            Err(AllocationError::InvalidArgument(_))
        ));
        assert!(matches!(
            allocator.create_pool(&pool_info(1, 3, 2)),
            Err(AllocationError::InvalidArgument(_))
        ));
    }

    #[test]
    fn pool_allocations_respect_memory_type_bits() {
        let allocator = allocator();
        let pool = allocator.create_pool(&pool_info(1, 0, 0)).unwrap();
        let info = AllocationCreateInfo {
            pool: Some(pool),
            ..AllocationCreateInfo::default()
        };
        let requirements = MemoryRequirements {
            memory_type_bits: 0b1,
            ..requirements(KIB)
        };
        assert_eq!(
            allocator
                .allocate(&requirements, &info, SuballocationType::Buffer)
                .unwrap_err(),
            AllocationError::NoSuitableMemoryType
        );
        assert_eq!(
            allocator
                .allocate(
                    &MemoryRequirements {
                        requires_dedicated: true,
                        ..requirements
                    },
                    &info,
                    SuballocationType::Buffer
                )
                .map(|_| ()),
            Err(AllocationError::InvalidArgument(
                "resources requiring dedicated memory cannot be placed in a pool"
            ))
        );
    }

    #[test]
    fn within_budget_limits_dedicated_allocations() {
        let allocator = allocator();
        allocator.device().set_budget(Some(HeapBudget {
            usage: 0,
            budget: MIB,
        }));
        let info = usage(
            MemoryUsage::GpuOnly,
            AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::WITHIN_BUDGET,
        );
        assert_eq!(
            allocator
                .allocate(&requirements(2 * MIB), &info, SuballocationType::Buffer)
                .unwrap_err(),
            AllocationError::OutOfDeviceMemory
        );

        let allocation = allocator
            .allocate(
                &requirements(2 * MIB),
                &usage(MemoryUsage::GpuOnly, AllocationCreateFlags::DEDICATED_MEMORY),
                SuballocationType::Buffer,
            )
            .unwrap();
        allocator.free(allocation);
    }

    #[test]
    fn stats_cover_lists_pools_and_dedicated() {
        let allocator = allocator();
        let pool = allocator.create_pool(&pool_info(1, 1, 1)).unwrap();
        let in_block = allocator
            .allocate(&requirements(KIB), &gpu_only(), SuballocationType::Buffer)
            .unwrap();
        let dedicated = allocator
            .allocate(&requirements(20 * MIB), &gpu_only(), SuballocationType::Buffer)
            .unwrap();
        let in_pool = allocator
            .allocate(
                &requirements(KIB),
                &AllocationCreateInfo {
                    pool: Some(pool),
                    ..AllocationCreateInfo::default()
                },
                SuballocationType::Buffer,
            )
            .unwrap();

        let stats = allocator.calculate_stats();
        assert_eq!(stats.total.allocation_count, 3);
        assert_eq!(stats.total.block_count, 3);
        assert_eq!(stats.memory_heap[0].allocation_count, 2);
        assert_eq!(stats.memory_heap[1].allocation_count, 1);
        assert_eq!(stats.memory_type[1].used_bytes, KIB);
        assert_eq!(stats.total.allocation_size_max, 20 * MIB);
        assert_eq!(stats.total.allocation_size_min, KIB);

        allocator.free(in_block);
        allocator.free(dedicated);
        allocator.free(in_pool);
        assert_eq!(allocator.calculate_stats().total.allocation_count, 0);
        allocator.validate().unwrap();
    }

    #[test]
    fn rejected_arguments() {
        let allocator = allocator();
        assert!(matches!(
            allocator.allocate(&requirements(0), &gpu_only(), SuballocationType::Buffer),
            Err(AllocationError::InvalidArgument(_))
        ));
        assert!(matches!(
            allocator.allocate(
                &requirements(KIB),
                &usage(
                    MemoryUsage::GpuOnly,
                    AllocationCreateFlags::STRATEGY_BEST_FIT
                        | AllocationCreateFlags::STRATEGY_WORST_FIT
                ),
                SuballocationType::Buffer
            ),
            Err(AllocationError::InvalidStrategy)
        ));
        assert!(matches!(
            allocator.allocate(
                &requirements(KIB),
                &AllocationCreateInfo {
                    pool: Some(PoolId(42)),
                    ..AllocationCreateInfo::default()
                },
                SuballocationType::Buffer
            ),
            Err(AllocationError::UnknownPool)
        ));
        assert!(matches!(
            allocator.set_current_frame_index(FRAME_INDEX_LOST),
            Err(AllocationError::InvalidArgument(_))
        ));
        assert_eq!(allocator.budget(2), None);
        assert_eq!(allocator.memory_type_suballocations(4), None);
    }

    #[test]
    fn unsupported_operations() {
        let allocator = allocator();
        assert_eq!(
            allocator.check_corruption(u32::MAX),
            Err(AllocationError::FeatureNotPresent("corruption detection"))
        );
        assert_eq!(
            allocator.check_pool_corruption(PoolId(0)),
            Err(AllocationError::UnknownPool)
        );
        let pool = allocator.create_pool(&pool_info(1, 0, 0)).unwrap();
        assert_eq!(
            allocator.check_pool_corruption(pool),
            Err(AllocationError::FeatureNotPresent("corruption detection"))
        );
        assert_eq!(
            allocator.defragment(&mut []),
            Err(AllocationError::FeatureNotPresent("defragmentation"))
        );
        assert_eq!(allocator.is_buffer_image_granularity_conflict_possible(pool), Ok(false));
    }

    #[test]
    fn preferred_block_sizes() {
        assert_eq!(preferred_block_size(256 * MIB, DEFAULT_LARGE_HEAP_BLOCK_SIZE), 32 * MIB);
        assert_eq!(
            preferred_block_size(8 << 30, DEFAULT_LARGE_HEAP_BLOCK_SIZE),
            DEFAULT_LARGE_HEAP_BLOCK_SIZE
        );
        assert_eq!(preferred_block_size(1000, DEFAULT_LARGE_HEAP_BLOCK_SIZE), 128);
    }

    #[cfg(feature = "parking_lot")]
    #[test]
    fn allocator_is_sync_with_parking_lot() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Allocator<TestDevice, crate::ParkingLotLock>>();
    }
}
