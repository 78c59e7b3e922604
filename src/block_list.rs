//! The blocks of one memory type, or of one pool, and the placement algorithm
//! across them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::allocation::{
    Allocation, AllocationKind, AllocationTracker, BlockAllocation, MapState,
};
use crate::allocator::lock::{LockingMechanism, RwLock};
use crate::block::{BlockId, MemoryBlock};
use crate::create_info::{AllocationCreateFlags, AllocationStrategy};
use crate::device::{MemoryContext, MemoryDevice};
use crate::error::{ensure, ValidationError};
use crate::metadata::PlacementParams;
use crate::stats::{PoolStats, Stats};
use crate::suballocation::{align_up, AllocationRequest, Suballocation, SuballocationType};
use crate::{AllocationError, DeviceSize, MapError, PoolId};

/// How many times the eviction pass looks for a placement before giving up.
pub(crate) const ALLOCATION_TRY_COUNT: usize = 32;

/// How many times a new block may be halved from the preferred block size.
const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

#[derive(Clone, Debug)]
pub(crate) struct BlockListConfig {
    pub(crate) memory_type_index: u32,
    pub(crate) pool: Option<PoolId>,
    pub(crate) preferred_block_size: DeviceSize,
    /// Blocks are always `preferred_block_size` large.
    pub(crate) explicit_block_size: bool,
    pub(crate) min_block_count: usize,
    pub(crate) max_block_count: usize,
    pub(crate) buffer_image_granularity: DeviceSize,
    pub(crate) frame_in_use_count: u32,
    pub(crate) debug_margin: DeviceSize,
}

/// One allocation request, as seen by a block list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockRequest {
    pub(crate) size: DeviceSize,
    pub(crate) alignment: DeviceSize,
    pub(crate) ty: SuballocationType,
    pub(crate) flags: AllocationCreateFlags,
    pub(crate) strategy: AllocationStrategy,
    pub(crate) user_data: u64,
}

struct Blocks<M> {
    // Sorted by ascending free bytes, approximately.
    blocks: Vec<MemoryBlock<M>>,
    next_id: u64,
    has_empty_block: bool,
}

impl<M> Blocks<M> {
    fn position(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id() == id)
    }

    fn update_has_empty_block(&mut self) {
        self.has_empty_block = self.blocks.iter().any(|b| b.metadata.is_empty());
    }

    fn max_block_size(&self) -> DeviceSize {
        self.blocks.iter().map(|b| b.size()).max().unwrap_or(0)
    }

    /// One step of bubble sort by free bytes.
    fn incrementally_sort(&mut self) {
        for i in 1..self.blocks.len() {
            if self.blocks[i - 1].metadata.sum_free_size() > self.blocks[i].metadata.sum_free_size()
            {
                self.blocks.swap(i - 1, i);
                return;
            }
        }
    }
}

/// Block indices in the order a strategy searches them.
fn search_order(len: usize, strategy: AllocationStrategy) -> impl Iterator<Item = usize> {
    let descending = strategy != AllocationStrategy::BestFit;
    (0..len).map(move |i| if descending { len - 1 - i } else { i })
}

pub(crate) struct BlockList<M, L> {
    config: BlockListConfig,
    blocks: RwLock<Blocks<M>, L>,
}

impl<M, L> BlockList<M, L>
where
    L: LockingMechanism,
{
    pub(crate) fn new(config: BlockListConfig) -> Self {
        BlockList {
            config,
            blocks: RwLock::new(Blocks {
                blocks: Vec::new(),
                next_id: 0,
                has_empty_block: false,
            }),
        }
    }

    pub(crate) fn config(&self) -> &BlockListConfig {
        &self.config
    }

    fn placement(&self, current_frame: u32) -> PlacementParams {
        PlacementParams {
            current_frame,
            frame_in_use_count: self.config.frame_in_use_count,
            granularity: self.config.buffer_image_granularity,
            debug_margin: self.config.debug_margin,
        }
    }

    /// Creates blocks until the list holds its minimum number of them.
    pub(crate) fn create_min_blocks<D>(&self, ctx: &MemoryContext<D>) -> Result<(), AllocationError>
    where
        D: MemoryDevice<Memory = M>,
    {
        let mut blocks = self.blocks.write();
        while blocks.blocks.len() < self.config.min_block_count {
            self.create_block(ctx, &mut blocks, self.config.preferred_block_size)?;
        }
        blocks.update_has_empty_block();
        Ok(())
    }

    fn create_block<D>(
        &self,
        ctx: &MemoryContext<D>,
        blocks: &mut Blocks<M>,
        size: DeviceSize,
    ) -> Result<usize, AllocationError>
    where
        D: MemoryDevice<Memory = M>,
    {
        let memory = ctx.allocate_device_memory(self.config.memory_type_index, size)?;
        let id = BlockId(blocks.next_id);
        blocks.next_id += 1;
        blocks.blocks.push(MemoryBlock::new(
            id,
            memory,
            self.config.memory_type_index,
            size,
        ));
        log::debug!(
            "created block {id:?} of {size} bytes for memory type {} (pool {:?})",
            self.config.memory_type_index,
            self.config.pool
        );
        Ok(blocks.blocks.len() - 1)
    }

    /// Allocates from the list, creating a block or evicting stale
    /// allocations if needed and allowed.
    pub(crate) fn allocate<D>(
        &self,
        ctx: &MemoryContext<D>,
        current_frame: u32,
        request: &BlockRequest,
    ) -> Result<Allocation<M>, AllocationError>
    where
        D: MemoryDevice<Memory = M>,
    {
        let config = &self.config;
        let size = request.size;
        // The first placement in an empty block starts past the leading margin.
        let needed = align_up(config.debug_margin, request.alignment)
            .saturating_add(size)
            .saturating_add(config.debug_margin);
        if needed > config.preferred_block_size {
            log::debug!(
                "{size} byte request cannot fit in {} byte blocks of memory type {}",
                config.preferred_block_size,
                config.memory_type_index
            );
            return Err(AllocationError::OutOfDeviceMemory);
        }

        let flags = request.flags;
        let heap = ctx.heap_index(config.memory_type_index);
        let free_memory = ctx.heap_budget(heap).headroom();
        let placement = self.placement(current_frame);

        let mut blocks = self.blocks.write();
        let can_create_new_block = !flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
            && blocks.blocks.len() < config.max_block_count
            && (free_memory >= size || config.pool.is_some());

        for index in search_order(blocks.blocks.len(), request.strategy) {
            if let Some(allocation) =
                self.allocate_from_block(ctx, &mut blocks, index, &placement, request)?
            {
                return Ok(allocation);
            }
        }

        if can_create_new_block {
            if let Some(index) = self.grow(ctx, &mut blocks, needed, free_memory) {
                let result = self.allocate_from_block(ctx, &mut blocks, index, &placement, request);
                if !matches!(result, Ok(Some(_))) {
                    log::debug!("new block cannot hold a {size} byte allocation, releasing it");
                    let block = blocks.blocks.remove(index);
                    blocks.update_has_empty_block();
                    block.release(ctx);
                }
                if let Some(allocation) = result? {
                    return Ok(allocation);
                }
            }
        }

        if flags.contains(AllocationCreateFlags::CAN_MAKE_OTHER_LOST) {
            return self.allocate_by_eviction(ctx, &mut blocks, &placement, request);
        }

        Err(AllocationError::OutOfDeviceMemory)
    }

    /// Creates a block for an allocation needing `needed` bytes. Returns its
    /// index.
    fn grow<D>(
        &self,
        ctx: &MemoryContext<D>,
        blocks: &mut Blocks<M>,
        needed: DeviceSize,
        free_memory: DeviceSize,
    ) -> Option<usize>
    where
        D: MemoryDevice<Memory = M>,
    {
        let config = &self.config;
        let mut block_size = config.preferred_block_size;
        let mut shift = 0;

        // Start small while the list is young.
        if !config.explicit_block_size {
            let max_existing = blocks.max_block_size();
            while shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = block_size / 2;
                if smaller > max_existing && smaller >= needed.saturating_mul(2) {
                    block_size = smaller;
                    shift += 1;
                } else {
                    break;
                }
            }
        }

        loop {
            if block_size <= free_memory || config.pool.is_some() {
                match self.create_block(ctx, blocks, block_size) {
                    Ok(index) => return Some(index),
                    Err(e) => log::debug!("failed to create a {block_size} byte block: {e}"),
                }
            }
            if config.explicit_block_size || shift >= NEW_BLOCK_SIZE_SHIFT_MAX {
                return None;
            }
            let smaller = block_size / 2;
            if smaller < needed {
                return None;
            }
            block_size = smaller;
            shift += 1;
        }
    }

    fn allocate_from_block<D>(
        &self,
        ctx: &MemoryContext<D>,
        blocks: &mut Blocks<M>,
        index: usize,
        placement: &PlacementParams,
        request: &BlockRequest,
    ) -> Result<Option<Allocation<M>>, AllocationError>
    where
        D: MemoryDevice<Memory = M>,
    {
        let block = &mut blocks.blocks[index];
        let Some(found) = block.metadata.create_allocation_request(
            placement,
            request.size,
            request.alignment,
            request.ty,
            false,
            request.strategy,
        ) else {
            return Ok(None);
        };

        if request.flags.contains(AllocationCreateFlags::MAPPED) {
            block
                .map(ctx.device(), 1)
                .map_err(|_| AllocationError::MemoryMapFailed)?;
        }
        let allocation = self.commit(ctx, block, &found, placement.current_frame, request);
        blocks.update_has_empty_block();
        Ok(Some(allocation))
    }

    fn allocate_by_eviction<D>(
        &self,
        ctx: &MemoryContext<D>,
        blocks: &mut Blocks<M>,
        placement: &PlacementParams,
        request: &BlockRequest,
    ) -> Result<Allocation<M>, AllocationError>
    where
        D: MemoryDevice<Memory = M>,
    {
        let mapped = request.flags.contains(AllocationCreateFlags::MAPPED);

        for _ in 0..ALLOCATION_TRY_COUNT {
            let Some((index, mut found)) = self.find_eviction_request(blocks, placement, request)
            else {
                continue;
            };

            let block = &mut blocks.blocks[index];
            if mapped {
                block
                    .map(ctx.device(), 1)
                    .map_err(|_| AllocationError::MemoryMapFailed)?;
            }
            if block.metadata.make_requested_allocations_lost(
                placement,
                &mut found,
                request.size,
                request.ty,
            ) {
                let allocation = self.commit(ctx, block, &found, placement.current_frame, request);
                blocks.update_has_empty_block();
                return Ok(allocation);
            }

            // Something we meant to evict was used in the meantime.
            if mapped {
                if let Err(e) = block.unmap(ctx.device(), 1) {
                    log::warn!("failed to drop the mapping of block {:?}: {e}", block.id());
                }
            }
            blocks.update_has_empty_block();
        }

        log::debug!(
            "giving up on a {} byte allocation after {ALLOCATION_TRY_COUNT} eviction attempts",
            request.size
        );
        Err(AllocationError::TooManyObjects)
    }

    /// The cheapest placement across all blocks, evictions allowed.
    fn find_eviction_request(
        &self,
        blocks: &Blocks<M>,
        placement: &PlacementParams,
        request: &BlockRequest,
    ) -> Option<(usize, AllocationRequest)> {
        let mut best: Option<(usize, AllocationRequest)> = None;
        for index in search_order(blocks.blocks.len(), request.strategy) {
            let Some(found) = blocks.blocks[index].metadata.create_allocation_request(
                placement,
                request.size,
                request.alignment,
                request.ty,
                true,
                request.strategy,
            ) else {
                continue;
            };
            if best.map_or(true, |(_, b)| found.cost() < b.cost()) {
                best = Some((index, found));
                if found.cost() == 0 || request.strategy == AllocationStrategy::FirstFit {
                    break;
                }
            }
        }
        best
    }

    fn commit<D>(
        &self,
        ctx: &MemoryContext<D>,
        block: &mut MemoryBlock<M>,
        found: &AllocationRequest,
        current_frame: u32,
        request: &BlockRequest,
    ) -> Allocation<M>
    where
        D: MemoryDevice<Memory = M>,
    {
        let tracker = Arc::new(AllocationTracker::new(
            current_frame,
            request
                .flags
                .contains(AllocationCreateFlags::CAN_BECOME_LOST),
        ));
        block.metadata.alloc(
            found,
            request.ty,
            request.size,
            request.alignment,
            Arc::clone(&tracker),
        );

        let heap = ctx.heap_index(self.config.memory_type_index);
        ctx.counters().add_allocation(heap as usize, request.size);

        Allocation {
            size: request.size,
            alignment: request.alignment,
            memory_type_index: self.config.memory_type_index,
            user_data: request.user_data,
            map_state: MapState {
                persistent: request.flags.contains(AllocationCreateFlags::MAPPED),
                ref_count: 0,
            },
            tracker,
            kind: AllocationKind::Block(BlockAllocation {
                pool: self.config.pool,
                block: block.id(),
                offset: found.offset,
                suballocation_type: request.ty,
            }),
        }
    }

    /// Returns an allocation's range to its block and releases a block that
    /// is no longer needed.
    pub(crate) fn free<D>(&self, ctx: &MemoryContext<D>, allocation: &Allocation<M>)
    where
        D: MemoryDevice<Memory = M>,
    {
        let Some(placement) = allocation.block_allocation() else {
            debug_assert!(false, "freeing a dedicated allocation from a block list");
            return;
        };

        let heap = ctx.heap_index(self.config.memory_type_index);
        let budget = ctx.heap_budget(heap);
        let budget_exceeded = budget.usage >= budget.budget;

        let released = {
            let mut blocks = self.blocks.write();
            // Evictions happen under this lock, so the answer cannot change
            // before the range is returned.
            if allocation.is_lost() {
                // Its range was reclaimed when it was evicted.
                return;
            }
            let Some(index) = blocks.position(placement.block) else {
                log::warn!(
                    "freeing an allocation of block {:?}, which no longer exists",
                    placement.block
                );
                return;
            };
            let had_empty_block = blocks.has_empty_block;
            let can_delete = blocks.blocks.len() > self.config.min_block_count;

            let block = &mut blocks.blocks[index];
            if block
                .metadata
                .free_at_offset(placement.offset, &allocation.tracker)
                .is_none()
            {
                return;
            }
            if allocation.map_state.ref_count > 0 {
                log::warn!(
                    "freeing an allocation that is still mapped {} times",
                    allocation.map_state.ref_count
                );
            }
            if let Err(e) = block.unmap(ctx.device(), allocation.map_state.total()) {
                log::warn!("failed to drop the mappings of a freed allocation: {e}");
            }

            let released = if block.metadata.is_empty() {
                if (had_empty_block || budget_exceeded) && can_delete {
                    Some(blocks.blocks.remove(index))
                } else {
                    None
                }
            } else if had_empty_block
                && can_delete
                && blocks
                    .blocks
                    .last()
                    .is_some_and(|last| last.metadata.is_empty())
            {
                blocks.blocks.pop()
            } else {
                None
            };

            blocks.update_has_empty_block();
            blocks.incrementally_sort();
            released
        };

        if let Some(block) = released {
            block.release(ctx);
        }
    }

    pub(crate) fn map_allocation<D>(
        &self,
        ctx: &MemoryContext<D>,
        placement: &BlockAllocation,
        map_state: &mut MapState,
    ) -> Result<NonNull<u8>, MapError>
    where
        D: MemoryDevice<Memory = M>,
    {
        let mut state = *map_state;
        state.acquire()?;

        let mut blocks = self.blocks.write();
        let index = blocks
            .position(placement.block)
            .ok_or(MapError::UnknownPool)?;
        let base = blocks.blocks[index].map(ctx.device(), 1)?;
        *map_state = state;
        // Safety: the allocation lies inside the block.
        Ok(unsafe { base.offset(placement.offset) })
    }

    pub(crate) fn unmap_allocation<D>(
        &self,
        ctx: &MemoryContext<D>,
        placement: &BlockAllocation,
        map_state: &mut MapState,
    ) -> Result<(), MapError>
    where
        D: MemoryDevice<Memory = M>,
    {
        let mut state = *map_state;
        state.release()?;

        let mut blocks = self.blocks.write();
        let index = blocks
            .position(placement.block)
            .ok_or(MapError::UnknownPool)?;
        blocks.blocks[index].unmap(ctx.device(), 1)?;
        *map_state = state;
        Ok(())
    }

    /// The memory object holding an allocation, and the host pointer to the
    /// allocation if `mapped`.
    pub(crate) fn allocation_memory(
        &self,
        placement: &BlockAllocation,
        mapped: bool,
    ) -> Option<(M, Option<NonNull<u8>>)>
    where
        M: Clone,
    {
        let blocks = self.blocks.read();
        let block = &blocks.blocks[blocks.position(placement.block)?];
        let ptr = if mapped {
            // Safety: the allocation lies inside the block.
            block
                .mapped()
                .map(|base| unsafe { base.offset(placement.offset) })
        } else {
            None
        };
        Some((block.memory().clone(), ptr))
    }

    /// Moves a live allocation into another block of this list, together with
    /// its map references. Returns whether it moved. This is the placement
    /// step of compaction, which the allocator does not offer yet.
    pub(crate) fn relocate<D>(
        &self,
        ctx: &MemoryContext<D>,
        allocation: &mut Allocation<M>,
        target: BlockId,
    ) -> bool
    where
        D: MemoryDevice<Memory = M>,
    {
        let Some(placement) = allocation.block_allocation().copied() else {
            return false;
        };
        if placement.block == target {
            return false;
        }

        let mut blocks = self.blocks.write();
        if allocation.is_lost() {
            return false;
        }
        let (Some(from), Some(to)) = (blocks.position(placement.block), blocks.position(target))
        else {
            return false;
        };
        let params = self.placement(allocation.last_use_frame());
        let Some(found) = blocks.blocks[to].metadata.create_allocation_request(
            &params,
            allocation.size,
            allocation.alignment,
            placement.suballocation_type,
            false,
            AllocationStrategy::BestFit,
        ) else {
            return false;
        };

        let map_count = allocation.map_state.total();
        if map_count > 0 && blocks.blocks[to].map(ctx.device(), map_count).is_err() {
            return false;
        }
        blocks.blocks[to].metadata.alloc(
            &found,
            placement.suballocation_type,
            allocation.size,
            allocation.alignment,
            Arc::clone(&allocation.tracker),
        );
        blocks.blocks[from]
            .metadata
            .free_at_offset(placement.offset, &allocation.tracker);
        if let Err(e) = blocks.blocks[from].unmap(ctx.device(), map_count) {
            log::warn!(
                "failed to move the mappings of block {:?}: {e}",
                placement.block
            );
        }
        allocation.change_allocation(target, found.offset);

        blocks.update_has_empty_block();
        true
    }

    pub(crate) fn pool_stats(&self) -> PoolStats {
        let blocks = self.blocks.read();
        let mut stats = PoolStats {
            block_count: blocks.blocks.len(),
            ..PoolStats::default()
        };
        for block in &blocks.blocks {
            block.metadata.add_pool_stats(&mut stats);
        }
        stats
    }

    pub(crate) fn add_stats(&self, stats: &mut Stats, heap_index: usize) {
        let blocks = self.blocks.read();
        let memory_type = self.config.memory_type_index as usize;
        for block in &blocks.blocks {
            let info = block.metadata.stat_info();
            stats.total.add(&info);
            stats.memory_type[memory_type].add(&info);
            stats.memory_heap[heap_index].add(&info);
        }
    }

    /// Evicts every stale evictable allocation, then releases surplus empty
    /// blocks. Returns how many allocations were evicted.
    pub(crate) fn make_pool_allocations_lost<D>(
        &self,
        ctx: &MemoryContext<D>,
        current_frame: u32,
    ) -> usize
    where
        D: MemoryDevice<Memory = M>,
    {
        let (lost, released) = {
            let mut blocks = self.blocks.write();
            let mut lost = 0;
            for block in blocks.blocks.iter_mut() {
                lost += block
                    .metadata
                    .make_allocations_lost(current_frame, self.config.frame_in_use_count);
            }

            let mut released = Vec::new();
            let mut kept_empty = false;
            let mut i = 0;
            while i < blocks.blocks.len() {
                if blocks.blocks[i].metadata.is_empty()
                    && blocks.blocks.len() > self.config.min_block_count
                {
                    if kept_empty {
                        released.push(blocks.blocks.remove(i));
                        continue;
                    }
                    kept_empty = true;
                }
                i += 1;
            }

            blocks.update_has_empty_block();
            (lost, released)
        };

        if lost > 0 {
            log::debug!(
                "evicted {lost} allocations of memory type {} (pool {:?})",
                self.config.memory_type_index,
                self.config.pool
            );
        }
        for block in released {
            block.release(ctx);
        }
        lost
    }

    pub(crate) fn calc_allocation_count(&self) -> usize {
        let blocks = self.blocks.read();
        blocks
            .blocks
            .iter()
            .map(|b| b.metadata.allocation_count())
            .sum()
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.read().blocks.len()
    }

    pub(crate) fn is_buffer_image_granularity_conflict_possible(&self) -> bool {
        let granularity = self.config.buffer_image_granularity;
        if granularity <= 1 {
            return false;
        }
        let blocks = self.blocks.read();
        let mut prev_type = SuballocationType::Free;
        blocks.blocks.iter().any(|b| {
            b.metadata
                .is_buffer_image_granularity_conflict_possible(granularity, &mut prev_type)
        })
    }

    /// The suballocations of every block, in offset order.
    pub(crate) fn suballocations(&self) -> Vec<Vec<Suballocation>> {
        let blocks = self.blocks.read();
        blocks
            .blocks
            .iter()
            .map(|b| b.metadata.suballocations().collect())
            .collect()
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        let blocks = self.blocks.read();
        let len = blocks.blocks.len();
        ensure!(
            len <= self.config.max_block_count,
            "block list holds more blocks than allowed"
        );

        let mut empty = 0;
        for (i, block) in blocks.blocks.iter().enumerate() {
            block.validate()?;
            ensure!(
                blocks.blocks[..i].iter().all(|b| b.id() != block.id()),
                "duplicate block id"
            );
            if block.metadata.is_empty() {
                empty += 1;
            }
        }
        ensure!(
            blocks.has_empty_block == (empty > 0),
            "empty block flag is stale"
        );
        ensure!(
            len <= self.config.min_block_count || empty <= 1,
            "more than one empty block"
        );
        Ok(())
    }

    /// Returns all blocks to the device.
    pub(crate) fn release_blocks<D>(&mut self, ctx: &MemoryContext<D>)
    where
        D: MemoryDevice<Memory = M>,
    {
        let blocks = self.blocks.get_mut();
        blocks.has_empty_block = false;
        for block in blocks.blocks.drain(..) {
            block.release(ctx);
        }
    }
}
