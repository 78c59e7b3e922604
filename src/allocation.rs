//! Caller-facing allocation handles.

use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::block::BlockId;
use crate::device::MappedPtr;
use crate::{DeviceSize, MapError, PoolId, SuballocationType};

/// The last-use frame of an allocation that has been evicted.
pub const FRAME_INDEX_LOST: u32 = u32::MAX;

/// Frame bookkeeping shared between an [`Allocation`] and the suballocation
/// it occupies, so that touching and evicting need no list lock.
#[derive(Debug)]
pub(crate) struct AllocationTracker {
    last_use_frame: AtomicU32,
    can_become_lost: bool,
}

impl AllocationTracker {
    pub(crate) fn new(current_frame: u32, can_become_lost: bool) -> Self {
        AllocationTracker {
            last_use_frame: AtomicU32::new(current_frame),
            can_become_lost,
        }
    }

    pub(crate) fn last_use_frame(&self) -> u32 {
        self.last_use_frame.load(Ordering::Acquire)
    }

    pub(crate) fn can_become_lost(&self) -> bool {
        self.can_become_lost
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.last_use_frame() == FRAME_INDEX_LOST
    }

    /// Whether the allocation may be evicted in `current_frame`: it can become
    /// lost and was last used more than `frame_in_use_count` frames ago.
    pub(crate) fn is_evictable(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
        self.can_become_lost
            && is_stale(self.last_use_frame(), current_frame, frame_in_use_count)
    }

    /// Records a use in `current_frame`. Returns `false` if the allocation is
    /// already lost.
    pub(crate) fn touch(&self, current_frame: u32) -> bool {
        let mut last = self.last_use_frame();
        loop {
            if last == FRAME_INDEX_LOST {
                return false;
            }
            if last == current_frame {
                return true;
            }
            match self.last_use_frame.compare_exchange_weak(
                last,
                current_frame,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }

    /// Marks the allocation lost if it has not been used in the last
    /// `frame_in_use_count` frames. Returns whether it was marked.
    pub(crate) fn make_lost(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
        debug_assert!(self.can_become_lost);
        let mut last = self.last_use_frame();
        loop {
            if !is_stale(last, current_frame, frame_in_use_count) {
                return false;
            }
            match self.last_use_frame.compare_exchange_weak(
                last,
                FRAME_INDEX_LOST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }
}

fn is_stale(last_use_frame: u32, current_frame: u32, frame_in_use_count: u32) -> bool {
    last_use_frame != FRAME_INDEX_LOST
        && u64::from(last_use_frame) + u64::from(frame_in_use_count) < u64::from(current_frame)
}

/// Explicit map reference counting for one allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MapState {
    pub(crate) persistent: bool,
    pub(crate) ref_count: u32,
}

impl MapState {
    pub(crate) fn acquire(&mut self) -> Result<(), MapError> {
        self.ref_count = self
            .ref_count
            .checked_add(1)
            .ok_or(MapError::TooManyMappings)?;
        Ok(())
    }

    pub(crate) fn release(&mut self) -> Result<(), MapError> {
        self.ref_count = self.ref_count.checked_sub(1).ok_or(MapError::NotMapped)?;
        Ok(())
    }

    /// How many map references this allocation holds on its memory.
    pub(crate) fn total(&self) -> u32 {
        self.ref_count.saturating_add(u32::from(self.persistent))
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.total() > 0
    }
}

/// Placement of an allocation inside a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockAllocation {
    pub(crate) pool: Option<PoolId>,
    pub(crate) block: BlockId,
    pub(crate) offset: DeviceSize,
    pub(crate) suballocation_type: SuballocationType,
}

/// An allocation that owns a whole device memory object.
#[derive(Debug)]
pub(crate) struct DedicatedAllocation<M> {
    pub(crate) memory: M,
    pub(crate) mapped: Option<MappedPtr>,
    pub(crate) id: u64,
}

#[derive(Debug)]
pub(crate) enum AllocationKind<M> {
    Block(BlockAllocation),
    Dedicated(DedicatedAllocation<M>),
}

/// A range of device memory handed out by an
/// [`Allocator`](crate::Allocator).
///
/// Must be returned with [`Allocator::free`](crate::Allocator::free). An
/// allocation created with
/// [`CAN_BECOME_LOST`](crate::AllocationCreateFlags::CAN_BECOME_LOST) may be
/// evicted when it has not been touched recently; its range is then reused
/// and [`Allocation::is_lost`] returns `true`.
#[derive(Debug)]
pub struct Allocation<M> {
    pub(crate) size: DeviceSize,
    pub(crate) alignment: DeviceSize,
    pub(crate) memory_type_index: u32,
    pub(crate) user_data: u64,
    pub(crate) map_state: MapState,
    pub(crate) tracker: Arc<AllocationTracker>,
    pub(crate) kind: AllocationKind<M>,
}

impl<M> Allocation<M> {
    /// Size of the allocation in bytes.
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Alignment the allocation was made with.
    pub fn alignment(&self) -> DeviceSize {
        self.alignment
    }

    /// Memory type the allocation lives in.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Offset into the device memory object. Always zero for dedicated
    /// allocations.
    pub fn offset(&self) -> DeviceSize {
        match &self.kind {
            AllocationKind::Block(block) => block.offset,
            AllocationKind::Dedicated(_) => 0,
        }
    }

    /// The pool the allocation was made from, if any.
    pub fn pool(&self) -> Option<PoolId> {
        match &self.kind {
            AllocationKind::Block(block) => block.pool,
            AllocationKind::Dedicated(_) => None,
        }
    }

    /// Whether the allocation owns its own device memory object.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.kind, AllocationKind::Dedicated(_))
    }

    /// Whether the allocation may be evicted.
    pub fn can_become_lost(&self) -> bool {
        self.tracker.can_become_lost()
    }

    /// Whether the allocation has been evicted.
    pub fn is_lost(&self) -> bool {
        self.tracker.is_lost()
    }

    /// The last frame the allocation was used in, or [`FRAME_INDEX_LOST`].
    pub fn last_use_frame(&self) -> u32 {
        self.tracker.last_use_frame()
    }

    /// Opaque value attached by the caller.
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Attaches an opaque value.
    pub fn set_user_data(&mut self, user_data: u64) {
        self.user_data = user_data;
    }

    /// Whether the allocation is currently mapped, persistently or through
    /// [`Allocator::map`](crate::Allocator::map).
    pub fn is_mapped(&self) -> bool {
        self.map_state.is_mapped()
    }

    pub(crate) fn block_allocation(&self) -> Option<&BlockAllocation> {
        match &self.kind {
            AllocationKind::Block(block) => Some(block),
            AllocationKind::Dedicated(_) => None,
        }
    }

    /// Re-homes a block allocation to another block and offset. The caller
    /// moves the allocation's map references, [`MapState::total`] of them,
    /// from the old block to the new one. Only `BlockList::relocate` calls
    /// this; nothing in the public API moves allocations yet.
    pub(crate) fn change_allocation(&mut self, new_block: BlockId, new_offset: DeviceSize) {
        match &mut self.kind {
            AllocationKind::Block(block) => {
                block.block = new_block;
                block.offset = new_offset;
            }
            AllocationKind::Dedicated(_) => {
                debug_assert!(false, "dedicated allocations cannot change blocks");
            }
        }
    }
}

/// A snapshot of where an allocation lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationInfo<M> {
    /// Memory type the allocation lives in.
    pub memory_type_index: u32,
    /// The device memory object containing the allocation.
    pub memory: M,
    /// Offset of the allocation in `memory`.
    pub offset: DeviceSize,
    /// Size of the allocation in bytes.
    pub size: DeviceSize,
    /// Host pointer to the start of the allocation, if it is mapped.
    pub mapped: Option<NonNull<u8>>,
    /// Opaque value attached by the caller.
    pub user_data: u64,
}
