//! Custom pools: block lists with explicit block-count policy.

use alloc::string::String;

use crate::block_list::BlockList;
use crate::DeviceSize;

/// Identifies a pool created with
/// [`Allocator::create_pool`](crate::Allocator::create_pool).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) u32);

bitflags::bitflags! {
    /// Flags controlling a pool.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PoolCreateFlags: u32 {
        /// The caller guarantees that linear and non-linear resources are
        /// never mixed in the pool, so buffer-image granularity is ignored.
        const IGNORE_BUFFER_IMAGE_GRANULARITY = 1 << 1;
    }
}

/// Parameters of a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolCreateInfo {
    /// The memory type all of the pool's blocks are allocated from.
    pub memory_type_index: u32,
    /// Behaviour flags.
    pub flags: PoolCreateFlags,
    /// Size of every block. Zero derives a preferred size from the heap and
    /// lets new blocks start smaller.
    pub block_size: DeviceSize,
    /// Blocks allocated up front and never released.
    pub min_block_count: usize,
    /// Upper bound on the number of blocks. Zero means unlimited.
    pub max_block_count: usize,
    /// For how many frames after its last use an allocation that can become
    /// lost is protected from eviction.
    pub frame_in_use_count: u32,
    /// Optional name, for debugging.
    pub name: Option<String>,
}

pub(crate) struct MemoryPool<M, L> {
    id: PoolId,
    name: Option<String>,
    pub(crate) block_list: BlockList<M, L>,
}

impl<M, L> MemoryPool<M, L> {
    pub(crate) fn new(id: PoolId, name: Option<String>, block_list: BlockList<M, L>) -> Self {
        MemoryPool {
            id,
            name,
            block_list,
        }
    }

    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }
}
