#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

use cfg_if::cfg_if;

mod allocation;
mod allocator;
mod block;
mod block_list;
mod budget;
mod create_info;
mod device;
mod error;
mod metadata;
mod pool;
mod stats;
mod suballocation;

#[cfg(test)]
mod test_device;

pub use allocation::{Allocation, AllocationInfo, FRAME_INDEX_LOST};
pub use allocator::lock::{LockingMechanism, SingleThreadedLock};
pub use allocator::{Allocator, AllocatorCreateInfo, DEFAULT_LARGE_HEAP_BLOCK_SIZE};
pub use budget::Budget;
pub use create_info::{
    AllocationCreateFlags, AllocationCreateInfo, AllocationStrategy, MemoryRequirements,
    MemoryUsage,
};
pub use device::{
    HeapBudget, MemoryAllocateFlags, MemoryDevice, MemoryHeap, MemoryHeapFlags, MemoryProperties,
    MemoryPropertyFlags, MemoryType,
};
pub use error::{AllocationError, DeviceError, MapError, ValidationError};
pub use pool::{PoolCreateFlags, PoolCreateInfo, PoolId};
pub use stats::{PoolStats, StatInfo, Stats};
pub use suballocation::{Suballocation, SuballocationType};

cfg_if! {
    if #[cfg(feature = "parking_lot")] {
        pub use allocator::lock::ParkingLotLock;

        /// The locking mechanism to use when the allocator is shared between
        /// threads.
        pub type DefaultLock = ParkingLotLock;
    } else {
        /// The locking mechanism to use when the allocator is shared between
        /// threads. Without the `parking_lot` feature, there is no thread-safe
        /// lock and this is [`SingleThreadedLock`].
        pub type DefaultLock = SingleThreadedLock;
    }
}

/// Sizes and offsets in device memory, in bytes.
pub type DeviceSize = u64;
