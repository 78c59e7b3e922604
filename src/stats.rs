//! Statistics value types.

use alloc::vec::Vec;

use crate::DeviceSize;

/// Aggregated statistics about blocks, allocations and unused ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatInfo {
    /// Number of device memory objects: blocks and dedicated allocations.
    pub block_count: u32,
    /// Number of live allocations.
    pub allocation_count: u32,
    /// Number of free ranges between allocations.
    pub unused_range_count: u32,
    /// Bytes occupied by allocations.
    pub used_bytes: DeviceSize,
    /// Bytes of blocks not occupied by any allocation.
    pub unused_bytes: DeviceSize,
    /// Smallest allocation size, or `DeviceSize::MAX` if there are none.
    pub allocation_size_min: DeviceSize,
    /// Average allocation size, valid after [`StatInfo::postprocess`].
    pub allocation_size_avg: DeviceSize,
    /// Largest allocation size.
    pub allocation_size_max: DeviceSize,
    /// Smallest unused range, or `DeviceSize::MAX` if there are none.
    pub unused_range_size_min: DeviceSize,
    /// Average unused range size, valid after [`StatInfo::postprocess`].
    pub unused_range_size_avg: DeviceSize,
    /// Largest unused range.
    pub unused_range_size_max: DeviceSize,
}

impl Default for StatInfo {
    fn default() -> Self {
        StatInfo {
            block_count: 0,
            allocation_count: 0,
            unused_range_count: 0,
            used_bytes: 0,
            unused_bytes: 0,
            allocation_size_min: DeviceSize::MAX,
            allocation_size_avg: 0,
            allocation_size_max: 0,
            unused_range_size_min: DeviceSize::MAX,
            unused_range_size_avg: 0,
            unused_range_size_max: 0,
        }
    }
}

impl StatInfo {
    /// Statistics of a single dedicated allocation.
    pub(crate) fn single_allocation(size: DeviceSize) -> Self {
        StatInfo {
            block_count: 1,
            allocation_count: 1,
            used_bytes: size,
            allocation_size_min: size,
            allocation_size_max: size,
            ..StatInfo::default()
        }
    }

    /// Folds `other` into `self`. Averages must be recomputed with
    /// [`StatInfo::postprocess`] afterwards.
    pub fn add(&mut self, other: &StatInfo) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.unused_range_count += other.unused_range_count;
        self.used_bytes += other.used_bytes;
        self.unused_bytes += other.unused_bytes;
        self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }

    /// Computes the averages from the sums and counts.
    pub fn postprocess(&mut self) {
        self.allocation_size_avg = rounded_div(self.used_bytes, self.allocation_count);
        self.unused_range_size_avg = rounded_div(self.unused_bytes, self.unused_range_count);
    }
}

fn rounded_div(sum: DeviceSize, count: u32) -> DeviceSize {
    if count == 0 {
        0
    } else {
        let count = DeviceSize::from(count);
        (sum + count / 2) / count
    }
}

/// Statistics of the whole allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Per memory type.
    pub memory_type: Vec<StatInfo>,
    /// Per memory heap.
    pub memory_heap: Vec<StatInfo>,
    /// Everything.
    pub total: StatInfo,
}

/// Statistics of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes of the pool's blocks.
    pub size: DeviceSize,
    /// Bytes of the pool's blocks not occupied by allocations.
    pub unused_size: DeviceSize,
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Number of free ranges.
    pub unused_range_count: usize,
    /// Size of the largest free range.
    pub unused_range_size_max: DeviceSize,
    /// Number of blocks.
    pub block_count: usize,
}
