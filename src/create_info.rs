//! Options for individual allocation requests.

use crate::device::MemoryPropertyFlags;
use crate::{AllocationError, DeviceSize, PoolId};

bitflags::bitflags! {
    /// Flags controlling a single allocation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationCreateFlags: u32 {
        /// Give the allocation its own device memory object.
        const DEDICATED_MEMORY = 1 << 0;
        /// Only use existing blocks; never allocate device memory.
        const NEVER_ALLOCATE = 1 << 1;
        /// Keep the allocation persistently mapped.
        const MAPPED = 1 << 2;
        /// The allocation may be evicted when it has not been used for more
        /// than the frame-in-use count.
        const CAN_BECOME_LOST = 1 << 3;
        /// The allocation may evict allocations created with
        /// `CAN_BECOME_LOST`.
        const CAN_MAKE_OTHER_LOST = 1 << 4;
        /// Fail instead of exceeding the heap budget.
        const WITHIN_BUDGET = 1 << 5;
        /// Place in the smallest free range that fits.
        const STRATEGY_BEST_FIT = 1 << 6;
        /// Place in the largest free range.
        const STRATEGY_WORST_FIT = 1 << 7;
        /// Place in the first suitable range found.
        const STRATEGY_FIRST_FIT = 1 << 8;
    }
}

/// Where inside a block list an allocation is placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// The smallest free range that fits. Blocks are tried in ascending order
    /// of free space.
    #[default]
    BestFit,
    /// The largest free range. Blocks are tried in descending order of free
    /// space.
    WorstFit,
    /// The first range found, searching as for `WorstFit`.
    FirstFit,
}

impl AllocationStrategy {
    /// Picks the strategy selected by `flags`. No strategy bit means
    /// `BestFit`; more than one is an error.
    pub fn from_flags(flags: AllocationCreateFlags) -> Result<Self, AllocationError> {
        let bits = flags
            & (AllocationCreateFlags::STRATEGY_BEST_FIT
                | AllocationCreateFlags::STRATEGY_WORST_FIT
                | AllocationCreateFlags::STRATEGY_FIRST_FIT);
        if bits.is_empty() || bits == AllocationCreateFlags::STRATEGY_BEST_FIT {
            Ok(AllocationStrategy::BestFit)
        } else if bits == AllocationCreateFlags::STRATEGY_WORST_FIT {
            Ok(AllocationStrategy::WorstFit)
        } else if bits == AllocationCreateFlags::STRATEGY_FIRST_FIT {
            Ok(AllocationStrategy::FirstFit)
        } else {
            Err(AllocationError::InvalidStrategy)
        }
    }
}

/// How the memory will be accessed, used to pick a memory type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// No preference; only `required_flags` and `preferred_flags` count.
    #[default]
    Unknown,
    /// Only accessed by the device.
    GpuOnly,
    /// Mapped and accessed by the host, e.g. staging buffers.
    CpuOnly,
    /// Written by the host each frame and read by the device.
    CpuToGpu,
    /// Written by the device and read back by the host.
    GpuToCpu,
}

impl MemoryUsage {
    /// The property flags this usage requires and prefers.
    pub fn property_flags(self) -> (MemoryPropertyFlags, MemoryPropertyFlags) {
        match self {
            MemoryUsage::Unknown => (MemoryPropertyFlags::empty(), MemoryPropertyFlags::empty()),
            MemoryUsage::GpuOnly => (
                MemoryPropertyFlags::empty(),
                MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            MemoryUsage::CpuOnly => (
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                MemoryPropertyFlags::empty(),
            ),
            MemoryUsage::CpuToGpu => (
                MemoryPropertyFlags::HOST_VISIBLE,
                MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            MemoryUsage::GpuToCpu => (
                MemoryPropertyFlags::HOST_VISIBLE,
                MemoryPropertyFlags::HOST_CACHED,
            ),
        }
    }
}

/// Parameters of one allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocationCreateInfo {
    /// Behaviour flags.
    pub flags: AllocationCreateFlags,
    /// Intended usage, adding to the required and preferred flags.
    pub usage: MemoryUsage,
    /// Property flags the memory type must have.
    pub required_flags: MemoryPropertyFlags,
    /// Property flags the memory type should have.
    pub preferred_flags: MemoryPropertyFlags,
    /// Acceptable memory types, one bit per index. Zero accepts all.
    pub memory_type_bits: u32,
    /// Allocate from this pool instead of the default block lists.
    pub pool: Option<PoolId>,
    /// Opaque value attached to the allocation.
    pub user_data: u64,
}

impl AllocationCreateInfo {
    /// Rejects contradictory flag combinations and returns the placement
    /// strategy.
    pub(crate) fn check(&self) -> Result<AllocationStrategy, AllocationError> {
        let flags = self.flags;
        if flags.contains(AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST) {
            return Err(AllocationError::InvalidArgument(
                "allocations that can become lost cannot be persistently mapped",
            ));
        }
        if flags.contains(
            AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE,
        ) {
            return Err(AllocationError::InvalidArgument(
                "dedicated allocations always allocate device memory",
            ));
        }
        if self.pool.is_some() && flags.contains(AllocationCreateFlags::DEDICATED_MEMORY) {
            return Err(AllocationError::InvalidArgument(
                "pool allocations cannot be dedicated",
            ));
        }
        AllocationStrategy::from_flags(flags)
    }
}

/// What a resource needs from its memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Size in bytes. Must not be zero.
    pub size: DeviceSize,
    /// Required alignment of the offset. Zero is treated as one.
    pub alignment: DeviceSize,
    /// Memory types the resource can live in, one bit per index. Zero
    /// accepts all.
    pub memory_type_bits: u32,
    /// The resource must have its own device memory object.
    pub requires_dedicated: bool,
    /// The resource works better with its own device memory object.
    pub prefers_dedicated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_from_flags() {
        type F = AllocationCreateFlags;
        assert_eq!(
            AllocationStrategy::from_flags(F::empty()),
            Ok(AllocationStrategy::BestFit)
        );
        assert_eq!(
            AllocationStrategy::from_flags(F::STRATEGY_WORST_FIT | F::MAPPED),
            Ok(AllocationStrategy::WorstFit)
        );
        assert_eq!(
            AllocationStrategy::from_flags(F::STRATEGY_FIRST_FIT),
            Ok(AllocationStrategy::FirstFit)
        );
        assert_eq!(
            AllocationStrategy::from_flags(F::STRATEGY_BEST_FIT | F::STRATEGY_FIRST_FIT),
            Err(AllocationError::InvalidStrategy)
        );
    }

    #[test]
    fn contradictory_flags_are_rejected() {
        let info = AllocationCreateInfo {
            flags: AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST,
            ..Default::default()
        };
        assert!(matches!(
            info.check(),
            Err(AllocationError::InvalidArgument(_))
        ));

        let info = AllocationCreateInfo {
            flags: AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE,
            ..Default::default()
        };
        assert!(matches!(
            info.check(),
            Err(AllocationError::InvalidArgument(_))
        ));

        assert_eq!(
            AllocationCreateInfo::default().check(),
            Ok(AllocationStrategy::BestFit)
        );
    }
}
