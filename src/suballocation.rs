//! Value types describing byte ranges inside a block, plus the alignment and
//! buffer-image-granularity helpers the placement search is built on.

use crate::DeviceSize;

/// The extra cost charged for every allocation a placement would evict.
///
/// This makes a request that evicts one small allocation more expensive than
/// one that only consumes free space, so eviction is a last resort even when
/// the evicted bytes are few.
pub(crate) const LOST_ALLOCATION_COST: DeviceSize = 1 << 20;

/// What kind of resource occupies a suballocation.
///
/// Used to respect the device's buffer-image granularity: linear and optimal
/// resources must not share a granularity-sized page.
///
/// The declaration order matters: [`SuballocationType::conflicts_with`] relies
/// on it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuballocationType {
    /// Unused space.
    Free,
    /// Unknown resource; conservatively conflicts with everything.
    #[default]
    Unknown,
    /// A buffer.
    Buffer,
    /// An image whose tiling is not known.
    ImageUnknown,
    /// An image with linear tiling.
    ImageLinear,
    /// An image with optimal tiling.
    ImageOptimal,
}

impl SuballocationType {
    /// Whether two resources of these types placed on the same
    /// granularity-aligned page would violate buffer-image granularity.
    pub fn conflicts_with(self, other: SuballocationType) -> bool {
        let (lo, hi) = if self <= other {
            (self, other)
        } else {
            (other, self)
        };

        match lo {
            SuballocationType::Free => false,
            SuballocationType::Unknown => true,
            SuballocationType::Buffer => matches!(
                hi,
                SuballocationType::ImageUnknown | SuballocationType::ImageOptimal
            ),
            SuballocationType::ImageUnknown => matches!(
                hi,
                SuballocationType::ImageUnknown
                    | SuballocationType::ImageLinear
                    | SuballocationType::ImageOptimal
            ),
            SuballocationType::ImageLinear => hi == SuballocationType::ImageOptimal,
            SuballocationType::ImageOptimal => false,
        }
    }
}

/// A byte range inside a block, as seen from the outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Suballocation {
    /// Offset from the start of the block.
    pub offset: DeviceSize,
    /// Size in bytes.
    pub size: DeviceSize,
    /// What occupies the range.
    pub ty: SuballocationType,
    /// The last frame the occupying allocation was used in, if any.
    pub last_use_frame: Option<u32>,
}

/// Index of a suballocation node inside one block's metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The result of a placement search. Only meaningful until the owning block's
/// metadata is next modified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocationRequest {
    /// The first suballocation the placement overlaps.
    pub(crate) item: NodeId,
    /// Where the allocation would start.
    pub(crate) offset: DeviceSize,
    /// Free bytes consumed by the placement.
    pub(crate) sum_free_size: DeviceSize,
    /// Bytes of live allocations that would be evicted.
    pub(crate) sum_item_size: DeviceSize,
    /// How many live allocations would be evicted.
    pub(crate) items_to_evict: usize,
}

impl AllocationRequest {
    pub(crate) fn cost(&self) -> DeviceSize {
        self.sum_item_size
            .saturating_add((self.items_to_evict as DeviceSize).saturating_mul(LOST_ALLOCATION_COST))
    }
}

/// Rounds `value` up to a multiple of `alignment`. An alignment of zero is
/// treated as one.
pub(crate) fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    if alignment <= 1 {
        return value;
    }
    if alignment.is_power_of_two() {
        (value + alignment - 1) & !(alignment - 1)
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Rounds `value` down to a multiple of `alignment`.
pub(crate) fn align_down(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    if alignment <= 1 {
        return value;
    }
    value / alignment * alignment
}

/// Checks if the resource `[a_offset, a_offset + a_size)` ends on the same
/// page that `b_offset` starts on.
///
/// Assumes `a_size > 0` and `a_offset + a_size <= b_offset`.
pub(crate) fn blocks_on_same_page(
    a_offset: DeviceSize,
    a_size: DeviceSize,
    b_offset: DeviceSize,
    page_size: DeviceSize,
) -> bool {
    debug_assert!(a_size > 0);
    debug_assert!(a_offset + a_size <= b_offset);

    let a_end = a_offset + a_size - 1;
    align_down(a_end, page_size) == align_down(b_offset, page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use SuballocationType::*;

    #[test]
    fn granularity_conflicts_are_symmetric() {
        let all = [Free, Unknown, Buffer, ImageUnknown, ImageLinear, ImageOptimal];
        for a in all {
            for b in all {
                assert_eq!(a.conflicts_with(b), b.conflicts_with(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn granularity_conflict_table() {
        assert!(!Free.conflicts_with(Unknown));
        assert!(Unknown.conflicts_with(Buffer));
        assert!(Buffer.conflicts_with(ImageOptimal));
        assert!(Buffer.conflicts_with(ImageUnknown));
        assert!(!Buffer.conflicts_with(ImageLinear));
        assert!(!Buffer.conflicts_with(Buffer));
        assert!(ImageLinear.conflicts_with(ImageOptimal));
        assert!(!ImageOptimal.conflicts_with(ImageOptimal));
        assert!(ImageUnknown.conflicts_with(ImageUnknown));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(10, 0), 10);
        assert_eq!(align_up(10, 6), 12);
        assert_eq!(align_down(511, 256), 256);
        assert_eq!(align_down(7, 1), 7);
    }

    #[test]
    fn same_page_detection() {
        assert!(blocks_on_same_page(0, 10, 100, 1024));
        assert!(!blocks_on_same_page(0, 1024, 1024, 1024));
        assert!(blocks_on_same_page(0, 1025, 1030, 1024));
    }

    #[test]
    fn request_cost_counts_evictions() {
        let request = AllocationRequest {
            item: NodeId(0),
            offset: 0,
            sum_free_size: 100,
            sum_item_size: 64,
            items_to_evict: 2,
        };
        assert_eq!(request.cost(), 64 + 2 * LOST_ALLOCATION_COST);
    }
}
