//! Per-heap memory accounting.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::DeviceSize;

/// A snapshot of one heap's memory accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Budget {
    /// Bytes of device memory this allocator holds in the heap, as blocks and
    /// dedicated allocations.
    pub block_bytes: DeviceSize,
    /// Bytes of those handed out as live allocations.
    pub allocation_bytes: DeviceSize,
    /// Bytes in use on the heap, as reported by the device or estimated as
    /// `block_bytes`.
    pub usage: DeviceSize,
    /// Bytes the process may use, as reported by the device or estimated as
    /// 80% of the heap size.
    pub budget: DeviceSize,
}

impl Budget {
    /// Bytes that can still be allocated before the budget is exceeded.
    pub fn headroom(&self) -> DeviceSize {
        self.budget.saturating_sub(self.usage)
    }
}

/// Atomic per-heap counters, shared by all block lists allocating from a heap.
#[derive(Debug)]
pub(crate) struct BudgetCounters {
    block_bytes: Vec<AtomicU64>,
    allocation_bytes: Vec<AtomicU64>,
}

impl BudgetCounters {
    pub(crate) fn new(heap_count: usize) -> Self {
        BudgetCounters {
            block_bytes: (0..heap_count).map(|_| AtomicU64::new(0)).collect(),
            allocation_bytes: (0..heap_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) fn block_bytes(&self, heap: usize) -> DeviceSize {
        self.block_bytes[heap].load(Ordering::Relaxed)
    }

    pub(crate) fn allocation_bytes(&self, heap: usize) -> DeviceSize {
        self.allocation_bytes[heap].load(Ordering::Relaxed)
    }

    pub(crate) fn add_block_bytes(&self, heap: usize, size: DeviceSize) {
        self.block_bytes[heap].fetch_add(size, Ordering::Relaxed);
    }

    /// Adds `size` to the heap's block bytes unless that would exceed `limit`.
    pub(crate) fn try_reserve_block_bytes(
        &self,
        heap: usize,
        size: DeviceSize,
        limit: DeviceSize,
    ) -> bool {
        self.block_bytes[heap]
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_add(size).filter(|&new| new <= limit)
            })
            .is_ok()
    }

    pub(crate) fn remove_block_bytes(&self, heap: usize, size: DeviceSize) {
        let previous = self.block_bytes[heap].fetch_sub(size, Ordering::Relaxed);
        debug_assert!(previous >= size, "block bytes underflow on heap {heap}");
    }

    pub(crate) fn add_allocation(&self, heap: usize, size: DeviceSize) {
        self.allocation_bytes[heap].fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn remove_allocation(&self, heap: usize, size: DeviceSize) {
        let previous = self.allocation_bytes[heap].fetch_sub(size, Ordering::Relaxed);
        debug_assert!(previous >= size, "allocation bytes underflow on heap {heap}");
    }
}
