//! Per-block bookkeeping of which byte ranges are free and which are used.
//!
//! Suballocations form a doubly-linked list in offset order, stored in a slab
//! so that links are plain indices. Free suballocations are additionally
//! indexed by size, in ascending order, for the placement search. Adjacent
//! free suballocations are always merged, so the list alternates between used
//! runs and single free ranges.

use alloc::sync::Arc;
use alloc::{vec, vec::Vec};

use crate::allocation::AllocationTracker;
use crate::create_info::AllocationStrategy;
use crate::error::{ensure, ValidationError};
use crate::stats::{PoolStats, StatInfo};
use crate::suballocation::{
    align_up, blocks_on_same_page, AllocationRequest, NodeId, Suballocation, SuballocationType,
};
use crate::DeviceSize;

/// Block-list wide parameters of a placement search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PlacementParams {
    pub(crate) current_frame: u32,
    pub(crate) frame_in_use_count: u32,
    pub(crate) granularity: DeviceSize,
    pub(crate) debug_margin: DeviceSize,
}

#[derive(Clone, Debug)]
struct Node {
    offset: DeviceSize,
    // Zero only for vacant slab entries.
    size: DeviceSize,
    alignment: DeviceSize,
    ty: SuballocationType,
    tracker: Option<Arc<AllocationTracker>>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl Node {
    fn is_free(&self) -> bool {
        self.ty == SuballocationType::Free
    }

    fn is_evictable(&self, params: &PlacementParams) -> bool {
        self.tracker
            .as_deref()
            .is_some_and(|t| t.is_evictable(params.current_frame, params.frame_in_use_count))
    }
}

pub(crate) struct BlockMetadata {
    size: DeviceSize,
    nodes: Vec<Node>,
    vacant: Vec<NodeId>,
    head: NodeId,
    free_count: usize,
    sum_free_size: DeviceSize,
    free_by_size: Vec<NodeId>,
}

impl BlockMetadata {
    pub(crate) fn new(size: DeviceSize) -> Self {
        debug_assert!(size > 0);
        let head = NodeId(0);
        BlockMetadata {
            size,
            nodes: vec![Node {
                offset: 0,
                size,
                alignment: 1,
                ty: SuballocationType::Free,
                tracker: None,
                prev: None,
                next: None,
            }],
            vacant: Vec::new(),
            head,
            free_count: 1,
            sum_free_size: size,
            free_by_size: vec![head],
        }
    }

    pub(crate) fn size(&self) -> DeviceSize {
        self.size
    }

    pub(crate) fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.nodes.len() - self.vacant.len() - self.free_count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.allocation_count() == 0
    }

    pub(crate) fn unused_range_size_max(&self) -> DeviceSize {
        self.free_by_size
            .last()
            .map_or(0, |&id| self.node(id).size)
    }

    /// Searches for a place for an allocation of `size` bytes.
    ///
    /// Free ranges are tried first, in the order `strategy` prescribes. When
    /// that fails and `allow_eviction` is set, every position is considered,
    /// including ones overlapping allocations that may be evicted, and the
    /// cheapest one wins.
    pub(crate) fn create_allocation_request(
        &self,
        params: &PlacementParams,
        size: DeviceSize,
        alignment: DeviceSize,
        ty: SuballocationType,
        allow_eviction: bool,
        strategy: AllocationStrategy,
    ) -> Option<AllocationRequest> {
        debug_assert!(size > 0);
        debug_assert_ne!(ty, SuballocationType::Free);

        let needed = size.saturating_add(params.debug_margin.saturating_mul(2));
        if !allow_eviction && self.sum_free_size < needed {
            return None;
        }

        match strategy {
            AllocationStrategy::BestFit => {
                let nodes = &self.nodes;
                let start = self
                    .free_by_size
                    .partition_point(|&id| nodes[id.index()].size < needed);
                for &id in &self.free_by_size[start..] {
                    if let Some(request) =
                        self.check_allocation(params, size, alignment, ty, id, false)
                    {
                        return Some(request);
                    }
                }
            }
            AllocationStrategy::WorstFit | AllocationStrategy::FirstFit => {
                for &id in self.free_by_size.iter().rev() {
                    if self.node(id).size < needed {
                        break;
                    }
                    if let Some(request) =
                        self.check_allocation(params, size, alignment, ty, id, false)
                    {
                        return Some(request);
                    }
                }
            }
        }

        if !allow_eviction {
            return None;
        }

        let mut best: Option<AllocationRequest> = None;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let node = self.node(id);
            cursor = node.next;
            if !node.is_free() && !node.is_evictable(params) {
                continue;
            }
            let Some(request) = self.check_allocation(params, size, alignment, ty, id, true) else {
                continue;
            };
            if best.map_or(true, |b| request.cost() < b.cost()) {
                best = Some(request);
                if request.cost() == 0 || strategy == AllocationStrategy::FirstFit {
                    break;
                }
            }
        }
        best
    }

    /// Checks whether an allocation can start inside `item`, and where.
    ///
    /// Without eviction `item` must be free and the allocation must fit in
    /// it. With eviction the allocation may extend over following
    /// suballocations as long as every used one among them can be evicted.
    fn check_allocation(
        &self,
        params: &PlacementParams,
        size: DeviceSize,
        alignment: DeviceSize,
        ty: SuballocationType,
        item: NodeId,
        allow_eviction: bool,
    ) -> Option<AllocationRequest> {
        let margin = params.debug_margin;
        let granularity = params.granularity;
        let start = self.node(item);

        let mut request = AllocationRequest {
            item,
            offset: 0,
            sum_free_size: 0,
            sum_item_size: 0,
            items_to_evict: 0,
        };

        if allow_eviction {
            if start.is_free() {
                request.sum_free_size = start.size;
            } else if start.is_evictable(params) {
                request.items_to_evict = 1;
                request.sum_item_size = start.size;
            } else {
                return None;
            }
            if self.size - start.offset < size {
                return None;
            }
        } else {
            debug_assert!(start.is_free());
            request.sum_free_size = start.size;
            if start.size < size {
                return None;
            }
        }

        let mut offset = align_up(start.offset.checked_add(margin)?, alignment);
        if granularity > 1 && self.conflicts_with_previous(item, offset, ty, granularity) {
            offset = align_up(offset, granularity);
        }

        if offset >= start.offset + start.size {
            return None;
        }
        let padding_begin = offset - start.offset;
        let total = padding_begin.checked_add(size)?.checked_add(margin)?;

        if allow_eviction {
            if start.offset.checked_add(total)? > self.size {
                return None;
            }

            let mut last = item;
            if total > start.size {
                let mut remaining = total - start.size;
                while remaining > 0 {
                    let next_id = self.node(last).next?;
                    let next = self.node(next_id);
                    if next.is_free() {
                        request.sum_free_size += next.size;
                    } else if next.is_evictable(params) {
                        request.items_to_evict += 1;
                        request.sum_item_size += next.size;
                    } else {
                        return None;
                    }
                    remaining = remaining.saturating_sub(next.size);
                    last = next_id;
                }
            }

            if granularity > 1 {
                let mut cursor = self.node(last).next;
                while let Some(id) = cursor {
                    let next = self.node(id);
                    if !blocks_on_same_page(offset, size, next.offset, granularity) {
                        break;
                    }
                    if ty.conflicts_with(next.ty) {
                        if !next.is_evictable(params) {
                            return None;
                        }
                        request.items_to_evict += 1;
                    }
                    cursor = next.next;
                }
            }
        } else {
            if total > start.size {
                return None;
            }
            if granularity > 1 && self.conflicts_with_next(start.next, offset, size, ty, granularity)
            {
                return None;
            }
        }

        request.offset = offset;
        Some(request)
    }

    fn conflicts_with_previous(
        &self,
        item: NodeId,
        offset: DeviceSize,
        ty: SuballocationType,
        granularity: DeviceSize,
    ) -> bool {
        let mut cursor = self.node(item).prev;
        while let Some(id) = cursor {
            let prev = self.node(id);
            if !blocks_on_same_page(prev.offset, prev.size, offset, granularity) {
                return false;
            }
            if prev.ty.conflicts_with(ty) {
                return true;
            }
            cursor = prev.prev;
        }
        false
    }

    fn conflicts_with_next(
        &self,
        mut cursor: Option<NodeId>,
        offset: DeviceSize,
        size: DeviceSize,
        ty: SuballocationType,
        granularity: DeviceSize,
    ) -> bool {
        while let Some(id) = cursor {
            let next = self.node(id);
            if !blocks_on_same_page(offset, size, next.offset, granularity) {
                return false;
            }
            if ty.conflicts_with(next.ty) {
                return true;
            }
            cursor = next.next;
        }
        false
    }

    /// Commits a placement found by
    /// [`create_allocation_request`](Self::create_allocation_request). The
    /// request must not require evictions, or those must have been carried out
    /// with [`make_requested_allocations_lost`](Self::make_requested_allocations_lost).
    pub(crate) fn alloc(
        &mut self,
        request: &AllocationRequest,
        ty: SuballocationType,
        size: DeviceSize,
        alignment: DeviceSize,
        tracker: Arc<AllocationTracker>,
    ) {
        debug_assert_ne!(ty, SuballocationType::Free);
        let item = request.item;
        let node = self.node(item);
        debug_assert!(node.is_free());
        debug_assert!(request.offset >= node.offset);
        let padding_begin = request.offset - node.offset;
        debug_assert!(node.size >= padding_begin + size);
        let padding_end = node.size - padding_begin - size;

        self.unregister_free(item);
        let node = self.node_mut(item);
        node.offset = request.offset;
        node.size = size;
        node.alignment = alignment;
        node.ty = ty;
        node.tracker = Some(tracker);
        self.free_count -= 1;

        if padding_end > 0 {
            let id = self.insert_after(item, free_node(request.offset + size, padding_end));
            self.register_free(id);
            self.free_count += 1;
        }
        if padding_begin > 0 {
            let id = self.insert_before(item, free_node(request.offset - padding_begin, padding_begin));
            self.register_free(id);
            self.free_count += 1;
        }
        self.sum_free_size -= size;

        log::trace!(
            "placed {size} byte {ty:?} suballocation at offset {}",
            request.offset
        );
        self.heavy_validate();
    }

    /// Frees the used suballocation starting at `offset` that `owner` tracks.
    /// Returns its size, or `None` when no suballocation of `owner` starts
    /// there.
    pub(crate) fn free_at_offset(
        &mut self,
        offset: DeviceSize,
        owner: &AllocationTracker,
    ) -> Option<DeviceSize> {
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let node = self.node(id);
            if node.offset == offset && !node.is_free() {
                if !node.tracker.as_deref().is_some_and(|t| core::ptr::eq(t, owner)) {
                    log::warn!("suballocation at offset {offset} belongs to another allocation");
                    return None;
                }
                let size = node.size;
                self.free_suballocation(id);
                self.heavy_validate();
                return Some(size);
            }
            if node.offset > offset {
                break;
            }
            cursor = node.next;
        }
        log::warn!("no suballocation to free at offset {offset}");
        None
    }

    /// Marks a used suballocation free and merges it with free neighbours.
    /// Returns the resulting free suballocation.
    fn free_suballocation(&mut self, item: NodeId) -> NodeId {
        let node = self.node_mut(item);
        debug_assert!(!node.is_free());
        node.ty = SuballocationType::Free;
        node.tracker = None;
        node.alignment = 1;
        let size = node.size;
        let (prev, next) = (node.prev, node.next);

        self.free_count += 1;
        self.sum_free_size += size;

        if let Some(next) = next.filter(|&n| self.node(n).is_free()) {
            self.unregister_free(next);
            self.merge_with_next(item);
        }
        match prev.filter(|&p| self.node(p).is_free()) {
            Some(prev) => {
                self.unregister_free(prev);
                self.merge_with_next(prev);
                self.register_free(prev);
                prev
            }
            None => {
                self.register_free(item);
                item
            }
        }
    }

    /// Absorbs the free successor of `item`, which must not be indexed.
    fn merge_with_next(&mut self, item: NodeId) {
        let Some(next) = self.node(item).next else {
            debug_assert!(false, "no suballocation to merge with");
            return;
        };
        let next_size = self.node(next).size;
        self.node_mut(item).size += next_size;
        self.unlink(next);
        self.free_count -= 1;
    }

    /// Evicts every evictable allocation not used in the last
    /// `frame_in_use_count` frames. Returns how many were evicted.
    pub(crate) fn make_allocations_lost(
        &mut self,
        current_frame: u32,
        frame_in_use_count: u32,
    ) -> usize {
        let mut lost = 0;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let node = self.node(id);
            let evicted = match &node.tracker {
                Some(tracker) if tracker.can_become_lost() => {
                    tracker.make_lost(current_frame, frame_in_use_count)
                }
                _ => false,
            };
            cursor = if evicted {
                lost += 1;
                let merged = self.free_suballocation(id);
                self.node(merged).next
            } else {
                node.next
            };
        }
        if lost > 0 {
            self.heavy_validate();
        }
        lost
    }

    /// Evicts exactly the allocations `request` was computed to overlap, so
    /// that it can be committed with [`alloc`](Self::alloc).
    ///
    /// Fails when one of them was used since the request was computed. Any
    /// allocations evicted before that stay evicted.
    pub(crate) fn make_requested_allocations_lost(
        &mut self,
        params: &PlacementParams,
        request: &mut AllocationRequest,
        size: DeviceSize,
        ty: SuballocationType,
    ) -> bool {
        let placement_end = request.offset + size + params.debug_margin;
        let mut remaining = request.items_to_evict;
        let mut cursor = Some(request.item);

        while remaining > 0 {
            let Some(id) = cursor else {
                debug_assert!(false, "ran out of suballocations to evict");
                return false;
            };
            let node = self.node(id);
            if node.is_free() {
                cursor = node.next;
                continue;
            }
            let overlaps = node.offset < placement_end;
            let page_conflict = !overlaps
                && params.granularity > 1
                && blocks_on_same_page(request.offset, size, node.offset, params.granularity)
                && ty.conflicts_with(node.ty);
            if !overlaps && !page_conflict {
                cursor = node.next;
                continue;
            }

            let evicted = node.tracker.as_deref().is_some_and(|t| {
                t.can_become_lost() && t.make_lost(params.current_frame, params.frame_in_use_count)
            });
            if !evicted {
                return false;
            }
            let merged = self.free_suballocation(id);
            remaining -= 1;
            cursor = self.node(merged).next;
        }

        let Some(item) = self.node_containing(request.offset) else {
            return false;
        };
        let node = self.node(item);
        if !node.is_free() || node.offset + node.size < placement_end {
            debug_assert!(false, "evictions did not free the requested range");
            return false;
        }
        request.item = item;
        request.items_to_evict = 0;
        self.heavy_validate();
        true
    }

    fn node_containing(&self, offset: DeviceSize) -> Option<NodeId> {
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let node = self.node(id);
            if offset < node.offset + node.size {
                return Some(id);
            }
            cursor = node.next;
        }
        None
    }

    /// Whether a resource of one granularity class could share a page with a
    /// conflicting one in this block.
    ///
    /// `prev_type` carries the type of the last used suballocation across the
    /// blocks of a list.
    pub(crate) fn is_buffer_image_granularity_conflict_possible(
        &self,
        granularity: DeviceSize,
        prev_type: &mut SuballocationType,
    ) -> bool {
        if granularity <= 1 || self.is_empty() {
            return false;
        }

        let mut min_alignment = DeviceSize::MAX;
        let mut type_conflict = false;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let node = self.node(id);
            if !node.is_free() {
                min_alignment = min_alignment.min(node.alignment);
                if prev_type.conflicts_with(node.ty) {
                    type_conflict = true;
                }
                *prev_type = node.ty;
            }
            cursor = node.next;
        }
        type_conflict && min_alignment < granularity
    }

    /// Iterates over all suballocations in offset order.
    pub(crate) fn suballocations(&self) -> impl Iterator<Item = Suballocation> + '_ {
        let mut cursor = Some(self.head);
        core::iter::from_fn(move || {
            let node = self.node(cursor?);
            cursor = node.next;
            Some(Suballocation {
                offset: node.offset,
                size: node.size,
                ty: node.ty,
                last_use_frame: node.tracker.as_ref().map(|t| t.last_use_frame()),
            })
        })
    }

    pub(crate) fn stat_info(&self) -> StatInfo {
        let mut info = StatInfo {
            block_count: 1,
            allocation_count: self.allocation_count() as u32,
            unused_range_count: self.free_count as u32,
            used_bytes: self.size - self.sum_free_size,
            unused_bytes: self.sum_free_size,
            ..StatInfo::default()
        };
        for suballocation in self.suballocations() {
            if suballocation.ty == SuballocationType::Free {
                info.unused_range_size_min = info.unused_range_size_min.min(suballocation.size);
                info.unused_range_size_max = info.unused_range_size_max.max(suballocation.size);
            } else {
                info.allocation_size_min = info.allocation_size_min.min(suballocation.size);
                info.allocation_size_max = info.allocation_size_max.max(suballocation.size);
            }
        }
        info
    }

    pub(crate) fn add_pool_stats(&self, stats: &mut PoolStats) {
        stats.size += self.size;
        stats.unused_size += self.sum_free_size;
        stats.allocation_count += self.allocation_count();
        stats.unused_range_count += self.free_count;
        stats.unused_range_size_max = stats.unused_range_size_max.max(self.unused_range_size_max());
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        ensure!(
            self.node(self.head).prev.is_none(),
            "first suballocation has a predecessor"
        );

        let mut expected_offset = 0;
        let mut free_count = 0;
        let mut sum_free_size = 0;
        let mut live = 0;
        let mut prev_free = false;
        let mut prev = None;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            ensure!(live < self.nodes.len(), "suballocation list has a cycle");
            let node = self.node(id);
            ensure!(node.prev == prev, "broken suballocation back link");
            ensure!(
                node.offset == expected_offset,
                "suballocations are not contiguous"
            );
            ensure!(node.size > 0, "vacant suballocation is linked");

            let free = node.is_free();
            ensure!(
                !(free && prev_free),
                "adjacent free suballocations were not merged"
            );
            ensure!(
                free == node.tracker.is_none(),
                "allocation tracker does not match suballocation type"
            );
            if free {
                free_count += 1;
                sum_free_size += node.size;
            }

            expected_offset += node.size;
            live += 1;
            prev_free = free;
            prev = Some(id);
            cursor = node.next;
        }

        ensure!(
            expected_offset == self.size,
            "suballocation sizes do not sum to the block size"
        );
        ensure!(
            live + self.vacant.len() == self.nodes.len(),
            "unlinked suballocation is not vacant"
        );
        ensure!(free_count == self.free_count, "wrong free range count");
        ensure!(sum_free_size == self.sum_free_size, "wrong free byte count");
        ensure!(
            self.free_by_size.len() == free_count,
            "size index does not hold every free range"
        );

        let mut last_size = 0;
        for &id in &self.free_by_size {
            let node = self.node(id);
            ensure!(node.size > 0, "vacant suballocation in the size index");
            ensure!(node.is_free(), "used suballocation in the size index");
            ensure!(node.size >= last_size, "size index is not sorted");
            last_size = node.size;
        }
        Ok(())
    }

    #[inline]
    fn heavy_validate(&self) {
        #[cfg(feature = "heavy_validation")]
        {
            if let Err(e) = self.validate() {
                panic!("block metadata is corrupt: {e}");
            }
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    fn insert_node(&mut self, node: Node) -> NodeId {
        match self.vacant.pop() {
            Some(id) => {
                *self.node_mut(id) = node;
                id
            }
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(node);
                id
            }
        }
    }

    fn insert_after(&mut self, at: NodeId, mut node: Node) -> NodeId {
        let next = self.node(at).next;
        node.prev = Some(at);
        node.next = next;
        let id = self.insert_node(node);
        self.node_mut(at).next = Some(id);
        if let Some(next) = next {
            self.node_mut(next).prev = Some(id);
        }
        id
    }

    fn insert_before(&mut self, at: NodeId, mut node: Node) -> NodeId {
        let prev = self.node(at).prev;
        node.prev = prev;
        node.next = Some(at);
        let id = self.insert_node(node);
        self.node_mut(at).prev = Some(id);
        match prev {
            Some(prev) => self.node_mut(prev).next = Some(id),
            None => self.head = id,
        }
        id
    }

    fn unlink(&mut self, id: NodeId) {
        let (prev, next) = {
            let node = self.node(id);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => {
                if let Some(next) = next {
                    self.head = next;
                }
            }
        }
        if let Some(next) = next {
            self.node_mut(next).prev = prev;
        }

        let node = self.node_mut(id);
        node.size = 0;
        node.tracker = None;
        node.prev = None;
        node.next = None;
        self.vacant.push(id);
    }

    fn register_free(&mut self, id: NodeId) {
        let nodes = &self.nodes;
        let size = nodes[id.index()].size;
        let pos = self
            .free_by_size
            .partition_point(|&other| nodes[other.index()].size < size);
        self.free_by_size.insert(pos, id);
    }

    fn unregister_free(&mut self, id: NodeId) {
        let nodes = &self.nodes;
        let size = nodes[id.index()].size;
        let start = self
            .free_by_size
            .partition_point(|&other| nodes[other.index()].size < size);
        let found = self.free_by_size[start..]
            .iter()
            .take_while(|&&other| nodes[other.index()].size == size)
            .position(|&other| other == id);
        match found {
            Some(i) => {
                self.free_by_size.remove(start + i);
            }
            None => debug_assert!(false, "free suballocation missing from the size index"),
        }
    }
}

fn free_node(offset: DeviceSize, size: DeviceSize) -> Node {
    Node {
        offset,
        size,
        alignment: 1,
        ty: SuballocationType::Free,
        tracker: None,
        prev: None,
        next: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suballocation::LOST_ALLOCATION_COST;
    use SuballocationType::*;

    fn params(granularity: DeviceSize) -> PlacementParams {
        PlacementParams {
            current_frame: 0,
            frame_in_use_count: 0,
            granularity,
            debug_margin: 0,
        }
    }

    fn place(
        meta: &mut BlockMetadata,
        params: &PlacementParams,
        size: DeviceSize,
        alignment: DeviceSize,
        ty: SuballocationType,
        strategy: AllocationStrategy,
        can_become_lost: bool,
    ) -> Option<(DeviceSize, Arc<AllocationTracker>)> {
        let request =
            meta.create_allocation_request(params, size, alignment, ty, false, strategy)?;
        let tracker = Arc::new(AllocationTracker::new(params.current_frame, can_become_lost));
        meta.alloc(&request, ty, size, alignment, tracker.clone());
        meta.validate().unwrap();
        Some((request.offset, tracker))
    }

    /// Frees the suballocation at `offset` on behalf of whoever owns it.
    fn free(meta: &mut BlockMetadata, offset: DeviceSize) -> Option<DeviceSize> {
        let owner = meta
            .nodes
            .iter()
            .find(|n| n.size > 0 && n.offset == offset)
            .and_then(|n| n.tracker.clone())?;
        meta.free_at_offset(offset, &owner)
    }

    fn best_fit(
        meta: &mut BlockMetadata,
        size: DeviceSize,
        alignment: DeviceSize,
        ty: SuballocationType,
    ) -> DeviceSize {
        place(meta, &params(1), size, alignment, ty, AllocationStrategy::BestFit, false)
            .unwrap()
            .0
    }

    /// Three holes of 50, 200 and 450 bytes at offsets 100, 250 and 550.
    fn holey_block() -> BlockMetadata {
        let mut meta = BlockMetadata::new(1000);
        for size in [100, 50, 100, 200, 100] {
            best_fit(&mut meta, size, 1, Buffer);
        }
        assert_eq!(free(&mut meta, 100), Some(50));
        assert_eq!(free(&mut meta, 250), Some(200));
        meta.validate().unwrap();
        meta
    }

    #[test]
    fn new_block_is_one_free_range() {
        let meta = BlockMetadata::new(4096);
        meta.validate().unwrap();
        assert!(meta.is_empty());
        assert_eq!(meta.sum_free_size(), 4096);
        assert_eq!(meta.unused_range_size_max(), 4096);
    }

    #[test]
    fn best_fit_uses_smallest_hole() {
        let mut meta = holey_block();
        assert_eq!(best_fit(&mut meta, 40, 1, Buffer), 100);
        assert_eq!(best_fit(&mut meta, 150, 1, Buffer), 250);
    }

    #[test]
    fn worst_and_first_fit_use_largest_hole() {
        for strategy in [AllocationStrategy::WorstFit, AllocationStrategy::FirstFit] {
            let mut meta = holey_block();
            let (offset, _) = place(&mut meta, &params(1), 40, 1, Buffer, strategy, false).unwrap();
            assert_eq!(offset, 550);
        }
    }

    #[test]
    fn alignment_creates_leading_padding() {
        let mut meta = BlockMetadata::new(1024);
        assert_eq!(best_fit(&mut meta, 10, 1, Buffer), 0);
        assert_eq!(best_fit(&mut meta, 10, 256, Buffer), 256);
        assert_eq!(meta.allocation_count(), 2);
        assert_eq!(meta.sum_free_size(), 1004);
        // Padding [10, 256) stays usable.
        assert_eq!(best_fit(&mut meta, 100, 1, Buffer), 10);
    }

    #[test]
    fn free_restores_free_bytes_and_merges() {
        let mut meta = BlockMetadata::new(1000);
        let a = best_fit(&mut meta, 100, 1, Buffer);
        let b = best_fit(&mut meta, 100, 1, Buffer);
        let c = best_fit(&mut meta, 100, 1, Buffer);
        assert_eq!(free(&mut meta, a), Some(100));
        assert_eq!(free(&mut meta, c), Some(100));
        assert_eq!(free(&mut meta, b), Some(100));
        meta.validate().unwrap();
        assert!(meta.is_empty());
        assert_eq!(meta.suballocations().count(), 1);
        assert_eq!(meta.sum_free_size(), 1000);
    }

    #[test]
    fn free_at_unknown_offset_is_rejected() {
        let mut meta = BlockMetadata::new(1000);
        best_fit(&mut meta, 100, 1, Buffer);
        let stranger = AllocationTracker::new(0, false);
        assert_eq!(meta.free_at_offset(50, &stranger), None);
        assert_eq!(meta.free_at_offset(100, &stranger), None);
        meta.validate().unwrap();
    }

    #[test]
    fn free_requires_the_owning_allocation() {
        let mut meta = BlockMetadata::new(1000);
        let strategy = AllocationStrategy::BestFit;
        let (offset, owner) = place(&mut meta, &params(1), 100, 1, Buffer, strategy, false).unwrap();

        let stranger = AllocationTracker::new(0, false);
        assert_eq!(meta.free_at_offset(offset, &stranger), None);
        assert_eq!(meta.allocation_count(), 1);
        meta.validate().unwrap();

        assert_eq!(meta.free_at_offset(offset, &owner), Some(100));
        assert!(meta.is_empty());
    }

    #[test]
    fn granularity_pushes_past_conflicting_predecessor() {
        let mut meta = BlockMetadata::new(1024);
        let params = params(256);
        let strategy = AllocationStrategy::BestFit;
        assert_eq!(place(&mut meta, &params, 100, 1, Buffer, strategy, false).unwrap().0, 0);
        assert_eq!(place(&mut meta, &params, 100, 1, ImageOptimal, strategy, false).unwrap().0, 256);
        // Buffers do not conflict with each other.
        assert_eq!(place(&mut meta, &params, 10, 1, Buffer, strategy, false).unwrap().0, 100);
    }

    #[test]
    fn granularity_rejects_conflicting_successor() {
        let mut meta = BlockMetadata::new(1024);
        let params = params(256);
        let strategy = AllocationStrategy::BestFit;
        let (a, _) = place(&mut meta, &params, 100, 1, Buffer, strategy, false).unwrap();
        place(&mut meta, &params, 100, 1, Buffer, strategy, false).unwrap();
        assert_eq!(free(&mut meta, a), Some(100));

        // The hole at 0 shares a page with the buffer at 100, so the image
        // goes to the next page after it.
        let (offset, _) = place(&mut meta, &params, 50, 1, ImageOptimal, strategy, false).unwrap();
        assert_eq!(offset, 256);
    }

    #[test]
    fn debug_margin_surrounds_allocations() {
        let mut meta = BlockMetadata::new(1000);
        let params = PlacementParams {
            debug_margin: 16,
            ..params(1)
        };
        let strategy = AllocationStrategy::BestFit;
        assert_eq!(place(&mut meta, &params, 100, 1, Buffer, strategy, false).unwrap().0, 16);
        assert_eq!(place(&mut meta, &params, 100, 1, Buffer, strategy, false).unwrap().0, 132);
        assert!(meta
            .create_allocation_request(&params, 1000 - 16, 1, Buffer, false, strategy)
            .is_none());
    }

    #[test]
    fn eviction_picks_stale_allocation() {
        let mut meta = BlockMetadata::new(1000);
        let old = params(1);
        let strategy = AllocationStrategy::BestFit;
        let (_, stale) = place(&mut meta, &old, 400, 1, Buffer, strategy, true).unwrap();
        let (_, pinned) = place(&mut meta, &old, 400, 1, Buffer, strategy, false).unwrap();

        let now = PlacementParams {
            current_frame: 10,
            frame_in_use_count: 1,
            ..old
        };
        assert!(meta
            .create_allocation_request(&now, 300, 1, Buffer, false, strategy)
            .is_none());
        let mut request = meta
            .create_allocation_request(&now, 300, 1, Buffer, true, strategy)
            .unwrap();
        assert_eq!(request.offset, 0);
        assert_eq!(request.items_to_evict, 1);
        assert_eq!(request.cost(), 400 + LOST_ALLOCATION_COST);

        assert!(meta.make_requested_allocations_lost(&now, &mut request, 300, Buffer));
        let tracker = Arc::new(AllocationTracker::new(10, false));
        meta.alloc(&request, Buffer, 300, 1, tracker);
        meta.validate().unwrap();

        assert!(stale.is_lost());
        assert!(!pinned.is_lost());
        assert_eq!(meta.allocation_count(), 2);
    }

    #[test]
    fn eviction_fails_when_touched_concurrently() {
        let mut meta = BlockMetadata::new(1000);
        let strategy = AllocationStrategy::BestFit;
        let (_, tracker) = place(&mut meta, &params(1), 1000, 1, Buffer, strategy, true).unwrap();
        let now = PlacementParams {
            current_frame: 10,
            frame_in_use_count: 1,
            ..params(1)
        };
        let mut request = meta
            .create_allocation_request(&now, 500, 1, Buffer, true, strategy)
            .unwrap();
        assert!(tracker.touch(10));
        assert!(!meta.make_requested_allocations_lost(&now, &mut request, 500, Buffer));
        assert!(!tracker.is_lost());
        meta.validate().unwrap();
    }

    #[test]
    fn non_evictable_allocations_are_never_candidates() {
        let mut meta = BlockMetadata::new(1000);
        let strategy = AllocationStrategy::BestFit;
        place(&mut meta, &params(1), 1000, 1, Buffer, strategy, false).unwrap();
        let now = PlacementParams {
            current_frame: 100,
            ..params(1)
        };
        assert!(meta
            .create_allocation_request(&now, 10, 1, Buffer, true, strategy)
            .is_none());
    }

    #[test]
    fn make_allocations_lost_evicts_only_stale() {
        let mut meta = BlockMetadata::new(1000);
        let strategy = AllocationStrategy::BestFit;
        let mut trackers = Vec::new();
        for frame in [0, 5, 9] {
            let p = PlacementParams {
                current_frame: frame,
                ..params(1)
            };
            trackers.push(place(&mut meta, &p, 100, 1, Buffer, strategy, true).unwrap().1);
        }
        place(&mut meta, &params(1), 100, 1, Buffer, strategy, false).unwrap();

        assert_eq!(meta.make_allocations_lost(10, 1), 2);
        meta.validate().unwrap();
        assert!(trackers[0].is_lost());
        assert!(trackers[1].is_lost());
        assert!(!trackers[2].is_lost());
        assert_eq!(meta.allocation_count(), 2);
        assert_eq!(meta.sum_free_size(), 800);
    }

    #[test]
    fn stats_describe_ranges() {
        let meta = holey_block();
        let info = meta.stat_info();
        assert_eq!(info.block_count, 1);
        assert_eq!(info.allocation_count, 3);
        assert_eq!(info.unused_range_count, 3);
        assert_eq!(info.unused_bytes, 700);
        assert_eq!(info.used_bytes, 300);
        assert_eq!(info.unused_range_size_min, 50);
        assert_eq!(info.unused_range_size_max, 450);

        let mut pool = PoolStats::default();
        meta.add_pool_stats(&mut pool);
        assert_eq!(pool.allocation_count, 3);
        assert_eq!(pool.unused_range_size_max, 450);
    }

    #[test]
    fn granularity_conflict_detection() {
        let mut meta = BlockMetadata::new(4096);
        let params = params(256);
        let strategy = AllocationStrategy::BestFit;
        let mut prev = Free;
        assert!(!meta.is_buffer_image_granularity_conflict_possible(256, &mut prev));

        place(&mut meta, &params, 16, 4, Buffer, strategy, false).unwrap();
        place(&mut meta, &params, 16, 4, ImageOptimal, strategy, false).unwrap();
        let mut prev = Free;
        assert!(meta.is_buffer_image_granularity_conflict_possible(256, &mut prev));
        assert_eq!(prev, ImageOptimal);
        assert!(!meta.is_buffer_image_granularity_conflict_possible(1, &mut prev));
    }
}
