use crate::{ContiguousFrameAlloc, FrameAllocError};
use kernel_info::config::BUDDY_MAX_ORDER;
use kernel_memory_addresses::PhysicalFrame;
use kernel_vmem::FrameAlloc;
use log::{debug, trace};

const NIL: u32 = u32::MAX;

/// Per-frame bookkeeping slot of a [`BuddyFrameAlloc`].
///
/// Only the first frame of a block carries meaning: its free-list links while
/// the block is free, and its order in both states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BuddyNode {
    prev: u32,
    next: u32,
    state: BlockState,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BlockState {
    /// Not the head of any block, or not managed.
    None,
    Free(u8),
    Allocated(u8),
}

impl BuddyNode {
    pub const EMPTY: Self = Self {
        prev: NIL,
        next: NIL,
        state: BlockState::None,
    };
}

/// Power-of-two block allocator over a run of frames.
///
/// Block `r` of order `o` (relative to `base`) has its buddy at `r ^ (1 << o)`.
/// The order of an allocated block is kept in the node table, so a freed
/// frame needs no header.
pub struct BuddyFrameAlloc<'a> {
    base: u64,
    nodes: &'a mut [BuddyNode],
    heads: [u32; BUDDY_MAX_ORDER + 1],
    free: u64,
}

impl<'a> BuddyFrameAlloc<'a> {
    /// Manage `nodes.len()` frames starting at `base`. Nothing is free until
    /// [`BuddyFrameAlloc::add_region`] is called.
    pub fn new(nodes: &'a mut [BuddyNode], base: PhysicalFrame) -> Self {
        nodes.fill(BuddyNode::EMPTY);
        Self {
            base: base.index(),
            nodes,
            heads: [NIL; BUDDY_MAX_ORDER + 1],
            free: 0,
        }
    }

    /// Smallest order whose block holds `count` frames.
    #[must_use]
    pub const fn order_for(count: u64) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let order = count.next_power_of_two().trailing_zeros() as usize;
        if order > BUDDY_MAX_ORDER { None } else { Some(order) }
    }

    /// Donate `count` frames starting at `first`, as the largest aligned
    /// blocks that fit. Frames outside the managed range, and frames already
    /// in a free or allocated block, are skipped.
    pub fn add_region(&mut self, first: PhysicalFrame, count: u64) {
        let len = self.nodes.len() as u64;
        let mut start = first.index().saturating_sub(self.base).min(len);
        let end = first
            .index()
            .saturating_add(count)
            .saturating_sub(self.base)
            .min(len);
        let (mut blocks, mut added) = (0, 0u64);
        while start < end {
            if self.containing(to_u32(start)).is_some() {
                start += 1;
                continue;
            }
            let mut order = BUDDY_MAX_ORDER;
            while order > 0
                && (start % (1 << order) != 0
                    || start + (1 << order) > end
                    || !self.unowned(start, 1 << order))
            {
                order -= 1;
            }
            self.release(to_u32(start), order);
            start += 1 << order;
            added += 1 << order;
            blocks += 1;
        }
        debug!("buddy: added {added} of {count} frame(s) at {first:?} as {blocks} block(s)");
    }

    /// Allocate a block of `2^order` frames.
    pub fn allocate(&mut self, order: usize) -> Option<PhysicalFrame> {
        if order > BUDDY_MAX_ORDER {
            return None;
        }
        let mut found = (order..=BUDDY_MAX_ORDER).find(|&o| self.heads[o] != NIL)?;
        let block = self.heads[found];
        self.unlink(block, found);
        while found > order {
            found -= 1;
            self.push(block + (1 << found), found);
        }
        self.nodes[block as usize].state = BlockState::Allocated(to_u8(order));
        self.free -= 1 << order;
        trace!("buddy: allocated order {order} at {:#x}", self.base + u64::from(block));
        Some(PhysicalFrame::from_index(self.base + u64::from(block)))
    }

    /// Allocate at least `count` contiguous frames (rounded up to a power of
    /// two).
    pub fn allocate_pages(&mut self, count: u64) -> Option<PhysicalFrame> {
        self.allocate(Self::order_for(count)?)
    }

    /// Return the block starting at `frame`, merging with free buddies.
    ///
    /// Returns the order of the freed block, or `None` if `frame` is not the
    /// head of an allocated block (double free, foreign frame).
    pub fn free(&mut self, frame: PhysicalFrame) -> Option<usize> {
        let block = self.relative(frame)?;
        let BlockState::Allocated(order) = self.nodes[block as usize].state else {
            debug!("buddy: ignoring free of {frame:?}, not an allocated block");
            return None;
        };
        let order = usize::from(order);
        self.nodes[block as usize].state = BlockState::None;
        self.release(block, order);
        trace!("buddy: freed order {order} at {frame:?}");
        Some(order)
    }

    /// Insert a free block, merging upward while its buddy is free at the
    /// same order.
    fn release(&mut self, mut block: u32, mut order: usize) {
        self.free += 1 << order;
        while order < BUDDY_MAX_ORDER {
            let buddy = block ^ (1 << order);
            let Some(node) = self.nodes.get(buddy as usize) else {
                break;
            };
            if node.state != BlockState::Free(to_u8(order)) {
                break;
            }
            self.unlink(buddy, order);
            self.nodes[buddy as usize].state = BlockState::None;
            block = block.min(buddy);
            order += 1;
        }
        self.push(block, order);
    }

    fn push(&mut self, block: u32, order: usize) {
        let head = self.heads[order];
        if head != NIL {
            self.nodes[head as usize].prev = block;
        }
        self.nodes[block as usize] = BuddyNode {
            prev: NIL,
            next: head,
            state: BlockState::Free(to_u8(order)),
        };
        self.heads[order] = block;
    }

    fn unlink(&mut self, block: u32, order: usize) {
        let BuddyNode { prev, next, .. } = self.nodes[block as usize];
        if prev == NIL {
            self.heads[order] = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        }
        self.nodes[block as usize] = BuddyNode::EMPTY;
    }

    /// The head and state of the block covering relative frame `r`, if any.
    fn containing(&self, r: u32) -> Option<(u32, BlockState)> {
        (0..=BUDDY_MAX_ORDER).find_map(|order| {
            let head = r & !((1u32 << order) - 1);
            match self.nodes.get(head as usize)?.state {
                state @ (BlockState::Free(o) | BlockState::Allocated(o)) if usize::from(o) == order => {
                    Some((head, state))
                }
                _ => None,
            }
        })
    }

    fn unowned(&self, start: u64, len: u64) -> bool {
        (start..start + len).all(|r| self.containing(to_u32(r)).is_none())
    }

    fn relative(&self, frame: PhysicalFrame) -> Option<u32> {
        let offset = frame.index().checked_sub(self.base)?;
        (offset < self.nodes.len() as u64).then(|| to_u32(offset))
    }

    /// Number of free blocks of exactly `order`.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        let mut count = 0;
        let mut cursor = self.heads.get(order).copied().unwrap_or(NIL);
        while cursor != NIL {
            count += 1;
            cursor = self.nodes[cursor as usize].next;
        }
        count
    }

    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free
    }

    /// Whether `frame` is unavailable: inside an allocated block, never
    /// donated, or outside the managed range.
    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalFrame) -> bool {
        let Some(r) = self.relative(frame) else {
            return true;
        };
        !matches!(self.containing(r), Some((_, BlockState::Free(_))))
    }

    /// Order of the allocated block starting at `frame`.
    #[must_use]
    pub fn allocated_order(&self, frame: PhysicalFrame) -> Option<usize> {
        match self.nodes[self.relative(frame)? as usize].state {
            BlockState::Allocated(order) => Some(usize::from(order)),
            _ => None,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn to_u32(v: u64) -> u32 {
    v as u32
}

#[allow(clippy::cast_possible_truncation)]
const fn to_u8(v: usize) -> u8 {
    v as u8
}

impl FrameAlloc for BuddyFrameAlloc<'_> {
    fn allocate_frame(&mut self) -> Option<PhysicalFrame> {
        self.allocate(0)
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        let _ = self.free(frame);
    }
}

impl ContiguousFrameAlloc for BuddyFrameAlloc<'_> {
    fn allocate_contiguous(&mut self, count: u64) -> Option<PhysicalFrame> {
        self.allocate_pages(count)
    }

    /// `count` must round up to the order the block was allocated with.
    fn free_contiguous(&mut self, first: PhysicalFrame, count: u64) -> Result<(), FrameAllocError> {
        let order = self
            .allocated_order(first)
            .ok_or(FrameAllocError::OutOfRange { first, count })?;
        if Self::order_for(count) != Some(order) {
            return Err(FrameAllocError::InvalidCount(count));
        }
        self.free(first);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_rounding() {
        assert_eq!(BuddyFrameAlloc::order_for(0), None);
        assert_eq!(BuddyFrameAlloc::order_for(1), Some(0));
        assert_eq!(BuddyFrameAlloc::order_for(3), Some(2));
        assert_eq!(BuddyFrameAlloc::order_for(1 << BUDDY_MAX_ORDER), Some(BUDDY_MAX_ORDER));
        assert_eq!(BuddyFrameAlloc::order_for((1 << BUDDY_MAX_ORDER) + 1), None);
    }

    #[test]
    fn unaligned_region_splits_into_aligned_blocks() {
        let mut nodes = [BuddyNode::EMPTY; 16];
        let mut buddy = BuddyFrameAlloc::new(&mut nodes, PhysicalFrame::from_index(0x100));
        buddy.add_region(PhysicalFrame::from_index(0x101), 7);

        // 1 + 2 + 4
        assert_eq!(buddy.free_frames(), 7);
        assert_eq!(buddy.free_blocks(0), 1);
        assert_eq!(buddy.free_blocks(1), 1);
        assert_eq!(buddy.free_blocks(2), 1);
    }

    #[test]
    fn rejects_foreign_and_double_frees() {
        let mut nodes = [BuddyNode::EMPTY; 4];
        let mut buddy = BuddyFrameAlloc::new(&mut nodes, PhysicalFrame::from_index(8));
        buddy.add_region(PhysicalFrame::from_index(8), 4);
        let f = buddy.allocate(0).unwrap();

        assert_eq!(buddy.free(PhysicalFrame::from_index(2)), None);
        assert_eq!(buddy.free(f), Some(0));
        assert_eq!(buddy.free(f), None);
        assert_eq!(buddy.free_frames(), 4);
    }

    #[test]
    fn is_allocated_covers_whole_blocks() {
        let mut nodes = [BuddyNode::EMPTY; 16];
        let base = 0x200;
        let mut buddy = BuddyFrameAlloc::new(&mut nodes, PhysicalFrame::from_index(base));
        buddy.add_region(PhysicalFrame::from_index(base), 8);

        let block = buddy.allocate_pages(4).unwrap();
        let head = block.index();
        assert!(buddy.is_allocated(block));
        assert!((1..4).all(|i| buddy.is_allocated(PhysicalFrame::from_index(head + i))));
        // the other half of the original 8-frame block is free
        let other = if head == base { base + 4 } else { base };
        assert!((0..4).all(|i| !buddy.is_allocated(PhysicalFrame::from_index(other + i))));
        // never donated, and outside the managed range
        assert!(buddy.is_allocated(PhysicalFrame::from_index(base + 8)));
        assert!(buddy.is_allocated(PhysicalFrame::from_index(base + 16)));

        buddy.free(block);
        assert!((0..4).all(|i| !buddy.is_allocated(PhysicalFrame::from_index(head + i))));
    }

    #[test]
    fn donating_twice_changes_nothing() {
        let mut nodes = [BuddyNode::EMPTY; 16];
        let mut buddy = BuddyFrameAlloc::new(&mut nodes, PhysicalFrame::from_index(0));
        buddy.add_region(PhysicalFrame::from_index(0), 8);
        let held = buddy.allocate(0).unwrap();

        buddy.add_region(PhysicalFrame::from_index(0), 8);
        buddy.add_region(PhysicalFrame::from_index(2), 4);
        assert_eq!(buddy.free_frames(), 7);
        assert!(buddy.is_allocated(held));

        // overlapping donation only adds the new frames
        buddy.add_region(PhysicalFrame::from_index(4), 8);
        assert_eq!(buddy.free_frames(), 11);

        let mut got = 0;
        while buddy.allocate(0).is_some() {
            got += 1;
        }
        assert_eq!(got, 11);
    }
}
