use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::PhysicalFrame;

/// Marks the end of the reservation chain.
const NIL: u64 = u64::MAX;

/// Frames taken from an allocator ahead of a multi-frame operation.
///
/// The reserved frames are chained through their own first eight bytes, so a
/// reservation of any size needs no storage of its own. Either every frame is
/// consumed with [`FrameReservation::take`] or the rest goes back with
/// [`FrameReservation::release`].
pub(crate) struct FrameReservation<'m, M: PhysMapper> {
    mapper: &'m M,
    head: Option<PhysicalFrame>,
    len: u64,
}

impl<'m, M: PhysMapper> FrameReservation<'m, M> {
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            head: None,
            len: 0,
        }
    }

    /// Reserve `count` frames. On exhaustion everything reserved so far is
    /// returned to `alloc` and `false` is returned.
    pub fn fill<A: FrameAlloc>(&mut self, alloc: &mut A, count: u64) -> bool {
        for _ in 0..count {
            let Some(frame) = alloc.allocate_frame() else {
                self.release(alloc);
                return false;
            };
            self.push(frame);
        }
        true
    }

    fn push(&mut self, frame: PhysicalFrame) {
        let link = unsafe { self.mapper.phys_to_mut::<u64>(frame.base()) };
        *link = self.head.map_or(NIL, PhysicalFrame::index);
        self.head = Some(frame);
        self.len += 1;
    }

    /// Pop one reserved frame. Its contents are unspecified.
    pub fn take(&mut self) -> Option<PhysicalFrame> {
        let frame = self.head?;
        let link = *unsafe { self.mapper.phys_to_mut::<u64>(frame.base()) };
        self.head = (link != NIL).then(|| PhysicalFrame::from_index(link));
        self.len -= 1;
        Some(frame)
    }

    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Give every remaining frame back to `alloc`.
    pub fn release<A: FrameAlloc>(&mut self, alloc: &mut A) {
        while let Some(frame) = self.take() {
            alloc.free_frame(frame);
        }
    }
}
