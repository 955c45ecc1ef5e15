use kernel_memory_addresses::PhysicalFrame;
use kernel_sync::{SpinLock, SpinLockIrqGuard};
use kernel_vmem::FrameAlloc;

/// A frame allocator behind a spin lock taken with interrupts masked.
///
/// `&LockedFrameAlloc<A>` is itself a [`FrameAlloc`]: each call takes the
/// lock for exactly one allocator operation, so the lock is never held
/// across a page-table walk or a nested allocation.
pub struct LockedFrameAlloc<A> {
    inner: SpinLock<A>,
}

impl<A> LockedFrameAlloc<A> {
    pub const fn new(alloc: A) -> Self {
        Self {
            inner: SpinLock::new(alloc),
        }
    }

    /// Lock the allocator for a compound operation.
    pub fn lock(&self) -> SpinLockIrqGuard<'_, A> {
        self.inner.lock_irq()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        self.inner.with_lock_irq(f)
    }
}

impl<A: FrameAlloc> FrameAlloc for &LockedFrameAlloc<A> {
    fn allocate_frame(&mut self) -> Option<PhysicalFrame> {
        self.inner.lock_irq().allocate_frame()
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        self.inner.lock_irq().free_frame(frame);
    }
}
