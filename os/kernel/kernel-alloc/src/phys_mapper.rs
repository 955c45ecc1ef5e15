use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the higher-half direct map: physical address `pa` is
/// visible at `HHDM_BASE + pa`.
///
/// Only valid once the boot page tables map all of RAM at `HHDM_BASE`.
#[derive(Copy, Clone, Debug, Default)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (HHDM_BASE + pa.as_u64()) as *mut T;
        // SAFETY: the caller guarantees `pa` is RAM covered by the HHDM.
        unsafe { &mut *va }
    }
}
