use crate::{ElfError, ProgramHeader, elf64_view};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_down, align_up};
use kernel_vmem::{AddressSpace, FrameAlloc, MapFlags, PhysMapper, VmemError};
use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("malformed image: {0}")]
    Elf(#[from] ElfError),
    #[error("cannot map segment: {0}")]
    Map(#[from] VmemError),
}

/// Where a loaded image starts executing and where its memory ends.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: VirtualAddress,
    /// Page-aligned end of the highest loaded segment.
    pub end: VirtualAddress,
}

/// Map every `PT_LOAD` segment of `image` into `space` as user read/write
/// memory, copy its file bytes, and zero the rest of its memory size.
///
/// Pages already mapped by an earlier segment are reused.
///
/// # Errors
/// [`LoadError::Elf`] for a malformed image or one with no non-empty
/// `PT_LOAD` segment, [`LoadError::Map`] if a segment
/// cannot be mapped or written. Segments loaded before the failure stay
/// mapped; the caller owns `space` and tears it down.
pub fn load<M: PhysMapper, A: FrameAlloc>(
    image: &[u8],
    space: &AddressSpace<'_, M>,
    alloc: &mut A,
) -> Result<LoadedImage, LoadError> {
    let view = elf64_view(image)?;
    let mut end = 0;
    for ph in view.load_segments() {
        if ph.mem_size == 0 {
            continue;
        }
        let top = load_segment(image, &ph, space, alloc)?;
        end = end.max(top);
    }
    if end == 0 {
        return Err(ElfError::NoLoadSegments.into());
    }
    debug!("loaded image: entry {}, end {end:#x}", view.entry());
    Ok(LoadedImage {
        entry: view.entry(),
        end: VirtualAddress::new(end),
    })
}

fn load_segment<M: PhysMapper, A: FrameAlloc>(
    image: &[u8],
    ph: &ProgramHeader,
    space: &AddressSpace<'_, M>,
    alloc: &mut A,
) -> Result<u64, LoadError> {
    if ph.mem_size < ph.file_size {
        return Err(ElfError::BadSegment(ph.vaddr.as_u64()).into());
    }
    let data = ph.file_bytes(image)?;
    let va = ph.vaddr.as_u64();
    let seg_end = va
        .checked_add(ph.mem_size)
        .ok_or(VmemError::NotUserSpace(ph.vaddr))?;
    let first = align_down(va, PAGE_SIZE);
    let last = align_up(seg_end, PAGE_SIZE);
    trace!(
        "segment {}..{seg_end:#x} ({} file byte(s), flags {:?})",
        ph.vaddr,
        data.len(),
        ph.flags
    );

    // map each run of pages not yet mapped by an earlier segment
    let mut page = first;
    while page < last {
        if space.is_mapped(VirtualAddress::new(page)) {
            page += PAGE_SIZE;
            continue;
        }
        let run = page;
        while page < last && !space.is_mapped(VirtualAddress::new(page)) {
            page += PAGE_SIZE;
        }
        space.map(alloc, VirtualAddress::new(run), None, page - run, MapFlags::user_rw())?;
    }

    space.write_bytes(ph.vaddr, data)?;
    let zero_len = usize::try_from(ph.mem_size - ph.file_size).map_err(|_| ElfError::BadSegment(va))?;
    space.fill(ph.vaddr + ph.file_size, zero_len, 0)?;
    Ok(last)
}
