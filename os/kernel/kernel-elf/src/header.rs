use crate::ElfError;
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

pub(crate) const EHDR_SIZE: usize = 64;
pub(crate) const PHDR_SIZE: usize = 56;
pub(crate) const ET_EXEC: u16 = 2;
pub(crate) const EM_X86_64: u16 = 62;
pub(crate) const PT_LOAD: u32 = 1;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u32 = 1;

/// `p_flags` of a program header (SVr4 layout).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SegmentFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// One decoded program header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: SegmentFlags,
    pub file_offset: u64,
    pub vaddr: VirtualAddress,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

impl ProgramHeader {
    #[must_use]
    pub const fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    /// The bytes of the image backing this segment.
    ///
    /// # Errors
    /// [`ElfError::OutOfBounds`] if the range leaves the image.
    pub fn file_bytes<'a>(&self, image: &'a [u8]) -> Result<&'a [u8], ElfError> {
        let start = usize::try_from(self.file_offset).map_err(|_| ElfError::OutOfBounds)?;
        let len = usize::try_from(self.file_size).map_err(|_| ElfError::OutOfBounds)?;
        let end = start.checked_add(len).ok_or(ElfError::OutOfBounds)?;
        image.get(start..end).ok_or(ElfError::OutOfBounds)
    }
}

#[inline]
fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

#[inline]
fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[inline]
fn le64(b: &[u8], at: usize) -> u64 {
    let mut v = [0; 8];
    v.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(v)
}

/// A validated ELF64 executable, borrowed from the image bytes.
#[derive(Copy, Clone, Debug)]
pub struct ElfView<'a> {
    bytes: &'a [u8],
    entry: VirtualAddress,
    phoff: usize,
    phnum: usize,
}

/// Validate `bytes` as a little-endian x86-64 `ET_EXEC` image.
///
/// # Errors
/// The first header check that fails, as an [`ElfError`].
pub fn elf64_view(bytes: &[u8]) -> Result<ElfView<'_>, ElfError> {
    if bytes.len() < EHDR_SIZE {
        return Err(ElfError::TooShort);
    }
    if &bytes[0..4] != b"\x7FELF" {
        return Err(ElfError::BadMagic);
    }
    if bytes[4] != ELFCLASS64 {
        return Err(ElfError::BadClass);
    }
    if bytes[5] != ELFDATA2LSB {
        return Err(ElfError::BadEndianness);
    }

    let e_type = le16(bytes, 16);
    let e_machine = le16(bytes, 18);
    if le32(bytes, 20) != EV_CURRENT {
        return Err(ElfError::BadVersion);
    }
    if e_type != ET_EXEC {
        return Err(ElfError::BadType(e_type));
    }
    if e_machine != EM_X86_64 {
        return Err(ElfError::BadMachine(e_machine));
    }

    let phentsize = le16(bytes, 54);
    let phnum = usize::from(le16(bytes, 56));
    if phnum > 0 && usize::from(phentsize) != PHDR_SIZE {
        return Err(ElfError::BadPhEntSize(phentsize));
    }
    let phoff = usize::try_from(le64(bytes, 32)).map_err(|_| ElfError::OutOfBounds)?;
    let table_end = phnum
        .checked_mul(PHDR_SIZE)
        .and_then(|len| len.checked_add(phoff))
        .ok_or(ElfError::OutOfBounds)?;
    if table_end > bytes.len() {
        return Err(ElfError::OutOfBounds);
    }

    Ok(ElfView {
        bytes,
        entry: VirtualAddress::new(le64(bytes, 24)),
        phoff,
        phnum,
    })
}

impl<'a> ElfView<'a> {
    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.entry
    }

    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// All program headers, in table order.
    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        let bytes = self.bytes;
        let phoff = self.phoff;
        (0..self.phnum).map(move |i| {
            let at = phoff + i * PHDR_SIZE;
            ProgramHeader {
                kind: le32(bytes, at),
                flags: SegmentFlags::from_bits(le32(bytes, at + 4)),
                file_offset: le64(bytes, at + 8),
                vaddr: VirtualAddress::new(le64(bytes, at + 16)),
                file_size: le64(bytes, at + 32),
                mem_size: le64(bytes, at + 40),
                align: le64(bytes, at + 48).max(1),
            }
        })
    }

    /// Only the `PT_LOAD` headers.
    pub fn load_segments(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        self.program_headers().filter(ProgramHeader::is_load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ElfBuilder;

    fn image() -> Vec<u8> {
        ElfBuilder::new(0x40_1000)
            .segment(0x40_1000, &[0x90; 16], 16, SegmentFlags::new().with_read(true).with_execute(true))
            .segment(0x40_3000, &[], 0x100, SegmentFlags::new().with_read(true).with_write(true))
            .build()
    }

    #[test]
    fn parses_headers() {
        let bytes = image();
        let view = elf64_view(&bytes).unwrap();
        assert_eq!(view.entry(), VirtualAddress::new(0x40_1000));

        let segments: Vec<_> = view.load_segments().collect();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].file_size, 16);
        assert!(segments[0].flags.execute());
        assert_eq!(segments[0].file_bytes(&bytes).unwrap(), &[0x90; 16]);
        assert_eq!(segments[1].mem_size, 0x100);
        assert!(segments[1].flags.write());
    }

    #[test]
    fn rejects_malformed_headers() {
        let good = image();
        let patched = |at: usize, v: u8| {
            let mut b = good.clone();
            b[at] = v;
            elf64_view(&b).err()
        };

        assert_eq!(elf64_view(&good[..63]).err(), Some(ElfError::TooShort));
        assert_eq!(patched(1, b'e'), Some(ElfError::BadMagic));
        assert_eq!(patched(4, 1), Some(ElfError::BadClass));
        assert_eq!(patched(5, 2), Some(ElfError::BadEndianness));
        assert_eq!(patched(20, 0), Some(ElfError::BadVersion));
        assert_eq!(patched(16, 3), Some(ElfError::BadType(3)));
        assert_eq!(patched(18, 40), Some(ElfError::BadMachine(40)));
        assert_eq!(patched(54, 64), Some(ElfError::BadPhEntSize(64)));
        assert_eq!(patched(56, 200), Some(ElfError::OutOfBounds));
    }

    #[test]
    fn segment_file_range_is_bounds_checked() {
        let bytes = image();
        let view = elf64_view(&bytes).unwrap();
        let mut ph = view.load_segments().next().unwrap();
        ph.file_offset = bytes.len() as u64 - 4;
        assert_eq!(ph.file_bytes(&bytes), Err(ElfError::OutOfBounds));
    }
}
