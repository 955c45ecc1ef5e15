//! # Segment Selectors
//!
//! Selector values of the GDT the kernel installs at boot.
//!
//! Index | Selector | Meaning
//! ------|----------|--------
//! 0     | 0x00     | Null
//! 1     | 0x08     | Kernel code (64-bit, DPL=0)
//! 2     | 0x10     | Kernel data (DPL=0)
//! 3     | 0x18     | User data (DPL=3) → with RPL=3: **0x1b**
//! 4     | 0x20     | User code (64-bit, DPL=3) → with RPL=3: **0x23**
//! 5/6   | 0x28     | TSS (16-byte system descriptor)

/// Requested privilege level of user selectors.
pub const RPL_USER: u16 = 3;

pub const KERNEL_CS: u16 = 1 << 3;
pub const KERNEL_DS: u16 = 2 << 3;
pub const USER_DS: u16 = (3 << 3) | RPL_USER;
pub const USER_CS: u16 = (4 << 3) | RPL_USER;
pub const TSS_SEL: u16 = 5 << 3;

const _: () = {
    assert!(KERNEL_CS == 0x08);
    assert!(KERNEL_DS == 0x10);
    assert!(USER_DS == 0x1b);
    assert!(USER_CS == 0x23);
    assert!(TSS_SEL == 0x28);
};
