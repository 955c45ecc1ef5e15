use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalFrame;

/// A single 64-bit x86-64 page-table entry, valid at every level.
///
/// | Bits  | Name            | Meaning                                   |
/// |-------|-----------------|-------------------------------------------|
/// | 0     | `P`             | present                                   |
/// | 1     | `RW`            | writable                                  |
/// | 2     | `US`            | user-mode accessible                      |
/// | 3     | `PWT`           | write-through caching                     |
/// | 4     | `PCD`           | cache disable                             |
/// | 5     | `A`             | accessed (set by the CPU)                 |
/// | 6     | `D`             | dirty (leaf only, set by the CPU)         |
/// | 7     | `PS`            | huge page (L3/L2 only; PAT at L1)         |
/// | 8     | `G`             | global (leaf only)                        |
/// | 9–11  | OS avail low    | ignored by hardware                       |
/// | 12–51 | frame           | physical frame number                     |
/// | 52–58 | OS avail high   | ignored by hardware                       |
/// | 59–62 | `PKU`           | protection key                            |
/// | 63    | `NX`            | execute disable                           |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,
    #[bits(3)]
    pub os_available_low: u8,
    #[bits(40)]
    frame_number: u64,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Entry linking to a next-level table.
    ///
    /// Intermediate entries are writable and user-accessible so the leaf
    /// alone decides the effective permissions.
    #[must_use]
    pub const fn next_table(table: PhysicalFrame) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame(table)
    }

    /// The physical frame this entry points to (next table or mapped page).
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::from_index(self.frame_number())
    }

    #[must_use]
    pub const fn with_frame(self, frame: PhysicalFrame) -> Self {
        self.with_frame_number(frame.index())
    }

    /// All bits clear.
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }
}
