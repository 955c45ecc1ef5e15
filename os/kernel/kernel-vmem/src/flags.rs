use crate::PageEntryBits;
use kernel_memory_addresses::PhysicalFrame;
use utils_accessors_derive::Accessors;

/// Permission and cacheability bits requested for a leaf mapping.
///
/// `present` is implied. Hardware-managed bits (accessed, dirty) are carried
/// so a mapping can be reproduced exactly, e.g. when an address space is
/// duplicated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Accessors)]
#[allow(clippy::struct_excessive_bools)]
pub struct MapFlags {
    writable: bool,
    user: bool,
    write_through: bool,
    cache_disable: bool,
    accessed: bool,
    dirty: bool,
    global: bool,
    no_execute: bool,
}

impl MapFlags {
    /// Read/write memory accessible from ring 3.
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_writable(true).with_user(true)
    }

    #[must_use]
    pub const fn new() -> Self {
        Self {
            writable: false,
            user: false,
            write_through: false,
            cache_disable: false,
            accessed: false,
            dirty: false,
            global: false,
            no_execute: false,
        }
    }

    /// Encode as a present leaf entry pointing at `frame`.
    #[must_use]
    pub const fn leaf_entry(self, frame: PhysicalFrame) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(self.writable)
            .with_user_access(self.user)
            .with_write_through(self.write_through)
            .with_cache_disabled(self.cache_disable)
            .with_accessed(self.accessed)
            .with_dirty(self.dirty)
            .with_global_translation(self.global)
            .with_no_execute(self.no_execute)
            .with_frame(frame)
    }

    /// The flags of an existing leaf entry.
    #[must_use]
    pub const fn from_entry(entry: PageEntryBits) -> Self {
        Self {
            writable: entry.writable(),
            user: entry.user_access(),
            write_through: entry.write_through(),
            cache_disable: entry.cache_disabled(),
            accessed: entry.accessed(),
            dirty: entry.dirty(),
            global: entry.global_translation(),
            no_execute: entry.no_execute(),
        }
    }
}
