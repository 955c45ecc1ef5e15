use crate::table::{Level, TableIndex};
use crate::{PageEntryBits, PhysMapper};
use kernel_info::memory::{KERNEL_HALF_FIRST_INDEX, PAGE_TABLE_ENTRIES};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

/// What [`UserWalk`] reports, in depth-first order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WalkEvent {
    /// A present leaf (4 KiB PTE, or a huge page at PDPT/PD level).
    Leaf {
        va: VirtualAddress,
        entry: PageEntryBits,
        level: Level,
    },
    /// Every entry of `table` has been visited. Emitted after the table's
    /// children, and last of all for the root.
    TableDone { table: PhysicalFrame, level: Level },
}

#[derive(Copy, Clone)]
struct Cursor {
    table: PhysicalFrame,
    level: Level,
    base: u64,
    next: usize,
    end: usize,
}

/// Iterative post-order walk over the user half of a page-table tree.
///
/// The walk keeps one cursor per level on a fixed stack, so depth is bounded
/// by the paging structure. It never looks at PML4 slots `256..512`.
pub(crate) struct UserWalk<'m, M: PhysMapper> {
    mapper: &'m M,
    stack: [Option<Cursor>; 4],
    depth: usize,
}

impl<'m, M: PhysMapper> UserWalk<'m, M> {
    pub fn new(mapper: &'m M, root: PhysicalFrame) -> Self {
        let mut stack = [None; 4];
        stack[0] = Some(Cursor {
            table: root,
            level: Level::Pml4,
            base: 0,
            next: 0,
            end: KERNEL_HALF_FIRST_INDEX,
        });
        Self {
            mapper,
            stack,
            depth: 1,
        }
    }
}

impl<M: PhysMapper> Iterator for UserWalk<'_, M> {
    type Item = WalkEvent;

    fn next(&mut self) -> Option<WalkEvent> {
        loop {
            let top = self.stack.get_mut(self.depth.checked_sub(1)?)?.as_mut()?;

            if top.next == top.end {
                let done = *top;
                self.stack[self.depth - 1] = None;
                self.depth -= 1;
                return Some(WalkEvent::TableDone {
                    table: done.table,
                    level: done.level,
                });
            }

            let index = TableIndex::new(top.next)?;
            top.next += 1;

            let table = unsafe { self.mapper.table_mut(top.table) };
            let entry = table[index];
            if !entry.present() {
                continue;
            }

            let va = top.base + ((index.as_usize() as u64) << top.level.shift());
            match top.level.next() {
                Some(next) if !entry.large_page() => {
                    self.stack[self.depth] = Some(Cursor {
                        table: entry.frame(),
                        level: next,
                        base: va,
                        next: 0,
                        end: PAGE_TABLE_ENTRIES,
                    });
                    self.depth += 1;
                }
                _ => {
                    return Some(WalkEvent::Leaf {
                        va: VirtualAddress::new(va),
                        entry,
                        level: top.level,
                    });
                }
            }
        }
    }
}
