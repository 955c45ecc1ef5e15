use crate::context::CpuContext;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Process identifier. Assigned in increasing order and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// The root process; orphans are reparented to it.
    pub const INIT: Self = Self(1);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    /// Exited; holds its exit code and address space until reaped.
    Zombie,
    /// Reaped; about to leave the process table.
    Terminated,
}

/// One process-table entry.
///
/// The `first_child`/`next_sibling` links form each parent's child list;
/// `next` links the ready queue. All links are PIDs into the same table.
#[derive(Debug)]
pub struct Process {
    pub(crate) pid: Pid,
    pub(crate) parent: Option<Pid>,
    pub(crate) state: ProcessState,
    pub(crate) context: CpuContext,
    pub(crate) exit_code: i32,
    pub(crate) first_child: Option<Pid>,
    pub(crate) next_sibling: Option<Pid>,
    pub(crate) next: Option<Pid>,
    pub(crate) queued: bool,
    pub(crate) heap_start: VirtualAddress,
    pub(crate) brk: VirtualAddress,
}

impl Process {
    pub(crate) const fn new(
        pid: Pid,
        parent: Option<Pid>,
        context: CpuContext,
        heap_start: VirtualAddress,
    ) -> Self {
        Self {
            pid,
            parent,
            state: ProcessState::Ready,
            context,
            exit_code: 0,
            first_child: None,
            next_sibling: None,
            next: None,
            queued: false,
            heap_start,
            brk: heap_start,
        }
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub const fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    #[must_use]
    pub const fn context(&self) -> &CpuContext {
        &self.context
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    #[must_use]
    pub const fn is_queued(&self) -> bool {
        self.queued
    }

    /// Current program break.
    #[must_use]
    pub const fn brk(&self) -> VirtualAddress {
        self.brk
    }

    #[must_use]
    pub const fn heap_start(&self) -> VirtualAddress {
        self.heap_start
    }
}
