use crate::process::{Pid, Process};
use kernel_info::config::MAX_PROCESSES;

/// Fixed-capacity process table. Lookup is by PID, in every state.
pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
}

impl ProcessTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
        }
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.pid == pid))
    }

    #[must_use]
    pub fn has_room(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Store `process` in a free slot.
    ///
    /// # Errors
    /// Hands `process` back if the table is full.
    pub fn insert(&mut self, process: Process) -> Result<(), Process> {
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(process);
                Ok(())
            }
            None => Err(process),
        }
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        let slot = self.slot_of(pid)?;
        self.slots[slot].take()
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.iter().flatten().find(|p| p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.iter_mut().flatten().find(|p| p.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO of ready processes, linked through [`Process::next`].
///
/// A process is in the queue iff its `queued` flag is set, so it can never be
/// queued twice.
#[derive(Default)]
pub struct ReadyQueue {
    head: Option<Pid>,
    tail: Option<Pid>,
    len: usize,
}

impl ReadyQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `pid`. Returns `false` if it is unknown or already queued.
    pub fn push_back(&mut self, table: &mut ProcessTable, pid: Pid) -> bool {
        let Some(p) = table.get_mut(pid) else {
            return false;
        };
        if p.queued {
            return false;
        }
        p.queued = true;
        p.next = None;
        match self.tail.and_then(|t| table.get_mut(t)) {
            Some(tail) => tail.next = Some(pid),
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
        self.len += 1;
        true
    }

    pub fn pop_front(&mut self, table: &mut ProcessTable) -> Option<Pid> {
        let pid = self.head?;
        let p = table.get_mut(pid)?;
        self.head = p.next.take();
        p.queued = false;
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(pid)
    }

    /// Unlink `pid` from anywhere in the queue. Returns whether it was queued.
    pub fn remove(&mut self, table: &mut ProcessTable, pid: Pid) -> bool {
        if !table.get(pid).is_some_and(|p| p.queued) {
            return false;
        }
        let mut prev: Option<Pid> = None;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            let next = table.get(at).and_then(|p| p.next);
            if at == pid {
                match prev.and_then(|p| table.get_mut(p)) {
                    Some(before) => before.next = next,
                    None => self.head = next,
                }
                if self.tail == Some(pid) {
                    self.tail = prev;
                }
                if let Some(p) = table.get_mut(pid) {
                    p.queued = false;
                    p.next = None;
                }
                self.len -= 1;
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    /// Queued PIDs, front to back.
    pub fn iter<'t>(&self, table: &'t ProcessTable) -> impl Iterator<Item = Pid> + 't {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let pid = cursor?;
            cursor = table.get(pid).and_then(|p| p.next);
            Some(pid)
        })
    }
}
