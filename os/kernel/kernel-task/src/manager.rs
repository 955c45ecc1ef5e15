use crate::ProcessError;
use crate::context::{CpuContext, TrapFrame};
use crate::process::{Pid, Process, ProcessState};
use crate::table::{ProcessTable, ReadyQueue};
use kernel_elf::LoadedImage;
use kernel_info::memory::{USER_STACK_BASE, USER_STACK_PAGES, USER_STACK_TOP};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame, VirtualAddress, align_up};
use kernel_registers::rflags::Rflags;
use kernel_vmem::{AddressSpace, FrameAlloc, MapFlags, PhysMapper, VmemError};
use log::{debug, info, trace, warn};

/// Highest signal number `kill` accepts.
const MAX_SIGNAL: u64 = 64;

/// Owner of the process table, the ready queue and PID assignment.
///
/// Every operation either completes or leaves no trace: a process becomes
/// reachable (table, parent's child list, ready queue) only after all of its
/// memory is in place.
pub struct ProcessManager<'m, M: PhysMapper> {
    mapper: &'m M,
    kernel_root: PhysicalFrame,
    table: ProcessTable,
    ready: ReadyQueue,
    next_pid: u32,
    current: Option<Pid>,
}

impl<'m, M: PhysMapper> ProcessManager<'m, M> {
    /// `kernel_root` is the page table whose upper half every process shares.
    #[must_use]
    pub const fn new(mapper: &'m M, kernel_root: PhysicalFrame) -> Self {
        Self {
            mapper,
            kernel_root,
            table: ProcessTable::new(),
            ready: ReadyQueue::new(),
            next_pid: Pid::INIT.as_u32(),
            current: None,
        }
    }

    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalFrame {
        self.kernel_root
    }

    /// The process the CPU is executing, if any.
    #[must_use]
    pub const fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Look up a process in any state.
    #[must_use]
    pub fn find_by_pid(&self, pid: Pid) -> Option<&Process> {
        self.table.get(pid)
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.table.len()
    }

    pub fn ready_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.ready.iter(&self.table)
    }

    /// Children of `pid`, newest first.
    pub fn children(&self, pid: Pid) -> impl Iterator<Item = Pid> + '_ {
        let mut cursor = self.table.get(pid).and_then(|p| p.first_child);
        core::iter::from_fn(move || {
            let child = cursor?;
            cursor = self.table.get(child).and_then(|c| c.next_sibling);
            Some(child)
        })
    }

    const fn space(&self, root: PhysicalFrame) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, root)
    }

    /// The address space of `pid`.
    #[must_use]
    pub fn address_space(&self, pid: Pid) -> Option<AddressSpace<'m, M>> {
        self.table.get(pid).map(|p| self.space(p.context.root))
    }

    /// Create a process from an ELF image and queue it as Ready.
    ///
    /// The image is loaded into a fresh address space, a
    /// `USER_STACK_PAGES`-page stack is mapped below `USER_STACK_TOP`, and
    /// the process starts at the image entry with `rsp` at the stack top.
    ///
    /// # Errors
    /// - [`ProcessError::TableFull`] if no slot is free.
    /// - [`ProcessError::NoSuchProcess`] if `parent` does not exist.
    /// - [`ProcessError::Load`] / [`ProcessError::Memory`] if the image or
    ///   stack cannot be mapped. The new address space is destroyed first.
    pub fn create<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        image: &[u8],
        parent: Option<Pid>,
    ) -> Result<Pid, ProcessError> {
        if !self.table.has_room() {
            return Err(ProcessError::TableFull);
        }
        if let Some(parent) = parent
            && self.table.get(parent).is_none()
        {
            return Err(ProcessError::NoSuchProcess(parent));
        }

        let space = AddressSpace::create(self.mapper, alloc, self.kernel_root)?;
        let loaded = match populate(&space, alloc, image) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("process creation failed: {e}");
                space.destroy(alloc);
                return Err(e);
            }
        };

        let pid = self.allocate_pid();
        let context = CpuContext {
            frame: TrapFrame::user(loaded.entry, VirtualAddress::new(USER_STACK_TOP)),
            root: space.root(),
        };
        self.commit(alloc, Process::new(pid, parent, context, loaded.end))?;
        info!("created process {pid} (entry {}, parent {parent:?})", loaded.entry);
        Ok(pid)
    }

    /// Duplicate `parent` with a deep copy of its address space.
    ///
    /// `frame` is the parent's live register state at the trap. The child
    /// resumes from the same state with `rax = 0`.
    ///
    /// # Errors
    /// [`ProcessError::TableFull`], [`ProcessError::NoSuchProcess`], or
    /// [`ProcessError::Memory`] if the copy runs out of frames. A partial
    /// copy is torn down before returning.
    pub fn fork<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        parent: Pid,
        frame: &TrapFrame,
    ) -> Result<Pid, ProcessError> {
        if !self.table.has_room() {
            return Err(ProcessError::TableFull);
        }
        let p = self.table.get(parent).ok_or(ProcessError::NoSuchProcess(parent))?;
        let (root, heap_start, brk) = (p.context.root, p.heap_start, p.brk);

        let child_space = self.space(root).duplicate(alloc)?;

        let mut child_frame = *frame;
        child_frame.rax = 0;
        child_frame.rflags = Rflags::from_bits(frame.rflags).sanitized_for_user().into_bits();

        let pid = self.allocate_pid();
        let context = CpuContext {
            frame: child_frame,
            root: child_space.root(),
        };
        let mut child = Process::new(pid, Some(parent), context, heap_start);
        child.brk = brk;
        self.commit(alloc, child)?;
        info!("forked process {parent} into {pid}");
        Ok(pid)
    }

    const fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Make a fully built process reachable: table, parent, ready queue.
    fn commit<A: FrameAlloc>(&mut self, alloc: &mut A, process: Process) -> Result<(), ProcessError> {
        let (pid, parent) = (process.pid, process.parent);
        if let Err(process) = self.table.insert(process) {
            self.space(process.context.root).destroy(alloc);
            return Err(ProcessError::TableFull);
        }
        if let Some(parent) = parent {
            self.link_child(parent, pid);
        }
        self.enqueue(pid);
        Ok(())
    }

    fn link_child(&mut self, parent: Pid, child: Pid) {
        let Some(p) = self.table.get_mut(parent) else {
            return;
        };
        let older = p.first_child.replace(child);
        if let Some(c) = self.table.get_mut(child) {
            c.parent = Some(parent);
            c.next_sibling = older;
        }
    }

    fn unlink_child(&mut self, parent: Pid, child: Pid) {
        let after = self.table.get(child).and_then(|c| c.next_sibling);
        let first = self.table.get(parent).and_then(|p| p.first_child);
        if first == Some(child) {
            if let Some(p) = self.table.get_mut(parent) {
                p.first_child = after;
            }
        } else {
            let mut cursor = first;
            while let Some(at) = cursor {
                let sibling = self.table.get(at).and_then(|s| s.next_sibling);
                if sibling == Some(child) {
                    if let Some(s) = self.table.get_mut(at) {
                        s.next_sibling = after;
                    }
                    break;
                }
                cursor = sibling;
            }
        }
        if let Some(c) = self.table.get_mut(child) {
            c.next_sibling = None;
            c.parent = None;
        }
    }

    /// Hand every child of `pid` to PID 1, or orphan them if `pid` is PID 1.
    fn reparent_children(&mut self, pid: Pid) {
        let adopter = (pid != Pid::INIT && self.table.get(Pid::INIT).is_some()).then_some(Pid::INIT);
        while let Some(child) = self.table.get(pid).and_then(|p| p.first_child) {
            self.unlink_child(pid, child);
            if let Some(init) = adopter {
                self.link_child(init, child);
            }
            debug!("reparented {child} from {pid} to {adopter:?}");
        }
    }

    /// Terminate `pid`: it becomes a Zombie holding `code`, leaves the ready
    /// queue, and its children move to PID 1. Its memory stays until a
    /// parent reaps it.
    ///
    /// The scheduler must be run afterwards if `pid` was current.
    ///
    /// # Errors
    /// [`ProcessError::NoSuchProcess`] for an unknown PID.
    pub fn exit(&mut self, pid: Pid, code: i32) -> Result<(), ProcessError> {
        let p = self.table.get_mut(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        if matches!(p.state, ProcessState::Zombie | ProcessState::Terminated) {
            return Ok(());
        }
        p.state = ProcessState::Zombie;
        p.exit_code = code;
        self.ready.remove(&mut self.table, pid);
        if self.current == Some(pid) {
            self.current = None;
        }
        self.reparent_children(pid);
        if pid == Pid::INIT {
            warn!("init exited with code {code}");
        } else {
            info!("process {pid} exited with code {code}");
        }
        Ok(())
    }

    /// Deliver a terminating signal: the target exits with `128 + signal`.
    /// Signal 0 only checks that `target` exists.
    ///
    /// Returns `true` if `target` was the current process, in which case the
    /// caller must reschedule.
    ///
    /// # Errors
    /// - [`ProcessError::InvalidSignal`] for signals above 64.
    /// - [`ProcessError::Protected`] for PID 1.
    /// - [`ProcessError::NoSuchProcess`] for an unknown PID.
    pub fn kill(&mut self, target: Pid, signal: u64) -> Result<bool, ProcessError> {
        if signal > MAX_SIGNAL {
            return Err(ProcessError::InvalidSignal(signal));
        }
        let state = self
            .table
            .get(target)
            .ok_or(ProcessError::NoSuchProcess(target))?
            .state;
        if signal == 0 {
            return Ok(false);
        }
        if target == Pid::INIT {
            return Err(ProcessError::Protected(target));
        }
        if matches!(state, ProcessState::Zombie | ProcessState::Terminated) {
            return Ok(false);
        }
        let was_current = self.current == Some(target);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        self.exit(target, 128 + signal as i32)?;
        info!("process {target} killed by signal {signal}");
        Ok(was_current)
    }

    /// First zombie child of `parent`, optionally restricted to `which`.
    ///
    /// # Errors
    /// [`ProcessError::NoChildren`] if `parent` has no (matching) child.
    pub fn find_zombie_child(&self, parent: Pid, which: Option<Pid>) -> Result<Option<Pid>, ProcessError> {
        let mut any = false;
        for child in self.children(parent) {
            if which.is_some_and(|w| w != child) {
                continue;
            }
            any = true;
            if self.table.get(child).is_some_and(|c| c.state == ProcessState::Zombie) {
                return Ok(Some(child));
            }
        }
        if any { Ok(None) } else { Err(ProcessError::NoChildren) }
    }

    /// Collect zombie `child` of `parent`: free its address space and its
    /// table slot, and return its exit code.
    ///
    /// # Errors
    /// [`ProcessError::NoSuchProcess`] if `child` is not a zombie child of
    /// `parent`.
    pub fn reap<A: FrameAlloc>(&mut self, alloc: &mut A, parent: Pid, child: Pid) -> Result<i32, ProcessError> {
        let is_zombie_child = self
            .table
            .get(child)
            .is_some_and(|c| c.parent == Some(parent) && c.state == ProcessState::Zombie);
        if !is_zombie_child {
            return Err(ProcessError::NoSuchProcess(child));
        }
        self.unlink_child(parent, child);
        if let Some(c) = self.table.get_mut(child) {
            c.state = ProcessState::Terminated;
        }
        let process = self.table.remove(child).ok_or(ProcessError::NoSuchProcess(child))?;
        self.space(process.context.root).destroy(alloc);
        info!("reaped process {child} (exit code {})", process.exit_code);
        Ok(process.exit_code)
    }

    /// Non-blocking wait: reap one zombie child if there is one.
    ///
    /// # Errors
    /// [`ProcessError::NoChildren`] if `parent` has no (matching) child.
    pub fn wait<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        parent: Pid,
        which: Option<Pid>,
    ) -> Result<Option<(Pid, i32)>, ProcessError> {
        match self.find_zombie_child(parent, which)? {
            Some(child) => Ok(Some((child, self.reap(alloc, parent, child)?))),
            None => Ok(None),
        }
    }

    /// Move the program break of `pid` by `increment` bytes and return the
    /// old break. Pages entering the heap are mapped zeroed; whole pages
    /// leaving it are unmapped.
    ///
    /// # Errors
    /// [`ProcessError::InvalidArgument`] when shrinking below the heap start;
    /// [`ProcessError::Memory`] when growing into the stack or out of frames.
    pub fn sbrk<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        pid: Pid,
        increment: i64,
    ) -> Result<VirtualAddress, ProcessError> {
        let p = self.table.get(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        let (old, start, root) = (p.brk, p.heap_start, p.context.root);
        let new = old
            .as_u64()
            .checked_add_signed(increment)
            .ok_or(ProcessError::InvalidArgument)?;
        if new < start.as_u64() {
            return Err(ProcessError::InvalidArgument);
        }
        if new > USER_STACK_BASE {
            return Err(VmemError::OutOfMemory.into());
        }

        let space = self.space(root);
        let old_top = align_up(old.as_u64(), PAGE_SIZE);
        let new_top = align_up(new, PAGE_SIZE);
        if new_top > old_top {
            space.map(alloc, VirtualAddress::new(old_top), None, new_top - old_top, heap_flags())?;
        } else if new_top < old_top {
            space.unmap(alloc, VirtualAddress::new(new_top), old_top - new_top)?;
        }

        if let Some(p) = self.table.get_mut(pid) {
            p.brk = VirtualAddress::new(new);
        }
        trace!("sbrk({increment}) for {pid}: {old} -> {new:#x}");
        Ok(old)
    }

    /// Queue `pid` as Ready. Returns `false` if it is unknown, not runnable,
    /// or already queued.
    pub fn enqueue(&mut self, pid: Pid) -> bool {
        match self.table.get_mut(pid) {
            Some(p) if matches!(p.state, ProcessState::Ready | ProcessState::Running) => {
                p.state = ProcessState::Ready;
            }
            _ => return false,
        }
        self.ready.push_back(&mut self.table, pid)
    }

    /// Take the next Ready process off the queue.
    pub fn dequeue(&mut self) -> Option<Pid> {
        self.ready.pop_front(&mut self.table)
    }

    /// Take `pid` off the CPU and the ready queue until [`Self::wake`].
    ///
    /// # Errors
    /// [`ProcessError::NoSuchProcess`] if `pid` is not Ready or Running.
    pub fn block(&mut self, pid: Pid) -> Result<(), ProcessError> {
        match self.table.get_mut(pid) {
            Some(p) if matches!(p.state, ProcessState::Ready | ProcessState::Running) => {
                p.state = ProcessState::Blocked;
            }
            _ => return Err(ProcessError::NoSuchProcess(pid)),
        }
        self.ready.remove(&mut self.table, pid);
        if self.current == Some(pid) {
            self.current = None;
        }
        Ok(())
    }

    /// Make a Blocked process Ready again.
    pub fn wake(&mut self, pid: Pid) -> bool {
        match self.table.get_mut(pid) {
            Some(p) if p.state == ProcessState::Blocked => p.state = ProcessState::Ready,
            _ => return false,
        }
        self.enqueue(pid)
    }

    /// Mark `pid` Running and return the context to resume.
    pub(crate) fn set_running(&mut self, pid: Pid) -> Option<CpuContext> {
        let p = self.table.get_mut(pid)?;
        p.state = ProcessState::Running;
        self.current = Some(pid);
        Some(p.context)
    }

    /// Store the interrupted register state of the current process.
    pub(crate) fn save_current(&mut self, frame: &TrapFrame) {
        if let Some(p) = self.current.and_then(|pid| self.table.get_mut(pid))
            && p.state == ProcessState::Running
        {
            p.context.frame = *frame;
        }
    }

    /// Running -> Ready for the current process.
    pub(crate) fn preempt_current(&mut self) {
        if let Some(pid) = self.current.take() {
            self.enqueue(pid);
        }
    }
}

fn heap_flags() -> MapFlags {
    MapFlags::user_rw().with_no_execute(true)
}

fn populate<M: PhysMapper, A: FrameAlloc>(
    space: &AddressSpace<'_, M>,
    alloc: &mut A,
    image: &[u8],
) -> Result<LoadedImage, ProcessError> {
    let loaded = kernel_elf::load(image, space, alloc)?;
    space.map(
        alloc,
        VirtualAddress::new(USER_STACK_BASE),
        None,
        USER_STACK_PAGES * PAGE_SIZE,
        heap_flags(),
    )?;
    Ok(loaded)
}
