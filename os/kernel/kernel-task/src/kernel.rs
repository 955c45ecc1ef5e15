use crate::ProcessError;
use crate::context::TrapFrame;
use crate::manager::ProcessManager;
use crate::process::Pid;
use crate::scheduler::{Cpu, Scheduler};
use kernel_info::config::SCHEDULER_QUANTUM_TICKS;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame, VirtualAddress};
use kernel_syscall::{Errno, SysResult, SyscallHandler, dispatch};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::warn;

/// Output side of the standard file descriptors 1 and 2.
pub trait Console {
    fn write_bytes(&mut self, bytes: &[u8]);
}

/// Bytes copied out of user memory per console write.
const COPY_CHUNK: usize = 256;

/// Highest standard file descriptor (stderr).
const STDERR: u64 = 2;

/// The kernel's mutable state behind the trap handlers.
///
/// Every handler takes the interrupted [`TrapFrame`] by reference; if the
/// CPU should resume a different context, the frame is overwritten in place.
pub struct Kernel<'m, M: PhysMapper, A: FrameAlloc, C: Cpu, K: Console> {
    processes: ProcessManager<'m, M>,
    scheduler: Scheduler,
    alloc: A,
    cpu: C,
    console: K,
}

impl<'m, M: PhysMapper, A: FrameAlloc, C: Cpu, K: Console> Kernel<'m, M, A, C, K> {
    #[must_use]
    pub const fn new(mapper: &'m M, kernel_root: PhysicalFrame, alloc: A, cpu: C, console: K) -> Self {
        Self {
            processes: ProcessManager::new(mapper, kernel_root),
            scheduler: Scheduler::new(SCHEDULER_QUANTUM_TICKS),
            alloc,
            cpu,
            console,
        }
    }

    /// Replace the scheduler quantum (in timer ticks).
    #[must_use]
    pub fn with_quantum(mut self, quantum: u32) -> Self {
        self.scheduler = Scheduler::new(quantum);
        self
    }

    /// Load `image` as a new Ready process.
    ///
    /// # Errors
    /// See [`ProcessManager::create`].
    pub fn spawn(&mut self, image: &[u8], parent: Option<Pid>) -> Result<Pid, ProcessError> {
        self.processes.create(&mut self.alloc, image, parent)
    }

    /// The first dispatch: the frame to enter, with its address space active.
    pub fn start(&mut self) -> TrapFrame {
        self.scheduler.start(&mut self.processes, &mut self.cpu)
    }

    /// Timer interrupt.
    pub fn handle_timer(&mut self, frame: &mut TrapFrame) -> Option<Pid> {
        self.scheduler.on_tick(&mut self.processes, &mut self.cpu, frame)
    }

    /// `int 0x80` from the current process. The result is written to `rax`
    /// unless the call ended the process, in which case `frame` now holds the
    /// next context.
    pub fn handle_syscall(&mut self, frame: &mut TrapFrame) {
        let Some(pid) = self.processes.current() else {
            warn!("syscall {} with no current process", frame.syscall_number());
            frame.set_return(Errno::ESRCH.as_return());
            return;
        };
        let (nr, args) = (frame.syscall_number(), frame.syscall_args());
        let mut services = SyscallServices {
            kernel: self,
            frame,
            pid,
            switched: false,
        };
        let ret = dispatch(&mut services, nr, args);
        if !services.switched {
            services.frame.set_return(ret);
        }
    }

    #[must_use]
    pub const fn processes(&self) -> &ProcessManager<'m, M> {
        &self.processes
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub const fn allocator(&self) -> &A {
        &self.alloc
    }

    #[must_use]
    pub const fn console(&self) -> &K {
        &self.console
    }

    #[must_use]
    pub const fn cpu(&self) -> &C {
        &self.cpu
    }
}

/// One syscall in flight on behalf of `pid`.
struct SyscallServices<'k, 'm, M: PhysMapper, A: FrameAlloc, C: Cpu, K: Console> {
    kernel: &'k mut Kernel<'m, M, A, C, K>,
    frame: &'k mut TrapFrame,
    pid: Pid,
    switched: bool,
}

impl<M: PhysMapper, A: FrameAlloc, C: Cpu, K: Console> SyscallServices<'_, '_, M, A, C, K> {
    /// The caller is gone; put the next process into the frame.
    fn switch_away(&mut self) {
        let kernel = &mut *self.kernel;
        kernel
            .scheduler
            .reschedule(&mut kernel.processes, &mut kernel.cpu, self.frame);
        self.switched = true;
    }

    /// Copy `len` bytes at `buf` in the caller's memory to the console, at
    /// most one page per chunk. A fault after some bytes were written ends
    /// the copy short.
    fn copy_to_console(&mut self, buf: VirtualAddress, len: u64) -> SysResult {
        let space = self
            .kernel
            .processes
            .address_space(self.pid)
            .ok_or(Errno::ESRCH)?;
        let mut chunk = [0u8; COPY_CHUNK];
        let mut done = 0u64;
        while done < len {
            let at = buf.checked_add(done).ok_or(Errno::EFAULT)?;
            let to_page_end = PAGE_SIZE - at.as_u64() % PAGE_SIZE;
            #[allow(clippy::cast_possible_truncation)]
            let n = (len - done).min(to_page_end).min(COPY_CHUNK as u64) as usize;
            if space.read_bytes(at, &mut chunk[..n]).is_err() {
                return if done == 0 { Err(Errno::EFAULT) } else { Ok(done) };
            }
            self.kernel.console.write_bytes(&chunk[..n]);
            done += n as u64;
        }
        Ok(done)
    }
}

const fn standard_fd(fd: u64) -> Result<(), Errno> {
    if fd <= STDERR { Ok(()) } else { Err(Errno::EBADF) }
}

/// `waitpid` status word for a normal exit.
#[allow(clippy::cast_sign_loss)]
const fn exit_status(code: i32) -> u32 {
    ((code as u32) & 0xff) << 8
}

impl<M: PhysMapper, A: FrameAlloc, C: Cpu, K: Console> SyscallHandler for SyscallServices<'_, '_, M, A, C, K> {
    fn write(&mut self, fd: u64, buf: VirtualAddress, len: u64) -> SysResult {
        match fd {
            1 | 2 => self.copy_to_console(buf, len),
            _ => Err(Errno::EBADF),
        }
    }

    fn read(&mut self, fd: u64, _buf: VirtualAddress, _len: u64) -> SysResult {
        match fd {
            0 => Ok(0),
            _ => Err(Errno::EBADF),
        }
    }

    fn close(&mut self, fd: u64) -> SysResult {
        standard_fd(fd).map(|()| 0)
    }

    fn fstat(&mut self, fd: u64, _stat: VirtualAddress) -> SysResult {
        standard_fd(fd).and(Err(Errno::ENOSYS))
    }

    fn isatty(&mut self, fd: u64) -> SysResult {
        standard_fd(fd).map(|()| 1)
    }

    fn lseek(&mut self, fd: u64, _offset: i64, _whence: u64) -> SysResult {
        standard_fd(fd).and(Err(Errno::ESPIPE))
    }

    fn sbrk(&mut self, increment: i64) -> SysResult {
        let kernel = &mut *self.kernel;
        let old = kernel.processes.sbrk(&mut kernel.alloc, self.pid, increment)?;
        Ok(old.as_u64())
    }

    fn exit(&mut self, code: i32) -> SysResult {
        self.kernel.processes.exit(self.pid, code)?;
        self.switch_away();
        Ok(0)
    }

    fn kill(&mut self, pid: u64, signal: u64) -> SysResult {
        let target = u32::try_from(pid)
            .ok()
            .filter(|&raw| raw != 0)
            .map(Pid::new)
            .ok_or(Errno::ESRCH)?;
        if self.kernel.processes.kill(target, signal)? {
            self.switch_away();
        }
        Ok(0)
    }

    fn getpid(&mut self) -> SysResult {
        Ok(self.pid.as_u32().into())
    }

    fn fork(&mut self) -> SysResult {
        let kernel = &mut *self.kernel;
        let child = kernel.processes.fork(&mut kernel.alloc, self.pid, self.frame)?;
        Ok(child.as_u32().into())
    }

    fn waitpid(&mut self, pid: i64, status: VirtualAddress) -> SysResult {
        let which = match pid {
            ..=0 => None,
            raw => Some(Pid::new(u32::try_from(raw).map_err(|_| Errno::ECHILD)?)),
        };
        let kernel = &mut *self.kernel;
        let Some(child) = kernel.processes.find_zombie_child(self.pid, which)? else {
            return Ok(0);
        };
        if status.as_u64() != 0 {
            let code = kernel
                .processes
                .find_by_pid(child)
                .map_or(0, crate::Process::exit_code);
            kernel
                .processes
                .address_space(self.pid)
                .ok_or(Errno::ESRCH)?
                .write_bytes(status, &exit_status(code).to_le_bytes())
                .map_err(|_| Errno::EFAULT)?;
        }
        kernel.processes.reap(&mut kernel.alloc, self.pid, child)?;
        Ok(child.as_u32().into())
    }
}
