//! # Syscall Boundary
//!
//! User code enters with `int 0x80`: the syscall number in `rax`, up to three
//! arguments in `rdi`, `rsi`, `rdx`. The result goes back in `rax`; a
//! negative value is `-errno`.
//!
//! [`dispatch`] decodes the number and hands typed arguments to a
//! [`SyscallHandler`]. It knows nothing about processes.

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel_memory_addresses::VirtualAddress;
use log::debug;

/// Syscall numbers as placed in `rax`.
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sysno {
    Write = 1,
    Read = 2,
    Close = 3,
    Fstat = 4,
    Isatty = 5,
    Lseek = 6,
    Sbrk = 7,
    Exit = 8,
    Kill = 9,
    Getpid = 10,
    Fork = 11,
    Waitpid = 12,
}

impl Sysno {
    #[must_use]
    pub const fn from_raw(nr: u64) -> Option<Self> {
        Some(match nr {
            1 => Self::Write,
            2 => Self::Read,
            3 => Self::Close,
            4 => Self::Fstat,
            5 => Self::Isatty,
            6 => Self::Lseek,
            7 => Self::Sbrk,
            8 => Self::Exit,
            9 => Self::Kill,
            10 => Self::Getpid,
            11 => Self::Fork,
            12 => Self::Waitpid,
            _ => return None,
        })
    }
}

/// POSIX error numbers returned as `-errno`.
#[allow(clippy::upper_case_acronyms)]
#[repr(i64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Errno {
    #[error("no such process")]
    ESRCH = 3,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("no child processes")]
    ECHILD = 10,
    #[error("resource temporarily unavailable")]
    EAGAIN = 11,
    #[error("out of memory")]
    ENOMEM = 12,
    #[error("bad address")]
    EFAULT = 14,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("illegal seek")]
    ESPIPE = 29,
    #[error("function not implemented")]
    ENOSYS = 38,
}

impl Errno {
    /// The value placed in `rax`.
    #[must_use]
    pub const fn as_return(self) -> i64 {
        -(self as i64)
    }
}

pub type SysResult = Result<u64, Errno>;

/// The three argument registers of a syscall.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
}

impl SyscallArgs {
    #[must_use]
    pub const fn new(rdi: u64, rsi: u64, rdx: u64) -> Self {
        Self { rdi, rsi, rdx }
    }
}

/// Process-visible services behind the syscall vector.
pub trait SyscallHandler {
    fn write(&mut self, fd: u64, buf: VirtualAddress, len: u64) -> SysResult;
    fn read(&mut self, fd: u64, buf: VirtualAddress, len: u64) -> SysResult;
    fn close(&mut self, fd: u64) -> SysResult;
    fn fstat(&mut self, fd: u64, stat: VirtualAddress) -> SysResult;
    fn isatty(&mut self, fd: u64) -> SysResult;
    fn lseek(&mut self, fd: u64, offset: i64, whence: u64) -> SysResult;
    /// Returns the previous program break.
    fn sbrk(&mut self, increment: i64) -> SysResult;
    fn exit(&mut self, code: i32) -> SysResult;
    fn kill(&mut self, pid: u64, signal: u64) -> SysResult;
    fn getpid(&mut self) -> SysResult;
    /// Returns the child PID to the parent.
    fn fork(&mut self) -> SysResult;
    /// Non-blocking: `0` if no child has exited yet.
    fn waitpid(&mut self, pid: i64, status: VirtualAddress) -> SysResult;
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
const fn signed(v: u64) -> i64 {
    v as i64
}

/// Decode syscall `nr` and run it on `handler`. Returns the `rax` value.
pub fn dispatch<H: SyscallHandler + ?Sized>(handler: &mut H, nr: u64, args: SyscallArgs) -> i64 {
    let SyscallArgs { rdi, rsi, rdx } = args;
    let Some(sysno) = Sysno::from_raw(nr) else {
        debug!("unknown syscall {nr}");
        return Errno::ENOSYS.as_return();
    };

    let result = match sysno {
        Sysno::Write => handler.write(rdi, VirtualAddress::new(rsi), rdx),
        Sysno::Read => handler.read(rdi, VirtualAddress::new(rsi), rdx),
        Sysno::Close => handler.close(rdi),
        Sysno::Fstat => handler.fstat(rdi, VirtualAddress::new(rsi)),
        Sysno::Isatty => handler.isatty(rdi),
        Sysno::Lseek => handler.lseek(rdi, signed(rsi), rdx),
        Sysno::Sbrk => handler.sbrk(signed(rdi)),
        #[allow(clippy::cast_possible_truncation)]
        Sysno::Exit => handler.exit(rdi as i32),
        Sysno::Kill => handler.kill(rdi, rsi),
        Sysno::Getpid => handler.getpid(),
        Sysno::Fork => handler.fork(),
        Sysno::Waitpid => handler.waitpid(signed(rdi), VirtualAddress::new(rsi)),
    };

    match result {
        Ok(value) => signed(value),
        Err(errno) => {
            debug!("{sysno:?} failed: {errno}");
            errno.as_return()
        }
    }
}
