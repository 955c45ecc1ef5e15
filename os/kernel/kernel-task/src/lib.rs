//! # Processes and Scheduling
//!
//! ```text
//!   timer tick ──► Scheduler::on_tick ──► save frame ─► requeue ─► dispatch next
//!                                                                  │
//!   int 0x80 ───► Kernel::handle_syscall ──► kernel_syscall::dispatch
//!                                             │
//!                                             ▼
//!                              ProcessManager (table, ready queue, PIDs)
//!                                             │
//!                          kernel_elf::load / kernel_vmem::AddressSpace
//! ```
//!
//! A process is a table slot holding its saved [`TrapFrame`], its page-table
//! root and its links into the ready queue and its parent's child list.
//! Trap handlers receive the interrupted frame by reference and overwrite it
//! in place to switch contexts; the entry stub then restores whatever the
//! frame holds.
//!
//! Nothing here touches hardware directly: page-table roots are loaded
//! through the [`Cpu`] trait and console output goes to a [`Console`].

#![cfg_attr(not(any(test, doctest)), no_std)]

mod context;
mod kernel;
mod manager;
mod process;
mod scheduler;
mod table;

pub use context::{CpuContext, TrapFrame};
pub use kernel::{Console, Kernel};
pub use manager::ProcessManager;
pub use process::{Pid, Process, ProcessState};
pub use scheduler::{Cpu, Scheduler};
pub use table::{ProcessTable, ReadyQueue};

use kernel_elf::LoadError;
use kernel_syscall::Errno;
use kernel_vmem::VmemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("process table is full")]
    TableFull,
    #[error("no process with PID {0}")]
    NoSuchProcess(Pid),
    #[error("no child processes")]
    NoChildren,
    #[error("process {0} cannot be signalled")]
    Protected(Pid),
    #[error("invalid signal {0}")]
    InvalidSignal(u64),
    #[error("invalid argument")]
    InvalidArgument,
    #[error(transparent)]
    Memory(#[from] VmemError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl From<ProcessError> for Errno {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::TableFull => Self::EAGAIN,
            ProcessError::NoSuchProcess(_) => Self::ESRCH,
            ProcessError::NoChildren => Self::ECHILD,
            ProcessError::Protected(_) | ProcessError::InvalidSignal(_) | ProcessError::InvalidArgument => {
                Self::EINVAL
            }
            ProcessError::Memory(e) | ProcessError::Load(LoadError::Map(e)) => match e {
                VmemError::OutOfMemory => Self::ENOMEM,
                VmemError::NotMapped(_) | VmemError::NotUserSpace(_) | VmemError::ReadOnly(_) => Self::EFAULT,
                _ => Self::EINVAL,
            },
            ProcessError::Load(LoadError::Elf(_)) => Self::EINVAL,
        }
    }
}
