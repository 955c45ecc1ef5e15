//! # Kernel synchronization primitives
//!
//! The kernel runs on a single CPU; concurrency comes only from interrupt
//! delivery. [`SpinLock::lock_irq`] therefore masks interrupts for the
//! lifetime of the guard so an interrupt handler can never spin on a lock
//! held by the code it interrupted.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard, SpinLockIrqGuard};
pub use sync_once_cell::SyncOnceCell;
