//! A small x86_64 kernel that runs a handful of user processes round-robin.
//!
//! Each process has its own four-level page table. Physical pages are reference counted
//! so that `fork` can share read-only pages between parent and child and copy only the
//! writable ones. Everything above the hardware boundary runs on the host as well, over
//! an emulated physical memory arena.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod console;
pub mod interrupts;
pub mod kernel;
pub mod layout;
pub mod mem;
#[cfg(feature = "memviewer")]
pub mod memviewer;
pub mod process;
pub mod program;
pub mod registers;
mod scheduler;
pub mod screen;
pub mod syscall;
pub mod trap;

#[cfg(target_os = "none")]
mod arch;
#[cfg(target_os = "none")]
mod boot;
#[cfg(target_os = "none")]
mod modules;
#[cfg(target_os = "none")]
mod serial;

pub use kernel::{ForkError, Kernel, KernelPanic, PageAllocError, SetupError};
pub use process::{Pid, ProcessState};
pub use trap::{Dispatch, Platform};

#[cfg(target_os = "none")]
pub use boot::handle_panic;
