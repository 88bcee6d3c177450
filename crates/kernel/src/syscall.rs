//! System call numbers.
//!
//! A process traps with `int 0x30`, the call number in `rax` and its argument in `rdi`.
//! The result comes back in `rax`.

use core::fmt;

/// A system call the kernel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Syscall {
    /// Halt the system with a message. The argument points at a NUL-terminated string.
    Panic = 1,
    /// Return the caller's pid.
    GetPid = 2,
    /// Give up the CPU. Returns 0.
    Yield = 3,
    /// Map a fresh zeroed page at the argument address. Returns 0 or -1.
    PageAlloc = 4,
    /// Duplicate the caller. Returns the child pid, 0 in the child, or -1.
    Fork = 5,
    /// Terminate the caller.
    Exit = 6,
}

/// A call number that names no system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownSyscall(pub u64);

impl TryFrom<u64> for Syscall {
    type Error = UnknownSyscall;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Syscall::Panic,
            2 => Syscall::GetPid,
            3 => Syscall::Yield,
            4 => Syscall::PageAlloc,
            5 => Syscall::Fork,
            6 => Syscall::Exit,
            other => return Err(UnknownSyscall(other)),
        })
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Syscall::Panic => "panic",
            Syscall::GetPid => "getpid",
            Syscall::Yield => "yield",
            Syscall::PageAlloc => "page_alloc",
            Syscall::Fork => "fork",
            Syscall::Exit => "exit",
        };
        f.write_str(name)
    }
}
