//! Architecture-specific page table encoding.
//!
//! Host tests and the kernel share the x86_64 encoding: page tables built in an
//! emulated arena are bit-for-bit the tables the hardware would walk.

mod x86_64;

pub use self::x86_64::*;
