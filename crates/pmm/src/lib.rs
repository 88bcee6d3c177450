#![cfg_attr(not(test), no_std)]

//! # Vireo physical memory
//!
//! The memory core of the Vireo kernel. It provides:
//!
//! - Distinct physical/virtual address and frame/page number types.
//! - [`PhysicalMemory`], the only way to touch the bytes of physical pages.
//! - [`PageAllocator`], a reference-counted single-page allocator.
//! - [`PageTable`] and [`Walk`], x86_64 four-level page tables kept in physical memory.
//!
//! Everything runs against an emulated arena in tests (and with the `software-emulation`
//! feature), so page-table and ownership logic can be exercised on the host.

extern crate alloc;

mod address;
mod arch;
mod frame;
mod memory;
mod numbers;
mod page_allocator;
mod page_table;

pub use address::{PhysicalAddress, VirtualAddress};
pub use arch::{ENTRY_COUNT, KERNEL_HALF_INDEX, PAGE_SIZE, PageEntry, PageFlags};
pub use frame::Frame;
pub use memory::PhysicalMemory;
pub use numbers::{FrameNumber, PageNumber};
pub use page_allocator::{ALLOCATION_STRIDE, AllocError, PageAllocator, PhysicalPage, SENTINEL};
pub use page_table::{Mapping, Mappings, PageTable, Walk};
