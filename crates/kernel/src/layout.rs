//! Fixed memory layout shared by the kernel and every process.

use alloc::vec::Vec;
use core::ops::Range;

use pmm::{PhysicalAddress, VirtualAddress};

pub use pmm::PAGE_SIZE;

/// Bytes of physical memory managed by the page allocator (512 pages).
pub const MEMSIZE_PHYSICAL: usize = 0x20_0000;

/// Number of physical pages managed by the page allocator.
pub const NPAGES: usize = MEMSIZE_PHYSICAL / PAGE_SIZE;

/// First address past the user virtual range.
pub const MEMSIZE_VIRTUAL: VirtualAddress = VirtualAddress::new(0x30_0000);

/// Boundary between the kernel region and the user region of every address space.
pub const PROC_START_ADDR: VirtualAddress = VirtualAddress::new(0x10_0000);

/// Virtual address of the page every process uses as its initial stack.
pub const STACK_PAGE: VirtualAddress = VirtualAddress::new(0x30_0000 - PAGE_SIZE);

/// The text console, identity mapped and writable by user code in every address space.
pub const CONSOLE_ADDR: VirtualAddress = VirtualAddress::new(0xB8000);

/// Physical address behind [`CONSOLE_ADDR`].
pub const CONSOLE_PHYS: PhysicalAddress = PhysicalAddress::new(0xB8000);

pub const KERNEL_START_ADDR: usize = 0x4_0000;
pub const KERNEL_STACK_TOP: usize = 0x8_0000;
pub const IOPHYSMEM: usize = 0xA_0000;
pub const EXTPHYSMEM: usize = 0x10_0000;

/// Number of process slots. Slot 0 is never used.
pub const NPROC: usize = 16;

/// Timer interrupts per second.
pub const HZ: u64 = 100;

/// Physical ranges that are never handed out by the page allocator.
pub fn reserved_ranges() -> [Range<PhysicalAddress>; 2] {
    [
        PhysicalAddress::new(KERNEL_START_ADDR)..PhysicalAddress::new(KERNEL_STACK_TOP),
        PhysicalAddress::new(IOPHYSMEM)..PhysicalAddress::new(EXTPHYSMEM),
    ]
}

/// Returns true if `va` is a page a process may own: inside the user region and not the
/// console.
pub fn is_user_page(va: VirtualAddress) -> bool {
    va >= PROC_START_ADDR && va < MEMSIZE_VIRTUAL && va != CONSOLE_ADDR
}

/// Returns the parts of `[0, limit)` that no `usable` range covers.
///
/// The boot memory map lists usable RAM; everything else below the managed limit
/// belongs to the firmware or the bootloader and must never be allocated.
pub fn unusable_ranges(usable: &[Range<usize>], limit: usize) -> Vec<Range<PhysicalAddress>> {
    let mut sorted: Vec<_> = usable.iter().filter(|r| r.start < r.end).cloned().collect();
    sorted.sort_by_key(|range| range.start);

    let mut gaps = Vec::new();
    let mut covered = 0;
    for range in sorted {
        if range.start >= limit {
            break;
        }
        if range.start > covered {
            gaps.push(PhysicalAddress::new(covered)..PhysicalAddress::new(range.start));
        }
        covered = covered.max(range.end);
    }
    if covered < limit {
        gaps.push(PhysicalAddress::new(covered)..PhysicalAddress::new(limit));
    }
    gaps
}
