//! x86_64 architecture-specific implementation.
//!
//! This module provides address validation, page table geometry, and the
//! low-level page table entry primitives for 4-level paging.

mod entry;
mod flags;

pub use entry::PageEntry;
pub use flags::PageFlags;

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels (PML4, PDPT, PD, PT).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Number of entries in one page table page.
pub const ENTRY_COUNT: usize = 512;

/// First top-level index belonging to the higher (kernel) half.
pub const KERNEL_HALF_INDEX: usize = ENTRY_COUNT / 2;

/// Returns the page table index for a given virtual address at the specified level.
///
/// Level 0 is the page table (PT), level 1 the page directory (PD), level 2 the
/// page directory pointer table (PDPT) and level 3 the PML4.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64 page table levels");
    (address >> (12 + level * 9)) & (ENTRY_COUNT - 1)
}

/// Returns the number of bytes of virtual address space covered by one entry at `level`.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << (12 + level * 9)
}

/// Validates a physical address for x86_64.
///
/// Physical addresses must not exceed the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    let max_addr = (1usize << MAX_PHYSICAL_BITS) - 1;
    addr <= max_addr
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical: the bits above `MAX_VIRTUAL_BITS` copy the
/// highest implemented bit.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let shift = usize::BITS as usize - MAX_VIRTUAL_BITS;
    (((addr << shift) as isize) >> shift) as usize == addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_address_by_level() {
        // PML4 1, PDPT 2, PD 3, PT 4, offset 0x5
        let addr = (1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 0x5;
        assert_eq!(page_index(addr, 3), 1);
        assert_eq!(page_index(addr, 2), 2);
        assert_eq!(page_index(addr, 1), 3);
        assert_eq!(page_index(addr, 0), 4);
    }

    #[test]
    fn spans_grow_by_512() {
        assert_eq!(level_span(0), PAGE_SIZE);
        assert_eq!(level_span(1), 2 * 1024 * 1024);
        assert_eq!(level_span(2), 1024 * 1024 * 1024);
    }

    #[test]
    fn canonical_addresses() {
        assert!(validate_virtual(0x0000_7FFF_FFFF_F000));
        assert!(validate_virtual(0xFFFF_8000_0000_0000));
        assert!(!validate_virtual(0x0000_8000_0000_0000));
        assert!(!validate_virtual(0xFFFF_7FFF_FFFF_FFFF));
        assert!(validate_virtual(0));
        assert!(validate_virtual(usize::MAX));
    }
}
