//! Four-level page tables stored in physical memory.
//!
//! A [`PageTable`] owns its root page and every intermediate table page below the kernel
//! half. Leaf pages are never owned by the table: whoever installs a leaf is responsible
//! for the reference it holds. [`Walk`] enumerates the present leaves of a range without
//! mutating anything, so callers may interleave `map`/`unmap` calls with the walk.

use alloc::vec::Vec;
use core::ops::Range;

use crate::{
    AllocError, PageAllocator, PhysicalAddress, PhysicalMemory, VirtualAddress,
    arch::{self, PageEntry, PageFlags},
};

/// A present leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Page-aligned virtual address.
    pub va: VirtualAddress,
    /// Physical address of the mapped page.
    pub pa: PhysicalAddress,
    /// Permission bits of the leaf entry.
    pub flags: PageFlags,
}

impl Mapping {
    /// Returns true if user mode may access this page.
    pub fn is_user(&self) -> bool {
        self.flags.is_user()
    }

    /// Returns true if the page may be written.
    pub fn is_writable(&self) -> bool {
        self.flags.is_writable()
    }
}

/// An owning handle to the root of a page table.
///
/// Not `Clone`: exactly one owner maps into, and eventually [`free`](PageTable::free)s,
/// a table.
#[derive(Debug, PartialEq, Eq)]
pub struct PageTable {
    root: PhysicalAddress,
}

impl PageTable {
    /// Allocates an empty page table.
    pub fn new(allocator: &mut PageAllocator) -> Result<Self, AllocError> {
        let root = allocator.allocate_zeroed()?.into_address();
        Ok(Self { root })
    }

    /// Returns the physical address of the top-level table (the value loaded into CR3).
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Finds the page containing `va`.
    pub fn lookup(&self, memory: &PhysicalMemory, va: VirtualAddress) -> Option<Mapping> {
        let va = va.align_down(arch::PAGE_SIZE);
        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = memory.entry(table, va.page_index(level));
            if entry.is_huge() {
                return None;
            }
            table = entry.address()?;
        }

        let entry = memory.entry(table, va.page_index(0));
        Some(Mapping {
            va,
            pa: entry.address()?,
            flags: entry.flags(),
        })
    }

    /// Translates `va` to the physical address it maps to.
    pub fn translate(&self, memory: &PhysicalMemory, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.lookup(memory, va)
            .map(|mapping| mapping.pa + va.page_offset())
    }

    /// Maps the page at `va` to the page at `pa`, replacing any previous leaf.
    ///
    /// Missing intermediate tables are allocated zeroed and made present, writable and
    /// user-accessible so that the leaf flags alone decide access. On failure no leaf is
    /// installed; intermediate tables allocated so far stay owned by this table.
    ///
    /// # Panics
    ///
    /// Panics if either address is not page-aligned.
    pub fn map(
        &mut self,
        allocator: &mut PageAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), AllocError> {
        assert!(va.is_page_aligned(), "virtual address must be page-aligned");
        assert!(pa.is_page_aligned(), "physical address must be page-aligned");

        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let index = va.page_index(level);
            let entry = allocator.memory().entry(table, index);
            assert!(!entry.is_huge(), "cannot map through a huge page");

            table = match entry.address() {
                Some(next) => next,
                None => {
                    let next = allocator.allocate_zeroed()?.into_address();
                    allocator
                        .memory_mut()
                        .set_entry(table, index, PageEntry::new(next, PageFlags::user_rw()));
                    next
                }
            };
        }

        let mut flags = flags;
        flags.set_present(true);
        allocator
            .memory_mut()
            .set_entry(table, va.page_index(0), PageEntry::new(pa, flags));
        Ok(())
    }

    /// Clears the leaf for `va` and returns what it mapped.
    ///
    /// The referenced page is not freed.
    pub fn unmap(&mut self, memory: &mut PhysicalMemory, va: VirtualAddress) -> Option<Mapping> {
        let mapping = self.lookup(memory, va)?;
        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            table = memory.entry(table, mapping.va.page_index(level)).address()?;
        }
        memory.set_entry(table, mapping.va.page_index(0), PageEntry::default());
        Some(mapping)
    }

    /// Starts a walk over the present leaves in `range`.
    pub fn walk(&self, range: Range<VirtualAddress>) -> Walk {
        Walk {
            root: self.root,
            next: range.start.align_down(arch::PAGE_SIZE).as_usize(),
            end: range.end.as_usize(),
        }
    }

    /// Copies the kernel-half top-level entries of the table rooted at `source` into this
    /// table.
    ///
    /// The lower-level tables behind those entries stay owned by whoever owns `source`,
    /// which need not be a [`PageTable`] (the bootloader's tables, for instance).
    pub fn share_kernel_half(&mut self, memory: &mut PhysicalMemory, source: PhysicalAddress) {
        for index in arch::KERNEL_HALF_INDEX..arch::ENTRY_COUNT {
            let entry = memory.entry(source, index);
            memory.set_entry(self.root, index, entry);
        }
    }

    /// Returns the root and every intermediate table page owned by this table.
    pub fn structure_pages(&self, memory: &PhysicalMemory) -> Vec<PhysicalAddress> {
        let mut pages = alloc::vec![self.root];
        collect_tables(memory, self.root, arch::PAGE_TABLE_LEVELS - 1, &mut pages);
        pages
    }

    /// Frees every table page owned by this table, root last.
    ///
    /// Leaf pages are left alone; release them before calling this.
    pub fn free(self, allocator: &mut PageAllocator) {
        for page in self.structure_pages(allocator.memory()).into_iter().rev() {
            allocator.free(page);
        }
    }
}

/// Appends the table pages below `table` (a table at `level`) in depth-first order.
fn collect_tables(
    memory: &PhysicalMemory,
    table: PhysicalAddress,
    level: usize,
    pages: &mut Vec<PhysicalAddress>,
) {
    let count = if level == arch::PAGE_TABLE_LEVELS - 1 {
        arch::KERNEL_HALF_INDEX
    } else {
        arch::ENTRY_COUNT
    };

    for index in 0..count {
        let entry = memory.entry(table, index);
        if entry.is_huge() {
            continue;
        }
        if let Some(child) = entry.address() {
            pages.push(child);
            if level > 1 {
                collect_tables(memory, child, level - 1, pages);
            }
        }
    }
}

/// A restartable cursor over the present leaves of a page table.
///
/// The walk only remembers where it will look next, so it holds no borrow of the table
/// or of physical memory. Mappings are produced in increasing address order and absent
/// subtrees are skipped whole.
#[derive(Debug, Clone)]
pub struct Walk {
    root: PhysicalAddress,
    next: usize,
    end: usize,
}

impl Walk {
    /// Returns the next present leaf, or `None` once the range is exhausted.
    pub fn next_mapping(&mut self, memory: &PhysicalMemory) -> Option<Mapping> {
        'search: while self.next < self.end {
            let va = self.next;
            let mut table = self.root;

            for level in (0..arch::PAGE_TABLE_LEVELS).rev() {
                let entry = memory.entry(table, arch::page_index(va, level));
                let present = entry.is_present() && !(level > 0 && entry.is_huge());
                if !present {
                    let span = arch::level_span(level);
                    self.next = match (va & !(span - 1)).checked_add(span) {
                        Some(next) => next,
                        None => self.end,
                    };
                    continue 'search;
                }

                match entry.address() {
                    Some(pa) if level == 0 => {
                        self.next = va + arch::PAGE_SIZE;
                        return Some(Mapping {
                            va: VirtualAddress::new(va),
                            pa,
                            flags: entry.flags(),
                        });
                    }
                    Some(next_table) => table = next_table,
                    None => unreachable!("present entry without an address"),
                }
            }
        }

        None
    }

    /// Moves the cursor so the next mapping returned is at or after `va`.
    pub fn restart_at(&mut self, va: VirtualAddress) {
        self.next = va.align_down(arch::PAGE_SIZE).as_usize();
    }

    /// Adapts the walk into an iterator reading from `memory`.
    pub fn iter(self, memory: &PhysicalMemory) -> Mappings<'_> {
        Mappings { walk: self, memory }
    }
}

/// Iterator over the leaves found by a [`Walk`].
pub struct Mappings<'a> {
    walk: Walk,
    memory: &'a PhysicalMemory,
}

impl Iterator for Mappings<'_> {
    type Item = Mapping;

    fn next(&mut self) -> Option<Self::Item> {
        self.walk.next_mapping(self.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGES: usize = 64;

    fn setup() -> (PageAllocator, PageTable) {
        let memory = PhysicalMemory::emulated(PAGES * arch::PAGE_SIZE);
        let mut allocator = PageAllocator::new(memory, &[]);
        let table = PageTable::new(&mut allocator).expect("root table");
        (allocator, table)
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    #[test]
    fn new_table_is_empty() {
        let (allocator, table) = setup();
        let range = va(0)..va(0x0000_7FFF_FFFF_F000);
        assert_eq!(table.walk(range).iter(allocator.memory()).count(), 0);
        assert_eq!(table.structure_pages(allocator.memory()), [table.root()]);
    }

    #[test]
    fn map_and_lookup() {
        let (mut allocator, mut table) = setup();
        table
            .map(&mut allocator, va(0x10_0000), pa(0x3000), PageFlags::user_ro())
            .expect("map");

        let mapping = table.lookup(allocator.memory(), va(0x10_0123)).expect("mapped");
        assert_eq!(mapping.va, va(0x10_0000));
        assert_eq!(mapping.pa, pa(0x3000));
        assert!(mapping.is_user());
        assert!(!mapping.is_writable());
        assert_eq!(table.translate(allocator.memory(), va(0x10_0123)), Some(pa(0x3123)));
        // PML4, PDPT, PD and PT pages.
        assert_eq!(table.structure_pages(allocator.memory()).len(), 4);
    }

    #[test]
    fn unmap_returns_previous_mapping() {
        let (mut allocator, mut table) = setup();
        table
            .map(&mut allocator, va(0x10_0000), pa(0x3000), PageFlags::user_rw())
            .expect("map");

        let old = table.unmap(allocator.memory_mut(), va(0x10_0000)).expect("was mapped");
        assert_eq!(old.pa, pa(0x3000));
        assert!(table.lookup(allocator.memory(), va(0x10_0000)).is_none());
        assert!(table.unmap(allocator.memory_mut(), va(0x10_0000)).is_none());
    }

    #[test]
    fn walk_yields_leaves_in_order_and_skips_holes() {
        let (mut allocator, mut table) = setup();
        let addrs = [0x10_0000, 0x10_3000, 0x40_0000, 0x80_0000_0000];
        for (i, &addr) in addrs.iter().enumerate().rev() {
            table
                .map(&mut allocator, va(addr), pa((i + 1) * arch::PAGE_SIZE), PageFlags::user_rw())
                .expect("map");
        }

        let found: Vec<_> = table
            .walk(va(0)..va(0x0000_7FFF_FFFF_F000))
            .iter(allocator.memory())
            .map(|m| m.va.as_usize())
            .collect();
        assert_eq!(found, addrs);

        let bounded: Vec<_> = table
            .walk(va(0x10_1000)..va(0x40_0000))
            .iter(allocator.memory())
            .map(|m| m.va.as_usize())
            .collect();
        assert_eq!(bounded, [0x10_3000]);
    }

    #[test]
    fn walk_tolerates_mutation_between_steps() {
        let (mut allocator, mut table) = setup();
        for page in 0..4 {
            let addr = 0x10_0000 + page * arch::PAGE_SIZE;
            table
                .map(&mut allocator, va(addr), pa(0x3000), PageFlags::user_rw())
                .expect("map");
        }

        let mut walk = table.walk(va(0x10_0000)..va(0x20_0000));
        let mut seen = 0;
        while let Some(mapping) = walk.next_mapping(allocator.memory()) {
            table.unmap(allocator.memory_mut(), mapping.va);
            seen += 1;
        }
        assert_eq!(seen, 4);

        walk.restart_at(va(0x10_0000));
        assert!(walk.next_mapping(allocator.memory()).is_none());
    }

    #[test]
    fn map_fails_cleanly_when_out_of_memory() {
        let (mut allocator, mut table) = setup();
        while allocator.allocate().is_some() {}

        let result = table.map(&mut allocator, va(0x10_0000), pa(0x3000), PageFlags::user_rw());
        assert_eq!(result, Err(AllocError::OutOfMemory));
        assert!(table.lookup(allocator.memory(), va(0x10_0000)).is_none());
    }

    #[test]
    fn free_releases_structure_but_not_leaves() {
        let (mut allocator, mut table) = setup();
        let leaf = allocator.allocate().expect("leaf").into_address();
        table
            .map(&mut allocator, va(0x10_0000), leaf, PageFlags::user_rw())
            .expect("map");
        let before = allocator.free_count();

        table.free(&mut allocator);
        assert_eq!(allocator.free_count(), before + 4);
        assert_eq!(allocator.refcount(leaf), 1);
    }

    #[test]
    fn kernel_half_is_shared_not_owned() {
        let (mut allocator, mut kernel) = setup();
        kernel
            .map(&mut allocator, va(0xFFFF_8000_0000_0000), pa(0x3000), PageFlags::kernel_rw())
            .expect("map");
        let mut user = PageTable::new(&mut allocator).expect("table");
        user.share_kernel_half(allocator.memory_mut(), kernel.root());

        assert_eq!(
            user.translate(allocator.memory(), va(0xFFFF_8000_0000_0010)),
            Some(pa(0x3010))
        );
        assert_eq!(user.structure_pages(allocator.memory()), [user.root()]);
        let before = allocator.free_count();
        user.free(&mut allocator);
        assert_eq!(allocator.free_count(), before + 1);
    }
}
