//! Access to the bytes of physical memory.
//!
//! Page tables, page contents and user data are all reached through a [`PhysicalMemory`]
//! value. On hardware it is a window at a fixed offset (the bootloader's direct map); in
//! tests and under the `software-emulation` feature it is a page-aligned heap arena whose
//! byte 0 stands in for physical address 0.

use core::ptr::NonNull;

use crate::{PhysicalAddress, arch::{self, PageEntry}};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::alloc::{Layout, alloc_zeroed, dealloc};

/// How the bytes behind a [`PhysicalMemory`] are reached.
enum Backing {
    /// A heap arena owned by this value.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(Layout),
    /// A window mapped by someone else.
    Direct,
}

/// Byte-level access to a contiguous range of physical memory starting at address 0.
pub struct PhysicalMemory {
    base: NonNull<u8>,
    size: usize,
    backing: Backing,
}

// SAFETY: PhysicalMemory is only reachable through `&mut` for writes, and the kernel is
// single-threaded. Moving it between contexts does not invalidate the window.
unsafe impl Send for PhysicalMemory {}

impl PhysicalMemory {
    /// Creates an emulated physical memory of `size` bytes, zero-filled.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or not a multiple of the page size, or if the host
    /// allocator cannot provide the arena.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        assert!(
            size > 0 && size % arch::PAGE_SIZE == 0,
            "emulated memory must be a non-zero number of pages"
        );
        let layout = Layout::from_size_align(size, arch::PAGE_SIZE)
            .expect("emulated memory layout is valid");
        // SAFETY: layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .expect("failed to allocate emulated physical memory");
        Self {
            base,
            size,
            backing: Backing::Emulated(layout),
        }
    }

    /// Creates a window onto physical memory that is mapped at `offset`.
    ///
    /// # Safety
    ///
    /// Physical addresses `0..size` must be readable and writable at `offset..offset + size`
    /// for the lifetime of the returned value, and nothing else may create references into
    /// that range.
    pub unsafe fn direct(offset: usize, size: usize) -> Self {
        Self {
            base: NonNull::new(offset as *mut u8).expect("direct map offset must not be null"),
            size,
            backing: Backing::Direct,
        }
    }

    /// Returns the number of bytes of physical memory reachable through this value.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of whole pages reachable through this value.
    pub fn page_count(&self) -> usize {
        self.size / arch::PAGE_SIZE
    }

    /// Returns true if `addr` lies inside this memory.
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_usize() < self.size
    }

    fn check(&self, addr: PhysicalAddress, len: usize) {
        let end = addr.as_usize().checked_add(len);
        assert!(
            end.is_some_and(|end| end <= self.size),
            "physical access {addr:?}+{len:#x} outside of {:#x} bytes",
            self.size
        );
    }

    /// Returns the bytes of the page starting at `page`.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not page aligned or lies outside this memory.
    pub fn page(&self, page: PhysicalAddress) -> &[u8] {
        assert!(page.is_page_aligned(), "page address must be page-aligned");
        self.check(page, arch::PAGE_SIZE);
        // SAFETY: the range was bounds checked and the window is valid per construction.
        unsafe {
            core::slice::from_raw_parts(self.base.as_ptr().add(page.as_usize()), arch::PAGE_SIZE)
        }
    }

    /// Returns the bytes of the page starting at `page`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not page aligned or lies outside this memory.
    pub fn page_mut(&mut self, page: PhysicalAddress) -> &mut [u8] {
        assert!(page.is_page_aligned(), "page address must be page-aligned");
        self.check(page, arch::PAGE_SIZE);
        // SAFETY: as in `page`, and `&mut self` guarantees exclusivity.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.base.as_ptr().add(page.as_usize()),
                arch::PAGE_SIZE,
            )
        }
    }

    /// Fills a whole page with `byte`.
    pub fn fill(&mut self, page: PhysicalAddress, byte: u8) {
        self.page_mut(page).fill(byte);
    }

    /// Copies the contents of page `src` over page `dst`.
    pub fn copy_page(&mut self, src: PhysicalAddress, dst: PhysicalAddress) {
        if src == dst {
            return;
        }
        self.check(src, arch::PAGE_SIZE);
        self.check(dst, arch::PAGE_SIZE);
        assert!(
            src.is_page_aligned() && dst.is_page_aligned(),
            "page address must be page-aligned"
        );
        // SAFETY: both pages are in bounds and distinct, so they do not overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(src.as_usize()),
                self.base.as_ptr().add(dst.as_usize()),
                arch::PAGE_SIZE,
            );
        }
    }

    /// Reads `buf.len()` bytes starting at `addr`. The range may not cross a page.
    pub fn read(&self, addr: PhysicalAddress, buf: &mut [u8]) {
        let offset = addr.page_offset();
        assert!(offset + buf.len() <= arch::PAGE_SIZE, "read crosses a page boundary");
        let page = self.page(addr.align_down(arch::PAGE_SIZE));
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
    }

    /// Writes `bytes` starting at `addr`. The range may not cross a page.
    pub fn write(&mut self, addr: PhysicalAddress, bytes: &[u8]) {
        let offset = addr.page_offset();
        assert!(offset + bytes.len() <= arch::PAGE_SIZE, "write crosses a page boundary");
        let page = self.page_mut(addr.align_down(arch::PAGE_SIZE));
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads entry `index` of the page table stored in page `table`.
    pub fn entry(&self, table: PhysicalAddress, index: usize) -> PageEntry {
        let mut raw = [0u8; 8];
        self.read(table + index * 8, &mut raw);
        PageEntry::from(usize::from_ne_bytes(raw))
    }

    /// Overwrites entry `index` of the page table stored in page `table`.
    pub fn set_entry(&mut self, table: PhysicalAddress, index: usize, entry: PageEntry) {
        assert!(index < arch::ENTRY_COUNT, "page table index out of range");
        self.write(table + index * 8, &entry.as_usize().to_ne_bytes());
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        match self.backing {
            #[cfg(any(test, feature = "software-emulation"))]
            Backing::Emulated(layout) => {
                // SAFETY: `base` came from `alloc_zeroed` with this same layout.
                unsafe { dealloc(self.base.as_ptr(), layout) }
            }
            Backing::Direct => {}
        }
    }
}
