//! Per-process address spaces built over the physical page allocator.
//!
//! Every address space maps the kernel region (below [`PROC_START_ADDR`]) exactly like the
//! kernel's own table but kernel-only, except for the console page which user code may
//! write. Pages at or above [`PROC_START_ADDR`] belong to the process and are reference
//! counted: each present user leaf holds one reference to the page it maps.

use pmm::{
    AllocError, Mapping, PAGE_SIZE, PageAllocator, PageFlags, PageTable, PhysicalMemory,
    PhysicalPage, VirtualAddress,
};
use thiserror::Error;

use crate::{
    interrupts::PageFaultError,
    layout::{CONSOLE_ADDR, MEMSIZE_VIRTUAL, PROC_START_ADDR, STACK_PAGE, is_user_page},
    program::ProgramImage,
};

/// A user access that the page table does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("user {} at {va:#x}: {}", .error.operation(), .error.problem())]
pub struct UserAccess {
    /// The address as the process supplied it, which need not be canonical.
    pub va: u64,
    pub error: PageFaultError,
}

/// Errors from loading a program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),
    #[error("segment at {0} leaves user memory")]
    SegmentOutOfRange(VirtualAddress),
    #[error("segment at {0} has more initialized data than its size")]
    SegmentTooLarge(VirtualAddress),
}

/// The page table of one process and the user pages it references.
pub struct AddressSpace {
    table: PageTable,
}

impl AddressSpace {
    /// Builds an address space holding only the kernel-region mappings of `kernel`.
    pub fn new(pages: &mut PageAllocator, kernel: &PageTable) -> Result<Self, AllocError> {
        let mut table = PageTable::new(pages)?;
        table.share_kernel_half(pages.memory_mut(), kernel.root());

        let mut walk = kernel.walk(VirtualAddress::new(0)..PROC_START_ADDR);
        while let Some(mapping) = walk.next_mapping(pages.memory()) {
            let flags = mapping.flags.with_user(mapping.va == CONSOLE_ADDR);
            if let Err(err) = table.map(pages, mapping.va, mapping.pa, flags) {
                table.free(pages);
                return Err(err);
            }
        }

        Ok(Self { table })
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// Finds the mapping for `va`.
    pub fn lookup(&self, memory: &PhysicalMemory, va: VirtualAddress) -> Option<Mapping> {
        self.table.lookup(memory, va)
    }

    /// Maps `page` at `va`, handing its reference to the new leaf.
    ///
    /// Returns the mapping that was replaced, whose reference now belongs to the caller.
    fn install(
        &mut self,
        pages: &mut PageAllocator,
        va: VirtualAddress,
        page: PhysicalPage,
        flags: PageFlags,
    ) -> Result<Option<Mapping>, AllocError> {
        let previous = self.table.lookup(pages.memory(), va);
        match self.table.map(pages, va, page.start(), flags) {
            Ok(()) => {
                let _ = page.into_address();
                Ok(previous)
            }
            Err(err) => {
                pages.release(page);
                Err(err)
            }
        }
    }

    /// Loads every segment of `image` and a one-page stack. Returns the initial stack
    /// pointer.
    pub fn load_segments(
        &mut self,
        pages: &mut PageAllocator,
        image: &ProgramImage<'_>,
    ) -> Result<VirtualAddress, LoadError> {
        for segment in &image.segments {
            let end = match segment.end() {
                Some(end) if segment.va >= PROC_START_ADDR && end <= STACK_PAGE.as_usize() => end,
                _ => return Err(LoadError::SegmentOutOfRange(segment.va)),
            };
            if segment.data.len() > segment.size {
                return Err(LoadError::SegmentTooLarge(segment.va));
            }

            let flags = PageFlags::user_ro().with_writable(segment.writable);
            let mut va = segment.va.align_down(PAGE_SIZE);
            while va.as_usize() < end {
                match self.table.lookup(pages.memory(), va) {
                    // Shared with an earlier segment; widen its permission if needed.
                    Some(existing) => {
                        if segment.writable && !existing.is_writable() {
                            self.table.map(pages, va, existing.pa, flags)?;
                        }
                    }
                    None => {
                        let page = pages.allocate_zeroed()?;
                        self.install(pages, va, page, flags)?;
                    }
                }
                va = va + PAGE_SIZE;
            }

            self.copy_in(pages.memory_mut(), segment.va, segment.data);
        }

        let stack = pages.allocate_zeroed()?;
        self.install(pages, STACK_PAGE, stack, PageFlags::user_rw())?;
        log::trace!("loaded {} segments, entry {}", image.segments.len(), image.entry);
        Ok(MEMSIZE_VIRTUAL)
    }

    /// Copies `bytes` to `va` through this table, ignoring user permissions.
    fn copy_in(&self, memory: &mut PhysicalMemory, va: VirtualAddress, bytes: &[u8]) {
        for (chunk_va, chunk) in chunks(va, bytes.len()) {
            if let Some(pa) = self.table.translate(memory, chunk_va) {
                memory.write(pa, &bytes[chunk]);
            }
        }
    }

    /// Replaces whatever is mapped at `va` with a fresh zeroed user page.
    ///
    /// On failure the address space is unchanged.
    pub fn allocate_page(
        &mut self,
        pages: &mut PageAllocator,
        va: VirtualAddress,
    ) -> Result<(), AllocError> {
        let page = pages.allocate_zeroed()?;
        if let Some(previous) = self.install(pages, va, page, PageFlags::user_rw())? {
            if previous.is_user() {
                pages.free(previous.pa);
            }
        }
        Ok(())
    }

    /// Builds a copy of this address space for a forked child.
    ///
    /// Writable user pages are copied. Read-only user pages are shared and gain one
    /// reference. On failure everything built so far is released.
    pub fn duplicate(
        &self,
        pages: &mut PageAllocator,
        kernel: &PageTable,
    ) -> Result<AddressSpace, AllocError> {
        let mut child = AddressSpace::new(pages, kernel)?;
        match child.copy_user_pages(pages, self) {
            Ok(()) => Ok(child),
            Err(err) => {
                child.destroy(pages);
                Err(err)
            }
        }
    }

    fn copy_user_pages(
        &mut self,
        pages: &mut PageAllocator,
        parent: &AddressSpace,
    ) -> Result<(), AllocError> {
        let mut walk = parent.table.walk(PROC_START_ADDR..MEMSIZE_VIRTUAL);
        while let Some(mapping) = walk.next_mapping(pages.memory()) {
            if !mapping.is_user() || !is_user_page(mapping.va) {
                continue;
            }

            let page = if mapping.is_writable() {
                let copy = pages.allocate().ok_or(AllocError::OutOfMemory)?;
                pages.memory_mut().copy_page(mapping.pa, copy.start());
                copy
            } else {
                match pages.retain(mapping.pa) {
                    Some(shared) => shared,
                    None => {
                        log::warn!("user page {} at {} is not allocated", mapping.pa, mapping.va);
                        continue;
                    }
                }
            };
            self.install(pages, mapping.va, page, mapping.flags)?;
        }
        Ok(())
    }

    /// Drops the reference of every user page, then frees the table itself.
    pub fn destroy(self, pages: &mut PageAllocator) {
        let mut walk = self.table.walk(PROC_START_ADDR..MEMSIZE_VIRTUAL);
        while let Some(mapping) = walk.next_mapping(pages.memory()) {
            if mapping.is_user() && is_user_page(mapping.va) {
                pages.free(mapping.pa);
            }
        }
        self.table.free(pages);
    }

    /// Copies `buf.len()` bytes from `va` with user-mode permission checks.
    pub fn read(
        &self,
        memory: &PhysicalMemory,
        va: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), UserAccess> {
        for (chunk_va, chunk) in chunks(va, buf.len()) {
            let pa = self.check(memory, chunk_va, false)?;
            memory.read(pa, &mut buf[chunk]);
        }
        Ok(())
    }

    /// Copies `bytes` to `va` with user-mode permission checks.
    pub fn write(
        &self,
        memory: &mut PhysicalMemory,
        va: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), UserAccess> {
        for (chunk_va, chunk) in chunks(va, bytes.len()) {
            let pa = self.check(memory, chunk_va, true)?;
            memory.write(pa, &bytes[chunk]);
        }
        Ok(())
    }

    fn check(
        &self,
        memory: &PhysicalMemory,
        va: VirtualAddress,
        write: bool,
    ) -> Result<pmm::PhysicalAddress, UserAccess> {
        let error = PageFaultError::new().with_user(true).with_write(write);
        let Some(mapping) = self.table.lookup(memory, va) else {
            return Err(UserAccess {
                va: va.as_usize() as u64,
                error,
            });
        };
        if !mapping.is_user() || (write && !mapping.is_writable()) {
            return Err(UserAccess {
                va: va.as_usize() as u64,
                error: error.with_present(true),
            });
        }
        Ok(mapping.pa + va.page_offset())
    }
}

/// Splits `len` bytes starting at `va` into page-bounded pieces.
fn chunks(
    va: VirtualAddress,
    len: usize,
) -> impl Iterator<Item = (VirtualAddress, core::ops::Range<usize>)> {
    let mut done = 0;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let at = va + done;
        let take = (PAGE_SIZE - at.page_offset()).min(len - done);
        let range = done..done + take;
        done += take;
        Some((at, range))
    })
}
