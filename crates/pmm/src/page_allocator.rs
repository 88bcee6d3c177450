//! Reference-counted physical page allocator.
//!
//! Every physical page in the managed window has a [`Frame`] record. A page is handed out
//! only when it is not reserved and nothing refers to it. Pages are found by stepping a
//! rotating cursor with a fixed stride so that consecutive allocations are scattered
//! rather than packed at the lowest free address.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;
use core::ops::Range;

use crate::{Frame, FrameNumber, PhysicalAddress, PhysicalMemory, arch};

/// Byte written over every freshly allocated page (`int3` on x86).
pub const SENTINEL: u8 = 0xCC;

/// Number of pages the allocation cursor advances between candidates.
pub const ALLOCATION_STRIDE: usize = 3;

/// Errors that can occur during physical memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free page was left in the managed window.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => f.write_str("out of physical memory"),
        }
    }
}

impl core::error::Error for AllocError {}

/// One counted reference to an allocated physical page.
///
/// Returned by [`PageAllocator::allocate`] and [`PageAllocator::retain`]. The reference must
/// either be given back with [`PageAllocator::release`] or handed over to a page table
/// mapping with [`PhysicalPage::into_address`].
#[must_use = "dropping a PhysicalPage leaks its reference"]
#[derive(Debug, PartialEq, Eq)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalPage {
    /// Returns the physical address of the first byte of the page.
    pub fn start(&self) -> PhysicalAddress {
        self.0
    }

    /// Gives up the handle. The reference now belongs to whatever stores the address.
    pub fn into_address(self) -> PhysicalAddress {
        self.0
    }
}

/// Owns physical memory and the reference counts of every page in it.
pub struct PageAllocator {
    memory: PhysicalMemory,
    frames: Box<[Frame]>,
    cursor: usize,
}

impl PageAllocator {
    /// Creates an allocator managing every page of `memory`.
    ///
    /// Page 0 and every page overlapping one of `reserved` are never allocated.
    pub fn new(memory: PhysicalMemory, reserved: &[Range<PhysicalAddress>]) -> Self {
        let count = memory.page_count();
        Self::with_managed_pages(memory, count, reserved)
    }

    /// Creates an allocator managing the first `count` pages of `memory`.
    ///
    /// Memory beyond those pages stays reachable through [`PageAllocator::memory`] but is
    /// never handed out.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the size of `memory`, or if it shares a factor with
    /// [`ALLOCATION_STRIDE`], since one sweep of the cursor would then miss pages.
    pub fn with_managed_pages(
        memory: PhysicalMemory,
        count: usize,
        reserved: &[Range<PhysicalAddress>],
    ) -> Self {
        assert!(count <= memory.page_count(), "managed pages exceed physical memory");
        assert!(
            count % ALLOCATION_STRIDE != 0,
            "managed page count must be coprime with the allocation stride"
        );

        let mut allocator = Self {
            memory,
            frames: vec![Frame::default(); count].into_boxed_slice(),
            cursor: 0,
        };
        allocator.frames[0] = Frame::RESERVED;
        for range in reserved {
            allocator.reserve(range.clone());
        }

        log::debug!(
            "page allocator: {} pages managed, {} allocatable",
            count,
            allocator.allocatable_count()
        );
        allocator
    }

    /// Excludes every page overlapping `range` from allocation.
    ///
    /// Pages outside the managed window are ignored.
    pub fn reserve(&mut self, range: Range<PhysicalAddress>) {
        if range.start >= range.end {
            return;
        }
        let first = range.start.frame_number().as_usize();
        let last = range.end.align_up(arch::PAGE_SIZE).frame_number().as_usize();
        for frame in self.frames.iter_mut().take(last).skip(first) {
            frame.reserve();
        }
    }

    /// Allocates one page, filled with [`SENTINEL`].
    ///
    /// Returns `None` when no free page is left.
    pub fn allocate(&mut self) -> Option<PhysicalPage> {
        let count = self.frames.len();
        for _ in 0..count {
            let index = self.cursor;
            self.cursor = (self.cursor + ALLOCATION_STRIDE) % count;

            if self.frames[index].is_free() {
                self.frames[index].claim();
                let page = FrameNumber::new(index).start();
                self.memory.fill(page, SENTINEL);
                return Some(PhysicalPage(page));
            }
        }

        None
    }

    /// Allocates a page able to hold `size` bytes.
    ///
    /// Requests larger than one page always fail.
    pub fn allocate_bytes(&mut self, size: usize) -> Option<PhysicalPage> {
        if size > arch::PAGE_SIZE {
            return None;
        }
        self.allocate()
    }

    /// Allocates a page and clears it.
    pub fn allocate_zeroed(&mut self) -> Result<PhysicalPage, AllocError> {
        let page = self.allocate().ok_or(AllocError::OutOfMemory)?;
        self.memory.fill(page.start(), 0);
        Ok(page)
    }

    /// Takes another reference to an already allocated page.
    ///
    /// Returns `None` if `addr` does not name an allocated page.
    pub fn retain(&mut self, addr: PhysicalAddress) -> Option<PhysicalPage> {
        let frame = self.frame_mut(addr)?;
        if frame.refcount() == 0 {
            return None;
        }
        frame.retain();
        Some(PhysicalPage(addr))
    }

    /// Drops one reference to the page at `addr`.
    ///
    /// Null, out-of-range, misaligned, reserved and already free addresses are ignored.
    pub fn free(&mut self, addr: PhysicalAddress) {
        if addr.is_null() {
            return;
        }
        if let Some(frame) = self.frame_mut(addr) {
            frame.release();
        }
    }

    /// Gives back a counted reference.
    pub fn release(&mut self, page: PhysicalPage) {
        self.free(page.into_address());
    }

    fn frame_mut(&mut self, addr: PhysicalAddress) -> Option<&mut Frame> {
        if !addr.is_page_aligned() {
            return None;
        }
        self.frames
            .get_mut(addr.frame_number().as_usize())
            .filter(|frame| !frame.is_reserved())
    }

    /// Returns the frame record for the page containing `addr`.
    pub fn frame(&self, addr: PhysicalAddress) -> Option<&Frame> {
        self.frames.get(addr.frame_number().as_usize())
    }

    /// Returns the reference count of the page containing `addr`, or 0 outside the window.
    pub fn refcount(&self, addr: PhysicalAddress) -> u16 {
        self.frame(addr).map_or(0, Frame::refcount)
    }

    /// Returns true if the page containing `addr` is managed and not reserved.
    pub fn is_allocatable(&self, addr: PhysicalAddress) -> bool {
        self.frame(addr).is_some_and(|frame| !frame.is_reserved())
    }

    /// Iterates over every frame record in page order.
    pub fn frames(&self) -> impl Iterator<Item = (PhysicalAddress, &Frame)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(index, frame)| (FrameNumber::new(index).start(), frame))
    }

    /// Returns the number of pages that could currently be allocated.
    pub fn free_count(&self) -> usize {
        self.frames.iter().filter(|frame| frame.is_free()).count()
    }

    /// Returns the number of pages that are not reserved.
    pub fn allocatable_count(&self) -> usize {
        self.frames.iter().filter(|frame| !frame.is_reserved()).count()
    }

    /// Returns the managed physical memory.
    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Returns the managed physical memory, mutably.
    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }
}
