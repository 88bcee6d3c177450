//! The kernel heap: a first-fit free list over one fixed arena.
//!
//! Free blocks are kept in address order with their headers stored in the free memory
//! itself, and neighbours are merged as blocks come back. Every block is a multiple of
//! [`GRANULE`] bytes, so a header always fits in a leftover piece.

use core::{alloc::Layout, ptr::NonNull};

const GRANULE: usize = 16;

struct FreeBlock {
    size: usize,
    next: Option<NonNull<FreeBlock>>,
}

pub struct Heap {
    head: Option<NonNull<FreeBlock>>,
    free: usize,
    initialized: bool,
}

// SAFETY: the free list points only into the arena the heap was given, which it owns.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn empty() -> Self {
        Self {
            head: None,
            free: 0,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Bytes currently available, headers included.
    pub fn free_bytes(&self) -> usize {
        self.free
    }

    /// Hands `[start, start + size)` to the heap.
    ///
    /// # Safety
    ///
    /// The range must be valid for writes, unused by anything else, and outlive the heap.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        let begin = (start as usize).next_multiple_of(GRANULE);
        let end = (start as usize + size) & !(GRANULE - 1);
        if end > begin {
            // SAFETY: the caller gives us the whole range.
            unsafe { self.insert(begin, end - begin) };
        }
        self.initialized = true;
    }

    fn rounded(layout: Layout) -> (usize, usize) {
        let size = layout.size().max(1).next_multiple_of(GRANULE);
        (size, layout.align().max(GRANULE))
    }

    pub fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let (size, align) = Self::rounded(layout);
        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cursor = self.head;

        while let Some(block) = cursor {
            let start = block.as_ptr() as usize;
            // SAFETY: every listed block is a live header inside the arena.
            let (block_size, next) = unsafe { (block.as_ref().size, block.as_ref().next) };
            let end = start + block_size;
            let alloc_start = start.next_multiple_of(align);
            let alloc_end = alloc_start.saturating_add(size);

            if alloc_end <= end {
                self.unlink(prev, next, block_size);
                // SAFETY: both remainders lie inside the block just taken off the list.
                unsafe {
                    if alloc_start > start {
                        self.insert(start, alloc_start - start);
                    }
                    if alloc_end < end {
                        self.insert(alloc_end, end - alloc_end);
                    }
                }
                return NonNull::new(alloc_start as *mut u8);
            }

            prev = cursor;
            cursor = next;
        }
        None
    }

    /// Returns a block obtained from [`Heap::allocate`] with the same layout.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this heap with `layout` and not been freed since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let (size, _) = Self::rounded(layout);
        // SAFETY: the caller returns a block this heap handed out.
        unsafe { self.insert(ptr.as_ptr() as usize, size) };
    }

    fn unlink(
        &mut self,
        prev: Option<NonNull<FreeBlock>>,
        next: Option<NonNull<FreeBlock>>,
        size: usize,
    ) {
        match prev {
            // SAFETY: `prev` is a live header.
            Some(mut prev) => unsafe { prev.as_mut().next = next },
            None => self.head = next,
        }
        self.free -= size;
    }

    /// Links the free range `[addr, addr + size)` in address order and merges it with
    /// adjacent free blocks.
    unsafe fn insert(&mut self, addr: usize, size: usize) {
        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut next = self.head;
        while let Some(block) = next {
            if block.as_ptr() as usize > addr {
                break;
            }
            prev = next;
            // SAFETY: listed blocks are live headers.
            next = unsafe { block.as_ref().next };
        }

        let Some(mut node) = NonNull::new(addr as *mut FreeBlock) else {
            return;
        };
        // SAFETY: the range is free, granule aligned and at least one granule long.
        unsafe {
            node.as_ptr().write(FreeBlock { size, next });
            if let Some(next) = next {
                if addr + size == next.as_ptr() as usize {
                    let merged = next.as_ref();
                    node.as_mut().size += merged.size;
                    node.as_mut().next = merged.next;
                }
            }
            match prev {
                Some(mut prev) if prev.as_ptr() as usize + prev.as_ref().size == addr => {
                    prev.as_mut().size += node.as_ref().size;
                    prev.as_mut().next = node.as_ref().next;
                }
                Some(mut prev) => prev.as_mut().next = Some(node),
                None => self.head = Some(node),
            }
        }
        self.free += size;
    }
}

#[cfg(target_os = "none")]
mod global {
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::{self, NonNull};

    use super::Heap;

    const HEAP_SIZE: usize = 4 * 1024 * 1024;

    #[repr(align(4096))]
    struct Arena([u8; HEAP_SIZE]);

    static mut ARENA: Arena = Arena([0; HEAP_SIZE]);

    #[global_allocator]
    static KERNEL_ALLOCATOR: KernelAllocator = KernelAllocator {
        heap: spin::Mutex::new(Heap::empty()),
    };

    struct KernelAllocator {
        heap: spin::Mutex<Heap>,
    }

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let mut heap = self.heap.lock();
            if !heap.is_initialized() {
                // SAFETY: the arena is used by nothing but this heap.
                unsafe { heap.init((&raw mut ARENA.0).cast(), HEAP_SIZE) };
            }
            heap.allocate(layout)
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if let Some(ptr) = NonNull::new(ptr) {
                // SAFETY: `GlobalAlloc` callers return what `alloc` gave them.
                unsafe { self.heap.lock().deallocate(ptr, layout) };
            }
        }
    }
}
