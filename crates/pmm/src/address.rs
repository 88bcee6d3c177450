//! Address types for physical and virtual memory management.
//!
//! This module provides distinct wrappers around physical and virtual addresses so
//! that one kind can never be passed where the other is expected.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }

            /// Returns true if the address is page aligned.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses name bytes of RAM or device memory. They are only\n\
     dereferenced through [`crate::PhysicalMemory`]."
);

impl PhysicalAddress {
    /// The null physical address. Page 0 is never handed out by the allocator.
    pub const NULL: Self = Self(0);

    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns true for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / arch::PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Virtual addresses are interpreted through a page table. They provide\n\
     methods for alignment checks and extracting page table indices."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates a virtual address, returning `None` if it is not canonical.
    ///
    /// Used for addresses supplied by user code.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the page table index at the specified level.
    ///
    /// Page table levels are numbered from 0 (the lowest level, closest to the page)
    /// upward.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Gets the corresponding page number for this virtual address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / arch::PAGE_SIZE)
    }
}
