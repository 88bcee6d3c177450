//! Page table entry flags for x86_64 architecture.

use core::fmt;

use ::x86_64::structures::paging::PageTableFlags;

/// Page table entry flags for x86_64.
///
/// This wraps the x86_64 crate's page table entry flags and exposes only the
/// permission bits the kernel reasons about: present, writable and user.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl From<usize> for PageFlags {
    fn from(value: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(value as u64))
    }
}

impl PageFlags {
    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Present, writable, kernel-only.
    pub const fn kernel_rw() -> Self {
        Self(PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE))
    }

    /// Present and user-accessible, read-only.
    pub const fn user_ro() -> Self {
        Self(PageTableFlags::PRESENT.union(PageTableFlags::USER_ACCESSIBLE))
    }

    /// Present, writable and user-accessible.
    pub const fn user_rw() -> Self {
        Self(
            PageTableFlags::PRESENT
                .union(PageTableFlags::WRITABLE)
                .union(PageTableFlags::USER_ACCESSIBLE),
        )
    }

    /// Returns the raw usize value of these flags.
    pub const fn as_usize(self) -> usize {
        self.0.bits() as usize
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    /// Returns a copy with the writable bit set to `writable`.
    pub fn with_writable(mut self, writable: bool) -> Self {
        self.set_writable(writable);
        self
    }

    /// Returns a copy with the user bit set to `user`.
    pub fn with_user(mut self, user: bool) -> Self {
        self.set_user(user);
        self
    }

    /// Returns whether a huge page is mapped by this entry.
    pub fn is_huge(self) -> bool {
        self.0.contains(PageTableFlags::HUGE_PAGE)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "PageFlags({}{}{})",
            bit(self.is_present(), 'P'),
            bit(self.is_writable(), 'W'),
            bit(self.is_user(), 'U')
        )
    }
}
