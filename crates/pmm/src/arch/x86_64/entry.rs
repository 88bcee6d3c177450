//! Page table entry for x86_64 architecture.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single page table entry for x86_64.
///
/// On x86_64, page table entries are 64-bit values containing a physical address
/// and various flags. This type provides low-level manipulation of these entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// Physical address mask for x86_64 page table entries.
    /// Bits 12-51 contain the physical address (assuming 52-bit physical addresses).
    const ADDRESS_MASK: usize = 0x000F_FFFF_FFFF_F000;

    /// Flag bits mask (bits 0-11 and 52-63).
    const FLAGS_MASK: usize = !Self::ADDRESS_MASK;

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned (lowest 12 bits must be zero).
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );

        let addr_bits = address.as_usize() & Self::ADDRESS_MASK;
        let flag_bits = flags.as_usize() & Self::FLAGS_MASK;
        Self(addr_bits | flag_bits)
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from(self.0 & Self::FLAGS_MASK)
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns whether this entry maps a 2 MiB or 1 GiB page instead of a table.
    pub fn is_huge(self) -> bool {
        self.is_present() && self.flags().is_huge()
    }

    /// Returns the raw usize value of this entry.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for PageEntry {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keeps_address_and_flags_apart() {
        let entry = PageEntry::new(PhysicalAddress::new(0x12_3000), PageFlags::user_rw());
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x12_3000)));
        assert!(entry.flags().is_writable());
        assert!(entry.flags().is_user());
    }

    #[test]
    fn non_present_entry_has_no_address() {
        let entry = PageEntry::new(PhysicalAddress::new(0x5000), PageFlags::empty());
        assert_eq!(entry.address(), None);
        assert_eq!(PageEntry::default().address(), None);
    }
}
