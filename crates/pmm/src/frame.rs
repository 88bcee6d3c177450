//! Per-frame bookkeeping for the physical page allocator.

/// Holds metadata for one physical memory frame.
///
/// A frame is either reserved (page 0, kernel image, device memory, or firmware-owned),
/// in which case it is never handed out and its count is meaningless, or it is
/// allocatable and its count says how many live mappings refer to it. Counts are only
/// changed by [`crate::PageAllocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    refcount: u16,
    reserved: bool,
}

impl Frame {
    /// A frame that may never be allocated.
    pub(crate) const RESERVED: Self = Self {
        refcount: 0,
        reserved: true,
    };

    /// Returns the number of live references to this frame.
    pub fn refcount(&self) -> u16 {
        self.refcount
    }

    /// Returns true if this frame is excluded from allocation.
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// Returns true if this frame can be handed out right now.
    pub fn is_free(&self) -> bool {
        !self.reserved && self.refcount == 0
    }

    pub(crate) fn reserve(&mut self) {
        self.reserved = true;
        self.refcount = 0;
    }

    pub(crate) fn claim(&mut self) {
        debug_assert!(self.is_free());
        self.refcount = 1;
    }

    pub(crate) fn retain(&mut self) {
        self.refcount = self
            .refcount
            .checked_add(1)
            .expect("frame reference count overflow");
    }

    /// Drops one reference. Returns false if there was nothing to drop.
    pub(crate) fn release(&mut self) -> bool {
        match self.refcount.checked_sub(1) {
            Some(count) => {
                self.refcount = count;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_is_free() {
        let frame = Frame::default();
        assert!(frame.is_free());
        assert_eq!(frame.refcount(), 0);
    }

    #[test]
    fn release_stops_at_zero() {
        let mut frame = Frame::default();
        frame.claim();
        frame.retain();
        assert_eq!(frame.refcount(), 2);
        assert!(frame.release());
        assert!(frame.release());
        assert!(!frame.release());
        assert_eq!(frame.refcount(), 0);
    }

    #[test]
    fn reserved_frame_is_never_free() {
        let mut frame = Frame::default();
        frame.reserve();
        assert!(!frame.is_free());
        assert_eq!(Frame::RESERVED, frame);
    }
}
