//! Data structures representing pages and frames

use super::addr::{PhysAddress, VirtAddress};

pub use super::addr::{PAGE_BITS, PAGE_SIZE};

/// A 4 KiB physical memory frame
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    start: PhysAddress,
}

impl Frame {
    /// Creates a `Frame` representing the frame beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_page_aligned());
        Frame { start }
    }

    /// Gets the `Frame` that contains `addr`.
    pub fn containing(addr: PhysAddress) -> Frame {
        Frame {
            start: addr.page_base(),
        }
    }

    /// The `index`th frame of physical memory.
    ///
    /// # Panics
    ///
    /// Panics if the frame would lie beyond the machine's 32-bit physical
    /// address space.
    pub fn from_index(index: usize) -> Frame {
        Frame {
            start: PhysAddress::from_usize(index << PAGE_BITS),
        }
    }

    /// Start address of the frame
    pub fn start(self) -> PhysAddress {
        self.start
    }

    /// Position of this frame in a table indexed by `paddr / PAGE_SIZE`
    pub fn index(self) -> usize {
        self.start.as_usize() >> PAGE_BITS
    }
}

/// A 4 KiB virtual memory page
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Page {
    start: VirtAddress,
}

impl Page {
    /// Creates a `Page` representing the page beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: VirtAddress) -> Page {
        assert!(start.is_page_aligned());
        Page { start }
    }

    /// Gets the `Page` that contains `addr`.
    pub fn containing(addr: VirtAddress) -> Page {
        Page {
            start: addr.page_base(),
        }
    }

    /// Start address of the page
    pub fn start(self) -> VirtAddress {
        self.start
    }

    /// Virtual page number
    pub fn number(self) -> usize {
        self.start.as_raw() >> PAGE_BITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_index() {
        let frame = Frame::new(PhysAddress::from_raw(0x3000));
        assert_eq!(frame.index(), 3);
        assert_eq!(Frame::from_index(3), frame);
    }

    #[test]
    fn containing_masks_low_bits() {
        assert_eq!(
            Page::containing(VirtAddress::from_raw(0x4567_89ab)).start(),
            VirtAddress::from_raw(0x4567_8000)
        );
        assert_eq!(
            Frame::containing(PhysAddress::from_raw(0xfff)).start(),
            PhysAddress::from_raw(0)
        );
    }

    #[test]
    #[should_panic]
    fn unaligned_page_panics() {
        Page::new(VirtAddress::from_raw(0x123));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic(expected = "not a physical address")]
    fn frames_beyond_physical_memory_panic() {
        Frame::from_index(1 << 20);
    }
}
