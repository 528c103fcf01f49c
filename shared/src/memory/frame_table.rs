//! The system-wide table of physical memory frames.

use super::addr::{Length, PhysAddress, VirtAddress};
use super::page::{Frame, PAGE_SIZE};

use core::ptr;

use static_assertions as sa;

/// Link value terminating the free list.
const NO_FRAME: u32 = u32::MAX;

/// One entry per frame of physical memory. A frame is free exactly when its
/// `ref_count` is zero; `next_free` is meaningful only for free frames.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct FrameEntry {
    ref_count: u16,
    next_free: u32,
}

impl FrameEntry {
    pub const fn vacant() -> FrameEntry {
        FrameEntry {
            ref_count: 0,
            next_free: NO_FRAME,
        }
    }
}

sa::const_assert_eq!(core::mem::size_of::<FrameEntry>(), 8);

/// Owner of every frame of RAM.
///
/// Hands out single kernel pages, tracks per-frame reference counts so frames
/// can be shared copy-on-write across address spaces, and performs the COW
/// break itself. Frames are addressed through the kernel's direct map:
/// `ram_base` is the kernel-virtual address of physical address zero.
///
/// The table is not internally synchronized; callers wrap it in a lock that
/// covers the free list and every reference count.
pub struct FrameTable<'a> {
    ram_base: VirtAddress,
    entries: &'a mut [FrameEntry],
    free_head: u32,
    free_count: usize,
}

impl<'a> FrameTable<'a> {
    /// Builds the table over `entries`, one slot per frame of RAM. Frames for
    /// which `live` returns true receive one permanent reference and are never
    /// handed out; the rest are linked into the free list in ascending
    /// address order.
    ///
    /// # Safety
    ///
    /// `ram_base` must be the kernel-virtual address of physical zero for a
    /// directly addressable RAM region of at least `entries.len()` frames.
    /// Every frame not claimed by `live` must be owned by the new table and
    /// by nothing else.
    pub unsafe fn new(
        ram_base: VirtAddress,
        entries: &'a mut [FrameEntry],
        live: impl Fn(usize) -> bool,
    ) -> FrameTable<'a> {
        let mut free_head = NO_FRAME;
        let mut free_count = 0;
        for index in (0..entries.len()).rev() {
            entries[index] = if live(index) {
                FrameEntry {
                    ref_count: 1,
                    next_free: NO_FRAME,
                }
            } else {
                free_count += 1;
                let entry = FrameEntry {
                    ref_count: 0,
                    next_free: free_head,
                };
                free_head = index as u32;
                entry
            };
        }

        FrameTable {
            ram_base,
            entries,
            free_head,
            free_count,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.entries.len()
    }

    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    pub fn ref_count(&self, frame: Frame) -> usize {
        self.entries[frame.index()].ref_count as usize
    }

    /// Kernel-visible address of `frame`.
    pub fn kvaddr(&self, frame: Frame) -> VirtAddress {
        self.ram_base + Length::from_raw(frame.start().as_usize())
    }

    /// Frame backing a kernel-visible page address.
    ///
    /// # Panics
    ///
    /// Panics if `kvaddr` is not a page-aligned address within this table's
    /// RAM.
    pub fn frame_of(&self, kvaddr: VirtAddress) -> Frame {
        let offset = kvaddr - self.ram_base;
        let frame = Frame::new(PhysAddress::from_usize(offset.as_raw()));
        assert!(frame.index() < self.entries.len());
        frame
    }

    /// Takes one frame off the free list and returns its kernel-visible
    /// address with the contents left as-is. Fails when RAM is exhausted.
    pub fn allocate(&mut self) -> Option<VirtAddress> {
        let index = self.free_head;
        if index == NO_FRAME {
            return None;
        }

        let entry = &mut self.entries[index as usize];
        debug_assert_eq!(entry.ref_count, 0);
        self.free_head = entry.next_free;
        entry.ref_count = 1;
        entry.next_free = NO_FRAME;
        self.free_count -= 1;

        Some(self.kvaddr(Frame::from_index(index as usize)))
    }

    /// Like [`allocate`](Self::allocate), but the page is zero-filled. User
    /// pages must always come from here so old kernel data never leaks.
    pub fn allocate_zeroed(&mut self) -> Option<VirtAddress> {
        let kvaddr = self.allocate()?;
        // SAFETY: `kvaddr` is a page we exclusively own, mapped through the
        // direct map per the constructor contract.
        unsafe {
            ptr::write_bytes(kvaddr.as_mut_ptr::<u8>(), 0, PAGE_SIZE.as_raw());
        }
        Some(kvaddr)
    }

    /// Returns a kernel page previously handed out by [`allocate`]. The frame
    /// goes back on the free list only once every reference is gone.
    ///
    /// [`allocate`]: Self::allocate
    pub fn free(&mut self, kvaddr: VirtAddress) {
        let frame = self.frame_of(kvaddr);
        self.release(frame);
    }

    /// Adds a reference to a live frame. Used when a second page-table entry
    /// starts sharing the frame.
    pub fn retain(&mut self, frame: Frame) {
        let entry = &mut self.entries[frame.index()];
        assert!(entry.ref_count > 0);
        entry.ref_count = entry.ref_count.checked_add(1).unwrap();
    }

    /// Drops a reference to a live frame, freeing it when the count reaches
    /// zero. The page contents are not scrubbed here.
    pub fn release(&mut self, frame: Frame) {
        let index = frame.index();
        let entry = &mut self.entries[index];
        assert!(entry.ref_count > 0);
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            entry.next_free = self.free_head;
            self.free_head = index as u32;
            self.free_count += 1;
        }
    }

    /// Gives the caller a frame it is the sole owner of, for a write to the
    /// page at `kvaddr`.
    ///
    /// If the backing frame has a single reference it is returned unchanged.
    /// Otherwise a fresh frame is allocated, the page contents are copied
    /// into it, and one reference is dropped from the source. Fails (leaving
    /// the source untouched) when no frame is available for the copy.
    pub fn break_share(&mut self, kvaddr: VirtAddress) -> Option<VirtAddress> {
        let source = self.frame_of(kvaddr);
        if self.entries[source.index()].ref_count == 1 {
            return Some(kvaddr);
        }

        let copy_kvaddr = self.allocate()?;
        // SAFETY: the source page is live and the new page is exclusively
        // ours; both are inside the direct-mapped RAM region.
        unsafe {
            ptr::copy_nonoverlapping(
                kvaddr.as_ptr::<u8>(),
                copy_kvaddr.as_mut_ptr::<u8>(),
                PAGE_SIZE.as_raw(),
            );
        }
        self.entries[source.index()].ref_count -= 1;
        Some(copy_kvaddr)
    }

    /// Walks the free list, checking it against the reference counts. Every
    /// frame appears on the list exactly as many times as it is free (zero or
    /// one); the list is NULL-terminated and acyclic.
    ///
    /// Intended for tests and debug assertions; cost is O(frames).
    pub fn check_free_list(&self) -> bool {
        let mut seen = 0usize;
        let mut cursor = self.free_head;
        while cursor != NO_FRAME {
            if seen >= self.entries.len() {
                // Longer than the table: there must be a cycle.
                return false;
            }
            let entry = &self.entries[cursor as usize];
            if entry.ref_count != 0 {
                return false;
            }
            seen += 1;
            cursor = entry.next_free;
        }

        let free_by_count = self
            .entries
            .iter()
            .filter(|entry| entry.ref_count == 0)
            .count();
        seen == free_by_count && seen == self.free_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::FakeRam;

    use std::collections::BTreeSet;
    use std::vec;

    fn table_over(npages: usize, live: impl Fn(usize) -> bool) -> FrameTable<'static> {
        let ram = FakeRam::leak(npages);
        let entries = vec![FrameEntry::vacant(); npages].leak();
        unsafe { FrameTable::new(ram.base(), entries, live) }
    }

    #[test]
    fn allocates_distinct_frames_until_exhaustion() {
        let mut table = table_over(8, |_| false);
        assert_eq!(table.free_frames(), 8);

        let mut seen = BTreeSet::new();
        for _ in 0..8 {
            let kvaddr = table.allocate().unwrap();
            assert!(kvaddr.is_page_aligned());
            assert!(seen.insert(kvaddr));
        }
        assert_eq!(table.allocate(), None);
        assert_eq!(table.free_frames(), 0);
        assert!(table.check_free_list());
    }

    #[test]
    fn live_frames_are_never_handed_out() {
        let mut table = table_over(8, |index| index < 3 || index == 7);
        assert_eq!(table.free_frames(), 4);

        for _ in 0..4 {
            let frame = table.frame_of(table.allocate().unwrap());
            assert!((3..7).contains(&frame.index()));
        }
        assert_eq!(table.allocate(), None);
    }

    #[test]
    fn freed_frame_is_reused() {
        let mut table = table_over(2, |_| false);
        let first = table.allocate().unwrap();
        let _second = table.allocate().unwrap();
        assert_eq!(table.allocate(), None);

        table.free(first);
        assert_eq!(table.allocate(), Some(first));
        assert!(table.check_free_list());
    }

    #[test]
    fn allocate_zeroed_scrubs_previous_contents() {
        let mut table = table_over(1, |_| false);
        let kvaddr = table.allocate_zeroed().unwrap();
        unsafe {
            ptr::write_bytes(kvaddr.as_mut_ptr::<u8>(), 0xa5, PAGE_SIZE.as_raw());
        }
        table.free(kvaddr);

        let again = table.allocate_zeroed().unwrap();
        assert_eq!(again, kvaddr);
        let bytes = unsafe { core::slice::from_raw_parts(again.as_ptr::<u8>(), PAGE_SIZE.as_raw()) };
        assert!(bytes.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn retained_frame_survives_one_release() {
        let mut table = table_over(2, |_| false);
        let kvaddr = table.allocate().unwrap();
        let frame = table.frame_of(kvaddr);

        table.retain(frame);
        assert_eq!(table.ref_count(frame), 2);

        table.release(frame);
        assert_eq!(table.ref_count(frame), 1);
        assert_eq!(table.free_frames(), 1);

        table.release(frame);
        assert_eq!(table.ref_count(frame), 0);
        assert_eq!(table.free_frames(), 2);
        assert!(table.check_free_list());
    }

    #[test]
    fn break_share_with_sole_owner_is_a_no_op() {
        let mut table = table_over(2, |_| false);
        let kvaddr = table.allocate().unwrap();
        let frame = table.frame_of(kvaddr);

        assert_eq!(table.break_share(kvaddr), Some(kvaddr));
        assert_eq!(table.ref_count(frame), 1);
        assert_eq!(table.free_frames(), 1);
    }

    #[test]
    fn break_share_copies_and_splits_ownership() {
        let mut table = table_over(2, |_| false);
        let shared = table.allocate().unwrap();
        let source = table.frame_of(shared);
        table.retain(source);

        unsafe {
            ptr::write_bytes(shared.as_mut_ptr::<u8>(), 0x5a, PAGE_SIZE.as_raw());
        }

        let private = table.break_share(shared).unwrap();
        assert_ne!(private, shared);
        assert_eq!(table.ref_count(source), 1);
        assert_eq!(table.ref_count(table.frame_of(private)), 1);

        let old = unsafe { core::slice::from_raw_parts(shared.as_ptr::<u8>(), PAGE_SIZE.as_raw()) };
        let new = unsafe { core::slice::from_raw_parts(private.as_ptr::<u8>(), PAGE_SIZE.as_raw()) };
        assert_eq!(old, new);
    }

    #[test]
    fn break_share_fails_cleanly_without_spare_frames() {
        let mut table = table_over(1, |_| false);
        let shared = table.allocate().unwrap();
        let source = table.frame_of(shared);
        table.retain(source);

        assert_eq!(table.break_share(shared), None);
        assert_eq!(table.ref_count(source), 2);
    }

    #[test]
    fn frame_of_round_trips() {
        let table = table_over(4, |_| false);
        let frame = Frame::from_index(2);
        assert_eq!(table.frame_of(table.kvaddr(frame)), frame);
    }

    use proptest::prelude::*;

    proptest! {
        // Random interleavings of allocate/free keep the free list and the
        // reference counts consistent with each other.
        #[test]
        fn free_list_stays_consistent(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut table = table_over(8, |_| false);
            let mut held = std::vec::Vec::new();

            for should_allocate in ops {
                if should_allocate {
                    if let Some(kvaddr) = table.allocate() {
                        held.push(kvaddr);
                    }
                } else if let Some(kvaddr) = held.pop() {
                    table.free(kvaddr);
                }

                prop_assert!(table.check_free_list());
                prop_assert_eq!(table.free_frames(), 8 - held.len());
            }
        }
    }
}
