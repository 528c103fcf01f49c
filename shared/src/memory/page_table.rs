//! The process-wide hashed page table.
//!
//! One table serves every address space: entries are keyed by the owning
//! space's identity and the virtual page, and chained off a fixed bucket
//! array sized at bootstrap to twice the frame count (so the load factor
//! never exceeds one half).

use super::heap::try_box;
use super::page::{Page, PAGE_BITS};
use super::tlb::{EntryLo, EntryLoFlags};
use crate::memory::addr::PhysAddress;

use alloc::boxed::Box;

/// Stable identity of an address space, used for hashing and entry
/// ownership. Ids are assigned by the address-space layer and never reused.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AsId(u32);

impl AsId {
    pub const fn from_raw(raw: u32) -> AsId {
        AsId(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// A page-table entry: one translation owned by one address space.
#[derive(Debug)]
pub struct Pte {
    owner: AsId,
    page: Page,
    entry_lo: EntryLo,
    next: Option<Box<Pte>>,
}

impl Pte {
    pub fn owner(&self) -> AsId {
        self.owner
    }

    pub fn page(&self) -> Page {
        self.page
    }

    pub fn entry_lo(&self) -> EntryLo {
        self.entry_lo
    }
}

pub type Bucket = Option<Box<Pte>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapError {
    /// No kernel memory for a new entry.
    OutOfMemory,
}

/// The hashed (inverted) page table.
///
/// The bucket array is borrowed storage carved out at bootstrap; the entries
/// themselves come from the kernel heap. Not internally synchronized: callers
/// wrap the table in a lock covering every bucket and every entry link.
pub struct HashedPageTable<'a> {
    buckets: &'a mut [Bucket],
}

impl<'a> HashedPageTable<'a> {
    pub fn new(buckets: &'a mut [Bucket]) -> HashedPageTable<'a> {
        assert!(!buckets.is_empty());
        HashedPageTable { buckets }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    // Hashes against the bucket count captured at construction, which never
    // changes; the table does not resize.
    fn bucket_index(&self, owner: AsId, page: Page) -> usize {
        let hash = owner.as_raw() ^ (page.start().as_raw() >> PAGE_BITS) as u32;
        hash as usize % self.buckets.len()
    }

    /// The translation `owner` holds for `page`, if any.
    pub fn lookup(&self, owner: AsId, page: Page) -> Option<EntryLo> {
        let slot = self.bucket_index(owner, page);
        let mut cursor = self.buckets[slot].as_deref();
        while let Some(pte) = cursor {
            if pte.owner == owner && pte.page == page {
                return Some(pte.entry_lo);
            }
            cursor = pte.next.as_deref();
        }
        None
    }

    /// Mutable access to the `elo` word of an existing entry.
    pub fn entry_lo_mut(&mut self, owner: AsId, page: Page) -> Option<&mut EntryLo> {
        let slot = self.bucket_index(owner, page);
        find_in_chain(self.buckets[slot].as_deref_mut(), owner, page).map(|pte| &mut pte.entry_lo)
    }

    /// Installs a new translation at its bucket head. At most one entry may
    /// exist per `(owner, page)` pair; inserting a duplicate is a caller bug.
    pub fn insert(&mut self, owner: AsId, page: Page, entry_lo: EntryLo) -> Result<(), MapError> {
        debug_assert!(self.lookup(owner, page).is_none());

        let slot = self.bucket_index(owner, page);
        let mut pte = try_box(Pte {
            owner,
            page,
            entry_lo,
            next: None,
        })
        .ok_or(MapError::OutOfMemory)?;
        pte.next = self.buckets[slot].take();
        self.buckets[slot] = Some(pte);
        Ok(())
    }

    /// Gives `new` a sibling of every entry owned by `old`, sharing the same
    /// frame, with the write-enable bit cleared on both sides so the first
    /// store from either space takes a copy-on-write fault.
    ///
    /// `share` is called once per shared frame as the sibling is created. If
    /// a sibling allocation fails, every sibling already created is torn down
    /// again through `unshare` and the table is left with no entries owned by
    /// `new`.
    pub fn duplicate_for(
        &mut self,
        old: AsId,
        new: AsId,
        mut share: impl FnMut(PhysAddress),
        mut unshare: impl FnMut(PhysAddress),
    ) -> Result<usize, MapError> {
        debug_assert_ne!(old, new);

        // Collect the siblings on a private chain first; splicing them into
        // the buckets happens only once nothing can fail.
        let mut pending: Option<Box<Pte>> = None;
        let mut count = 0;
        for bucket in self.buckets.iter_mut() {
            let mut cursor = bucket.as_deref_mut();
            while let Some(pte) = cursor {
                if pte.owner == old {
                    pte.entry_lo.clear_flags(EntryLoFlags::DIRTY);
                    match try_box(Pte {
                        owner: new,
                        page: pte.page,
                        entry_lo: pte.entry_lo,
                        next: None,
                    }) {
                        Some(mut sibling) => {
                            share(sibling.entry_lo.frame_addr());
                            sibling.next = pending.take();
                            pending = Some(sibling);
                            count += 1;
                        }
                        None => {
                            while let Some(mut sibling) = pending.take() {
                                pending = sibling.next.take();
                                unshare(sibling.entry_lo.frame_addr());
                            }
                            return Err(MapError::OutOfMemory);
                        }
                    }
                }
                cursor = pte.next.as_deref_mut();
            }
        }

        while let Some(mut sibling) = pending.take() {
            pending = sibling.next.take();
            let slot = self.bucket_index(sibling.owner, sibling.page);
            sibling.next = self.buckets[slot].take();
            self.buckets[slot] = Some(sibling);
        }

        Ok(count)
    }

    /// Unlinks and frees every entry owned by `owner`, reporting each freed
    /// `elo` (the frame reference travels with it). Returns how many entries
    /// were removed. Entries at a bucket head are unlinked like any other.
    pub fn remove_owner(&mut self, owner: AsId, mut on_remove: impl FnMut(EntryLo)) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.iter_mut() {
            // Drain the chain, relinking the survivors.
            let mut rest = bucket.take();
            while let Some(mut pte) = rest {
                rest = pte.next.take();
                if pte.owner == owner {
                    on_remove(pte.entry_lo);
                    removed += 1;
                } else {
                    pte.next = bucket.take();
                    *bucket = Some(pte);
                }
            }
        }
        removed
    }

    /// Visits every entry in the table, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Pte> {
        self.buckets.iter().flat_map(|bucket| ChainIter {
            cursor: bucket.as_deref(),
        })
    }

    /// Number of entries owned by `owner`.
    pub fn owned_count(&self, owner: AsId) -> usize {
        self.iter().filter(|pte| pte.owner == owner).count()
    }
}

fn find_in_chain(cursor: Option<&mut Pte>, owner: AsId, page: Page) -> Option<&mut Pte> {
    let pte = cursor?;
    if pte.owner == owner && pte.page == page {
        Some(pte)
    } else {
        find_in_chain(pte.next.as_deref_mut(), owner, page)
    }
}

struct ChainIter<'t> {
    cursor: Option<&'t Pte>,
}

impl<'t> Iterator for ChainIter<'t> {
    type Item = &'t Pte;

    fn next(&mut self) -> Option<&'t Pte> {
        let pte = self.cursor?;
        self.cursor = pte.next.as_deref();
        Some(pte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory::addr::VirtAddress;
    use crate::memory::page::Frame;
    use crate::memory::tlb::EntryLoFlags;

    use pretty_assertions::assert_eq;

    fn table(buckets: usize) -> HashedPageTable<'static> {
        let storage = (0..buckets).map(|_| None).collect::<Vec<Bucket>>().leak();
        HashedPageTable::new(storage)
    }

    fn page(addr: usize) -> Page {
        Page::containing(VirtAddress::from_raw(addr))
    }

    fn lo(frame_index: usize, flags: EntryLoFlags) -> EntryLo {
        EntryLo::new(Frame::from_index(frame_index), flags)
    }

    #[test]
    fn lookup_finds_only_the_inserted_pair() {
        let mut table = table(8);
        let owner = AsId::from_raw(1);
        table
            .insert(owner, page(0x40_0000), lo(3, EntryLoFlags::VALID))
            .unwrap();

        assert_eq!(
            table.lookup(owner, page(0x40_0000)),
            Some(lo(3, EntryLoFlags::VALID))
        );
        assert_eq!(table.lookup(owner, page(0x40_1000)), None);
        assert_eq!(table.lookup(AsId::from_raw(2), page(0x40_0000)), None);
    }

    #[test]
    fn same_page_in_two_spaces_coexists() {
        let mut table = table(8);
        let first = AsId::from_raw(1);
        let second = AsId::from_raw(2);
        table
            .insert(first, page(0x40_0000), lo(3, EntryLoFlags::VALID))
            .unwrap();
        table
            .insert(second, page(0x40_0000), lo(4, EntryLoFlags::VALID))
            .unwrap();

        assert_eq!(
            table.lookup(first, page(0x40_0000)),
            Some(lo(3, EntryLoFlags::VALID))
        );
        assert_eq!(
            table.lookup(second, page(0x40_0000)),
            Some(lo(4, EntryLoFlags::VALID))
        );
    }

    #[test]
    fn chains_survive_collisions() {
        // A single bucket forces every entry onto one chain.
        let mut table = table(1);
        let owner = AsId::from_raw(7);
        for index in 0..16 {
            table
                .insert(owner, page(0x40_0000 + (index << PAGE_BITS)), lo(index, EntryLoFlags::VALID))
                .unwrap();
        }

        for index in 0..16 {
            assert_eq!(
                table.lookup(owner, page(0x40_0000 + (index << PAGE_BITS))),
                Some(lo(index, EntryLoFlags::VALID))
            );
        }
    }

    #[test]
    fn entry_lo_mut_updates_in_place() {
        let mut table = table(4);
        let owner = AsId::from_raw(1);
        table
            .insert(owner, page(0x40_0000), lo(3, EntryLoFlags::VALID))
            .unwrap();

        let entry = table.entry_lo_mut(owner, page(0x40_0000)).unwrap();
        *entry = lo(5, EntryLoFlags::VALID | EntryLoFlags::DIRTY);

        assert_eq!(
            table.lookup(owner, page(0x40_0000)),
            Some(lo(5, EntryLoFlags::VALID | EntryLoFlags::DIRTY))
        );
        assert!(table.entry_lo_mut(owner, page(0x41_0000)).is_none());
    }

    #[test]
    fn duplicate_for_shares_frames_and_clears_dirty() {
        let mut table = table(8);
        let parent = AsId::from_raw(1);
        let child = AsId::from_raw(2);
        table
            .insert(
                parent,
                page(0x40_0000),
                lo(3, EntryLoFlags::VALID | EntryLoFlags::DIRTY),
            )
            .unwrap();
        table
            .insert(parent, page(0x40_1000), lo(4, EntryLoFlags::VALID))
            .unwrap();

        let mut shared = std::vec::Vec::new();
        let copied = table
            .duplicate_for(parent, child, |frame| shared.push(frame), |_| {})
            .unwrap();
        assert_eq!(copied, 2);
        assert_eq!(shared.len(), 2);

        for pte_page in [page(0x40_0000), page(0x40_1000)] {
            let parent_lo = table.lookup(parent, pte_page).unwrap();
            let child_lo = table.lookup(child, pte_page).unwrap();
            assert_eq!(parent_lo.frame_addr(), child_lo.frame_addr());
            assert!(!parent_lo.flags().contains(EntryLoFlags::DIRTY));
            assert!(!child_lo.flags().contains(EntryLoFlags::DIRTY));
        }
    }

    #[test]
    fn duplicate_for_skips_other_owners() {
        let mut table = table(8);
        let parent = AsId::from_raw(1);
        let other = AsId::from_raw(9);
        table
            .insert(parent, page(0x40_0000), lo(3, EntryLoFlags::VALID))
            .unwrap();
        table
            .insert(
                other,
                page(0x50_0000),
                lo(4, EntryLoFlags::VALID | EntryLoFlags::DIRTY),
            )
            .unwrap();

        let copied = table
            .duplicate_for(parent, AsId::from_raw(2), |_| {}, |_| {})
            .unwrap();
        assert_eq!(copied, 1);

        // The bystander keeps its write-enable bit.
        assert!(table
            .lookup(other, page(0x50_0000))
            .unwrap()
            .flags()
            .contains(EntryLoFlags::DIRTY));
        assert_eq!(table.owned_count(AsId::from_raw(2)), 1);
    }

    #[test]
    fn remove_owner_unlinks_head_and_interior_entries() {
        // One bucket, so removal exercises head and interior positions.
        let mut table = table(1);
        let doomed = AsId::from_raw(1);
        let survivor = AsId::from_raw(2);
        table
            .insert(doomed, page(0x40_0000), lo(3, EntryLoFlags::VALID))
            .unwrap();
        table
            .insert(survivor, page(0x41_0000), lo(4, EntryLoFlags::VALID))
            .unwrap();
        table
            .insert(doomed, page(0x42_0000), lo(5, EntryLoFlags::VALID))
            .unwrap();

        let mut freed = std::vec::Vec::new();
        let removed = table.remove_owner(doomed, |entry_lo| freed.push(entry_lo.frame_addr()));

        assert_eq!(removed, 2);
        assert_eq!(freed.len(), 2);
        assert!(freed.contains(&Frame::from_index(3).start()));
        assert!(freed.contains(&Frame::from_index(5).start()));

        assert_eq!(table.lookup(doomed, page(0x40_0000)), None);
        assert_eq!(table.lookup(doomed, page(0x42_0000)), None);
        assert_eq!(
            table.lookup(survivor, page(0x41_0000)),
            Some(lo(4, EntryLoFlags::VALID))
        );
        assert_eq!(table.owned_count(doomed), 0);
    }

    #[test]
    fn iter_sees_every_entry_once() {
        let mut table = table(4);
        for raw in 1..=5u32 {
            table
                .insert(
                    AsId::from_raw(raw),
                    page(0x40_0000 + ((raw as usize) << PAGE_BITS)),
                    lo(raw as usize, EntryLoFlags::VALID),
                )
                .unwrap();
        }

        let owners: std::collections::BTreeSet<u32> =
            table.iter().map(|pte| pte.owner().as_raw()).collect();
        assert_eq!(owners, (1..=5).collect());
        assert_eq!(table.iter().count(), 5);
    }

    use proptest::prelude::*;

    proptest! {
        // The hash must stay in bounds and be a pure function of its inputs.
        #[test]
        fn bucket_index_is_stable_and_in_bounds(
            owner in any::<u32>(),
            page_number in 0usize..0x8_0000,
            buckets in 1usize..512,
        ) {
            let table = table(buckets);
            let page = Page::containing(VirtAddress::from_raw(page_number << PAGE_BITS));
            let slot = table.bucket_index(AsId::from_raw(owner), page);
            prop_assert!(slot < buckets);
            prop_assert_eq!(slot, table.bucket_index(AsId::from_raw(owner), page));
        }
    }
}
