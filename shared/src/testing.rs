//! Test doubles for the machine: a RAM image and a software TLB.

use crate::memory::addr::{Length, VirtAddress};
use crate::memory::page::PAGE_SIZE;
use crate::memory::tlb::{EntryHi, EntryLo, Tlb, TlbEntry, NUM_TLB};

use alloc::vec;

/// Slots below this are never chosen by `write_random`, mirroring the
/// hardware's wired range.
const RANDOM_FLOOR: usize = 8;

/// A leaked, page-aligned block of host memory standing in for physical RAM.
/// Physical address zero corresponds to `base()`.
pub struct FakeRam {
    base: VirtAddress,
    size: Length,
}

impl FakeRam {
    /// Leaks `npages` pages of zeroed backing memory. Leaking keeps the
    /// image alive for structures that expect `'static` RAM.
    pub fn leak(npages: usize) -> FakeRam {
        let backing = vec![0u8; (npages + 1) * PAGE_SIZE.as_raw()].leak();
        let base = VirtAddress::from_ptr(backing.as_ptr()).page_ceil();
        FakeRam {
            base,
            size: PAGE_SIZE * npages,
        }
    }

    /// Kernel-visible address of physical zero.
    pub fn base(&self) -> VirtAddress {
        self.base
    }

    pub fn size(&self) -> Length {
        self.size
    }
}

/// Software model of the TLB: 64 slots, a round-robin stand-in for the
/// hardware's random register, and probe by `EntryHi` match.
pub struct TestTlb {
    entries: [TlbEntry; NUM_TLB],
    cursor: usize,
    /// Number of `invalidate_all` calls observed.
    pub flushes: usize,
}

impl TestTlb {
    pub fn new() -> TestTlb {
        TestTlb {
            entries: core::array::from_fn(TlbEntry::invalid),
            cursor: RANDOM_FLOOR,
            flushes: 0,
        }
    }

    /// The `elo` currently installed for `hi`, if any.
    pub fn entry_for(&self, hi: EntryHi) -> Option<EntryLo> {
        self.entries
            .iter()
            .find(|entry| entry.hi == hi)
            .map(|entry| entry.lo)
    }

    pub fn slot(&self, index: usize) -> TlbEntry {
        self.entries[index]
    }
}

impl Default for TestTlb {
    fn default() -> TestTlb {
        TestTlb::new()
    }
}

impl Tlb for TestTlb {
    fn write_random(&mut self, entry: TlbEntry) {
        self.entries[self.cursor] = entry;
        self.cursor = RANDOM_FLOOR + (self.cursor - RANDOM_FLOOR + 1) % (NUM_TLB - RANDOM_FLOOR);
    }

    fn write_indexed(&mut self, slot: usize, entry: TlbEntry) {
        self.entries[slot] = entry;
    }

    fn probe(&mut self, hi: EntryHi) -> Option<usize> {
        self.entries.iter().position(|entry| entry.hi == hi)
    }

    fn invalidate_all(&mut self) {
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            *entry = TlbEntry::invalid(slot);
        }
        self.flushes += 1;
    }
}
