//! R3000-class TLB entry layout and the interface to the software-loaded TLB.

use super::addr::PhysAddress;
use super::page::{Frame, Page, PAGE_BITS};

use static_assertions as sa;

/// Number of TLB slots.
pub const NUM_TLB: usize = 64;

/// Mask selecting the frame/page number bits of a TLB entry word.
pub const ENTRY_PAGE_MASK: u32 = 0xffff_f000;

bitflags::bitflags! {
    /// Control bits in the low half of a TLB entry. Note that on this machine
    /// `DIRTY` is the write-enable bit, not a modification bit: a store
    /// through an entry without it traps.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct EntryLoFlags: u32 {
        const GLOBAL = 0x100;
        const VALID = 0x200;
        const DIRTY = 0x400;
        const NOCACHE = 0x800;
    }
}

/// High half of a TLB entry: the virtual page number. The ASID field is
/// unused; the whole TLB is flushed on address-space switch instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryHi(u32);

impl EntryHi {
    pub fn from_page(page: Page) -> EntryHi {
        let raw = page.start().as_raw();
        debug_assert!(raw <= ENTRY_PAGE_MASK as usize);
        EntryHi(raw as u32 & ENTRY_PAGE_MASK)
    }

    /// The conventional per-slot invalid tag: a direct-mapped kernel address,
    /// which is never subject to translation and so never matches.
    pub const fn invalid(slot: usize) -> EntryHi {
        EntryHi(0x8000_0000 + ((slot as u32) << PAGE_BITS))
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Low half of a TLB entry: physical frame number plus control bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryLo(u32);

impl EntryLo {
    pub fn new(frame: Frame, flags: EntryLoFlags) -> EntryLo {
        EntryLo((frame.start().as_u32() & ENTRY_PAGE_MASK) | flags.bits())
    }

    pub const fn invalid() -> EntryLo {
        EntryLo(0)
    }

    /// Physical address of the mapped frame.
    pub fn frame_addr(self) -> PhysAddress {
        PhysAddress::from_raw(self.0 & ENTRY_PAGE_MASK)
    }

    pub fn flags(self) -> EntryLoFlags {
        EntryLoFlags::from_bits_truncate(self.0)
    }

    /// The same entry with `extra` control bits OR'd in.
    pub fn with_flags(self, extra: EntryLoFlags) -> EntryLo {
        EntryLo(self.0 | extra.bits())
    }

    pub fn clear_flags(&mut self, flags: EntryLoFlags) {
        self.0 &= !flags.bits();
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

sa::assert_eq_size!(EntryHi, u32);
sa::assert_eq_size!(EntryLo, u32);

/// A full TLB entry as written to a slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TlbEntry {
    pub hi: EntryHi,
    pub lo: EntryLo,
}

impl TlbEntry {
    pub const fn invalid(slot: usize) -> TlbEntry {
        TlbEntry {
            hi: EntryHi::invalid(slot),
            lo: EntryLo::invalid(),
        }
    }
}

/// The software-loaded TLB. Implementations are responsible for masking
/// interrupts across each operation so a trap never observes a half-written
/// slot.
pub trait Tlb {
    /// Write `entry` to a hardware-chosen slot.
    fn write_random(&mut self, entry: TlbEntry);

    /// Write `entry` to `slot`.
    fn write_indexed(&mut self, slot: usize, entry: TlbEntry);

    /// Slot currently holding a translation for `hi`, if any.
    fn probe(&mut self, hi: EntryHi) -> Option<usize>;

    /// Invalidate every slot.
    fn invalidate_all(&mut self);
}
