//! The machine and kernel services this subsystem builds on: the boot-time
//! RAM allocator, the TLB primitives, interrupt levels, the current process,
//! and the console. All of them live outside this crate and arrive over the
//! C ABI.

use crate::addrspace::AddressSpace;
use crate::vm::RamInfo;

use shared::memory::layout::VirtualMap;
use shared::memory::tlb::{EntryHi, Tlb, TlbEntry, NUM_TLB};
use shared::memory::{Length, PhysAddress};

extern "C" {
    // Pre-VM physical allocator. Physical addresses are 32-bit words.
    fn ram_getsize() -> u32;
    fn ram_getfirstfree() -> u32;
    fn ram_stealmem(npages: usize) -> u32;

    // TLB primitives, implemented in platform assembly.
    fn tlb_write(entryhi: u32, entrylo: u32, index: u32);
    fn tlb_random(entryhi: u32, entrylo: u32);
    fn tlb_probe(entryhi: u32, entrylo: u32) -> i32;

    // Interrupt priority level.
    fn splhigh() -> u32;
    fn splx(level: u32);

    // Process layer.
    fn proc_getas() -> *const AddressSpace;

    // Console character output.
    fn putch(character: u32);
}

/// The boot allocator's view of RAM, for `vm::bootstrap`.
pub fn ram_info() -> RamInfo {
    // SAFETY: simple queries of the boot allocator's bookkeeping.
    let (size, first_free) = unsafe { (ram_getsize(), ram_getfirstfree()) };
    RamInfo {
        base: VirtualMap::kseg0_base(),
        size: Length::from_raw(size as usize),
        first_free: PhysAddress::from_raw(first_free),
    }
}

/// Takes `npages` permanent pages from the boot allocator. Only usable until
/// the frame table owns RAM.
pub fn steal_pages(npages: usize) -> Option<PhysAddress> {
    // SAFETY: the boot allocator hands out memory nothing else owns.
    let paddr = unsafe { ram_stealmem(npages) };
    if paddr == 0 {
        None
    } else {
        Some(PhysAddress::from_raw(paddr))
    }
}

/// The address space of the current process, if it has one. Kernel-only
/// threads run without.
pub fn current_addrspace() -> Option<&'static AddressSpace> {
    // SAFETY: the process layer keeps the current address space alive for at
    // least the duration of the trap we are handling.
    unsafe { proc_getas().as_ref() }
}

/// Raises the interrupt priority to the maximum for the guard's lifetime.
struct SplGuard {
    saved: u32,
}

impl SplGuard {
    fn raise() -> SplGuard {
        // SAFETY: splhigh/splx nest correctly by saving the prior level.
        SplGuard {
            saved: unsafe { splhigh() },
        }
    }
}

impl Drop for SplGuard {
    fn drop(&mut self) {
        // SAFETY: restores the level saved by `raise`.
        unsafe { splx(self.saved) }
    }
}

/// The hardware TLB. Interrupts are masked for exactly the duration of each
/// operation, so a nested trap never sees a half-written slot.
pub struct MachineTlb;

impl Tlb for MachineTlb {
    fn write_random(&mut self, entry: TlbEntry) {
        let _spl = SplGuard::raise();
        // SAFETY: writing a fully formed entry with interrupts masked.
        unsafe { tlb_random(entry.hi.as_raw(), entry.lo.as_raw()) }
    }

    fn write_indexed(&mut self, slot: usize, entry: TlbEntry) {
        debug_assert!(slot < NUM_TLB);
        let _spl = SplGuard::raise();
        // SAFETY: as for `write_random`; `slot` is in range.
        unsafe { tlb_write(entry.hi.as_raw(), entry.lo.as_raw(), slot as u32) }
    }

    fn probe(&mut self, hi: EntryHi) -> Option<usize> {
        let _spl = SplGuard::raise();
        // SAFETY: tlbp only reads the TLB.
        let index = unsafe { tlb_probe(hi.as_raw(), 0) };
        if index < 0 {
            None
        } else {
            Some(index as usize)
        }
    }

    fn invalidate_all(&mut self) {
        // One raised section for the whole sweep, so no half-flushed TLB is
        // ever visible.
        let _spl = SplGuard::raise();
        for slot in 0..NUM_TLB {
            let entry = TlbEntry::invalid(slot);
            // SAFETY: writing the conventional invalid entry to each slot.
            unsafe { tlb_write(entry.hi.as_raw(), entry.lo.as_raw(), slot as u32) }
        }
    }
}

/// Byte-oriented console, for the logger.
pub struct Console;

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            // SAFETY: putch accepts any byte.
            unsafe { putch(byte as u32) }
        }
        Ok(())
    }
}
