//! The TLB-refill and copy-on-write fault handler.

use crate::addrspace::AddressSpace;
use crate::errno::Errno;
use crate::vm::Vm;

use shared::memory::layout::VirtualMap;
use shared::memory::tlb::{EntryHi, EntryLo, EntryLoFlags, Tlb, TlbEntry};
use shared::memory::{Frame, Page, VirtAddress};

/// Trap codes delivered by the exception path.
pub const FAULT_READ: u32 = 0;
pub const FAULT_WRITE: u32 = 1;
pub const FAULT_READONLY: u32 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultKind {
    /// Load through a missing translation.
    Read,
    /// Store through a missing translation.
    Write,
    /// Store through a translation without the write-enable bit: either a
    /// genuine permission violation or a copy-on-write page.
    ReadOnly,
}

impl FaultKind {
    pub fn from_code(code: u32) -> Option<FaultKind> {
        match code {
            FAULT_READ => Some(FaultKind::Read),
            FAULT_WRITE => Some(FaultKind::Write),
            FAULT_READONLY => Some(FaultKind::ReadOnly),
            _ => None,
        }
    }
}

/// Resolves the fault at `addr` for `space` and installs a TLB entry.
///
/// On success the faulting instruction can be restarted. Errors go back to
/// the trap path: `Fault` for illegal accesses, `NoMem` when RAM or kernel
/// memory ran out.
pub fn handle(
    vm: &Vm,
    space: &AddressSpace,
    kind: FaultKind,
    addr: VirtAddress,
    tlb: &mut impl Tlb,
) -> Result<(), Errno> {
    // Kernel segments are not translated; a fault there is never legal user
    // behavior.
    if !VirtualMap::is_user(addr) {
        return Err(Errno::Fault);
    }

    let page = Page::containing(addr);
    match kind {
        FaultKind::ReadOnly => write_to_readonly(vm, space, addr, page, tlb),
        FaultKind::Read | FaultKind::Write => refill(vm, space, addr, page, tlb),
    }
}

/// TLB miss: reinstall an existing translation, or materialize the page on
/// first touch.
fn refill(
    vm: &Vm,
    space: &AddressSpace,
    addr: VirtAddress,
    page: Page,
    tlb: &mut impl Tlb,
) -> Result<(), Errno> {
    let mut pages = vm.pages.lock();
    let entry_lo = match pages.lookup(space.id(), page) {
        Some(entry_lo) => entry_lo,
        None => {
            // The fault address itself must be covered, not just its page.
            let region = space.find_region(addr).ok_or(Errno::Fault)?;

            let mut frames = vm.frames.lock();
            let kvaddr = frames.allocate_zeroed().ok_or(Errno::NoMem)?;
            let frame = frames.frame_of(kvaddr);
            drop(frames);

            let mut flags = EntryLoFlags::VALID;
            if region.writeable() {
                flags |= EntryLoFlags::DIRTY;
            }
            let entry_lo = EntryLo::new(frame, flags);

            // Inserting before the TLB write makes the mapping visible to
            // any concurrent fault on the same page.
            if pages.insert(space.id(), page, entry_lo).is_err() {
                vm.frames.lock().release(frame);
                return Err(Errno::NoMem);
            }
            entry_lo
        }
    };
    drop(pages);

    let effective = entry_lo.with_flags(space.writeable_mask());
    tlb.write_random(TlbEntry {
        hi: EntryHi::from_page(page),
        lo: effective,
    });
    Ok(())
}

/// Store through a write-protected translation: reject it if the region
/// really is read-only, otherwise break the copy-on-write share and
/// re-enable writes.
fn write_to_readonly(
    vm: &Vm,
    space: &AddressSpace,
    addr: VirtAddress,
    page: Page,
    tlb: &mut impl Tlb,
) -> Result<(), Errno> {
    let region = space.find_region(addr).ok_or(Errno::Fault)?;
    if !region.writeable() {
        return Err(Errno::Fault);
    }

    let mut pages = vm.pages.lock();
    let entry_lo = pages.entry_lo_mut(space.id(), page).ok_or(Errno::Fault)?;

    let mut frames = vm.frames.lock();
    let shared_kvaddr = frames.kvaddr(Frame::new(entry_lo.frame_addr()));
    let owned_kvaddr = frames.break_share(shared_kvaddr).ok_or(Errno::NoMem)?;
    let owned = frames.frame_of(owned_kvaddr);
    drop(frames);

    *entry_lo = EntryLo::new(owned, EntryLoFlags::VALID | EntryLoFlags::DIRTY);
    let effective = entry_lo.with_flags(space.writeable_mask());
    drop(pages);

    let hi = EntryHi::from_page(page);
    let entry = TlbEntry { hi, lo: effective };
    // The faulting entry is normally still resident, but it may have been
    // evicted between the trap and here.
    match tlb.probe(hi) {
        Some(slot) => tlb.write_indexed(slot, entry),
        None => tlb.write_random(entry),
    }
    Ok(())
}
