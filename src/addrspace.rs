//! Per-process address spaces.
//!
//! An address space is little more than an identity, a region table, and a
//! couple of loader-related bits; the actual translations live in the global
//! hashed page table keyed by the space's id.

use crate::errno::Errno;
use crate::vm::Vm;

use core::sync::atomic::{AtomicU32, Ordering};

use log::trace;
use shared::memory::layout::USERSTACK;
use shared::memory::page_table::AsId;
use shared::memory::region::{Region, RegionTable};
use shared::memory::tlb::{EntryLoFlags, Tlb};
use shared::memory::{Frame, Length, VirtAddress, PAGE_SIZE};

/// Size of the initial user stack region.
pub const STACK_PAGES: usize = 16;

static NEXT_AS_ID: AtomicU32 = AtomicU32::new(1);

fn next_as_id() -> AsId {
    // Ids are never reused; a stale id in the page table could otherwise
    // alias a new space's translations.
    AsId::from_raw(NEXT_AS_ID.fetch_add(1, Ordering::Relaxed))
}

/// One process's view of memory.
pub struct AddressSpace {
    id: AsId,
    regions: RegionTable,
    /// Reserved for a user heap; no operation populates it yet.
    heap: Option<Region>,
    /// OR'd into every installed TLB entry while a program image is being
    /// loaded, so the loader can write into read-only segments.
    writeable_mask: EntryLoFlags,
    stack_base: VirtAddress,
}

impl AddressSpace {
    /// A new, empty address space with a fresh identity.
    pub fn new() -> AddressSpace {
        AddressSpace {
            id: next_as_id(),
            regions: RegionTable::new(),
            heap: None,
            writeable_mask: EntryLoFlags::empty(),
            stack_base: VirtAddress::zero(),
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn writeable_mask(&self) -> EntryLoFlags {
        self.writeable_mask
    }

    pub fn stack_base(&self) -> VirtAddress {
        self.stack_base
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// First region containing `addr`, if any.
    pub fn find_region(&self, addr: VirtAddress) -> Option<&Region> {
        self.regions.find(addr)
    }

    /// Defines the segment `[vbase, vbase + size)`.
    ///
    /// Read and execute permissions are accepted but not enforced; only the
    /// writeable bit is recorded. A region with no permissions at all is
    /// silently dropped — the call succeeds and no region is created.
    pub fn define_region(
        &mut self,
        vbase: VirtAddress,
        size: Length,
        readable: bool,
        writeable: bool,
        executable: bool,
    ) -> Result<(), Errno> {
        if !(readable || writeable || executable) {
            return Ok(());
        }

        self.regions
            .define(Region::new(vbase, size, writeable))
            .map_err(|_| Errno::NoMem)
    }

    /// Installs the 16-page user stack ending at `USERSTACK` and returns the
    /// initial stack pointer.
    pub fn define_stack(&mut self) -> Result<VirtAddress, Errno> {
        let base = USERSTACK - PAGE_SIZE * STACK_PAGES;
        self.define_region(base, PAGE_SIZE * STACK_PAGES, true, true, false)?;
        self.stack_base = base;
        Ok(USERSTACK)
    }

    /// Opens the load window: until [`complete_load`](Self::complete_load),
    /// every TLB entry installed for this space is write-enabled regardless
    /// of region permissions, without marking the pages writeable in their
    /// page-table entries.
    pub fn prepare_load(&mut self, tlb: &mut impl Tlb) {
        self.writeable_mask = EntryLoFlags::DIRTY;
        tlb.invalidate_all();
    }

    /// Closes the load window opened by [`prepare_load`](Self::prepare_load).
    pub fn complete_load(&mut self, tlb: &mut impl Tlb) {
        self.writeable_mask = EntryLoFlags::empty();
        tlb.invalidate_all();
    }

    /// Makes this space's translations current by flushing the whole TLB;
    /// entries are reloaded by faults as they are touched.
    pub fn activate(&self, tlb: &mut impl Tlb) {
        tlb.invalidate_all();
    }

    /// Called when the current thread stops running in this space. Flushes
    /// like [`activate`](Self::activate); the TLB holds no space tag that
    /// could be kept.
    pub fn deactivate(&self, tlb: &mut impl Tlb) {
        tlb.invalidate_all();
    }
}

impl Default for AddressSpace {
    fn default() -> AddressSpace {
        AddressSpace::new()
    }
}

impl Vm {
    /// Deep-copies `old` for a fork: the child gets its own regions and its
    /// own page-table entries, but every entry shares the parent's frame with
    /// the write-enable bit cleared on both sides. The first store from
    /// either space then takes a read-only fault and unshares the frame.
    ///
    /// The caller flushes the TLB (via activate) before running either space,
    /// so no stale write-enabled entry survives.
    pub fn copy_addrspace(&self, old: &AddressSpace) -> Result<AddressSpace, Errno> {
        let new_space = AddressSpace {
            id: next_as_id(),
            regions: old.regions.clone(),
            heap: old.heap,
            writeable_mask: EntryLoFlags::empty(),
            stack_base: old.stack_base,
        };

        let shared = self
            .pages
            .lock()
            .duplicate_for(
                old.id,
                new_space.id,
                |frame_addr| self.frames.lock().retain(Frame::new(frame_addr)),
                |frame_addr| self.frames.lock().release(Frame::new(frame_addr)),
            )
            .map_err(|_| Errno::NoMem)?;

        trace!(
            "as {} forked to {}: {} shared pages",
            old.id.as_raw(),
            new_space.id.as_raw(),
            shared
        );
        Ok(new_space)
    }

    /// Tears down `space`: every page-table entry it owns is removed and its
    /// frame reference dropped (frames shared with other spaces survive).
    pub fn destroy_addrspace(&self, space: AddressSpace) {
        let mut pages = self.pages.lock();
        let removed = pages.remove_owner(space.id, |entry_lo| {
            self.frames.lock().release(Frame::new(entry_lo.frame_addr()));
        });
        trace!("as {} destroyed: {} pages released", space.id.as_raw(), removed);
    }
}
