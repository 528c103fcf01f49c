//! Wiring for the VM subsystem: bootstrap and the kernel page API.

pub mod fault;

use core::mem;
use core::slice;

use log::info;
use shared::memory::frame_table::{FrameEntry, FrameTable};
use shared::memory::page_table::{Bucket, HashedPageTable};
use shared::memory::{Length, PhysAddress, VirtAddress, PAGE_SIZE};
use spin::Mutex;

#[cfg(not(test))]
use crate::errno::Errno;
#[cfg(not(test))]
use crate::platform;
#[cfg(not(test))]
use shared::memory::layout;

/// The boot allocator's view of physical memory, captured at bootstrap.
#[derive(Clone, Copy, Debug)]
pub struct RamInfo {
    /// Kernel-virtual address of physical zero (kseg0 on the real machine).
    pub base: VirtAddress,
    /// Total bytes of RAM.
    pub size: Length,
    /// First physical address not used by the kernel image and early
    /// allocations.
    pub first_free: PhysAddress,
}

/// The two process-global structures and their locks.
///
/// Lock ordering: the frame-table lock may be taken while holding the
/// page-table lock (the fault handler does), never the other way around.
pub struct Vm {
    pub(crate) frames: Mutex<FrameTable<'static>>,
    pub(crate) pages: Mutex<HashedPageTable<'static>>,
}

impl Vm {
    /// Carves the frame table and the hashed-page-table bucket array out of
    /// the top of RAM and takes ownership of every remaining frame. Frames
    /// holding the two arrays, and everything below `ram.first_free`, stay
    /// permanently live.
    ///
    /// # Safety
    ///
    /// `ram` must describe a directly addressable RAM region at `ram.base`
    /// that nothing else will touch above `ram.first_free`, and `bootstrap`
    /// must run at most once per region.
    pub unsafe fn bootstrap(ram: RamInfo) -> Vm {
        let page_bytes = PAGE_SIZE.as_raw();
        assert!(ram.base.is_page_aligned());
        let nframes = ram.size.whole_pages();
        assert!(nframes > 0);

        let bucket_count = 2 * nframes;
        let bucket_bytes = bucket_count * mem::size_of::<Bucket>();
        let entry_bytes = nframes * mem::size_of::<FrameEntry>();
        assert!(bucket_bytes + entry_bytes < ram.size.as_raw());

        let align = mem::align_of::<Bucket>().max(mem::align_of::<FrameEntry>());
        let carve_base = (ram.size.as_raw() - bucket_bytes - entry_bytes) & !(align - 1);

        let first_free_frame = (ram.first_free.as_usize() + page_bytes - 1) / page_bytes;
        let first_carved_frame = carve_base / page_bytes;
        assert!(
            first_free_frame <= first_carved_frame,
            "RAM too small for the VM tables"
        );

        let carve_kvaddr = ram.base + Length::from_raw(carve_base);
        let bucket_ptr = carve_kvaddr.as_mut_ptr::<Bucket>();
        // SAFETY: the carved range lies at the top of the RAM region the
        // caller gave us exclusively; it is in bounds, correctly aligned, and
        // initialized element by element before the slices are formed.
        let buckets = unsafe {
            for slot in 0..bucket_count {
                bucket_ptr.add(slot).write(None);
            }
            slice::from_raw_parts_mut(bucket_ptr, bucket_count)
        };

        let entry_ptr = (carve_kvaddr + Length::from_raw(bucket_bytes)).as_mut_ptr::<FrameEntry>();
        // SAFETY: as above; the entry array follows the bucket array inside
        // the carved range.
        let entries = unsafe {
            for index in 0..nframes {
                entry_ptr.add(index).write(FrameEntry::vacant());
            }
            slice::from_raw_parts_mut(entry_ptr, nframes)
        };

        // SAFETY: `ram.base` direct-maps the whole region per the caller's
        // contract; the `live` closure pins the kernel image and the two
        // arrays just carved.
        let frames = unsafe {
            FrameTable::new(ram.base, entries, |index| {
                index < first_free_frame || index >= first_carved_frame
            })
        };

        info!(
            "vm: {} frames of RAM, {} free; tables carved at {:#x}",
            nframes,
            frames.free_frames(),
            carve_base
        );

        Vm {
            frames: Mutex::new(frames),
            pages: Mutex::new(HashedPageTable::new(buckets)),
        }
    }

    /// Allocates one kernel page, contents undefined.
    pub fn alloc_kpage(&self) -> Option<VirtAddress> {
        self.frames.lock().allocate()
    }

    /// Returns a kernel page from [`alloc_kpage`](Self::alloc_kpage), or
    /// drops one reference to a shared frame.
    pub fn free_kpage(&self, addr: VirtAddress) {
        self.frames.lock().free(addr);
    }

    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }
}

#[cfg(not(test))]
static VM: spin::Once<Vm> = spin::Once::new();

/// The VM singleton, available once [`bootstrap`] has run.
#[cfg(not(test))]
pub fn global() -> Option<&'static Vm> {
    VM.get()
}

/// Initializes the VM subsystem from the boot allocator's view of RAM. Must
/// run before the first fault. Everything `ram_stealmem` handed out earlier
/// stays permanently allocated.
#[cfg(not(test))]
pub fn bootstrap() {
    VM.call_once(|| {
        let ram = platform::ram_info();
        // SAFETY: the boot allocator owns all of RAM above `first_free` and
        // `spin::Once` runs this exactly once.
        unsafe { Vm::bootstrap(ram) }
    });
}

/// Allocates `npages` contiguous kernel pages.
///
/// Before bootstrap this steals permanent pages from the boot allocator;
/// afterwards only single-page allocations are supported.
#[cfg(not(test))]
pub fn alloc_kpages(npages: usize) -> Option<VirtAddress> {
    match global() {
        None => Some(layout::paddr_to_kvaddr(platform::steal_pages(npages)?)),
        Some(vm) if npages == 1 => vm.alloc_kpage(),
        Some(_) => None,
    }
}

/// Returns kernel pages. A no-op before bootstrap: stolen pages are
/// permanent.
#[cfg(not(test))]
pub fn free_kpages(addr: VirtAddress) {
    if let Some(vm) = global() {
        vm.free_kpage(addr);
    }
}

/// Entry point from the trap handler.
#[cfg(not(test))]
pub fn page_fault(fault_code: u32, fault_address: VirtAddress) -> Result<(), Errno> {
    let kind = fault::FaultKind::from_code(fault_code).ok_or(Errno::Inval)?;
    let vm = global().ok_or(Errno::Fault)?;
    let space = platform::current_addrspace().ok_or(Errno::Fault)?;
    fault::handle(vm, space, kind, fault_address, &mut platform::MachineTlb)
}

/// TLB shootdown requests cannot happen on this uniprocessor configuration.
pub fn tlb_shootdown() -> ! {
    panic!("TLB shootdown requested on a uniprocessor configuration");
}

#[cfg(test)]
pub(crate) fn test_vm(npages: usize, kernel_pages: usize) -> &'static Vm {
    use shared::testing::FakeRam;

    let ram = FakeRam::leak(npages);
    let info = RamInfo {
        base: ram.base(),
        size: ram.size(),
        first_free: PhysAddress::from_usize(kernel_pages * PAGE_SIZE.as_raw()),
    };
    // SAFETY: the leaked image is exclusively ours and lives forever.
    Box::leak(Box::new(unsafe { Vm::bootstrap(info) }))
}
