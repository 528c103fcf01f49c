//! Global allocator: kernel metadata lives in single pages from the VM.

use crate::vm;

use core::alloc::{GlobalAlloc, Layout};

use once_cell::unsync::OnceCell;
use shared::memory::heap::{KernelHeap, PageProvider};
use shared::memory::VirtAddress;
use spin::Mutex;

/// Feeds the heap from the kernel page allocator. Before `vm::bootstrap` the
/// pages come from the boot allocator and are permanent.
struct KernelPages;

// SAFETY: `alloc_kpages(1)` returns exclusively owned, page-aligned,
// direct-mapped pages; `free_kpages` accepts exactly those.
unsafe impl PageProvider for KernelPages {
    fn take_page(&mut self) -> Option<VirtAddress> {
        vm::alloc_kpages(1)
    }

    fn return_page(&mut self, page: VirtAddress) {
        vm::free_kpages(page);
    }
}

static HEAP: Mutex<OnceCell<KernelHeap<KernelPages>>> = Mutex::new(OnceCell::new());

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = HEAP.lock();
        guard.get_or_init(|| KernelHeap::new(KernelPages));
        guard.get_mut().unwrap().allocate(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut guard = HEAP.lock();
        guard.get_or_init(|| KernelHeap::new(KernelPages));
        // SAFETY: forwarded from the global-allocator contract.
        unsafe {
            guard.get_mut().unwrap().deallocate(ptr, layout);
        }
    }
}

#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
