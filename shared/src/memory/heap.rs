//! A small-object allocator for kernel metadata.
//!
//! Page-table entries and other kernel records are far smaller than a frame,
//! so they are carved out of single pages handed over by a [`PageProvider`].
//! Allocations are grouped into a few power-of-two block sizes, each with its
//! own intrusive free list. Anything larger than the biggest block gets a
//! whole page; multi-page allocations are not supported once the VM owns RAM.

use super::addr::{Length, VirtAddress};
use super::page::PAGE_SIZE;

use core::alloc::Layout;
use core::ptr;

use alloc::boxed::Box;
use intrusive_collections::{
    intrusive_adapter, SinglyLinkedList, SinglyLinkedListAtomicLink, UnsafeRef,
};
use log::trace;
use num_traits::{FromPrimitive, ToPrimitive};
use static_assertions::const_assert;

/// Sources page-sized chunks of kernel-virtual memory for the heap.
///
/// # Safety
///
/// `take_page` must hand over exclusively owned, page-aligned, directly
/// addressable memory of `PAGE_SIZE` bytes; `return_page` gets back only
/// addresses obtained from `take_page`.
pub unsafe trait PageProvider {
    fn take_page(&mut self) -> Option<VirtAddress>;
    fn return_page(&mut self, page: VirtAddress);
}

const BLOCK_SIZES: [usize; 5] = [16, 32, 64, 128, 256];

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
)]
#[repr(usize)]
enum SizeClass {
    Size16 = 0,
    Size32 = 1,
    Size64 = 2,
    Size128 = 3,
    Size256 = 4,
}

impl SizeClass {
    /// Smallest class able to satisfy `layout`, or `None` when the request
    /// needs a whole page (or more).
    fn of(layout: Layout) -> Option<SizeClass> {
        let needed = core::cmp::max(layout.size(), layout.align());
        let index = BLOCK_SIZES.iter().position(|&bytes| bytes >= needed)?;
        SizeClass::from_usize(index)
    }

    const fn bytes(self) -> usize {
        BLOCK_SIZES[self as usize]
    }
}

struct FreeBlock {
    link: SinglyLinkedListAtomicLink,
}

intrusive_adapter!(FreeAdapter = UnsafeRef<FreeBlock>: FreeBlock { link: SinglyLinkedListAtomicLink });

// A free block header must fit inside the smallest block.
const_assert!(core::mem::size_of::<FreeBlock>() <= BLOCK_SIZES[0]);
const_assert!(PAGE_SIZE.as_raw() % BLOCK_SIZES[BLOCK_SIZES.len() - 1] == 0);

/// Size-class allocator over single pages.
pub struct KernelHeap<P> {
    free: [SinglyLinkedList<FreeAdapter>; BLOCK_SIZES.len()],
    provider: P,
}

impl<P: PageProvider> KernelHeap<P> {
    pub fn new(provider: P) -> KernelHeap<P> {
        KernelHeap {
            free: core::array::from_fn(|_| SinglyLinkedList::new(FreeAdapter::new())),
            provider,
        }
    }

    /// Allocates per `layout`, returning null on exhaustion or for multi-page
    /// requests.
    pub fn allocate(&mut self, layout: Layout) -> *mut u8 {
        match SizeClass::of(layout) {
            Some(class) => self.allocate_block(class),
            None if layout.size() <= PAGE_SIZE.as_raw() && layout.align() <= PAGE_SIZE.as_raw() => {
                self.provider
                    .take_page()
                    .map_or(ptr::null_mut(), |page| page.as_mut_ptr())
            }
            None => ptr::null_mut(),
        }
    }

    /// Returns an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// heap with the same `layout`, and not deallocated since.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        match SizeClass::of(layout) {
            Some(class) => {
                let block = ptr as *mut FreeBlock;
                // SAFETY: the block was handed out for this class, so it is
                // big enough and aligned for a free header, and ours again.
                unsafe {
                    block.write(FreeBlock {
                        link: SinglyLinkedListAtomicLink::new(),
                    });
                    self.free[class.to_usize().unwrap()].push_front(UnsafeRef::from_raw(block));
                }
            }
            None => self.provider.return_page(VirtAddress::from_ptr(ptr)),
        }
    }

    fn allocate_block(&mut self, class: SizeClass) -> *mut u8 {
        let index = class.to_usize().unwrap();
        if self.free[index].is_empty() && !self.refill(class) {
            return ptr::null_mut();
        }

        let block = self.free[index].pop_front().unwrap();
        UnsafeRef::into_raw(block) as *mut u8
    }

    /// Splits one fresh page into blocks of `class`.
    fn refill(&mut self, class: SizeClass) -> bool {
        let Some(page) = self.provider.take_page() else {
            return false;
        };
        debug_assert!(page.is_page_aligned());

        let bytes = class.bytes();
        let list = &mut self.free[class.to_usize().unwrap()];
        for offset in (0..PAGE_SIZE.as_raw()).step_by(bytes) {
            let block = (page + Length::from_raw(offset)).as_mut_ptr::<FreeBlock>();
            // SAFETY: every offset lies within the page we exclusively own,
            // and block starts are aligned to the (power-of-two) class size.
            unsafe {
                block.write(FreeBlock {
                    link: SinglyLinkedListAtomicLink::new(),
                });
                list.push_front(UnsafeRef::from_raw(block));
            }
        }

        trace!(
            "refilled {}-byte block list from page {:#x}",
            bytes,
            page.as_raw()
        );
        true
    }
}

/// Fallible boxing: `Box::new` that reports allocator exhaustion instead of
/// aborting, so callers can surface an out-of-memory error.
pub fn try_box<T>(value: T) -> Option<Box<T>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Some(Box::new(value));
    }

    // SAFETY: `layout` has non-zero size.
    let raw = unsafe { alloc::alloc::alloc(layout) };
    if raw.is_null() {
        return None;
    }

    let ptr = raw.cast::<T>();
    // SAFETY: `ptr` was just allocated with `T`'s layout; ownership moves to
    // the box.
    unsafe {
        ptr.write(value);
        Some(Box::from_raw(ptr))
    }
}
