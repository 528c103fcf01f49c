//! Virtual-memory subsystem for a MIPS-class machine with a software-managed
//! TLB.
//!
//! Address translation is a pure software affair here: on a TLB miss the CPU
//! traps into [`vm::page_fault`], which consults the faulting process's
//! address space, the global hashed page table, and the frame table, then
//! writes a TLB entry and returns. Forked address spaces share frames
//! copy-on-write; the write-enable ("dirty") TLB bit and the read-only fault
//! path do the unsharing.
//!
//! The hardware-independent mechanisms live in the `shared` crate and are
//! tested on the host; this crate supplies the policy and the glue to the
//! platform (boot RAM allocator, TLB primitives, interrupt levels, current
//! process, console).

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addrspace;
pub mod errno;
pub mod vm;

#[cfg(not(test))]
mod kheap;
#[cfg(not(test))]
pub mod logging;
#[cfg(not(test))]
pub mod platform;
