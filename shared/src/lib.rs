#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod logging;
pub mod memory;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
