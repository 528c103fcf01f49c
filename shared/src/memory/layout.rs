//! The machine's virtual address map.

use super::addr::{PhysAddress, VirtAddress};

/// The fixed carve-up of the virtual address space. User programs live in the
/// low half; the kernel runs out of the direct-mapped segment above it.
pub struct VirtualMap;

impl VirtualMap {
    /// First address past user space (kuseg), exclusive.
    pub const fn user_top() -> VirtAddress {
        VirtAddress::from_raw(0x8000_0000)
    }

    /// Base of the direct-mapped, cached kernel segment (kseg0). Physical
    /// address zero appears here.
    pub const fn kseg0_base() -> VirtAddress {
        VirtAddress::from_raw(0x8000_0000)
    }

    pub fn is_user(addr: VirtAddress) -> bool {
        addr < Self::user_top()
    }
}

/// Initial user stack pointer: the very top of user space. The stack grows
/// down from here.
pub const USERSTACK: VirtAddress = VirtualMap::user_top();

/// Kernel-visible address of a physical address, through the kseg0 direct
/// map. Only meaningful on the target machine; hosted tests use a
/// `FakeRam` base instead.
pub const fn paddr_to_kvaddr(paddr: PhysAddress) -> VirtAddress {
    VirtAddress::from_raw(VirtualMap::kseg0_base().as_raw() + paddr.as_usize())
}
