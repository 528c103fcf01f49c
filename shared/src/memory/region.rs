//! Address-space regions: the spans of user memory a process may touch.

use super::addr::{Length, VirtAddress};

use arrayvec::ArrayVec;

/// Upper bound on regions per address space. Programs carry a handful (text,
/// data, stack, perhaps a heap); definition past the bound fails like any
/// other allocation failure.
pub const MAX_REGIONS: usize = 16;

/// A contiguous span `[start, start + size)` of user address space and its
/// write permission. Read and execute permissions are accepted at definition
/// but not enforced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    start: VirtAddress,
    size: Length,
    writeable: bool,
}

impl Region {
    pub fn new(start: VirtAddress, size: Length, writeable: bool) -> Region {
        Region {
            start,
            size,
            writeable,
        }
    }

    pub fn start(&self) -> VirtAddress {
        self.start
    }

    pub fn size(&self) -> Length {
        self.size
    }

    pub fn writeable(&self) -> bool {
        self.writeable
    }

    pub fn contains(&self, addr: VirtAddress) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionTableFull;

/// The ordered set of regions belonging to one address space. Lookup is a
/// linear scan returning the first match; regions defined by the loader are
/// disjoint, so order does not affect the result.
#[derive(Clone, Debug, Default)]
pub struct RegionTable {
    regions: ArrayVec<Region, MAX_REGIONS>,
}

impl RegionTable {
    pub fn new() -> RegionTable {
        RegionTable {
            regions: ArrayVec::new(),
        }
    }

    pub fn define(&mut self, region: Region) -> Result<(), RegionTableFull> {
        self.regions.try_push(region).map_err(|_| RegionTableFull)
    }

    /// First region containing `addr`.
    pub fn find(&self, addr: VirtAddress) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, size: usize, writeable: bool) -> Region {
        Region::new(
            VirtAddress::from_raw(start),
            Length::from_raw(size),
            writeable,
        )
    }

    #[test]
    fn contains_is_half_open() {
        let r = region(0x40_0000, 0x1000, false);
        assert!(!r.contains(VirtAddress::from_raw(0x3f_ffff)));
        assert!(r.contains(VirtAddress::from_raw(0x40_0000)));
        assert!(r.contains(VirtAddress::from_raw(0x40_0fff)));
        assert!(!r.contains(VirtAddress::from_raw(0x40_1000)));
    }

    #[test]
    fn find_returns_the_covering_region() {
        let mut table = RegionTable::new();
        table.define(region(0x40_0000, 0x1000, false)).unwrap();
        table.define(region(0x50_0000, 0x2000, true)).unwrap();

        let hit = table.find(VirtAddress::from_raw(0x50_1234)).unwrap();
        assert_eq!(hit.start(), VirtAddress::from_raw(0x50_0000));
        assert!(hit.writeable());

        assert!(table.find(VirtAddress::from_raw(0x60_0000)).is_none());
    }

    #[test]
    fn definition_fails_past_capacity() {
        let mut table = RegionTable::new();
        for index in 0..MAX_REGIONS {
            table
                .define(region(0x40_0000 + index * 0x1000, 0x1000, false))
                .unwrap();
        }
        assert_eq!(
            table.define(region(0x70_0000, 0x1000, false)),
            Err(RegionTableFull)
        );
        assert_eq!(table.len(), MAX_REGIONS);
    }
}
