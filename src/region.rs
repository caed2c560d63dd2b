//! # SRAM Partition
//!
//! The 28 KiB task arena is carved into five MPU regions of eight subregions
//! each. Subregions are numbered 0–39 in region order, so one bit per
//! subregion fits a 40-bit mask.
//!
//! ```text
//!   0x2000_1000  R0  8 × 512 B   subregions  0..8
//!   0x2000_2000  R1  8 × 1024 B  subregions  8..16
//!   0x2000_4000  R2  8 × 512 B   subregions 16..24
//!   0x2000_5000  R3  8 × 512 B   subregions 24..32
//!   0x2000_6000  R4  8 × 1024 B  subregions 32..40
//!   0x2000_8000  (top of SRAM)
//! ```
//!
//! The same numbering is used twice: the allocator's occupancy set (bit set =
//! in use) and a task's [`ProtectionMask`] (bit set = subregion disabled,
//! i.e. no access). Both are built from [`SubregionSet`].

use core::ops::Range;

use crate::config::SRAM_HEAP_BASE;

/// Number of subregions the MPU divides every region into.
pub const SUBREGIONS_PER_REGION: usize = 8;

/// Number of MPU regions covering the arena.
pub const REGION_COUNT: usize = 5;

/// Total number of subregions across all regions.
pub const SUBREGION_COUNT: usize = SUBREGIONS_PER_REGION * REGION_COUNT;

/// One MPU region of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Address of the first byte.
    pub base: u32,
    /// Size of each of its subregions in bytes.
    pub subregion_size: u32,
}

impl Region {
    /// Region size in bytes.
    pub const fn size(&self) -> u32 {
        self.subregion_size * SUBREGIONS_PER_REGION as u32
    }

    /// Whether `address` falls inside this region.
    pub const fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.base + self.size()
    }
}

/// The arena layout, in subregion-index order.
pub const SRAM_REGIONS: [Region; REGION_COUNT] = [
    Region { base: SRAM_HEAP_BASE, subregion_size: 512 },
    Region { base: SRAM_HEAP_BASE + 0x1000, subregion_size: 1024 },
    Region { base: SRAM_HEAP_BASE + 0x3000, subregion_size: 512 },
    Region { base: SRAM_HEAP_BASE + 0x4000, subregion_size: 512 },
    Region { base: SRAM_HEAP_BASE + 0x5000, subregion_size: 1024 },
];

/// Index of the region holding subregion `index`.
#[inline]
pub const fn region_of(index: usize) -> usize {
    index / SUBREGIONS_PER_REGION
}

/// Subregion indices belonging to region `region`.
#[inline]
pub const fn subregions_of(region: usize) -> Range<usize> {
    let start = region * SUBREGIONS_PER_REGION;
    start..start + SUBREGIONS_PER_REGION
}

/// Size in bytes of subregion `index`.
#[inline]
pub const fn subregion_size(index: usize) -> u32 {
    SRAM_REGIONS[region_of(index)].subregion_size
}

/// Base address of subregion `index`, or `None` past the end of the arena.
pub const fn subregion_to_address(index: usize) -> Option<u32> {
    if index >= SUBREGION_COUNT {
        return None;
    }
    let region = SRAM_REGIONS[region_of(index)];
    let offset = (index % SUBREGIONS_PER_REGION) as u32;
    Some(region.base + offset * region.subregion_size)
}

/// Subregion containing `address`, or `None` outside the arena.
pub fn address_to_subregion(address: u32) -> Option<usize> {
    SRAM_REGIONS
        .iter()
        .position(|r| r.contains(address))
        .map(|region| {
            let r = SRAM_REGIONS[region];
            region * SUBREGIONS_PER_REGION + ((address - r.base) / r.subregion_size) as usize
        })
}

/// Minimal set of subregions covering `[base, base + size)`.
///
/// Walks forward from the subregion holding `base`, adding whole subregions
/// (of whatever size each region uses) until `size` bytes are covered. Does
/// not look at occupancy. Returns an empty set for an address outside the
/// arena or a zero size; a range running off the end of the arena is clipped.
pub fn window_for(base: u32, size: u32) -> SubregionSet {
    let mut set = SubregionSet::EMPTY;
    let Some(start) = address_to_subregion(base) else {
        return set;
    };

    let mut covered = 0u32;
    let mut index = start;
    while covered < size && index < SUBREGION_COUNT {
        set.insert(index);
        covered += subregion_size(index);
        index += 1;
    }
    set
}

// ---------------------------------------------------------------------------
// Subregion bit-set
// ---------------------------------------------------------------------------

/// A set of subregion indices, one bit per subregion.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SubregionSet(u64);

impl SubregionSet {
    pub const EMPTY: Self = Self(0);

    /// Every subregion of the arena.
    pub const FULL: Self = Self((1u64 << SUBREGION_COUNT) - 1);

    /// Build a set from raw bits. Bits above [`SUBREGION_COUNT`] are dropped.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & Self::FULL.0)
    }

    /// The contiguous run `start..start + len`.
    pub fn run(start: usize, len: usize) -> Self {
        let mut set = Self::EMPTY;
        set.claim(start, len);
        set
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn contains(self, index: usize) -> bool {
        index < SUBREGION_COUNT && self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, index: usize) {
        debug_assert!(index < SUBREGION_COUNT);
        self.0 |= 1 << index;
    }

    pub fn remove(&mut self, index: usize) {
        self.0 &= !(1 << index);
    }

    /// Add the run `start..start + len`.
    pub fn claim(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.insert(index);
        }
    }

    /// Remove the run `start..start + len`.
    pub fn release(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.remove(index);
        }
    }

    /// True when none of `start..start + len` is in the set and the whole run
    /// lies inside the arena.
    pub fn is_free_run(self, start: usize, len: usize) -> bool {
        start + len <= SUBREGION_COUNT && (start..start + len).all(|i| !self.contains(i))
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterate over member indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..SUBREGION_COUNT).filter(move |&i| self.contains(i))
    }
}

impl core::fmt::Debug for SubregionSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SubregionSet({:#012x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Protection mask
// ---------------------------------------------------------------------------

/// MPU subregion-disable bits for one task.
///
/// A set bit disables the subregion for unprivileged code; a cleared bit
/// grants access. [`ProtectionMask::NO_ACCESS`] is therefore all ones.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtectionMask(SubregionSet);

impl ProtectionMask {
    /// Every subregion disabled.
    pub const NO_ACCESS: Self = Self(SubregionSet::FULL);

    /// Grant access to every subregion in `window`.
    pub fn allow(&mut self, window: SubregionSet) {
        self.0 = self.0.difference(window);
    }

    /// Whether the task may touch subregion `index`.
    pub const fn allows(self, index: usize) -> bool {
        index < SUBREGION_COUNT && !self.0.contains(index)
    }

    /// Subregions this mask grants.
    pub const fn granted(self) -> SubregionSet {
        SubregionSet::FULL.difference(self.0)
    }

    /// Raw 40-bit SRD mask.
    pub const fn bits(self) -> u64 {
        self.0.bits()
    }

    /// The eight SRD bits of `region`, as written into the region's
    /// attribute register.
    pub const fn srd_bits(self, region: usize) -> u8 {
        (self.0.bits() >> (region * SUBREGIONS_PER_REGION)) as u8
    }
}

impl Default for ProtectionMask {
    fn default() -> Self {
        Self::NO_ACCESS
    }
}

impl core::fmt::Debug for ProtectionMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ProtectionMask({:#012x})", self.bits())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_spans_28k() {
        let total: u32 = SRAM_REGIONS.iter().map(Region::size).sum();
        assert_eq!(total, 28 * 1024);
        assert_eq!(SRAM_REGIONS[4].base + SRAM_REGIONS[4].size(), crate::config::SRAM_TOP);
    }

    #[test]
    fn test_address_subregion_round_trip() {
        for index in 0..SUBREGION_COUNT {
            let address = subregion_to_address(index).unwrap();
            assert_eq!(address_to_subregion(address), Some(index));
            // last byte of the subregion maps back too
            let last = address + subregion_size(index) - 1;
            assert_eq!(address_to_subregion(last), Some(index));
        }
        assert_eq!(subregion_to_address(SUBREGION_COUNT), None);
    }

    #[test]
    fn test_addresses_outside_arena() {
        assert_eq!(address_to_subregion(0x2000_0FFF), None);
        assert_eq!(address_to_subregion(0x2000_8000), None);
    }

    #[test]
    fn test_known_subregion_addresses() {
        assert_eq!(subregion_to_address(7), Some(0x2000_1E00));
        assert_eq!(subregion_to_address(8), Some(0x2000_2000));
        assert_eq!(subregion_to_address(15), Some(0x2000_3C00));
        assert_eq!(subregion_to_address(16), Some(0x2000_4000));
        assert_eq!(subregion_to_address(31), Some(0x2000_5E00));
        assert_eq!(subregion_to_address(39), Some(0x2000_7C00));
    }

    #[test]
    fn test_window_covers_whole_subregions() {
        // 600 bytes from a 512 B subregion needs two of them
        let w = window_for(0x2000_1000, 600);
        assert_eq!(w.iter().collect::<Vec<_>>(), vec![0, 1]);

        // boundary straddle: 512 B + 1024 B
        let w = window_for(0x2000_1E00, 1536);
        assert_eq!(w.iter().collect::<Vec<_>>(), vec![7, 8]);

        assert!(window_for(0x2000_1000, 0).is_empty());
        assert!(window_for(0x1000_0000, 512).is_empty());
    }

    #[test]
    fn test_window_reaches_the_top_bit() {
        let w = window_for(0x2000_7C00, 1024);
        assert!(w.contains(39));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn test_free_run_checks() {
        let mut set = SubregionSet::EMPTY;
        set.claim(2, 3);
        assert!(set.is_free_run(0, 2));
        assert!(!set.is_free_run(1, 2));
        assert!(set.is_free_run(5, 3));
        assert!(!set.is_free_run(38, 3));
        set.release(2, 3);
        assert!(set.is_empty());
    }

    #[test]
    fn test_protection_mask_srd_bits() {
        let mut mask = ProtectionMask::NO_ACCESS;
        assert_eq!(mask.bits(), 0xFF_FFFF_FFFF);
        mask.allow(SubregionSet::run(7, 2));
        assert_eq!(mask.srd_bits(0), 0x7F);
        assert_eq!(mask.srd_bits(1), 0xFE);
        assert_eq!(mask.srd_bits(4), 0xFF);
        assert!(mask.allows(7) && mask.allows(8) && !mask.allows(9));

        mask.allow(SubregionSet::run(39, 1));
        assert_eq!(mask.srd_bits(4), 0x7F);
        assert_eq!(mask.granted(), SubregionSet::from_bits((1 << 7) | (1 << 8) | (1 << 39)));
    }
}
