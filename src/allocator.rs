//! # Region Allocator
//!
//! Hands out task stacks and task heap blocks from the SRAM arena described
//! in [`region`](crate::region). Allocations are whole subregions, so every
//! allocation is also a valid MPU access window for its owner.
//!
//! ## Size Classes
//!
//! | Request        | Placement                                               |
//! |----------------|---------------------------------------------------------|
//! | 1–512 B        | one 512 B subregion, else one 1024 B subregion          |
//! | 513–1024 B     | one 1024 B subregion                                    |
//! | 1025–1536 B    | a 512 B + 1024 B pair straddling a region boundary, else three 512 B subregions |
//! | 1537–4096 B    | ⌈n/512⌉ × 512 B subregions, else ⌈n/1024⌉ × 1024 B       |
//! | 4097–8192 B    | ⌈n/1024⌉ × 1024 B subregions                            |
//!
//! Every search is first-fit in region order. A run of subregions never
//! crosses the end of the region it starts in; the boundary pair is the one
//! deliberate exception.

use arrayvec::ArrayVec;

use crate::config::{MAX_ALLOCATIONS, MAX_ALLOC_SIZE};
use crate::error::KernelError;
use crate::region::{self, subregion_size, subregions_of, SubregionSet, REGION_COUNT};
use crate::task::Pid;

/// Regions made of 512 B subregions, in search order.
const SMALL_REGIONS: [usize; 3] = [0, 2, 3];

/// Regions made of 1024 B subregions, in search order.
const LARGE_REGIONS: [usize; 2] = [1, 4];

/// First subregion of every 512 B + 1024 B pair that straddles a region
/// boundary (R0|R1, R1|R2, R3|R4).
const BOUNDARY_PAIRS: [usize; 3] = [7, 15, 31];

/// Size granted for a boundary pair.
const BOUNDARY_PAIR_SIZE: u32 = 512 + 1024;

/// A granted block of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Address of the first byte.
    pub base: u32,
    /// First subregion of the block.
    pub start: usize,
    /// Granted size in bytes, rounded up to whole subregions.
    pub size: u32,
}

impl Allocation {
    /// One past the last byte; the initial stack pointer when the block is a
    /// stack.
    pub const fn top(&self) -> u32 {
        self.base + self.size
    }

    /// Subregions this block occupies.
    pub fn subregions(&self) -> SubregionSet {
        SubregionSet::run(self.start, subregion_span(self.start, self.size))
    }
}

/// Metadata for one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub owner: Pid,
    pub block: Allocation,
}

/// Number of subregions a block of `size` bytes starting at `start` spans.
fn subregion_span(start: usize, size: u32) -> usize {
    if BOUNDARY_PAIRS.contains(&start) && size == BOUNDARY_PAIR_SIZE {
        return 2;
    }
    size.div_ceil(subregion_size(start)) as usize
}

/// The region allocator: occupancy set plus allocation records.
pub struct RegionAllocator {
    in_use: SubregionSet,
    records: ArrayVec<AllocationRecord, MAX_ALLOCATIONS>,
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionAllocator {
    pub const fn new() -> Self {
        Self {
            in_use: SubregionSet::EMPTY,
            records: ArrayVec::new_const(),
        }
    }

    /// Subregions currently allocated.
    pub fn in_use(&self) -> SubregionSet {
        self.in_use
    }

    /// Live allocation records, oldest first.
    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    /// Allocate `size` bytes on behalf of `owner`.
    pub fn allocate(&mut self, owner: Pid, size: u32) -> Result<Allocation, KernelError> {
        if size == 0 || size > MAX_ALLOC_SIZE || self.records.is_full() {
            return Err(KernelError::OutOfMemory);
        }

        let (start, count, granted) = self.place(size).ok_or(KernelError::OutOfMemory)?;
        let base = region::subregion_to_address(start).ok_or(KernelError::OutOfMemory)?;
        let block = Allocation { base, start, size: granted };

        self.in_use.claim(start, count);
        self.records.push(AllocationRecord { owner, block });
        self.check_invariants();
        log::debug!(
            "alloc {} B -> {:#010x} ({} subregions from {}) for {:?}",
            size,
            base,
            count,
            start,
            owner
        );
        Ok(block)
    }

    /// Free the allocation starting at `address`, together with every other
    /// allocation held by the same owner. An unknown address is ignored.
    pub fn free(&mut self, address: u32) {
        let Some(pos) = self.records.iter().position(|r| r.block.base == address) else {
            log::trace!("free {:#010x}: no such allocation", address);
            return;
        };
        let owner = self.records[pos].owner;
        self.free_owned_by(owner);
    }

    /// Free every allocation owned by `owner`. Returns how many were freed.
    pub fn free_owned_by(&mut self, owner: Pid) -> usize {
        let before = self.records.len();
        let in_use = &mut self.in_use;
        self.records.retain(|r| {
            if r.owner != owner {
                return true;
            }
            in_use.release(r.block.start, subregion_span(r.block.start, r.block.size));
            false
        });
        let freed = before - self.records.len();
        if freed > 0 {
            log::debug!("freed {} allocation(s) of {:?}", freed, owner);
        }
        self.check_invariants();
        freed
    }

    /// Union of the subregions referenced by live records.
    pub fn claimed_by_records(&self) -> SubregionSet {
        self.records
            .iter()
            .fold(SubregionSet::EMPTY, |acc, r| acc.union(r.block.subregions()))
    }

    fn check_invariants(&self) {
        assert_eq!(
            self.in_use,
            self.claimed_by_records(),
            "occupancy diverged from allocation records"
        );
    }

    // -----------------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------------

    /// Pick `(start, subregion count, granted size)` for a request.
    fn place(&self, size: u32) -> Option<(usize, usize, u32)> {
        match size {
            1..=512 => self
                .first_fit(&SMALL_REGIONS, 1)
                .map(|s| (s, 1, 512))
                .or_else(|| self.first_fit(&LARGE_REGIONS, 1).map(|s| (s, 1, 1024))),
            513..=1024 => self.first_fit(&LARGE_REGIONS, 1).map(|s| (s, 1, 1024)),
            1025..=1536 => self
                .boundary_pair()
                .map(|s| (s, 2, BOUNDARY_PAIR_SIZE))
                .or_else(|| self.first_fit(&SMALL_REGIONS, 3).map(|s| (s, 3, 1536))),
            1537..=4096 => {
                let small = size.div_ceil(512) as usize;
                let large = size.div_ceil(1024) as usize;
                self.first_fit(&SMALL_REGIONS, small)
                    .map(|s| (s, small, small as u32 * 512))
                    .or_else(|| {
                        self.first_fit(&LARGE_REGIONS, large)
                            .map(|s| (s, large, large as u32 * 1024))
                    })
            }
            _ => {
                let large = size.div_ceil(1024) as usize;
                self.first_fit(&LARGE_REGIONS, large)
                    .map(|s| (s, large, large as u32 * 1024))
            }
        }
    }

    /// First start index of `len` free subregions inside a single region of
    /// `regions`.
    fn first_fit(&self, regions: &[usize], len: usize) -> Option<usize> {
        regions.iter().find_map(|&region| {
            debug_assert!(region < REGION_COUNT);
            let span = subregions_of(region);
            let end = span.end;
            span.take_while(|&start| start + len <= end)
                .find(|&start| self.in_use.is_free_run(start, len))
        })
    }

    /// First free 512 B + 1024 B pair across a region boundary.
    fn boundary_pair(&self) -> Option<usize> {
        BOUNDARY_PAIRS
            .iter()
            .copied()
            .find(|&start| self.in_use.is_free_run(start, 2))
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const A: Pid = Pid::from_raw(0xA);
    const B: Pid = Pid::from_raw(0xB);

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_rejects_zero_and_oversized() {
        let mut heap = RegionAllocator::new();
        assert_eq!(heap.allocate(A, 0), Err(KernelError::OutOfMemory));
        assert_eq!(heap.allocate(A, MAX_ALLOC_SIZE + 1), Err(KernelError::OutOfMemory));
        assert!(heap.in_use().is_empty());
        assert!(heap.records().is_empty());
    }

    #[test]
    fn test_small_requests_prefer_512_subregions() {
        let mut heap = RegionAllocator::new();
        let block = heap.allocate(A, 100).unwrap();
        assert_eq!(block, Allocation { base: 0x2000_1000, start: 0, size: 512 });
        let block = heap.allocate(A, 512).unwrap();
        assert_eq!(block.start, 1);
    }

    #[test]
    fn test_small_requests_fall_back_to_1024() {
        let mut heap = RegionAllocator::new();
        // fill R0, R2 and R3
        for start in [0, 16, 24] {
            assert_eq!(heap.allocate(A, 4096).unwrap().start, start);
        }
        let block = heap.allocate(B, 1).unwrap();
        assert_eq!(block.start, 8);
        assert_eq!(block.size, 1024);
    }

    #[test]
    fn test_medium_requests_use_1024() {
        let mut heap = RegionAllocator::new();
        let block = heap.allocate(A, 513).unwrap();
        assert_eq!(block, Allocation { base: 0x2000_2000, start: 8, size: 1024 });
    }

    #[test]
    fn test_boundary_pair_for_1536() {
        let mut heap = RegionAllocator::new();
        let block = heap.allocate(A, 1536).unwrap();
        assert_eq!(block.start, 7);
        assert_eq!(block.base, 0x2000_1E00);
        assert_eq!(block.size, 1536);
        assert_eq!(heap.in_use(), SubregionSet::run(7, 2));

        assert_eq!(heap.allocate(A, 1100).unwrap().start, 15);
        assert_eq!(heap.allocate(A, 1025).unwrap().start, 31);
        assert_eq!(heap.in_use().len(), 6);
    }

    #[test]
    fn test_three_small_subregions_without_a_boundary_pair() {
        let mut heap = RegionAllocator::new();
        // block the 1024 B half of every boundary pair
        heap.in_use = SubregionSet::from_bits((1 << 8) | (1 << 15) | (1 << 32));
        assert_eq!(heap.place(1536), Some((0, 3, 1536)));
        assert_eq!(heap.place(1025), Some((0, 3, 1536)));
    }

    #[test]
    fn test_runs_never_leave_their_region() {
        let mut heap = RegionAllocator::new();
        // leave only subregions 6, 7 of R0 and 16.. of R2 free
        heap.in_use = SubregionSet::run(0, 6);
        let (start, count, _) = heap.place(1500).unwrap();
        // 6..9 would cross into R1; the pair at 7 is free so it wins first
        assert_eq!((start, count), (7, 2));

        heap.in_use = SubregionSet::run(0, 6)
            .union(SubregionSet::run(8, 8))
            .union(SubregionSet::run(32, 1));
        let (start, count, granted) = heap.place(1500).unwrap();
        assert_eq!((start, count, granted), (16, 3, 1536));

        // R2 has two left at 22, 23; a 3-run must not spill into R3
        heap.in_use = SubregionSet::run(16, 6)
            .union(SubregionSet::run(0, 8))
            .union(SubregionSet::run(8, 8))
            .union(SubregionSet::run(32, 1));
        let (start, _, _) = heap.place(1500).unwrap();
        assert_eq!(start, 24);
    }

    #[test]
    fn test_large_requests() {
        let mut heap = RegionAllocator::new();
        let block = heap.allocate(A, 4096).unwrap();
        assert_eq!((block.start, block.size), (0, 4096));

        let block = heap.allocate(A, 2000).unwrap();
        assert_eq!((block.start, block.size), (16, 2048));

        let block = heap.allocate(A, 5000).unwrap();
        assert_eq!((block.start, block.size), (8, 5120));

        let block = heap.allocate(A, 8192).unwrap();
        assert_eq!((block.start, block.size), (32, 8192));

        assert_eq!(heap.allocate(A, 8192), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn test_mid_class_falls_back_to_1024_regions() {
        let mut heap = RegionAllocator::new();
        heap.in_use = SubregionSet::run(0, 1)
            .union(SubregionSet::run(16, 1))
            .union(SubregionSet::run(24, 1));
        // no region has eight free 512 B subregions
        let (start, count, granted) = heap.place(4096).unwrap();
        assert_eq!((start, count, granted), (8, 4, 4096));
    }

    #[test]
    fn test_free_releases_exact_subregions() {
        init_logger();
        let mut heap = RegionAllocator::new();
        let a = heap.allocate(A, 1536).unwrap();
        let b = heap.allocate(B, 3000).unwrap();
        heap.free(a.base);
        assert_eq!(heap.in_use(), b.subregions());
        heap.free(b.base);
        assert!(heap.in_use().is_empty());
    }

    #[test]
    fn test_free_cascades_to_owner_allocations() {
        let mut heap = RegionAllocator::new();
        let stack = heap.allocate(A, 1024).unwrap();
        heap.allocate(B, 512).unwrap();
        heap.allocate(A, 512).unwrap();
        heap.allocate(A, 2048).unwrap();
        heap.free(stack.base);
        assert_eq!(heap.records().len(), 1);
        assert_eq!(heap.records()[0].owner, B);
        assert_eq!(heap.in_use(), heap.claimed_by_records());
    }

    #[test]
    fn test_free_unknown_address_is_noop() {
        let mut heap = RegionAllocator::new();
        let a = heap.allocate(A, 700).unwrap();
        let before = heap.in_use();
        heap.free(a.base + 4);
        heap.free(0xDEAD_BEEF);
        assert_eq!(heap.in_use(), before);
        assert_eq!(heap.records().len(), 1);
    }

    #[test]
    fn test_record_table_capacity() {
        let mut heap = RegionAllocator::new();
        for _ in 0..MAX_ALLOCATIONS {
            heap.allocate(A, 1).unwrap();
        }
        let before = heap.in_use();
        assert_eq!(heap.allocate(B, 1), Err(KernelError::OutOfMemory));
        assert_eq!(heap.in_use(), before);
    }

    /// An operation on the allocator.
    #[derive(Debug)]
    enum Cmd {
        Alloc(Pid, u32),
        Free(usize),
        FreeBogus(u32),
    }

    /// Map random bytes to allocator operations.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        bytecode.chunks_exact(3).map(|instr| {
            let value = u16::from_le_bytes([instr[1], instr[2]]);
            match instr[0] % 4 {
                0 | 1 => Cmd::Alloc(Pid::from_raw(u32::from(instr[0] % 5)), u32::from(value) % 9000),
                2 => Cmd::Free(usize::from(value)),
                _ => Cmd::FreeBogus(0x2000_0000 + u32::from(value)),
            }
        })
    }

    #[quickcheck]
    fn test_occupancy_matches_records(bytecode: Vec<u8>) {
        let mut heap = RegionAllocator::new();
        for cmd in interpret(&bytecode) {
            log::trace!("    {cmd:?}");
            let before = heap.in_use();
            match cmd {
                Cmd::Alloc(owner, size) => match heap.allocate(owner, size) {
                    Ok(block) => {
                        assert!(block.size >= size);
                        assert!(!before.intersects(block.subregions()));
                    }
                    Err(_) => assert_eq!(heap.in_use(), before),
                },
                Cmd::Free(i) => {
                    if !heap.records().is_empty() {
                        let base = heap.records()[i % heap.records().len()].block.base;
                        heap.free(base);
                    }
                }
                Cmd::FreeBogus(address) => {
                    let records = heap.records().len();
                    if heap.records().iter().all(|r| r.block.base != address) {
                        heap.free(address);
                        assert_eq!(heap.in_use(), before);
                        assert_eq!(heap.records().len(), records);
                    }
                }
            }
            assert_eq!(heap.in_use(), heap.claimed_by_records());
        }
    }
}
