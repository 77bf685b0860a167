// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::str::FromStr;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{WeftError, WeftResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FitAlgorithm {
    FirstFit,
    BestFit,
    WorstFit,
    NextFit,
}

impl FromStr for FitAlgorithm {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIRST_FIT" => Ok(FitAlgorithm::FirstFit),
            "BEST_FIT" => Ok(FitAlgorithm::BestFit),
            "WORST_FIT" => Ok(FitAlgorithm::WorstFit),
            "NEXT_FIT" => Ok(FitAlgorithm::NextFit),
            other => Err(WeftError::Validation(format!(
                "unknown fit algorithm: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub start: u64,
    pub size: u64,
    pub allocated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentationReport {
    pub total_memory: u64,
    pub allocated_memory: u64,
    pub free_memory: u64,
    pub largest_free_block: u64,
    pub free_blocks_count: usize,
    pub external_fragmentation: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStats {
    pub algorithm: FitAlgorithm,
    pub allocated_processes: usize,
    pub fragmentation: FragmentationReport,
}

/// Free-list allocator over the address range `[0, total)`, kept as a list
/// of blocks sorted by start address. Allocation splits a free block in
/// place; deallocation coalesces so no two free neighbours survive a free.
/// One block per process at most.
pub struct MemoryAllocator {
    total: u64,
    algorithm: FitAlgorithm,
    inner: Mutex<Inner>,
}

struct Inner {
    blocks: Vec<Block>,
    /// Next-fit resumes scanning from this address.
    cursor: u64,
}

impl MemoryAllocator {
    pub fn new(total: u64, algorithm: FitAlgorithm) -> Self {
        Self {
            total,
            algorithm,
            inner: Mutex::new(Inner {
                blocks: vec![Block {
                    start: 0,
                    size: total,
                    allocated: false,
                    owner: None,
                }],
                cursor: 0,
            }),
        }
    }

    /// Allocate `size` bytes for `pid`, returning the start address.
    pub fn allocate(&self, pid: &str, size: u64) -> WeftResult<u64> {
        if size == 0 {
            return Err(WeftError::Validation("allocation size must be positive".into()));
        }

        let mut inner = self.inner.lock().unwrap();

        if inner.blocks.iter().any(|b| b.owner.as_deref() == Some(pid)) {
            return Err(WeftError::Validation(format!(
                "process {} already holds memory",
                pid
            )));
        }

        let index = match self.find_block(&inner, size) {
            Some(index) => index,
            None => {
                warn!("Memory allocation failed (pid = {}) (size = {})", pid, size);
                return Err(WeftError::QuotaExceeded(format!(
                    "no free block of {} bytes",
                    size
                )));
            }
        };

        let start = inner.blocks[index].start;

        if inner.blocks[index].size == size {
            let block = &mut inner.blocks[index];
            block.allocated = true;
            block.owner = Some(pid.to_string());
        } else {
            // Split: allocated head, free remainder.
            let remainder = Block {
                start: start + size,
                size: inner.blocks[index].size - size,
                allocated: false,
                owner: None,
            };
            let block = &mut inner.blocks[index];
            block.size = size;
            block.allocated = true;
            block.owner = Some(pid.to_string());
            inner.blocks.insert(index + 1, remainder);
        }

        inner.cursor = start + size;
        info!("Memory allocated (pid = {}) (start = {}) (size = {})", pid, start, size);
        Ok(start)
    }

    pub fn deallocate(&self, pid: &str) -> WeftResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let index = inner
            .blocks
            .iter()
            .position(|b| b.owner.as_deref() == Some(pid))
            .ok_or_else(|| {
                WeftError::NotFound(format!("process {} holds no memory", pid))
            })?;

        inner.blocks[index].allocated = false;
        inner.blocks[index].owner = None;
        Self::coalesce(&mut inner);

        info!("Memory deallocated (pid = {})", pid);
        Ok(())
    }

    fn find_block(&self, inner: &Inner, size: u64) -> Option<usize> {
        let free = |b: &Block| !b.allocated && b.size >= size;

        match self.algorithm {
            FitAlgorithm::FirstFit => inner.blocks.iter().position(free),
            FitAlgorithm::BestFit => inner
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| free(b))
                .min_by_key(|(_, b)| b.size)
                .map(|(i, _)| i),
            FitAlgorithm::WorstFit => inner
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| free(b))
                .max_by_key(|(_, b)| b.size)
                .map(|(i, _)| i),
            FitAlgorithm::NextFit => {
                let from = inner
                    .blocks
                    .iter()
                    .position(|b| b.start >= inner.cursor)
                    .unwrap_or(0);

                // Wrap once, then stop where the scan began.
                inner.blocks[from..]
                    .iter()
                    .position(free)
                    .map(|offset| from + offset)
                    .or_else(|| inner.blocks[..from].iter().position(free))
            }
        }
    }

    fn coalesce(inner: &mut Inner) {
        let mut i = 0;
        while i + 1 < inner.blocks.len() {
            let mergeable = !inner.blocks[i].allocated
                && !inner.blocks[i + 1].allocated
                && inner.blocks[i].start + inner.blocks[i].size == inner.blocks[i + 1].start;

            if mergeable {
                let absorbed = inner.blocks.remove(i + 1);
                inner.blocks[i].size += absorbed.size;
            } else {
                i += 1;
            }
        }
    }

    pub fn fragmentation(&self) -> FragmentationReport {
        let inner = self.inner.lock().unwrap();

        let mut total_free = 0u64;
        let mut largest_free = 0u64;
        let mut free_blocks = 0usize;
        let mut allocated = 0u64;

        for block in &inner.blocks {
            if block.allocated {
                allocated += block.size;
            } else {
                total_free += block.size;
                largest_free = largest_free.max(block.size);
                free_blocks += 1;
            }
        }

        FragmentationReport {
            total_memory: self.total,
            allocated_memory: allocated,
            free_memory: total_free,
            largest_free_block: largest_free,
            free_blocks_count: free_blocks,
            external_fragmentation: if total_free > 0 {
                1.0 - largest_free as f64 / total_free as f64
            } else {
                0.0
            },
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let allocated_processes = {
            let inner = self.inner.lock().unwrap();
            inner.blocks.iter().filter(|b| b.allocated).count()
        };

        AllocatorStats {
            algorithm: self.algorithm,
            allocated_processes,
            fragmentation: self.fragmentation(),
        }
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.lock().unwrap().blocks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The structural invariants every operation must preserve: blocks
    /// sorted by start, contiguous, covering [0, total), with no two
    /// adjacent free blocks.
    fn assert_invariants(allocator: &MemoryAllocator, total: u64) {
        let blocks = allocator.blocks();
        let mut expected_start = 0;

        for window in blocks.windows(2) {
            assert!(window[0].start < window[1].start, "blocks out of order");
            assert!(
                !(!window[0].allocated && !window[1].allocated),
                "adjacent free blocks survived"
            );
        }
        for block in &blocks {
            assert_eq!(block.start, expected_start, "gap or overlap in block list");
            expected_start += block.size;
        }
        assert_eq!(expected_start, total, "blocks do not cover the arena");
    }

    #[test]
    fn first_fit_takes_earliest_hole() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::FirstFit);

        assert_eq!(allocator.allocate("a", 30).unwrap(), 0);
        assert_eq!(allocator.allocate("b", 30).unwrap(), 30);
        allocator.deallocate("a").unwrap();

        // Hole at 0 (30 bytes) and tail at 60 (40 bytes); first fit reuses
        // the front hole.
        assert_eq!(allocator.allocate("c", 10).unwrap(), 0);
        assert_invariants(&allocator, 100);
    }

    #[test]
    fn best_fit_prefers_tightest_hole() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::BestFit);

        allocator.allocate("a", 20).unwrap();
        allocator.allocate("b", 30).unwrap();
        allocator.allocate("c", 40).unwrap();
        allocator.deallocate("a").unwrap(); // hole: 20 at 0
        allocator.deallocate("c").unwrap(); // hole: 50 at 50 (40 + tail 10 coalesced)

        // 15 fits both; best fit picks the 20-byte hole.
        assert_eq!(allocator.allocate("d", 15).unwrap(), 0);
        assert_invariants(&allocator, 100);
    }

    #[test]
    fn worst_fit_prefers_widest_hole() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::WorstFit);

        allocator.allocate("a", 20).unwrap();
        allocator.allocate("b", 30).unwrap();
        allocator.deallocate("a").unwrap(); // holes: 20 at 0, 50 at 50

        assert_eq!(allocator.allocate("c", 10).unwrap(), 50);
        assert_invariants(&allocator, 100);
    }

    #[test]
    fn next_fit_resumes_after_previous_allocation() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::NextFit);

        allocator.allocate("a", 20).unwrap(); // cursor at 20
        allocator.allocate("b", 20).unwrap(); // cursor at 40
        allocator.deallocate("a").unwrap();

        // Free holes at 0 (20) and 40 (60). Next fit starts at the cursor,
        // so the tail hole wins even though the front one fits.
        assert_eq!(allocator.allocate("c", 10).unwrap(), 40);
        // And wraps to the front when the tail is exhausted.
        assert_eq!(allocator.allocate("d", 50).unwrap(), 50);
        assert_eq!(allocator.allocate("e", 15).unwrap(), 0);
        assert_invariants(&allocator, 100);
    }

    #[test]
    fn one_block_per_process() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::FirstFit);
        allocator.allocate("a", 10).unwrap();
        assert!(allocator.allocate("a", 10).is_err());
    }

    #[test]
    fn exhaustion_is_reported() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::FirstFit);
        allocator.allocate("a", 60).unwrap();
        allocator.allocate("b", 40).unwrap();

        match allocator.allocate("c", 1) {
            Err(WeftError::QuotaExceeded(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn coalescing_merges_both_neighbours() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::FirstFit);
        allocator.allocate("a", 25).unwrap();
        allocator.allocate("b", 25).unwrap();
        allocator.allocate("c", 25).unwrap();

        allocator.deallocate("a").unwrap();
        allocator.deallocate("c").unwrap();
        // Freeing b bridges both holes plus the tail into one block.
        allocator.deallocate("b").unwrap();

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 100);
        assert!(!blocks[0].allocated);
        assert_invariants(&allocator, 100);
    }

    #[test]
    fn fragmentation_formula() {
        let allocator = MemoryAllocator::new(100, FitAlgorithm::FirstFit);
        allocator.allocate("a", 40).unwrap();
        allocator.allocate("b", 20).unwrap();
        allocator.deallocate("a").unwrap();

        // Free: 40 at 0 and 40 tail; largest 40 of 80 total.
        let report = allocator.fragmentation();
        assert_eq!(report.free_memory, 80);
        assert_eq!(report.largest_free_block, 40);
        assert!((report.external_fragmentation - 0.5).abs() < 1e-9);
    }

    #[test]
    fn random_churn_preserves_invariants() {
        let allocator = MemoryAllocator::new(1024, FitAlgorithm::BestFit);

        // Deterministic interleaving of allocs and frees.
        for round in 0..8u64 {
            for i in 0..6u64 {
                let pid = format!("p{}", i);
                let size = 17 + ((round * 31 + i * 13) % 90);
                let _ = allocator.allocate(&pid, size);
                assert_invariants(&allocator, 1024);
            }
            for i in (0..6u64).step_by(2) {
                let _ = allocator.deallocate(&format!("p{}", i));
                assert_invariants(&allocator, 1024);
            }
            for i in (1..6u64).step_by(2) {
                let _ = allocator.deallocate(&format!("p{}", i));
                assert_invariants(&allocator, 1024);
            }
        }
    }
}
