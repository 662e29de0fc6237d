// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Boot-time untyped memory allocator.
//!
//! Seeded from the untyped descriptors the kernel hands the root task.
//! Allocation carves naturally aligned chunks from slab watermarks;
//! freed chunks go on per-size free lists and are preferred on the next
//! request. Chunks never merge; the workload is overwhelmingly
//! page-sized so recycling by size is enough.

use alloc::vec::Vec;
use hashbrown::HashMap;
use log::trace;
use smallvec::SmallVec;
use sos_os_common::caps::Paddr;
use sos_os_common::mem::l2tob;
use sos_os_common::untyped::UntypedArena;

// Slab capacity before spillover to the heap.
const UNTYPED_SLAB_CAPACITY: usize = 8;

/// One untyped region reported at boot.
#[derive(Clone, Copy, Debug)]
pub struct UntypedDesc {
    pub paddr: Paddr,
    pub size_bits: usize,
}

#[derive(Debug)]
struct UntypedSlab {
    base: Paddr,
    end: Paddr,
    watermark: Paddr,
}

#[derive(Debug, Default)]
pub struct UntypedStats {
    pub total_bytes: usize,
    pub allocated_bytes: usize,
    // Total space allocated over time.
    pub requested_bytes: usize,
    // Requests failed for lack of space (possibly fragmentation).
    pub out_of_memory: usize,
}

pub struct BootUntyped {
    slabs: SmallVec<[UntypedSlab; UNTYPED_SLAB_CAPACITY]>,
    // Recycled chunks keyed by log2 size.
    free_lists: HashMap<usize, Vec<Paddr>>,
    stats: UntypedStats,
}

impl BootUntyped {
    pub fn new(untypeds: &[UntypedDesc]) -> Self {
        assert!(!untypeds.is_empty());
        let mut m = BootUntyped {
            slabs: SmallVec::new(),
            free_lists: HashMap::new(),
            stats: UntypedStats::default(),
        };
        for ut in untypeds {
            let size = l2tob(ut.size_bits);
            m.slabs.push(UntypedSlab {
                base: ut.paddr,
                end: ut.paddr + size,
                watermark: ut.paddr,
            });
            m.stats.total_bytes += size;
        }
        // Largest regions first so big requests land before the slabs
        // fragment.
        m.slabs.sort_unstable_by(|a, b| (b.end - b.base).cmp(&(a.end - a.base)));
        m
    }

    pub fn stats(&self) -> &UntypedStats { &self.stats }

    pub fn free_bytes(&self) -> usize { self.stats.total_bytes - self.stats.allocated_bytes }

    fn carve(&mut self, size_bits: usize) -> Option<Paddr> {
        let size = l2tob(size_bits);
        for slab in self.slabs.iter_mut() {
            // Natural alignment for the object size.
            let aligned = (slab.watermark + size - 1) & !(size - 1);
            if aligned + size <= slab.end {
                slab.watermark = aligned + size;
                return Some(aligned);
            }
        }
        None
    }
}

impl UntypedArena for BootUntyped {
    fn alloc(&mut self, size_bits: usize) -> Option<Paddr> {
        let recycled = self
            .free_lists
            .get_mut(&size_bits)
            .and_then(|list| list.pop());
        let paddr = recycled.or_else(|| self.carve(size_bits));
        match paddr {
            Some(p) => {
                self.stats.allocated_bytes += l2tob(size_bits);
                self.stats.requested_bytes += l2tob(size_bits);
                trace!("ut_alloc {} bits -> {:#x}", size_bits, p);
                Some(p)
            }
            None => {
                self.stats.out_of_memory += 1;
                None
            }
        }
    }

    fn free(&mut self, paddr: Paddr, size_bits: usize) {
        trace!("ut_free {:#x} {} bits", paddr, size_bits);
        debug_assert!(paddr & (l2tob(size_bits) - 1) == 0);
        self.free_lists.entry(size_bits).or_default().push(paddr);
        self.stats.allocated_bytes -= l2tob(size_bits);
    }
}
