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

//! Swap-file space management.
//!
//! The backing file is a flat array of page-sized slots with no header;
//! slot `k` occupies bytes `[k * PAGE_SIZE, (k + 1) * PAGE_SIZE)`. A
//! slot is either on the free list or referenced by exactly one
//! page-table entry. Each slot keeps a byte-sum checksum, recomputed on
//! write and verified on read; checksums live only in RAM. The file
//! itself is created lazily on first write — creation state is tracked
//! here, the create RPC is driven by the eviction path.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use log::trace;
use sos_os_common::files::FileHandle;
use sos_os_common::mem::{is_page_aligned, PAGE_SIZE};

pub const SWAP_FILE_NAME: &str = ".sos_swap";

/// Byte offset of a slot in the swap file (page aligned).
pub type SwapOffset = usize;

#[derive(Debug)]
struct SwapSlot {
    next_free: Option<usize>,
    checksum: u32,
}

#[derive(Debug, Default)]
pub struct SwapStats {
    pub allocated_slots: usize,
    pub out_of_swap: usize,
    pub checksum_failures: usize,
}

pub struct SwapStore {
    slots: Vec<SwapSlot>,
    free_head: Option<usize>,
    handle: Option<FileHandle>,
    stats: SwapStats,
}

/// Byte-sum checksum of one page of data.
pub fn page_checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}

impl SwapStore {
    /// Creates a store covering a swap file of `file_size` bytes.
    pub fn new(file_size: usize) -> Self {
        let nswap = file_size / PAGE_SIZE;
        assert!(nswap > 0);
        let mut slots = Vec::with_capacity(nswap);
        for i in 0..nswap {
            slots.push(SwapSlot {
                next_free: if i + 1 < nswap { Some(i + 1) } else { None },
                checksum: 0,
            });
        }
        SwapStore {
            slots,
            free_head: Some(0),
            handle: None,
            stats: SwapStats::default(),
        }
    }

    pub fn capacity(&self) -> usize { self.slots.len() }
    pub fn stats(&self) -> &SwapStats { &self.stats }

    /// The remote handle of the swap file once it exists.
    pub fn handle(&self) -> Option<FileHandle> { self.handle }
    pub fn set_handle(&mut self, handle: FileHandle) { self.handle = Some(handle); }
    pub fn is_initialized(&self) -> bool { self.handle.is_some() }

    /// Allocates a slot in O(1). `None` when the file is full.
    pub fn alloc_slot(&mut self) -> Option<SwapOffset> {
        match self.free_head {
            Some(idx) => {
                self.free_head = self.slots[idx].next_free.take();
                self.stats.allocated_slots += 1;
                trace!("swap alloc slot {:#x}", idx * PAGE_SIZE);
                Some(idx * PAGE_SIZE)
            }
            None => {
                self.stats.out_of_swap += 1;
                None
            }
        }
    }

    /// Returns a slot to the free list in O(1).
    pub fn free_slot(&mut self, offset: SwapOffset) {
        assert!(is_page_aligned(offset));
        let idx = offset / PAGE_SIZE;
        trace!("swap free slot {:#x}", offset);
        self.slots[idx].checksum = 0;
        self.slots[idx].next_free = self.free_head;
        self.free_head = Some(idx);
        self.stats.allocated_slots -= 1;
    }

    /// Records the checksum of the page about to be written to `offset`.
    pub fn record_checksum(&mut self, offset: SwapOffset, bytes: &[u8]) {
        assert!(is_page_aligned(offset));
        self.slots[offset / PAGE_SIZE].checksum = page_checksum(bytes);
    }

    /// Verifies a page read back from `offset`. A mismatch is fatal
    /// corruption for the owning process; the caller decides its fate.
    pub fn verify_checksum(&mut self, offset: SwapOffset, bytes: &[u8]) -> bool {
        assert!(is_page_aligned(offset));
        let ok = self.slots[offset / PAGE_SIZE].checksum == page_checksum(bytes);
        if !ok {
            self.stats.checksum_failures += 1;
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_reuse() {
        let mut swap = SwapStore::new(4 * PAGE_SIZE);
        let a = swap.alloc_slot().unwrap();
        let b = swap.alloc_slot().unwrap();
        assert!(is_page_aligned(a) && is_page_aligned(b));
        assert_ne!(a, b);
        swap.free_slot(a);
        // LIFO reuse.
        assert_eq!(swap.alloc_slot(), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let mut swap = SwapStore::new(2 * PAGE_SIZE);
        assert!(swap.alloc_slot().is_some());
        assert!(swap.alloc_slot().is_some());
        assert_eq!(swap.alloc_slot(), None);
        assert_eq!(swap.stats().out_of_swap, 1);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut swap = SwapStore::new(4 * PAGE_SIZE);
        let slot = swap.alloc_slot().unwrap();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xde;
        page[PAGE_SIZE - 1] = 0xad;
        swap.record_checksum(slot, &page);
        assert!(swap.verify_checksum(slot, &page));

        page[7] ^= 1;
        assert!(!swap.verify_checksum(slot, &page));
        assert_eq!(swap.stats().checksum_failures, 1);
    }

    #[test]
    fn test_checksum_is_byte_sum() {
        assert_eq!(page_checksum(&[]), 0);
        assert_eq!(page_checksum(&[1, 2, 3]), 6);
        // Order-insensitive by construction.
        assert_eq!(page_checksum(&[3, 2, 1]), 6);
    }

    #[test]
    fn test_lazy_initialization() {
        let mut swap = SwapStore::new(PAGE_SIZE);
        assert!(!swap.is_initialized());
        swap.set_handle(7);
        assert!(swap.is_initialized());
        assert_eq!(swap.handle(), Some(7));
    }
}
