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

//! SOS physical-memory management: the untyped arena and the frame
//! table.
//!
//! The frame table is the ground-truth owner of every RAM page. A frame
//! is either on the free list or owned by exactly one page-table entry
//! (or one of SOS's own fixed structures). Each allocated frame is also
//! mapped into the SOS frame window at an offset derived from its index
//! so SOS can address its contents directly.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod untyped;

pub use untyped::BootUntyped;
pub use untyped::UntypedDesc;

use log::{error, trace};
use sos_os_common::caps::{CPtr, Paddr, CAP_NULL};
use sos_os_common::error::SosError;
use sos_os_common::kernel::KernelInterface;
use sos_os_common::mem::{PAGE_BITS, PAGE_SIZE};
use sos_os_common::untyped::UntypedArena;
use sos_os_common::vmem_layout::{FRAME_SIZE_BITS, FRAME_VSTART};

use alloc::vec::Vec;

/// Dense index of a frame in the table.
pub type FrameId = usize;

/// Hard cap on the table size imposed by the frame window.
pub const MAX_FRAMES: usize = (1 << FRAME_SIZE_BITS) / PAGE_SIZE;

#[derive(Debug)]
struct Frame {
    cap: CPtr,
    paddr: Paddr,
    next_free: Option<FrameId>,
    ref_count: u32,
}

#[derive(Debug, Default)]
pub struct FrameTableStats {
    pub allocated_frames: usize,
    // Total allocations over time.
    pub requested_frames: usize,
    // Alloc requests failed for lack of table entries or untyped memory.
    pub out_of_memory: usize,
}

pub struct FrameTable {
    frames: Vec<Frame>,
    free_head: Option<FrameId>,
    stats: FrameTableStats,
}

impl FrameTable {
    /// Creates a table of `capacity` entries, all free. Capacity is
    /// clamped to what the frame window can address.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_FRAMES);
        assert!(capacity > 0);
        let mut frames = Vec::with_capacity(capacity);
        for id in 0..capacity {
            frames.push(Frame {
                cap: CAP_NULL,
                paddr: 0,
                next_free: if id + 1 < capacity { Some(id + 1) } else { None },
                ref_count: 0,
            });
        }
        FrameTable {
            frames,
            free_head: Some(0),
            stats: FrameTableStats::default(),
        }
    }

    pub fn capacity(&self) -> usize { self.frames.len() }
    pub fn stats(&self) -> &FrameTableStats { &self.stats }

    /// Allocates a frame: takes a page of untyped memory, retypes it
    /// into a page object, and maps it into the SOS window. On any
    /// failure the partial work is unwound and `OutOfMemory` is
    /// returned; this never panics.
    pub fn alloc(
        &mut self,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) -> Result<FrameId, SosError> {
        let Some(id) = self.free_head else {
            self.stats.out_of_memory += 1;
            return Err(SosError::OutOfMemory);
        };
        let Some(paddr) = untyped.alloc(PAGE_BITS) else {
            self.stats.out_of_memory += 1;
            return Err(SosError::OutOfMemory);
        };
        let cap = match kernel.retype_frame(paddr) {
            Ok(cap) => cap,
            Err(e) => {
                error!("frame retype failed: {:?}", e);
                untyped.free(paddr, PAGE_BITS);
                return Err(SosError::OutOfMemory);
            }
        };
        if let Err(e) = kernel.map_window(cap, self.sos_vaddr(id)) {
            error!("frame window map failed: {:?}", e);
            kernel.delete(cap);
            untyped.free(paddr, PAGE_BITS);
            return Err(SosError::OutOfMemory);
        }
        let frame = &mut self.frames[id];
        self.free_head = frame.next_free.take();
        frame.cap = cap;
        frame.paddr = paddr;
        frame.ref_count = 1;
        self.stats.allocated_frames += 1;
        self.stats.requested_frames += 1;
        trace!("alloc frame {} paddr {:#x}", id, paddr);
        Ok(id)
    }

    /// Frees a frame: unmaps the window mapping, revokes and deletes
    /// the page capability (tearing down any derived client mappings),
    /// and returns the untyped memory.
    pub fn free(
        &mut self,
        id: FrameId,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) {
        if id >= self.frames.len() || self.frames[id].cap == CAP_NULL {
            error!("free of invalid frame {}", id);
            return;
        }
        trace!("free frame {}", id);
        let frame = &mut self.frames[id];
        kernel.unmap_window(frame.cap);
        kernel.revoke(frame.cap);
        kernel.delete(frame.cap);
        untyped.free(frame.paddr, PAGE_BITS);
        frame.cap = CAP_NULL;
        frame.paddr = 0;
        frame.ref_count = 0;
        frame.next_free = self.free_head;
        self.free_head = Some(id);
        self.stats.allocated_frames -= 1;
    }

    pub fn is_allocated(&self, id: FrameId) -> bool {
        id < self.frames.len() && self.frames[id].cap != CAP_NULL
    }

    /// The page capability of an allocated frame.
    pub fn cap_of(&self, id: FrameId) -> CPtr {
        assert!(self.is_allocated(id));
        self.frames[id].cap
    }

    pub fn paddr_of(&self, id: FrameId) -> Paddr {
        assert!(self.is_allocated(id));
        self.frames[id].paddr
    }

    /// SOS-visible address of a frame in the window.
    pub fn sos_vaddr(&self, id: FrameId) -> usize { FRAME_VSTART + id * PAGE_SIZE }

    /// Frame id and intra-page offset for a window address, or `None`
    /// when the address is outside the window or unallocated.
    pub fn frame_at_sos_vaddr(&self, vaddr: usize) -> Option<(FrameId, usize)> {
        if vaddr < FRAME_VSTART {
            return None;
        }
        let id = (vaddr - FRAME_VSTART) / PAGE_SIZE;
        if !self.is_allocated(id) {
            return None;
        }
        Some((id, vaddr & (PAGE_SIZE - 1)))
    }

    /// Contents of an allocated frame, addressed through the window.
    pub fn bytes<'a>(
        &self,
        kernel: &'a mut dyn KernelInterface,
        id: FrameId,
    ) -> &'a mut [u8] {
        kernel.frame_bytes(self.cap_of(id))
    }
}
