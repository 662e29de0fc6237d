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

//! Per-process address spaces.
//!
//! An address space holds the region list, a two-level page table
//! (10+10+12 split) of arena-allocated PTEs, the clock ring of resident
//! entries used by second-chance replacement, and the shadow list of
//! kernel page tables installed on its behalf. Frames come from the
//! frame table; swapped-out pages reference swap-store slots.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod pte;
mod region;

pub use pte::{PageBacking, Pte, PteArena, PteId};
pub use region::{Region, RegionId};

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::{debug, error, trace};
use smallvec::SmallVec;
use sos_frame_table::{FrameId, FrameTable};
use sos_os_common::caps::{CPtr, CapRights, Paddr};
use sos_os_common::error::SosError;
use sos_os_common::kernel::{KernelInterface, MapError};
use sos_os_common::mem::{
    page_align, page_offset, PAGE_BITS, PAGE_DIR_SIZE_BITS, PAGE_SIZE, PAGE_TABLE_SIZE_BITS,
};
use sos_os_common::untyped::UntypedArena;
use sos_os_common::vmem_layout::{PROCESS_IPC_BUFFER, PROCESS_STACK_BOTTOM, PROCESS_STACK_TOP};
use sos_swap_store::SwapStore;
use static_assertions::const_assert;

const PD_BITS: usize = 10;
const PT_BITS: usize = 10;
const PD_SIZE: usize = 1 << PD_BITS;
const PT_SIZE: usize = 1 << PT_BITS;

const_assert!(PD_BITS + PT_BITS + PAGE_BITS == 32);

// Region-list capacity before spillover to the heap: ELF segments plus
// heap, stack and IPC buffer.
const REGION_CAPACITY: usize = 8;

const fn pd_index(vaddr: usize) -> usize { (vaddr >> (PAGE_BITS + PT_BITS)) & (PD_SIZE - 1) }
const fn pt_index(vaddr: usize) -> usize { (vaddr >> PAGE_BITS) & (PT_SIZE - 1) }

type LeafTable = [Option<PteId>; PT_SIZE];

// Kernel page-table shadow record, kept so the object can be revoked
// and its untyped memory returned on teardown.
struct KernelPageTable {
    cap: CPtr,
    paddr: Paddr,
    #[allow(dead_code)]
    vaddr: usize,
}

pub struct AddressSpace {
    regions: SmallVec<[Region; REGION_CAPACITY]>,
    heap: Option<RegionId>,
    stack: Option<RegionId>,

    dir: Vec<Option<Box<LeafTable>>>,
    ptes: PteArena,
    clock_head: Option<PteId>,
    clock_tail: Option<PteId>,
    kpts: Vec<KernelPageTable>,

    dir_cap: CPtr,
    dir_paddr: Paddr,

    // Resident pages eligible for eviction (pinning removes a page from
    // this count without unmapping it).
    evictable_pages: usize,
    total_pages: usize,
}

impl AddressSpace {
    /// Creates an address space: allocates and retypes the hardware
    /// page directory, then installs the always-resident IPC buffer
    /// page.
    pub fn new(
        frames: &mut FrameTable,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) -> Result<Self, SosError> {
        let Some(dir_paddr) = untyped.alloc(PAGE_DIR_SIZE_BITS) else {
            return Err(SosError::OutOfMemory);
        };
        let dir_cap = match kernel.retype_page_directory(dir_paddr) {
            Ok(cap) => cap,
            Err(e) => {
                untyped.free(dir_paddr, PAGE_DIR_SIZE_BITS);
                return Err(e);
            }
        };
        let mut dir = Vec::with_capacity(PD_SIZE);
        dir.resize_with(PD_SIZE, || None);
        let mut aspace = AddressSpace {
            regions: SmallVec::new(),
            heap: None,
            stack: None,
            dir,
            ptes: PteArena::default(),
            clock_head: None,
            clock_tail: None,
            kpts: Vec::new(),
            dir_cap,
            dir_paddr,
            evictable_pages: 0,
            total_pages: 0,
        };
        // The IPC buffer page is fixed-location and always resident.
        if let Err(e) =
            aspace.create_page(PROCESS_IPC_BUFFER, CapRights::RW, frames, untyped, kernel)
        {
            error!("ipc buffer setup failed: {:?}", e);
            aspace.teardown(frames, &mut SwapStore::new(PAGE_SIZE), untyped, kernel);
            return Err(e);
        }
        aspace.pin(PROCESS_IPC_BUFFER);
        Ok(aspace)
    }

    pub fn vspace_root(&self) -> CPtr { self.dir_cap }

    /// Total pages tracked (resident, pinned or swapped).
    pub fn page_count(&self) -> usize { self.total_pages }

    /// Resident pages the replacement scan may evict.
    pub fn evictable_pages(&self) -> usize { self.evictable_pages }

    //  ---  Region handling  ---

    /// Creates a region; rejects any overlap with an existing one.
    pub fn create_region(
        &mut self,
        start: usize,
        end: usize,
        rights: CapRights,
        elf_offset: Option<usize>,
    ) -> Result<RegionId, SosError> {
        if end < start {
            return Err(SosError::InvalidArgument);
        }
        if self.regions.iter().any(|r| r.overlaps(start, end)) {
            debug!("region [{:#x},{:#x}) overlaps", start, end);
            return Err(SosError::InvalidArgument);
        }
        self.regions.push(Region {
            start,
            end,
            rights,
            elf_offset,
        });
        Ok(self.regions.len() - 1)
    }

    /// Creates the statically positioned regions (heap, stack, IPC
    /// buffer). Call after the ELF regions are in place; the heap
    /// starts one guard page above the highest one.
    pub fn activate(&mut self) -> Result<(), SosError> {
        let top = self
            .regions
            .iter()
            .filter(|r| r.elf_offset.is_some())
            .map(|r| r.end)
            .max()
            .unwrap_or(0);
        let heap_start = page_align(top + PAGE_SIZE - 1) + PAGE_SIZE;
        self.heap = Some(self.create_region(heap_start, heap_start, CapRights::RW, None)?);
        self.stack = Some(self.create_region(
            PROCESS_STACK_BOTTOM,
            PROCESS_STACK_TOP,
            CapRights::RW,
            None,
        )?);
        self.create_region(
            PROCESS_IPC_BUFFER,
            PROCESS_IPC_BUFFER + PAGE_SIZE,
            CapRights::RW,
            None,
        )?;
        Ok(())
    }

    pub fn region_of(&self, vaddr: usize) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(vaddr))
    }

    /// Moves the heap break. `0` reads the current break; a new value
    /// must stay within `[heap.start, stack.start)`. Returns the break
    /// in effect, or `0` on a rejected move.
    pub fn brk(&mut self, newbrk: usize) -> usize {
        let (Some(heap), Some(stack)) = (self.heap, self.stack) else {
            return 0;
        };
        let stack_start = self.regions[stack].start;
        let heap_region = &mut self.regions[heap];
        if newbrk == 0 {
            heap_region.end
        } else if newbrk < stack_start && newbrk >= heap_region.start {
            heap_region.end = newbrk;
            newbrk
        } else {
            0
        }
    }

    //  ---  Page-table lookup  ---

    pub fn lookup_pte(&self, vaddr: usize) -> Option<PteId> {
        self.dir[pd_index(vaddr)].as_ref()?[pt_index(vaddr)]
    }

    pub fn page_exists(&self, vaddr: usize) -> bool { self.lookup_pte(vaddr).is_some() }

    pub fn pte(&self, id: PteId) -> &Pte { self.ptes.get(id) }
    pub fn pte_mut(&mut self, id: PteId) -> &mut Pte { self.ptes.get_mut(id) }

    /// Resident frame backing `vaddr`, with the intra-page offset.
    pub fn resident_frame(&self, vaddr: usize) -> Option<(FrameId, usize)> {
        let pte = self.ptes.get(self.lookup_pte(vaddr)?);
        pte.frame().map(|f| (f, page_offset(vaddr)))
    }

    /// SOS-window address of the resident frame backing `vaddr`, or 0
    /// when the page is absent or swapped out.
    pub fn lookup_sos_vaddr(&self, vaddr: usize, frames: &FrameTable) -> usize {
        match self.resident_frame(vaddr) {
            Some((frame, offset)) => frames.sos_vaddr(frame) + offset,
            None => 0,
        }
    }

    //  ---  Mapping  ---

    /// Installs a PTE for a freshly allocated frame and links it at the
    /// tail of the clock ring. New pages start unreferenced; mapping
    /// references them.
    pub fn add_page(&mut self, vaddr: usize, frame: FrameId) -> Result<PteId, SosError> {
        trace!("add_page {:#x} frame {}", vaddr, frame);
        let pd_idx = pd_index(vaddr);
        if self.dir[pd_idx].is_none() {
            self.dir[pd_idx] = Some(Box::new([None; PT_SIZE]));
        }
        let leaf = self.dir[pd_idx].as_mut().expect("leaf just installed");
        let pt_idx = pt_index(vaddr);
        if leaf[pt_idx].is_some() {
            error!("add_page: {:#x} already present", vaddr);
            return Err(SosError::InvalidArgument);
        }
        let id = self.ptes.insert(Pte {
            backing: PageBacking::Frame(frame),
            cap: None,
            referenced: false,
            pinned: false,
            next: 0,
            prev: 0,
        });
        leaf[pt_idx] = Some(id);
        self.ring_push_tail(id);
        self.total_pages += 1;
        self.evictable_pages += 1;
        Ok(id)
    }

    /// Installs the kernel mapping for an existing PTE, creating the
    /// leaf page table on demand.
    pub fn map_page(
        &mut self,
        vaddr: usize,
        frame_cap: CPtr,
        rights: CapRights,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) -> Result<(), SosError> {
        trace!("map_page {:#x} {:?}", vaddr, rights);
        let Some(id) = self.lookup_pte(vaddr) else {
            return Err(SosError::InvalidArgument);
        };
        // The mapping uses its own copy of the frame cap so the frame
        // table's original survives revocation of client mappings.
        let mapping = kernel.copy_cap(frame_cap, CapRights::all())?;
        let mut result = kernel.map_frame(mapping, self.dir_cap, page_align(vaddr), rights);
        if result == Err(MapError::MissingPageTable) {
            self.install_leaf_pagetable(vaddr, untyped, kernel)?;
            result = kernel.map_frame(mapping, self.dir_cap, page_align(vaddr), rights);
        }
        if let Err(e) = result {
            error!("map_page {:#x} failed: {:?}", vaddr, e);
            kernel.delete(mapping);
            return Err(SosError::InvalidArgument);
        }
        let pte = self.ptes.get_mut(id);
        debug_assert!(pte.cap.is_none());
        pte.cap = Some(mapping);
        pte.referenced = true;
        Ok(())
    }

    fn install_leaf_pagetable(
        &mut self,
        vaddr: usize,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) -> Result<(), SosError> {
        let Some(paddr) = untyped.alloc(PAGE_TABLE_SIZE_BITS) else {
            error!("leaf page table: out of untyped memory");
            return Err(SosError::OutOfMemory);
        };
        let cap = match kernel.retype_page_table(paddr) {
            Ok(cap) => cap,
            Err(e) => {
                untyped.free(paddr, PAGE_TABLE_SIZE_BITS);
                return Err(e);
            }
        };
        if let Err(e) = kernel.map_page_table(cap, self.dir_cap, page_align(vaddr)) {
            kernel.delete(cap);
            untyped.free(paddr, PAGE_TABLE_SIZE_BITS);
            return Err(e);
        }
        // Shadow record for teardown.
        self.kpts.push(KernelPageTable {
            cap,
            paddr,
            vaddr: page_align(vaddr),
        });
        Ok(())
    }

    /// `add_page` + `map_page` for a frame the caller already owns. On
    /// failure the PTE is removed and the frame ownership returns to
    /// the caller.
    pub fn install_page(
        &mut self,
        vaddr: usize,
        frame: FrameId,
        rights: CapRights,
        frames: &mut FrameTable,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) -> Result<PteId, SosError> {
        let id = self.add_page(vaddr, frame)?;
        if let Err(e) = self.map_page(vaddr, frames.cap_of(frame), rights, untyped, kernel) {
            self.remove_page(vaddr);
            return Err(e);
        }
        Ok(id)
    }

    /// Allocates a frame and installs it at `vaddr`. Any partial work
    /// is unwound before an error propagates.
    pub fn create_page(
        &mut self,
        vaddr: usize,
        rights: CapRights,
        frames: &mut FrameTable,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) -> Result<FrameId, SosError> {
        trace!("create_page {:#x}", vaddr);
        let frame = frames.alloc(untyped, kernel)?;
        if let Err(e) = self.install_page(vaddr, frame, rights, frames, untyped, kernel) {
            frames.free(frame, untyped, kernel);
            return Err(e);
        }
        Ok(frame)
    }

    // Unlinks a PTE (failed install). The backing frame is the
    // caller's to release.
    fn remove_page(&mut self, vaddr: usize) {
        let pd_idx = pd_index(vaddr);
        let pt_idx = pt_index(vaddr);
        let Some(leaf) = self.dir[pd_idx].as_mut() else {
            return;
        };
        let Some(id) = leaf[pt_idx].take() else {
            return;
        };
        self.ring_remove(id);
        let pte = self.ptes.remove(id);
        if !pte.pinned {
            self.evictable_pages -= 1;
        }
        self.total_pages -= 1;
    }

    /// Re-maps an existing resident frame after a fault on an
    /// unreferenced page, setting the reference bit again.
    pub fn reference_page(
        &mut self,
        vaddr: usize,
        rights: CapRights,
        frames: &FrameTable,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) -> Result<(), SosError> {
        let Some(id) = self.lookup_pte(vaddr) else {
            return Err(SosError::InvalidArgument);
        };
        let Some(frame) = self.ptes.get(id).frame() else {
            return Err(SosError::InvalidArgument);
        };
        self.map_page(vaddr, frames.cap_of(frame), rights, untyped, kernel)
    }

    pub fn is_referenced(&self, vaddr: usize) -> bool {
        self.lookup_pte(vaddr)
            .map(|id| self.ptes.get(id).referenced)
            .unwrap_or(false)
    }

    pub fn is_swapped(&self, vaddr: usize) -> bool {
        self.lookup_pte(vaddr)
            .map(|id| self.ptes.get(id).is_swapped())
            .unwrap_or(false)
    }

    //  ---  Pinning  ---

    pub fn pin(&mut self, vaddr: usize) {
        if let Some(id) = self.lookup_pte(vaddr) {
            self.pin_pte(id);
        }
    }

    pub fn unpin(&mut self, vaddr: usize) {
        if let Some(id) = self.lookup_pte(vaddr) {
            self.unpin_pte(id);
        }
    }

    pub fn pin_pte(&mut self, id: PteId) {
        let pte = self.ptes.get_mut(id);
        if !pte.pinned {
            pte.pinned = true;
            self.evictable_pages -= 1;
        }
    }

    pub fn unpin_pte(&mut self, id: PteId) {
        let pte = self.ptes.get_mut(id);
        if pte.pinned {
            pte.pinned = false;
            self.evictable_pages += 1;
        }
    }

    //  ---  Second-chance scan support  ---

    pub fn clock_head(&self) -> Option<PteId> { self.clock_head }

    fn ring_push_tail(&mut self, id: PteId) {
        match (self.clock_head, self.clock_tail) {
            (Some(head), Some(tail)) => {
                self.ptes.get_mut(tail).next = id;
                self.ptes.get_mut(head).prev = id;
                let pte = self.ptes.get_mut(id);
                pte.prev = tail;
                pte.next = head;
                self.clock_tail = Some(id);
            }
            _ => {
                // One-element ring: the entry links to itself.
                let pte = self.ptes.get_mut(id);
                pte.next = id;
                pte.prev = id;
                self.clock_head = Some(id);
                self.clock_tail = Some(id);
            }
        }
    }

    fn ring_remove(&mut self, id: PteId) {
        let (prev, next) = {
            let pte = self.ptes.get(id);
            (pte.prev, pte.next)
        };
        if next == id {
            self.clock_head = None;
            self.clock_tail = None;
            return;
        }
        self.ptes.get_mut(prev).next = next;
        self.ptes.get_mut(next).prev = prev;
        if self.clock_head == Some(id) {
            self.clock_head = Some(next);
        }
        if self.clock_tail == Some(id) {
            self.clock_tail = Some(prev);
        }
    }

    // Advances the clock hand one entry.
    fn clock_advance(&mut self) {
        if let Some(head) = self.clock_head {
            self.clock_tail = Some(head);
            self.clock_head = Some(self.ptes.get(head).next);
        }
    }

    /// Drops the kernel mapping of a PTE and clears its reference bit
    /// (the "second chance").
    pub fn clear_reference(&mut self, id: PteId, kernel: &mut dyn KernelInterface) {
        let pte = self.ptes.get_mut(id);
        if let Some(cap) = pte.cap.take() {
            kernel.unmap_frame(cap);
            kernel.revoke(cap);
            kernel.delete(cap);
        }
        pte.referenced = false;
    }

    /// Second-chance victim selection over the clock ring. Referenced
    /// entries are unmapped and given a second pass; pinned or swapped
    /// entries are skipped. After two full loops with no candidate the
    /// address space has nothing evictable and `OutOfMemory` is
    /// returned — the caller kills the owner rather than spin.
    pub fn choose_victim(
        &mut self,
        kernel: &mut dyn KernelInterface,
    ) -> Result<PteId, SosError> {
        let Some(start) = self.clock_head else {
            return Err(SosError::OutOfMemory);
        };
        let mut loop_count = 0;
        loop {
            let head = match self.clock_head {
                Some(h) => h,
                None => return Err(SosError::OutOfMemory),
            };
            if head == start {
                if loop_count > 1 {
                    debug!("no evictable page");
                    return Err(SosError::OutOfMemory);
                }
                loop_count += 1;
            }
            let (pinned, swapped, referenced) = {
                let pte = self.ptes.get(head);
                (pte.pinned, pte.is_swapped(), pte.referenced)
            };
            if pinned || swapped {
                self.clock_advance();
                continue;
            }
            if referenced {
                self.clock_advance();
                self.clear_reference(head, kernel);
                continue;
            }
            self.clock_advance();
            return Ok(head);
        }
    }

    /// Finalizes an eviction: the victim now lives in the swap file at
    /// `offset`. The pin taken for the write is released without
    /// returning the page to the evictable count (it is no longer
    /// resident).
    pub fn complete_eviction(&mut self, id: PteId, offset: sos_swap_store::SwapOffset) {
        let pte = self.ptes.get_mut(id);
        debug_assert!(pte.cap.is_none());
        pte.backing = PageBacking::Swapped(offset);
        pte.pinned = false;
        pte.referenced = false;
    }

    /// Finalizes a swap-in: the PTE becomes resident in `frame`,
    /// unmapped and unreferenced until the faulting path re-maps it.
    pub fn complete_swap_in(&mut self, id: PteId, frame: FrameId) {
        let pte = self.ptes.get_mut(id);
        debug_assert!(pte.is_swapped());
        debug_assert!(!pte.pinned);
        pte.backing = PageBacking::Frame(frame);
        pte.referenced = false;
        self.evictable_pages += 1;
    }

    //  ---  Destruction  ---

    /// Releases everything the address space owns: regions, kernel
    /// page-table shadows, every PTE (frames or swap slots), and the
    /// page directory. Safe to call mid-fault; no frame or capability
    /// may leak.
    pub fn teardown(
        &mut self,
        frames: &mut FrameTable,
        swap: &mut SwapStore,
        untyped: &mut dyn UntypedArena,
        kernel: &mut dyn KernelInterface,
    ) {
        trace!("teardown: {} pages", self.total_pages);
        self.regions.clear();
        self.heap = None;
        self.stack = None;

        for kpt in self.kpts.drain(..) {
            kernel.revoke(kpt.cap);
            kernel.delete(kpt.cap);
            untyped.free(kpt.paddr, PAGE_TABLE_SIZE_BITS);
        }

        let ids: Vec<PteId> = self.ptes.iter_ids().collect();
        for id in ids {
            let pte = self.ptes.remove(id);
            match pte.backing {
                PageBacking::Swapped(offset) => swap.free_slot(offset),
                PageBacking::Frame(frame) => {
                    if let Some(cap) = pte.cap {
                        kernel.unmap_frame(cap);
                        kernel.revoke(cap);
                        kernel.delete(cap);
                    }
                    frames.free(frame, untyped, kernel);
                }
            }
        }
        self.clock_head = None;
        self.clock_tail = None;
        for cell in self.dir.iter_mut() {
            *cell = None;
        }
        self.evictable_pages = 0;
        self.total_pages = 0;

        if self.dir_cap != sos_os_common::caps::CAP_NULL {
            kernel.revoke(self.dir_cap);
            kernel.delete(self.dir_cap);
            untyped.free(self.dir_paddr, PAGE_DIR_SIZE_BITS);
            self.dir_cap = sos_os_common::caps::CAP_NULL;
        }
    }

    #[cfg(test)]
    fn ring_len(&self) -> usize {
        let Some(start) = self.clock_head else {
            return 0;
        };
        let mut n = 1;
        let mut cur = self.ptes.get(start).next;
        while cur != start {
            n += 1;
            cur = self.ptes.get(cur).next;
        }
        n
    }
}

#[cfg(test)]
mod tests;
