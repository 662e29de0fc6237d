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

use super::*;
use hashbrown::{HashMap, HashSet};
use sos_frame_table::{BootUntyped, UntypedDesc};
use sos_os_common::kernel::{IpcLabel, IpcMessage};
use sos_os_common::mem::PAGE_SIZE;
use sos_os_common::vmem_layout::PROCESS_IPC_BUFFER;
use sos_os_common::Word;

// Kernel model: enough of caps, retype, copies and two-level mapping to
// exercise the address space, with bookkeeping for leak checks.
#[derive(Default)]
struct FakeKernel {
    next_cap: CPtr,
    // All live caps (originals and copies).
    live: HashSet<CPtr>,
    // copy -> original
    copies: HashMap<CPtr, CPtr>,
    storage: HashMap<CPtr, Box<[u8; PAGE_SIZE]>>,
    window: HashSet<CPtr>,
    // root -> leaf-table bases (vaddr >> 22)
    page_tables: HashMap<CPtr, HashSet<usize>>,
    // (root, vaddr) -> mapping cap
    mappings: HashMap<(CPtr, usize), CPtr>,
}

impl FakeKernel {
    fn new() -> Self {
        FakeKernel {
            next_cap: 100,
            ..Default::default()
        }
    }

    fn fresh(&mut self) -> CPtr {
        let cap = self.next_cap;
        self.next_cap += 1;
        self.live.insert(cap);
        cap
    }

    fn live_caps(&self) -> usize { self.live.len() }

    fn is_mapped(&self, root: CPtr, vaddr: usize) -> bool {
        self.mappings.contains_key(&(root, page_align(vaddr)))
    }
}

impl KernelInterface for FakeKernel {
    fn retype_frame(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> {
        let cap = self.fresh();
        self.storage.insert(cap, Box::new([0; PAGE_SIZE]));
        Ok(cap)
    }
    fn retype_page_table(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> {
        Ok(self.fresh())
    }
    fn retype_page_directory(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> {
        Ok(self.fresh())
    }
    fn retype_tcb(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> { Ok(self.fresh()) }
    fn copy_cap(&mut self, cap: CPtr, _rights: CapRights) -> Result<CPtr, SosError> {
        assert!(self.live.contains(&cap));
        let copy = self.fresh();
        self.copies.insert(copy, cap);
        Ok(copy)
    }
    fn mint_endpoint(&mut self, _ep: CPtr, _badge: Word) -> Result<CPtr, SosError> {
        Ok(self.fresh())
    }
    fn revoke(&mut self, cap: CPtr) {
        let derived: Vec<CPtr> = self
            .copies
            .iter()
            .filter(|(_, &orig)| orig == cap)
            .map(|(&c, _)| c)
            .collect();
        for c in derived {
            self.delete(c);
        }
    }
    fn delete(&mut self, cap: CPtr) {
        self.live.remove(&cap);
        self.copies.remove(&cap);
        self.storage.remove(&cap);
        self.window.remove(&cap);
        self.mappings.retain(|_, &mut c| c != cap);
        self.page_tables.remove(&cap);
    }
    fn map_frame(
        &mut self,
        frame: CPtr,
        root: CPtr,
        vaddr: usize,
        _rights: CapRights,
    ) -> Result<(), MapError> {
        assert!(self.live.contains(&frame));
        if !self
            .page_tables
            .get(&root)
            .map(|pts| pts.contains(&(vaddr >> 22)))
            .unwrap_or(false)
        {
            return Err(MapError::MissingPageTable);
        }
        if self.mappings.contains_key(&(root, vaddr)) {
            return Err(MapError::Failed);
        }
        self.mappings.insert((root, vaddr), frame);
        Ok(())
    }
    fn unmap_frame(&mut self, frame: CPtr) {
        self.mappings.retain(|_, &mut c| c != frame);
    }
    fn map_page_table(&mut self, pt: CPtr, root: CPtr, vaddr: usize) -> Result<(), SosError> {
        assert!(self.live.contains(&pt));
        self.page_tables.entry(root).or_default().insert(vaddr >> 22);
        Ok(())
    }
    fn map_window(&mut self, frame: CPtr, _vaddr: usize) -> Result<(), SosError> {
        self.window.insert(frame);
        Ok(())
    }
    fn unmap_window(&mut self, frame: CPtr) {
        self.window.remove(&frame);
    }
    fn frame_bytes(&mut self, frame: CPtr) -> &mut [u8] {
        assert!(self.window.contains(&frame), "frame not window-mapped");
        &mut self.storage.get_mut(&frame).unwrap()[..]
    }
    fn configure_tcb(
        &mut self,
        _: CPtr,
        _: CPtr,
        _: CPtr,
        _: usize,
        _: CPtr,
    ) -> Result<(), SosError> {
        Ok(())
    }
    fn start_thread(&mut self, _: CPtr, _: usize, _: usize) -> Result<(), SosError> { Ok(()) }
    fn wait(&mut self) -> Option<IpcMessage> { None }
    fn save_reply(&mut self) -> Result<CPtr, SosError> { Ok(self.fresh()) }
    fn reply(&mut self, cap: CPtr, _: IpcLabel, _: &[Word]) {
        self.delete(cap);
    }
    fn flush_icache(&mut self, _: CPtr) {}
}

struct Fixture {
    kernel: FakeKernel,
    untyped: BootUntyped,
    frames: FrameTable,
    swap: SwapStore,
}

impl Fixture {
    fn new() -> Self {
        Fixture {
            kernel: FakeKernel::new(),
            untyped: BootUntyped::new(&[UntypedDesc {
                paddr: 0x4000_0000,
                size_bits: 22, // 4M
            }]),
            frames: FrameTable::new(64),
            swap: SwapStore::new(16 * PAGE_SIZE),
        }
    }

    fn aspace(&mut self) -> AddressSpace {
        AddressSpace::new(&mut self.frames, &mut self.untyped, &mut self.kernel).unwrap()
    }
}

const CODE: usize = 0x0001_0000;

#[test]
fn test_region_overlap_rejected() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    aspace
        .create_region(CODE, CODE + 0x4000, CapRights::READ | CapRights::EXECUTE, Some(0x200))
        .unwrap();
    // Any intersection is rejected, including full containment.
    assert!(aspace
        .create_region(CODE + 0x1000, CODE + 0x2000, CapRights::READ, None)
        .is_err());
    assert!(aspace
        .create_region(CODE - 0x1000, CODE + 0x1000, CapRights::READ, None)
        .is_err());
    // Abutting is fine: ranges are half-open.
    assert!(aspace
        .create_region(CODE + 0x4000, CODE + 0x5000, CapRights::READ, None)
        .is_ok());

    let region = aspace.region_of(CODE + 0xabc).unwrap();
    assert_eq!(region.elf_offset, Some(0x200));
    assert!(aspace.region_of(0x0000_f000).is_none());
}

#[test]
fn test_brk() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    aspace
        .create_region(0x0003_0000, 0x0004_0000, CapRights::RW, Some(0))
        .unwrap();
    aspace.activate().unwrap();

    let initial = aspace.brk(0);
    assert!(initial > 0x0004_0000);
    assert_eq!(aspace.brk(0x0004_5000), 0x0004_5000);
    // brk(x); brk(0) == x
    assert_eq!(aspace.brk(0), 0x0004_5000);
    // Just below the stack is allowed.
    assert_eq!(aspace.brk(PROCESS_STACK_BOTTOM - 0x10), PROCESS_STACK_BOTTOM - 0x10);
    // Into the stack, or below the heap base, is not.
    assert_eq!(aspace.brk(PROCESS_STACK_BOTTOM + 1), 0);
    assert_eq!(aspace.brk(0x1000), 0);
}

#[test]
fn test_create_page_and_lookup() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    aspace.create_region(CODE, CODE + 0x4000, CapRights::RW, None).unwrap();

    let frame = aspace
        .create_page(CODE, CapRights::RW, &mut f.frames, &mut f.untyped, &mut f.kernel)
        .unwrap();
    assert!(aspace.page_exists(CODE));
    assert!(!aspace.page_exists(CODE + PAGE_SIZE));
    assert!(aspace.is_referenced(CODE));
    assert!(f.kernel.is_mapped(aspace.vspace_root(), CODE));

    // Window address = frame window slot + intra-page offset.
    let sos_va = aspace.lookup_sos_vaddr(CODE + 0xabc, &f.frames);
    assert_eq!(sos_va, f.frames.sos_vaddr(frame) + 0xabc);
    assert_eq!(aspace.lookup_sos_vaddr(CODE + PAGE_SIZE, &f.frames), 0);
}

#[test]
fn test_one_element_ring_is_self_loop() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    // The IPC buffer page from construction is the only ring entry.
    let id = aspace.lookup_pte(PROCESS_IPC_BUFFER).unwrap();
    assert_eq!(aspace.ring_len(), 1);
    assert_eq!(aspace.pte(id).next, id);
    assert_eq!(aspace.pte(id).prev, id);
}

#[test]
fn test_pin_counters() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    aspace.create_region(CODE, CODE + 0x4000, CapRights::RW, None).unwrap();
    aspace
        .create_page(CODE, CapRights::RW, &mut f.frames, &mut f.untyped, &mut f.kernel)
        .unwrap();

    // IPC buffer is pinned; the new page is the only evictable one.
    assert_eq!(aspace.page_count(), 2);
    assert_eq!(aspace.evictable_pages(), 1);
    aspace.pin(CODE);
    assert_eq!(aspace.evictable_pages(), 0);
    // Double pin must not double-count.
    aspace.pin(CODE);
    assert_eq!(aspace.evictable_pages(), 0);
    aspace.unpin(CODE);
    assert_eq!(aspace.evictable_pages(), 1);
}

#[test]
fn test_second_chance_victim() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    aspace.create_region(CODE, CODE + 0x10000, CapRights::RW, None).unwrap();

    // Three mapped-and-referenced pages (creation references them).
    for i in 0..3 {
        aspace
            .create_page(
                CODE + i * PAGE_SIZE,
                CapRights::RW,
                &mut f.frames,
                &mut f.untyped,
                &mut f.kernel,
            )
            .unwrap();
    }
    let a = aspace.lookup_pte(CODE).unwrap();

    // Every entry gets its second chance first, so the scan strips the
    // reference bits in ring order and returns to the oldest entry.
    // (The pinned IPC page ahead of them in the ring is skipped.)
    let victim = aspace.choose_victim(&mut f.kernel).unwrap();
    assert_eq!(victim, a);
    assert!(!aspace.pte(a).referenced);
    assert!(aspace.pte(a).cap.is_none());
    assert!(!f.kernel.is_mapped(aspace.vspace_root(), CODE));
    // Clearing a reference bit also drops the mapping so the next
    // touch faults and re-references.
    assert!(!aspace.is_referenced(CODE + PAGE_SIZE));
    assert!(!f.kernel.is_mapped(aspace.vspace_root(), CODE + PAGE_SIZE));
}

#[test]
fn test_all_pinned_means_oom() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    aspace.create_region(CODE, CODE + 0x10000, CapRights::RW, None).unwrap();
    for i in 0..2 {
        aspace
            .create_page(
                CODE + i * PAGE_SIZE,
                CapRights::RW,
                &mut f.frames,
                &mut f.untyped,
                &mut f.kernel,
            )
            .unwrap();
        aspace.pin(CODE + i * PAGE_SIZE);
    }
    assert_eq!(aspace.choose_victim(&mut f.kernel), Err(SosError::OutOfMemory));
}

#[test]
fn test_eviction_and_swap_in_roundtrip_state() {
    let mut f = Fixture::new();
    let mut aspace = f.aspace();
    aspace.create_region(CODE, CODE + 0x4000, CapRights::RW, None).unwrap();
    let frame = aspace
        .create_page(CODE, CapRights::RW, &mut f.frames, &mut f.untyped, &mut f.kernel)
        .unwrap();
    let id = aspace.lookup_pte(CODE).unwrap();

    // Evict: pin for the write, drop the mapping, retag as swapped.
    aspace.pin_pte(id);
    aspace.clear_reference(id, &mut f.kernel);
    let slot = f.swap.alloc_slot().unwrap();
    aspace.complete_eviction(id, slot);
    assert!(aspace.is_swapped(CODE));
    assert_eq!(aspace.pte(id).swap_offset(), Some(slot));
    assert_eq!(aspace.evictable_pages(), 0);
    assert_eq!(aspace.lookup_sos_vaddr(CODE, &f.frames), 0);
    f.frames.free(frame, &mut f.untyped, &mut f.kernel);

    // Swap in to a new frame; the fault path re-references it.
    let frame2 = f.frames.alloc(&mut f.untyped, &mut f.kernel).unwrap();
    aspace.complete_swap_in(id, frame2);
    f.swap.free_slot(slot);
    assert!(!aspace.is_swapped(CODE));
    assert_eq!(aspace.evictable_pages(), 1);
    assert!(!aspace.is_referenced(CODE));
    aspace
        .reference_page(CODE, CapRights::RW, &f.frames, &mut f.untyped, &mut f.kernel)
        .unwrap();
    assert!(aspace.is_referenced(CODE));
}

#[test]
fn test_teardown_leaks_nothing() {
    let mut f = Fixture::new();
    let baseline_bytes = f.untyped.free_bytes();
    let baseline_caps = f.kernel.live_caps();

    let mut aspace = f.aspace();
    aspace.create_region(CODE, CODE + 0x10000, CapRights::RW, None).unwrap();
    // Pages in two different leaf tables.
    aspace
        .create_page(CODE, CapRights::RW, &mut f.frames, &mut f.untyped, &mut f.kernel)
        .unwrap();
    aspace.create_region(0x0050_0000, 0x0051_0000, CapRights::RW, None).unwrap();
    aspace
        .create_page(0x0050_0000, CapRights::RW, &mut f.frames, &mut f.untyped, &mut f.kernel)
        .unwrap();

    // One page parked in swap.
    let id = aspace.lookup_pte(CODE).unwrap();
    let frame = aspace.pte(id).frame().unwrap();
    aspace.pin_pte(id);
    aspace.clear_reference(id, &mut f.kernel);
    let slot = f.swap.alloc_slot().unwrap();
    aspace.complete_eviction(id, slot);
    f.frames.free(frame, &mut f.untyped, &mut f.kernel);

    aspace.teardown(&mut f.frames, &mut f.swap, &mut f.untyped, &mut f.kernel);

    assert_eq!(f.frames.stats().allocated_frames, 0);
    assert_eq!(f.swap.stats().allocated_slots, 0);
    assert_eq!(f.untyped.free_bytes(), baseline_bytes);
    assert_eq!(f.kernel.live_caps(), baseline_caps);
    assert_eq!(aspace.page_count(), 0);
}
