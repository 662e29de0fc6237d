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

//! Demand paging: fault handling, second-chance eviction, swap I/O and
//! ELF-backed loads.
//!
//! Every path here is re-entrant. Progress lives in the faulting
//! process's continuation; a yield returns `Step::Pending` and the
//! matching completion re-enters the same function, which skips the
//! phases already done.

use crate::continuation::{PendingOp, SwapStatus};
use crate::iovec::IoSpan;
use crate::ready;
use crate::{Flow, Step};
use alloc::vec::Vec;
use log::{debug, error, warn};
use sos_frame_table::FrameId;
use sos_interface::BINARY_FD;
use sos_os_common::caps::CapRights;
use sos_os_common::error::SosError;
use sos_os_common::files::{FileError, FileHandle, FileServerInterface};
use sos_os_common::kernel::KernelInterface;
use sos_os_common::mem::{page_align, PAGE_SIZE};
use sos_os_common::serial::SerialInterface;
use sos_os_common::timer::TimerInterface;
use sos_os_common::Pid;
use sos_swap_store::SWAP_FILE_NAME;

use crate::server::SosServer;

impl<K, F, S, T> SosServer<K, F, S, T>
where
    K: KernelInterface,
    F: FileServerInterface,
    S: SerialInterface,
    T: TimerInterface,
{
    pub(crate) fn handle_fault(&mut self, pid: Pid) {
        match self.vm_fault(pid) {
            Ok(Step::Done(())) => self.end_syscall(pid, 0, true),
            Ok(Step::Pending) => {}
            Err(SosError::ProcessGone) => {}
            Err(e) => {
                // Access violations and paging failures are fatal for
                // the faulting process.
                error!("fault for pid {} not handled ({:?}); killing it", pid, e);
                self.kill(pid);
            }
        }
    }

    /// The fault handler proper. Denies access outside the region
    /// model, swaps in or re-references existing pages, and allocates
    /// (and possibly demand-loads) new ones.
    pub(crate) fn vm_fault(&mut self, pid: Pid) -> Flow {
        let (addr, is_write, binary_fired) = {
            let Some(proc) = self.procs.get(pid) else {
                return Err(SosError::ProcessGone);
            };
            (
                proc.cont.fault_addr,
                proc.cont.fault_write,
                proc.cont.binary_read_fired,
            )
        };
        let (rights, elf_offset, region_start, region_end) = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            let Some(region) = proc.addrspace.region_of(addr) else {
                debug!("fault at {:#x}: outside every region", addr);
                return Err(SosError::FaultOutsideRegion);
            };
            (region.rights, region.elf_offset, region.start, region.end)
        };
        if is_write && !rights.contains(CapRights::WRITE) {
            debug!("fault at {:#x}: region not writable", addr);
            return Err(SosError::PermissionDenied);
        }
        if !is_write && !rights.contains(CapRights::READ) {
            debug!("fault at {:#x}: region not readable", addr);
            return Err(SosError::PermissionDenied);
        }

        let exists = self
            .procs
            .get(pid)
            .map(|p| p.addrspace.page_exists(addr))
            .unwrap_or(false);
        if exists && !binary_fired {
            let (swapped, referenced) = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                (
                    proc.addrspace.is_swapped(addr),
                    proc.addrspace.is_referenced(addr),
                )
            };
            if swapped {
                ready!(self.swap_in(pid, addr)?);
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.addrspace.reference_page(
                    addr,
                    rights,
                    &self.frames,
                    &mut self.untyped,
                    &mut self.kernel,
                )?;
                proc.cont.eviction_target = None;
            } else if !referenced {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.addrspace.reference_page(
                    addr,
                    rights,
                    &self.frames,
                    &mut self.untyped,
                    &mut self.kernel,
                )?;
            } else {
                // Mapped and referenced; nothing left to do.
                debug!("spurious fault at {:#x}", addr);
            }
            return Ok(Step::Done(()));
        }

        // A page that does not exist yet.
        let created = self
            .procs
            .get(pid)
            .map(|p| p.cont.create_page_done)
            .unwrap_or(false);
        if !created {
            let frame = ready!(self.alloc_user_frame(pid)?);
            let Some(proc) = self.procs.get_mut(pid) else {
                self.frames.free(frame, &mut self.untyped, &mut self.kernel);
                return Err(SosError::ProcessGone);
            };
            if let Err(e) = proc.addrspace.install_page(
                addr,
                frame,
                rights,
                &mut self.frames,
                &mut self.untyped,
                &mut self.kernel,
            ) {
                self.frames.free(frame, &mut self.untyped, &mut self.kernel);
                return Err(e);
            }
            proc.cont.create_page_done = true;
        }
        if elf_offset.is_some() {
            ready!(self.load_page_from_binary(pid, addr, region_start, region_end, elf_offset)?);
        }
        Ok(Step::Done(()))
    }

    /// Faults in one page of an iovec target; the fault path minus the
    /// ELF-load case (anonymous pages only need a frame).
    pub(crate) fn ensure_loaded(&mut self, pid: Pid, vaddr: usize) -> Flow {
        let (rights, exists) = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            let Some(region) = proc.addrspace.region_of(vaddr) else {
                return Err(SosError::FaultOutsideRegion);
            };
            (region.rights, proc.addrspace.page_exists(vaddr))
        };
        if exists {
            let (swapped, referenced) = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                (
                    proc.addrspace.is_swapped(vaddr),
                    proc.addrspace.is_referenced(vaddr),
                )
            };
            if swapped {
                ready!(self.swap_in(pid, vaddr)?);
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.addrspace.reference_page(
                    vaddr,
                    rights,
                    &self.frames,
                    &mut self.untyped,
                    &mut self.kernel,
                )?;
                proc.cont.eviction_target = None;
            } else if !referenced {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.addrspace.reference_page(
                    vaddr,
                    rights,
                    &self.frames,
                    &mut self.untyped,
                    &mut self.kernel,
                )?;
            }
            return Ok(Step::Done(()));
        }
        let frame = ready!(self.alloc_user_frame(pid)?);
        let Some(proc) = self.procs.get_mut(pid) else {
            self.frames.free(frame, &mut self.untyped, &mut self.kernel);
            return Err(SosError::ProcessGone);
        };
        if let Err(e) = proc.addrspace.install_page(
            vaddr,
            frame,
            rights,
            &mut self.frames,
            &mut self.untyped,
            &mut self.kernel,
        ) {
            self.frames.free(frame, &mut self.untyped, &mut self.kernel);
            return Err(e);
        }
        Ok(Step::Done(()))
    }

    //  ---  Frame allocation under memory pressure  ---

    /// Allocates a user frame, evicting a page first when the table is
    /// exhausted. Eviction recurses at most once (the victim is pinned
    /// for the duration, so a nested request cannot pick it again).
    pub(crate) fn alloc_user_frame(&mut self, pid: Pid) -> Flow<FrameId> {
        match self.frames.alloc(&mut self.untyped, &mut self.kernel) {
            Ok(frame) => Ok(Step::Done(frame)),
            Err(SosError::OutOfMemory) => {
                ready!(self.evict_page(pid)?);
                self.frames
                    .alloc(&mut self.untyped, &mut self.kernel)
                    .map(Step::Done)
            }
            Err(e) => Err(e),
        }
    }

    // The address space with the most evictable pages gives one up.
    fn select_eviction_target(&self, fallback: Pid) -> Pid {
        self.procs
            .iter()
            .max_by_key(|p| p.addrspace.evictable_pages())
            .filter(|p| p.addrspace.evictable_pages() > 0)
            .map(|p| p.pid)
            .unwrap_or(fallback)
    }

    // No page can be evicted: kill the target rather than spin. The
    // initiator (if it survives) gets an out-of-memory reply.
    fn oom_kill(&mut self, pid: Pid, target: Pid) {
        warn!("no evictable page; killing pid {}", target);
        if target != pid {
            self.end_syscall(pid, SosError::OutOfMemory.errno(), false);
        }
        self.kill(target);
    }

    /// Re-entrant eviction. First entry picks and pins a victim and
    /// fires the swap write; the completion re-enters to retag the PTE
    /// and free the frame.
    pub(crate) fn evict_page(&mut self, pid: Pid) -> Flow {
        let chosen = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.replacement_victim.is_some()
        };
        if !chosen {
            let target = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.eviction_target
            }
            .unwrap_or_else(|| self.select_eviction_target(pid));
            let victim = {
                let Some(target_proc) = self.procs.get_mut(target) else {
                    return Err(SosError::ProcessGone);
                };
                target_proc.addrspace.choose_victim(&mut self.kernel)
            };
            let victim = match victim {
                Ok(v) => v,
                Err(_) => {
                    self.oom_kill(pid, target);
                    return Err(SosError::ProcessGone);
                }
            };
            let frame = {
                let target_proc = self.procs.get_mut(target).ok_or(SosError::ProcessGone)?;
                target_proc.addrspace.pin_pte(victim);
                target_proc.addrspace.pte(victim).frame()
            };
            let Some(frame) = frame else {
                error!("eviction victim is not resident");
                return Err(SosError::OutOfMemory);
            };
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.eviction_target = Some(target);
            proc.cont.replacement_victim = Some(victim);
            proc.cont.swap_frame = Some(frame);
        }

        let fired = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.swap_write_fired
        };
        if !fired {
            // Covers both the first issue and the retry after the swap
            // file had to be created.
            self.swap_write_begin(pid)?;
            return Ok(Step::Pending);
        }

        let status = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.swap_status
        };
        match status {
            SwapStatus::Success => {
                let (target, victim, frame, offset) = {
                    let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                    let target = proc.cont.eviction_target.take();
                    let victim = proc.cont.replacement_victim.take();
                    let frame = proc.cont.swap_frame.take();
                    let offset = proc.cont.swap_offset;
                    proc.cont.swap_write_fired = false;
                    proc.cont.swap_status = SwapStatus::Idle;
                    proc.cont.swap_count = 0;
                    proc.cont.swap_offset = 0;
                    (target, victim, frame, offset)
                };
                if let (Some(target), Some(victim)) = (target, victim) {
                    if let Some(target_proc) = self.procs.get_mut(target) {
                        // The written bytes are still current even if
                        // the client re-touched the page: the frame was
                        // pinned and immutable mappings-wise during the
                        // write. Drop any mapping re-established in the
                        // interim before retagging.
                        target_proc.addrspace.clear_reference(victim, &mut self.kernel);
                        target_proc.addrspace.complete_eviction(victim, offset);
                    }
                }
                if let Some(frame) = frame {
                    self.frames.free(frame, &mut self.untyped, &mut self.kernel);
                }
                self.stats.evictions += 1;
                Ok(Step::Done(()))
            }
            SwapStatus::Failed => Err(SosError::SwapIoFailure),
            _ => Ok(Step::Pending),
        }
    }

    /// Starts the swap write for the chosen victim, creating the swap
    /// file first if it does not exist yet.
    fn swap_write_begin(&mut self, pid: Pid) -> Result<(), SosError> {
        let token = self.token(pid).ok_or(SosError::ProcessGone)?;
        {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.swap_status = SwapStatus::Running;
        }
        if !self.swap.is_initialized() {
            debug!("creating swap file");
            {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.pending_op = Some(PendingOp::SwapFileCreate);
            }
            self.files
                .create(SWAP_FILE_NAME, token)
                .map_err(|_| SosError::SwapIoFailure)?;
            return Ok(());
        }

        let Some(slot) = self.swap.alloc_slot() else {
            error!("swap file is full");
            let (target, victim) = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                (proc.cont.eviction_target, proc.cont.replacement_victim)
            };
            // Leave the victim usable before the initiator dies.
            if let (Some(target), Some(victim)) = (target, victim) {
                if let Some(target_proc) = self.procs.get_mut(target) {
                    target_proc.addrspace.unpin_pte(victim);
                }
            }
            self.kill(pid);
            return Err(SosError::ProcessGone);
        };
        let frame = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.swap_offset = slot;
            proc.cont.swap_count = 0;
            proc.cont.pending_op = Some(PendingOp::SwapWrite);
            proc.cont.swap_frame
        };
        let Some(frame) = frame else {
            return Err(SosError::SwapIoFailure);
        };
        let Some(handle) = self.swap.handle() else {
            return Err(SosError::SwapIoFailure);
        };
        let cap = self.frames.cap_of(frame);
        let bytes = self.kernel.frame_bytes(cap);
        self.swap.record_checksum(slot, bytes);
        if self.files.write(handle, slot as u64, bytes, token).is_err() {
            self.swap.free_slot(slot);
            return Err(SosError::SwapIoFailure);
        }
        let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
        proc.cont.swap_write_fired = true;
        Ok(())
    }

    /// Re-entrant swap-in: allocate a destination frame (which may
    /// itself evict), fire the read, then on completion retag the PTE,
    /// flush the instruction cache and release the slot.
    pub(crate) fn swap_in(&mut self, pid: Pid, vaddr: usize) -> Flow {
        let have_frame = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.have_new_frame
        };
        if !have_frame {
            let frame = ready!(self.alloc_user_frame(pid)?);
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.swap_frame = Some(frame);
            proc.cont.have_new_frame = true;
        }

        let request = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.replacement_request
        };
        if request == 0 {
            let resident_already = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                let Some(id) = proc.addrspace.lookup_pte(vaddr) else {
                    return Err(SosError::FaultOutsideRegion);
                };
                proc.addrspace.pte(id).swap_offset().is_none()
            };
            if resident_already {
                // Nothing to read back; return the staged frame.
                let frame = {
                    let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                    proc.cont.have_new_frame = false;
                    proc.cont.swap_frame.take()
                };
                if let Some(frame) = frame {
                    self.frames.free(frame, &mut self.untyped, &mut self.kernel);
                }
                return Ok(Step::Done(()));
            }
            let (slot, frame) = {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                let Some(id) = proc.addrspace.lookup_pte(vaddr) else {
                    return Err(SosError::FaultOutsideRegion);
                };
                let Some(slot) = proc.addrspace.pte(id).swap_offset() else {
                    return Err(SosError::SwapIoFailure);
                };
                proc.cont.replacement_request = vaddr;
                proc.cont.swap_offset = slot;
                proc.cont.swap_status = SwapStatus::Running;
                proc.cont.pending_op = Some(PendingOp::SwapRead);
                (slot, proc.cont.swap_frame)
            };
            let Some(frame) = frame else {
                return Err(SosError::SwapIoFailure);
            };
            self.frames.bytes(&mut self.kernel, frame).fill(0);
            let Some(handle) = self.swap.handle() else {
                return Err(SosError::SwapIoFailure);
            };
            let token = self.token(pid).ok_or(SosError::ProcessGone)?;
            self.files
                .read(handle, slot as u64, PAGE_SIZE, token)
                .map_err(|_| SosError::SwapIoFailure)?;
            return Ok(Step::Pending);
        }

        let status = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.swap_status
        };
        match status {
            SwapStatus::Success => {
                let frame = {
                    let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                    let Some(id) = proc.addrspace.lookup_pte(vaddr) else {
                        return Err(SosError::FaultOutsideRegion);
                    };
                    let Some(frame) = proc.cont.swap_frame.take() else {
                        return Err(SosError::SwapIoFailure);
                    };
                    proc.addrspace.complete_swap_in(id, frame);
                    proc.cont.have_new_frame = false;
                    proc.cont.replacement_request = 0;
                    proc.cont.swap_status = SwapStatus::Idle;
                    proc.cont.swap_offset = 0;
                    proc.cont.replacement_victim = None;
                    frame
                };
                // Fresh mapping: make the bytes visible to ifetch.
                let cap = self.frames.cap_of(frame);
                self.kernel.flush_icache(cap);
                self.stats.swap_ins += 1;
                Ok(Step::Done(()))
            }
            SwapStatus::Failed => Err(SosError::SwapIoFailure),
            _ => Ok(Step::Pending),
        }
    }

    //  ---  Swap completions  ---

    pub(crate) fn on_swap_file_create(
        &mut self,
        pid: Pid,
        result: Result<FileHandle, FileError>,
    ) {
        let Some(proc) = self.procs.get_mut(pid) else {
            return;
        };
        proc.cont.pending_op = None;
        match result {
            Ok(handle) => {
                self.swap.set_handle(handle);
                self.add_ready(pid);
            }
            Err(e) => {
                error!("swap file creation failed: {:?}", e);
                proc.cont.swap_status = SwapStatus::Failed;
                self.add_ready(pid);
            }
        }
    }

    pub(crate) fn on_swap_write(&mut self, pid: Pid, result: Result<usize, FileError>) {
        let (offset, done, frame) = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
            match result {
                Err(e) => {
                    error!("swap write failed: {:?}", e);
                    proc.cont.swap_status = SwapStatus::Failed;
                    self.add_ready(pid);
                    return;
                }
                Ok(count) => {
                    proc.cont.swap_count += count;
                    if proc.cont.swap_count >= PAGE_SIZE {
                        proc.cont.swap_status = SwapStatus::Success;
                        self.add_ready(pid);
                        return;
                    }
                    (
                        proc.cont.swap_offset,
                        proc.cont.swap_count,
                        proc.cont.swap_frame,
                    )
                }
            }
        };
        // Short write: push the remainder from the still-pinned frame.
        let (Some(frame), Some(handle), Some(token)) =
            (frame, self.swap.handle(), self.token(pid))
        else {
            return;
        };
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = Some(PendingOp::SwapWrite);
        }
        let cap = self.frames.cap_of(frame);
        let bytes = &self.kernel.frame_bytes(cap)[done..];
        if self
            .files
            .write(handle, (offset + done) as u64, bytes, token)
            .is_err()
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
            proc.cont.swap_status = SwapStatus::Failed;
            self.add_ready(pid);
        }
    }

    pub(crate) fn on_swap_read(&mut self, pid: Pid, result: Result<Vec<u8>, FileError>) {
        let (frame, offset) = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
            (proc.cont.swap_frame, proc.cont.swap_offset)
        };
        let data = match result {
            Ok(data) if data.len() == PAGE_SIZE => data,
            other => {
                error!("swap read failed ({:?} bytes)", other.map(|d| d.len()));
                self.kill(pid);
                return;
            }
        };
        let Some(frame) = frame else {
            self.kill(pid);
            return;
        };
        self.frames
            .bytes(&mut self.kernel, frame)
            .copy_from_slice(&data);
        if !self.swap.verify_checksum(offset, &data) {
            // The page on disk rotted; the owner cannot continue.
            error!("swap page at {:#x} failed checksum", offset);
            self.kill(pid);
            return;
        }
        self.swap.free_slot(offset);
        let Some(proc) = self.procs.get_mut(pid) else {
            return;
        };
        proc.cont.swap_status = SwapStatus::Success;
        self.add_ready(pid);
    }

    //  ---  Demand loading from the binary  ---

    // Page-bounded, region-clamped span for a fault at `addr`.
    fn binary_load_span(addr: usize, region_start: usize, region_end: usize) -> (usize, usize) {
        let page = page_align(addr);
        let start = page.max(region_start);
        let end = (page + PAGE_SIZE).min(region_end);
        (start, end - start)
    }

    /// Fills a freshly created page of an ELF-backed region from the
    /// process's binary fd. Multiple read chunks are driven from fault
    /// re-entries until the span is exhausted or the file runs out
    /// (the remainder stays zero-filled).
    pub(crate) fn load_page_from_binary(
        &mut self,
        pid: Pid,
        addr: usize,
        region_start: usize,
        region_end: usize,
        elf_offset: Option<usize>,
    ) -> Flow {
        let Some(elf_offset) = elf_offset else {
            return Ok(Step::Done(()));
        };
        let (dst, nbytes) = Self::binary_load_span(addr, region_start, region_end);
        let src = elf_offset + (dst - region_start);

        let fired = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.binary_read_fired
        };
        if !fired {
            let handle = {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.fd = BINARY_FD;
                proc.cont.iov.clear();
                proc.cont.iov.push_back(IoSpan {
                    vstart: dst,
                    len: nbytes,
                    sos_owned: false,
                });
                proc.cont.binary_read_fired = true;
                proc.cont.binary_eof = false;
                proc.cont.counter = 0;
                proc.cont.pending_op = Some(PendingOp::BinaryRead);
                proc.addrspace.pin(dst);
                let of_id = proc.fd_lookup(BINARY_FD);
                of_id
                    .and_then(|id| self.pool.get_mut(id))
                    .and_then(|of| {
                        of.offset = src as u64;
                        of.handle
                    })
            };
            let Some(handle) = handle else {
                error!("pid {} has no binary fd", pid);
                return Err(SosError::RemoteIoFailure);
            };
            let token = self.token(pid).ok_or(SosError::ProcessGone)?;
            self.files
                .read(handle, src as u64, nbytes, token)
                .map_err(|_| SosError::RemoteIoFailure)?;
            return Ok(Step::Pending);
        }

        let (remaining, eof) = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            (proc.cont.iov.front().copied(), proc.cont.binary_eof)
        };
        if let (Some(span), false) = (remaining, eof) {
            // Short read: fetch the rest of the span.
            let (handle, offset) = {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.pending_op = Some(PendingOp::BinaryRead);
                let of = proc
                    .fd_lookup(BINARY_FD)
                    .and_then(|id| self.pool.get(id))
                    .ok_or(SosError::RemoteIoFailure)?;
                (of.handle.ok_or(SosError::RemoteIoFailure)?, of.offset)
            };
            let token = self.token(pid).ok_or(SosError::ProcessGone)?;
            self.files
                .read(handle, offset, span.len, token)
                .map_err(|_| SosError::RemoteIoFailure)?;
            return Ok(Step::Pending);
        }

        // Load complete (or hit end-of-file with the tail zero-filled).
        let frame = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.iov.clear();
            proc.addrspace.unpin(dst);
            proc.addrspace.resident_frame(dst).map(|(f, _)| f)
        };
        if let Some(frame) = frame {
            let cap = self.frames.cap_of(frame);
            self.kernel.flush_icache(cap);
        }
        Ok(Step::Done(()))
    }

    pub(crate) fn on_binary_read(&mut self, pid: Pid, result: Result<Vec<u8>, FileError>) {
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                error!("binary read failed: {:?}", e);
                self.kill(pid);
                return;
            }
        };
        let span = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
            if data.is_empty() {
                proc.cont.binary_eof = true;
                self.add_ready(pid);
                return;
            }
            proc.cont.iov.front().copied()
        };
        let Some(span) = span else {
            self.add_ready(pid);
            return;
        };
        let n = data.len().min(span.len);
        if !self.write_span(pid, &span, &data[..n]) {
            error!("binary load target page vanished");
            self.kill(pid);
            return;
        }
        let Some(proc) = self.procs.get_mut(pid) else {
            return;
        };
        if let Some(front) = proc.cont.iov.front_mut() {
            if n == front.len {
                proc.cont.iov.pop_front();
            } else {
                front.vstart += n;
                front.len -= n;
            }
        }
        proc.cont.counter += n;
        if let Some(of) = proc.fd_lookup(BINARY_FD).and_then(|id| self.pool.get_mut(id)) {
            of.offset += n as u64;
        }
        self.add_ready(pid);
    }
}
