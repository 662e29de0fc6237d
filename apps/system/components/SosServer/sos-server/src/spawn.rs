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

//! Process construction.
//!
//! Spawning is a state machine driven by the *child's* continuation:
//! look up the binary on the remote FS, read its header page into a
//! scratch frame, build the regions from the program headers, configure
//! and start the thread, then reply to the parent (if any) with the new
//! pid. Page contents are not loaded here — they fault in on demand
//! through the binary fd.

use crate::continuation::{Continuation, PendingOp, SavedLabel};
use crate::elf;
use crate::iovec::IoSpan;
use crate::process::{DeviceKind, OpenFile, Process, WaitTarget};
use crate::ready;
use crate::{Flow, Step};
use sos_os_common::untyped::UntypedArena;
use alloc::vec;
use alloc::vec::Vec;
use log::{error, info, trace};
use sos_addrspace::AddressSpace;
use sos_interface::{FileMode, PathString, BINARY_FD, STDERR_FD, STDOUT_FD};
use sos_os_common::error::SosError;
use sos_os_common::files::{FileAttr, FileError, FileHandle, FileServerInterface};
use sos_os_common::kernel::KernelInterface;
use sos_os_common::mem::{PAGE_SIZE, TCB_SIZE_BITS};
use sos_os_common::serial::SerialInterface;
use sos_os_common::timer::TimerInterface;
use sos_os_common::vmem_layout::{PROCESS_IPC_BUFFER, PROCESS_STACK_TOP};
use sos_os_common::{CallbackToken, Pid, Word};

use crate::server::SosServer;

impl<K, F, S, T> SosServer<K, F, S, T>
where
    K: KernelInterface,
    F: FileServerInterface,
    S: SerialInterface,
    T: TimerInterface,
{
    /// Creates the kernel objects for a new process and fires the
    /// binary lookup. The rest of construction happens in
    /// `spawn_step` as completions arrive.
    pub(crate) fn spawn_begin(
        &mut self,
        parent: Option<Pid>,
        name: &str,
    ) -> Result<Pid, SosError> {
        trace!("spawn {:?} for {:?}", name, parent);
        let Some(pid) = self.procs.alloc_pid() else {
            return Err(SosError::Busy);
        };
        let start_time = self.procs.next_start_time();

        let mut addrspace =
            AddressSpace::new(&mut self.frames, &mut self.untyped, &mut self.kernel)?;

        let Some(tcb_paddr) = self.untyped.alloc(TCB_SIZE_BITS) else {
            addrspace.teardown(
                &mut self.frames,
                &mut self.swap,
                &mut self.untyped,
                &mut self.kernel,
            );
            return Err(SosError::OutOfMemory);
        };
        let tcb_cap = match self.kernel.retype_tcb(tcb_paddr) {
            Ok(cap) => cap,
            Err(e) => {
                self.untyped.free(tcb_paddr, TCB_SIZE_BITS);
                addrspace.teardown(
                    &mut self.frames,
                    &mut self.swap,
                    &mut self.untyped,
                    &mut self.kernel,
                );
                return Err(e);
            }
        };
        let ep_cap = match self.kernel.mint_endpoint(self.ipc_ep, pid as Word) {
            Ok(cap) => cap,
            Err(e) => {
                self.kernel.delete(tcb_cap);
                self.untyped.free(tcb_paddr, TCB_SIZE_BITS);
                addrspace.teardown(
                    &mut self.frames,
                    &mut self.swap,
                    &mut self.untyped,
                    &mut self.kernel,
                );
                return Err(e);
            }
        };

        let mut proc = Process {
            pid,
            start_time,
            addrspace,
            tcb_cap,
            tcb_paddr,
            ep_cap,
            fd_table: vec![None; sos_interface::FD_TABLE_SIZE].into_boxed_slice(),
            cont: Continuation::default(),
            waiting: WaitTarget::None,
            waiters: Vec::new(),
            command: PathString::from_str(name),
            stime_ms: (self.timer.timestamp_us() / 1000) as u32,
        };
        // Console output comes pre-opened on fds 1 and 2.
        for fd in [STDOUT_FD, STDERR_FD] {
            if proc
                .fd_alloc_at(
                    &mut self.pool,
                    fd,
                    OpenFile {
                        offset: 0,
                        mode: FileMode::WRITE,
                        handle: None,
                        dev: DeviceKind::Console,
                    },
                )
                .is_none()
            {
                for opened in [STDOUT_FD, STDERR_FD] {
                    proc.fd_free(&mut self.pool, opened);
                }
                proc.addrspace.teardown(
                    &mut self.frames,
                    &mut self.swap,
                    &mut self.untyped,
                    &mut self.kernel,
                );
                self.kernel.delete(tcb_cap);
                self.untyped.free(tcb_paddr, TCB_SIZE_BITS);
                self.kernel.delete(ep_cap);
                return Err(SosError::OutOfMemory);
            }
        }
        proc.cont.label = SavedLabel::Spawn;
        proc.cont.spawn_parent = parent;
        proc.cont.path = PathString::from_str(name);
        proc.cont.pending_op = Some(PendingOp::SpawnLookup);
        self.procs.insert(proc);

        let token = CallbackToken { pid, start_time };
        if self.files.lookup(name, token).is_err() {
            self.kill(pid);
            return Err(SosError::RemoteIoFailure);
        }
        Ok(pid)
    }

    pub(crate) fn handle_spawn(&mut self, pid: Pid) {
        match self.spawn_step(pid) {
            Ok(_) => {}
            Err(SosError::ProcessGone) => {}
            Err(e) => self.fail_spawn(pid, e),
        }
    }

    fn spawn_step(&mut self, pid: Pid) -> Flow {
        let fired = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.binary_read_fired
        };
        if !fired {
            // Stage the header page of the binary into a scratch frame,
            // addressed through the SOS window.
            let frame = ready!(self.alloc_user_frame(pid)?);
            self.frames.bytes(&mut self.kernel, frame).fill(0);
            let window = self.frames.sos_vaddr(frame);
            let handle = {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.spawn_frame = Some(frame);
                proc.cont.binary_read_fired = true;
                proc.cont.pending_op = Some(PendingOp::SpawnRead);
                proc.cont.iov.clear();
                proc.cont.iov.push_back(IoSpan {
                    vstart: window,
                    len: PAGE_SIZE,
                    sos_owned: true,
                });
                proc.fd_lookup(BINARY_FD)
                    .and_then(|id| self.pool.get(id))
                    .and_then(|of| of.handle)
                    .ok_or(SosError::RemoteIoFailure)?
            };
            let token = self.token(pid).ok_or(SosError::ProcessGone)?;
            self.files
                .read(handle, 0, PAGE_SIZE, token)
                .map_err(|_| SosError::RemoteIoFailure)?;
            return Ok(Step::Pending);
        }

        // Header page is in the scratch frame: build the image.
        let frame = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.spawn_frame.ok_or(SosError::RemoteIoFailure)?
        };
        let image = {
            let bytes = self.frames.bytes(&mut self.kernel, frame);
            elf::parse(bytes)?
        };
        {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            for segment in &image.segments {
                proc.addrspace.create_region(
                    segment.vaddr,
                    segment.vaddr + segment.memsz,
                    segment.rights,
                    Some(segment.offset),
                )?;
            }
            proc.addrspace.activate()?;
        }

        let (tcb_cap, ep_cap, vspace_root, ipc_frame) = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            let ipc_frame = proc
                .addrspace
                .resident_frame(PROCESS_IPC_BUFFER)
                .map(|(f, _)| f)
                .ok_or(SosError::OutOfMemory)?;
            (
                proc.tcb_cap,
                proc.ep_cap,
                proc.addrspace.vspace_root(),
                ipc_frame,
            )
        };
        let ipc_frame_cap = self.frames.cap_of(ipc_frame);
        self.kernel.configure_tcb(
            tcb_cap,
            ep_cap,
            vspace_root,
            PROCESS_IPC_BUFFER,
            ipc_frame_cap,
        )?;
        self.kernel
            .start_thread(tcb_cap, image.entry, PROCESS_STACK_TOP)?;

        // Construction done: drop the scratch frame and tell the
        // parent.
        let parent = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            let parent = proc.cont.spawn_parent;
            proc.cont = Continuation::default();
            parent
        };
        self.frames.free(frame, &mut self.untyped, &mut self.kernel);
        info!("started pid {} at {:#x}", pid, image.entry);
        if let Some(parent) = parent {
            if self.procs.contains(parent) {
                self.end_syscall(parent, pid as Word, true);
            }
        }
        Ok(Step::Done(()))
    }

    /// Construction failed: reclaim the half-built process and give the
    /// parent an error reply.
    fn fail_spawn(&mut self, pid: Pid, err: SosError) {
        error!("spawn of pid {} failed: {:?}", pid, err);
        let parent = self.procs.get(pid).and_then(|p| p.cont.spawn_parent);
        self.kill(pid);
        if let Some(parent) = parent {
            if self.procs.contains(parent) {
                self.end_syscall(parent, err.errno(), false);
            }
        }
    }

    //  ---  Spawn completions  ---

    pub(crate) fn on_spawn_lookup(
        &mut self,
        pid: Pid,
        result: Result<(FileHandle, FileAttr), FileError>,
    ) {
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
        }
        let handle = match result {
            Ok((handle, _attr)) => handle,
            Err(e) => {
                self.fail_spawn(pid, e.into());
                return;
            }
        };
        // The executable stays open for demand loading.
        let bound = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.fd_alloc_at(
                &mut self.pool,
                BINARY_FD,
                OpenFile {
                    offset: 0,
                    mode: FileMode::READ,
                    handle: Some(handle),
                    dev: DeviceKind::Remote,
                },
            )
            .is_some()
        };
        if !bound {
            self.fail_spawn(pid, SosError::OutOfMemory);
            return;
        }
        self.add_ready(pid);
    }

    pub(crate) fn on_spawn_read(&mut self, pid: Pid, result: Result<Vec<u8>, FileError>) {
        let span = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
            proc.cont.iov.front().copied()
        };
        let data = match result {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => {
                self.fail_spawn(pid, SosError::InvalidArgument);
                return;
            }
            Err(e) => {
                self.fail_spawn(pid, e.into());
                return;
            }
        };
        let Some(span) = span else {
            self.fail_spawn(pid, SosError::RemoteIoFailure);
            return;
        };
        let n = data.len().min(span.len);
        if !self.write_span(pid, &span, &data[..n]) {
            self.fail_spawn(pid, SosError::RemoteIoFailure);
            return;
        }
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.iov.clear();
        }
        self.add_ready(pid);
    }
}
