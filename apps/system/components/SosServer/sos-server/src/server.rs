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

//! The event loop.
//!
//! One iteration resumes a ready continuation if any exists, otherwise
//! waits on the endpoint. Interrupt badges run the clock and network
//! handlers (which drain timer expirations, file-server completions and
//! serial input); everything else is a client request dispatched on its
//! label. Completion routing validates the callback token first so work
//! for a recycled pid is dropped on the floor.

use crate::console::Console;
use crate::continuation::{PendingOp, SavedLabel};
use crate::iovec::IoSpan;
use crate::process::{OpenFilePool, ProcessTable, WaitTarget};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{error, info, trace};
use smallvec::SmallVec;
use sos_frame_table::{BootUntyped, FrameId, FrameTable, UntypedDesc};
use sos_interface::{msg, SyscallNumber, FD_TABLE_SIZE};
use sos_os_common::caps::CPtr;
use sos_os_common::error::SosError;
use sos_os_common::files::{FileCompletion, FileServerInterface};
use sos_os_common::untyped::UntypedArena;
use sos_os_common::kernel::{
    IpcLabel, KernelInterface, IRQ_BADGE_CLOCK, IRQ_BADGE_NETWORK, IRQ_EP_BADGE,
};
use sos_os_common::mem::TCB_SIZE_BITS;
use sos_os_common::serial::SerialInterface;
use sos_os_common::timer::TimerInterface;
use sos_os_common::{CallbackToken, Pid, Word};
use sos_swap_store::SwapStore;

#[derive(Debug, Default)]
pub struct ServerStats {
    pub faults: usize,
    pub evictions: usize,
    pub swap_ins: usize,
    pub stale_callbacks: usize,
}

pub struct SosConfig {
    pub frame_capacity: usize,
    pub swap_file_size: usize,
    /// The endpoint clients are badged against.
    pub ipc_ep: CPtr,
}

pub struct SosServer<K, F, S, T> {
    pub(crate) kernel: K,
    pub(crate) files: F,
    pub(crate) serial: S,
    pub(crate) timer: T,

    pub(crate) untyped: BootUntyped,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapStore,
    pub(crate) procs: ProcessTable,
    pub(crate) pool: OpenFilePool,
    pub(crate) console: Console,

    pub(crate) ready: VecDeque<(Pid, u64)>,
    pub(crate) current: Pid,
    pub(crate) boot_pid: Option<Pid>,
    pub(crate) ipc_ep: CPtr,
    pub(crate) running: bool,
    pub(crate) stats: ServerStats,
}

impl<K, F, S, T> SosServer<K, F, S, T>
where
    K: KernelInterface,
    F: FileServerInterface,
    S: SerialInterface,
    T: TimerInterface,
{
    pub fn new(
        kernel: K,
        files: F,
        serial: S,
        timer: T,
        untypeds: &[UntypedDesc],
        config: SosConfig,
    ) -> Self {
        SosServer {
            kernel,
            files,
            serial,
            timer,
            untyped: BootUntyped::new(untypeds),
            frames: FrameTable::new(config.frame_capacity),
            swap: SwapStore::new(config.swap_file_size),
            procs: ProcessTable::new(),
            pool: OpenFilePool::new(),
            console: Console::new(),
            ready: VecDeque::new(),
            current: 0,
            boot_pid: None,
            ipc_ep: config.ipc_ep,
            running: true,
            stats: ServerStats::default(),
        }
    }

    pub fn stats(&self) -> &ServerStats { &self.stats }

    /// The process whose request (or completion) is being serviced.
    pub fn current_pid(&self) -> Pid { self.current }

    /// Spawns the first process; the loop exits when it dies.
    pub fn start_initial_process(&mut self, name: &str) -> Result<Pid, SosError> {
        let pid = self.spawn_begin(None, name)?;
        self.boot_pid = Some(pid);
        Ok(pid)
    }

    /// Runs the loop until shutdown (boot process exit or endpoint
    /// teardown).
    pub fn run(&mut self) {
        while self.step() {}
        info!(" == That's all Folks! == ");
    }

    /// One scheduling decision: resume a ready continuation or consume
    /// the next kernel message. Returns false when the loop should
    /// stop.
    pub fn step(&mut self) -> bool {
        if let Some((pid, start_time)) = self.ready.pop_front() {
            // Deleted processes purge their queue entries by token
            // mismatch.
            if !self.procs.token_valid(CallbackToken { pid, start_time }) {
                return self.running;
            }
            self.current = pid;
            trace!("resume pid {}", pid);
            let label = self.procs.get(pid).map(|p| p.cont.label).unwrap_or_default();
            match label {
                SavedLabel::Syscall => self.handle_syscall(pid, None),
                SavedLabel::VmFault => self.handle_fault(pid),
                SavedLabel::Spawn => self.handle_spawn(pid),
                SavedLabel::None => error!("ready pid {} has nothing to resume", pid),
            }
            return self.running;
        }

        let Some(message) = self.kernel.wait() else {
            return false;
        };
        if message.badge & IRQ_EP_BADGE != 0 {
            if message.badge & IRQ_BADGE_CLOCK != 0 {
                self.clock_irq();
            }
            if message.badge & IRQ_BADGE_NETWORK != 0 {
                self.network_irq();
            }
            return self.running;
        }

        let pid = message.badge as Pid;
        if !self.procs.contains(pid) {
            error!("message from unknown badge {}", message.badge);
            return self.running;
        }
        let reply_cap = match self.kernel.save_reply() {
            Ok(cap) => cap,
            Err(e) => {
                error!("cannot save reply cap: {:?}", e);
                return self.running;
            }
        };
        let busy = self
            .procs
            .get(pid)
            .map(|p| p.cont.loop_entries != 0)
            .unwrap_or(true);
        if busy {
            // A client cannot legally call again mid-syscall.
            error!("message from busy pid {}", pid);
            self.kernel.delete(reply_cap);
            return self.running;
        }
        self.current = pid;
        match IpcLabel::try_from(message.label) {
            Ok(IpcLabel::VmFault) => {
                if let Some(proc) = self.procs.get_mut(pid) {
                    proc.cont.label = SavedLabel::VmFault;
                    proc.cont.fault_addr = message.mr(1);
                    // Bit 11 of the fault status distinguishes writes.
                    proc.cont.fault_write = message.mr(3) & (1 << 11) != 0;
                    proc.cont.reply_cap = Some(reply_cap);
                    proc.cont.loop_entries = 1;
                }
                self.stats.faults += 1;
                self.handle_fault(pid);
            }
            Ok(IpcLabel::Syscall) => {
                if let Some(proc) = self.procs.get_mut(pid) {
                    proc.cont.label = SavedLabel::Syscall;
                    proc.cont.syscall = SyscallNumber::try_from(message.mr(0)).ok();
                    proc.cont.reply_cap = Some(reply_cap);
                    proc.cont.loop_entries = 1;
                }
                self.handle_syscall(pid, Some(&message));
            }
            _ => {
                error!("unknown message label {} from pid {}", message.label, pid);
                self.kernel.delete(reply_cap);
            }
        }
        self.running
    }

    //  ---  Interrupt handlers  ---

    fn clock_irq(&mut self) {
        while let Some(token) = self.timer.poll_expired() {
            if !self.procs.token_valid(token) {
                self.stats.stale_callbacks += 1;
                continue;
            }
            let sleeping = self
                .procs
                .get(token.pid)
                .map(|p| {
                    p.cont.syscall == Some(SyscallNumber::Usleep) && p.cont.reply_cap.is_some()
                })
                .unwrap_or(false);
            if sleeping {
                self.current = token.pid;
                self.end_syscall(token.pid, 0, true);
            }
        }
    }

    fn network_irq(&mut self) {
        while let Some(completion) = self.files.poll() {
            self.route_completion(completion);
        }
        // Serial input rides the same interrupt path.
        while let Some(byte) = self.serial.poll() {
            if self.console.push(byte) {
                self.try_send_buffer();
            }
        }
    }

    /// Validates the token and redirects a completion into the handler
    /// the pending operation expects.
    fn route_completion(&mut self, completion: FileCompletion) {
        let token = completion.token();
        if !self.procs.token_valid(token) {
            trace!("stale completion for pid {}", token.pid);
            self.stats.stale_callbacks += 1;
            return;
        }
        let pid = token.pid;
        self.current = pid;
        let Some(op) = self.procs.get(pid).and_then(|p| p.cont.pending_op) else {
            error!("completion for pid {} with no pending op", pid);
            return;
        };
        match (op, completion) {
            (PendingOp::OpenLookup, FileCompletion::Lookup { result, .. }) => {
                self.on_open_lookup(pid, result)
            }
            (PendingOp::OpenCreate, FileCompletion::Create { result, .. }) => {
                self.on_open_create(pid, result)
            }
            (PendingOp::FileRead, FileCompletion::Read { result, .. }) => {
                self.on_file_read(pid, result)
            }
            (PendingOp::FileWrite, FileCompletion::Write { result, .. }) => {
                self.on_file_write(pid, result)
            }
            (PendingOp::BinaryRead, FileCompletion::Read { result, .. }) => {
                self.on_binary_read(pid, result)
            }
            (PendingOp::StatLookup, FileCompletion::Lookup { result, .. }) => {
                self.on_stat_lookup(pid, result)
            }
            (PendingOp::StatAttr, FileCompletion::GetAttr { result, .. }) => {
                self.on_stat_attr(pid, result)
            }
            (PendingOp::ReadDir, FileCompletion::ReadDir { result, .. }) => {
                self.on_readdir(pid, result)
            }
            (PendingOp::SwapFileCreate, FileCompletion::Create { result, .. }) => {
                self.on_swap_file_create(pid, result)
            }
            (PendingOp::SwapWrite, FileCompletion::Write { result, .. }) => {
                self.on_swap_write(pid, result)
            }
            (PendingOp::SwapRead, FileCompletion::Read { result, .. }) => {
                self.on_swap_read(pid, result)
            }
            (PendingOp::SpawnLookup, FileCompletion::Lookup { result, .. }) => {
                self.on_spawn_lookup(pid, result)
            }
            (PendingOp::SpawnRead, FileCompletion::Read { result, .. }) => {
                self.on_spawn_read(pid, result)
            }
            (op, other) => {
                error!("completion {:?} does not match pending {:?}", other, op);
            }
        }
    }

    /// Delivers buffered console input to the pending reader, pinning
    /// rules permitting. Copies as much as the reader's iovec chain
    /// accepts, unpins the touched pages, replies with the byte count
    /// and keeps any surplus buffered.
    pub(crate) fn try_send_buffer(&mut self) {
        let Some(reader) = self.console.reader else {
            return;
        };
        if self.console.is_empty() {
            return;
        }
        let line: Vec<u8> = self.console.data().to_vec();
        let mut pos = 0;
        {
            let Some(proc) = self.procs.get_mut(reader) else {
                return;
            };
            if proc.cont.syscall != Some(SyscallNumber::Read)
                || proc.cont.reply_cap.is_none()
                || proc.cont.iov.is_empty()
            {
                return;
            }
            for i in 0..proc.cont.iov.len() {
                if pos >= line.len() {
                    break;
                }
                let span = proc.cont.iov[i];
                let n = span.len.min(line.len() - pos);
                let Some((frame, offset)) = proc.addrspace.resident_frame(span.vstart) else {
                    error!("console reader page {:#x} vanished", span.vstart);
                    break;
                };
                let cap = self.frames.cap_of(frame);
                self.kernel.frame_bytes(cap)[offset..offset + n]
                    .copy_from_slice(&line[pos..pos + n]);
                proc.addrspace.unpin(span.vstart);
                pos += n;
            }
        }
        self.end_syscall(reader, pos as Word, true);
        self.console.consume(pos);
    }

    //  ---  Replies and teardown  ---

    pub(crate) fn token(&self, pid: Pid) -> Option<CallbackToken> {
        self.procs.get(pid).map(|p| p.token())
    }

    pub(crate) fn add_ready(&mut self, pid: Pid) {
        let Some(start_time) = self.procs.get(pid).map(|p| p.start_time) else {
            return;
        };
        // A pid appears at most once.
        if self.ready.iter().any(|&(p, _)| p == pid) {
            error!("pid {} already ready", pid);
            return;
        }
        self.ready.push_back((pid, start_time));
    }

    /// Sends the reply and clears the continuation. `success` selects
    /// the fault-free label; failures carry a positive errno in MR0.
    pub(crate) fn end_syscall(&mut self, pid: Pid, retval: Word, success: bool) {
        self.end_syscall_words(pid, &[retval], success)
    }

    /// 64-bit results are split low word first.
    pub(crate) fn end_syscall64(&mut self, pid: Pid, retval: u64) {
        let (lo, hi) = msg::split64(retval);
        self.end_syscall_words(pid, &[lo, hi], true)
    }

    fn end_syscall_words(&mut self, pid: Pid, head: &[Word], success: bool) {
        let Some(proc) = self.procs.get_mut(pid) else {
            return;
        };
        let cont = core::mem::take(&mut proc.cont);
        // Release any pages still pinned for this request.
        for span in &cont.iov {
            if !span.sos_owned {
                proc.addrspace.unpin(span.vstart);
            }
        }
        let Some(cap) = cont.reply_cap else {
            return;
        };
        let mut mrs: SmallVec<[Word; 20]> = SmallVec::new();
        mrs.extend_from_slice(head);
        mrs.extend_from_slice(&cont.reply_payload);
        let label = if success {
            IpcLabel::Syscall
        } else {
            IpcLabel::UserException
        };
        trace!("reply pid {} {:?} mr0 {}", pid, label, mrs[0]);
        self.kernel.reply(cap, label, &mrs);
    }

    /// Failure policy for syscall handlers: recoverable errors become
    /// UserException replies; swap corruption kills the process;
    /// `ProcessGone` means the situation was already resolved.
    pub(crate) fn fail_syscall(&mut self, pid: Pid, err: SosError) {
        match err {
            SosError::ProcessGone => {}
            SosError::SwapIoFailure => self.kill(pid),
            _ => self.end_syscall(pid, err.errno(), false),
        }
    }

    /// Eagerly deletes a process and reclaims everything it owns. Any
    /// in-flight callbacks become stale via the start-time token.
    pub fn kill(&mut self, pid: Pid) {
        let Some(mut proc) = self.procs.remove(pid) else {
            return;
        };
        info!("delete process {} ({})", pid, proc.command.as_str());
        if let Some(cap) = proc.cont.reply_cap.take() {
            self.kernel.delete(cap);
        }
        self.kernel.revoke(proc.tcb_cap);
        self.kernel.delete(proc.tcb_cap);
        self.untyped.free(proc.tcb_paddr, TCB_SIZE_BITS);
        self.kernel.revoke(proc.ep_cap);
        self.kernel.delete(proc.ep_cap);
        // Frames staged in the continuation (spawn scratch page,
        // swap-in destination) belong to no PTE yet; return them.
        if let Some(frame) = proc.cont.spawn_frame.take() {
            self.frames.free(frame, &mut self.untyped, &mut self.kernel);
        }
        if proc.cont.have_new_frame {
            if let Some(frame) = proc.cont.swap_frame.take() {
                self.frames.free(frame, &mut self.untyped, &mut self.kernel);
            }
        }
        // An eviction this process was driving leaves its victim
        // pinned; make the page evictable again if the owner survives.
        // The swap slot taken for the unfinished write goes back too —
        // no PTE references it yet.
        if let (Some(target), Some(victim)) =
            (proc.cont.eviction_target, proc.cont.replacement_victim)
        {
            if proc.cont.swap_write_fired {
                self.swap.free_slot(proc.cont.swap_offset);
            }
            if target != pid {
                if let Some(target_proc) = self.procs.get_mut(target) {
                    target_proc.addrspace.unpin_pte(victim);
                }
            }
        }
        proc.addrspace.teardown(
            &mut self.frames,
            &mut self.swap,
            &mut self.untyped,
            &mut self.kernel,
        );
        for fd in 0..FD_TABLE_SIZE {
            if let Some(of_id) = proc.fd_table[fd].take() {
                self.pool.free(of_id);
            }
        }
        if self.console.reader == Some(pid) {
            self.console.reader = None;
        }

        // Wake anyone blocked in waitpid on this process with its pid.
        let waiters = core::mem::take(&mut proc.waiters);
        for waiter in waiters {
            let woke = match self.procs.get_mut(waiter) {
                Some(wp)
                    if (matches!(wp.waiting, WaitTarget::Any)
                        || wp.waiting == WaitTarget::Pid(pid))
                        && wp.cont.reply_cap.is_some() =>
                {
                    wp.waiting = WaitTarget::None;
                    true
                }
                _ => false,
            };
            if woke {
                self.end_syscall(waiter, pid as Word, true);
            }
        }
        // And remove this process from everyone else's waiter queues.
        if !matches!(proc.waiting, WaitTarget::None) {
            for other in self.procs.pids() {
                if let Some(other_proc) = self.procs.get_mut(other) {
                    other_proc.waiters.retain(|&w| w != pid);
                }
            }
        }

        if self.boot_pid == Some(pid) {
            self.running = false;
        }
    }

    //  ---  Client-memory access through the frame window  ---

    pub(crate) fn span_frame(&self, pid: Pid, span: &IoSpan) -> Option<(FrameId, usize)> {
        if span.sos_owned {
            self.frames.frame_at_sos_vaddr(span.vstart)
        } else {
            self.procs.get(pid)?.addrspace.resident_frame(span.vstart)
        }
    }

    /// Copies `data` into the (resident) page a span points at.
    pub(crate) fn write_span(&mut self, pid: Pid, span: &IoSpan, data: &[u8]) -> bool {
        debug_assert!(data.len() <= span.len);
        let Some((frame, offset)) = self.span_frame(pid, span) else {
            return false;
        };
        let cap = self.frames.cap_of(frame);
        self.kernel.frame_bytes(cap)[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    /// Copies a span's bytes out of the (resident) page it points at.
    pub(crate) fn read_span(&mut self, pid: Pid, span: &IoSpan) -> Option<Vec<u8>> {
        let (frame, offset) = self.span_frame(pid, span)?;
        let cap = self.frames.cap_of(frame);
        Some(self.kernel.frame_bytes(cap)[offset..offset + span.len].to_vec())
    }
}
