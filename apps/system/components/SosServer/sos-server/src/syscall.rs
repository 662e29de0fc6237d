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

//! Syscall dispatch.
//!
//! Every syscall has a setup half (runs exactly once, pulls arguments
//! out of the message registers and validates them) and an execute half
//! (re-entrant, may suspend any number of times). The dispatcher runs
//! setup iff the continuation is fresh, then always runs execute. An
//! error from either half aborts the call with a UserException reply
//! carrying the errno.

use crate::continuation::PendingOp;
use crate::iovec::{cbuf_to_iov, IoDirection};
use crate::process::{DeviceKind, OpenFile, WaitTarget};
use crate::ready;
use crate::{Flow, Step};
use alloc::vec::Vec;
use log::{debug, error, trace};
use sos_interface::{
    msg, FileMode, FileStat, ProcStatus, SyscallNumber, CONSOLE_NAME, OPEN_MESSAGE_START,
    PROC_CREATE_MESSAGE_START, STAT_MESSAGE_START,
};
use sos_os_common::error::SosError;
use sos_os_common::files::{FileAttr, FileError, FileHandle, FileKind, FileServerInterface};
use sos_os_common::kernel::{IpcMessage, KernelInterface};
use sos_os_common::serial::SerialInterface;
use sos_os_common::timer::TimerInterface;
use sos_os_common::{Pid, Word};

use crate::server::SosServer;

impl<K, F, S, T> SosServer<K, F, S, T>
where
    K: KernelInterface,
    F: FileServerInterface,
    S: SerialInterface,
    T: TimerInterface,
{
    pub(crate) fn handle_syscall(&mut self, pid: Pid, message: Option<&IpcMessage>) {
        let Some(number) = self.procs.get(pid).and_then(|p| p.cont.syscall) else {
            error!("unknown syscall from pid {}", pid);
            self.end_syscall(pid, SosError::InvalidArgument.errno(), false);
            return;
        };
        trace!("pid {} syscall {:?}", pid, number);
        let initiated = self
            .procs
            .get(pid)
            .map(|p| p.cont.handler_initiated)
            .unwrap_or(true);
        if !initiated {
            let Some(message) = message else {
                error!("resumed pid {} before setup ran", pid);
                return;
            };
            let setup = self.syscall_setup(pid, number, message);
            if let Some(proc) = self.procs.get_mut(pid) {
                proc.cont.handler_initiated = true;
            }
            if let Err(e) = setup {
                self.fail_syscall(pid, e);
                return;
            }
        }
        if let Err(e) = self.syscall_execute(pid, number) {
            self.fail_syscall(pid, e);
        }
    }

    //  ---  Setup half: argument extraction  ---

    fn syscall_setup(
        &mut self,
        pid: Pid,
        number: SyscallNumber,
        message: &IpcMessage,
    ) -> Result<(), SosError> {
        match number {
            SyscallNumber::Brk => {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.brk_arg = message.mr(1);
                Ok(())
            }
            SyscallNumber::Usleep => {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.delay_us = message.mr(1) as u64 * 1000;
                Ok(())
            }
            SyscallNumber::Open => self.open_setup(pid, message),
            SyscallNumber::Read => self.rw_setup(pid, message, IoDirection::ToClient),
            SyscallNumber::Write => self.rw_setup(pid, message, IoDirection::FromClient),
            SyscallNumber::GetDirEnt => {
                let position = message.mr(1);
                let nbyte = message.mr(2);
                if position == 0 || nbyte == 0 {
                    return Err(SosError::InvalidArgument);
                }
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.position_arg = position;
                proc.cont.length_arg = nbyte;
                Ok(())
            }
            SyscallNumber::Stat => {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.client_addr = message.mr(1);
                proc.cont.path = msg::read_str(&message.mrs, STAT_MESSAGE_START);
                Ok(())
            }
            SyscallNumber::Close => {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.fd = message.mr(1);
                Ok(())
            }
            SyscallNumber::ProcCreate => {
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.path = msg::read_str(&message.mrs, PROC_CREATE_MESSAGE_START);
                if proc.cont.path.is_empty() {
                    return Err(SosError::InvalidArgument);
                }
                Ok(())
            }
            SyscallNumber::WaitPid | SyscallNumber::ProcDelete => {
                let target = message.mr(1) as isize;
                if target <= 0 && !(target == -1 && number == SyscallNumber::WaitPid) {
                    return Err(SosError::InvalidArgument);
                }
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.pid_arg = target;
                Ok(())
            }
            SyscallNumber::ProcStatus => self.proc_status_setup(pid, message),
            SyscallNumber::Timestamp | SyscallNumber::GetPid => Ok(()),
        }
    }

    fn open_setup(&mut self, pid: Pid, message: &IpcMessage) -> Result<(), SosError> {
        let mode = FileMode::from_bits_truncate(message.mr(1) as u32);
        let path = msg::read_str(&message.mrs, OPEN_MESSAGE_START);
        if path.is_empty() {
            return Err(SosError::InvalidArgument);
        }
        let dev = if path.as_str() == CONSOLE_NAME {
            DeviceKind::Console
        } else {
            DeviceKind::Remote
        };
        debug!("open {:?} mode {:?} via {:?}", path.as_str(), mode, dev);
        let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
        let fd = proc
            .fd_alloc(
                &mut self.pool,
                OpenFile {
                    offset: 0,
                    mode,
                    handle: None,
                    dev,
                },
            )
            .ok_or(SosError::OutOfMemory)?;
        proc.cont.fd = fd;
        proc.cont.path = path;
        proc.cont.file_mode = mode;
        Ok(())
    }

    fn rw_setup(
        &mut self,
        pid: Pid,
        message: &IpcMessage,
        dir: IoDirection,
    ) -> Result<(), SosError> {
        let fd = message.mr(1);
        let buf = message.mr(2);
        let nbyte = message.mr(3);
        if buf == 0 {
            return Err(SosError::InvalidArgument);
        }
        let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
        let Some(iov) = cbuf_to_iov(&proc.addrspace, buf, nbyte, dir) else {
            return Err(SosError::InvalidArgument);
        };
        proc.cont.fd = fd;
        proc.cont.client_addr = buf;
        proc.cont.length_arg = nbyte;
        proc.cont.iov = iov;
        Ok(())
    }

    fn proc_status_setup(&mut self, pid: Pid, message: &IpcMessage) -> Result<(), SosError> {
        let buf = message.mr(1);
        let max_records = message.mr(2);
        if buf == 0 || max_records == 0 {
            return Err(SosError::InvalidArgument);
        }
        let mut records = Vec::new();
        for other in self.procs.pids() {
            if records.len() == max_records {
                break;
            }
            let Some(proc) = self.procs.get(other) else {
                continue;
            };
            records.push(ProcStatus::new(
                proc.pid as u32,
                proc.addrspace.page_count() as u32,
                proc.stime_ms,
                proc.command.as_str(),
            ));
        }
        let mut bytes = Vec::with_capacity(records.len() * ProcStatus::PACKED_SIZE);
        bytes.resize(records.len() * ProcStatus::PACKED_SIZE, 0);
        for (i, record) in records.iter().enumerate() {
            record.pack(&mut bytes[i * ProcStatus::PACKED_SIZE..]);
        }
        let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
        let Some(iov) = cbuf_to_iov(&proc.addrspace, buf, bytes.len(), IoDirection::ToClient)
        else {
            return Err(SosError::InvalidArgument);
        };
        proc.cont.iov = iov;
        proc.cont.stat_records = records.len();
        proc.cont.stat_buf = bytes;
        proc.cont.stat_pos = 0;
        Ok(())
    }

    //  ---  Execute half  ---

    fn syscall_execute(&mut self, pid: Pid, number: SyscallNumber) -> Flow {
        match number {
            SyscallNumber::Brk => self.sys_brk(pid),
            SyscallNumber::Usleep => self.sys_usleep(pid),
            SyscallNumber::Timestamp => {
                let now = self.timer.timestamp_us();
                self.end_syscall64(pid, now);
                Ok(Step::Done(()))
            }
            SyscallNumber::GetPid => {
                self.end_syscall(pid, pid as Word, true);
                Ok(Step::Done(()))
            }
            SyscallNumber::Open => self.sys_open(pid),
            SyscallNumber::Read => self.sys_read(pid),
            SyscallNumber::Write => self.sys_write(pid),
            SyscallNumber::GetDirEnt => self.sys_getdirent(pid),
            SyscallNumber::Stat => self.sys_stat(pid),
            SyscallNumber::Close => self.sys_close(pid),
            SyscallNumber::ProcCreate => self.sys_proc_create(pid),
            SyscallNumber::WaitPid => self.sys_waitpid(pid),
            SyscallNumber::ProcDelete => self.sys_proc_delete(pid),
            SyscallNumber::ProcStatus => self.sys_proc_status(pid),
        }
    }

    fn sys_brk(&mut self, pid: Pid) -> Flow {
        let newbrk = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.brk_arg
        };
        let brk = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.addrspace.brk(newbrk)
        };
        if brk == 0 {
            return Err(SosError::FaultOutsideRegion);
        }
        self.end_syscall(pid, brk as Word, true);
        Ok(Step::Done(()))
    }

    fn sys_usleep(&mut self, pid: Pid) -> Flow {
        let delay_us = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.delay_us
        };
        if delay_us == 0 {
            self.end_syscall(pid, 0, true);
            return Ok(Step::Done(()));
        }
        let token = self.token(pid).ok_or(SosError::ProcessGone)?;
        self.timer.oneshot(delay_us, token)?;
        // The clock interrupt replies when the timeout fires.
        Ok(Step::Pending)
    }

    fn sys_open(&mut self, pid: Pid) -> Flow {
        let (fd, mode, dev, path) = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            let of = proc
                .fd_lookup(proc.cont.fd)
                .and_then(|id| self.pool.get(id))
                .ok_or(SosError::InvalidArgument)?;
            (proc.cont.fd, of.mode, of.dev, proc.cont.path.clone())
        };
        match dev {
            DeviceKind::Console => {
                if mode.contains(FileMode::READ) {
                    if self.console.reader.is_none() {
                        self.console.reader = Some(pid);
                    } else {
                        // Another process owns console input.
                        debug!("console reader busy");
                        if let Some(proc) = self.procs.get_mut(pid) {
                            proc.fd_free(&mut self.pool, fd);
                        }
                        return Err(SosError::Busy);
                    }
                }
                self.end_syscall(pid, fd as Word, true);
                Ok(Step::Done(()))
            }
            DeviceKind::Remote => {
                let token = self.token(pid).ok_or(SosError::ProcessGone)?;
                {
                    let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                    proc.cont.pending_op = Some(PendingOp::OpenLookup);
                }
                self.files
                    .lookup(path.as_str(), token)
                    .map_err(|_| SosError::RemoteIoFailure)?;
                Ok(Step::Pending)
            }
        }
    }

    fn sys_read(&mut self, pid: Pid) -> Flow {
        let (nbyte, dev, mode) = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            let of = proc
                .fd_lookup(proc.cont.fd)
                .and_then(|id| self.pool.get(id))
                .ok_or(SosError::InvalidArgument)?;
            (proc.cont.length_arg, of.dev, of.mode)
        };
        if nbyte == 0 {
            self.end_syscall(pid, 0, true);
            return Ok(Step::Done(()));
        }
        if !mode.contains(FileMode::READ) {
            return Err(SosError::PermissionDenied);
        }
        match dev {
            DeviceKind::Console => self.console_read(pid),
            DeviceKind::Remote => self.remote_read(pid),
        }
    }

    fn sys_write(&mut self, pid: Pid) -> Flow {
        let (dev, mode, nbyte) = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            let of = proc
                .fd_lookup(proc.cont.fd)
                .and_then(|id| self.pool.get(id))
                .ok_or(SosError::InvalidArgument)?;
            (of.dev, of.mode, proc.cont.length_arg)
        };
        if !mode.contains(FileMode::WRITE) {
            return Err(SosError::PermissionDenied);
        }
        if nbyte == 0 {
            self.end_syscall(pid, 0, true);
            return Ok(Step::Done(()));
        }
        match dev {
            DeviceKind::Console => self.console_write(pid),
            DeviceKind::Remote => self.remote_write(pid),
        }
    }

    /// Console read: fault in and pin every target page, then hand any
    /// buffered line to the reader. The reply comes from the interrupt
    /// path once a full line arrives.
    fn console_read(&mut self, pid: Pid) -> Flow {
        loop {
            let span = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                // position_arg doubles as the pin cursor here; GETDIRENT
                // is the only other user.
                let cursor = proc.cont.position_arg;
                if cursor >= proc.cont.iov.len() {
                    break;
                }
                proc.cont.iov[cursor]
            };
            ready!(self.ensure_loaded(pid, span.vstart)?);
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.addrspace.pin(span.vstart);
            proc.cont.position_arg += 1;
        }
        if !self.console.is_empty() {
            self.try_send_buffer();
        }
        let replied = self
            .procs
            .get(pid)
            .map(|p| p.cont.reply_cap.is_none())
            .unwrap_or(true);
        if replied {
            Ok(Step::Done(()))
        } else {
            Ok(Step::Pending)
        }
    }

    /// Console write is synchronous: stream each span to the serial
    /// device and reply with the byte count.
    fn console_write(&mut self, pid: Pid) -> Flow {
        loop {
            let span = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.iov.front().copied()
            };
            let Some(span) = span else {
                break;
            };
            ready!(self.ensure_loaded(pid, span.vstart)?);
            if span.len > 0 {
                let data = self
                    .read_span(pid, &span)
                    .ok_or(SosError::InvalidArgument)?;
                let sent = self.serial.send(&data);
                let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.counter += sent;
            }
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.iov.pop_front();
        }
        let sent = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.counter
        };
        self.end_syscall(pid, sent as Word, true);
        Ok(Step::Done(()))
    }

    /// Remote read moves one span per RPC; the completion advances the
    /// chain and requeues this handler for the next span.
    fn remote_read(&mut self, pid: Pid) -> Flow {
        let span = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.iov.front().copied()
        };
        let Some(span) = span else {
            let counter = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.counter
            };
            self.end_syscall(pid, counter as Word, true);
            return Ok(Step::Done(()));
        };
        ready!(self.ensure_loaded(pid, span.vstart)?);
        let (handle, offset) = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.addrspace.pin(span.vstart);
            proc.cont.pending_op = Some(PendingOp::FileRead);
            let of = proc
                .fd_lookup(proc.cont.fd)
                .and_then(|id| self.pool.get(id))
                .ok_or(SosError::InvalidArgument)?;
            (of.handle.ok_or(SosError::InvalidArgument)?, of.offset)
        };
        let token = self.token(pid).ok_or(SosError::ProcessGone)?;
        self.files
            .read(handle, offset, span.len, token)
            .map_err(|_| SosError::RemoteIoFailure)?;
        Ok(Step::Pending)
    }

    fn remote_write(&mut self, pid: Pid) -> Flow {
        let span = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.iov.front().copied()
        };
        let Some(span) = span else {
            let counter = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.counter
            };
            self.end_syscall(pid, counter as Word, true);
            return Ok(Step::Done(()));
        };
        ready!(self.ensure_loaded(pid, span.vstart)?);
        {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.addrspace.pin(span.vstart);
        }
        let data = self
            .read_span(pid, &span)
            .ok_or(SosError::InvalidArgument)?;
        let (handle, offset) = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.pending_op = Some(PendingOp::FileWrite);
            let of = proc
                .fd_lookup(proc.cont.fd)
                .and_then(|id| self.pool.get(id))
                .ok_or(SosError::InvalidArgument)?;
            (of.handle.ok_or(SosError::InvalidArgument)?, of.offset)
        };
        let token = self.token(pid).ok_or(SosError::ProcessGone)?;
        self.files
            .write(handle, offset, &data, token)
            .map_err(|_| SosError::RemoteIoFailure)?;
        Ok(Step::Pending)
    }

    fn sys_getdirent(&mut self, pid: Pid) -> Flow {
        let cookie = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.pending_op = Some(PendingOp::ReadDir);
            proc.cont.dirent_cookie
        };
        let token = self.token(pid).ok_or(SosError::ProcessGone)?;
        self.files
            .readdir(cookie, token)
            .map_err(|_| SosError::RemoteIoFailure)?;
        Ok(Step::Pending)
    }

    fn sys_stat(&mut self, pid: Pid) -> Flow {
        let path = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.pending_op = Some(PendingOp::StatLookup);
            proc.cont.path.clone()
        };
        let token = self.token(pid).ok_or(SosError::ProcessGone)?;
        self.files
            .lookup(path.as_str(), token)
            .map_err(|_| SosError::RemoteIoFailure)?;
        Ok(Step::Pending)
    }

    fn sys_close(&mut self, pid: Pid) -> Flow {
        let fd = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.fd
        };
        let released = {
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.fd_free(&mut self.pool, fd)
        };
        let Some(of) = released else {
            return Err(SosError::InvalidArgument);
        };
        if of.dev == DeviceKind::Console
            && of.mode.contains(FileMode::READ)
            && self.console.reader == Some(pid)
        {
            self.console.reader = None;
        }
        self.end_syscall(pid, 0, true);
        Ok(Step::Done(()))
    }

    fn sys_proc_create(&mut self, pid: Pid) -> Flow {
        let path = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.path.clone()
        };
        self.spawn_begin(Some(pid), path.as_str())?;
        // The reply carries the child pid once construction finishes.
        Ok(Step::Pending)
    }

    fn sys_waitpid(&mut self, pid: Pid) -> Flow {
        let target = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            if !matches!(proc.waiting, WaitTarget::None) {
                error!("pid {} is already waiting", pid);
                return Err(SosError::Busy);
            }
            proc.cont.pid_arg
        };
        if target == -1 {
            let others: Vec<Pid> = self
                .procs
                .pids()
                .into_iter()
                .filter(|&p| p != pid)
                .collect();
            for other in &others {
                if let Some(other_proc) = self.procs.get_mut(*other) {
                    other_proc.waiters.push(pid);
                }
            }
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.waiting = WaitTarget::Any;
            return Ok(Step::Pending);
        }
        let target = target as Pid;
        if !self.procs.contains(target) {
            // Already dead: nothing to wait for.
            self.end_syscall(pid, 0, true);
            return Ok(Step::Done(()));
        }
        if let Some(target_proc) = self.procs.get_mut(target) {
            target_proc.waiters.push(pid);
        }
        let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
        proc.waiting = WaitTarget::Pid(target);
        Ok(Step::Pending)
    }

    fn sys_proc_delete(&mut self, pid: Pid) -> Flow {
        let target = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.pid_arg as Pid
        };
        if !self.procs.contains(target) {
            return Err(SosError::InvalidArgument);
        }
        self.kill(target);
        if target != pid {
            self.end_syscall(pid, 0, true);
            Ok(Step::Done(()))
        } else {
            // Suicide: nobody left to reply to.
            Err(SosError::ProcessGone)
        }
    }

    fn sys_proc_status(&mut self, pid: Pid) -> Flow {
        loop {
            let span = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                proc.cont.iov.front().copied()
            };
            let Some(span) = span else {
                break;
            };
            ready!(self.ensure_loaded(pid, span.vstart)?);
            let chunk: Vec<u8> = {
                let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
                let pos = proc.cont.stat_pos;
                proc.cont.stat_buf[pos..pos + span.len].to_vec()
            };
            if !self.write_span(pid, &span, &chunk) {
                return Err(SosError::InvalidArgument);
            }
            let proc = self.procs.get_mut(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.stat_pos += span.len;
            proc.cont.iov.pop_front();
        }
        let records = {
            let proc = self.procs.get(pid).ok_or(SosError::ProcessGone)?;
            proc.cont.stat_records
        };
        self.end_syscall(pid, records as Word, true);
        Ok(Step::Done(()))
    }

    //  ---  Remote-FS completions  ---

    pub(crate) fn on_open_lookup(
        &mut self,
        pid: Pid,
        result: Result<(FileHandle, FileAttr), FileError>,
    ) {
        let (fd, mode, path) = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
            (proc.cont.fd, proc.cont.file_mode, proc.cont.path.clone())
        };
        match result {
            Ok((handle, _attr)) => {
                self.attach_handle(pid, fd, handle);
                self.end_syscall(pid, fd as Word, true);
            }
            Err(FileError::NotFound) if mode.contains(FileMode::WRITE) => {
                // Create on open-for-write of a missing file.
                let token = match self.token(pid) {
                    Some(t) => t,
                    None => return,
                };
                {
                    let Some(proc) = self.procs.get_mut(pid) else {
                        return;
                    };
                    proc.cont.pending_op = Some(PendingOp::OpenCreate);
                }
                if self.files.create(path.as_str(), token).is_err() {
                    self.release_fd(pid, fd);
                    self.end_syscall(pid, SosError::RemoteIoFailure.errno(), false);
                }
            }
            Err(e) => {
                self.release_fd(pid, fd);
                self.end_syscall(pid, SosError::from(e).errno(), false);
            }
        }
    }

    pub(crate) fn on_open_create(&mut self, pid: Pid, result: Result<FileHandle, FileError>) {
        let fd = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
            proc.cont.fd
        };
        match result {
            Ok(handle) => {
                self.attach_handle(pid, fd, handle);
                self.end_syscall(pid, fd as Word, true);
            }
            Err(e) => {
                self.release_fd(pid, fd);
                self.end_syscall(pid, SosError::from(e).errno(), false);
            }
        }
    }

    fn attach_handle(&mut self, pid: Pid, fd: usize, handle: FileHandle) {
        let Some(of) = self
            .procs
            .get(pid)
            .and_then(|p| p.fd_lookup(fd))
            .and_then(|id| self.pool.get_mut(id))
        else {
            error!("open completion for dead fd {}", fd);
            return;
        };
        of.handle = Some(handle);
    }

    fn release_fd(&mut self, pid: Pid, fd: usize) {
        if let Some(proc) = self.procs.get_mut(pid) {
            proc.fd_free(&mut self.pool, fd);
        }
    }

    pub(crate) fn on_file_read(&mut self, pid: Pid, result: Result<Vec<u8>, FileError>) {
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
        }
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                error!("remote read failed: {:?}", e);
                self.end_syscall(pid, SosError::from(e).errno(), false);
                return;
            }
        };
        let (span, counter) = {
            let Some(proc) = self.procs.get(pid) else {
                return;
            };
            (proc.cont.iov.front().copied(), proc.cont.counter)
        };
        if data.is_empty() {
            // End of file.
            self.end_syscall(pid, counter as Word, true);
            return;
        }
        let Some(span) = span else {
            self.end_syscall(pid, counter as Word, true);
            return;
        };
        let n = data.len().min(span.len);
        if !self.write_span(pid, &span, &data[..n]) {
            error!("read target page at {:#x} vanished", span.vstart);
            self.end_syscall(pid, SosError::InvalidArgument.errno(), false);
            return;
        }
        let finished = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.counter += n;
            if let Some(of) = proc
                .fd_lookup(proc.cont.fd)
                .and_then(|id| self.pool.get_mut(id))
            {
                of.offset += n as u64;
            }
            if let Some(front) = proc.cont.iov.front_mut() {
                if n == front.len {
                    proc.cont.iov.pop_front();
                    proc.addrspace.unpin(span.vstart);
                } else {
                    front.vstart += n;
                    front.len -= n;
                }
            }
            proc.cont.iov.is_empty()
        };
        if finished {
            let counter = self
                .procs
                .get(pid)
                .map(|p| p.cont.counter)
                .unwrap_or(0);
            self.end_syscall(pid, counter as Word, true);
        } else {
            // Execute re-entry pushes the next span.
            self.add_ready(pid);
        }
    }

    pub(crate) fn on_file_write(&mut self, pid: Pid, result: Result<usize, FileError>) {
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
        }
        let count = match result {
            Ok(count) => count,
            Err(e) => {
                error!("remote write failed: {:?}", e);
                self.end_syscall(pid, SosError::from(e).errno(), false);
                return;
            }
        };
        let finished = {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.counter += count;
            if let Some(of) = proc
                .fd_lookup(proc.cont.fd)
                .and_then(|id| self.pool.get_mut(id))
            {
                of.offset += count as u64;
            }
            if let Some(front) = proc.cont.iov.front_mut() {
                let vstart = front.vstart;
                if count >= front.len {
                    proc.cont.iov.pop_front();
                    proc.addrspace.unpin(vstart);
                } else {
                    front.vstart += count;
                    front.len -= count;
                }
            }
            proc.cont.iov.is_empty()
        };
        if finished {
            let counter = self
                .procs
                .get(pid)
                .map(|p| p.cont.counter)
                .unwrap_or(0);
            self.end_syscall(pid, counter as Word, true);
        } else {
            self.add_ready(pid);
        }
    }

    pub(crate) fn on_stat_lookup(
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
        match result {
            Ok((handle, _attr)) => {
                let token = match self.token(pid) {
                    Some(t) => t,
                    None => return,
                };
                {
                    let Some(proc) = self.procs.get_mut(pid) else {
                        return;
                    };
                    proc.cont.pending_op = Some(PendingOp::StatAttr);
                }
                if self.files.getattr(handle, token).is_err() {
                    self.end_syscall(pid, SosError::RemoteIoFailure.errno(), false);
                }
            }
            Err(e) => {
                self.end_syscall(pid, SosError::from(e).errno(), false);
            }
        }
    }

    pub(crate) fn on_stat_attr(&mut self, pid: Pid, result: Result<FileAttr, FileError>) {
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
        }
        let attr = match result {
            Ok(attr) => attr,
            Err(e) => {
                self.end_syscall(pid, SosError::from(e).errno(), false);
                return;
            }
        };
        let stat = FileStat {
            st_type: match attr.kind {
                FileKind::Special => 0,
                FileKind::Regular => 1,
            },
            st_fmode: attr.mode,
            st_size: attr.size as u32,
            st_ctime: attr.ctime_s,
            st_atime: attr.atime_s,
        };
        let mut bytes = [0u8; FileStat::PACKED_SIZE];
        stat.pack(&mut bytes);
        let mut words = [0 as Word; 1 + FileStat::PACKED_SIZE / 4];
        let nwords = msg::write_bin(&mut words, 0, &bytes);
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.reply_payload.extend_from_slice(&words[..nwords]);
        }
        self.end_syscall(pid, 0, true);
    }

    pub(crate) fn on_readdir(
        &mut self,
        pid: Pid,
        result: Result<(Vec<alloc::string::String>, u64), FileError>,
    ) {
        {
            let Some(proc) = self.procs.get_mut(pid) else {
                return;
            };
            proc.cont.pending_op = None;
        }
        let (names, cookie) = match result {
            Ok(v) => v,
            Err(e) => {
                self.end_syscall(pid, SosError::from(e).errno(), false);
                return;
            }
        };
        let (position, counter, length_arg) = {
            let Some(proc) = self.procs.get(pid) else {
                return;
            };
            (
                proc.cont.position_arg,
                proc.cont.counter,
                proc.cont.length_arg,
            )
        };
        if position <= counter + names.len() {
            // The requested entry (1-based) is in this batch.
            let name = &names[position - counter - 1];
            let mut data: Vec<u8> = name.as_bytes().to_vec();
            data.push(0);
            data.truncate(length_arg.min(sos_interface::MAX_FILE_PATH_LENGTH));
            let mut words = [0 as Word; 68];
            let nwords = msg::write_bin(&mut words, 0, &data);
            {
                let Some(proc) = self.procs.get_mut(pid) else {
                    return;
                };
                proc.cont.reply_payload.extend_from_slice(&words[..nwords]);
            }
            self.end_syscall(pid, (name.len() + 1) as Word, true);
            return;
        }
        if cookie == 0 {
            // Past the last entry.
            {
                let Some(proc) = self.procs.get_mut(pid) else {
                    return;
                };
                proc.cont.reply_payload.push(0);
            }
            self.end_syscall(pid, 0, true);
            return;
        }
        // Keep walking the directory from the new cookie.
        let Some(proc) = self.procs.get_mut(pid) else {
            return;
        };
        proc.cont.counter = counter + names.len();
        proc.cont.dirent_cookie = cookie;
        self.add_ready(pid);
    }
}
